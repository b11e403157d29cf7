mod common;
use common::*;

use ampinvt_bridge::command::{Command, CommandRequest};
use ampinvt_bridge::device::HealthState;

use std::time::Duration;

fn single_code(address: u8, result_topic: Option<&str>) -> CommandRequest {
    CommandRequest {
        command: Command::SingleCode {
            address,
            code: 0x05,
        },
        result_topic: result_topic.map(|t| t.to_string()),
    }
}

#[tokio::test(start_paused = true)]
async fn bus_is_never_reentered() {
    let bus = FakeBus::new(Reply::Ok);
    let mut rig = rig(test_config(&[1, 2, 3], ""), bus.clone());

    // inject commands while the poll sweep is running; they are picked up
    // between devices, never concurrently with a poll exchange
    let sender = rig.channels.to_coordinator.clone();
    let feeder = tokio::spawn(async move {
        for _ in 0..5 {
            let _ = sender.send(single_code(2, None)).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    });

    rig.coordinator.run_cycle().await;
    feeder.await.unwrap();
    rig.coordinator.run_cycle().await;

    assert_eq!(bus.violations(), 0);
    // 3 polls per cycle plus 5 commands plus their verification reads
    assert!(bus.exchange_count() >= 11, "got {}", bus.exchange_count());
}

#[tokio::test(start_paused = true)]
async fn malformed_response_updates_no_telemetry() {
    let bus = FakeBus::new(Reply::Corrupt);
    let mut rig = rig(test_config(&[1], ""), bus.clone());

    rig.coordinator.run_cycle().await;

    let messages = drain_messages(&mut rig.mqtt_rx);
    assert!(
        messages.iter().all(|m| !m.topic.contains("state")),
        "corrupt frame must not publish telemetry: {:?}",
        messages
    );

    let device = rig.coordinator.device(1).unwrap();
    assert_eq!(device.failures(), 1);
}

#[tokio::test(start_paused = true)]
async fn isolated_devices_get_no_bus_time() {
    let backoff = r#"backoff:
  cooling_threshold: 2
  cooling_secs: 3600
  penalty_threshold: 10
  penalty_secs: 7200
"#;
    let bus = FakeBus::new(Reply::Timeout);
    let mut rig = rig(test_config(&[1], backoff), bus.clone());

    rig.coordinator.run_cycle().await;
    rig.coordinator.run_cycle().await;
    assert_eq!(bus.exchange_count(), 2);
    assert_eq!(rig.coordinator.device(1).unwrap().state(), HealthState::Cooling);

    // deadline is an hour away; further cycles spend nothing on the device
    rig.coordinator.run_cycle().await;
    rig.coordinator.run_cycle().await;
    assert_eq!(bus.exchange_count(), 2);
}

#[tokio::test(start_paused = true)]
async fn penalized_device_goes_offline_then_comes_back() {
    let backoff = r#"backoff:
  cooling_threshold: 1
  cooling_secs: 0
  penalty_threshold: 2
  penalty_secs: 3600
"#;
    let bus = FakeBus::new(Reply::Timeout);
    let mut rig = rig(test_config(&[1], backoff), bus.clone());

    rig.coordinator.run_cycle().await; // -> cooling, zero-length window
    rig.coordinator.run_cycle().await; // -> penalized
    assert_eq!(
        rig.coordinator.device(1).unwrap().state(),
        HealthState::Penalized
    );

    let messages = drain_messages(&mut rig.mqtt_rx);
    let availability: Vec<&str> = messages
        .iter()
        .filter(|m| m.topic == "1/availability")
        .map(|m| m.payload.as_str())
        .collect();
    assert_eq!(availability, vec!["offline"]);

    // a successful write ack is a successful exchange: counter resets,
    // device returns to Active, and recovery is announced
    bus.push(Reply::Ok); // the write ack
    bus.push(Reply::Ok); // the verification read
    bus.push(Reply::Ok); // the regular poll later in the same cycle
    rig.channels
        .to_coordinator
        .send(single_code(1, None))
        .await
        .unwrap();
    rig.coordinator.run_cycle().await;

    let device = rig.coordinator.device(1).unwrap();
    assert_eq!(device.state(), HealthState::Active);
    assert_eq!(device.failures(), 0);

    let messages = drain_messages(&mut rig.mqtt_rx);
    assert!(messages
        .iter()
        .any(|m| m.topic == "1/availability" && m.payload == "online"));
}

#[tokio::test(start_paused = true)]
async fn watchdog_terminates_after_consecutive_dead_cycles() {
    let extra = r#"max_failed_cycles: 3
backoff:
  cooling_threshold: 100
  cooling_secs: 1
  penalty_threshold: 200
  penalty_secs: 2
"#;
    let bus = FakeBus::new(Reply::Timeout);
    let mut rig = rig(test_config(&[1], extra), bus.clone());

    let err = rig.coordinator.start().await.unwrap_err();
    assert!(
        err.to_string().contains("3 consecutive cycles"),
        "unexpected error: {}",
        err
    );
    assert_eq!(bus.exchange_count(), 3);

    // final state is broadcast as offline for every device
    let messages = drain_messages(&mut rig.mqtt_rx);
    assert!(messages
        .iter()
        .any(|m| m.topic == "1/availability" && m.payload == "offline"));
}

#[tokio::test(start_paused = true)]
async fn watchdog_counter_resets_on_any_success() {
    let extra = "max_failed_cycles: 2\n";
    let bus = FakeBus::new(Reply::Timeout);
    let mut rig = rig(test_config(&[1], extra), bus.clone());

    rig.coordinator.run_cycle().await; // fail
    bus.push(Reply::Ok);
    let successes = rig.coordinator.run_cycle().await;
    assert_eq!(successes, 1);
}

#[tokio::test(start_paused = true)]
async fn failed_write_retries_once_then_reports() {
    let bus = FakeBus::new(Reply::Ok);
    bus.push(Reply::Timeout); // first write attempt
    bus.push(Reply::Ok); // retry ack
    bus.push(Reply::Ok); // verification read

    let mut rig = rig(test_config(&[1], ""), bus.clone());
    rig.channels
        .to_coordinator
        .send(single_code(1, Some("result/1/press/alarm_mute")))
        .await
        .unwrap();

    rig.coordinator.run_cycle().await;

    let messages = drain_messages(&mut rig.mqtt_rx);
    let result = messages
        .iter()
        .find(|m| m.topic == "result/1/press/alarm_mute")
        .expect("result published");
    assert_eq!(result.payload, "OK");

    // write, retry, verification read, then the regular poll
    assert_eq!(bus.exchange_count(), 4);
    // the verification read refreshed telemetry ahead of the poll tick
    assert!(messages.iter().any(|m| m.topic == "1/state"));
}

#[tokio::test(start_paused = true)]
async fn write_failure_is_reported_but_not_held_against_the_device() {
    let bus = FakeBus::new(Reply::Ok);
    bus.push(Reply::Timeout); // first write attempt
    bus.push(Reply::Timeout); // retry also fails

    let mut rig = rig(test_config(&[1], ""), bus.clone());
    rig.channels
        .to_coordinator
        .send(single_code(1, Some("result/1/press/alarm_mute")))
        .await
        .unwrap();

    rig.coordinator.run_cycle().await;

    let messages = drain_messages(&mut rig.mqtt_rx);
    let result = messages
        .iter()
        .find(|m| m.topic == "result/1/press/alarm_mute")
        .expect("result published");
    assert_eq!(result.payload, "FAIL");

    // the subsequent poll succeeded, so failures stayed at zero - and the
    // write failures never fed the backoff counter at all
    assert_eq!(rig.coordinator.device(1).unwrap().failures(), 0);
}

#[tokio::test(start_paused = true)]
async fn time_sync_does_not_retry() {
    let bus = FakeBus::new(Reply::Ok);
    bus.push(Reply::Timeout);

    let mut rig = rig(test_config(&[1], ""), bus.clone());
    rig.channels
        .to_coordinator
        .send(CommandRequest {
            command: Command::TimeSync { address: 1 },
            result_topic: Some("result/1/sync_time".to_string()),
        })
        .await
        .unwrap();

    rig.coordinator.run_cycle().await;

    let sync_frames = bus
        .requests()
        .iter()
        .filter(|r| r[1] == 0xDF)
        .count();
    assert_eq!(sync_frames, 1, "time sync must not be retried");

    let messages = drain_messages(&mut rig.mqtt_rx);
    assert!(messages
        .iter()
        .any(|m| m.topic == "result/1/sync_time" && m.payload == "FAIL"));
}

#[tokio::test(start_paused = true)]
async fn command_to_unconfigured_address_discovers_the_device() {
    let bus = FakeBus::new(Reply::Ok);
    let mut rig = rig(test_config(&[1], ""), bus.clone());

    rig.channels
        .to_coordinator
        .send(single_code(9, None))
        .await
        .unwrap();
    rig.coordinator.run_cycle().await;

    let device = rig.coordinator.device(9).expect("device 9 discovered");
    assert!(!device.configured);
    // it joins the rotation: the next cycle polls both 1 and 9
    let before = bus.exchange_count();
    rig.coordinator.run_cycle().await;
    assert_eq!(bus.exchange_count(), before + 2);
}

#[tokio::test(start_paused = true)]
async fn identity_is_discovered_from_first_valid_frame() {
    let bus = FakeBus::new(Reply::Ok);
    let mut rig = rig(test_config(&[1], ""), bus.clone());

    rig.coordinator.run_cycle().await;

    let identity = rig
        .coordinator
        .device(1)
        .unwrap()
        .identity
        .expect("identity populated");
    assert_eq!(identity.battery_type, 3);
    assert_eq!(identity.battery_count, 4);
    assert!((identity.hw_max_charge_current - 60.0).abs() < f64::EPSILON);
}

#[tokio::test(start_paused = true)]
async fn successful_poll_publishes_state_and_status_bits() {
    let bus = FakeBus::new(Reply::Ok);
    let mut rig = rig(test_config(&[1], ""), bus.clone());

    rig.coordinator.run_cycle().await;

    let messages = drain_messages(&mut rig.mqtt_rx);
    let state = messages.iter().find(|m| m.topic == "1/state").unwrap();
    let bits = messages.iter().find(|m| m.topic == "1/status_bits").unwrap();

    let state: serde_json::Value = serde_json::from_str(&state.payload).unwrap();
    assert_eq!(state["battery_voltage"], serde_json::json!(14.0));
    assert_eq!(state["charge_power"], serde_json::json!(35.0));

    let bits: serde_json::Value = serde_json::from_str(&bits.payload).unwrap();
    assert_eq!(bits["charging"], serde_json::json!(true));

    // first contact announces reachability
    assert!(messages
        .iter()
        .any(|m| m.topic == "1/availability" && m.payload == "online"));
}

#![allow(dead_code)]

use ampinvt_bridge::ampinvt::packet::{checksum, ACK_FRAME_LEN, TELEMETRY_FRAME_LEN};
use ampinvt_bridge::ampinvt::transport::BusTransport;
use ampinvt_bridge::config::{Config, ConfigWrapper};
use ampinvt_bridge::coordinator::Coordinator;
use ampinvt_bridge::error::TransportError;
use ampinvt_bridge::prelude::*;
use ampinvt_bridge::register_map::RegisterMap;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub fn put_u16(frame: &mut [u8], offset: usize, value: u16) {
    frame[offset..offset + 2].copy_from_slice(&value.to_be_bytes());
}

pub fn put_u32(frame: &mut [u8], offset: usize, value: u32) {
    frame[offset..offset + 4].copy_from_slice(&value.to_be_bytes());
}

/// A plausible 93-byte status block: lithium pack, 4 cells, 14.0V battery,
/// 2.5A charge current, checksum correct.
pub fn telemetry_frame(address: u8) -> Vec<u8> {
    let mut frame = vec![0u8; TELEMETRY_FRAME_LEN];
    frame[0] = address;
    frame[1] = 0xB1;
    frame[3] = 0b0000_0001; // running
    frame[4] = 0b0000_0101; // charging + tracking
    frame[5] = 0b0000_0010; // load output
    frame[8] = 3; // lithium
    frame[10] = 4; // cells in series
    put_u16(&mut frame, 16, 1280); // rated 12.8V
    put_u16(&mut frame, 18, 1460); // equalize 14.6V
    put_u16(&mut frame, 20, 1380); // float 13.8V
    put_u16(&mut frame, 22, 1050); // discharge limit 10.5V
    put_u16(&mut frame, 24, 6000); // hardware limit 60A
    put_u16(&mut frame, 26, 3000); // set limit 30A
    put_u16(&mut frame, 30, 185); // pv 18.5V
    put_u16(&mut frame, 32, 1400); // battery 14.0V
    put_u16(&mut frame, 34, 250); // charge 2.5A
    put_u16(&mut frame, 36, 215); // internal 21.5C
    put_u16(&mut frame, 40, 1980); // external 19.8C
    put_u32(&mut frame, 44, 1234); // today yield
    put_u32(&mut frame, 48, 987_654); // total yield
    frame[TELEMETRY_FRAME_LEN - 1] = checksum(&frame[..TELEMETRY_FRAME_LEN - 1]);
    frame
}

pub fn ack_frame(address: u8) -> Vec<u8> {
    let mut frame = vec![address, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
    frame.push(checksum(&frame));
    assert_eq!(frame.len(), ACK_FRAME_LEN);
    frame
}

#[derive(Clone, Copy, Debug)]
pub enum Reply {
    /// Valid frame of whatever length was requested.
    Ok,
    /// Right length, corrupted trailing checksum byte.
    Corrupt,
    /// Transport-level read timeout.
    Timeout,
}

/// Bus double: answers from a script (falling back to a default), records
/// every request, and counts reentrant entries - the coordinator must never
/// let two exchanges overlap.
#[derive(Clone)]
pub struct FakeBus {
    default_reply: Reply,
    script: Arc<Mutex<VecDeque<Reply>>>,
    requests: Arc<Mutex<Vec<Vec<u8>>>>,
    busy: Arc<AtomicBool>,
    violations: Arc<AtomicUsize>,
}

impl FakeBus {
    pub fn new(default_reply: Reply) -> Self {
        Self {
            default_reply,
            script: Arc::new(Mutex::new(VecDeque::new())),
            requests: Arc::new(Mutex::new(Vec::new())),
            busy: Arc::new(AtomicBool::new(false)),
            violations: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn push(&self, reply: Reply) {
        self.script.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<Vec<u8>> {
        self.requests.lock().unwrap().clone()
    }

    pub fn exchange_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn violations(&self) -> usize {
        self.violations.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BusTransport for FakeBus {
    async fn exchange(
        &mut self,
        request: &[u8],
        reply_len: usize,
    ) -> Result<Vec<u8>, TransportError> {
        if self.busy.swap(true, Ordering::SeqCst) {
            self.violations.fetch_add(1, Ordering::SeqCst);
        }
        self.requests.lock().unwrap().push(request.to_vec());

        // hold the bus across an await point so overlap would be caught
        tokio::task::yield_now().await;

        let reply = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(self.default_reply);
        let address = request[0];

        let outcome = match reply {
            Reply::Ok | Reply::Corrupt => {
                let mut frame = if reply_len == TELEMETRY_FRAME_LEN {
                    telemetry_frame(address)
                } else {
                    ack_frame(address)
                };
                if matches!(reply, Reply::Corrupt) {
                    let last = frame.len() - 1;
                    frame[last] ^= 0xFF;
                }
                Ok(frame)
            }
            Reply::Timeout => Err(TransportError::ReadTimeout {
                want: reply_len,
                got: 0,
            }),
        };

        self.busy.store(false, Ordering::SeqCst);
        outcome
    }

    fn disconnect(&mut self) {}
}

/// Minimal valid configuration; `extra` appends further top-level YAML keys
/// (backoff, max_failed_cycles, ...).
pub fn test_config(devices: &[u8], extra: &str) -> Config {
    let yaml = format!(
        r#"
gateway:
  host: 127.0.0.1
  port: 8899
devices: {:?}
device_delay_ms: 0
write_settle_ms: 0
write_retry_settle_ms: 0
mqtt:
  enabled: false
  host: localhost
{}
"#,
        devices, extra
    );
    serde_yaml::from_str(&yaml).expect("test config parses")
}

pub struct TestRig {
    pub coordinator: Coordinator,
    pub channels: Channels,
    pub mqtt_rx: broadcast::Receiver<mqtt::ChannelData>,
}

pub fn rig(config: Config, bus: FakeBus) -> TestRig {
    let config = ConfigWrapper::from_config(config);
    let (channels, command_rx) = Channels::new();
    let mqtt_rx = channels.to_mqtt.subscribe();
    let register_map = Arc::new(RegisterMap::builtin());

    let coordinator = Coordinator::with_transport(
        config,
        channels.clone(),
        command_rx,
        register_map,
        Box::new(bus),
    );

    TestRig {
        coordinator,
        channels,
        mqtt_rx,
    }
}

pub fn drain_messages(rx: &mut broadcast::Receiver<mqtt::ChannelData>) -> Vec<mqtt::Message> {
    let mut out = Vec::new();
    while let Ok(data) = rx.try_recv() {
        if let mqtt::ChannelData::Message(message) = data {
            out.push(message);
        }
    }
    out
}

use crate::prelude::*;

use crate::ampinvt::packet::{
    self, PacketCommon, Packet, ParamWrite, ReadTelemetry, SingleCode, TimeSync,
};
use crate::ampinvt::transport::{BusTransport, Gateway};
use crate::device::{BackoffPolicy, Device, HealthEvent, HealthState, Identity};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

// When a cycle overruns its interval we start the next one immediately, but
// never without yielding the CPU first.
const OVERRUN_YIELD: Duration = Duration::from_secs(1);

#[derive(Default)]
pub struct BusStats {
    reads_ok: u64,
    reads_failed: u64,
    frames_rejected: u64,
    writes_ok: u64,
    writes_failed: u64,
}

impl BusStats {
    pub fn print_summary(&self) {
        info!("Bus statistics:");
        info!("  Reads OK: {}", self.reads_ok);
        info!("  Reads failed: {}", self.reads_failed);
        info!("  Frames rejected: {}", self.frames_rejected);
        info!("  Writes OK: {}", self.writes_ok);
        info!("  Writes failed: {}", self.writes_failed);
    }
}

/// The single authority over the bus. Owns the transport behind one mutex,
/// interleaves periodic polls with queued write commands, tracks per-device
/// health, and terminates the process when the whole link looks dead.
pub struct Coordinator {
    config: ConfigWrapper,
    channels: Channels,
    bus: Arc<Mutex<Box<dyn BusTransport>>>,
    commands: mpsc::Receiver<CommandRequest>,
    shutdown_rx: broadcast::Receiver<()>,
    devices: BTreeMap<u8, Device>,
    register_map: Arc<RegisterMap>,
    backoff: BackoffPolicy,
    failed_cycles: u32,
    shutting_down: bool,
    stats: BusStats,
}

impl Coordinator {
    pub fn new(
        config: ConfigWrapper,
        channels: Channels,
        commands: mpsc::Receiver<CommandRequest>,
        register_map: Arc<RegisterMap>,
    ) -> Self {
        let gateway = Gateway::from_config(&config.gateway());
        Self::with_transport(config, channels, commands, register_map, Box::new(gateway))
    }

    pub fn with_transport(
        config: ConfigWrapper,
        channels: Channels,
        commands: mpsc::Receiver<CommandRequest>,
        register_map: Arc<RegisterMap>,
        bus: Box<dyn BusTransport>,
    ) -> Self {
        let devices = config
            .devices()
            .into_iter()
            .map(|address| (address, Device::new(address, true)))
            .collect();
        let backoff = BackoffPolicy::from(&config.backoff());
        let shutdown_rx = channels.shutdown.subscribe();

        Self {
            config,
            channels,
            bus: Arc::new(Mutex::new(bus)),
            commands,
            shutdown_rx,
            devices,
            register_map,
            backoff,
            failed_cycles: 0,
            shutting_down: false,
            stats: BusStats::default(),
        }
    }

    pub fn device(&self, address: u8) -> Option<&Device> {
        self.devices.get(&address)
    }

    pub async fn start(&mut self) -> Result<()> {
        info!(
            "coordinator starting: polling {} devices every {:?}",
            self.devices.len(),
            self.config.poll_interval()
        );

        loop {
            let started = Instant::now();
            let successes = self.run_cycle().await;
            if self.shutting_down {
                break;
            }

            if successes == 0 {
                self.failed_cycles += 1;
                warn!(
                    "cycle finished with no successful exchanges ({}/{})",
                    self.failed_cycles,
                    self.config.max_failed_cycles()
                );
                if self.failed_cycles >= self.config.max_failed_cycles() {
                    self.publish_availability_all("offline");
                    self.stats.print_summary();
                    bail!(
                        "no successful exchanges in {} consecutive cycles - link presumed dead",
                        self.config.max_failed_cycles()
                    );
                }
            } else {
                self.failed_cycles = 0;
            }

            self.pace(started).await;
            if self.shutting_down {
                break;
            }
        }

        info!("coordinator shutting down");
        self.publish_availability_all("offline");
        self.stats.print_summary();
        Ok(())
    }

    /// One full sweep: queued commands first, then every eligible device.
    /// Returns the number of successful exchanges (telemetry reads and
    /// acknowledged writes).
    pub async fn run_cycle(&mut self) -> usize {
        let mut successes = 0;

        successes += self.drain_commands().await;

        let addresses: Vec<u8> = self.devices.keys().copied().collect();
        for (i, address) in addresses.iter().copied().enumerate() {
            if self.shutdown_requested() {
                return successes;
            }

            // commands that arrived mid-sweep jump ahead of the next device,
            // bounding their latency to roughly one device's read time
            if i > 0 {
                successes += self.drain_commands().await;
            }

            match self.devices.get(&address) {
                Some(device) if device.is_eligible(Instant::now()) => {}
                _ => continue, // isolated: no bus time spent
            }

            if self.poll_device(address).await {
                successes += 1;
            }

            if i + 1 < addresses.len() {
                tokio::time::sleep(self.config.device_delay()).await;
            }
        }

        successes
    }

    async fn pace(&mut self, started: Instant) {
        let interval = self.config.poll_interval();
        let elapsed = started.elapsed();

        let wait = if elapsed < interval {
            interval - elapsed
        } else {
            warn!(
                "poll cycle took {:.2?}, exceeding the {:?} interval",
                elapsed, interval
            );
            OVERRUN_YIELD
        };

        let shutdown = tokio::select! {
            _ = self.shutdown_rx.recv() => true,
            _ = tokio::time::sleep(wait) => false,
        };
        if shutdown {
            self.shutting_down = true;
        }
    }

    fn shutdown_requested(&mut self) -> bool {
        use tokio::sync::broadcast::error::TryRecvError;

        if !self.shutting_down
            && matches!(self.shutdown_rx.try_recv(), Ok(()) | Err(TryRecvError::Lagged(_)))
        {
            self.shutting_down = true;
        }
        self.shutting_down
    }

    async fn drain_commands(&mut self) -> usize {
        let mut successes = 0;

        loop {
            if self.shutdown_requested() {
                break; // stop accepting; queued commands are dropped
            }
            match self.commands.try_recv() {
                Ok(request) => {
                    if self.process_command(request).await {
                        successes += 1;
                    }
                }
                Err(_) => break,
            }
        }

        successes
    }

    async fn process_command(&mut self, request: CommandRequest) -> bool {
        let command = request.command;
        let address = command.address();

        self.devices.entry(address).or_insert_with(|| {
            info!("device {} not configured, adding to rotation", address);
            Device::new(address, false)
        });

        let packet = Self::packet_for(&command);
        debug!("device {}: executing {:?}", address, command);

        let mut ok = self.write_once(&packet, self.config.write_settle()).await;
        if !ok && command.retries_once() {
            debug!("device {}: no valid ack, retrying once", address);
            ok = self
                .write_once(&packet, self.config.write_retry_settle())
                .await;
        }

        if ok {
            self.stats.writes_ok += 1;
            self.note_success(address);
            if command.verify_after_write() {
                // refresh telemetry now so observers see the new value
                // without waiting for the next poll tick
                self.poll_device(address).await;
            }
        } else {
            self.stats.writes_failed += 1;
            // a transient write collision is not evidence the device is
            // unreachable; backoff is driven by polls only
            warn!("device {}: {:?} failed after retries", address, command);
        }

        if let Some(topic) = request.result_topic {
            self.publish(topic, if ok { "OK" } else { "FAIL" }.to_string(), false);
        }

        ok
    }

    fn packet_for(command: &Command) -> Packet {
        match command {
            Command::SingleCode { address, code } => Packet::SingleCode(SingleCode {
                address: *address,
                code: *code,
            }),
            Command::WriteParam {
                address,
                code,
                value,
                scale,
                width,
            } => Packet::ParamWrite(ParamWrite {
                address: *address,
                code: *code,
                value: *value,
                scale: *scale,
                width: *width,
            }),
            Command::TimeSync { address } => {
                Packet::TimeSync(TimeSync::for_datetime(*address, &chrono::Local::now()))
            }
        }
    }

    async fn write_once(&mut self, packet: &Packet, settle: Duration) -> bool {
        let mut bus = self.bus.lock().await;

        // hold the bus through the settle delay so a trailing read on the
        // same wire has died down before we transmit
        tokio::time::sleep(settle).await;

        match bus.exchange(&packet.bytes(), packet.reply_len()).await {
            Ok(raw) => match packet::validate_response(&raw, packet.reply_len()) {
                Ok(_) => true,
                Err(e) => {
                    debug!("write ack rejected: {}", e);
                    false
                }
            },
            Err(e) => {
                debug!("write failed: {}", e);
                false
            }
        }
    }

    async fn poll_device(&mut self, address: u8) -> bool {
        let request = Packet::ReadTelemetry(ReadTelemetry { address });

        let outcome = {
            let mut bus = self.bus.lock().await;
            bus.exchange(&request.bytes(), request.reply_len()).await
        };

        match outcome {
            Ok(raw) => match packet::validate_response(&raw, packet::TELEMETRY_FRAME_LEN) {
                Ok(_) => {
                    self.stats.reads_ok += 1;
                    self.handle_telemetry(address, &raw);
                    true
                }
                Err(e) => {
                    self.stats.frames_rejected += 1;
                    debug!("device {}: discarding response: {}", address, e);
                    self.note_failure(address);
                    false
                }
            },
            Err(e) => {
                self.stats.reads_failed += 1;
                debug!("device {}: read failed: {}", address, e);
                self.note_failure(address);
                false
            }
        }
    }

    fn handle_telemetry(&mut self, address: u8, frame: &[u8]) {
        self.note_success(address);

        let discovered = match self.devices.get_mut(&address) {
            Some(device) if device.identity.is_none() => match Identity::from_frame(frame) {
                Some(identity) => {
                    device.discover(identity);
                    Some(identity)
                }
                None => None,
            },
            _ => None,
        };
        if let Some(identity) = discovered {
            info!(
                "device {}: battery type {}, {} cells in series, hardware limit {:.1}A",
                address, identity.battery_type, identity.battery_count, identity.hw_max_charge_current
            );
        }

        let state = self.register_map.decode(frame);
        let bits = self.register_map.decode_bits(frame);

        match serde_json::to_string(&state) {
            Ok(payload) => self.publish(format!("{}/state", address), payload, false),
            Err(e) => error!("device {}: failed to serialize state: {}", address, e),
        }
        match serde_json::to_string(&bits) {
            Ok(payload) => self.publish(format!("{}/status_bits", address), payload, false),
            Err(e) => error!("device {}: failed to serialize status bits: {}", address, e),
        }
    }

    fn note_success(&mut self, address: u8) {
        let event = match self.devices.get_mut(&address) {
            Some(device) => device.record_success(),
            None => return,
        };

        if event == Some(HealthEvent::BackOnline) {
            info!("device {} is reachable", address);
            self.publish_availability(address, "online");
        }
    }

    fn note_failure(&mut self, address: u8) {
        let backoff = self.backoff.clone();
        let (event, transition) = match self.devices.get_mut(&address) {
            Some(device) => {
                let before = device.state();
                let event = device.record_failure(&backoff, Instant::now());
                let after = device.state();
                let failures = device.failures();
                (event, (before != after).then_some((after, failures)))
            }
            None => return,
        };

        if let Some((state, failures)) = transition {
            match state {
                HealthState::Cooling => info!(
                    "device {}: {} consecutive failures, cooling for {:?}",
                    address, failures, backoff.cooling
                ),
                HealthState::Penalized => warn!(
                    "device {}: {} consecutive failures, penalized for {:?}",
                    address, failures, backoff.penalty
                ),
                HealthState::Active => {}
            }
        }

        if event == Some(HealthEvent::WentOffline) {
            self.publish_availability(address, "offline");
        }
    }

    fn publish(&self, topic: String, payload: String, retain: bool) {
        let message = mqtt::Message {
            topic,
            retain,
            payload,
        };
        if self
            .channels
            .to_mqtt
            .send(mqtt::ChannelData::Message(message))
            .is_err()
        {
            // mqtt disabled or gone; telemetry is simply dropped
            trace!("send(to_mqtt) failed - no subscribers");
        }
    }

    fn publish_availability(&self, address: u8, state: &str) {
        self.publish(format!("{}/availability", address), state.to_string(), true);
    }

    fn publish_availability_all(&self, state: &str) {
        for address in self.devices.keys().copied().collect::<Vec<u8>>() {
            self.publish_availability(address, state);
        }
    }
}

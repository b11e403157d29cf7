use crate::prelude::*;

/// Inter-component plumbing. Telemetry fans out over broadcast; inbound
/// commands flow through one mpsc queue whose single receiver belongs to the
/// coordinator.
#[derive(Debug, Clone)]
pub struct Channels {
    pub to_mqtt: broadcast::Sender<crate::mqtt::ChannelData>,
    pub to_coordinator: mpsc::Sender<CommandRequest>,
    pub shutdown: broadcast::Sender<()>,
}

impl Channels {
    pub fn new() -> (Self, mpsc::Receiver<CommandRequest>) {
        let (to_coordinator, command_rx) = mpsc::channel(64);

        let channels = Self {
            to_mqtt: Self::channel(),
            to_coordinator,
            shutdown: broadcast::channel(1).0,
        };

        (channels, command_rx)
    }

    fn channel<T: Clone>() -> broadcast::Sender<T> {
        broadcast::channel(2048).0
    }
}

pub use {
    anyhow::{anyhow, bail, Result},
    log::{debug, error, info, trace, warn},
    std::io::Write,
    std::str::FromStr,
    tokio::sync::{broadcast, mpsc},
};

pub use crate::{
    channels::Channels,
    command::{self, Command, CommandRequest},
    config::{self, Config, ConfigWrapper},
    coordinator::Coordinator,
    mqtt::{self, Mqtt},
    options::Options,
    register_map::RegisterMap,
    scheduler::Scheduler,
};

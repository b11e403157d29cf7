use crate::prelude::*;

use serde::Deserialize;
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub gateway: Gateway,

    pub devices: Vec<u8>,

    #[serde(default = "Config::default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    #[serde(default = "Config::default_device_delay_ms")]
    pub device_delay_ms: u64,

    #[serde(default = "Config::default_write_settle_ms")]
    pub write_settle_ms: u64,

    #[serde(default = "Config::default_write_retry_settle_ms")]
    pub write_retry_settle_ms: u64,

    #[serde(default)]
    pub backoff: Backoff,

    #[serde(default = "Config::default_max_failed_cycles")]
    pub max_failed_cycles: u32,

    pub mqtt: Mqtt,

    pub scheduler: Option<Scheduler>,

    /// Optional path to a JSON file overriding the built-in register map
    pub register_file: Option<String>,

    #[serde(default = "Config::default_loglevel")]
    pub loglevel: String,
}

// Gateway {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Gateway {
    pub host: String,
    pub port: u16,

    #[serde(default = "Config::default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "Config::default_read_timeout_secs")]
    pub read_timeout_secs: u64,
}

impl Gateway {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn read_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.read_timeout_secs)
    }
} // }}}

// Backoff {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Backoff {
    #[serde(default = "Config::default_cooling_threshold")]
    pub cooling_threshold: u32,

    #[serde(default = "Config::default_cooling_secs")]
    pub cooling_secs: u64,

    #[serde(default = "Config::default_penalty_threshold")]
    pub penalty_threshold: u32,

    #[serde(default = "Config::default_penalty_secs")]
    pub penalty_secs: u64,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            cooling_threshold: Config::default_cooling_threshold(),
            cooling_secs: Config::default_cooling_secs(),
            penalty_threshold: Config::default_penalty_threshold(),
            penalty_secs: Config::default_penalty_secs(),
        }
    }
} // }}}

// Mqtt {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Mqtt {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub host: String,
    #[serde(default = "Config::default_mqtt_port")]
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,

    #[serde(default = "Config::default_mqtt_namespace")]
    pub namespace: String,
}

impl Mqtt {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn username(&self) -> &Option<String> {
        &self.username
    }

    pub fn password(&self) -> &Option<String> {
        &self.password
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }
} // }}}

// Scheduler {{{
#[derive(Clone, Debug, Deserialize)]
pub struct Scheduler {
    #[serde(default = "Config::default_enabled")]
    pub enabled: bool,

    pub timesync_cron: Option<String>,
}

impl Scheduler {
    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn timesync_cron(&self) -> &Option<String> {
        &self.timesync_cron
    }
} // }}}

pub struct ConfigWrapper {
    config: Arc<Mutex<Config>>,
}

impl Clone for ConfigWrapper {
    fn clone(&self) -> Self {
        Self {
            config: self.config.clone(),
        }
    }
}

impl ConfigWrapper {
    pub fn new(file: String) -> Result<Self> {
        let config = Config::new(file)?;
        Ok(Self::from_config(config))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config: Arc::new(Mutex::new(config)),
        }
    }

    pub fn gateway(&self) -> Gateway {
        self.config.lock().unwrap().gateway.clone()
    }

    pub fn devices(&self) -> Vec<u8> {
        self.config.lock().unwrap().devices.clone()
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.config.lock().unwrap().poll_interval_secs)
    }

    pub fn device_delay(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.lock().unwrap().device_delay_ms)
    }

    pub fn write_settle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.lock().unwrap().write_settle_ms)
    }

    pub fn write_retry_settle(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.config.lock().unwrap().write_retry_settle_ms)
    }

    pub fn backoff(&self) -> Backoff {
        self.config.lock().unwrap().backoff.clone()
    }

    pub fn max_failed_cycles(&self) -> u32 {
        self.config.lock().unwrap().max_failed_cycles
    }

    pub fn mqtt(&self) -> Mqtt {
        self.config.lock().unwrap().mqtt.clone()
    }

    pub fn scheduler(&self) -> Option<Scheduler> {
        self.config.lock().unwrap().scheduler.clone()
    }

    pub fn register_file(&self) -> Option<String> {
        self.config.lock().unwrap().register_file.clone()
    }

    pub fn loglevel(&self) -> String {
        self.config.lock().unwrap().loglevel.clone()
    }
}

impl Config {
    pub fn new(file: String) -> Result<Self> {
        let content = std::fs::read_to_string(&file)
            .map_err(|err| anyhow!("error reading {}: {}", file, err))?;

        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded:");
        info!(
            "  Gateway: {}:{} (connect timeout {}s, read timeout {}s)",
            self.gateway.host,
            self.gateway.port,
            self.gateway.connect_timeout_secs,
            self.gateway.read_timeout_secs
        );
        info!("  Devices: {:?}", self.devices);
        info!(
            "  Poll: every {}s, {}ms between devices",
            self.poll_interval_secs, self.device_delay_ms
        );
        info!(
            "  Backoff: cooling after {} failures for {}s, penalty after {} failures for {}s",
            self.backoff.cooling_threshold,
            self.backoff.cooling_secs,
            self.backoff.penalty_threshold,
            self.backoff.penalty_secs
        );
        info!("  MQTT: {}", if self.mqtt.enabled { "enabled" } else { "disabled" });
        if self.mqtt.enabled {
            info!("    Host: {}:{}", self.mqtt.host, self.mqtt.port);
            info!("    Namespace: {}", self.mqtt.namespace);
        }
        if let Some(scheduler) = &self.scheduler {
            info!("  Scheduler: {}", if scheduler.enabled { "enabled" } else { "disabled" });
            if let Some(cron) = &scheduler.timesync_cron {
                info!("    Timesync Cron: {}", cron);
            }
        }
        info!("  Log Level: {}", self.loglevel);
    }

    pub fn validate(&self) -> Result<()> {
        if self.gateway.port == 0 {
            bail!("gateway.port must be between 1 and 65535");
        }
        if self.gateway.host.is_empty() {
            bail!("gateway.host cannot be empty");
        }
        if self.gateway.read_timeout_secs == 0 {
            bail!("gateway.read_timeout_secs must be non-zero");
        }

        if self.devices.is_empty() {
            bail!("at least one device address must be configured");
        }
        for address in &self.devices {
            if !(1..=247).contains(address) {
                bail!("device address {} out of range (1-247)", address);
            }
        }

        if self.poll_interval_secs == 0 {
            bail!("poll_interval_secs must be non-zero");
        }

        if self.backoff.penalty_threshold <= self.backoff.cooling_threshold {
            bail!("backoff.penalty_threshold must be greater than backoff.cooling_threshold");
        }
        if self.backoff.penalty_secs <= self.backoff.cooling_secs {
            bail!("backoff.penalty_secs must be greater than backoff.cooling_secs");
        }
        if self.max_failed_cycles == 0 {
            bail!("max_failed_cycles must be non-zero");
        }

        if self.mqtt.enabled {
            if self.mqtt.port == 0 {
                bail!("mqtt.port must be between 1 and 65535");
            }
            if self.mqtt.host.is_empty() {
                bail!("mqtt.host cannot be empty");
            }
        }

        if let Some(scheduler) = &self.scheduler {
            if scheduler.enabled {
                if let Some(cron) = &scheduler.timesync_cron {
                    if cron.is_empty() {
                        bail!("scheduler.timesync_cron cannot be empty");
                    }
                }
            }
        }

        Ok(())
    }

    fn default_poll_interval_secs() -> u64 {
        20
    }
    fn default_device_delay_ms() -> u64 {
        500
    }
    fn default_write_settle_ms() -> u64 {
        300
    }
    fn default_write_retry_settle_ms() -> u64 {
        1000
    }
    fn default_connect_timeout_secs() -> u64 {
        5
    }
    fn default_read_timeout_secs() -> u64 {
        2
    }
    fn default_cooling_threshold() -> u32 {
        3
    }
    fn default_cooling_secs() -> u64 {
        30
    }
    fn default_penalty_threshold() -> u32 {
        10
    }
    fn default_penalty_secs() -> u64 {
        300
    }
    fn default_max_failed_cycles() -> u32 {
        10
    }
    fn default_mqtt_port() -> u16 {
        1883
    }
    fn default_mqtt_namespace() -> String {
        "ampinvt".to_string()
    }
    fn default_enabled() -> bool {
        true
    }
    fn default_loglevel() -> String {
        "info".to_string()
    }
}

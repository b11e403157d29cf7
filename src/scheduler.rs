use crate::prelude::*;

/// Enqueues a time-sync command for every configured device on a cron
/// schedule. Controllers drift and their clock drives the light-control
/// timers, so periodic correction beats waiting for someone to notice.
pub struct Scheduler {
    config: ConfigWrapper,
    channels: Channels,
}

impl Scheduler {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let cron = match self.config.scheduler() {
            Some(scheduler) if scheduler.enabled() => match scheduler.timesync_cron() {
                Some(cron) => cron.clone(),
                None => return Ok(()),
            },
            _ => return Ok(()),
        };

        let mut shutdown_rx = self.channels.shutdown.subscribe();

        loop {
            let now = chrono::Local::now();
            let next = cron_parser::parse(&cron, &now)
                .map_err(|e| anyhow!("invalid timesync_cron {:?}: {:?}", cron, e))?;
            let wait = (next - now)
                .to_std()
                .unwrap_or(std::time::Duration::from_secs(1));
            debug!("next time sync at {}", next);

            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = tokio::time::sleep(wait) => {
                    for address in self.config.devices() {
                        let request = CommandRequest {
                            command: Command::TimeSync { address },
                            result_topic: None,
                        };
                        if self.channels.to_coordinator.send(request).await.is_err() {
                            bail!("send(to_coordinator) failed - channel closed?");
                        }
                    }
                }
            }
        }

        info!("scheduler exiting");
        Ok(())
    }
}

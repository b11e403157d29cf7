use crate::prelude::*;

use rumqttc::{AsyncClient, Event, EventLoop, Incoming, LastWill, MqttOptions, Publish, QoS};

// Message {{{
#[derive(Eq, PartialEq, Debug, Clone)]
pub struct Message {
    pub topic: String,
    pub retain: bool,
    pub payload: String,
}

impl Message {
    /// Resolves a command topic (namespace already stripped) into a write
    /// intent the coordinator can execute.
    ///
    /// eg cmd/1/set/float_voltage, payload "13.8"
    ///    cmd/3/ctrl/load_enable, payload "ON"
    ///    cmd/2/press/alarm_mute
    ///    cmd/1/sync_time
    pub fn to_command(&self) -> Result<CommandRequest> {
        use Command::*;

        let parts: Vec<&str> = self.topic.split('/').collect();
        if parts.len() < 3 || parts[0] != "cmd" {
            bail!("ignoring badly formed command topic: {}", self.topic);
        }

        let address: u8 = parts[1]
            .parse()
            .map_err(|_| anyhow!("bad device address in topic: {}", self.topic))?;
        if !(1..=247).contains(&address) {
            bail!("device address {} out of range (1-247)", address);
        }

        let command = match parts[2..] {
            ["ctrl", key] => {
                let switch = command::switch(key)
                    .ok_or_else(|| anyhow!("unknown switch: {}", key))?;
                let code = if self.payload_bool() {
                    switch.on_code
                } else {
                    switch.off_code
                };
                SingleCode { address, code }
            }
            ["press", key] => {
                let button = command::button(key)
                    .ok_or_else(|| anyhow!("unknown button: {}", key))?;
                SingleCode {
                    address,
                    code: button.code,
                }
            }
            ["set", key] => {
                let param = command::param(key)
                    .ok_or_else(|| anyhow!("unknown parameter: {}", key))?;
                let value: f64 = self
                    .payload
                    .parse()
                    .map_err(|_| anyhow!("bad numeric payload: {:?}", self.payload))?;
                WriteParam {
                    address,
                    code: param.code,
                    value,
                    scale: param.scale,
                    width: param.width,
                }
            }
            ["sync_time"] => TimeSync { address },
            [..] => bail!("unhandled command topic: {}", self.topic),
        };

        Ok(CommandRequest {
            command,
            result_topic: Some(format!("result/{}", parts[1..].join("/"))),
        })
    }

    fn payload_bool(&self) -> bool {
        matches!(
            self.payload.to_ascii_lowercase().as_str(),
            "1" | "t" | "true" | "on" | "y" | "yes"
        )
    }
} // }}}

#[derive(Eq, PartialEq, Debug, Clone)]
pub enum ChannelData {
    Message(Message),
    Shutdown,
}

pub type Sender = broadcast::Sender<ChannelData>;

#[derive(Clone)]
pub struct Mqtt {
    config: ConfigWrapper,
    channels: Channels,
}

impl Mqtt {
    pub fn new(config: ConfigWrapper, channels: Channels) -> Self {
        Self { config, channels }
    }

    pub async fn start(&self) -> Result<()> {
        let c = self.config.mqtt();

        if !c.enabled() {
            info!("mqtt disabled, skipping");
            return Ok(());
        }

        let mut options = MqttOptions::new("ampinvt-bridge", c.host(), c.port());

        let will = LastWill {
            topic: self.lwt_topic(),
            message: bytes::Bytes::from("offline"),
            qos: QoS::AtLeastOnce,
            retain: true,
        };
        options.set_last_will(will);

        options.set_keep_alive(std::time::Duration::from_secs(60));
        if let (Some(u), Some(p)) = (c.username(), c.password()) {
            options.set_credentials(u, p);
        }

        info!("initializing mqtt at {}:{}", c.host(), c.port());

        let (client, eventloop) = AsyncClient::new(options, 10);

        futures::try_join!(
            self.setup(client.clone()),
            self.receiver(eventloop),
            self.sender(client)
        )?;

        Ok(())
    }

    pub async fn stop(&self) -> Result<()> {
        info!("Stopping MQTT client...");
        let _ = self.channels.to_mqtt.send(ChannelData::Shutdown);
        Ok(())
    }

    async fn setup(&self, client: AsyncClient) -> Result<()> {
        client
            .publish(self.lwt_topic(), QoS::AtLeastOnce, true, "online")
            .await?;

        client
            .subscribe(
                format!("{}/cmd/#", self.config.mqtt().namespace()),
                QoS::AtMostOnce,
            )
            .await?;

        Ok(())
    }

    // broker -> coordinator command queue
    async fn receiver(&self, mut eventloop: EventLoop) -> Result<()> {
        let mut shutdown_rx = self.channels.shutdown.subscribe();

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::Publish(publish))) => {
                        if let Err(e) = self.handle_message(publish).await {
                            error!("{:?}", e);
                        }
                    }
                    Ok(_) => {} // keepalives etc
                    Err(e) => {
                        error!("{}", e);
                        info!("reconnecting in 5s");
                        tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                    }
                }
            }
        }

        info!("MQTT receiver loop exiting");
        Ok(())
    }

    async fn handle_message(&self, publish: Publish) -> Result<()> {
        // remove the namespace, including the first /
        let prefix_len = self.config.mqtt().namespace().len() + 1;
        if publish.topic.len() <= prefix_len {
            bail!("ignoring short topic: {}", publish.topic);
        }
        let topic = publish.topic[prefix_len..].to_owned();

        let message = Message {
            topic,
            retain: publish.retain,
            payload: String::from_utf8(publish.payload.to_vec())?,
        };
        debug!("RX: {:?}", message);

        if !message.topic.starts_with("cmd/") {
            return Ok(());
        }

        let request = message.to_command()?;
        if self.channels.to_coordinator.send(request).await.is_err() {
            bail!("send(to_coordinator) failed - channel closed?");
        }

        Ok(())
    }

    // coordinator -> broker
    async fn sender(&self, client: AsyncClient) -> Result<()> {
        use ChannelData::*;

        let mut receiver = self.channels.to_mqtt.subscribe();

        loop {
            match receiver.recv().await? {
                Shutdown => {
                    info!("MQTT sender received shutdown signal");
                    let _ = client.disconnect().await;
                    break;
                }
                Message(message) => {
                    let topic = format!("{}/{}", self.config.mqtt().namespace(), message.topic);
                    debug!("publishing: {} = {}", topic, message.payload);
                    let payload = message.payload.as_bytes().to_vec();

                    let mut retry_count = 0;
                    while let Err(err) = client
                        .publish(&topic, QoS::AtLeastOnce, message.retain, payload.as_slice())
                        .await
                    {
                        retry_count += 1;
                        if retry_count > 3 {
                            error!("giving up publishing to {}", topic);
                            break;
                        }
                        error!(
                            "MQTT publish failed: {:?} - retrying in 10s (attempt {}/3)",
                            err, retry_count
                        );
                        tokio::time::sleep(std::time::Duration::from_secs(10)).await;
                    }
                }
            }
        }

        info!("MQTT sender loop exiting");
        Ok(())
    }

    fn lwt_topic(&self) -> String {
        format!("{}/LWT", self.config.mqtt().namespace())
    }
}

use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::Context;
use linkme::distributed_slice;
use rumqttc::Client;
use rumqttc::Event;
use rumqttc::MqttOptions;
use rumqttc::Packet;
use rumqttc::QoS;
use tracing::debug;
use tracing::info;
use tracing::warn;

use super::DecodeError;
use super::PushSource;
use super::REGISTRY;
use super::SourceContext;
use super::SourceFactoryResult;
use super::SourceHandle;
use super::decode_fields;
use super::forward;
use crate::config::MqttSourceConfig;
use crate::coordinator::Bridge;
use crate::coordinator::PushMessage;
use crate::coordinator::UpdateCoordinator;

#[distributed_slice(REGISTRY)]
fn init_mqtt(ctx: &SourceContext) -> SourceFactoryResult {
    let Some(config) = &ctx.config.sources.mqtt else {
        return Ok(None);
    };
    Ok(Some(Box::new(MqttSource::new(config.clone()))))
}

/// Appliance updates from an MQTT broker, one topic per appliance:
/// `{topic_prefix}/{appliance_id}/update`.
pub struct MqttSource {
    config: MqttSourceConfig,
}

impl MqttSource {
    pub fn new(config: MqttSourceConfig) -> Self {
        Self { config }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.clone(),
            self.config.broker.clone(),
            self.config.port,
        );
        options.set_keep_alive(Duration::from_secs(30));
        if let (Some(username), Some(password)) = (&self.config.username, &self.config.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

impl PushSource for MqttSource {
    fn name(&self) -> &str {
        "mqtt"
    }

    fn start(self: Box<Self>, bridge: Bridge<UpdateCoordinator>) -> anyhow::Result<SourceHandle> {
        let (client, mut connection) = Client::new(self.options(), 10);
        let filter = format!("{}/+/update", self.config.topic_prefix);
        client
            .subscribe(filter.as_str(), QoS::AtLeastOnce)
            .with_context(|| format!("Failed to subscribe to {}", filter))?;
        info!(
            "MQTT source connecting to {}:{}, subscribed to {}",
            self.config.broker, self.config.port, filter
        );

        let prefix = self.config.topic_prefix.clone();
        let handle = SourceHandle::spawn("mqtt", move |stop| {
            for notification in connection.iter() {
                if stop.load(Ordering::SeqCst) {
                    break;
                }
                match notification {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match decode_publish(&prefix, &publish.topic, &publish.payload) {
                            Ok(message) => {
                                if !forward("mqtt", &bridge, message) {
                                    break;
                                }
                            }
                            Err(e) => warn!("Dropping MQTT message on {}: {}", publish.topic, e),
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => info!("MQTT source connected"),
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        std::thread::sleep(Duration::from_secs(1));
                    }
                }
            }
            info!("MQTT source stopped");
        })
        .context("Failed to spawn MQTT source thread")?;

        Ok(handle.with_wake(move || {
            if let Err(e) = client.disconnect() {
                debug!("MQTT disconnect failed: {}", e);
            }
        }))
    }
}

/// Appliance id from `{prefix}/{appliance_id}/update`.
fn appliance_id_from_topic<'a>(prefix: &str, topic: &'a str) -> Option<&'a str> {
    let id = topic
        .strip_prefix(prefix)?
        .strip_prefix('/')?
        .strip_suffix("/update")?;
    (!id.is_empty() && !id.contains('/')).then_some(id)
}

fn decode_publish(prefix: &str, topic: &str, payload: &[u8]) -> Result<PushMessage, DecodeError> {
    let appliance_id = appliance_id_from_topic(prefix, topic)
        .ok_or_else(|| DecodeError::Topic(topic.to_string()))?;
    decode_fields(appliance_id, payload)
}

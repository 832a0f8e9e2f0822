use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::time::{self, Duration};
use tracing::{debug, error, info, warn};

use crate::balancer::BalancerHandle;
use crate::config::MqttConfig;
use crate::events::Events;

/// Feeds household power samples from an MQTT topic into the load balancer and publishes its
/// notifications back to the broker.
pub struct MqttBridge {
    config: MqttConfig,
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttBridge {
    pub fn new(config: MqttConfig) -> Self {
        let mut mqttoptions = MqttOptions::new(&config.client_id, &config.host, config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(mqttoptions, 10);
        Self {
            config,
            client,
            eventloop,
        }
    }

    /// Runs until the load balancer stops.
    pub async fn run(mut self, balancer: BalancerHandle, events: Events) -> anyhow::Result<()> {
        let mut limits = events.limit.subscribe();
        let mut charger_power = events.charger_power.subscribe();
        let mut power_missing = events.total_power_missing.subscribe();

        loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!(
                            "connected to MQTT broker {}:{}",
                            self.config.host, self.config.port
                        );
                        // sessions are clean, subscribe again after every reconnect
                        if let Err(e) = self
                            .client
                            .try_subscribe(&self.config.total_power_topic, QoS::AtMostOnce)
                        {
                            error!(
                                "subscribing to {} failed: {:?}",
                                self.config.total_power_topic, e
                            );
                        }
                    }
                    Ok(Event::Incoming(Packet::Publish(publish)))
                        if publish.topic == self.config.total_power_topic =>
                    {
                        match parse_power_payload(&publish.payload) {
                            Some(watts) => balancer.submit_power_sample(watts).await?,
                            None => warn!(
                                "incoming power not a number: {:?}",
                                String::from_utf8_lossy(&publish.payload)
                            ),
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("MQTT event loop error: {:?}", e);
                        time::sleep(Duration::from_secs(5)).await;
                    }
                },
                Ok(limit) = limits.recv() => {
                    self.publish(self.config.limit_topic.as_deref(), Value::from(limit));
                }
                Ok(power) = charger_power.recv() => {
                    self.publish(self.config.charger_power_topic.as_deref(), Value::from(power));
                }
                Ok(missing) = power_missing.recv() => {
                    self.publish(
                        self.config.total_power_missing_topic.as_deref(),
                        Value::from(missing),
                    );
                }
            }
        }
    }

    fn publish(&self, topic: Option<&str>, value: Value) {
        let Some(topic) = topic else {
            return;
        };
        let payload = serde_json::json!({ "value": value }).to_string();
        debug!("publishing {} to {}", payload, topic);
        if let Err(e) = self.client.try_publish(topic, QoS::AtLeastOnce, true, payload) {
            error!("publishing to {} failed: {:?}", topic, e);
        }
    }
}

/// Parses a power sample published either as a bare number or as `{"value": n}`.
pub fn parse_power_payload(payload: &[u8]) -> Option<i32> {
    let text = std::str::from_utf8(payload).ok()?;
    let value = match serde_json::from_str::<Value>(text.trim()).ok()? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Object(map) => map.get("value").and_then(Value::as_f64),
        _ => None,
    }?;
    value.is_finite().then(|| value.round() as i32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_numbers() {
        assert_eq!(parse_power_payload(b"1234"), Some(1234));
        assert_eq!(parse_power_payload(b" -512.6\n"), Some(-513));
        assert_eq!(parse_power_payload(b"\"4200\""), Some(4200));
    }

    #[test]
    fn parses_gx_style_json() {
        assert_eq!(parse_power_payload(br#"{"value": 5750}"#), Some(5750));
        assert_eq!(parse_power_payload(br#"{"value": null}"#), None);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_power_payload(b"unavailable"), None);
        assert_eq!(parse_power_payload(b""), None);
        assert_eq!(parse_power_payload(&[0xff, 0xfe]), None);
    }
}

//! MQTT publisher for egress events
//!
//! Mirrors alert pipeline events to MQTT topics for downstream consumers:
//! - sharkwatch/alerts - Published shark alerts (QoS 1)
//! - sharkwatch/transitions - Zone entry/exit transitions (QoS 0)
//! - sharkwatch/metrics - Periodic metrics snapshots (QoS 0)

use crate::infra::config::Config;
use crate::io::egress_channel::EgressMessage;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Connection options for the egress client
fn mqtt_options(config: &Config) -> MqttOptions {
    let client_id = format!("sharkwatch-egress-{}", std::process::id());
    let mut options = MqttOptions::new(client_id, config.mqtt_host(), config.mqtt_port());
    options.set_keep_alive(Duration::from_secs(30)).set_clean_session(true);
    if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
        options.set_credentials(username, password);
    }
    options
}

/// Poll the rumqttc event loop forever; it reconnects on the next poll after an error
async fn drive_event_loop(mut eventloop: EventLoop) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                info!(code = ?ack.code, "mqtt_egress_connected")
            }
            Ok(Event::Incoming(Packet::PubAck(ack))) => debug!(pkid = %ack.pkid, "mqtt_egress_puback"),
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "mqtt_egress_connection_error");
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        }
    }
}

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

struct Topics {
    alerts: String,
    transitions: String,
    metrics: String,
}

impl Topics {
    /// Topic, QoS and log label for a message; alerts are the only at-least-once stream
    fn route(&self, msg: &EgressMessage) -> (&str, QoS, &'static str) {
        match msg {
            EgressMessage::Alert(_) => (&self.alerts, QoS::AtLeastOnce, "alert"),
            EgressMessage::Transition(_) => (&self.transitions, QoS::AtMostOnce, "transition"),
            EgressMessage::Metrics(_) => (&self.metrics, QoS::AtMostOnce, "metrics"),
        }
    }
}

/// Drains the egress channel into MQTT
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    topics: Topics,
}

impl MqttPublisher {
    /// Build the client and spawn its event loop; nothing is published until `run`
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let (client, eventloop) = AsyncClient::new(mqtt_options(config), 100);
        tokio::spawn(drive_event_loop(eventloop));

        Self {
            client,
            rx,
            topics: Topics {
                alerts: config.mqtt_egress_alerts_topic().to_string(),
                transitions: config.mqtt_egress_transitions_topic().to_string(),
                metrics: config.mqtt_egress_metrics_topic().to_string(),
            },
        }
    }

    /// Publish until the channel closes or shutdown is signalled, then drain what is queued
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            alerts = %self.topics.alerts,
            transitions = %self.topics.transitions,
            metrics = %self.topics.metrics,
            "mqtt_egress_started"
        );

        loop {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.publish(msg).await,
                    None => {
                        info!("mqtt_egress_channel_closed");
                        return;
                    }
                },
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        let mut drained = 0usize;
                        while let Ok(msg) = self.rx.try_recv() {
                            self.publish(msg).await;
                            drained += 1;
                        }
                        info!(drained = %drained, "mqtt_egress_shutdown");
                        return;
                    }
                }
            }
        }
    }

    async fn publish(&self, msg: EgressMessage) {
        let (topic, qos, kind) = self.topics.route(&msg);
        let body = match &msg {
            EgressMessage::Alert(payload) => serde_json::to_vec(payload),
            EgressMessage::Transition(payload) => serde_json::to_vec(payload),
            EgressMessage::Metrics(payload) => serde_json::to_vec(payload),
        };
        let body = match body {
            Ok(body) => body,
            Err(e) => {
                error!(kind = %kind, error = %e, "mqtt_egress_serialize_failed");
                return;
            }
        };

        if let Err(e) = self.client.publish(topic, qos, false, body).await {
            if qos == QoS::AtMostOnce {
                debug!(kind = %kind, error = %e, "mqtt_egress_publish_failed");
            } else {
                error!(kind = %kind, error = %e, "mqtt_egress_publish_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::egress_channel::MetricsPayload;

    #[test]
    fn test_route_by_message_kind() {
        let topics = Topics {
            alerts: "a".into(),
            transitions: "t".into(),
            metrics: "m".into(),
        };
        let summary = crate::infra::metrics::Metrics::new().report(0, 0);
        let msg = EgressMessage::Metrics(MetricsPayload::from_summary(&summary, "bondi".to_string()));
        assert_eq!(topics.route(&msg), ("m", QoS::AtMostOnce, "metrics"));
    }
}

//! Egress queue between the pipeline and the MQTT publisher
//!
//! Producers never wait: a full queue drops the message and bumps
//! `egress_dropped`. Alerts already reached live sessions before they get here.

use crate::domain::notification::Notification;
use crate::domain::types::{epoch_ms, ZoneId};
use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_NUM_BUCKETS};
use crate::services::presence::ZoneTransition;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

/// One mirrored pipeline event
#[derive(Debug)]
pub enum EgressMessage {
    /// Published shark alert
    Alert(AlertPayload),
    /// Subject entered or left a zone
    Transition(TransitionPayload),
    /// Periodic metrics snapshot
    Metrics(MetricsPayload),
}

/// Payload for published alerts
#[derive(Debug, Clone, Serialize)]
pub struct AlertPayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub id: String,
    pub event_id: String,
    pub zone_id: Option<ZoneId>,
    pub title: String,
    pub body: String,
    pub level: &'static str,
    pub lat: f64,
    pub lon: f64,
    /// Channels reached by the live publish
    pub delivered: u64,
}

/// Payload for zone entry/exit transitions
#[derive(Debug, Clone, Serialize)]
pub struct TransitionPayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    /// Event type (zone_entered, zone_exited)
    pub t: &'static str,
    pub subject: String,
    pub zone_id: ZoneId,
    pub zone: String,
    /// When the position was observed (epoch ms)
    pub observed_at: i64,
}

/// Payload for metrics snapshot
#[derive(Debug, Serialize)]
pub struct MetricsPayload {
    pub site: String,
    /// Timestamp (epoch ms)
    pub ts: u64,
    pub detections_total: u64,
    pub detections_rejected: u64,
    pub detections_per_sec: f64,
    pub avg_latency_us: u64,
    pub max_latency_us: u64,
    /// Latency bucket counts, same layout as `MetricsSummary::lat_buckets`
    pub lat_buckets: [u64; METRICS_NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub alerts_published: u64,
    pub deliveries_total: u64,
    pub deliveries_missed: u64,
    pub positions_total: u64,
    pub positions_dropped: u64,
    pub transitions_total: u64,
    pub directory_errors: u64,
    pub store_errors: u64,
    pub active_zones: usize,
    pub live_channels: usize,
}

impl MetricsPayload {
    pub fn from_summary(summary: &MetricsSummary, site: String) -> Self {
        Self {
            site,
            ts: epoch_ms(),
            detections_total: summary.detections_total,
            detections_rejected: summary.detections_rejected,
            detections_per_sec: summary.detections_per_sec,
            avg_latency_us: summary.avg_pipeline_latency_us,
            max_latency_us: summary.max_pipeline_latency_us,
            lat_buckets: summary.lat_buckets,
            lat_p50_us: summary.lat_p50_us,
            lat_p95_us: summary.lat_p95_us,
            lat_p99_us: summary.lat_p99_us,
            alerts_published: summary.alerts_published,
            deliveries_total: summary.deliveries_total,
            deliveries_missed: summary.deliveries_missed,
            positions_total: summary.positions_total,
            positions_dropped: summary.positions_dropped,
            transitions_total: summary.transitions_total,
            directory_errors: summary.directory_errors,
            store_errors: summary.store_errors,
            active_zones: summary.active_zones,
            live_channels: summary.live_channels,
        }
    }
}

/// Cloneable producer handle held by the pipeline and the presence worker
/// Non-blocking - if the channel is full, messages are dropped and counted.
#[derive(Clone)]
pub struct EgressSender {
    tx: mpsc::Sender<EgressMessage>,
    site_id: String,
    metrics: Arc<Metrics>,
}

impl EgressSender {
    pub fn new(tx: mpsc::Sender<EgressMessage>, site_id: String, metrics: Arc<Metrics>) -> Self {
        Self { tx, site_id, metrics }
    }

    pub fn send_alert(&self, notification: &Notification, delivered: u64) {
        let payload = AlertPayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            id: notification.id.0.clone(),
            event_id: notification.source_event_id.0.clone(),
            zone_id: notification.zone_id,
            title: notification.title.clone(),
            body: notification.body.clone(),
            level: notification.alert_level.as_str(),
            lat: notification.point.latitude,
            lon: notification.point.longitude,
            delivered,
        };
        self.send(EgressMessage::Alert(payload));
    }

    pub fn send_transition(&self, transition: &ZoneTransition) {
        let payload = TransitionPayload {
            site: self.site_id.clone(),
            ts: epoch_ms(),
            t: transition.kind.as_str(),
            subject: transition.subject_id.clone(),
            zone_id: transition.zone_id,
            zone: transition.zone_name.clone(),
            observed_at: transition.at.timestamp_millis(),
        };
        self.send(EgressMessage::Transition(payload));
    }

    pub fn send_metrics(&self, summary: &MetricsSummary) {
        let payload = MetricsPayload::from_summary(summary, self.site_id.clone());
        self.send(EgressMessage::Metrics(payload));
    }

    // try_send so producers never wait on the broker
    fn send(&self, msg: EgressMessage) {
        if let Err(e) = self.tx.try_send(msg) {
            self.metrics.record_egress_dropped();
            debug!(error = %e, "egress_dropped");
        }
    }
}

/// Bounded egress queue; the receiver goes to `MqttPublisher`
pub fn create_egress_channel(
    buffer_size: usize,
    site_id: String,
    metrics: Arc<Metrics>,
) -> (EgressSender, mpsc::Receiver<EgressMessage>) {
    let (tx, rx) = mpsc::channel(buffer_size);
    (EgressSender::new(tx, site_id, metrics), rx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertLevel, EventId, NotificationId, Point};
    use crate::services::presence::TransitionKind;
    use chrono::Utc;

    fn notification() -> Notification {
        Notification {
            id: NotificationId("NTF-1".into()),
            source_event_id: EventId("DET-1".into()),
            zone_id: Some(ZoneId(3)),
            title: "Shark Alert: Great White".into(),
            body: "Great White detected near Bondi Beach (95% confidence)".into(),
            alert_level: AlertLevel::High,
            point: Point::new(-33.8915, 151.2767).unwrap(),
            created_at: Utc::now(),
            delivered_count: 2,
            published: true,
            recipient: None,
            is_read: false,
            read_at: None,
        }
    }

    #[tokio::test]
    async fn test_alert_payload_carries_site() {
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = create_egress_channel(4, "bondi".into(), metrics);
        tx.send_alert(&notification(), 2);

        match rx.recv().await {
            Some(EgressMessage::Alert(p)) => {
                assert_eq!(p.site, "bondi");
                assert_eq!(p.level, "high");
                assert_eq!(p.zone_id, Some(ZoneId(3)));
                assert_eq!(p.delivered, 2);
                let json = serde_json::to_string(&p).unwrap();
                assert!(json.contains("\"event_id\":\"DET-1\""));
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_transition_payload() {
        let metrics = Arc::new(Metrics::new());
        let (tx, mut rx) = create_egress_channel(4, "bondi".into(), metrics);
        tx.send_transition(&ZoneTransition {
            subject_id: "watch-1".into(),
            zone_id: ZoneId(1),
            zone_name: "Bondi Beach".into(),
            kind: TransitionKind::Exited,
            at: Utc::now(),
        });

        match rx.recv().await {
            Some(EgressMessage::Transition(p)) => {
                assert_eq!(p.t, "zone_exited");
                assert_eq!(p.subject, "watch-1");
            }
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_full_channel_counts_drop() {
        let metrics = Arc::new(Metrics::new());
        let (tx, _rx) = create_egress_channel(1, "bondi".into(), metrics.clone());
        tx.send_alert(&notification(), 0);
        tx.send_alert(&notification(), 0);

        let summary = metrics.report(0, 0);
        assert_eq!(summary.egress_dropped, 1);
    }
}

//! Alert pipeline - orchestrates detection and position flows
//!
//! Detection flow:
//!   ingest -> record -> resolve nearest zone -> synthesize -> persist
//!   (a retry fills in a missing zone) -> claim -> publish (qualifying,
//!   unpublished only) -> record delivery -> mirror to egress
//!
//! Position flow:
//!   ingest -> resolve containing zones -> answer caller
//!   -> enqueue for the presence worker (drops counted)
//!
//! There is no pipeline-wide lock. Each request runs on its own task and
//! only touches the short-lived locks inside the collaborators.

use crate::domain::error::AlertError;
use crate::domain::event::{DetectionInput, PositionInput};
use crate::domain::notification::Notification;
use crate::domain::types::{AlertLevel, NotificationId, SubscriberId, TimeWindow, ZoneId};
use crate::domain::zone::{Zone, ZoneSpec};
use crate::infra::config::Config;
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::io::egress_channel::EgressSender;
use crate::services::detections::{
    DetectionFilter, DetectionLog, DetectionRecord, DetectionStats, TimeFilter,
};
use crate::services::fanout::{ChannelId, PublishOutcome, SubscriptionRegistry};
use crate::services::ingestion::Ingestion;
use crate::services::notifier::{
    Audience, NotificationStats, NotificationStore, OperatorMessage, PersistOutcome, Synthesizer,
};
use crate::services::presence::{
    create_presence_worker, LocationRecord, PresenceTracker, PresenceUpdate, PresenceWorker,
};
use crate::services::resolver::ZoneResolver;
use crate::services::subscriptions::SubscriptionDirectory;
use crate::services::zone_directory::{ZoneDirectory, ZoneLookup};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, info, warn};

/// Answer to a detection report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionReceipt {
    pub detection_id: String,
    pub notification_id: NotificationId,
    pub zone_id: Option<ZoneId>,
    pub alert_level: AlertLevel,
    pub delivered_count: u64,
}

impl DetectionReceipt {
    fn new(detection_id: &str, notification: &Notification) -> Self {
        Self {
            detection_id: detection_id.to_string(),
            notification_id: notification.id.clone(),
            zone_id: notification.zone_id,
            alert_level: notification.alert_level,
            delivered_count: notification.delivered_count,
        }
    }
}

/// Answer to an operator message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageReceipt {
    pub notification: Notification,
    /// Subscribers addressed, connected or not
    pub recipients: usize,
    /// Live channels that accepted the message
    pub delivered_count: u64,
}

/// Immediate containment answer to a position report
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionAnswer {
    pub is_in_geofence: bool,
    /// First containing zone in directory order
    pub current_geofence: Option<ZoneId>,
    pub zone_ids: Vec<ZoneId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GeofenceStats {
    pub total_geofences: usize,
    pub active_geofences: usize,
    pub subjects_in_geofences: usize,
}

pub struct AlertPipeline {
    ingestion: Ingestion,
    detections: DetectionLog,
    resolver: ZoneResolver,
    synthesizer: Synthesizer,
    store: Arc<dyn NotificationStore>,
    registry: Arc<SubscriptionRegistry>,
    subscriptions: SubscriptionDirectory,
    /// Held across a relation read or write and the matching registry update
    relations_gate: Mutex<()>,
    zones: Arc<ZoneDirectory>,
    presence: Arc<Mutex<PresenceTracker>>,
    presence_tx: mpsc::Sender<PresenceUpdate>,
    egress: Option<EgressSender>,
    metrics: Arc<Metrics>,
    resolve_timeout: Duration,
    store_timeout: Duration,
}

impl AlertPipeline {
    /// Build the pipeline and its presence worker
    ///
    /// The worker must be spawned by the caller; it stops once the pipeline
    /// is dropped.
    pub fn new(
        config: &Config,
        zones: Arc<ZoneDirectory>,
        store: Arc<dyn NotificationStore>,
        egress: Option<EgressSender>,
        metrics: Arc<Metrics>,
    ) -> (Self, PresenceWorker) {
        let resolve_timeout = Duration::from_millis(config.resolve_timeout_ms());
        let presence = Arc::new(Mutex::new(PresenceTracker::new(config.history_limit())));
        let (presence_tx, worker) = create_presence_worker(
            presence.clone(),
            egress.clone(),
            metrics.clone(),
            config.presence_queue_size().max(1),
        );

        let pipeline = Self {
            ingestion: Ingestion::new(config.media_dir()),
            detections: DetectionLog::new(),
            resolver: ZoneResolver::new(zones.clone(), resolve_timeout),
            synthesizer: Synthesizer::new(
                config.alert_confidence_threshold(),
                config.min_confidence(),
            ),
            store,
            registry: Arc::new(SubscriptionRegistry::new(config.channel_buffer())),
            subscriptions: SubscriptionDirectory::new(),
            relations_gate: Mutex::new(()),
            zones,
            presence,
            presence_tx,
            egress,
            metrics,
            resolve_timeout,
            store_timeout: Duration::from_millis(config.store_timeout_ms()),
        };
        (pipeline, worker)
    }

    /// Resolve zones through another lookup (remote directory, test double)
    pub fn with_lookup(mut self, lookup: Arc<dyn ZoneLookup>) -> Self {
        self.resolver = ZoneResolver::new(lookup, self.resolve_timeout);
        self
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn zones(&self) -> &Arc<ZoneDirectory> {
        &self.zones
    }

    // ---------------------------------------------------------------------
    // Detection flow
    // ---------------------------------------------------------------------

    /// Run a detection report through the whole pipeline
    ///
    /// A directory failure still persists a zone-less notification before
    /// returning `DirectoryUnavailable`. A retried report reuses the stored
    /// notification: it picks up the zone if the first attempt had none and
    /// is fanned out if no earlier attempt got that far. Nothing is published
    /// twice.
    pub async fn report_detection(
        &self,
        input: DetectionInput,
    ) -> Result<DetectionReceipt, AlertError> {
        let started = Instant::now();

        let event = match self.ingestion.submit_detection(input).await {
            Ok(event) => event,
            Err(e) => {
                self.metrics.record_detection_rejected();
                warn!(error = %e, "detection_rejected");
                return Err(e);
            }
        };
        if !self.detections.record(&event) {
            debug!(event_id = %event.id, "detection_retried");
        }

        let (zone, directory_error) = match self.resolver.resolve_for_detection(&event).await {
            Ok(zone) => (zone, None),
            Err(e) => {
                self.metrics.record_directory_error();
                error!(event_id = %event.id, error = %e, "detection_resolve_failed");
                (None, Some(e))
            }
        };

        let candidate = self.synthesizer.synthesize(&event, zone.as_ref());
        let PersistOutcome { notification, created } = self
            .bounded_store("persist", self.store.persist(candidate.clone()))
            .await
            .map_err(|e| {
                error!(event_id = %event.id, error = %e, "notification_persist_failed");
                e
            })?;
        self.metrics.record_persist(created);

        let notification = if !created && notification.zone_id.is_none() && zone.is_some() {
            let resolved = self
                .bounded_store("resolve_zone", self.store.resolve_zone(&notification.id, &candidate))
                .await?;
            info!(
                event_id = %event.id,
                notification_id = %resolved.id,
                zone_id = ?resolved.zone_id,
                "notification_zone_resolved"
            );
            resolved
        } else {
            notification
        };
        self.detections.attach(&event.id.0, zone.as_ref(), &notification);

        info!(
            event_id = %event.id,
            notification_id = %notification.id,
            zone_id = ?notification.zone_id,
            category = %event.category,
            confidence = %event.confidence,
            alert_level = %notification.alert_level.as_str(),
            created = %created,
            "detection_processed"
        );

        if let Some(e) = directory_error {
            return Err(e);
        }

        let notification = match notification.zone_id {
            Some(zone_id)
                if !notification.published
                    && self.synthesizer.should_publish(&event, zone.as_ref()) =>
            {
                let claimed = self
                    .bounded_store("claim_publish", self.store.claim_publish(&notification.id))
                    .await?;
                if claimed {
                    let published = self.publish(zone_id, notification).await;
                    self.detections.mark_alerted(&event.id.0);
                    published
                } else {
                    notification
                }
            }
            _ => notification,
        };

        self.metrics.record_detection(started.elapsed().as_micros() as u64);
        Ok(DetectionReceipt::new(&event.id.0, &notification))
    }

    /// Fan out to the zone topic and record the delivery count
    async fn publish(&self, zone_id: ZoneId, notification: Notification) -> Notification {
        let outcome = self.registry.publish(zone_id, &notification);
        self.finish_publish(notification, outcome).await
    }

    /// Persist the delivery count and the published marker, then mirror to egress
    async fn finish_publish(&self, notification: Notification, outcome: PublishOutcome) -> Notification {
        self.metrics.record_publish(outcome.delivered, outcome.attempted);

        if outcome.is_partial() {
            warn!(
                notification_id = %notification.id,
                zone_id = ?notification.zone_id,
                delivered = %outcome.delivered,
                attempted = %outcome.attempted,
                "delivery_partial"
            );
        }

        let recorded = self
            .bounded_store(
                "record_delivery",
                self.store.record_delivery(&notification.id, outcome.delivered),
            )
            .await;
        let notification = match recorded {
            Ok(updated) => updated,
            Err(e) => {
                // Already delivered; the counter catches up on the next successful write
                error!(notification_id = %notification.id, error = %e, "delivery_record_failed");
                Notification {
                    delivered_count: notification.delivered_count + outcome.delivered,
                    published: true,
                    ..notification
                }
            }
        };

        if let Some(egress) = &self.egress {
            egress.send_alert(&notification, outcome.delivered);
        }
        notification
    }

    // ---------------------------------------------------------------------
    // Operator messages
    // ---------------------------------------------------------------------

    /// Send an operator message to a zone's subscribers or to one subscriber
    ///
    /// A zone message goes to every live channel on the zone topic; a
    /// subscriber message goes to every live channel bound to that subscriber.
    pub async fn send_message(&self, message: OperatorMessage) -> Result<MessageReceipt, AlertError> {
        let zone = match message.zone_id {
            Some(id) => match self.zones.get(id) {
                Some(zone) if zone.is_live(Utc::now()) => Some(zone),
                _ => return Err(AlertError::NotFound(format!("zone {}", id))),
            },
            None => None,
        };

        let composed = self.synthesizer.compose(message, zone.as_ref())?;
        let PersistOutcome { notification, .. } =
            self.bounded_store("persist", self.store.persist(composed)).await?;

        let (outcome, recipients) = match (&zone, &notification.recipient) {
            (Some(zone), _) => (
                self.registry.publish(zone.id, &notification),
                self.subscriptions.subscribers_for(zone.id).len(),
            ),
            (None, Some(subscriber)) => (self.registry.publish_to_subscriber(subscriber, &notification), 1),
            (None, None) => (PublishOutcome::default(), 0),
        };
        let notification = self.finish_publish(notification, outcome).await;

        info!(
            notification_id = %notification.id,
            zone_id = ?notification.zone_id,
            subscriber = ?notification.recipient,
            recipients = %recipients,
            delivered = %outcome.delivered,
            "operator_message_sent"
        );
        Ok(MessageReceipt { notification, recipients, delivered_count: outcome.delivered })
    }

    // ---------------------------------------------------------------------
    // Position flow
    // ---------------------------------------------------------------------

    pub async fn report_position(&self, input: PositionInput) -> Result<PositionAnswer, AlertError> {
        let report = self.ingestion.submit_position(input)?;

        let zones = self.resolver.resolve_for_position(&report).await.map_err(|e| {
            self.metrics.record_directory_error();
            error!(subject = %report.subject_id, error = %e, "position_resolve_failed");
            e
        })?;
        self.metrics.record_position();

        let answer = PositionAnswer {
            is_in_geofence: !zones.is_empty(),
            current_geofence: zones.first().map(|z| z.id),
            zone_ids: zones.iter().map(|z| z.id).collect(),
            timestamp: report.observed_at,
        };

        let subject = report.subject_id.clone();
        let update = PresenceUpdate { report, zones, enqueued_at: Instant::now() };
        match self.presence_tx.try_send(update) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.record_position_dropped();
                warn!(subject = %subject, "presence_queue_full");
            }
            Err(TrySendError::Closed(_)) => {
                self.metrics.record_position_dropped();
                error!(subject = %subject, "presence_worker_gone");
            }
        }
        let depth = self.presence_tx.max_capacity() - self.presence_tx.capacity();
        self.metrics.set_presence_queue_depth(depth as u64);

        Ok(answer)
    }

    pub fn location_history(&self, subject_id: &str, limit: usize) -> Vec<LocationRecord> {
        self.presence.lock().history(subject_id, limit)
    }

    // ---------------------------------------------------------------------
    // Zones
    // ---------------------------------------------------------------------

    pub fn create_zone(&self, spec: ZoneSpec) -> Result<Zone, AlertError> {
        self.zones.create(spec)
    }

    pub fn deactivate_zone(&self, id: ZoneId) -> Result<(), AlertError> {
        self.zones.deactivate(id)
    }

    pub fn list_zones(&self) -> Vec<Zone> {
        self.zones.list_active(Utc::now())
    }

    pub fn zone_stats(&self) -> GeofenceStats {
        let stats = self.zones.stats(Utc::now());
        GeofenceStats {
            total_geofences: stats.total,
            active_geofences: stats.active,
            subjects_in_geofences: self.presence.lock().subjects_in_zones(),
        }
    }

    // ---------------------------------------------------------------------
    // Subscriptions
    // ---------------------------------------------------------------------

    /// Replace a subscriber's zone relations and update its live channels
    ///
    /// Every zone must exist and be live; otherwise nothing changes.
    pub fn set_subscriptions(
        &self,
        subscriber: &SubscriberId,
        zone_ids: &[ZoneId],
    ) -> Result<Vec<ZoneId>, AlertError> {
        let now = Utc::now();
        for id in zone_ids {
            match self.zones.get(*id) {
                Some(zone) if zone.is_live(now) => {}
                _ => return Err(AlertError::NotFound(format!("zone {}", id))),
            }
        }

        let (change, channels) = {
            let _relations = self.relations_gate.lock();
            let change = self.subscriptions.replace(subscriber, zone_ids);
            let channels = self.registry.apply_relation_change(subscriber, &change);
            (change, channels)
        };
        info!(
            subscriber = %subscriber,
            added = %change.added.len(),
            removed = %change.removed.len(),
            live_channels = %channels,
            "subscriptions_updated"
        );
        Ok(self.subscriptions.zones_for(subscriber))
    }

    pub fn subscriptions_for(&self, subscriber: &SubscriberId) -> Vec<ZoneId> {
        self.subscriptions.zones_for(subscriber)
    }

    /// Bind a live channel to a subscriber's stored zone relations
    ///
    /// Serialized with `set_subscriptions`, so a relation removed while the
    /// channel attaches is never joined.
    pub fn attach_channel(
        &self,
        channel: ChannelId,
        subscriber: &SubscriberId,
    ) -> Result<Vec<ZoneId>, AlertError> {
        let _relations = self.relations_gate.lock();
        let zones = self.subscriptions.zones_for(subscriber);
        self.registry.attach(channel, subscriber, &zones)?;
        Ok(zones)
    }

    // ---------------------------------------------------------------------
    // Queries
    // ---------------------------------------------------------------------

    pub async fn notifications(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError> {
        self.bounded_store("query", self.store.query(window, limit)).await
    }

    /// Published notifications addressed to a subscriber or its zones
    pub async fn notifications_for(
        &self,
        subscriber: &SubscriberId,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError> {
        let audience = Audience {
            subscriber: subscriber.clone(),
            zones: self.subscriptions.zones_for(subscriber),
        };
        self.bounded_store("query_for", self.store.query_for(&audience, unread_only, limit)).await
    }

    pub async fn mark_read(&self, id: &NotificationId) -> Result<Notification, AlertError> {
        self.bounded_store("mark_read", self.store.mark_read(id)).await
    }

    pub async fn notification_stats(&self) -> Result<NotificationStats, AlertError> {
        self.bounded_store("stats", self.store.stats()).await
    }

    pub fn detections(&self, filter: &DetectionFilter, limit: usize) -> Vec<DetectionRecord> {
        self.detections.query(filter, limit, Utc::now())
    }

    pub fn detection(&self, id: &str) -> Option<DetectionRecord> {
        self.detections.get(id)
    }

    pub fn detection_stats(&self, time: TimeFilter) -> DetectionStats {
        self.detections.stats(time, Utc::now())
    }

    pub fn verify_detection(&self, id: &str, verified: bool) -> Result<DetectionRecord, AlertError> {
        let record = self.detections.verify(id, verified)?;
        info!(event_id = %id, verified = %verified, "detection_verified");
        Ok(record)
    }

    /// Snapshot metrics with the current gauges filled in
    pub fn metrics_summary(&self) -> MetricsSummary {
        self.metrics.report(self.zones.active_count(), self.registry.live_channels())
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Bound a store call; caller mistakes pass through, anything else is
    /// reported as `StoreUnavailable`
    async fn bounded_store<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, AlertError>>,
    ) -> Result<T, AlertError> {
        match tokio::time::timeout(self.store_timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e @ (AlertError::NotFound(_)
            | AlertError::Validation { .. }
            | AlertError::InvalidArgument(_)))) => Err(e),
            Ok(Err(AlertError::StoreUnavailable(reason))) => {
                self.metrics.record_store_error();
                warn!(op = %op, reason = %reason, "store_call_failed");
                Err(AlertError::StoreUnavailable(reason))
            }
            Ok(Err(e)) => {
                self.metrics.record_store_error();
                warn!(op = %op, error = %e, "store_call_failed");
                Err(AlertError::StoreUnavailable(e.to_string()))
            }
            Err(_) => {
                self.metrics.record_store_error();
                warn!(op = %op, timeout_ms = %self.store_timeout.as_millis(), "store_call_timeout");
                Err(AlertError::StoreUnavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.store_timeout.as_millis()
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::offset_north;
    use crate::domain::types::Point;
    use crate::services::notifier::InMemoryNotificationStore;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tempfile::tempdir;

    const BONDI: (f64, f64) = (-33.8915, 151.2767);

    struct Harness {
        pipeline: AlertPipeline,
        store: Arc<InMemoryNotificationStore>,
        bondi: Zone,
        _media: tempfile::TempDir,
    }

    fn harness() -> (Harness, PresenceWorker) {
        let media = tempdir().unwrap();
        let config = Config::default()
            .with_timeouts_ms(200, 200)
            .with_journal_file("")
            .with_media_dir(media.path().to_str().unwrap());
        let zones = Arc::new(ZoneDirectory::new(None));
        let bondi = zones
            .create(
                ZoneSpec::new("Bondi Beach", Point::new(BONDI.0, BONDI.1).unwrap(), 500.0)
                    .with_alert_level(AlertLevel::High),
            )
            .unwrap();
        let store = Arc::new(InMemoryNotificationStore::new(None));
        let (pipeline, worker) =
            AlertPipeline::new(&config, zones, store.clone(), None, Arc::new(Metrics::new()));
        (Harness { pipeline, store, bondi, _media: media }, worker)
    }

    fn detection(confidence: f64) -> DetectionInput {
        DetectionInput::new(BONDI.0, BONDI.1, "Great White", confidence)
    }

    #[tokio::test]
    async fn test_confident_detection_published_once() {
        let (h, _worker) = harness();
        let (ch, mut rx) = h.pipeline.registry().open();
        h.pipeline.registry().subscribe(ch, h.bondi.id).unwrap();

        let receipt = h.pipeline.report_detection(detection(95.0)).await.unwrap();
        assert_eq!(receipt.zone_id, Some(h.bondi.id));
        assert_eq!(receipt.alert_level, AlertLevel::High);
        assert_eq!(receipt.delivered_count, 1);
        assert_eq!(h.store.len(), 1);

        let pushed = rx.try_recv().unwrap();
        assert_eq!(pushed.id, receipt.notification_id);
        assert!(pushed.body.contains("Bondi Beach"));
        assert!(rx.try_recv().is_err());

        let record = h.pipeline.detection(&receipt.detection_id).unwrap();
        assert!(record.alert_sent);
        assert_eq!(record.zone_name, "Bondi Beach");
    }

    #[tokio::test]
    async fn test_low_confidence_stored_not_published() {
        let (h, _worker) = harness();
        let (ch, mut rx) = h.pipeline.registry().open();
        h.pipeline.registry().subscribe(ch, h.bondi.id).unwrap();

        let receipt = h.pipeline.report_detection(detection(40.0)).await.unwrap();
        assert_eq!(receipt.alert_level, AlertLevel::Medium);
        assert_eq!(receipt.delivered_count, 0);
        assert_eq!(h.store.len(), 1);
        assert!(rx.try_recv().is_err());
        assert!(!h.pipeline.detection(&receipt.detection_id).unwrap().alert_sent);
    }

    #[tokio::test]
    async fn test_retried_detection_dedupes() {
        let (h, _worker) = harness();
        let (ch, mut rx) = h.pipeline.registry().open();
        h.pipeline.registry().subscribe(ch, h.bondi.id).unwrap();

        let input = detection(95.0).with_detection_id("drone-7-0001");
        let first = h.pipeline.report_detection(input.clone()).await.unwrap();
        let second = h.pipeline.report_detection(input).await.unwrap();

        assert_eq!(first.notification_id, second.notification_id);
        assert_eq!(h.store.len(), 1);
        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_detection_outside_zones_resolves_nearest() {
        let (h, _worker) = harness();
        let far = offset_north(h.bondi.center, 5_000.0);
        let input = DetectionInput::new(far.latitude, far.longitude, "Bull", 90.0);

        let receipt = h.pipeline.report_detection(input).await.unwrap();
        assert_eq!(receipt.zone_id, Some(h.bondi.id));
    }

    #[tokio::test]
    async fn test_no_zones_means_unknown_zone_and_no_publish() {
        let (h, _worker) = harness();
        h.pipeline.deactivate_zone(h.bondi.id).unwrap();

        let receipt = h.pipeline.report_detection(detection(95.0)).await.unwrap();
        assert_eq!(receipt.zone_id, None);
        assert_eq!(receipt.delivered_count, 0);

        let stored = h.store.get(&receipt.notification_id).await.unwrap().unwrap();
        assert!(stored.body.contains("Unknown Zone"));
    }

    #[tokio::test]
    async fn test_invalid_detection_rejected() {
        let (h, _worker) = harness();
        let err = h.pipeline.report_detection(detection(120.0)).await.unwrap_err();
        assert!(matches!(err, AlertError::Validation { field: "confidence", .. }));
        assert!(h.store.is_empty());
        assert_eq!(h.pipeline.metrics().detections_total(), 0);
    }

    #[tokio::test]
    async fn test_closed_channel_not_counted() {
        let (h, _worker) = harness();
        let (live, _rx_live) = h.pipeline.registry().open();
        let (gone, rx_gone) = h.pipeline.registry().open();
        h.pipeline.registry().subscribe(live, h.bondi.id).unwrap();
        h.pipeline.registry().subscribe(gone, h.bondi.id).unwrap();
        drop(rx_gone);

        let receipt = h.pipeline.report_detection(detection(95.0)).await.unwrap();
        assert_eq!(receipt.delivered_count, 1);
        assert_eq!(h.pipeline.metrics().deliveries_missed(), 1);

        h.pipeline.registry().on_channel_closed(gone);
        assert_eq!(h.pipeline.registry().members(h.bondi.id), vec![live]);
    }

    struct SlowLookup;

    #[async_trait]
    impl ZoneLookup for SlowLookup {
        async fn nearest(&self, _: Point, _: DateTime<Utc>) -> Result<Option<Zone>, AlertError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(None)
        }

        async fn containing(&self, _: Point, _: DateTime<Utc>) -> Result<Vec<Zone>, AlertError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(Vec::new())
        }

        async fn list_active(&self, _: DateTime<Utc>) -> Result<Vec<Zone>, AlertError> {
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn test_directory_timeout_still_persists() {
        let (h, _worker) = harness();
        let Harness { pipeline, store, .. } = h;
        let pipeline = pipeline.with_lookup(Arc::new(SlowLookup));

        let err = pipeline.report_detection(detection(95.0)).await.unwrap_err();
        assert!(matches!(err, AlertError::DirectoryUnavailable(_)));
        assert_eq!(pipeline.metrics().directory_errors(), 1);

        let stored = store.query(TimeWindow::all(), 10).await.unwrap();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].zone_id, None);
        assert_eq!(stored[0].delivered_count, 0);

        let err = pipeline
            .report_position(PositionInput::new("watch-1", BONDI.0, BONDI.1))
            .await
            .unwrap_err();
        assert!(matches!(err, AlertError::DirectoryUnavailable(_)));
    }

    /// Fails the first nearest-zone lookup, then answers from the directory
    struct FlakyLookup {
        zones: Arc<ZoneDirectory>,
        failed: AtomicBool,
    }

    #[async_trait]
    impl ZoneLookup for FlakyLookup {
        async fn nearest(&self, point: Point, now: DateTime<Utc>) -> Result<Option<Zone>, AlertError> {
            if !self.failed.swap(true, Ordering::SeqCst) {
                return Err(AlertError::DirectoryUnavailable("connection reset".into()));
            }
            ZoneLookup::nearest(self.zones.as_ref(), point, now).await
        }

        async fn containing(&self, point: Point, now: DateTime<Utc>) -> Result<Vec<Zone>, AlertError> {
            ZoneLookup::containing(self.zones.as_ref(), point, now).await
        }

        async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Zone>, AlertError> {
            ZoneLookup::list_active(self.zones.as_ref(), now).await
        }
    }

    #[tokio::test]
    async fn test_retry_after_directory_failure_publishes_once() {
        let (h, _worker) = harness();
        let Harness { pipeline, store, bondi, _media } = h;
        let flaky = FlakyLookup { zones: pipeline.zones().clone(), failed: AtomicBool::new(false) };
        let pipeline = pipeline.with_lookup(Arc::new(flaky));
        let (ch, mut rx) = pipeline.registry().open();
        pipeline.registry().subscribe(ch, bondi.id).unwrap();

        let input = detection(95.0).with_detection_id("drone-7-0042");
        let err = pipeline.report_detection(input.clone()).await.unwrap_err();
        assert!(matches!(err, AlertError::DirectoryUnavailable(_)));
        assert!(rx.try_recv().is_err());

        let retry = pipeline.report_detection(input.clone()).await.unwrap();
        assert_eq!(retry.zone_id, Some(bondi.id));
        assert_eq!(retry.alert_level, AlertLevel::High);
        assert_eq!(retry.delivered_count, 1);
        let pushed = rx.try_recv().unwrap();
        assert_eq!(pushed.id, retry.notification_id);
        assert!(pushed.body.contains("Bondi Beach"));

        let again = pipeline.report_detection(input).await.unwrap();
        assert_eq!(again.notification_id, retry.notification_id);
        assert_eq!(again.delivered_count, 1);
        assert!(rx.try_recv().is_err());

        assert_eq!(store.len(), 1);
        let stored = store.get(&retry.notification_id).await.unwrap().unwrap();
        assert!(stored.published);
        assert!(stored.body.contains("Bondi Beach"));
        assert!(pipeline.detection("drone-7-0042").unwrap().alert_sent);
    }

    #[tokio::test]
    async fn test_unpublished_low_confidence_retry_stays_quiet() {
        let (h, _worker) = harness();
        let (ch, mut rx) = h.pipeline.registry().open();
        h.pipeline.registry().subscribe(ch, h.bondi.id).unwrap();

        let input = detection(40.0).with_detection_id("drone-7-0043");
        h.pipeline.report_detection(input.clone()).await.unwrap();
        let retry = h.pipeline.report_detection(input).await.unwrap();
        assert_eq!(retry.delivered_count, 0);
        assert!(rx.try_recv().is_err());
    }

    struct DownStore;

    #[async_trait]
    impl NotificationStore for DownStore {
        async fn persist(&self, _: Notification) -> Result<PersistOutcome, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn resolve_zone(
            &self,
            _: &NotificationId,
            _: &Notification,
        ) -> Result<Notification, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn claim_publish(&self, _: &NotificationId) -> Result<bool, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn record_delivery(&self, _: &NotificationId, _: u64) -> Result<Notification, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn get(&self, _: &NotificationId) -> Result<Option<Notification>, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn query(&self, _: TimeWindow, _: usize) -> Result<Vec<Notification>, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn query_for(
            &self,
            _: &Audience,
            _: bool,
            _: usize,
        ) -> Result<Vec<Notification>, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn mark_read(&self, _: &NotificationId) -> Result<Notification, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }

        async fn stats(&self) -> Result<NotificationStats, AlertError> {
            Err(AlertError::StoreUnavailable("connection refused".into()))
        }
    }

    #[tokio::test]
    async fn test_store_failure_keeps_detection() {
        let config = Config::default().with_journal_file("");
        let zones = Arc::new(ZoneDirectory::new(None));
        let (pipeline, _worker) =
            AlertPipeline::new(&config, zones, Arc::new(DownStore), None, Arc::new(Metrics::new()));

        let input = detection(95.0).with_detection_id("DET-keep");
        let err = pipeline.report_detection(input).await.unwrap_err();
        assert!(matches!(err, AlertError::StoreUnavailable(_)));
        assert!(pipeline.detection("DET-keep").is_some());
        assert_eq!(pipeline.metrics().store_errors(), 1);
    }

    #[tokio::test]
    async fn test_position_answer_and_history() {
        let (h, worker) = harness();
        tokio::spawn(worker.run());

        let inside = h
            .pipeline
            .report_position(PositionInput::new("watch-1", BONDI.0, BONDI.1))
            .await
            .unwrap();
        assert!(inside.is_in_geofence);
        assert_eq!(inside.zone_ids, vec![h.bondi.id]);
        assert_eq!(inside.current_geofence, Some(h.bondi.id));

        let far = offset_north(h.bondi.center, 2_000.0);
        let outside = h
            .pipeline
            .report_position(PositionInput::new("watch-1", far.latitude, far.longitude))
            .await
            .unwrap();
        assert!(!outside.is_in_geofence);
        assert!(outside.current_geofence.is_none());

        let mut history = Vec::new();
        for _ in 0..50 {
            history = h.pipeline.location_history("watch-1", 10);
            if history.len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(history.len(), 2);
        assert!(!history[0].is_in_geofence);
        assert!(history[1].is_in_geofence);
    }

    #[tokio::test]
    async fn test_set_subscriptions_updates_live_channels() {
        let (h, _worker) = harness();
        let device = SubscriberId("device-1".into());
        let (ch, mut rx) = h.pipeline.registry().open();
        assert!(h.pipeline.attach_channel(ch, &device).unwrap().is_empty());

        let err = h.pipeline.set_subscriptions(&device, &[ZoneId(99)]).unwrap_err();
        assert!(matches!(err, AlertError::NotFound(_)));
        assert!(h.pipeline.subscriptions_for(&device).is_empty());

        let zones = h.pipeline.set_subscriptions(&device, &[h.bondi.id]).unwrap();
        assert_eq!(zones, vec![h.bondi.id]);
        assert_eq!(h.pipeline.registry().topics_of(ch), vec![h.bondi.id]);

        h.pipeline.report_detection(detection(88.0)).await.unwrap();
        assert!(rx.try_recv().is_ok());

        h.pipeline.set_subscriptions(&device, &[]).unwrap();
        assert!(h.pipeline.registry().topics_of(ch).is_empty());
    }

    #[tokio::test]
    async fn test_zone_lifecycle_and_stats() {
        let (h, _worker) = harness();
        let spec = ZoneSpec::new("Manly Beach", Point::new(-33.7969, 151.2877).unwrap(), 400.0);
        let manly = h.pipeline.create_zone(spec).unwrap();
        assert_eq!(h.pipeline.list_zones().len(), 2);

        h.pipeline.deactivate_zone(manly.id).unwrap();
        let active: Vec<ZoneId> = h.pipeline.list_zones().iter().map(|z| z.id).collect();
        assert_eq!(active, vec![h.bondi.id]);
        assert!(matches!(h.pipeline.deactivate_zone(manly.id), Err(AlertError::NotFound(_))));

        let stats = h.pipeline.zone_stats();
        assert_eq!(stats.total_geofences, 2);
        assert_eq!(stats.active_geofences, 1);
    }

    #[test]
    fn test_attach_races_subscription_changes() {
        let (h, _worker) = harness();
        let device = SubscriberId("device-1".into());
        let mut channels = Vec::new();

        for round in 0..200 {
            let (ch, rx) = h.pipeline.registry().open();
            channels.push((ch, rx));
            let zones = if round % 2 == 0 { vec![h.bondi.id] } else { Vec::new() };

            std::thread::scope(|scope| {
                scope.spawn(|| h.pipeline.attach_channel(ch, &device).unwrap());
                scope.spawn(|| h.pipeline.set_subscriptions(&device, &zones).unwrap());
            });

            let expected = h.pipeline.subscriptions_for(&device);
            for (ch, _) in &channels {
                assert_eq!(h.pipeline.registry().topics_of(*ch), expected, "round {}", round);
            }
        }
    }

    #[tokio::test]
    async fn test_operator_message_to_zone_subscribers() {
        let (h, _worker) = harness();
        let device = SubscriberId("device-1".into());
        let (ch, mut rx) = h.pipeline.registry().open();
        h.pipeline.set_subscriptions(&device, &[h.bondi.id]).unwrap();
        h.pipeline.attach_channel(ch, &device).unwrap();

        let message = OperatorMessage {
            title: Some("Beach closed".into()),
            body: Some("Lifeguards have closed the beach".into()),
            zone_id: Some(h.bondi.id),
            ..Default::default()
        };
        let receipt = h.pipeline.send_message(message).await.unwrap();
        assert_eq!(receipt.recipients, 1);
        assert_eq!(receipt.delivered_count, 1);
        assert_eq!(receipt.notification.zone_id, Some(h.bondi.id));
        assert_eq!(receipt.notification.alert_level, AlertLevel::High);
        assert!(receipt.notification.published);

        let pushed = rx.try_recv().unwrap();
        assert_eq!(pushed.id, receipt.notification.id);
        assert_eq!(pushed.title, "Beach closed");

        let visible = h.pipeline.notifications_for(&device, false, 10).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, receipt.notification.id);

        h.pipeline.mark_read(&receipt.notification.id).await.unwrap();
        assert!(h.pipeline.notifications_for(&device, true, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operator_message_to_one_subscriber() {
        let (h, _worker) = harness();
        let target = SubscriberId("device-2".into());
        let bystander = SubscriberId("device-3".into());
        let (ch_target, mut rx_target) = h.pipeline.registry().open();
        let (ch_other, mut rx_other) = h.pipeline.registry().open();
        h.pipeline.attach_channel(ch_target, &target).unwrap();
        h.pipeline.attach_channel(ch_other, &bystander).unwrap();

        let message = OperatorMessage {
            title: Some("Check in".into()),
            body: Some("Please confirm you are out of the water".into()),
            subscriber_id: Some(target.clone()),
            latitude: Some(BONDI.0),
            longitude: Some(BONDI.1),
            ..Default::default()
        };
        let receipt = h.pipeline.send_message(message).await.unwrap();
        assert_eq!(receipt.recipients, 1);
        assert_eq!(receipt.delivered_count, 1);
        assert_eq!(receipt.notification.recipient, Some(target.clone()));
        assert!(rx_target.try_recv().is_ok());
        assert!(rx_other.try_recv().is_err());

        assert_eq!(h.pipeline.notifications_for(&target, false, 10).await.unwrap().len(), 1);
        assert!(h.pipeline.notifications_for(&bystander, false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_operator_message_rejections() {
        let (h, _worker) = harness();

        let unknown_zone = OperatorMessage {
            title: Some("Beach closed".into()),
            body: Some("Closed".into()),
            zone_id: Some(ZoneId(99)),
            ..Default::default()
        };
        let err = h.pipeline.send_message(unknown_zone).await.unwrap_err();
        assert!(matches!(err, AlertError::NotFound(_)));

        let untitled = OperatorMessage {
            body: Some("Closed".into()),
            zone_id: Some(h.bondi.id),
            ..Default::default()
        };
        let err = h.pipeline.send_message(untitled).await.unwrap_err();
        assert!(matches!(err, AlertError::Validation { field: "title", .. }));
        assert!(h.store.is_empty());
    }
}

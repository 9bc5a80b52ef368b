//! Notification synthesis and storage
//!
//! `Synthesizer` turns a detection plus its resolved zone into a notification
//! and decides whether it qualifies for live fan-out. `NotificationStore` is
//! the persistence seam; `InMemoryNotificationStore` is the bundled backend,
//! optionally backed by a JSONL journal for restart recovery.

use crate::domain::error::AlertError;
use crate::domain::event::DetectionEvent;
use crate::domain::notification::Notification;
use crate::domain::types::{AlertLevel, EventId, NotificationId, SubscriberId, TimeWindow, ZoneId};
use crate::domain::zone::Zone;
use crate::io::journal::Journal;
use crate::services::ingestion::validate_point;
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, info};

/// Zone name used when a detection resolved to no zone
pub const UNKNOWN_ZONE: &str = "Unknown Zone";

pub struct Synthesizer {
    /// Strictly above this confidence: high alert, eligible for fan-out
    alert_threshold: f64,
    /// Below this confidence a notification is stored but never published
    min_confidence: f64,
}

impl Synthesizer {
    pub fn new(alert_threshold: f64, min_confidence: f64) -> Self {
        Self { alert_threshold, min_confidence }
    }

    pub fn alert_level(&self, confidence: f64) -> AlertLevel {
        if confidence > self.alert_threshold {
            AlertLevel::High
        } else {
            AlertLevel::Medium
        }
    }

    pub fn synthesize(&self, event: &DetectionEvent, zone: Option<&Zone>) -> Notification {
        let zone_name = zone.map_or(UNKNOWN_ZONE, |z| z.name.as_str());
        let size = event.size.as_deref().map(|s| format!("{} ", s)).unwrap_or_default();
        let reporter = event.source.as_deref().map(|s| format!(" by {}", s)).unwrap_or_default();

        Notification {
            id: NotificationId::generate(),
            source_event_id: event.id.clone(),
            zone_id: zone.map(|z| z.id),
            title: format!("SHARK DETECTED: {}", event.category),
            body: format!(
                "A {}{} shark has been detected near {}{} ({:.0}% confidence). \
                 Please exit the water immediately!",
                size, event.category, zone_name, reporter, event.confidence
            ),
            alert_level: self.alert_level(event.confidence),
            point: event.point,
            created_at: Utc::now(),
            delivered_count: 0,
            published: false,
            recipient: None,
            is_read: false,
            read_at: None,
        }
    }

    /// Only confident detections with a resolved zone are fanned out
    pub fn should_publish(&self, event: &DetectionEvent, zone: Option<&Zone>) -> bool {
        zone.is_some()
            && event.confidence >= self.min_confidence
            && event.confidence > self.alert_threshold
    }

    /// Build an operator message addressed to `zone` or to its subscriber
    ///
    /// Location defaults to the zone centre; a message for a single
    /// subscriber must carry its own coordinates.
    pub fn compose(
        &self,
        message: OperatorMessage,
        zone: Option<&Zone>,
    ) -> Result<Notification, AlertError> {
        let title = non_empty(message.title, "title")?;
        let body = non_empty(message.body, "message")?;
        if zone.is_none() && message.subscriber_id.is_none() {
            return Err(AlertError::validation("zoneId", "zoneId or subscriberId is required"));
        }

        let point = match (message.latitude, message.longitude, zone) {
            (None, None, Some(zone)) => zone.center,
            (latitude, longitude, _) => validate_point(latitude, longitude)?,
        };

        Ok(Notification {
            id: NotificationId::generate(),
            source_event_id: EventId::operator(),
            zone_id: zone.map(|z| z.id),
            title,
            body,
            alert_level: message
                .alert_level
                .unwrap_or_else(|| zone.map_or(AlertLevel::Medium, |z| z.alert_level)),
            point,
            created_at: Utc::now(),
            delivered_count: 0,
            published: false,
            recipient: if zone.is_some() { None } else { message.subscriber_id },
            is_read: false,
            read_at: None,
        })
    }
}

fn non_empty(value: Option<String>, field: &'static str) -> Result<String, AlertError> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AlertError::missing(field))
}

/// Operator-composed message, sent to a zone's subscribers or to one subscriber
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorMessage {
    pub title: Option<String>,
    #[serde(alias = "message")]
    pub body: Option<String>,
    pub alert_level: Option<AlertLevel>,
    #[serde(alias = "geofenceId")]
    pub zone_id: Option<ZoneId>,
    #[serde(alias = "userId", alias = "deviceId")]
    pub subscriber_id: Option<SubscriberId>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

/// Result of a persist call
#[derive(Debug, Clone, PartialEq)]
pub struct PersistOutcome {
    pub notification: Notification,
    /// False when an earlier persist for the same source event won
    pub created: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationStats {
    pub total: usize,
    pub unread: usize,
    pub high_alert: usize,
    pub delivered: u64,
}

/// The published notifications one subscriber can see: those addressed to
/// it and those fanned out to a zone it subscribes to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Audience {
    pub subscriber: SubscriberId,
    pub zones: Vec<ZoneId>,
}

impl Audience {
    pub fn includes(&self, n: &Notification) -> bool {
        n.published
            && (n.recipient.as_ref() == Some(&self.subscriber)
                || n.zone_id.is_some_and(|z| self.zones.contains(&z)))
    }
}

/// Persistence seam for notifications
#[async_trait]
pub trait NotificationStore: Send + Sync {
    /// Idempotent on `source_event_id`: a repeat returns the stored record
    async fn persist(&self, notification: Notification) -> Result<PersistOutcome, AlertError>;

    /// Fill in zone, title, body and level from `resolved` if the stored
    /// record has no zone yet; otherwise return it unchanged
    async fn resolve_zone(
        &self,
        id: &NotificationId,
        resolved: &Notification,
    ) -> Result<Notification, AlertError>;

    /// Claim the right to fan a notification out
    ///
    /// True for exactly one caller per unpublished notification.
    async fn claim_publish(&self, id: &NotificationId) -> Result<bool, AlertError>;

    /// Add `count` deliveries and mark the notification published; the
    /// counter never decreases
    async fn record_delivery(
        &self,
        id: &NotificationId,
        count: u64,
    ) -> Result<Notification, AlertError>;

    async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, AlertError>;

    /// Notifications created inside `window`, newest first
    async fn query(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError>;

    /// Notifications visible to one subscriber, newest first
    async fn query_for(
        &self,
        audience: &Audience,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError>;

    async fn mark_read(&self, id: &NotificationId) -> Result<Notification, AlertError>;

    async fn stats(&self) -> Result<NotificationStats, AlertError>;
}

#[derive(Default)]
struct StoreInner {
    items: Vec<Notification>,
    by_id: FxHashMap<NotificationId, usize>,
    by_event: FxHashMap<EventId, usize>,
    /// In-flight fan-outs; never journaled
    claimed: FxHashSet<NotificationId>,
}

impl StoreInner {
    fn insert(&mut self, notification: Notification) -> usize {
        let idx = self.items.len();
        self.by_id.insert(notification.id.clone(), idx);
        self.by_event.insert(notification.source_event_id.clone(), idx);
        self.items.push(notification);
        idx
    }

    fn find(&self, id: &NotificationId) -> Result<&Notification, AlertError> {
        match self.by_id.get(id) {
            Some(&idx) => Ok(&self.items[idx]),
            None => Err(AlertError::NotFound(format!("notification {}", id))),
        }
    }

    fn replace(&mut self, notification: Notification) {
        if let Some(&idx) = self.by_id.get(&notification.id) {
            self.items[idx] = notification;
        }
    }

    /// Apply one journaled snapshot; returns true if it added a notification
    ///
    /// Merges monotonically so snapshots replay correctly in any order.
    fn restore(&mut self, snapshot: Notification) -> bool {
        let Some(&idx) = self.by_id.get(&snapshot.id) else {
            if self.by_event.contains_key(&snapshot.source_event_id) {
                return false;
            }
            self.insert(snapshot);
            return true;
        };

        let current = &mut self.items[idx];
        current.delivered_count = current.delivered_count.max(snapshot.delivered_count);
        current.published |= snapshot.published;
        if snapshot.is_read && !current.is_read {
            current.is_read = true;
            current.read_at = snapshot.read_at;
        }
        if current.zone_id.is_none() && snapshot.zone_id.is_some() {
            current.zone_id = snapshot.zone_id;
            current.title = snapshot.title;
            current.body = snapshot.body;
            current.alert_level = snapshot.alert_level;
        }
        false
    }
}

/// Append a snapshot; called on the blocking pool
fn journal_snapshot(journal: Option<&Journal>, snapshot: &Notification) -> Result<(), AlertError> {
    let Some(journal) = journal else {
        return Ok(());
    };
    journal.append(snapshot).map_err(|e| {
        error!(
            notification_id = %snapshot.id,
            file = %journal.path().display(),
            error = %e,
            "journal_append_failed"
        );
        AlertError::StoreUnavailable(format!("journal write failed: {}", e))
    })
}

/// In-memory notification store with an optional JSONL journal
///
/// Reads only take the state lock. Writes are serialized by `write_gate`
/// and run on the blocking pool: the snapshot is computed under the state
/// lock, journaled with the lock released, then committed. The gate guard
/// moves into the blocking task, so a caller that gives up early (timeout,
/// dropped request) cannot let a second writer in before the commit lands.
pub struct InMemoryNotificationStore {
    inner: Arc<Mutex<StoreInner>>,
    journal: Option<Journal>,
    write_gate: Arc<tokio::sync::Mutex<()>>,
}

impl InMemoryNotificationStore {
    pub fn new(journal: Option<Journal>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StoreInner::default())),
            journal,
            write_gate: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Rebuild state from the journal, keeping the first record per event
    /// and folding later snapshots into it
    pub fn restore_from_journal(&self) -> std::io::Result<usize> {
        let Some(journal) = &self.journal else {
            return Ok(0);
        };
        let snapshots = journal.load()?;
        let mut inner = self.inner.lock();
        let restored =
            snapshots.into_iter().map(|n| inner.restore(n)).filter(|added| *added).count();
        info!(restored = %restored, "notifications_restored");
        Ok(restored)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run one serialized write on the blocking pool
    async fn write<T, F>(&self, op: F) -> Result<T, AlertError>
    where
        T: Send + 'static,
        F: FnOnce(&Mutex<StoreInner>, Option<&Journal>) -> Result<T, AlertError> + Send + 'static,
    {
        let gate = self.write_gate.clone().lock_owned().await;
        let inner = self.inner.clone();
        let journal = self.journal.clone();
        tokio::task::spawn_blocking(move || {
            let _gate = gate;
            op(inner.as_ref(), journal.as_ref())
        })
        .await
        .map_err(|e| AlertError::StoreUnavailable(format!("store write task failed: {}", e)))?
    }

    /// Journal and commit `change` applied to notification `id`
    ///
    /// `change` returns `None` when there is nothing to write.
    async fn update<F>(&self, id: &NotificationId, change: F) -> Result<Notification, AlertError>
    where
        F: FnOnce(&Notification) -> Option<Notification> + Send + 'static,
    {
        let id = id.clone();
        self.write(move |inner, journal| {
            let current = inner.lock().find(&id)?.clone();
            let Some(next) = change(&current) else {
                return Ok(current);
            };
            journal_snapshot(journal, &next)?;
            inner.lock().replace(next.clone());
            Ok(next)
        })
        .await
    }
}

impl Default for InMemoryNotificationStore {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl NotificationStore for InMemoryNotificationStore {
    async fn persist(&self, notification: Notification) -> Result<PersistOutcome, AlertError> {
        self.write(move |inner, journal| {
            let existing = {
                let inner = inner.lock();
                inner.by_event.get(&notification.source_event_id).map(|&idx| inner.items[idx].clone())
            };
            if let Some(existing) = existing {
                debug!(
                    event_id = %existing.source_event_id,
                    notification_id = %existing.id,
                    "notification_dedup_hit"
                );
                return Ok(PersistOutcome { notification: existing, created: false });
            }

            // Durable before visible
            journal_snapshot(journal, &notification)?;
            inner.lock().insert(notification.clone());
            Ok(PersistOutcome { notification, created: true })
        })
        .await
    }

    async fn resolve_zone(
        &self,
        id: &NotificationId,
        resolved: &Notification,
    ) -> Result<Notification, AlertError> {
        let resolved = resolved.clone();
        self.update(id, move |current| {
            if current.zone_id.is_some() || resolved.zone_id.is_none() {
                return None;
            }
            Some(Notification {
                zone_id: resolved.zone_id,
                title: resolved.title,
                body: resolved.body,
                alert_level: resolved.alert_level,
                ..current.clone()
            })
        })
        .await
    }

    async fn claim_publish(&self, id: &NotificationId) -> Result<bool, AlertError> {
        let mut inner = self.inner.lock();
        if inner.find(id)?.published {
            return Ok(false);
        }
        Ok(inner.claimed.insert(id.clone()))
    }

    async fn record_delivery(
        &self,
        id: &NotificationId,
        count: u64,
    ) -> Result<Notification, AlertError> {
        let updated = self
            .update(id, move |current| {
                if current.published && count == 0 {
                    return None;
                }
                Some(Notification {
                    delivered_count: current.delivered_count.saturating_add(count),
                    published: true,
                    ..current.clone()
                })
            })
            .await?;
        self.inner.lock().claimed.remove(id);
        Ok(updated)
    }

    async fn get(&self, id: &NotificationId) -> Result<Option<Notification>, AlertError> {
        let inner = self.inner.lock();
        Ok(inner.by_id.get(id).map(|&idx| inner.items[idx].clone()))
    }

    async fn query(
        &self,
        window: TimeWindow,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError> {
        let mut matched: Vec<Notification> = {
            let inner = self.inner.lock();
            inner.items.iter().filter(|n| window.contains(n.created_at)).cloned().collect()
        };
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn query_for(
        &self,
        audience: &Audience,
        unread_only: bool,
        limit: usize,
    ) -> Result<Vec<Notification>, AlertError> {
        let mut matched: Vec<Notification> = {
            let inner = self.inner.lock();
            inner
                .items
                .iter()
                .filter(|n| audience.includes(n) && !(unread_only && n.is_read))
                .cloned()
                .collect()
        };
        matched.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        matched.truncate(limit);
        Ok(matched)
    }

    async fn mark_read(&self, id: &NotificationId) -> Result<Notification, AlertError> {
        self.update(id, |current| {
            (!current.is_read).then(|| Notification {
                is_read: true,
                read_at: Some(Utc::now()),
                ..current.clone()
            })
        })
        .await
    }

    async fn stats(&self) -> Result<NotificationStats, AlertError> {
        let inner = self.inner.lock();
        Ok(inner.items.iter().fold(NotificationStats::default(), |mut s, n| {
            s.total += 1;
            s.unread += usize::from(!n.is_read);
            s.high_alert += usize::from(n.alert_level == AlertLevel::High);
            s.delivered += n.delivered_count;
            s
        }))
    }
}

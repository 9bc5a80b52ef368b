//! Detection log
//!
//! Every accepted detection is recorded here before zone resolution, so an
//! event survives even when the directory or the notification store fails.
//! Records are keyed by event id; a retried report keeps the original record.

use crate::domain::error::AlertError;
use crate::domain::event::DetectionEvent;
use crate::domain::notification::Notification;
use crate::domain::types::{NotificationId, ZoneId};
use crate::domain::zone::Zone;
use crate::services::notifier::UNKNOWN_ZONE;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::Serialize;
use std::collections::BTreeMap;

/// Relative time filter used by the detection endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TimeFilter {
    LastHours(i64),
    #[default]
    All,
}

impl TimeFilter {
    /// `12h`, `2d`, `5d` or `all`; anything else means the last 24 hours
    pub fn parse(s: &str) -> Self {
        match s {
            "all" => TimeFilter::All,
            "12h" => TimeFilter::LastHours(12),
            "2d" => TimeFilter::LastHours(48),
            "5d" => TimeFilter::LastHours(120),
            _ => TimeFilter::LastHours(24),
        }
    }

    pub fn label(&self) -> String {
        match self {
            TimeFilter::All => "all".to_string(),
            TimeFilter::LastHours(h) if h % 24 == 0 => format!("{}d", h / 24),
            TimeFilter::LastHours(h) => format!("{}h", h),
        }
    }

    fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            TimeFilter::All => None,
            TimeFilter::LastHours(h) => Some(now - Duration::hours(*h)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct DetectionFilter {
    pub time: TimeFilter,
    pub zone_name: Option<String>,
    pub source: Option<String>,
    pub category: Option<String>,
}

impl DetectionFilter {
    fn matches(&self, record: &DetectionRecord, cutoff: Option<DateTime<Utc>>) -> bool {
        cutoff.map_or(true, |c| record.event.observed_at >= c)
            && self.zone_name.as_deref().map_or(true, |z| record.zone_name == z)
            && self.source.as_deref().map_or(true, |s| record.event.source.as_deref() == Some(s))
            && self.category.as_deref().map_or(true, |c| record.event.category == c)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionRecord {
    #[serde(flatten)]
    pub event: DetectionEvent,
    pub zone_id: Option<ZoneId>,
    pub zone_name: String,
    pub alert_sent: bool,
    pub is_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notification_id: Option<NotificationId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CountEntry {
    pub name: String,
    pub count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionStats {
    pub total_detections: usize,
    pub alerts_sent: usize,
    pub by_category: Vec<CountEntry>,
    pub by_source: Vec<CountEntry>,
    pub by_zone: Vec<CountEntry>,
    pub time_filter: String,
}

#[derive(Default)]
struct LogInner {
    records: Vec<DetectionRecord>,
    by_id: FxHashMap<String, usize>,
}

#[derive(Default)]
pub struct DetectionLog {
    inner: RwLock<LogInner>,
}

impl DetectionLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an accepted detection; returns false if the id was already known
    pub fn record(&self, event: &DetectionEvent) -> bool {
        let mut inner = self.inner.write();
        if inner.by_id.contains_key(&event.id.0) {
            return false;
        }
        let idx = inner.records.len();
        inner.by_id.insert(event.id.0.clone(), idx);
        inner.records.push(DetectionRecord {
            event: event.clone(),
            zone_id: None,
            zone_name: UNKNOWN_ZONE.to_string(),
            alert_sent: false,
            is_verified: false,
            notification_id: None,
        });
        true
    }

    /// Attach the resolved zone and the persisted notification
    pub fn attach(&self, event_id: &str, zone: Option<&Zone>, notification: &Notification) {
        self.update(event_id, |r| {
            if let Some(zone) = zone {
                r.zone_id = Some(zone.id);
                r.zone_name = zone.name.clone();
            }
            r.notification_id = Some(notification.id.clone());
        });
    }

    pub fn mark_alerted(&self, event_id: &str) {
        self.update(event_id, |r| r.alert_sent = true);
    }

    pub fn verify(&self, event_id: &str, verified: bool) -> Result<DetectionRecord, AlertError> {
        self.update(event_id, |r| r.is_verified = verified)
            .ok_or_else(|| AlertError::NotFound(format!("detection {}", event_id)))
    }

    pub fn get(&self, event_id: &str) -> Option<DetectionRecord> {
        let inner = self.inner.read();
        inner.by_id.get(event_id).map(|&idx| inner.records[idx].clone())
    }

    /// Matching detections, newest observation first
    pub fn query(
        &self,
        filter: &DetectionFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Vec<DetectionRecord> {
        let cutoff = filter.time.cutoff(now);
        let mut matched: Vec<DetectionRecord> = self
            .inner
            .read()
            .records
            .iter()
            .filter(|r| filter.matches(r, cutoff))
            .cloned()
            .collect();
        matched.sort_by(|a, b| b.event.observed_at.cmp(&a.event.observed_at));
        matched.truncate(limit);
        matched
    }

    pub fn stats(&self, time: TimeFilter, now: DateTime<Utc>) -> DetectionStats {
        let cutoff = time.cutoff(now);
        let inner = self.inner.read();

        let mut total = 0;
        let mut alerts = 0;
        let mut by_category: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_source: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_zone: BTreeMap<String, usize> = BTreeMap::new();

        let in_window = |r: &&DetectionRecord| cutoff.map_or(true, |c| r.event.observed_at >= c);
        for r in inner.records.iter().filter(in_window) {
            total += 1;
            alerts += usize::from(r.alert_sent);
            *by_category.entry(r.event.category.clone()).or_default() += 1;
            *by_source
                .entry(r.event.source.clone().unwrap_or_else(|| "unknown".to_string()))
                .or_default() += 1;
            *by_zone.entry(r.zone_name.clone()).or_default() += 1;
        }

        let to_entries = |m: BTreeMap<String, usize>| -> Vec<CountEntry> {
            m.into_iter().map(|(name, count)| CountEntry { name, count }).collect()
        };

        DetectionStats {
            total_detections: total,
            alerts_sent: alerts,
            by_category: to_entries(by_category),
            by_source: to_entries(by_source),
            by_zone: to_entries(by_zone),
            time_filter: time.label(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn update(
        &self,
        event_id: &str,
        f: impl FnOnce(&mut DetectionRecord),
    ) -> Option<DetectionRecord> {
        let mut inner = self.inner.write();
        let idx = *inner.by_id.get(event_id)?;
        let record = &mut inner.records[idx];
        f(record);
        Some(record.clone())
    }
}

//! Per-subject zone presence and location history
//!
//! The resolver is stateless, so entry/exit detection lives here: each
//! position report carries the set of zones containing it, and the tracker
//! diffs that set against the subject's previous one.
//!
//! Key behaviors:
//! - Entered transitions are emitted in directory order, then exits
//! - Reports older than the subject's last applied report only update history
//! - History is bounded per subject and returned newest first

use crate::domain::event::PositionReport;
use crate::domain::types::ZoneId;
use crate::domain::zone::Zone;
use crate::infra::metrics::Metrics;
use crate::io::egress_channel::EgressSender;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::Serialize;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionKind {
    Entered,
    Exited,
}

impl TransitionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Entered => "zone_entered",
            TransitionKind::Exited => "zone_exited",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ZoneTransition {
    pub subject_id: String,
    pub zone_id: ZoneId,
    pub zone_name: String,
    pub kind: TransitionKind,
    pub at: DateTime<Utc>,
}

/// One stored location sample
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationRecord {
    pub latitude: f64,
    pub longitude: f64,
    pub is_in_geofence: bool,
    pub zone_ids: Vec<ZoneId>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SubjectState {
    /// Zones containing the last applied report, directory order
    inside: SmallVec<[(ZoneId, String); 4]>,
    last_observed: Option<DateTime<Utc>>,
    /// Oldest at the front
    history: VecDeque<LocationRecord>,
}

pub struct PresenceTracker {
    subjects: FxHashMap<String, SubjectState>,
    history_limit: usize,
}

impl PresenceTracker {
    pub fn new(history_limit: usize) -> Self {
        Self { subjects: FxHashMap::default(), history_limit }
    }

    /// Apply a report with its containing zones and return the transitions
    pub fn apply(&mut self, report: &PositionReport, zones: &[Zone]) -> Vec<ZoneTransition> {
        let limit = self.history_limit;
        let state = self.subjects.entry(report.subject_id.clone()).or_default();

        if limit > 0 {
            if state.history.len() >= limit {
                state.history.pop_front();
            }
            state.history.push_back(LocationRecord {
                latitude: report.point.latitude,
                longitude: report.point.longitude,
                is_in_geofence: !zones.is_empty(),
                zone_ids: zones.iter().map(|z| z.id).collect(),
                timestamp: report.observed_at,
            });
        }

        if state.last_observed.is_some_and(|last| report.observed_at < last) {
            debug!(subject = %report.subject_id, "position_out_of_order");
            return Vec::new();
        }
        state.last_observed = Some(report.observed_at);

        let mut transitions = Vec::new();
        for zone in zones {
            if !state.inside.iter().any(|(id, _)| *id == zone.id) {
                transitions.push(ZoneTransition {
                    subject_id: report.subject_id.clone(),
                    zone_id: zone.id,
                    zone_name: zone.name.clone(),
                    kind: TransitionKind::Entered,
                    at: report.observed_at,
                });
            }
        }
        for (id, name) in &state.inside {
            if !zones.iter().any(|z| z.id == *id) {
                transitions.push(ZoneTransition {
                    subject_id: report.subject_id.clone(),
                    zone_id: *id,
                    zone_name: name.clone(),
                    kind: TransitionKind::Exited,
                    at: report.observed_at,
                });
            }
        }

        state.inside = zones.iter().map(|z| (z.id, z.name.clone())).collect();
        transitions
    }

    /// Location history for a subject, newest first
    pub fn history(&self, subject_id: &str, limit: usize) -> Vec<LocationRecord> {
        self.subjects
            .get(subject_id)
            .map(|s| s.history.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    pub fn current_zones(&self, subject_id: &str) -> Vec<ZoneId> {
        self.subjects
            .get(subject_id)
            .map(|s| s.inside.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }

    /// Number of subjects currently inside at least one zone
    pub fn subjects_in_zones(&self) -> usize {
        self.subjects.values().filter(|s| !s.inside.is_empty()).count()
    }
}

/// Position report queued for the presence worker
#[derive(Debug)]
pub struct PresenceUpdate {
    pub report: PositionReport,
    pub zones: Vec<Zone>,
    /// When the update was enqueued (for queue delay measurement)
    pub enqueued_at: Instant,
}

/// Worker that applies position updates off the request path
pub struct PresenceWorker {
    tracker: Arc<Mutex<PresenceTracker>>,
    rx: mpsc::Receiver<PresenceUpdate>,
    egress: Option<EgressSender>,
    metrics: Arc<Metrics>,
}

impl PresenceWorker {
    pub fn new(
        tracker: Arc<Mutex<PresenceTracker>>,
        rx: mpsc::Receiver<PresenceUpdate>,
        egress: Option<EgressSender>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self { tracker, rx, egress, metrics }
    }

    /// Run the worker until every sender is dropped
    pub async fn run(mut self) {
        info!("presence_worker_started");

        while let Some(update) = self.rx.recv().await {
            let queue_delay_us = update.enqueued_at.elapsed().as_micros() as u64;
            let transitions = self.tracker.lock().apply(&update.report, &update.zones);

            if queue_delay_us > 10_000 {
                warn!(
                    subject = %update.report.subject_id,
                    queue_delay_us = %queue_delay_us,
                    "presence_queue_delay_high"
                );
            }

            if transitions.is_empty() {
                continue;
            }
            self.metrics.record_transitions(transitions.len() as u64);

            for t in &transitions {
                info!(
                    subject = %t.subject_id,
                    zone_id = %t.zone_id,
                    zone = %t.zone_name,
                    "{}",
                    t.kind.as_str()
                );
                if let Some(egress) = &self.egress {
                    egress.send_transition(t);
                }
            }
        }

        info!("presence_worker_stopped");
    }
}

/// Create the presence queue and worker
///
/// Returns the sender (for the pipeline) and the worker (to be spawned)
pub fn create_presence_worker(
    tracker: Arc<Mutex<PresenceTracker>>,
    egress: Option<EgressSender>,
    metrics: Arc<Metrics>,
    buffer_size: usize,
) -> (mpsc::Sender<PresenceUpdate>, PresenceWorker) {
    let (tx, rx) = mpsc::channel(buffer_size);
    let worker = PresenceWorker::new(tracker, rx, egress, metrics);
    (tx, worker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertLevel, Point};
    use chrono::Duration;

    fn zone(id: u64, name: &str) -> Zone {
        Zone {
            id: ZoneId(id),
            name: name.to_string(),
            center: Point::new(-33.8915, 151.2767).unwrap(),
            radius_meters: 500.0,
            is_active: true,
            alert_level: AlertLevel::Medium,
            beach_id: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    fn report(subject: &str, at: DateTime<Utc>) -> PositionReport {
        PositionReport {
            subject_id: subject.to_string(),
            point: Point::new(-33.8915, 151.2767).unwrap(),
            observed_at: at,
        }
    }

    #[test]
    fn test_entry_then_exit() {
        let mut tracker = PresenceTracker::new(50);
        let t0 = Utc::now();
        let bondi = zone(1, "Bondi Beach");

        let entered = tracker.apply(&report("watch-1", t0), &[bondi.clone()]);
        assert_eq!(entered.len(), 1);
        assert_eq!(entered[0].kind, TransitionKind::Entered);
        assert_eq!(entered[0].zone_id, ZoneId(1));
        assert_eq!(tracker.subjects_in_zones(), 1);

        // Staying inside emits nothing
        assert!(tracker.apply(&report("watch-1", t0 + Duration::seconds(1)), &[bondi]).is_empty());

        let exited = tracker.apply(&report("watch-1", t0 + Duration::seconds(2)), &[]);
        assert_eq!(exited.len(), 1);
        assert_eq!(exited[0].kind, TransitionKind::Exited);
        assert_eq!(exited[0].zone_name, "Bondi Beach");
        assert_eq!(tracker.subjects_in_zones(), 0);
    }

    #[test]
    fn test_moving_between_overlapping_zones() {
        let mut tracker = PresenceTracker::new(50);
        let t0 = Utc::now();
        tracker.apply(&report("watch-1", t0), &[zone(1, "A"), zone(2, "B")]);

        let transitions = tracker
            .apply(&report("watch-1", t0 + Duration::seconds(1)), &[zone(2, "B"), zone(3, "C")]);
        let kinds: Vec<(ZoneId, TransitionKind)> =
            transitions.iter().map(|t| (t.zone_id, t.kind)).collect();
        assert_eq!(
            kinds,
            vec![(ZoneId(3), TransitionKind::Entered), (ZoneId(1), TransitionKind::Exited)]
        );
        assert_eq!(tracker.current_zones("watch-1"), vec![ZoneId(2), ZoneId(3)]);
    }

    #[test]
    fn test_out_of_order_report_only_updates_history() {
        let mut tracker = PresenceTracker::new(50);
        let t0 = Utc::now();
        tracker.apply(&report("watch-1", t0), &[zone(1, "A")]);

        let stale = tracker.apply(&report("watch-1", t0 - Duration::seconds(5)), &[]);
        assert!(stale.is_empty());
        assert_eq!(tracker.current_zones("watch-1"), vec![ZoneId(1)]);
        assert_eq!(tracker.history("watch-1", 10).len(), 2);
    }

    #[test]
    fn test_history_bounded_newest_first() {
        let mut tracker = PresenceTracker::new(3);
        let t0 = Utc::now();
        for i in 0..5 {
            tracker.apply(&report("watch-1", t0 + Duration::seconds(i)), &[]);
        }

        let history = tracker.history("watch-1", 10);
        assert_eq!(history.len(), 3);
        assert_eq!(history[0].timestamp, t0 + Duration::seconds(4));
        assert_eq!(history[2].timestamp, t0 + Duration::seconds(2));
        assert_eq!(tracker.history("watch-1", 1).len(), 1);
        assert!(tracker.history("nobody", 10).is_empty());
    }

    #[tokio::test]
    async fn test_worker_applies_updates() {
        let tracker = Arc::new(Mutex::new(PresenceTracker::new(50)));
        let metrics = Arc::new(Metrics::new());
        let (tx, worker) = create_presence_worker(tracker.clone(), None, metrics, 8);
        let handle = tokio::spawn(worker.run());

        tx.send(PresenceUpdate {
            report: report("watch-1", Utc::now()),
            zones: vec![zone(1, "A")],
            enqueued_at: Instant::now(),
        })
        .await
        .unwrap();
        drop(tx);
        handle.await.unwrap();

        assert_eq!(tracker.lock().current_zones("watch-1"), vec![ZoneId(1)]);
    }
}

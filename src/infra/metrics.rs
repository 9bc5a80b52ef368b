//! Pipeline metrics
//!
//! Counters are plain atomics updated from request tasks. Monotonic counters
//! only ever grow; periodic ones (rate, latency) are drained by `report()`.
//!
//! All atomics use Relaxed ordering. They are statistics, never used to
//! coordinate anything.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::info;

/// Upper bounds of the latency buckets in microseconds, doubling from 250µs.
/// Persist and directory calls dominate, so the range reaches 128ms.
const BUCKET_BOUNDS: [u64; 10] = [250, 500, 1_000, 2_000, 4_000, 8_000, 16_000, 32_000, 64_000, 128_000];
const NUM_BUCKETS: usize = BUCKET_BOUNDS.len() + 1;

/// Periodic latency histogram with sum and max, drained on every report
struct LatencyHistogram {
    sum_us: AtomicU64,
    max_us: AtomicU64,
    buckets: [AtomicU64; NUM_BUCKETS],
}

/// Drained histogram state
struct LatencySnapshot {
    sum_us: u64,
    max_us: u64,
    buckets: [u64; NUM_BUCKETS],
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            sum_us: AtomicU64::new(0),
            max_us: AtomicU64::new(0),
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    #[inline]
    fn bucket_index(latency_us: u64) -> usize {
        BUCKET_BOUNDS.partition_point(|&bound| bound < latency_us)
    }

    #[inline]
    fn observe(&self, latency_us: u64) {
        self.sum_us.fetch_add(latency_us, Ordering::Relaxed);
        self.buckets[Self::bucket_index(latency_us)].fetch_add(1, Ordering::Relaxed);
        self.max_us.fetch_max(latency_us, Ordering::Relaxed);
    }

    fn take(&self) -> LatencySnapshot {
        LatencySnapshot {
            sum_us: self.sum_us.swap(0, Ordering::Relaxed),
            max_us: self.max_us.swap(0, Ordering::Relaxed),
            buckets: std::array::from_fn(|i| self.buckets[i].swap(0, Ordering::Relaxed)),
        }
    }
}

impl LatencySnapshot {
    /// Upper bound of the bucket holding the given quantile (0 when empty)
    ///
    /// The overflow bucket reports twice the last bound.
    fn quantile(&self, q: f64) -> u64 {
        let total: u64 = self.buckets.iter().sum();
        if total == 0 {
            return 0;
        }
        let target = ((total as f64 * q).ceil() as u64).max(1);
        let mut seen = 0u64;
        for (i, &count) in self.buckets.iter().enumerate() {
            seen += count;
            if seen >= target {
                return BUCKET_BOUNDS.get(i).copied().unwrap_or(BUCKET_BOUNDS[NUM_BUCKETS - 2] * 2);
            }
        }
        BUCKET_BOUNDS[NUM_BUCKETS - 2] * 2
    }
}

/// Lock-free metrics collector
///
/// All recording operations are lock-free using atomics.
/// The `report()` method atomically swaps counters to get a consistent snapshot.
pub struct Metrics {
    /// Detections accepted by ingestion (monotonic)
    detections_total: AtomicU64,
    /// Detections rejected by validation (monotonic)
    detections_rejected: AtomicU64,
    /// Detections since last report (reset on report)
    detections_since_report: AtomicU64,
    /// Detection pipeline latency (reset on report)
    latency: LatencyHistogram,
    /// Notifications stored for the first time (monotonic)
    notifications_persisted: AtomicU64,
    /// Persist calls answered from an existing record (monotonic)
    notifications_deduplicated: AtomicU64,
    /// Notifications handed to the fan-out registry (monotonic)
    alerts_published: AtomicU64,
    /// Successful channel deliveries (monotonic)
    deliveries_total: AtomicU64,
    /// Channels that were closed or full at publish time (monotonic)
    deliveries_missed: AtomicU64,
    /// Position reports accepted (monotonic)
    positions_total: AtomicU64,
    /// Position reports dropped because the presence queue was full (monotonic)
    positions_dropped: AtomicU64,
    /// Zone entry/exit transitions emitted (monotonic)
    transitions_total: AtomicU64,
    /// Zone directory failures or timeouts (monotonic)
    directory_errors: AtomicU64,
    /// Notification store failures or timeouts (monotonic)
    store_errors: AtomicU64,
    /// MQTT egress messages dropped due to channel full (monotonic)
    egress_dropped: AtomicU64,
    /// Current presence queue depth (updated by sampler)
    presence_queue_depth: AtomicU64,
    /// Last report time (only accessed from reporter, not atomic)
    last_report_time: parking_lot::Mutex<Instant>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            detections_total: AtomicU64::new(0),
            detections_rejected: AtomicU64::new(0),
            detections_since_report: AtomicU64::new(0),
            latency: LatencyHistogram::new(),
            notifications_persisted: AtomicU64::new(0),
            notifications_deduplicated: AtomicU64::new(0),
            alerts_published: AtomicU64::new(0),
            deliveries_total: AtomicU64::new(0),
            deliveries_missed: AtomicU64::new(0),
            positions_total: AtomicU64::new(0),
            positions_dropped: AtomicU64::new(0),
            transitions_total: AtomicU64::new(0),
            directory_errors: AtomicU64::new(0),
            store_errors: AtomicU64::new(0),
            egress_dropped: AtomicU64::new(0),
            presence_queue_depth: AtomicU64::new(0),
            last_report_time: parking_lot::Mutex::new(Instant::now()),
        }
    }

    /// Record an accepted detection and its end-to-end pipeline latency
    #[inline]
    pub fn record_detection(&self, latency_us: u64) {
        self.detections_total.fetch_add(1, Ordering::Relaxed);
        self.detections_since_report.fetch_add(1, Ordering::Relaxed);
        self.latency.observe(latency_us);
    }

    #[inline]
    pub fn record_detection_rejected(&self) {
        self.detections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a persist outcome (first write or dedup hit)
    #[inline]
    pub fn record_persist(&self, created: bool) {
        if created {
            self.notifications_persisted.fetch_add(1, Ordering::Relaxed);
        } else {
            self.notifications_deduplicated.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Record one publish call and its delivery outcome
    #[inline]
    pub fn record_publish(&self, delivered: u64, attempted: u64) {
        self.alerts_published.fetch_add(1, Ordering::Relaxed);
        self.deliveries_total.fetch_add(delivered, Ordering::Relaxed);
        self.deliveries_missed.fetch_add(attempted.saturating_sub(delivered), Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position(&self) {
        self.positions_total.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_position_dropped(&self) {
        self.positions_dropped.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_transitions(&self, count: u64) {
        self.transitions_total.fetch_add(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_directory_error(&self) {
        self.directory_errors.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_store_error(&self) {
        self.store_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an MQTT egress message dropped due to channel full (lock-free)
    #[inline]
    pub fn record_egress_dropped(&self) {
        self.egress_dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Set current presence queue depth (called by sampler)
    #[inline]
    pub fn set_presence_queue_depth(&self, depth: u64) {
        self.presence_queue_depth.store(depth, Ordering::Relaxed);
    }

    #[inline]
    pub fn detections_total(&self) -> u64 {
        self.detections_total.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn alerts_published(&self) -> u64 {
        self.alerts_published.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn deliveries_missed(&self) -> u64 {
        self.deliveries_missed.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn positions_dropped(&self) -> u64 {
        self.positions_dropped.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn directory_errors(&self) -> u64 {
        self.directory_errors.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn store_errors(&self) -> u64 {
        self.store_errors.load(Ordering::Relaxed)
    }

    /// Snapshot every counter and drain the periodic ones
    ///
    /// Gauges owned elsewhere (zones, channels) are passed in by the caller.
    pub fn report(&self, active_zones: usize, live_channels: usize) -> MetricsSummary {
        let detections_count = self.detections_since_report.swap(0, Ordering::Relaxed);
        let latency = self.latency.take();

        let elapsed = {
            let mut last = self.last_report_time.lock();
            let elapsed = last.elapsed();
            *last = Instant::now();
            elapsed
        };

        let detections_per_sec = if elapsed.as_secs_f64() > 0.0 {
            detections_count as f64 / elapsed.as_secs_f64()
        } else {
            0.0
        };

        let avg_latency =
            if detections_count > 0 { latency.sum_us / detections_count } else { 0 };

        MetricsSummary {
            detections_total: self.detections_total.load(Ordering::Relaxed),
            detections_rejected: self.detections_rejected.load(Ordering::Relaxed),
            detections_per_sec,
            avg_pipeline_latency_us: avg_latency,
            max_pipeline_latency_us: latency.max_us,
            lat_p50_us: latency.quantile(0.50),
            lat_p95_us: latency.quantile(0.95),
            lat_p99_us: latency.quantile(0.99),
            lat_buckets: latency.buckets,
            notifications_persisted: self.notifications_persisted.load(Ordering::Relaxed),
            notifications_deduplicated: self.notifications_deduplicated.load(Ordering::Relaxed),
            alerts_published: self.alerts_published.load(Ordering::Relaxed),
            deliveries_total: self.deliveries_total.load(Ordering::Relaxed),
            deliveries_missed: self.deliveries_missed.load(Ordering::Relaxed),
            positions_total: self.positions_total.load(Ordering::Relaxed),
            positions_dropped: self.positions_dropped.load(Ordering::Relaxed),
            transitions_total: self.transitions_total.load(Ordering::Relaxed),
            directory_errors: self.directory_errors.load(Ordering::Relaxed),
            store_errors: self.store_errors.load(Ordering::Relaxed),
            egress_dropped: self.egress_dropped.load(Ordering::Relaxed),
            presence_queue_depth: self.presence_queue_depth.load(Ordering::Relaxed),
            active_zones,
            live_channels,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

pub const METRICS_NUM_BUCKETS: usize = NUM_BUCKETS;

/// Histogram `le` bounds; the last bucket is the overflow
pub const METRICS_BUCKET_BOUNDS: [u64; NUM_BUCKETS - 1] = BUCKET_BOUNDS;

#[derive(Debug, Clone)]
pub struct MetricsSummary {
    pub detections_total: u64,
    pub detections_rejected: u64,
    pub detections_per_sec: f64,
    pub avg_pipeline_latency_us: u64,
    pub max_pipeline_latency_us: u64,
    /// Per-bucket counts over `METRICS_BUCKET_BOUNDS` plus overflow
    pub lat_buckets: [u64; NUM_BUCKETS],
    pub lat_p50_us: u64,
    pub lat_p95_us: u64,
    pub lat_p99_us: u64,
    pub notifications_persisted: u64,
    pub notifications_deduplicated: u64,
    pub alerts_published: u64,
    pub deliveries_total: u64,
    /// Closed or saturated channels skipped during publish
    pub deliveries_missed: u64,
    pub positions_total: u64,
    pub positions_dropped: u64,
    pub transitions_total: u64,
    pub directory_errors: u64,
    pub store_errors: u64,
    pub egress_dropped: u64,
    /// Current presence queue depth (snapshot)
    pub presence_queue_depth: u64,
    pub active_zones: usize,
    pub live_channels: usize,
}

impl MetricsSummary {
    pub fn log(&self) {
        info!(
            detections_total = %self.detections_total,
            detections_per_sec = format!("{:.1}", self.detections_per_sec),
            avg_latency_us = %self.avg_pipeline_latency_us,
            p99_us = %self.lat_p99_us,
            alerts = %self.alerts_published,
            deliveries = %self.deliveries_total,
            missed = %self.deliveries_missed,
            positions = %self.positions_total,
            positions_dropped = %self.positions_dropped,
            active_zones = %self.active_zones,
            live_channels = %self.live_channels,
            "metrics"
        );
    }
}

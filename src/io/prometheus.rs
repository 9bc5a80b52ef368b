//! Prometheus text exposition for alert pipeline metrics
//!
//! Served at `GET /metrics` by the HTTP API.

use crate::infra::metrics::{MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use std::fmt::Write;

/// Content type for the text exposition format
pub const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge) with site label
fn write_metric(
    output: &mut String,
    name: &str,
    help: &str,
    typ: MetricType,
    site: &str,
    val: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name}{{site=\"{site}\"}} {val}");
}

fn write_counter(output: &mut String, name: &str, help: &str, site: &str, val: u64) {
    write_metric(output, name, help, MetricType::Counter, site, val);
}

fn write_gauge(output: &mut String, name: &str, help: &str, site: &str, val: u64) {
    write_metric(output, name, help, MetricType::Gauge, site, val);
}

/// Write a histogram metric with cumulative buckets, sum and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    site: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    avg: u64,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{site=\"{site}\",le=\"+Inf\"}} {cumulative}");

    let count: u64 = buckets.iter().sum();
    let _ = writeln!(output, "{name}_sum{{site=\"{site}\"}} {}", avg * count);
    let _ = writeln!(output, "{name}_count{{site=\"{site}\"}} {count}");
}

/// Format a metrics snapshot in Prometheus text exposition format
pub fn format_prometheus_metrics(summary: &MetricsSummary, site: &str) -> String {
    let mut output = String::with_capacity(4096);

    write_detection_metrics(&mut output, site, summary);
    write_delivery_metrics(&mut output, site, summary);
    write_presence_metrics(&mut output, site, summary);
    write_error_metrics(&mut output, site, summary);

    output
}

fn write_detection_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "sharkwatch_detections_total",
        "Detections accepted by the pipeline",
        site,
        summary.detections_total,
    );
    write_counter(
        output,
        "sharkwatch_detections_rejected_total",
        "Detection reports rejected by validation",
        site,
        summary.detections_rejected,
    );
    let _ = writeln!(output, "# HELP sharkwatch_detections_per_sec Detections per second");
    let _ = writeln!(output, "# TYPE sharkwatch_detections_per_sec gauge");
    let _ = writeln!(
        output,
        "sharkwatch_detections_per_sec{{site=\"{site}\"}} {:.2}",
        summary.detections_per_sec
    );

    write_histogram(
        output,
        "sharkwatch_detection_latency_us",
        "Detection pipeline latency in microseconds",
        site,
        &summary.lat_buckets,
        summary.avg_pipeline_latency_us,
    );
    write_gauge(
        output,
        "sharkwatch_detection_latency_p99_us",
        "99th percentile detection pipeline latency",
        site,
        summary.lat_p99_us,
    );

    write_counter(
        output,
        "sharkwatch_notifications_persisted_total",
        "Notifications written for the first time",
        site,
        summary.notifications_persisted,
    );
    write_counter(
        output,
        "sharkwatch_notifications_deduplicated_total",
        "Persist calls answered from an existing notification",
        site,
        summary.notifications_deduplicated,
    );
}

fn write_delivery_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "sharkwatch_alerts_published_total",
        "Notifications fanned out to a zone topic",
        site,
        summary.alerts_published,
    );
    write_counter(
        output,
        "sharkwatch_deliveries_total",
        "Channel deliveries accepted",
        site,
        summary.deliveries_total,
    );
    write_counter(
        output,
        "sharkwatch_deliveries_missed_total",
        "Subscribed channels skipped because closed or full",
        site,
        summary.deliveries_missed,
    );
    write_gauge(
        output,
        "sharkwatch_live_channels",
        "Connected push channels",
        site,
        summary.live_channels as u64,
    );
    write_gauge(
        output,
        "sharkwatch_active_zones",
        "Active, unexpired monitoring zones",
        site,
        summary.active_zones as u64,
    );
}

fn write_presence_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "sharkwatch_positions_total",
        "Position reports answered",
        site,
        summary.positions_total,
    );
    write_counter(
        output,
        "sharkwatch_positions_dropped_total",
        "Position reports dropped because the presence queue was full",
        site,
        summary.positions_dropped,
    );
    write_counter(
        output,
        "sharkwatch_zone_transitions_total",
        "Zone entry and exit transitions",
        site,
        summary.transitions_total,
    );
    write_gauge(
        output,
        "sharkwatch_presence_queue_depth",
        "Current presence queue depth",
        site,
        summary.presence_queue_depth,
    );
}

fn write_error_metrics(output: &mut String, site: &str, summary: &MetricsSummary) {
    write_counter(
        output,
        "sharkwatch_directory_errors_total",
        "Zone lookups that failed or timed out",
        site,
        summary.directory_errors,
    );
    write_counter(
        output,
        "sharkwatch_store_errors_total",
        "Notification store calls that failed or timed out",
        site,
        summary.store_errors,
    );
    write_counter(
        output,
        "sharkwatch_egress_dropped_total",
        "MQTT egress messages dropped because the channel was full",
        site,
        summary.egress_dropped,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::metrics::Metrics;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();
        metrics.record_detection(150);
        metrics.record_detection(400);
        metrics.record_publish(3, 4);

        let output = format_prometheus_metrics(&metrics.report(5, 2), "bondi");

        assert!(output.contains("sharkwatch_detections_total{site=\"bondi\"} 2"));
        assert!(output.contains("sharkwatch_detection_latency_us_bucket{site=\"bondi\",le=\"250\"} 1"));
        assert!(output.contains("sharkwatch_detection_latency_us_bucket{site=\"bondi\",le=\"+Inf\"} 2"));
        assert!(output.contains("sharkwatch_detection_latency_us_count{site=\"bondi\"} 2"));
        assert!(output.contains("sharkwatch_deliveries_missed_total{site=\"bondi\"} 1"));
        assert!(output.contains("sharkwatch_active_zones{site=\"bondi\"} 5"));
        assert!(output.contains("sharkwatch_live_channels{site=\"bondi\"} 2"));
        assert!(output.contains("# TYPE sharkwatch_deliveries_total counter"));
    }
}

//! Zone resolution for detections and positions
//!
//! Stateless per call. Every lookup is bounded by a timeout and any backend
//! failure surfaces as `DirectoryUnavailable`; retrying is left to the caller.

use crate::domain::error::AlertError;
use crate::domain::event::{DetectionEvent, PositionReport};
use crate::domain::zone::Zone;
use crate::services::zone_directory::ZoneLookup;
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

pub struct ZoneResolver {
    lookup: Arc<dyn ZoneLookup>,
    timeout: Duration,
}

impl ZoneResolver {
    pub fn new(lookup: Arc<dyn ZoneLookup>, timeout: Duration) -> Self {
        Self { lookup, timeout }
    }

    /// Nearest live zone to the detection, `None` when no zone is active
    pub async fn resolve_for_detection(
        &self,
        event: &DetectionEvent,
    ) -> Result<Option<Zone>, AlertError> {
        self.bounded("nearest", self.lookup.nearest(event.point, Utc::now())).await
    }

    /// Every live zone containing the reported position
    pub async fn resolve_for_position(
        &self,
        report: &PositionReport,
    ) -> Result<Vec<Zone>, AlertError> {
        self.bounded("containing", self.lookup.containing(report.point, Utc::now())).await
    }

    async fn bounded<T>(
        &self,
        op: &'static str,
        fut: impl Future<Output = Result<T, AlertError>>,
    ) -> Result<T, AlertError> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(AlertError::DirectoryUnavailable(reason))) => {
                warn!(op = %op, reason = %reason, "zone_lookup_failed");
                Err(AlertError::DirectoryUnavailable(reason))
            }
            Ok(Err(e)) => {
                warn!(op = %op, error = %e, "zone_lookup_failed");
                Err(AlertError::DirectoryUnavailable(e.to_string()))
            }
            Err(_) => {
                warn!(op = %op, timeout_ms = %self.timeout.as_millis(), "zone_lookup_timeout");
                Err(AlertError::DirectoryUnavailable(format!(
                    "{} timed out after {}ms",
                    op,
                    self.timeout.as_millis()
                )))
            }
        }
    }
}

//! Shared types for the alert gateway

use crate::domain::error::AlertError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> String {
    Uuid::now_v7().to_string()
}

/// Get current epoch milliseconds
#[inline]
pub fn epoch_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

/// Newtype wrapper for zone IDs to provide type safety
///
/// Assigned sequentially by the zone directory, so id order is creation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct ZoneId(pub u64);

impl std::fmt::Display for ZoneId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ZoneId {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u64>()
            .map(ZoneId)
            .map_err(|_| AlertError::validation("zoneId", "must be a positive integer"))
    }
}

/// Identifier of an accepted detection event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub String);

impl EventId {
    /// Fresh id: `DET-` prefix followed by a UUIDv7 (timestamp + random suffix)
    pub fn generate() -> Self {
        Self(format!("DET-{}", new_uuid_v7()))
    }

    /// Source id for an operator-sent message: `OPS-` + UUIDv7
    pub fn operator() -> Self {
        Self(format!("OPS-{}", new_uuid_v7()))
    }
}

impl std::fmt::Display for EventId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of a persisted notification
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NotificationId(pub String);

impl NotificationId {
    pub fn generate() -> Self {
        Self(format!("NTF-{}", new_uuid_v7()))
    }
}

impl std::fmt::Display for NotificationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Device / user identifier owned by the external device directory
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubscriberId(pub String);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// WGS84 coordinate in degrees, no altitude
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Point {
    pub latitude: f64,
    pub longitude: f64,
}

impl Point {
    /// Validated constructor
    pub fn new(latitude: f64, longitude: f64) -> Result<Self, AlertError> {
        let point = Self { latitude, longitude };
        point.validate()?;
        Ok(point)
    }

    /// Check -90 <= lat <= 90 and -180 <= lon <= 180
    pub fn validate(&self) -> Result<(), AlertError> {
        if !self.latitude.is_finite() || !(-90.0..=90.0).contains(&self.latitude) {
            return Err(AlertError::InvalidArgument(format!(
                "latitude {} outside [-90, 90]",
                self.latitude
            )));
        }
        if !self.longitude.is_finite() || !(-180.0..=180.0).contains(&self.longitude) {
            return Err(AlertError::InvalidArgument(format!(
                "longitude {} outside [-180, 180]",
                self.longitude
            )));
        }
        Ok(())
    }
}

impl std::fmt::Display for Point {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({:.5},{:.5})", self.latitude, self.longitude)
    }
}

/// Severity carried by zones and notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertLevel {
    Low,
    #[default]
    Medium,
    High,
}

impl AlertLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertLevel::Low => "low",
            AlertLevel::Medium => "medium",
            AlertLevel::High => "high",
        }
    }
}

impl std::str::FromStr for AlertLevel {
    type Err = AlertError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(AlertLevel::Low),
            "medium" => Ok(AlertLevel::Medium),
            "high" => Ok(AlertLevel::High),
            _ => Err(AlertError::validation("alertLevel", "expected low, medium or high")),
        }
    }
}

/// Closed time range used by notification and detection queries
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeWindow {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
}

impl TimeWindow {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn since(since: DateTime<Utc>) -> Self {
        Self { since: Some(since), until: None }
    }

    #[inline]
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.since.map_or(true, |s| at >= s) && self.until.map_or(true, |u| at <= u)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_point_validation() {
        assert!(Point::new(-33.8915, 151.2767).is_ok());
        assert!(Point::new(90.0, 180.0).is_ok());
        assert!(Point::new(-90.0, -180.0).is_ok());
        assert!(matches!(Point::new(90.1, 0.0), Err(AlertError::InvalidArgument(_))));
        assert!(matches!(Point::new(0.0, -180.5), Err(AlertError::InvalidArgument(_))));
        assert!(Point::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn test_alert_level_from_str() {
        assert_eq!("high".parse::<AlertLevel>().unwrap(), AlertLevel::High);
        assert_eq!("low".parse::<AlertLevel>().unwrap(), AlertLevel::Low);
        assert!("severe".parse::<AlertLevel>().is_err());
        assert_eq!(AlertLevel::default(), AlertLevel::Medium);
    }

    #[test]
    fn test_zone_id_parse() {
        assert_eq!("42".parse::<ZoneId>().unwrap(), ZoneId(42));
        assert!("abc".parse::<ZoneId>().is_err());
    }

    #[test]
    fn test_generated_event_ids_are_unique() {
        let a = EventId::generate();
        let b = EventId::generate();
        assert_ne!(a, b);
        assert!(a.0.starts_with("DET-"));
    }

    #[test]
    fn test_time_window_contains() {
        let now = Utc::now();
        let window = TimeWindow::since(now - chrono::Duration::hours(1));
        assert!(window.contains(now));
        assert!(!window.contains(now - chrono::Duration::hours(2)));
        assert!(TimeWindow::all().contains(now));
    }
}

//! Monitoring zone model

use crate::domain::error::AlertError;
use crate::domain::types::{AlertLevel, Point, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A circular monitoring zone (a beach geofence)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Zone {
    pub id: ZoneId,
    pub name: String,
    pub center: Point,
    pub radius_meters: f64,
    pub is_active: bool,
    pub alert_level: AlertLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub beach_id: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl Zone {
    /// Active flag set and not past its expiry
    ///
    /// Expiry wins over the flag: readers must treat an expired zone as inactive
    /// even if nobody deactivated it.
    #[inline]
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |exp| exp > now)
    }
}

/// Input for creating a zone
#[derive(Debug, Clone, PartialEq)]
pub struct ZoneSpec {
    pub name: String,
    pub center: Point,
    pub radius_meters: f64,
    pub alert_level: AlertLevel,
    pub beach_id: Option<String>,
    /// Explicit expiry; `None` lets the directory apply its default TTL
    pub expires_at: Option<DateTime<Utc>>,
    /// Opt out of the default TTL (seeded zones)
    pub never_expires: bool,
}

impl ZoneSpec {
    pub fn new(name: impl Into<String>, center: Point, radius_meters: f64) -> Self {
        Self {
            name: name.into(),
            center,
            radius_meters,
            alert_level: AlertLevel::default(),
            beach_id: None,
            expires_at: None,
            never_expires: false,
        }
    }

    pub fn with_alert_level(mut self, alert_level: AlertLevel) -> Self {
        self.alert_level = alert_level;
        self
    }

    pub fn with_beach_id(mut self, beach_id: impl Into<String>) -> Self {
        self.beach_id = Some(beach_id.into());
        self
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    pub fn permanent(mut self) -> Self {
        self.never_expires = true;
        self.expires_at = None;
        self
    }

    pub fn validate(&self) -> Result<(), AlertError> {
        if self.name.trim().is_empty() {
            return Err(AlertError::missing("name"));
        }
        if !self.radius_meters.is_finite() || self.radius_meters <= 0.0 {
            return Err(AlertError::validation("radius", "must be a positive number of meters"));
        }
        self.center
            .validate()
            .map_err(|e| AlertError::validation("center", e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn spec() -> ZoneSpec {
        ZoneSpec::new("Bondi Beach", Point::new(-33.8915, 151.2767).unwrap(), 500.0)
    }

    #[test]
    fn test_spec_validation() {
        assert!(spec().validate().is_ok());

        let mut no_name = spec();
        no_name.name = "  ".to_string();
        assert_eq!(no_name.validate(), Err(AlertError::missing("name")));

        let mut zero_radius = spec();
        zero_radius.radius_meters = 0.0;
        assert!(matches!(
            zero_radius.validate(),
            Err(AlertError::Validation { field: "radius", .. })
        ));

        let mut bad_center = spec();
        bad_center.center = Point { latitude: 123.0, longitude: 0.0 };
        assert!(matches!(
            bad_center.validate(),
            Err(AlertError::Validation { field: "center", .. })
        ));
    }

    #[test]
    fn test_is_live_respects_expiry_over_flag() {
        let now = Utc::now();
        let zone = Zone {
            id: ZoneId(1),
            name: "Bondi Beach".into(),
            center: Point::new(-33.8915, 151.2767).unwrap(),
            radius_meters: 500.0,
            is_active: true,
            alert_level: AlertLevel::High,
            beach_id: None,
            created_at: now - Duration::hours(25),
            expires_at: Some(now - Duration::hours(1)),
        };
        assert!(!zone.is_live(now));

        let unexpired = Zone { expires_at: Some(now + Duration::hours(1)), ..zone.clone() };
        assert!(unexpired.is_live(now));

        let deactivated = Zone { is_active: false, expires_at: None, ..zone };
        assert!(!deactivated.is_live(now));
    }
}

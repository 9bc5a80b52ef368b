//! Great-circle distance and circular containment

use crate::domain::types::Point;
use crate::domain::zone::Zone;

/// Mean earth radius used by the haversine formula (meters)
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// Haversine great-circle distance in meters
///
/// Points are validated at construction, so this is total.
pub fn distance_meters(a: Point, b: Point) -> f64 {
    let lat1 = a.latitude.to_radians();
    let lat2 = b.latitude.to_radians();
    let dlat = (b.latitude - a.latitude).to_radians();
    let dlon = (b.longitude - a.longitude).to_radians();

    let h = (dlat / 2.0).sin().powi(2) + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
    EARTH_RADIUS_M * 2.0 * h.sqrt().atan2((1.0 - h).sqrt())
}

/// Inclusive point-in-circle test: a point exactly on the radius is inside
#[inline]
pub fn contains(zone: &Zone, p: Point) -> bool {
    distance_meters(zone.center, p) <= zone.radius_meters
}

/// Point `meters` due north of `origin` (same longitude)
///
/// Along a meridian the haversine distance is exactly `R * dlat`, which makes
/// this handy for constructing boundary cases.
pub fn offset_north(origin: Point, meters: f64) -> Point {
    let dlat = (meters / EARTH_RADIUS_M).to_degrees();
    Point { latitude: origin.latitude + dlat, longitude: origin.longitude }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::{AlertLevel, ZoneId};
    use chrono::Utc;

    fn bondi() -> Point {
        Point::new(-33.8915, 151.2767).unwrap()
    }

    fn zone_at(center: Point, radius_meters: f64) -> Zone {
        Zone {
            id: ZoneId(1),
            name: "Bondi Beach".to_string(),
            center,
            radius_meters,
            is_active: true,
            alert_level: AlertLevel::High,
            beach_id: None,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    #[test]
    fn test_distance_zero() {
        assert_eq!(distance_meters(bondi(), bondi()), 0.0);
    }

    #[test]
    fn test_distance_known_pair() {
        // Bondi to Manly is roughly 10.5 km
        let manly = Point::new(-33.7969, 151.2850).unwrap();
        let d = distance_meters(bondi(), manly);
        assert!((10_000.0..11_000.0).contains(&d), "distance was {d}");
    }

    #[test]
    fn test_distance_symmetric() {
        let a = bondi();
        let b = Point::new(-33.90, 151.30).unwrap();
        assert!((distance_meters(a, b) - distance_meters(b, a)).abs() < 1e-9);
    }

    #[test]
    fn test_offset_north_round_trips() {
        let p = offset_north(bondi(), 500.0);
        assert!((distance_meters(bondi(), p) - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_contains_boundary_inclusive() {
        let zone = zone_at(bondi(), 500.0);
        // Nudge inward by a nanometre to absorb float error on the exact boundary
        let on_boundary = offset_north(bondi(), 500.0 - 1e-9);
        let outside = offset_north(bondi(), 500.1);

        assert!(contains(&zone, bondi()));
        assert!(contains(&zone, on_boundary));
        assert!(!contains(&zone, outside));
    }

    #[test]
    fn test_contains_uses_exact_radius() {
        let zone = zone_at(bondi(), 500.0);
        let p = offset_north(bondi(), 250.0);
        let d = distance_meters(zone.center, p);
        let tight = zone_at(bondi(), d);
        assert!(contains(&tight, p));
    }
}

//! In-memory zone directory
//!
//! Holds every zone ever created, in id order. Readers scan the full list and
//! filter on `Zone::is_live`, so expiry takes effect without a sweeper.
//! Writers take the lock only for the push or flag flip itself.
//!
//! Lookups used by the resolver go through the `ZoneLookup` trait so a remote
//! directory (or a spatial index) can be swapped in without touching callers.

use crate::domain::error::AlertError;
use crate::domain::geo;
use crate::domain::types::{Point, ZoneId};
use crate::domain::zone::{Zone, ZoneSpec};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Async lookup contract used by the resolver
#[async_trait]
pub trait ZoneLookup: Send + Sync {
    /// Live zone whose center is closest to `point`; ties go to the lowest id
    async fn nearest(&self, point: Point, now: DateTime<Utc>) -> Result<Option<Zone>, AlertError>;

    /// All live zones containing `point`, in directory order
    async fn containing(&self, point: Point, now: DateTime<Utc>)
        -> Result<Vec<Zone>, AlertError>;

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Zone>, AlertError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneStats {
    pub total: usize,
    pub active: usize,
}

pub struct ZoneDirectory {
    /// Append-only, ordered by id
    zones: RwLock<Vec<Zone>>,
    next_id: AtomicU64,
    /// Applied to specs with no explicit expiry unless they opt out
    default_ttl: Option<Duration>,
}

impl ZoneDirectory {
    pub fn new(default_ttl: Option<Duration>) -> Self {
        Self { zones: RwLock::new(Vec::new()), next_id: AtomicU64::new(1), default_ttl }
    }

    pub fn create(&self, spec: ZoneSpec) -> Result<Zone, AlertError> {
        self.create_at(spec, Utc::now())
    }

    /// Validate and insert a zone with `now` as creation time
    pub fn create_at(&self, spec: ZoneSpec, now: DateTime<Utc>) -> Result<Zone, AlertError> {
        spec.validate()?;

        let expires_at = match (spec.expires_at, spec.never_expires) {
            (Some(at), _) => Some(at),
            (None, true) => None,
            (None, false) => self.default_ttl.map(|ttl| now + ttl),
        };

        // Id assigned under the write lock so list order matches id order
        let zone = {
            let mut zones = self.zones.write();
            let zone = Zone {
                id: ZoneId(self.next_id.fetch_add(1, Ordering::Relaxed)),
                name: spec.name.trim().to_string(),
                center: spec.center,
                radius_meters: spec.radius_meters,
                is_active: true,
                alert_level: spec.alert_level,
                beach_id: spec.beach_id,
                created_at: now,
                expires_at,
            };
            zones.push(zone.clone());
            zone
        };

        info!(
            zone_id = %zone.id,
            name = %zone.name,
            radius_m = %zone.radius_meters,
            expires_at = ?zone.expires_at,
            "zone_created"
        );
        Ok(zone)
    }

    pub fn deactivate(&self, id: ZoneId) -> Result<(), AlertError> {
        self.deactivate_at(id, Utc::now())
    }

    /// Soft-delete a zone; an expired zone counts as already inactive
    pub fn deactivate_at(&self, id: ZoneId, now: DateTime<Utc>) -> Result<(), AlertError> {
        {
            let mut zones = self.zones.write();
            match zones.iter_mut().find(|z| z.id == id) {
                Some(zone) if zone.is_live(now) => zone.is_active = false,
                _ => return Err(AlertError::NotFound(format!("zone {}", id))),
            }
        }
        info!(zone_id = %id, "zone_deactivated");
        Ok(())
    }

    pub fn get(&self, id: ZoneId) -> Option<Zone> {
        self.zones.read().iter().find(|z| z.id == id).cloned()
    }

    pub fn list_active(&self, now: DateTime<Utc>) -> Vec<Zone> {
        self.zones.read().iter().filter(|z| z.is_live(now)).cloned().collect()
    }

    pub fn nearest(&self, point: Point, now: DateTime<Utc>) -> Option<Zone> {
        let zones = self.zones.read();
        let mut best: Option<(&Zone, f64)> = None;
        for zone in zones.iter().filter(|z| z.is_live(now)) {
            let dist = geo::distance_meters(zone.center, point);
            // Strict comparison keeps the earlier (lower id) zone on ties
            if best.map_or(true, |(_, best_dist)| dist < best_dist) {
                best = Some((zone, dist));
            }
        }
        best.map(|(zone, _)| zone.clone())
    }

    pub fn containing(&self, point: Point, now: DateTime<Utc>) -> Vec<Zone> {
        self.zones
            .read()
            .iter()
            .filter(|z| z.is_live(now) && geo::contains(z, point))
            .cloned()
            .collect()
    }

    pub fn stats(&self, now: DateTime<Utc>) -> ZoneStats {
        let zones = self.zones.read();
        ZoneStats { total: zones.len(), active: zones.iter().filter(|z| z.is_live(now)).count() }
    }

    pub fn active_count(&self) -> usize {
        self.stats(Utc::now()).active
    }
}

impl Default for ZoneDirectory {
    fn default() -> Self {
        Self::new(None)
    }
}

#[async_trait]
impl ZoneLookup for ZoneDirectory {
    async fn nearest(&self, point: Point, now: DateTime<Utc>) -> Result<Option<Zone>, AlertError> {
        Ok(ZoneDirectory::nearest(self, point, now))
    }

    async fn containing(
        &self,
        point: Point,
        now: DateTime<Utc>,
    ) -> Result<Vec<Zone>, AlertError> {
        Ok(ZoneDirectory::containing(self, point, now))
    }

    async fn list_active(&self, now: DateTime<Utc>) -> Result<Vec<Zone>, AlertError> {
        Ok(ZoneDirectory::list_active(self, now))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::geo::offset_north;

    fn bondi() -> Point {
        Point::new(-33.8915, 151.2767).unwrap()
    }

    fn spec(name: &str, center: Point, radius: f64) -> ZoneSpec {
        ZoneSpec::new(name, center, radius)
    }

    #[test]
    fn test_nearest_picks_closest_zone() {
        let dir = ZoneDirectory::default();
        let p = bondi();
        let a = dir.create(spec("A", offset_north(p, 200.0), 1000.0)).unwrap();
        let b = dir.create(spec("B", offset_north(p, 50.0), 1000.0)).unwrap();

        let nearest = dir.nearest(p, Utc::now()).unwrap();
        assert_eq!(nearest.id, b.id);
        assert_ne!(nearest.id, a.id);
    }

    #[test]
    fn test_nearest_tie_breaks_on_lowest_id() {
        let dir = ZoneDirectory::default();
        let first = dir.create(spec("First", bondi(), 300.0)).unwrap();
        let _second = dir.create(spec("Second", bondi(), 300.0)).unwrap();

        assert_eq!(dir.nearest(bondi(), Utc::now()).unwrap().id, first.id);
    }

    #[test]
    fn test_nearest_none_when_empty() {
        let dir = ZoneDirectory::default();
        assert!(dir.nearest(bondi(), Utc::now()).is_none());
    }

    #[test]
    fn test_create_deactivate_list_active() {
        let dir = ZoneDirectory::default();
        let zone = dir.create(spec("Bondi Beach", bondi(), 500.0)).unwrap();
        assert_eq!(dir.list_active(Utc::now()).len(), 1);

        dir.deactivate(zone.id).unwrap();
        assert!(dir.list_active(Utc::now()).iter().all(|z| z.id != zone.id));

        // Second deactivate and unknown id both report NotFound
        assert!(matches!(dir.deactivate(zone.id), Err(AlertError::NotFound(_))));
        assert!(matches!(dir.deactivate(ZoneId(99)), Err(AlertError::NotFound(_))));

        // Soft delete keeps the record
        assert!(!dir.get(zone.id).unwrap().is_active);
    }

    #[test]
    fn test_expired_zone_excluded_without_deactivation() {
        let dir = ZoneDirectory::default();
        let now = Utc::now();
        let expired = dir
            .create_at(spec("Old", bondi(), 500.0).expiring_at(now - Duration::minutes(1)), now)
            .unwrap();
        let live = dir.create_at(spec("New", bondi(), 500.0), now).unwrap();

        let active = dir.list_active(now);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, live.id);
        assert_eq!(dir.nearest(bondi(), now).unwrap().id, live.id);
        assert!(dir.containing(bondi(), now).iter().all(|z| z.id != expired.id));
    }

    #[test]
    fn test_default_ttl_applied_unless_permanent() {
        let dir = ZoneDirectory::new(Some(Duration::hours(24)));
        let now = Utc::now();

        let temp = dir.create_at(spec("Temp", bondi(), 500.0), now).unwrap();
        assert_eq!(temp.expires_at, Some(now + Duration::hours(24)));

        let seeded = dir.create_at(spec("Seeded", bondi(), 500.0).permanent(), now).unwrap();
        assert_eq!(seeded.expires_at, None);

        // Day later only the permanent zone survives
        let later = now + Duration::hours(25);
        let active = dir.list_active(later);
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, seeded.id);
    }

    #[test]
    fn test_containing_in_directory_order() {
        let dir = ZoneDirectory::default();
        let a = dir.create(spec("Wide", offset_north(bondi(), 300.0), 1000.0)).unwrap();
        let b = dir.create(spec("Tight", bondi(), 100.0)).unwrap();
        let _far = dir.create(spec("Far", offset_north(bondi(), 5000.0), 100.0)).unwrap();

        let ids: Vec<ZoneId> = dir.containing(bondi(), Utc::now()).iter().map(|z| z.id).collect();
        assert_eq!(ids, vec![a.id, b.id]);
    }

    #[test]
    fn test_create_rejects_invalid_spec() {
        let dir = ZoneDirectory::default();
        assert!(dir.create(spec("", bondi(), 500.0)).is_err());
        assert!(dir.create(spec("Bad", bondi(), -1.0)).is_err());
        assert_eq!(dir.stats(Utc::now()).total, 0);
    }

    #[test]
    fn test_stats() {
        let dir = ZoneDirectory::default();
        let a = dir.create(spec("A", bondi(), 500.0)).unwrap();
        dir.create(spec("B", bondi(), 500.0)).unwrap();
        dir.deactivate(a.id).unwrap();

        assert_eq!(dir.stats(Utc::now()), ZoneStats { total: 2, active: 1 });
    }

    #[tokio::test]
    async fn test_lookup_trait_delegates() {
        let dir = ZoneDirectory::default();
        let zone = dir.create(spec("Bondi Beach", bondi(), 500.0)).unwrap();
        let lookup: &dyn ZoneLookup = &dir;

        let nearest = lookup.nearest(bondi(), Utc::now()).await.unwrap();
        assert_eq!(nearest.map(|z| z.id), Some(zone.id));
        assert_eq!(lookup.containing(bondi(), Utc::now()).await.unwrap().len(), 1);
    }
}

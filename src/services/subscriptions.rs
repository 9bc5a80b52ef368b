//! Subscriber to zone relations
//!
//! The durable side of subscriptions: which zones a device or user wants
//! alerts for. Live channels pick these up through
//! `SubscriptionRegistry::attach`.

use crate::domain::types::{SubscriberId, ZoneId};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Zones added and removed by a relation update
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RelationChange {
    pub added: Vec<ZoneId>,
    pub removed: Vec<ZoneId>,
}

impl RelationChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

#[derive(Default)]
pub struct SubscriptionDirectory {
    relations: RwLock<FxHashMap<SubscriberId, BTreeSet<ZoneId>>>,
}

impl SubscriptionDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace a subscriber's zone set and report the difference
    pub fn replace(&self, subscriber: &SubscriberId, zones: &[ZoneId]) -> RelationChange {
        let next: BTreeSet<ZoneId> = zones.iter().copied().collect();
        let mut relations = self.relations.write();
        let prev = relations.remove(subscriber).unwrap_or_default();

        let change = RelationChange {
            added: next.difference(&prev).copied().collect(),
            removed: prev.difference(&next).copied().collect(),
        };
        if !next.is_empty() {
            relations.insert(subscriber.clone(), next);
        }
        change
    }

    pub fn zones_for(&self, subscriber: &SubscriberId) -> Vec<ZoneId> {
        self.relations
            .read()
            .get(subscriber)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn subscribers_for(&self, zone: ZoneId) -> Vec<SubscriberId> {
        let mut subscribers: Vec<SubscriberId> = self
            .relations
            .read()
            .iter()
            .filter(|(_, set)| set.contains(&zone))
            .map(|(id, _)| id.clone())
            .collect();
        subscribers.sort();
        subscribers
    }
}

//! Live fan-out registry
//!
//! Maps zone topics to connected channels. A channel is an outbound mpsc
//! queue owned by a transport session; the registry only holds the sender.
//!
//! Concurrency model:
//! - One mutex guards slots and topic membership
//! - `publish` snapshots the senders under the lock and delivers after
//!   releasing it, so a slow session never blocks subscribe/unsubscribe
//! - Delivery uses `try_send`: a full or closed channel is skipped and counted
//!
//! Channel ids are arena handles (slot + generation). Closing a channel bumps
//! its slot generation, so an old id can never match a later connection that
//! reuses the slot.

use crate::domain::error::AlertError;
use crate::domain::notification::{Notification, PushMessage};
use crate::domain::types::{SubscriberId, ZoneId};
use crate::services::subscriptions::RelationChange;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    slot: u32,
    generation: u32,
}

impl std::fmt::Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch-{}.{}", self.slot, self.generation)
    }
}

/// Outcome of one publish call
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Channels that accepted the message
    pub delivered: u64,
    /// Channels subscribed when the publish began
    pub attempted: u64,
}

impl PublishOutcome {
    pub fn missed(&self) -> u64 {
        self.attempted - self.delivered
    }

    /// Some subscribers were gone or saturated at delivery time
    pub fn is_partial(&self) -> bool {
        self.delivered < self.attempted
    }
}

struct LiveChannel {
    tx: mpsc::Sender<Arc<PushMessage>>,
    topics: SmallVec<[ZoneId; 8]>,
    subscriber: Option<SubscriberId>,
}

struct Slot {
    generation: u32,
    live: Option<LiveChannel>,
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    free: Vec<u32>,
    /// Members per topic, in subscription order, no duplicates
    topics: FxHashMap<ZoneId, Vec<ChannelId>>,
}

impl RegistryInner {
    fn live_mut(&mut self, ch: ChannelId) -> Result<&mut LiveChannel, AlertError> {
        match self.slots.get_mut(ch.slot as usize) {
            Some(slot) if slot.generation == ch.generation => {
                slot.live.as_mut().ok_or_else(|| stale(ch))
            }
            _ => Err(stale(ch)),
        }
    }

    fn subscribe(&mut self, ch: ChannelId, zone: ZoneId) -> Result<bool, AlertError> {
        let live = self.live_mut(ch)?;
        if live.topics.contains(&zone) {
            return Ok(false);
        }
        live.topics.push(zone);
        self.topics.entry(zone).or_default().push(ch);
        Ok(true)
    }

    fn unsubscribe(&mut self, ch: ChannelId, zone: ZoneId) -> Result<bool, AlertError> {
        let live = self.live_mut(ch)?;
        let Some(pos) = live.topics.iter().position(|z| *z == zone) else {
            return Ok(false);
        };
        live.topics.swap_remove(pos);
        self.remove_member(zone, ch);
        Ok(true)
    }

    fn remove_member(&mut self, zone: ZoneId, ch: ChannelId) {
        if let Some(members) = self.topics.get_mut(&zone) {
            members.retain(|m| *m != ch);
            if members.is_empty() {
                self.topics.remove(&zone);
            }
        }
    }

    fn close(&mut self, ch: ChannelId) -> Option<LiveChannel> {
        let slot = self.slots.get_mut(ch.slot as usize)?;
        if slot.generation != ch.generation {
            return None;
        }
        let live = slot.live.take()?;
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(ch.slot);
        for zone in &live.topics {
            self.remove_member(*zone, ch);
        }
        Some(live)
    }
}

fn stale(ch: ChannelId) -> AlertError {
    AlertError::NotFound(format!("channel {}", ch))
}

pub struct SubscriptionRegistry {
    inner: Mutex<RegistryInner>,
    channel_buffer: usize,
}

impl SubscriptionRegistry {
    pub fn new(channel_buffer: usize) -> Self {
        Self { inner: Mutex::new(RegistryInner::default()), channel_buffer: channel_buffer.max(1) }
    }

    /// Register a new connection with no subscriptions
    pub fn open(&self) -> (ChannelId, mpsc::Receiver<Arc<PushMessage>>) {
        let (tx, rx) = mpsc::channel(self.channel_buffer);
        let live = LiveChannel { tx, topics: SmallVec::new(), subscriber: None };

        let mut inner = self.inner.lock();
        let ch = match inner.free.pop() {
            Some(slot) => {
                let entry = &mut inner.slots[slot as usize];
                entry.live = Some(live);
                ChannelId { slot, generation: entry.generation }
            }
            None => {
                let slot = inner.slots.len() as u32;
                inner.slots.push(Slot { generation: 0, live: Some(live) });
                ChannelId { slot, generation: 0 }
            }
        };
        drop(inner);

        debug!(channel = %ch, "channel_opened");
        (ch, rx)
    }

    /// Idempotent; returns true if the membership was added
    pub fn subscribe(&self, ch: ChannelId, zone: ZoneId) -> Result<bool, AlertError> {
        let added = self.inner.lock().subscribe(ch, zone)?;
        if added {
            debug!(channel = %ch, zone_id = %zone, "channel_subscribed");
        }
        Ok(added)
    }

    /// Idempotent; returns true if the membership was removed
    pub fn unsubscribe(&self, ch: ChannelId, zone: ZoneId) -> Result<bool, AlertError> {
        let removed = self.inner.lock().unsubscribe(ch, zone)?;
        if removed {
            debug!(channel = %ch, zone_id = %zone, "channel_unsubscribed");
        }
        Ok(removed)
    }

    /// Bind a channel to a subscriber and join that subscriber's zones
    pub fn attach(
        &self,
        ch: ChannelId,
        subscriber: &SubscriberId,
        zones: &[ZoneId],
    ) -> Result<(), AlertError> {
        let mut inner = self.inner.lock();
        inner.live_mut(ch)?.subscriber = Some(subscriber.clone());
        for zone in zones {
            inner.subscribe(ch, *zone)?;
        }
        drop(inner);

        info!(channel = %ch, subscriber = %subscriber, zones = %zones.len(), "channel_attached");
        Ok(())
    }

    /// Apply a subscriber's relation change to every live channel bound to it
    pub fn apply_relation_change(&self, subscriber: &SubscriberId, change: &RelationChange) -> usize {
        if change.is_empty() {
            return 0;
        }
        let mut inner = self.inner.lock();
        let bound: Vec<ChannelId> = inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| {
                let live = slot.live.as_ref()?;
                (live.subscriber.as_ref() == Some(subscriber))
                    .then_some(ChannelId { slot: idx as u32, generation: slot.generation })
            })
            .collect();

        for ch in &bound {
            for zone in &change.added {
                // Channel ids came from live slots under this same lock
                let _ = inner.subscribe(*ch, *zone);
            }
            for zone in &change.removed {
                let _ = inner.unsubscribe(*ch, *zone);
            }
        }
        bound.len()
    }

    /// Drop a channel from every topic; returns false for unknown or stale ids
    pub fn on_channel_closed(&self, ch: ChannelId) -> bool {
        let closed = self.inner.lock().close(ch);
        match closed {
            Some(live) => {
                debug!(channel = %ch, topics = %live.topics.len(), "channel_closed");
                true
            }
            None => false,
        }
    }

    /// Deliver a notification to every channel subscribed to `zone`
    ///
    /// Targets exactly the membership present when the call starts. Each
    /// channel receives the message at most once. Channels found closed are
    /// removed from the registry.
    pub fn publish(&self, zone: ZoneId, notification: &Notification) -> PublishOutcome {
        let targets: Vec<(ChannelId, mpsc::Sender<Arc<PushMessage>>)> = {
            let inner = self.inner.lock();
            match inner.topics.get(&zone) {
                Some(members) => members
                    .iter()
                    .filter_map(|ch| {
                        let slot = inner.slots.get(ch.slot as usize)?;
                        let live = slot.live.as_ref()?;
                        Some((*ch, live.tx.clone()))
                    })
                    .collect(),
                None => Vec::new(),
            }
        };

        let outcome = self.deliver(targets, notification);
        if outcome.is_partial() {
            debug!(
                zone_id = %zone,
                notification_id = %notification.id,
                delivered = %outcome.delivered,
                attempted = %outcome.attempted,
                "delivery_partial"
            );
        }
        outcome
    }

    /// Deliver a notification to every live channel bound to `subscriber`
    pub fn publish_to_subscriber(
        &self,
        subscriber: &SubscriberId,
        notification: &Notification,
    ) -> PublishOutcome {
        let targets: Vec<(ChannelId, mpsc::Sender<Arc<PushMessage>>)> = {
            let inner = self.inner.lock();
            inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(idx, slot)| {
                    let live = slot.live.as_ref()?;
                    (live.subscriber.as_ref() == Some(subscriber)).then(|| {
                        (ChannelId { slot: idx as u32, generation: slot.generation }, live.tx.clone())
                    })
                })
                .collect()
        };
        self.deliver(targets, notification)
    }

    /// Send outside the lock, then drop channels found closed
    fn deliver(
        &self,
        targets: Vec<(ChannelId, mpsc::Sender<Arc<PushMessage>>)>,
        notification: &Notification,
    ) -> PublishOutcome {
        let message = Arc::new(PushMessage::from(notification));
        let mut outcome = PublishOutcome { delivered: 0, attempted: targets.len() as u64 };
        let mut closed = Vec::new();

        for (ch, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => outcome.delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(channel = %ch, notification_id = %notification.id, "channel_full");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(channel = %ch, notification_id = %notification.id, "channel_gone");
                    closed.push(ch);
                }
            }
        }

        if !closed.is_empty() {
            let mut inner = self.inner.lock();
            for ch in closed {
                inner.close(ch);
            }
        }
        outcome
    }

    /// Current members of a topic, in subscription order
    pub fn members(&self, zone: ZoneId) -> Vec<ChannelId> {
        self.inner.lock().topics.get(&zone).cloned().unwrap_or_default()
    }

    /// Topics a channel belongs to; empty for closed or unknown channels
    pub fn topics_of(&self, ch: ChannelId) -> Vec<ZoneId> {
        let mut inner = self.inner.lock();
        inner.live_mut(ch).map(|live| live.topics.to_vec()).unwrap_or_default()
    }

    pub fn live_channels(&self) -> usize {
        self.inner.lock().slots.iter().filter(|s| s.live.is_some()).count()
    }
}

//! Services - business logic and state management
//!
//! This module contains the alerting services, leaf-first:
//! - `zone_directory` - Monitoring zones and the `ZoneLookup` seam
//! - `ingestion` - Validation and id assignment for inbound reports
//! - `resolver` - Timeout-bounded zone resolution
//! - `presence` - Per-subject zone transitions and location history
//! - `notifier` - Notification synthesis and the `NotificationStore` seam
//! - `detections` - Detection log with filters and stats
//! - `subscriptions` - Subscriber to zone relations
//! - `fanout` - Live channel registry and publish
//! - `pipeline` - Orchestration of the detection and position flows

pub mod detections;
pub mod fanout;
pub mod ingestion;
pub mod notifier;
pub mod pipeline;
pub mod presence;
pub mod resolver;
pub mod subscriptions;
pub mod zone_directory;

// Re-export commonly used types
pub use fanout::{ChannelId, PublishOutcome, SubscriptionRegistry};
pub use notifier::{InMemoryNotificationStore, NotificationStore};
pub use pipeline::{AlertPipeline, DetectionReceipt, PositionAnswer};
pub use presence::PresenceWorker;
pub use zone_directory::{ZoneDirectory, ZoneLookup};

//! Domain models - core alerting types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Point`, `ZoneId`, `AlertLevel` - shared value types
//! - `Zone` - a circular monitoring zone around a beach
//! - `DetectionEvent` / `PositionReport` - inbound events
//! - `Notification` - the persisted alert record
//! - `geo` - haversine distance and containment
//! - `AlertError` - error taxonomy shared by every stage

pub mod error;
pub mod event;
pub mod geo;
pub mod notification;
pub mod types;
pub mod zone;

// Re-export commonly used types at module level
pub use error::AlertError;
pub use event::{DetectionEvent, DetectionInput, PositionInput, PositionReport};
pub use notification::{Notification, PushMessage};
pub use types::{AlertLevel, EventId, NotificationId, Point, SubscriberId, TimeWindow, ZoneId};
pub use zone::{Zone, ZoneSpec};

//! Alert notification record

use crate::domain::types::{AlertLevel, EventId, NotificationId, Point, SubscriberId, ZoneId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A notification synthesized from one detection event, or sent by an operator
///
/// At most one notification exists per `source_event_id`. `delivered_count`
/// only ever grows, and `published` is set once fan-out has run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Notification {
    pub id: NotificationId,
    pub source_event_id: EventId,
    pub zone_id: Option<ZoneId>,
    pub title: String,
    pub body: String,
    pub alert_level: AlertLevel,
    pub point: Point,
    pub created_at: DateTime<Utc>,
    pub delivered_count: u64,
    #[serde(default)]
    pub published: bool,
    /// Set for operator messages addressed to one subscriber
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recipient: Option<SubscriberId>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub read_at: Option<DateTime<Utc>>,
}

/// Payload pushed to a live channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushMessage {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub id: NotificationId,
    pub title: String,
    pub body: String,
    pub alert_level: AlertLevel,
    pub zone_id: Option<ZoneId>,
    pub location: Point,
    /// Epoch milliseconds of notification creation
    pub timestamp: i64,
}

impl From<&Notification> for PushMessage {
    fn from(n: &Notification) -> Self {
        Self {
            kind: "notification",
            id: n.id.clone(),
            title: n.title.clone(),
            body: n.body.clone(),
            alert_level: n.alert_level,
            zone_id: n.zone_id,
            location: n.point,
            timestamp: n.created_at.timestamp_millis(),
        }
    }
}

impl PushMessage {
    /// Single-line JSON for the session wire protocol
    pub fn to_json_line(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

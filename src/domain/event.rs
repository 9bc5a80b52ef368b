//! Inbound events: shark detections and subject position reports

use crate::domain::types::{EventId, Point};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Accepted shark detection
///
/// Created by ingestion and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionEvent {
    pub id: EventId,
    pub point: Point,
    /// Detector confidence, 0..=100
    pub confidence: f64,
    /// Shark species or other classification label
    pub category: String,
    pub observed_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub media_ref: Option<String>,
    /// Reporting drone / sensor name
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
}

/// Raw detection report as received over the wire
///
/// Every field is optional so validation can name exactly what is missing.
/// Aliases accept the field names used by drone clients.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionInput {
    #[serde(default)]
    pub detection_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default, alias = "sharkType")]
    pub category: Option<String>,
    #[serde(default, alias = "accuracy")]
    pub confidence: Option<f64>,
    #[serde(default, alias = "imageUrl")]
    pub media_ref: Option<String>,
    /// Inline image; decoded and stored by ingestion, replaces `media_ref`
    #[serde(default)]
    pub image_base64: Option<String>,
    #[serde(default, alias = "droneName")]
    pub source: Option<String>,
    #[serde(default)]
    pub size: Option<String>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl DetectionInput {
    pub fn new(latitude: f64, longitude: f64, category: &str, confidence: f64) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            category: Some(category.to_string()),
            confidence: Some(confidence),
            ..Default::default()
        }
    }

    pub fn with_detection_id(mut self, id: &str) -> Self {
        self.detection_id = Some(id.to_string());
        self
    }

    pub fn with_source(mut self, source: &str) -> Self {
        self.source = Some(source.to_string());
        self
    }
}

/// Position of a tracked subject (device, swimmer, drone)
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionReport {
    pub subject_id: String,
    pub point: Point,
    pub observed_at: DateTime<Utc>,
}

/// Raw position report as received over the wire
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionInput {
    #[serde(default, alias = "deviceId")]
    pub subject_id: Option<String>,
    #[serde(default)]
    pub latitude: Option<f64>,
    #[serde(default)]
    pub longitude: Option<f64>,
    #[serde(default)]
    pub observed_at: Option<DateTime<Utc>>,
}

impl PositionInput {
    pub fn new(subject_id: &str, latitude: f64, longitude: f64) -> Self {
        Self {
            subject_id: Some(subject_id.to_string()),
            latitude: Some(latitude),
            longitude: Some(longitude),
            observed_at: None,
        }
    }
}

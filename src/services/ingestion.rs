//! Event ingestion - validation and id assignment
//!
//! Turns raw wire inputs into immutable `DetectionEvent` / `PositionReport`
//! values. Every rejection names the offending field so the HTTP layer can
//! echo it back.

use crate::domain::error::AlertError;
use crate::domain::event::{DetectionEvent, DetectionInput, PositionInput, PositionReport};
use crate::domain::types::{EventId, Point};
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const MAX_CATEGORY_LEN: usize = 128;
const MAX_ID_LEN: usize = 128;

/// A validated detection whose inline image is not yet on disk
#[derive(Debug)]
pub struct AcceptedDetection {
    pub event: DetectionEvent,
    image: Option<Vec<u8>>,
}

pub struct Ingestion {
    media_dir: PathBuf,
}

impl Ingestion {
    pub fn new(media_dir: impl Into<PathBuf>) -> Self {
        Self { media_dir: media_dir.into() }
    }

    /// Validate a detection report and assign its event id
    ///
    /// A client-supplied `detection_id` is kept as the event id so retries of
    /// the same report dedupe downstream. An inline image is decoded here and
    /// written by `submit_detection`.
    pub fn accept_detection(&self, input: DetectionInput) -> Result<AcceptedDetection, AlertError> {
        let point = validate_point(input.latitude, input.longitude)?;

        let category = input
            .category
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| AlertError::missing("category"))?;
        if category.len() > MAX_CATEGORY_LEN {
            return Err(AlertError::validation("category", "too long"));
        }

        let confidence = input.confidence.ok_or_else(|| AlertError::missing("confidence"))?;
        if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
            return Err(AlertError::validation("confidence", "must be between 0 and 100"));
        }

        let id = match input.detection_id.as_deref().map(str::trim) {
            Some("") => return Err(AlertError::validation("detectionId", "must not be empty")),
            Some(id) if id.len() > MAX_ID_LEN => {
                return Err(AlertError::validation("detectionId", "too long"))
            }
            Some(id) => EventId(id.to_string()),
            None => EventId::generate(),
        };

        let image = match input.image_base64.as_deref().filter(|s| !s.is_empty()) {
            Some(encoded) => Some(decode_image(encoded)?),
            None => None,
        };

        let event = DetectionEvent {
            id,
            point,
            confidence,
            category: category.to_string(),
            observed_at: input.observed_at.unwrap_or_else(Utc::now),
            media_ref: input.media_ref.filter(|m| !m.trim().is_empty()),
            source: input.source.filter(|s| !s.trim().is_empty()),
            size: input.size.filter(|s| !s.trim().is_empty()),
        };
        Ok(AcceptedDetection { event, image })
    }

    /// Validate a detection report and store its inline image, if any
    pub async fn submit_detection(&self, input: DetectionInput) -> Result<DetectionEvent, AlertError> {
        let AcceptedDetection { mut event, image } = self.accept_detection(input)?;
        if let Some(bytes) = image {
            match self.store_image(&event.id, &bytes).await {
                Ok(path) => event.media_ref = Some(path),
                // Image is optional evidence; keep the detection
                Err(e) => warn!(event_id = %event.id, error = %e, "media_store_failed"),
            }
        }
        Ok(event)
    }

    pub fn submit_position(&self, input: PositionInput) -> Result<PositionReport, AlertError> {
        let subject_id = input
            .subject_id
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| AlertError::missing("deviceId"))?;
        if subject_id.len() > MAX_ID_LEN {
            return Err(AlertError::validation("deviceId", "too long"));
        }
        let point = validate_point(input.latitude, input.longitude)?;

        Ok(PositionReport {
            subject_id: subject_id.to_string(),
            point,
            observed_at: input.observed_at.unwrap_or_else(Utc::now),
        })
    }

    /// Write decoded image bytes as `<media_dir>/<event_id>.jpg`
    async fn store_image(&self, id: &EventId, bytes: &[u8]) -> std::io::Result<String> {
        tokio::fs::create_dir_all(&self.media_dir).await?;
        let file_name = format!("{}.jpg", sanitize_file_stem(&id.0));
        let path = self.media_dir.join(file_name);
        tokio::fs::write(&path, bytes).await?;
        debug!(event_id = %id, path = %path.display(), bytes = %bytes.len(), "media_stored");
        Ok(path_to_ref(&path))
    }
}

/// Both coordinates present and in range; errors name the failing field
pub fn validate_point(latitude: Option<f64>, longitude: Option<f64>) -> Result<Point, AlertError> {
    let latitude = latitude.ok_or_else(|| AlertError::missing("latitude"))?;
    let longitude = longitude.ok_or_else(|| AlertError::missing("longitude"))?;
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(AlertError::validation("latitude", "must be between -90 and 90"));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(AlertError::validation("longitude", "must be between -180 and 180"));
    }
    Ok(Point { latitude, longitude })
}

/// Decode base64 image data, accepting an optional `data:...;base64,` prefix
fn decode_image(encoded: &str) -> Result<Vec<u8>, AlertError> {
    let data = encoded.split_once(',').map_or(encoded, |(_, rest)| rest);
    STANDARD
        .decode(data.trim())
        .map_err(|_| AlertError::validation("imageBase64", "is not valid base64"))
}

fn sanitize_file_stem(id: &str) -> String {
    id.chars().map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' }).collect()
}

fn path_to_ref(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}

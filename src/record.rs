use anyhow::{anyhow, Result};
use serde::Serialize;
use time::OffsetDateTime;

/// One persisted row per processed upload.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct DetectionRecord {
    pub id: i64,
    /// Set when the row is written, not when the upload arrived.
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub num_people: u32,
    pub original_image_path: String,
    pub detected_image_path: String,
    /// Mean confidence of the counted detections, 0.0 when none.
    pub confidence_score: f64,
    /// Seconds spent inside the inference call.
    pub processing_time: f64,
}

/// Fields supplied by the upload pipeline. `id` and `timestamp` are
/// assigned by the store.
#[derive(Clone, Debug, PartialEq)]
pub struct NewDetection {
    pub num_people: u32,
    pub original_image_path: String,
    pub detected_image_path: String,
    pub confidence_score: f64,
    pub processing_time: f64,
}

impl DetectionRecord {
    pub(crate) fn from_new(id: i64, timestamp_us: i64, new: &NewDetection) -> Result<Self> {
        Ok(Self {
            id,
            timestamp: timestamp_from_micros(timestamp_us)?,
            num_people: new.num_people,
            original_image_path: new.original_image_path.clone(),
            detected_image_path: new.detected_image_path.clone(),
            confidence_score: new.confidence_score,
            processing_time: new.processing_time,
        })
    }
}

fn timestamp_from_micros(us: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::from_unix_timestamp_nanos(i128::from(us) * 1_000)
        .map_err(|e| anyhow!("timestamp {} out of range: {}", us, e))
}

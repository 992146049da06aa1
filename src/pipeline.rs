use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use image::{ImageFormat, Rgb, RgbImage};
use imageproc::drawing::draw_hollow_rect_mut;
use imageproc::rect::Rect;

use crate::detect::{Detection, DetectionSummary, PersonDetector};
use crate::error::{Error, Result};
use crate::images::{ImageStore, UploadNames};
use crate::record::{DetectionRecord, NewDetection};
use crate::storage::{lock_store, SharedStore};

const BOX_COLOR: Rgb<u8> = Rgb([0, 255, 0]);
const BOX_THICKNESS: u32 = 2;

/// Orchestrates one upload: store original, detect, annotate, persist.
///
/// If any step after the original is written fails, the files written so far
/// are removed before the error is returned.
pub struct UploadPipeline {
    images: Arc<ImageStore>,
    detector: Arc<PersonDetector>,
    store: SharedStore,
}

impl UploadPipeline {
    pub fn new(images: Arc<ImageStore>, detector: Arc<PersonDetector>, store: SharedStore) -> Self {
        Self {
            images,
            detector,
            store,
        }
    }

    pub fn process(&self, bytes: &[u8], content_type: &str) -> Result<DetectionRecord> {
        self.process_named(bytes, content_type, UploadNames::generate())
    }

    pub fn process_named(
        &self,
        bytes: &[u8],
        content_type: &str,
        names: UploadNames,
    ) -> Result<DetectionRecord> {
        if !is_image_content_type(content_type) {
            return Err(Error::InvalidInput("File must be an image".to_string()));
        }

        self.images.save(bytes, &names.original)?;
        let mut written = vec![names.original.clone()];
        let outcome = self.detect_and_record(bytes, &names, &mut written);
        if outcome.is_err() {
            self.discard(&written);
        }
        outcome
    }

    fn detect_and_record(
        &self,
        bytes: &[u8],
        names: &UploadNames,
        written: &mut Vec<String>,
    ) -> Result<DetectionRecord> {
        let mut bitmap = image::load_from_memory(bytes)
            .map_err(|e| Error::InvalidInput(format!("image could not be decoded: {}", e)))?
            .into_rgb8();

        let started = Instant::now();
        let detections = self.detector.detect(&bitmap).map_err(Error::Inference)?;
        let processing_time = started.elapsed().as_secs_f64();

        draw_detections(&mut bitmap, &detections);
        let annotated = encode_jpeg(&bitmap)?;
        self.images.save(&annotated, &names.detected)?;
        written.push(names.detected.clone());

        let summary = DetectionSummary::from_detections(&detections);
        let new = NewDetection {
            num_people: summary.num_people,
            original_image_path: names.original.clone(),
            detected_image_path: names.detected.clone(),
            confidence_score: summary.confidence_score,
            processing_time,
        };
        let record = lock_store(&self.store)?
            .create(&new)
            .map_err(Error::Storage)?;

        log::info!(
            "detection {} recorded: {} people, confidence {:.3}, inference {:.3}s",
            record.id,
            record.num_people,
            record.confidence_score,
            record.processing_time
        );
        Ok(record)
    }

    fn discard(&self, written: &[String]) {
        for name in written {
            if let Err(err) = self.images.delete(name) {
                log::warn!("failed to remove {} after failed upload: {:#}", name, err);
            }
        }
    }
}

pub fn is_image_content_type(content_type: &str) -> bool {
    content_type
        .trim()
        .to_ascii_lowercase()
        .starts_with("image/")
}

/// Outline every detection on the bitmap. Boxes are clipped to the image.
pub fn draw_detections(bitmap: &mut RgbImage, detections: &[Detection]) {
    let (width, height) = bitmap.dimensions();
    if width == 0 || height == 0 {
        return;
    }
    for detection in detections {
        let [x1, y1, x2, y2] = detection.bbox;
        let x1 = clip(x1, width);
        let y1 = clip(y1, height);
        let x2 = clip(x2, width);
        let y2 = clip(y2, height);
        for inset in 0..BOX_THICKNESS {
            let (left, top) = (x1 + inset, y1 + inset);
            let (right, bottom) = (x2.saturating_sub(inset), y2.saturating_sub(inset));
            if right <= left || bottom <= top {
                break;
            }
            let rect = Rect::at(left as i32, top as i32).of_size(right - left + 1, bottom - top + 1);
            draw_hollow_rect_mut(bitmap, rect, BOX_COLOR);
        }
    }
}

fn clip(value: f32, extent: u32) -> u32 {
    if !value.is_finite() || value <= 0.0 {
        return 0;
    }
    (value as u32).min(extent - 1)
}

fn encode_jpeg(bitmap: &RgbImage) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    bitmap
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Jpeg)
        .context("failed to encode annotated image")
        .map_err(Error::Internal)?;
    Ok(buf)
}

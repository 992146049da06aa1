//! YOLOv8-style output decoding.
//!
//! The raw head is a `[4 + num_classes, num_anchors]` matrix in row-major
//! order: rows 0..4 hold `cx, cy, w, h` in model-input pixels, the rest hold
//! per-class scores.

use std::cmp::Ordering;
use std::collections::HashMap;

use anyhow::{anyhow, Result};

use crate::detect::result::Detection;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DecodeParams {
    pub confidence_threshold: f32,
    pub iou_threshold: f32,
    /// Multiply model-space x coordinates by this to reach image space.
    pub scale_x: f32,
    pub scale_y: f32,
}

pub fn decode_predictions(
    data: &[f32],
    rows: usize,
    anchors: usize,
    params: &DecodeParams,
) -> Result<Vec<Detection>> {
    if rows <= 4 {
        return Err(anyhow!("model output has {} rows, expected at least 5", rows));
    }
    let expected = rows
        .checked_mul(anchors)
        .ok_or_else(|| anyhow!("model output dimensions overflow"))?;
    if data.len() != expected {
        return Err(anyhow!(
            "model output has {} values, expected {}x{}",
            data.len(),
            rows,
            anchors
        ));
    }

    let at = |row: usize, anchor: usize| data[row * anchors + anchor];
    let mut candidates = Vec::new();
    for i in 0..anchors {
        let mut best_score = f32::NEG_INFINITY;
        let mut best_class = 0u32;
        for class_row in 4..rows {
            let score = at(class_row, i);
            if score > best_score {
                best_score = score;
                best_class = (class_row - 4) as u32;
            }
        }
        if !best_score.is_finite() || best_score < params.confidence_threshold {
            continue;
        }

        let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
        candidates.push(Detection::new(
            [
                (cx - w / 2.0) * params.scale_x,
                (cy - h / 2.0) * params.scale_y,
                (cx + w / 2.0) * params.scale_x,
                (cy + h / 2.0) * params.scale_y,
            ],
            best_score.min(1.0),
            best_class,
        ));
    }

    Ok(non_max_suppression(candidates, params.iou_threshold))
}

/// Per-class greedy NMS. Output is sorted by confidence, highest first.
pub fn non_max_suppression(detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    let mut by_class: HashMap<u32, Vec<Detection>> = HashMap::new();
    for detection in detections {
        by_class.entry(detection.class_id).or_default().push(detection);
    }

    let mut kept = Vec::new();
    for (_, mut group) in by_class {
        group.sort_by(by_confidence_desc);
        let mut suppressed = vec![false; group.len()];
        for i in 0..group.len() {
            if suppressed[i] {
                continue;
            }
            for j in (i + 1)..group.len() {
                if !suppressed[j] && group[i].iou(&group[j]) > iou_threshold {
                    suppressed[j] = true;
                }
            }
            kept.push(group[i].clone());
        }
    }
    kept.sort_by(by_confidence_desc);
    kept
}

fn by_confidence_desc(a: &Detection, b: &Detection) -> Ordering {
    b.confidence
        .partial_cmp(&a.confidence)
        .unwrap_or(Ordering::Equal)
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: DecodeParams = DecodeParams {
        confidence_threshold: 0.25,
        iou_threshold: 0.45,
        scale_x: 2.0,
        scale_y: 0.5,
    };

    /// Build a row-major `[4 + classes, anchors]` matrix from per-anchor columns.
    fn matrix(columns: &[[f32; 6]]) -> Vec<f32> {
        let anchors = columns.len();
        let mut data = vec![0.0; 6 * anchors];
        for (i, column) in columns.iter().enumerate() {
            for (row, value) in column.iter().enumerate() {
                data[row * anchors + i] = *value;
            }
        }
        data
    }

    #[test]
    fn decodes_and_scales_boxes() {
        // cx, cy, w, h, person score, other score
        let data = matrix(&[
            [50.0, 50.0, 20.0, 40.0, 0.9, 0.1],
            [10.0, 10.0, 4.0, 4.0, 0.1, 0.05],
            [200.0, 100.0, 10.0, 10.0, 0.2, 0.6],
        ]);
        let detections = decode_predictions(&data, 6, 3, &PARAMS).unwrap();
        assert_eq!(detections.len(), 2);

        assert_eq!(detections[0].class_id, 0);
        assert!((detections[0].confidence - 0.9).abs() < 1e-6);
        assert_eq!(detections[0].bbox, [80.0, 15.0, 120.0, 35.0]);

        assert_eq!(detections[1].class_id, 1);
        assert!((detections[1].confidence - 0.6).abs() < 1e-6);
    }

    #[test]
    fn suppresses_overlaps_within_class_only() {
        let detections = vec![
            Detection::new([0.0, 0.0, 10.0, 10.0], 0.9, 0),
            Detection::new([1.0, 0.0, 11.0, 10.0], 0.8, 0),
            Detection::new([1.0, 0.0, 11.0, 10.0], 0.7, 2),
            Detection::new([50.0, 50.0, 60.0, 60.0], 0.6, 0),
        ];
        let kept = non_max_suppression(detections, 0.45);
        let confidences: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(confidences, vec![0.9, 0.7, 0.6]);
    }

    #[test]
    fn rejects_mismatched_shape() {
        assert!(decode_predictions(&[0.0; 10], 6, 3, &PARAMS).is_err());
        assert!(decode_predictions(&[0.0; 4], 4, 1, &PARAMS).is_err());
    }
}

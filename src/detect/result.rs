/// COCO class id of "person".
pub const PERSON_CLASS_ID: u32 = 0;

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    /// `[x1, y1, x2, y2]` in image pixels.
    pub bbox: [f32; 4],
    pub confidence: f32,
    pub class_id: u32,
}

impl Detection {
    pub fn new(bbox: [f32; 4], confidence: f32, class_id: u32) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
        }
    }

    pub fn area(&self) -> f32 {
        let [x1, y1, x2, y2] = self.bbox;
        (x2 - x1).max(0.0) * (y2 - y1).max(0.0)
    }

    pub fn iou(&self, other: &Detection) -> f32 {
        let ix1 = self.bbox[0].max(other.bbox[0]);
        let iy1 = self.bbox[1].max(other.bbox[1]);
        let ix2 = self.bbox[2].min(other.bbox[2]);
        let iy2 = self.bbox[3].min(other.bbox[3]);
        let intersection = (ix2 - ix1).max(0.0) * (iy2 - iy1).max(0.0);
        let union = self.area() + other.area() - intersection;
        if union <= 0.0 {
            0.0
        } else {
            intersection / union
        }
    }
}

/// Aggregate stored with each record.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct DetectionSummary {
    pub num_people: u32,
    pub confidence_score: f64,
}

impl DetectionSummary {
    /// Count and mean confidence; the mean of an empty list is 0.
    pub fn from_detections(detections: &[Detection]) -> Self {
        if detections.is_empty() {
            return Self {
                num_people: 0,
                confidence_score: 0.0,
            };
        }
        let sum: f64 = detections.iter().map(|d| f64::from(d.confidence)).sum();
        let mean = sum / detections.len() as f64;
        Self {
            num_people: u32::try_from(detections.len()).unwrap_or(u32::MAX),
            confidence_score: mean.clamp(0.0, 1.0),
        }
    }
}

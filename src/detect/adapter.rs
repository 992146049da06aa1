use std::sync::Mutex;

use anyhow::{anyhow, Result};
use image::RgbImage;

use crate::config::DetectorSettings;
use crate::detect::backend::DetectorBackend;
use crate::detect::backends::StubBackend;
use crate::detect::result::{Detection, PERSON_CLASS_ID};

/// The inference adapter shared by all request handlers.
///
/// Constructed once at startup. Backends take `&mut self`, so concurrent
/// requests are serialized on the inner lock.
pub struct PersonDetector {
    backend: Mutex<Box<dyn DetectorBackend>>,
    backend_name: &'static str,
    target_class: u32,
}

impl PersonDetector {
    pub fn new<B: DetectorBackend + 'static>(backend: B) -> Self {
        let backend_name = backend.name();
        Self {
            backend: Mutex::new(Box::new(backend)),
            backend_name,
            target_class: PERSON_CLASS_ID,
        }
    }

    /// Build the backend named in the settings. Any failure here is fatal
    /// for the process.
    pub fn from_settings(settings: &DetectorSettings) -> Result<Self> {
        match settings.backend.as_str() {
            "stub" => Ok(Self::new(StubBackend::new())),
            "tract" => Self::load_tract(settings),
            other => Err(anyhow!("unknown detector backend '{}'", other)),
        }
    }

    #[cfg(feature = "backend-tract")]
    fn load_tract(settings: &DetectorSettings) -> Result<Self> {
        let mut backend =
            crate::detect::TractBackend::new(&settings.model_path, settings.input_size)?
                .with_thresholds(settings.confidence_threshold, settings.iou_threshold);
        backend.warm_up()?;
        Ok(Self::new(backend))
    }

    #[cfg(not(feature = "backend-tract"))]
    fn load_tract(_settings: &DetectorSettings) -> Result<Self> {
        Err(anyhow!("built without the backend-tract feature"))
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend_name
    }

    /// Run the backend and keep only detections of the target class.
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let mut guard = self
            .backend
            .lock()
            .map_err(|_| anyhow!("detector backend lock poisoned"))?;
        let raw = guard.detect(image)?;
        Ok(raw
            .into_iter()
            .filter(|d| d.class_id == self.target_class)
            .collect())
    }
}

use std::sync::Arc;

use anyhow::Context;

use crate::config::ServerConfig;
use crate::detect::PersonDetector;
use crate::error::{Error, Result};
use crate::images::ImageStore;
use crate::pipeline::UploadPipeline;
use crate::query::{DetectionPage, DetectionQuery, QueryService};
use crate::record::DetectionRecord;
use crate::storage::{lock_store, shared, SharedStore, SqliteDetectionStore};

/// Everything the HTTP layer can ask for.
pub struct DetectionService {
    images: Arc<ImageStore>,
    store: SharedStore,
    pipeline: UploadPipeline,
    queries: QueryService,
}

impl DetectionService {
    pub fn new(images: Arc<ImageStore>, detector: Arc<PersonDetector>, store: SharedStore) -> Self {
        let pipeline = UploadPipeline::new(images.clone(), detector, store.clone());
        let queries = QueryService::new(store.clone());
        Self {
            images,
            store,
            pipeline,
            queries,
        }
    }

    /// Open the database and load the model. Failure here is fatal.
    pub fn from_config(cfg: &ServerConfig) -> Result<Self> {
        let store = SqliteDetectionStore::open(&cfg.db_path).map_err(Error::Storage)?;
        let detector = PersonDetector::from_settings(&cfg.detector)
            .with_context(|| {
                format!(
                    "failed to load {} detector from {}",
                    cfg.detector.backend,
                    cfg.detector.model_path.display()
                )
            })
            .map_err(Error::ModelLoad)?;
        log::info!("detector backend '{}' ready", detector.backend_name());
        Ok(Self::new(
            Arc::new(ImageStore::new(&cfg.upload_dir)),
            Arc::new(detector),
            shared(store),
        ))
    }

    pub fn upload(&self, bytes: &[u8], content_type: &str) -> Result<DetectionRecord> {
        self.pipeline.process(bytes, content_type)
    }

    pub fn list(&self, query: &DetectionQuery) -> Result<DetectionPage> {
        self.queries.list(query)
    }

    pub fn find(&self, id: i64) -> Result<DetectionRecord> {
        lock_store(&self.store)?
            .find_by_id(id)
            .map_err(Error::Storage)?
            .ok_or_else(detection_not_found)
    }

    pub fn image(&self, path: &str) -> Result<Vec<u8>> {
        self.images.read(path)
    }

    /// Remove a record, then best effort both of its files. A live record
    /// never points at removed files; file removal failures are only logged.
    pub fn delete(&self, id: i64) -> Result<()> {
        let record = self.find(id)?;
        let removed = lock_store(&self.store)?
            .delete(id)
            .map_err(Error::Storage)?;
        if !removed {
            return Err(detection_not_found());
        }
        for name in [&record.original_image_path, &record.detected_image_path] {
            if let Err(err) = self.images.delete(name) {
                log::warn!("error deleting file for detection {}: {:#}", id, err);
            }
        }
        log::info!("detection {} deleted", id);
        Ok(())
    }
}

fn detection_not_found() -> Error {
    Error::NotFound("Detection not found".to_string())
}

//! Upload directory access.
//!
//! Files are addressed by bare names relative to the upload root. Relative
//! sub-paths are tolerated on read, but absolute paths and `..` components
//! never resolve.

use anyhow::Context;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};

pub const DEFAULT_UPLOAD_DIR: &str = "uploads";

#[derive(Clone, Debug)]
pub struct ImageStore {
    root: PathBuf,
}

impl ImageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Write `bytes` under `name`, creating the upload directory if needed.
    pub fn save(&self, bytes: &[u8], name: &str) -> Result<PathBuf> {
        let path = self
            .resolve(name)
            .ok_or_else(|| Error::InvalidInput(format!("invalid image name '{}'", name)))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))
                .map_err(Error::Storage)?;
        }
        std::fs::write(&path, bytes)
            .with_context(|| format!("failed to write {}", path.display()))
            .map_err(Error::Storage)?;
        Ok(path)
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        let not_found = || Error::NotFound("Image not found".to_string());
        let path = self.resolve(name).ok_or_else(not_found)?;
        if !path.is_file() {
            return Err(not_found());
        }
        match std::fs::read(&path) {
            Ok(bytes) => Ok(bytes),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(not_found()),
            Err(err) => Err(Error::Storage(
                anyhow::Error::new(err).context(format!("failed to read {}", path.display())),
            )),
        }
    }

    /// Remove `name`. A missing file is not an error; returns whether a file
    /// was actually removed.
    pub fn delete(&self, name: &str) -> anyhow::Result<bool> {
        let Some(path) = self.resolve(name) else {
            log::warn!("refusing to delete image outside upload dir: {}", name);
            return Ok(false);
        };
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                log::warn!("image already absent: {}", path.display());
                Ok(false)
            }
            Err(err) => {
                Err(anyhow::Error::new(err).context(format!("failed to delete {}", path.display())))
            }
        }
    }

    pub fn exists(&self, name: &str) -> bool {
        self.resolve(name).is_some_and(|path| path.is_file())
    }

    fn resolve(&self, name: &str) -> Option<PathBuf> {
        let relative = Path::new(name);
        if name.is_empty() {
            return None;
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
            }
        }
        Some(self.root.join(relative))
    }
}

/// Filenames for one upload, sharing a request-local timestamp.
///
/// Two uploads inside the same microsecond collide; that rate is not
/// expected for this service.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadNames {
    pub original: String,
    pub detected: String,
}

impl UploadNames {
    pub fn generate() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_timestamp(since_epoch)
    }

    pub fn from_timestamp(since_epoch: Duration) -> Self {
        let stamp = format!("{}.{:06}", since_epoch.as_secs(), since_epoch.subsec_micros());
        Self {
            original: format!("original_{}.jpg", stamp),
            detected: format!("detected_{}.jpg", stamp),
        }
    }
}

/// Content type served for a stored image, guessed from its extension.
pub fn content_type_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase());
    match ext.as_deref() {
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("png") => "image/png",
        Some("gif") => "image/gif",
        Some("bmp") => "image/bmp",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}

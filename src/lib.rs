//! headcount
//!
//! Counts the people in uploaded images and keeps a browsable history.
//!
//! # Architecture
//!
//! An upload flows through the [`pipeline::UploadPipeline`]:
//!
//! 1. The original bytes are written to the [`images::ImageStore`].
//! 2. The bytes are decoded and handed to the [`detect::PersonDetector`],
//!    which only ever returns detections of the person class.
//! 3. Boxes are drawn onto the bitmap and the annotated copy is stored.
//! 4. A [`record::DetectionRecord`] is persisted through the
//!    [`storage::DetectionStore`].
//!
//! Reads go through the [`query::QueryService`]. The [`api`] module exposes
//! everything over a small HTTP/1.1 server.
//!
//! # Module Structure
//!
//! - `detect`: detector backends and the person-only adapter
//! - `images`: upload directory access and generated filenames
//! - `storage`: SQLite and in-memory record stores
//! - `query`: filtered, paginated listing
//! - `pipeline`: upload orchestration
//! - `service`: the operations served by the API
//! - `api`: HTTP server

use anyhow::Result;
use rusqlite::{Connection, OpenFlags};
use std::time::{SystemTime, UNIX_EPOCH};

pub mod api;
pub mod config;
pub mod detect;
pub mod error;
pub mod images;
pub mod pipeline;
pub mod query;
pub mod record;
pub mod service;
pub mod storage;

pub use detect::{Detection, DetectionSummary, DetectorBackend, PersonDetector, StubBackend};
pub use error::Error;
pub use images::{ImageStore, UploadNames};
pub use pipeline::UploadPipeline;
pub use query::{DetectionPage, DetectionQuery, QueryService};
pub use record::{DetectionRecord, NewDetection};
pub use service::DetectionService;
pub use storage::{DetectionStore, InMemoryDetectionStore, SharedStore, SqliteDetectionStore};

pub(crate) fn open_db_connection(db_path: &str) -> Result<Connection> {
    if db_path.starts_with("file:") {
        return Ok(Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_URI,
        )?);
    }
    Ok(Connection::open(db_path)?)
}

/// Microseconds since the Unix epoch.
pub fn now_micros() -> Result<i64> {
    let now = SystemTime::now().duration_since(UNIX_EPOCH)?;
    Ok(i64::try_from(now.as_micros())?)
}

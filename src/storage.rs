use anyhow::{anyhow, Context, Result};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error;
use crate::query::{DetectionPage, DetectionQuery};
use crate::record::{DetectionRecord, NewDetection};
use crate::{now_micros, open_db_connection};

/// Single-table persistence for detection records.
pub trait DetectionStore: Send {
    /// Persist a record stamped with the given creation time.
    fn insert(&mut self, new: &NewDetection, timestamp_us: i64) -> Result<DetectionRecord>;

    /// Persist a record stamped with the current time.
    fn create(&mut self, new: &NewDetection) -> Result<DetectionRecord> {
        let timestamp_us = now_micros()?;
        self.insert(new, timestamp_us)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<DetectionRecord>>;

    /// Remove a record. Returns false when no such record existed.
    fn delete(&mut self, id: i64) -> Result<bool>;

    fn query(&self, query: &DetectionQuery) -> Result<DetectionPage>;
}

pub type SharedStore = Arc<Mutex<dyn DetectionStore>>;

pub fn shared<S: DetectionStore + 'static>(store: S) -> SharedStore {
    Arc::new(Mutex::new(store))
}

pub(crate) fn lock_store(
    store: &SharedStore,
) -> error::Result<MutexGuard<'_, dyn DetectionStore + 'static>> {
    store
        .lock()
        .map_err(|_| error::Error::Internal(anyhow!("detection store lock poisoned")))
}

const SELECT_COLUMNS: &str = "id, timestamp, num_people, original_image_path, \
     detected_image_path, confidence_score, processing_time";

pub struct SqliteDetectionStore {
    conn: Connection,
}

impl SqliteDetectionStore {
    pub fn open(db_path: &str) -> Result<Self> {
        let conn = open_db_connection(db_path)
            .with_context(|| format!("failed to open database {}", db_path))?;
        let mut store = Self { conn };
        store.ensure_schema(db_path)?;
        Ok(store)
    }

    fn ensure_schema(&mut self, db_path: &str) -> Result<()> {
        if db_path != ":memory:" && !db_path.contains("mode=memory") {
            // journal_mode returns a row, so it cannot go through execute_batch
            self.conn
                .query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        }
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS detections (
              id INTEGER PRIMARY KEY AUTOINCREMENT,
              timestamp INTEGER NOT NULL,
              num_people INTEGER NOT NULL CHECK (num_people >= 0),
              original_image_path TEXT NOT NULL,
              detected_image_path TEXT NOT NULL,
              confidence_score REAL NOT NULL DEFAULT 0.0,
              processing_time REAL NOT NULL DEFAULT 0.0
            );

            CREATE INDEX IF NOT EXISTS idx_detections_recent
              ON detections(timestamp DESC, id DESC);
            "#,
        )?;
        Ok(())
    }
}

struct RawRow {
    id: i64,
    timestamp_us: i64,
    num_people: i64,
    original_image_path: String,
    detected_image_path: String,
    confidence_score: f64,
    processing_time: f64,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp_us: row.get(1)?,
            num_people: row.get(2)?,
            original_image_path: row.get(3)?,
            detected_image_path: row.get(4)?,
            confidence_score: row.get(5)?,
            processing_time: row.get(6)?,
        })
    }

    fn into_record(self) -> Result<DetectionRecord> {
        let num_people = u32::try_from(self.num_people)
            .map_err(|_| anyhow!("corrupt detection {}: num_people out of range", self.id))?;
        let new = NewDetection {
            num_people,
            original_image_path: self.original_image_path,
            detected_image_path: self.detected_image_path,
            confidence_score: self.confidence_score,
            processing_time: self.processing_time,
        };
        DetectionRecord::from_new(self.id, self.timestamp_us, &new)
    }
}

impl DetectionStore for SqliteDetectionStore {
    fn insert(&mut self, new: &NewDetection, timestamp_us: i64) -> Result<DetectionRecord> {
        self.conn.execute(
            r#"
            INSERT INTO detections(timestamp, num_people, original_image_path,
                                   detected_image_path, confidence_score, processing_time)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                timestamp_us,
                i64::from(new.num_people),
                new.original_image_path,
                new.detected_image_path,
                new.confidence_score,
                new.processing_time
            ],
        )?;
        let id = self.conn.last_insert_rowid();
        DetectionRecord::from_new(id, timestamp_us, new)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<DetectionRecord>> {
        let sql = format!("SELECT {} FROM detections WHERE id = ?1", SELECT_COLUMNS);
        let row = self
            .conn
            .query_row(&sql, params![id], RawRow::from_row)
            .optional()?;
        row.map(RawRow::into_record).transpose()
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let removed = self
            .conn
            .execute("DELETE FROM detections WHERE id = ?1", params![id])?;
        Ok(removed > 0)
    }

    fn query(&self, query: &DetectionQuery) -> Result<DetectionPage> {
        let (filter, mut values) = query.where_clause();

        let count_sql = format!("SELECT COUNT(*) FROM detections{}", filter);
        let total: i64 = self
            .conn
            .query_row(&count_sql, params_from_iter(values.iter()), |row| row.get(0))?;

        let skip = i64::try_from(query.skip).map_err(|_| anyhow!("skip exceeds i64 range"))?;
        values.push(rusqlite::types::Value::Integer(i64::from(query.limit)));
        values.push(rusqlite::types::Value::Integer(skip));
        let page_sql = format!(
            "SELECT {} FROM detections{} ORDER BY timestamp DESC, id DESC LIMIT ? OFFSET ?",
            SELECT_COLUMNS, filter
        );
        let mut stmt = self.conn.prepare(&page_sql)?;
        let rows = stmt
            .query_map(params_from_iter(values.iter()), RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let items = rows
            .into_iter()
            .map(RawRow::into_record)
            .collect::<Result<Vec<_>>>()?;
        Ok(DetectionPage {
            total: total as u64,
            items,
        })
    }
}

#[derive(Clone, Debug, Default)]
pub struct InMemoryDetectionStore {
    records: Vec<DetectionRecord>,
    next_id: i64,
}

impl DetectionStore for InMemoryDetectionStore {
    fn insert(&mut self, new: &NewDetection, timestamp_us: i64) -> Result<DetectionRecord> {
        self.next_id += 1;
        let record = DetectionRecord::from_new(self.next_id, timestamp_us, new)?;
        self.records.push(record.clone());
        Ok(record)
    }

    fn find_by_id(&self, id: i64) -> Result<Option<DetectionRecord>> {
        Ok(self.records.iter().find(|r| r.id == id).cloned())
    }

    fn delete(&mut self, id: i64) -> Result<bool> {
        let before = self.records.len();
        self.records.retain(|r| r.id != id);
        Ok(self.records.len() != before)
    }

    fn query(&self, query: &DetectionQuery) -> Result<DetectionPage> {
        let mut matching: Vec<&DetectionRecord> =
            self.records.iter().filter(|r| query.matches(r)).collect();
        matching.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then_with(|| b.id.cmp(&a.id))
        });
        let total = matching.len() as u64;
        let skip = usize::try_from(query.skip).unwrap_or(usize::MAX);
        let items = matching
            .into_iter()
            .skip(skip)
            .take(query.limit as usize)
            .cloned()
            .collect();
        Ok(DetectionPage { total, items })
    }
}

use rusqlite::types::Value;
use serde::Serialize;

use crate::error::{Error, Result};
use crate::record::DetectionRecord;
use crate::storage::{lock_store, SharedStore};

pub const DEFAULT_LIMIT: u32 = 10;
/// Largest offset SQLite accepts.
pub const MAX_SKIP: u64 = i64::MAX as u64;

/// Filter, sort and pagination parameters for listing detections.
///
/// Filters are conjunctive and inclusive. Results are always ordered by
/// `timestamp` descending with `id` descending as the tie-break.
#[derive(Clone, Debug, PartialEq)]
pub struct DetectionQuery {
    pub skip: u64,
    pub limit: u32,
    pub min_people: Option<u32>,
    pub max_people: Option<u32>,
    pub min_confidence: Option<f64>,
}

impl Default for DetectionQuery {
    fn default() -> Self {
        Self {
            skip: 0,
            limit: DEFAULT_LIMIT,
            min_people: None,
            max_people: None,
            min_confidence: None,
        }
    }
}

impl DetectionQuery {
    /// Build a query from decoded `key=value` pairs. Unknown keys are ignored.
    pub fn from_pairs<I, K, V>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        let mut query = Self::default();
        for (key, value) in pairs {
            let value = value.as_ref();
            match key.as_ref() {
                "skip" => query.skip = parse_field("skip", value)?,
                "limit" => query.limit = parse_field("limit", value)?,
                "min_people" => query.min_people = Some(parse_field("min_people", value)?),
                "max_people" => query.max_people = Some(parse_field("max_people", value)?),
                "min_confidence" => {
                    query.min_confidence = Some(parse_field("min_confidence", value)?)
                }
                _ => {}
            }
        }
        query.validate()?;
        Ok(query)
    }

    pub fn validate(&self) -> Result<()> {
        if self.skip > MAX_SKIP {
            return Err(Error::InvalidQuery(format!("skip must not exceed {}", MAX_SKIP)));
        }
        if self.limit == 0 {
            return Err(Error::InvalidQuery("limit must be greater than zero".into()));
        }
        if let Some(conf) = self.min_confidence {
            if !(0.0..=1.0).contains(&conf) {
                return Err(Error::InvalidQuery(
                    "min_confidence must be between 0 and 1".into(),
                ));
            }
        }
        Ok(())
    }

    pub fn matches(&self, record: &DetectionRecord) -> bool {
        self.min_people.map_or(true, |min| record.num_people >= min)
            && self.max_people.map_or(true, |max| record.num_people <= max)
            && self
                .min_confidence
                .map_or(true, |min| record.confidence_score >= min)
    }

    /// SQL `WHERE` fragment (empty when unfiltered) and its positional values.
    pub(crate) fn where_clause(&self) -> (String, Vec<Value>) {
        let mut terms = Vec::new();
        let mut values = Vec::new();
        if let Some(min) = self.min_people {
            terms.push("num_people >= ?");
            values.push(Value::Integer(i64::from(min)));
        }
        if let Some(max) = self.max_people {
            terms.push("num_people <= ?");
            values.push(Value::Integer(i64::from(max)));
        }
        if let Some(min) = self.min_confidence {
            terms.push("confidence_score >= ?");
            values.push(Value::Real(min));
        }
        if terms.is_empty() {
            (String::new(), values)
        } else {
            (format!(" WHERE {}", terms.join(" AND ")), values)
        }
    }
}

fn parse_field<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value.trim().parse().map_err(|_| {
        Error::InvalidQuery(format!("{} must be a non-negative number, got '{}'", name, value))
    })
}

/// One offset-selected slice of matching records plus the size of the
/// whole matching population.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct DetectionPage {
    pub total: u64,
    pub items: Vec<DetectionRecord>,
}

pub struct QueryService {
    store: SharedStore,
}

impl QueryService {
    pub fn new(store: SharedStore) -> Self {
        Self { store }
    }

    pub fn list(&self, query: &DetectionQuery) -> Result<DetectionPage> {
        query.validate()?;
        let store = lock_store(&self.store)?;
        store.query(query).map_err(Error::Storage)
    }
}

//! The unit of synchronisation: one price list with its validity window.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MalformedRecord;

/// A price list as fetched from upstream. Only `id` and `valid_until` are interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListRecord {
    pub id: String,
    pub valid_until: DateTime<Utc>,
    /// The full upstream document, kept as-is.
    pub payload: serde_json::Value,
}

impl ListRecord {
    pub fn new(id: impl Into<String>, valid_until: DateTime<Utc>, payload: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            valid_until,
            payload,
        }
    }

    /// Builds a record from an upstream response. The response must be an object carrying a
    /// non-empty string `id` and an RFC 3339 `validUntil`.
    pub fn from_upstream(value: serde_json::Value) -> Result<Self, MalformedRecord> {
        let obj = value.as_object().ok_or(MalformedRecord::NotAnObject)?;

        let id = obj
            .get("id")
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .ok_or(MalformedRecord::MissingId)?
            .to_string();

        let raw = obj
            .get("validUntil")
            .and_then(|v| v.as_str())
            .ok_or(MalformedRecord::MissingValidUntil)?;
        let valid_until = DateTime::parse_from_rfc3339(raw)
            .map_err(|e| MalformedRecord::InvalidValidUntil(format!("{raw:?}: {e}")))?
            .with_timezone(&Utc);

        Ok(Self {
            id,
            valid_until,
            payload: value,
        })
    }

    /// A record is stale once `now` has reached its `valid_until`.
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        self.valid_until <= now
    }
}

/// A record as held by the store, with the store-assigned key and ordering timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredList {
    pub key: String,
    pub received_at: DateTime<Utc>,
    pub record: ListRecord,
}

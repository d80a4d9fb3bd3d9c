use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::IdempotencyError;

/// Leading byte of every stored record; anything else is treated as corrupt.
const FORMAT_VERSION: u8 = 1;

/// Wire form of a record: bitcode around a JSON-encoded response so any
/// serde type (including `serde_json::Value`) can be stored.
#[derive(Debug, Serialize, Deserialize)]
struct StoredRecord {
    response: Option<String>,
    processed_at_ms: i64,
}

/// A completed operation and, optionally, the response it produced.
#[derive(Debug, Clone, PartialEq)]
pub struct IdempotencyRecord<T> {
    pub response: Option<T>,
    pub processed_at: DateTime<Utc>,
}

impl<T> IdempotencyRecord<T> {
    pub fn new(response: Option<T>) -> Self {
        Self {
            response,
            processed_at: Utc::now(),
        }
    }
}

impl<T: Serialize> IdempotencyRecord<T> {
    pub(crate) fn encode(&self, key: &str) -> Result<Vec<u8>, IdempotencyError> {
        let encode_error = |reason: String| IdempotencyError::Encode {
            key: key.to_string(),
            reason,
        };
        let response = self
            .response
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| encode_error(e.to_string()))?;
        let stored = StoredRecord {
            response,
            processed_at_ms: self.processed_at.timestamp_millis(),
        };
        let body = bitcode::serialize(&stored).map_err(|e| encode_error(e.to_string()))?;
        let mut bytes = Vec::with_capacity(body.len() + 1);
        bytes.push(FORMAT_VERSION);
        bytes.extend_from_slice(&body);
        Ok(bytes)
    }
}

impl<T: DeserializeOwned> IdempotencyRecord<T> {
    /// Decode a stored record. `None` means the bytes are corrupt or the
    /// response no longer fits `T`.
    pub(crate) fn decode(bytes: &[u8]) -> Option<Self> {
        let (version, body) = bytes.split_first()?;
        if *version != FORMAT_VERSION {
            return None;
        }
        let stored: StoredRecord = bitcode::deserialize(body).ok()?;
        let response = match stored.response {
            Some(json) => Some(serde_json::from_str(&json).ok()?),
            None => None,
        };
        let processed_at = Utc.timestamp_millis_opt(stored.processed_at_ms).single()?;
        Some(Self {
            response,
            processed_at,
        })
    }
}

/// Result of [`IdempotencyStore::check`](super::IdempotencyStore::check).
#[derive(Debug, Clone, PartialEq)]
pub struct CheckResult<T> {
    pub is_duplicate: bool,
    pub original_response: Option<T>,
}

impl<T> CheckResult<T> {
    pub(crate) fn not_found() -> Self {
        Self {
            is_duplicate: false,
            original_response: None,
        }
    }
}

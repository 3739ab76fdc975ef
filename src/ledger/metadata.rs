//! Structured metadata attached to ledger entries.
//!
//! Values are echoed back by the payment provider, which caps metadata values at
//! 500 characters. Longer strings are truncated with a visible marker before storage.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

pub const MAX_METADATA_VALUE_CHARS: usize = 500;
pub const MAX_METADATA_KEY_CHARS: usize = 40;
pub const MAX_METADATA_KEYS: usize = 50;
pub const TRUNCATION_MARKER: &str = "...[truncated]";

const _: [(); MAX_METADATA_VALUE_CHARS - TRUNCATION_MARKER.len()] =
    [(); MAX_METADATA_VALUE_CHARS - TRUNCATION_MARKER.len()];

pub type Metadata = BTreeMap<String, MetadataValue>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Integer(i64),
    Text(String),
}

impl From<&str> for MetadataValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for MetadataValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for MetadataValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl MetadataValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    #[error("metadata holds {count} keys, limit is {MAX_METADATA_KEYS}")]
    TooManyKeys { count: usize },
    #[error("metadata key must not be empty")]
    EmptyKey,
    #[error("metadata key '{key}' exceeds {MAX_METADATA_KEY_CHARS} characters")]
    KeyTooLong { key: String },
    #[error("metadata key '{key}' is reserved")]
    ReservedKey { key: String },
}

/// Validates keys and truncates oversized string values.
pub fn normalize_metadata(metadata: Metadata) -> Result<Metadata, MetadataError> {
    if metadata.len() > MAX_METADATA_KEYS {
        return Err(MetadataError::TooManyKeys {
            count: metadata.len(),
        });
    }

    let mut normalized = Metadata::new();
    for (key, value) in metadata {
        if key.trim().is_empty() {
            return Err(MetadataError::EmptyKey);
        }
        if key.chars().count() > MAX_METADATA_KEY_CHARS {
            return Err(MetadataError::KeyTooLong { key });
        }
        let value = match value {
            MetadataValue::Text(text) => MetadataValue::Text(truncate_value(text)),
            other => other,
        };
        normalized.insert(key, value);
    }
    Ok(normalized)
}

/// Caps a value at [`MAX_METADATA_VALUE_CHARS`] characters, marker included.
pub fn truncate_value(value: String) -> String {
    if value.chars().count() <= MAX_METADATA_VALUE_CHARS {
        return value;
    }
    let keep = MAX_METADATA_VALUE_CHARS - TRUNCATION_MARKER.chars().count();
    let mut truncated: String = value.chars().take(keep).collect();
    truncated.push_str(TRUNCATION_MARKER);
    assert_eq!(
        truncated.chars().count(),
        MAX_METADATA_VALUE_CHARS,
        "Truncated metadata value must fill the limit exactly"
    );
    truncated
}

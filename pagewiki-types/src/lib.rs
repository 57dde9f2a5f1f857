//! Shared types for pagewiki
//!
//! This crate provides the identifiers and persisted record shapes used by the
//! collaboration core: page/user/session ids, update log records, snapshots
//! and search blocks.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Page identifier. Doubles as the room key for live collaboration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PageId(pub String);

impl PageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque user identifier, resolved by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub String);

impl UserId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn anonymous() -> Self {
        Self("anonymous".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Identifier of one live connection. Unique per process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionId(pub u64);

impl SessionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0)
    }
}

/// One persisted edit fragment. Immutable once appended.
///
/// `seq` is strictly increasing per page, starting at 1.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRecord {
    pub page_id: PageId,
    pub seq: u64,
    pub author: UserId,
    pub fragment: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A materialized page state covering every update with `seq <= covered_seq`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Snapshot {
    pub page_id: PageId,
    pub version: u64,
    pub covered_seq: u64,
    pub state: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// A block as returned by the external engine's extraction endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedBlock {
    #[serde(rename = "type")]
    pub block_type: String,
    #[serde(default)]
    pub level: u32,
    #[serde(default)]
    pub headings_path: Vec<String>,
    #[serde(default)]
    pub plain_text: String,
    #[serde(default)]
    pub canonical_json: serde_json::Value,
    pub position: u32,
}

/// An indexed block belonging to a page, derived from one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchBlock {
    pub page_id: PageId,
    pub snapshot_version: u64,
    #[serde(flatten)]
    pub block: ExtractedBlock,
}

/// A search result row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchHit {
    pub page_id: PageId,
    pub position: u32,
    pub block_type: String,
    pub headings_path: Vec<String>,
    pub plain_text: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_is_transparent_in_json() {
        let id = PageId::new("page-42");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"page-42\"");
        assert_eq!(id.to_string(), "page-42");
    }

    #[test]
    fn test_extracted_block_uses_wire_field_names() {
        let raw = r#"{
            "type": "heading",
            "level": 2,
            "headings_path": ["Intro"],
            "plain_text": "Goals",
            "canonical_json": {"kind": "heading"},
            "position": 3
        }"#;
        let block: ExtractedBlock = serde_json::from_str(raw).unwrap();
        assert_eq!(block.block_type, "heading");
        assert_eq!(block.level, 2);
        assert_eq!(block.headings_path, vec!["Intro".to_string()]);
        assert_eq!(block.position, 3);
    }

    #[test]
    fn test_extracted_block_defaults_optional_fields() {
        let block: ExtractedBlock =
            serde_json::from_str(r#"{"type": "paragraph", "position": 0}"#).unwrap();
        assert_eq!(block.level, 0);
        assert!(block.headings_path.is_empty());
        assert!(block.canonical_json.is_null());
    }
}

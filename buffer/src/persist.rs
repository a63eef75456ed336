//! Compact persisted state: enough to reopen a buffer with its unsaved
//! edits. The encoding is an implementation detail; nothing outside this
//! crate should assume byte-level compatibility between versions.

use crate::edit::EditRecord;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactState {
    pub backing_path: Option<PathBuf>,
    /// Length of the backing file when the state was captured. Replay is
    /// only valid against a file of the same length.
    pub backing_len: u64,
    pub edits: Vec<EditRecord>,
}

impl CompactState {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

//! Edit records: what the shell asks for, and what the persistence layer
//! replays.

use serde::{Deserialize, Serialize};

/// Content for an insert.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EditSource {
    /// Bytes supplied directly (typed or pasted text).
    Bytes(Vec<u8>),
    /// A region of the buffer's backing file, spliced in without loading it.
    FileRegion { offset: u64, len: u64 },
}

impl EditSource {
    pub fn len(&self) -> u64 {
        match self {
            EditSource::Bytes(bytes) => bytes.len() as u64,
            EditSource::FileRegion { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One committed edit, in application order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum EditRecord {
    Insert { offset: u64, source: EditSource },
    Delete { start: u64, end: u64 },
}

use tarn_linemap::TreeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Failures of buffer operations.
///
/// Partial query answers are not errors -- they are ordinary return values
/// carrying missing ranges. Only conditions that reject or terminate work
/// surface here.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The edit would split a code point in a resident region.
    #[error("edit splits a character at offset {offset}")]
    InvalidEdit { offset: u64 },

    #[error("offset {offset} out of bounds (buffer length {len})")]
    OutOfBounds { offset: u64, len: u64 },

    /// An internal invariant broke; the buffer no longer accepts work.
    #[error("buffer quarantined: {0}")]
    Corruption(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),
}

impl From<TreeError> for Error {
    fn from(err: TreeError) -> Self {
        match err {
            TreeError::OutOfBounds { offset, len } => Error::OutOfBounds { offset, len },
        }
    }
}

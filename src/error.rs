use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Error type for machi operations.
#[derive(Error, Debug)]
pub enum MachiError {
    /// IO error from file operations.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Exclusive file creation failed because the file already exists.
    #[error("file already exists: {}", .0.display())]
    AlreadyExists(PathBuf),

    /// A positional write stored fewer bytes than requested.
    #[error("short write: {written} of {expected} bytes")]
    ShortWrite {
        /// Bytes the caller asked to write.
        expected: usize,
        /// Bytes actually written.
        written: usize,
    },

    /// A positional read returned fewer bytes than requested.
    #[error("short read: {read} of {expected} bytes")]
    ShortRead {
        /// Bytes the caller asked to read.
        expected: usize,
        /// Bytes actually read.
        read: usize,
    },

    /// Payload bytes do not match the CRC recorded at append time.
    #[error(
        "CRC mismatch at generation {gen} offset {offset}: \
         stored {stored:#010x}, computed {computed:#010x}"
    )]
    CorruptCrc {
        /// Generation holding the entry.
        gen: u64,
        /// Offset of the entry in the data log.
        offset: u64,
        /// CRC recorded in the index.
        stored: u32,
        /// CRC of the bytes actually read.
        computed: u32,
    },

    /// An index record carries a state that is neither live nor trimmed.
    #[error("invalid state {state} at generation {gen} offset {offset}")]
    InvalidState {
        /// The unrecognized state value.
        state: i32,
        /// Generation holding the record.
        gen: u64,
        /// Offset the record describes.
        offset: u64,
    },

    /// An index record's embedded generation disagrees with its filename.
    #[error("generation mismatch in index: expected {expected}, found {found}")]
    GenerationMismatch {
        /// Generation number parsed from the filename.
        expected: u64,
        /// Generation number embedded in the record.
        found: u64,
    },

    /// A shared lock was re-acquired on a thread that already holds one.
    #[error("the lock is not reentrant")]
    NotReentrant,
}

/// Result type alias for machi operations.
pub type Result<T> = std::result::Result<T, MachiError>;

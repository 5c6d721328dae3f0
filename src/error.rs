use std::io;

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, QuarryError>;

/// Errors surfaced by the storage and concurrency layers.
#[derive(Debug, Error)]
pub enum QuarryError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("invalid page id {0:#018x}")]
    InvalidPageId(u64),
    #[error("buffer pool exhausted: every frame is pinned")]
    PoolExhausted,
    #[error("descriptor word capacity exceeded")]
    DescriptorFull,
    #[error("duplicate target address in descriptor")]
    DuplicateAddress,
}

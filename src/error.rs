//! Error type shared by the drive registry, image loaders and configuration.
//!
//! Wire-level failures (bad frame tags, checksum mismatches, refused commands)
//! never show up here: the framing layer answers them on the wire and goes
//! back to idle. These errors are for the host side: mounting, scanning and
//! loading configuration.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, SioError>;

#[derive(Debug, Error)]
pub enum SioError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt disk image: {0}")]
    CorruptImage(&'static str),

    #[error("unsupported disk image feature: {0}")]
    Unsupported(&'static str),

    #[error("drive unit {0} out of range")]
    UnitOutOfRange(usize),

    #[error("drive unit {0} has no image mounted")]
    NotMounted(usize),

    /// The slot is currently occupied by a partition of the fixed disk.
    #[error("drive unit {0} is a partition of the fixed disk")]
    PartitionSlot(usize),

    #[error("no partition table found on fixed disk image")]
    NoPartitionTable,

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl From<serde_json::Error> for SioError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidConfig(err.to_string())
    }
}

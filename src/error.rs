// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{
    coding::{DecodeError, EncodeError},
    sstable::Generation,
};

/// Represents errors that can occur in the storage engine
#[derive(Debug)]
pub enum Error {
    /// I/O error
    Io(std::io::Error),

    /// Serialization failed
    Encode(EncodeError),

    /// Deserialization failed
    Decode(DecodeError),

    /// A sorted table file is corrupt (bad magic, truncated block,
    /// undecodable atom); the table has been flagged suspect
    Corrupt(Generation),

    /// Invalid or unparsable data format version
    InvalidVersion([u8; 2]),

    /// A table's statistics sidecar was written by a different partitioner
    PartitionerMismatch {
        /// Partitioner the store is configured with
        expected: String,
        /// Partitioner recorded in the sidecar
        got: String,
    },

    /// The store halted writes after an unrecoverable flush failure
    WritesHalted,

    /// The operation observed a stop signal and was cancelled
    Stopped,

    /// Some required table files could not be recovered from disk
    Unrecoverable,
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageError: {self:?}")
    }
}

impl std::error::Error for Error {}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value)
    }
}

impl From<EncodeError> for Error {
    fn from(value: EncodeError) -> Self {
        Self::Encode(value)
    }
}

impl From<DecodeError> for Error {
    fn from(value: DecodeError) -> Self {
        Self::Decode(value)
    }
}

/// Storage engine result
pub type Result<T> = std::result::Result<T, Error>;

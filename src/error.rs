//! Error taxonomy for the trace store
//!
//! Every storage component returns [`StoreError`] rather than panicking.
//! Callers can tell the classes apart:
//!
//! - **Recoverable I/O** (`Io`, `Json`, `Config`): surfaced verbatim, never retried here.
//! - **Consistency** (`Conflict`): re-read metadata and retry the update.
//! - **Lifecycle** (`Closed`, `ReadOnly`): the handle cannot serve the request.
//! - **Corruption** (`Broken`, `Corrupt`, `Incompatible`): on-disk state cannot be trusted.
//! - **Protocol** (`UnknownTransaction`, `StackTooDeep`, `NegativeGid`): the event stream is malformed.

use crate::types::{Gid, LogId, TxId};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while reading or writing a trace store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Config(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("resource is already closed")]
    Closed,

    #[error("cannot write to a read-only resource")]
    ReadOnly,

    #[error("failed to update because of a conflict: expected version {expected}, current version {current}")]
    Conflict { expected: u64, current: u64 },

    #[error("log {0} is broken: some of its files are missing")]
    Broken(LogId),

    #[error("log {0} does not exist")]
    NotFound(LogId),

    #[error("log {0} is already registered")]
    AlreadyExists(LogId),

    #[error("data format is not compatible: found {found_major}.{found_minor}, supported major version {supported_major}")]
    Incompatible {
        found_major: u64,
        found_minor: u64,
        supported_major: u64,
    },

    #[error("record {index} is out of range ({records} records)")]
    RecordOutOfRange { index: u64, records: u64 },

    #[error("slot {0} holds no record")]
    EmptySlot(u64),

    #[error("segment {index} is out of range ({segments} segments)")]
    SegmentOutOfRange { index: usize, segments: usize },

    #[error("corrupted record in {path}: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("stack depth {depth} exceeds the maximum of {max} frames")]
    StackTooDeep { depth: usize, max: usize },

    #[error("no open call for transaction {0}")]
    UnknownTransaction(TxId),

    #[error("goroutine id {0} is negative and has no slot")]
    NegativeGid(Gid),

    #[error("invalid log id {0:?}: expected 32 hex characters")]
    InvalidLogId(String),

    #[error("invalid symbols: {0}")]
    InvalidSymbols(String),
}

/// Result type for trace store operations
pub type Result<T> = std::result::Result<T, StoreError>;

impl StoreError {
    /// True when the failure is an optimistic-concurrency conflict.
    pub fn is_conflict(&self) -> bool {
        matches!(self, StoreError::Conflict { .. })
    }

    pub(crate) fn corrupt(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StoreError::Corrupt {
            path: path.into(),
            reason: reason.into(),
        }
    }
}

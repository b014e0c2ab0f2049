//! Error types for the plock coordination subsystem.
//!
//! This module provides a unified error type [`PlockError`] for all plockd
//! operations, along with a convenient [`Result`] type alias.
//!
//! Every locally originated lock or unlock request must receive exactly one
//! result record on the kernel channel, so errors that terminate a request
//! early are mapped to POSIX errno values via [`PlockError::to_errno`].

use std::io;
use thiserror::Error;

/// Main error type for plockd operations.
#[derive(Error, Debug)]
pub enum PlockError {
    // Request errors, reported to the kernel channel
    #[error("Unknown mount group: {0:#x}")]
    UnknownGroup(u32),

    #[error("Unknown lock resource: {0:#x}")]
    UnknownResource(u64),

    #[error("Plock processing is offline")]
    PlocksOffline,

    #[error("Invalid lock operation type: {0}")]
    InvalidOpType(u8),

    // Wire protocol errors
    #[error("Message too short: {got} bytes, need {need}")]
    ShortMessage { got: usize, need: usize },

    #[error("Protocol version mismatch: got {got}, support {support}")]
    VersionMismatch { got: u16, support: u16 },

    #[error("Invalid message kind: {0}")]
    InvalidMessageKind(u8),

    // Checkpoint transfer errors
    #[error("Bad checkpoint section name: {0}")]
    BadSectionName(String),

    #[error("Bad checkpoint section length: {0} bytes")]
    BadSectionLength(usize),

    #[error("Checkpoint service error: {0}")]
    Snapshot(String),

    // Transport errors
    #[error("Broadcast transport is flow controlled")]
    FlowControlled,

    #[error("Broadcast send failed: {0}")]
    SendFailed(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // External errors
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl PlockError {
    /// Convert to a POSIX errno for a kernel channel result record.
    ///
    /// The values mirror what the kernel-side lock interface expects for
    /// each failure class.
    pub fn to_errno(&self) -> i32 {
        match self {
            PlockError::UnknownGroup(_) => libc::EEXIST,
            PlockError::UnknownResource(_) => libc::ENOENT,
            PlockError::PlocksOffline => libc::ENOSYS,
            PlockError::InvalidOpType(_) => libc::EINVAL,
            PlockError::FlowControlled => libc::EBUSY,
            PlockError::Io(e) => e.raw_os_error().unwrap_or(libc::EIO),
            _ => libc::EIO,
        }
    }

    /// Check if the error is transient and the operation can be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PlockError::FlowControlled)
    }
}

impl From<serde_json::Error> for PlockError {
    fn from(e: serde_json::Error) -> Self {
        PlockError::Config(e.to_string())
    }
}

/// Result type alias for plockd operations.
pub type Result<T> = std::result::Result<T, PlockError>;

//! Errors raised by the synchronization engine.
//!
//! Batch operations never fail as a whole: a bad element is reported next
//! to the index it came from and the rest of the batch is processed.

use modelsync_env::Euid;

/// Errors that can occur during synchronization operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SyncError {
    #[error("Record {euid} is destroyed")]
    InvalidRecordState { euid: Euid },

    #[error("Record kind mismatch: expected {expected}, found {found}")]
    KindMismatch { expected: String, found: String },

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Unknown runloop channel: {0}")]
    UnknownChannel(String),

    #[error("{0} has been torn down")]
    TornDown(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

//! Error types for the mailq-store crate.
//!
//! Store errors fall in two groups. Availability failures (I/O,
//! serialization, `Unavailable`) mean the store itself cannot be trusted and
//! are fatal to whoever is polling it. Transition failures (`LeaseLost`,
//! `Terminal`, `InvalidTransition`, `NotFound`) concern a single item and
//! are absorbed by the caller.

use std::io;

use thiserror::Error;

use crate::{ItemStatus, QueueItemId};

/// Top-level store error type.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serialization or deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] SerializationError),

    /// Item not found in the store.
    #[error("Queue item not found: {0}")]
    NotFound(QueueItemId),

    /// The caller's lease no longer matches the item's lease.
    #[error("Lease lost for queue item {0}")]
    LeaseLost(QueueItemId),

    /// The item already reached a terminal status.
    #[error("Queue item {id} is already {status}")]
    Terminal { id: QueueItemId, status: ItemStatus },

    /// The requested transition is not valid from the current status.
    #[error("Cannot {operation} queue item {id} while it is {status}")]
    InvalidTransition {
        id: QueueItemId,
        status: ItemStatus,
        operation: &'static str,
    },

    /// Store configuration or path validation failed.
    #[error("Invalid store configuration: {0}")]
    Validation(String),
}

/// Serialization and deserialization errors.
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("Bincode encode error: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("Bincode decode error: {0}")]
    Decode(#[from] bincode::error::DecodeError),

    /// The persisted record does not match the file it was read from.
    #[error("Corrupted queue item data: {0}")]
    Corrupted(String),
}

impl StoreError {
    /// Returns `true` if the store itself is failing, as opposed to a
    /// single item refusing a transition.
    #[must_use]
    pub const fn is_system(&self) -> bool {
        matches!(
            self,
            Self::Unavailable(_) | Self::Io(_) | Self::Serialization(_) | Self::Validation(_)
        )
    }
}

/// Specialized `Result` type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_is_system() {
        let err: StoreError = io::Error::new(io::ErrorKind::NotFound, "gone").into();
        assert!(err.is_system());
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn test_item_errors_are_not_system() {
        let id = QueueItemId::generate();
        assert!(!StoreError::LeaseLost(id).is_system());
        assert!(!StoreError::NotFound(id).is_system());

        let err = StoreError::Terminal {
            id,
            status: ItemStatus::Sent,
        };
        assert!(!err.is_system());
        assert_eq!(err.to_string(), format!("Queue item {id} is already sent"));
    }
}

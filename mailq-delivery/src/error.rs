//! Typed error handling for delivery operations.
//!
//! Three categories drive three different reactions:
//! - [`TransportError::Transient`] - defer and retry with backoff
//! - [`TransportError::Permanent`] - dead-letter immediately
//! - [`SystemError`] - the queue's own infrastructure failed; fatal to the
//!   manager and surfaced to its owner

use mailq_store::StoreError;
use thiserror::Error;

use crate::{ManagerState, policy::FailureClass};

/// Classified outcome of a failed delivery attempt.
///
/// Returned by a [`MailTransport`](crate::MailTransport); the transport, not
/// the queue, decides which side of the line a failure falls on.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Failure that may succeed on a later attempt (e.g., 4xx SMTP codes).
    #[error("Transient failure: {0}")]
    Transient(#[from] TemporaryError),

    /// Failure that will not succeed however often it is retried (e.g., 5xx SMTP codes).
    #[error("Permanent failure: {0}")]
    Permanent(#[from] PermanentError),
}

/// Permanent errors that should not be retried.
#[derive(Debug, Error)]
pub enum PermanentError {
    /// Recipient address is invalid or rejected by the server.
    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),

    /// Domain does not exist or has no mail servers.
    #[error("Domain not found: {0}")]
    DomainNotFound(String),

    /// Message was rejected by the server (e.g., policy violation, spam).
    #[error("Message rejected: {0}")]
    MessageRejected(String),

    /// Message size exceeds server limits.
    #[error("Message too large: {0}")]
    MessageTooLarge(String),

    /// The payload reference does not resolve to a message.
    #[error("Message not found: {0}")]
    PayloadMissing(String),
}

/// Temporary errors that should be retried with exponential backoff.
#[derive(Debug, Error)]
pub enum TemporaryError {
    /// Failed to establish connection to the mail server.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Server is temporarily busy or unavailable.
    #[error("Server busy: {0}")]
    ServerBusy(String),

    /// Rate limit exceeded.
    #[error("Rate limited: {0}")]
    RateLimited(String),

    /// Connection timed out.
    #[error("Connection timed out: {0}")]
    Timeout(String),

    /// Server returned a temporary failure code.
    #[error("Temporary SMTP error: {0}")]
    SmtpTemporary(String),
}

/// Infrastructure failures that stop the queue manager.
#[derive(Debug, Error)]
pub enum SystemError {
    /// The queue store failed.
    #[error("Queue store error: {0}")]
    Store(#[from] StoreError),

    /// The poll loop task panicked or was cancelled.
    #[error("Queue manager task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Invalid configuration, detected when the manager is constructed.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

/// Errors returned by the [`QueueManager`](crate::QueueManager) control surface.
#[derive(Debug, Error)]
pub enum ManagerError {
    /// A lifecycle operation was requested from the wrong state.
    #[error("Cannot {operation} queue manager while {state}")]
    InvalidState {
        operation: &'static str,
        state: ManagerState,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("System error: {0}")]
    System(#[from] SystemError),
}

impl From<StoreError> for ManagerError {
    fn from(error: StoreError) -> Self {
        Self::System(SystemError::Store(error))
    }
}

impl TransportError {
    /// Classify an SMTP reply code.
    ///
    /// - **4xx** → transient
    /// - **5xx** → permanent
    /// - anything else → transient, since the outcome is unknown and a
    ///   retry is the only way to learn it
    #[must_use]
    pub fn from_smtp_reply(code: u16, message: &str) -> Self {
        match code {
            500..=599 => {
                Self::Permanent(PermanentError::MessageRejected(format!("{code} {message}")))
            }
            400..=499 => {
                Self::Transient(TemporaryError::SmtpTemporary(format!("{code} {message}")))
            }
            _ => Self::Transient(TemporaryError::SmtpTemporary(format!(
                "unexpected reply {code} {message}"
            ))),
        }
    }

    #[must_use]
    pub const fn class(&self) -> FailureClass {
        match self {
            Self::Transient(_) => FailureClass::Transient,
            Self::Permanent(_) => FailureClass::Permanent,
        }
    }

    /// Returns `true` if this error is temporary and should be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    /// Returns `true` if this error is permanent and should not be retried.
    #[must_use]
    pub const fn is_permanent(&self) -> bool {
        matches!(self, Self::Permanent(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(error: std::io::Error) -> Self {
        Self::Transient(TemporaryError::ConnectionFailed(format!("I/O error: {error}")))
    }
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

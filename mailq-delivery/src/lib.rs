//! Outbound delivery for queued mail
//!
//! This crate turns queue items into delivery attempts:
//! - [`QueueManager`] polls the store and dispatches due items into a
//!   bounded pool of workers, and drains that pool on shutdown
//! - [`Worker`] runs one attempt through a [`MailTransport`] and records
//!   the outcome
//! - [`RetryPolicy`] decides between backoff and dead-lettering
//! - [`EventBus`] reports lifecycle events to an optional [`EventSink`]

mod config;
mod error;
mod events;
mod manager;
pub mod policy;
mod transport;
mod worker;

pub use config::QueueConfig;
pub use error::{
    ConfigError, ManagerError, PermanentError, SystemError, TemporaryError, TransportError,
};
pub use events::{Event, EventBus, EventSink, EventType, TracingEventSink};
pub use mailq_store::{ItemStatus, PayloadRef, QueueItem, QueueItemId, QueueStore};
pub use manager::{DrainReport, ManagerState, QueueManager};
pub use policy::{FailureClass, RetryDecision, RetryPolicy};
pub use transport::{DryRunTransport, MailTransport};
pub use worker::{WorkOutcome, Worker};

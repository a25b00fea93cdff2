//! Storage for outbound mail queue items
//!
//! A [`QueueStore`] holds [`QueueItem`]s and performs every state transition
//! atomically: claiming due work under a lease, recording the outcome of a
//! delivery attempt, and reclaiming leases abandoned by crashed or
//! shut-down workers.

pub mod backends;
pub mod config;
pub mod error;
pub mod item;
pub mod r#trait;
pub mod types;

pub use backends::{FileQueueStore, MemoryQueueStore, TestQueueStore};
pub use config::StoreConfig;
pub use error::{Result, SerializationError, StoreError};
pub use item::{NewQueueItem, QueueItem};
pub use r#trait::QueueStore;
pub use types::{ItemStatus, Lease, PayloadRef, QueueItemId};

//! Delivery policies
//!
//! Policies are pure decisions, kept apart from the worker that applies
//! them so they can be tested without a store or a transport.
//!
//! - [`RetryPolicy`]: backoff or dead-letter after a failed attempt

pub mod retry;

pub use retry::{FailureClass, RetryDecision, RetryPolicy};

//! Shared plumbing for the mailq crates: logging setup, logging macros and
//! the lifecycle [`Signal`] passed between the supervisor and the queue.

pub mod logging;

pub use tracing;

/// Lifecycle signal broadcast from a supervisor to long-running loops.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Stop accepting new work and drain.
    Shutdown,
}

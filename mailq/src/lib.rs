//! The `mailq` supervisor: configuration, logging and signal handling around
//! a [`QueueManager`](mailq_delivery::QueueManager).

pub mod controller;

pub use controller::{Mailq, Supervisor, shutdown_signal};

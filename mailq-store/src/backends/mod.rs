//! Backend storage implementations for queue items
//!
//! - `memory`: in-process table, no durability
//! - `file`: one bincode record per item in a spool directory
//! - `test`: memory store with fault injection and synchronisation helpers

pub mod file;
pub mod memory;
mod table;

pub use file::FileQueueStore;
pub use memory::MemoryQueueStore;
pub use test::TestQueueStore;

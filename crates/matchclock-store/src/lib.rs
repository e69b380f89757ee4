//! Matchclock Store - the pub/sub state replication seam
//!
//! This crate provides:
//! - The `StateStore` adapter contract (publish / subscribe)
//! - An in-memory store shared by clients in one process
//! - A file-backed store shared by processes on one machine
//! - Startup-time backend selection

pub mod adapter;
pub mod file;
pub mod memory;

pub use adapter::*;
pub use file::{FileStore, FileStoreConfig};
pub use memory::MemoryStore;

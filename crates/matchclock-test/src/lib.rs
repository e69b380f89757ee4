//! Matchclock Test Harness - chaos testing and convergence validation
//!
//! This crate provides:
//! - A chaos store: failed publishes, reordered and duplicated deliveries
//! - A cluster simulator: concurrent writers and observers on a chaos store

pub mod chaos;
pub mod simulator;

pub use chaos::*;
pub use simulator::*;

//! Matchclock State Engine - command application and reconciliation
//!
//! This crate implements the Timer Engine:
//! - Command application with optimistic local update
//! - Publishing to the state store
//! - Last-writer-wins reconciliation of remote updates
//! - Self-echo suppression
//! - Advisory controller lease

pub mod engine;
pub mod lease;
pub mod reconcile;

pub use engine::*;
pub use lease::*;
pub use reconcile::*;

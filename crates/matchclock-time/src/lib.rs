//! Matchclock Time - clock sources and local ticking
//!
//! This crate provides:
//! - The clock source every process reads "now" from
//! - A manual clock for deterministic tests and simulation
//! - The local tick loop that animates the display between network updates

pub mod clock;
pub mod ticker;

pub use clock::*;
pub use ticker::*;

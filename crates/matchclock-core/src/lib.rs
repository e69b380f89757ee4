//! Matchclock Core - Fundamental types and primitives
//!
//! This crate defines the core types shared by every matchclock component:
//! - Identifiers (SessionId, ClientId) and store keys
//! - The elapsed-time model (ElapsedState) and its pure transforms
//! - Timer commands
//! - Display projection (clock strings, match progress)
//! - Error taxonomy

pub mod command;
pub mod display;
pub mod error;
pub mod id;
pub mod state;

pub use command::*;
pub use display::*;
pub use error::*;
pub use id::*;
pub use state::*;

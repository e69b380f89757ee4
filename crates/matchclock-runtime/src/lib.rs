//! Matchclock Runtime - wiring timer sessions to the outside world
//!
//! This crate provides:
//! - Runtime configuration from the environment
//! - Logging bootstrap
//! - Timer sessions: engine + subscriptions + lease heartbeat + tick loop
//! - A registry of server-side sessions
//! - The HTTP control surface and server

pub mod config;
pub mod http;
pub mod registry;
pub mod session;
pub mod telemetry;

pub use config::*;
pub use http::{router, serve, ApiError, Server, TimerRequest, TimerView};
pub use registry::SessionRegistry;
pub use session::*;
pub use telemetry::init_tracing;

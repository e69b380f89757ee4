//! Identity types and store keys
//!
//! Sessions partition independent timers on one shared store; clients are
//! the processes observing or controlling a session.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

const BASE36: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Default store key used when no session is specified
pub const DEFAULT_TIMER_KEY: &str = "timer";

/// Default lease key used when no session is specified
pub const DEFAULT_LEASE_KEY: &str = "controller";

fn random_base36(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36[rng.gen_range(0..BASE36.len())] as char)
        .collect()
}

/// Session identity - a named, independent timer
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(pub String);

impl SessionId {
    pub fn new(id: impl Into<String>) -> Self {
        SessionId(id.into())
    }

    /// Random six-character session code, e.g. `K3Z9QA`
    pub fn generate() -> Self {
        SessionId(random_base36(6).to_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session({})", self.0)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Client identity - one display screen or remote controller
#[derive(Clone, PartialEq, Eq, Hash, Default, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    /// Random nine-character client id
    pub fn generate() -> Self {
        ClientId(random_base36(9))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Client({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Store key holding the timer state of a session
pub fn timer_key(session: Option<&SessionId>) -> String {
    match session {
        Some(id) => format!("{}/{}", DEFAULT_TIMER_KEY, id),
        None => DEFAULT_TIMER_KEY.to_string(),
    }
}

/// Store key holding the controller lease of a session
pub fn lease_key(session: Option<&SessionId>) -> String {
    match session {
        Some(id) => format!("{}/{}", DEFAULT_LEASE_KEY, id),
        None => DEFAULT_LEASE_KEY.to_string(),
    }
}

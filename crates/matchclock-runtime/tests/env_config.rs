//! Configuration read from the real process environment

use std::time::Duration;

use serial_test::serial;

use matchclock_core::{DisplayMode, MatchclockError, SessionId};
use matchclock_runtime::{RuntimeConfig, ENV_DISPLAY, ENV_SESSION, ENV_TICK};

fn clear() {
    for name in [ENV_DISPLAY, ENV_SESSION, ENV_TICK] {
        std::env::remove_var(name);
    }
}

#[test]
#[serial]
fn test_from_env_reads_variables() {
    clear();
    std::env::set_var(ENV_SESSION, "XYZ789");
    std::env::set_var(ENV_TICK, "16ms");
    std::env::set_var(ENV_DISPLAY, "soccer");

    let config = RuntimeConfig::from_env().unwrap();
    clear();

    assert_eq!(config.default_session, Some(SessionId::new("XYZ789")));
    assert_eq!(config.tick.cadence, Duration::from_millis(16));
    assert_eq!(config.tick.mode, DisplayMode::Soccer);
}

#[test]
#[serial]
fn test_from_env_rejects_bad_duration() {
    clear();
    std::env::set_var(ENV_TICK, "soon");

    let result = RuntimeConfig::from_env();
    clear();

    assert!(matches!(result, Err(MatchclockError::Config(_))));
}

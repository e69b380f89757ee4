//! Runtime configuration
//!
//! Defaults overlaid with `MATCHCLOCK_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use matchclock_core::{DisplayMode, MatchclockError, MatchclockResult, SessionId};
use matchclock_state::LeaseConfig;
use matchclock_store::{FileStoreConfig, StoreBackend};
use matchclock_time::TickConfig;

pub const ENV_BIND: &str = "MATCHCLOCK_BIND";
pub const ENV_STORE: &str = "MATCHCLOCK_STORE";
pub const ENV_STORE_DIR: &str = "MATCHCLOCK_STORE_DIR";
pub const ENV_STORE_POLL: &str = "MATCHCLOCK_STORE_POLL";
pub const ENV_TICK: &str = "MATCHCLOCK_TICK";
pub const ENV_LEASE_RENEW: &str = "MATCHCLOCK_LEASE_RENEW";
pub const ENV_LEASE_TIMEOUT: &str = "MATCHCLOCK_LEASE_TIMEOUT";
pub const ENV_SESSION: &str = "MATCHCLOCK_SESSION";
pub const ENV_DISPLAY: &str = "MATCHCLOCK_DISPLAY";
pub const ENV_LOG_FORMAT: &str = "MATCHCLOCK_LOG_FORMAT";

/// Log output format
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = MatchclockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(LogFormat::Pretty),
            "json" => Ok(LogFormat::Json),
            other => Err(MatchclockError::Config(format!("unknown log format: {}", other))),
        }
    }
}

/// Runtime configuration
#[derive(Clone, Debug)]
pub struct RuntimeConfig {
    /// HTTP listen address
    pub bind: SocketAddr,
    /// Store implementation, fixed for the life of the process
    pub store: StoreBackend,
    /// Tick loop settings for every session the server opens
    pub tick: TickConfig,
    /// Controller lease for server sessions. `None` lets every request
    /// command; setting either lease variable turns it on.
    pub lease: Option<LeaseConfig>,
    /// Session used when a request names none
    pub default_session: Option<SessionId>,
    pub log_format: LogFormat,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 8080)),
            store: StoreBackend::Memory,
            tick: TickConfig::default(),
            lease: None,
            default_session: None,
            log_format: LogFormat::Pretty,
        }
    }
}

impl RuntimeConfig {
    /// Ephemeral port on loopback with an in-memory store
    pub fn local() -> Self {
        RuntimeConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            ..Self::default()
        }
    }

    /// Defaults overlaid with the process environment
    pub fn from_env() -> MatchclockResult<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overlaid with values from `lookup`. Empty values are unset.
    pub fn from_lookup<F>(lookup: F) -> MatchclockResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let mut config = Self::default();

        if let Some(bind) = get(ENV_BIND) {
            config.bind = bind
                .trim()
                .parse()
                .map_err(|e| invalid(ENV_BIND, &bind, e))?;
        }

        if let Some(backend) = get(ENV_STORE) {
            config.store = match backend.trim().to_ascii_lowercase().as_str() {
                "memory" => StoreBackend::Memory,
                "file" => StoreBackend::File(FileStoreConfig::default()),
                _ => return Err(invalid(ENV_STORE, &backend, "expected memory or file")),
            };
        }
        if let StoreBackend::File(file) = &mut config.store {
            if let Some(dir) = get(ENV_STORE_DIR) {
                file.dir = PathBuf::from(dir);
            }
            if let Some(poll) = get(ENV_STORE_POLL) {
                file.poll_interval = duration(ENV_STORE_POLL, &poll)?;
            }
        }

        if let Some(tick) = get(ENV_TICK) {
            config.tick.cadence = duration(ENV_TICK, &tick)?;
        }
        if let Some(display) = get(ENV_DISPLAY) {
            config.tick.mode = display.parse::<DisplayMode>()?;
        }
        if let Some(renew) = get(ENV_LEASE_RENEW) {
            config.lease.get_or_insert_with(LeaseConfig::default).renew_period =
                duration(ENV_LEASE_RENEW, &renew)?;
        }
        if let Some(timeout) = get(ENV_LEASE_TIMEOUT) {
            config.lease.get_or_insert_with(LeaseConfig::default).timeout =
                duration(ENV_LEASE_TIMEOUT, &timeout)?;
        }
        if let Some(session) = get(ENV_SESSION) {
            config.default_session = Some(SessionId::new(session.trim()));
        }
        if let Some(format) = get(ENV_LOG_FORMAT) {
            config.log_format = format.parse()?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> MatchclockResult<()> {
        if self.tick.cadence.is_zero() {
            return Err(MatchclockError::Config("tick cadence must be non-zero".into()));
        }
        let Some(lease) = &self.lease else {
            return Ok(());
        };
        if lease.renew_period.is_zero() {
            return Err(MatchclockError::Config("lease renew period must be non-zero".into()));
        }
        if lease.timeout <= lease.renew_period {
            return Err(MatchclockError::Config(format!(
                "lease timeout {} must exceed renew period {}",
                humantime::format_duration(lease.timeout),
                humantime::format_duration(lease.renew_period)
            )));
        }
        Ok(())
    }
}

fn duration(name: &str, value: &str) -> MatchclockResult<Duration> {
    humantime::parse_duration(value.trim()).map_err(|e| invalid(name, value, e))
}

fn invalid(name: &str, value: &str, reason: impl std::fmt::Display) -> MatchclockError {
    MatchclockError::Config(format!("{}={:?}: {}", name, value, reason))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config.bind.port(), 8080);
        assert_eq!(config.store.name(), "memory");
        assert_eq!(config.tick.cadence, Duration::from_millis(50));
        assert!(config.lease.is_none());
        assert_eq!(config.default_session, None);
        assert_eq!(config.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_overrides() {
        let config = RuntimeConfig::from_lookup(lookup(&[
            (ENV_BIND, "0.0.0.0:9000"),
            (ENV_STORE, "file"),
            (ENV_STORE_DIR, "/tmp/clock"),
            (ENV_STORE_POLL, "100ms"),
            (ENV_TICK, "20ms"),
            (ENV_LEASE_RENEW, "1s"),
            (ENV_LEASE_TIMEOUT, "5s"),
            (ENV_SESSION, "ABC123"),
            (ENV_DISPLAY, "soccer"),
            (ENV_LOG_FORMAT, "json"),
        ]))
        .unwrap();

        assert_eq!(config.bind.port(), 9000);
        let StoreBackend::File(file) = &config.store else {
            panic!("expected file store");
        };
        assert_eq!(file.dir, PathBuf::from("/tmp/clock"));
        assert_eq!(file.poll_interval, Duration::from_millis(100));
        assert_eq!(config.tick.cadence, Duration::from_millis(20));
        assert_eq!(config.tick.mode, DisplayMode::Soccer);
        let lease = config.lease.as_ref().unwrap();
        assert_eq!(lease.renew_period, Duration::from_secs(1));
        assert_eq!(lease.timeout, Duration::from_secs(5));
        assert_eq!(config.default_session, Some(SessionId::new("ABC123")));
        assert_eq!(config.log_format, LogFormat::Json);
    }

    #[test]
    fn test_store_dir_ignored_for_memory() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_STORE_DIR, "/tmp/clock")])).unwrap();
        assert!(matches!(config.store, StoreBackend::Memory));
    }

    #[test]
    fn test_empty_value_is_unset() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_SESSION, "  ")])).unwrap();
        assert_eq!(config.default_session, None);
    }

    #[test]
    fn test_invalid_values() {
        for (name, value) in [
            (ENV_BIND, "not-an-address"),
            (ENV_STORE, "redis"),
            (ENV_TICK, "fast"),
            (ENV_DISPLAY, "rugby"),
            (ENV_LOG_FORMAT, "xml"),
        ] {
            let err = RuntimeConfig::from_lookup(lookup(&[(name, value)])).unwrap_err();
            assert!(matches!(err, MatchclockError::Config(_)), "{}: {:?}", name, err);
        }
    }

    #[test]
    fn test_one_lease_variable_enables_lease() {
        let config = RuntimeConfig::from_lookup(lookup(&[(ENV_LEASE_RENEW, "2s")])).unwrap();
        let lease = config.lease.unwrap();
        assert_eq!(lease.renew_period, Duration::from_secs(2));
        assert_eq!(lease.timeout, Duration::from_secs(9));
    }

    #[test]
    fn test_lease_timeout_must_exceed_renewal() {
        let err = RuntimeConfig::from_lookup(lookup(&[(ENV_LEASE_TIMEOUT, "2s")])).unwrap_err();
        assert!(matches!(err, MatchclockError::Config(_)));
    }
}

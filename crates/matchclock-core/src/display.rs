//! Display projection - elapsed milliseconds to clock strings
//!
//! Pure formatting. Negative input is clamped to zero; nothing here panics.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{MatchclockError, TimerPhase, FULL_TIME_MS};

/// Clock rendering mode
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DisplayMode {
    /// `MM:SS`, minutes unbounded
    #[default]
    Standard,
    /// `MM:SS` below 90 minutes, `90+MM:SS` from 90 minutes on
    Soccer,
}

impl FromStr for DisplayMode {
    type Err = MatchclockError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "standard" => Ok(DisplayMode::Standard),
            "soccer" => Ok(DisplayMode::Soccer),
            other => Err(MatchclockError::Config(format!(
                "unknown display mode: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for DisplayMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisplayMode::Standard => f.write_str("standard"),
            DisplayMode::Soccer => f.write_str("soccer"),
        }
    }
}

/// Render `ms` as a clock string
pub fn format(ms: i64, mode: DisplayMode) -> String {
    let total_secs = ms.max(0) / 1000;
    let minutes = total_secs / 60;
    let seconds = total_secs % 60;

    if mode == DisplayMode::Soccer && minutes >= 90 {
        return format!("90+{:02}:{:02}", minutes - 90, seconds);
    }
    format!("{:02}:{:02}", minutes, seconds)
}

/// `MM:SS.mmm`, for debugging drift
pub fn format_detailed(ms: i64) -> String {
    let safe = ms.max(0);
    let total_secs = safe / 1000;
    format!(
        "{:02}:{:02}.{:03}",
        total_secs / 60,
        total_secs % 60,
        safe % 1000
    )
}

/// Share of regular match time elapsed, in percent (0.0 ..= 100.0)
pub fn match_progress(ms: i64) -> f64 {
    (ms.max(0) as f64 / FULL_TIME_MS as f64).clamp(0.0, 1.0) * 100.0
}

/// One rendered observation handed to the UI by the tick loop
#[derive(Clone, Debug, PartialEq)]
pub struct DisplayFrame {
    pub elapsed_ms: i64,
    pub phase: TimerPhase,
    pub text: String,
}

impl DisplayFrame {
    pub fn new(elapsed_ms: i64, phase: TimerPhase, mode: DisplayMode) -> Self {
        DisplayFrame {
            elapsed_ms,
            phase,
            text: format(elapsed_ms, mode),
        }
    }

    pub fn progress(&self) -> f64 {
        match_progress(self.elapsed_ms)
    }
}

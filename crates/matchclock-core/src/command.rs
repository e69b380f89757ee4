//! Timer commands

use std::fmt;

use crate::{ElapsedState, EpochMillis, MatchclockError, MatchclockResult, MINUTE_MS};

/// A mutating command on a timer
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerCommand {
    Start,
    Pause,
    Reset,
    /// Signed shift of the elapsed value
    Adjust(i64),
    /// Absolute elapsed value
    JumpTo(i64),
    /// Overwrite from a polling client (HTTP `sync` action)
    Sync(i64),
}

impl TimerCommand {
    /// The controller's "+1 minute" shortcut
    pub fn add_minute() -> Self {
        TimerCommand::Adjust(MINUTE_MS)
    }

    /// The controller's "-1 minute" shortcut
    pub fn subtract_minute() -> Self {
        TimerCommand::Adjust(-MINUTE_MS)
    }

    /// Apply this command to `state` at `now`
    pub fn apply(self, state: &ElapsedState, now: EpochMillis) -> ElapsedState {
        match self {
            TimerCommand::Start => state.with_start(now),
            TimerCommand::Pause => state.with_pause(now),
            TimerCommand::Reset => state.with_reset(now),
            TimerCommand::Adjust(delta) => state.with_adjust(delta, now),
            TimerCommand::JumpTo(target) => state.with_jump_to(target, now),
            TimerCommand::Sync(elapsed) => state.with_sync(elapsed, now),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TimerCommand::Start => "start",
            TimerCommand::Pause => "pause",
            TimerCommand::Reset => "reset",
            TimerCommand::Adjust(_) => "adjust",
            TimerCommand::JumpTo(_) => "jump_to",
            TimerCommand::Sync(_) => "sync",
        }
    }
}

impl fmt::Display for TimerCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimerCommand::Adjust(ms) | TimerCommand::JumpTo(ms) | TimerCommand::Sync(ms) => {
                write!(f, "{}({}ms)", self.name(), ms)
            }
            _ => f.write_str(self.name()),
        }
    }
}

/// Parse an HTTP control action.
///
/// Returns `Ok(None)` for `sync` without an elapsed value, which leaves the
/// timer untouched. Unrecognized actions are `InvalidCommand`.
pub fn parse_http_action(
    action: &str,
    elapsed_ms: Option<i64>,
) -> MatchclockResult<Option<TimerCommand>> {
    match action {
        "start" => Ok(Some(TimerCommand::Start)),
        "pause" => Ok(Some(TimerCommand::Pause)),
        "reset" => Ok(Some(TimerCommand::Reset)),
        "sync" => Ok(elapsed_ms.map(TimerCommand::Sync)),
        other => Err(MatchclockError::InvalidCommand(other.to_string())),
    }
}

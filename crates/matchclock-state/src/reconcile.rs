//! Reconciliation of locally issued commands against remote updates
//!
//! `EngineState` is the synchronous core of the timer engine. It holds the
//! last-known state and decides, for every update the store delivers,
//! whether it replaces local state.
//!
//! Rules:
//! 1. Last-writer-wins on `last_update_epoch_ms`: strictly newer replaces,
//!    older is discarded. Equal stamps resolve through
//!    [`ElapsedState::supersedes`], so concurrent writers converge.
//! 2. An update echoing the stamp we just published is a confirmation, not
//!    new intent.
//! 3. Updates addressed to another session are ignored.

use std::time::Duration;

use matchclock_core::{
    ClientId, ElapsedState, EpochMillis, MatchclockError, SessionId, TimerCommand,
};

/// What reconciliation did with an incoming update
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Store had no value; local default kept
    Initialized,
    /// Incoming state was newer and replaced local state
    Replaced,
    /// Incoming state echoed our own pending publish
    Confirmed,
    /// Incoming state lost the last-writer-wins comparison
    Stale,
    /// Incoming state is not for this session, or absent after local writes
    Ignored,
}

/// Engine counters
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EngineStats {
    pub commands_applied: u64,
    pub commands_unchanged: u64,
    pub commands_denied: u64,
    pub publishes_ok: u64,
    pub publish_failures: u64,
    pub replaced: u64,
    pub confirmed: u64,
    pub stale_discarded: u64,
    pub ignored: u64,
}

/// Marker for a publish whose echo has not come back yet
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PendingEcho {
    pub stamp: EpochMillis,
    pub expires_at: EpochMillis,
}

/// Synchronous engine core
#[derive(Debug)]
pub struct EngineState {
    session_id: Option<SessionId>,
    held: ElapsedState,
    pending_echo: Option<PendingEcho>,
    echo_ttl: Duration,
    connected: bool,
    stats: EngineStats,
}

impl EngineState {
    pub fn new(session_id: Option<SessionId>, echo_ttl: Duration) -> Self {
        EngineState {
            held: ElapsedState::new(session_id.clone()),
            session_id,
            pending_echo: None,
            echo_ttl,
            connected: false,
            stats: EngineStats::default(),
        }
    }

    pub fn held(&self) -> &ElapsedState {
        &self.held
    }

    pub fn pending_echo(&self) -> Option<PendingEcho> {
        self.pending_echo
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn stats(&self) -> &EngineStats {
        &self.stats
    }

    /// Apply a command optimistically.
    ///
    /// Returns the state to publish, or `None` if the command did not change
    /// anything (start while running, pause while paused).
    pub fn apply(
        &mut self,
        command: TimerCommand,
        now: EpochMillis,
        controller: &ClientId,
    ) -> Option<ElapsedState> {
        let next = command.apply(&self.held, now);
        if next == self.held {
            self.stats.commands_unchanged += 1;
            return None;
        }
        let next = next.with_controller(Some(controller.clone()));
        self.pending_echo = Some(PendingEcho {
            stamp: next.last_update_epoch_ms,
            expires_at: now.saturating_add(self.echo_ttl.as_millis() as i64),
        });
        self.held = next.clone();
        self.stats.commands_applied += 1;
        Some(next)
    }

    /// Record the outcome of publishing the state stamped `stamp`
    pub fn publish_finished(&mut self, stamp: EpochMillis, ok: bool) {
        if ok {
            self.stats.publishes_ok += 1;
            self.connected = true;
            return;
        }
        self.stats.publish_failures += 1;
        self.connected = false;
        if self.pending_echo.is_some_and(|p| p.stamp == stamp) {
            self.pending_echo = None;
        }
    }

    pub fn record_denied(&mut self) {
        self.stats.commands_denied += 1;
    }

    /// Reconcile an update delivered by the store
    pub fn reconcile(&mut self, incoming: Option<ElapsedState>, now: EpochMillis) -> ReconcileOutcome {
        if self.pending_echo.is_some_and(|p| now > p.expires_at) {
            self.pending_echo = None;
        }

        let Some(incoming) = incoming else {
            if self.held.last_update_epoch_ms == 0 {
                self.held = ElapsedState::new(self.session_id.clone());
                return ReconcileOutcome::Initialized;
            }
            self.stats.ignored += 1;
            return ReconcileOutcome::Ignored;
        };

        if incoming.session_id != self.session_id {
            tracing::debug!(
                incoming = ?incoming.session_id,
                held = ?self.session_id,
                "ignoring update for another session"
            );
            self.stats.ignored += 1;
            return ReconcileOutcome::Ignored;
        }

        let incoming = if incoming.is_well_formed() {
            incoming
        } else {
            tracing::warn!(?incoming, "repairing malformed timer state from store");
            incoming.normalized()
        };

        if let Some(pending) = self.pending_echo {
            if incoming.last_update_epoch_ms == pending.stamp && incoming == self.held {
                self.pending_echo = None;
                self.connected = true;
                self.stats.confirmed += 1;
                return ReconcileOutcome::Confirmed;
            }
        }

        let held_stamp = self.held.last_update_epoch_ms;
        if incoming.supersedes(&self.held) {
            if self
                .pending_echo
                .is_some_and(|p| p.stamp <= incoming.last_update_epoch_ms)
            {
                // our write was superseded before its echo arrived
                self.pending_echo = None;
            }
            self.held = incoming;
            self.connected = true;
            self.stats.replaced += 1;
            return ReconcileOutcome::Replaced;
        }

        let discarded = MatchclockError::StaleUpdateDiscarded {
            incoming: incoming.last_update_epoch_ms,
            held: held_stamp,
        };
        tracing::debug!(error = %discarded, "last-writer-wins");
        self.stats.stale_discarded += 1;
        ReconcileOutcome::Stale
    }
}

//! Elapsed-time model
//!
//! `ElapsedState` is the single replicated source of truth for one timer.
//! Elapsed time is never accumulated tick by tick; it is always derived from
//! the pair (accumulated base, running-since) with [`ElapsedState::current_elapsed`].
//!
//! All `with_*` transforms are pure: they return a new state and never
//! perform I/O.

use serde::{Deserialize, Serialize};

use crate::{ClientId, SessionId};

/// Milliseconds since the Unix epoch, as seen by the store
pub type EpochMillis = i64;

/// One minute in milliseconds
pub const MINUTE_MS: i64 = 60_000;

/// End of the first half
pub const HALF_TIME_MS: i64 = 45 * MINUTE_MS;

/// End of regular match time; soccer display switches to overtime notation here
pub const FULL_TIME_MS: i64 = 90 * MINUTE_MS;

/// UI-level lifecycle of a timer.
///
/// The model itself does not distinguish `Stopped` from `Paused`; the
/// difference is only whether any time has accumulated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimerPhase {
    /// Post-reset: nothing accumulated, not running
    Stopped,
    /// Running interval open
    Running,
    /// Time accumulated, not running
    Paused,
}

/// Replicated timer state
///
/// INVARIANT: `is_running == start_epoch_ms.is_some()`
/// INVARIANT: `base_elapsed_ms >= 0`
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElapsedState {
    /// Time accumulated while not running
    pub base_elapsed_ms: i64,
    pub is_running: bool,
    /// Store-relative timestamp at which the current running interval began
    pub start_epoch_ms: Option<EpochMillis>,
    /// Logical clock for last-writer-wins; strictly increases per accepted mutation
    pub last_update_epoch_ms: EpochMillis,
    /// Owning session (`None` for the default timer)
    #[serde(default)]
    pub session_id: Option<SessionId>,
    /// Client that issued the last mutation
    #[serde(default)]
    pub controller_id: Option<ClientId>,
}

impl ElapsedState {
    /// Zero state for a session that has just been touched
    pub fn new(session_id: Option<SessionId>) -> Self {
        ElapsedState {
            base_elapsed_ms: 0,
            is_running: false,
            start_epoch_ms: None,
            last_update_epoch_ms: 0,
            session_id,
            controller_id: None,
        }
    }

    /// Elapsed milliseconds at `now`, clamped to zero
    ///
    /// This is the one formula every observer uses.
    pub fn current_elapsed(&self, now: EpochMillis) -> i64 {
        match self.running_since() {
            Some(start) => self
                .base_elapsed_ms
                .saturating_add(now.saturating_sub(start))
                .max(0),
            None => self.base_elapsed_ms.max(0),
        }
    }

    /// Start of the open running interval, if any
    #[inline]
    pub fn running_since(&self) -> Option<EpochMillis> {
        if self.is_running {
            self.start_epoch_ms
        } else {
            None
        }
    }

    pub fn phase(&self) -> TimerPhase {
        if self.is_running {
            TimerPhase::Running
        } else if self.base_elapsed_ms > 0 {
            TimerPhase::Paused
        } else {
            TimerPhase::Stopped
        }
    }

    /// Open a running interval at `now`. No-op if already running.
    pub fn with_start(&self, now: EpochMillis) -> Self {
        if self.is_running {
            return self.clone();
        }
        let mut next = self.clone();
        next.is_running = true;
        next.start_epoch_ms = Some(now);
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Fold the running interval into the base. No-op if not running.
    pub fn with_pause(&self, now: EpochMillis) -> Self {
        if !self.is_running {
            return self.clone();
        }
        let mut next = self.clone();
        next.base_elapsed_ms = self.current_elapsed(now);
        next.is_running = false;
        next.start_epoch_ms = None;
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Back to zero, stopped. Unconditional.
    pub fn with_reset(&self, now: EpochMillis) -> Self {
        let mut next = self.clone();
        next.base_elapsed_ms = 0;
        next.is_running = false;
        next.start_epoch_ms = None;
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Shift the conceptual elapsed value by a signed delta, keeping the
    /// running/paused status. The result never goes below zero.
    pub fn with_adjust(&self, delta_ms: i64, now: EpochMillis) -> Self {
        let mut next = self.clone();
        match self.running_since() {
            Some(start) => {
                // elapsed = base + now - start >= 0  <=>  start <= now + base
                let latest_start = now.saturating_add(self.base_elapsed_ms);
                next.start_epoch_ms = Some(start.saturating_sub(delta_ms).min(latest_start));
            }
            None => {
                next.base_elapsed_ms = self.base_elapsed_ms.saturating_add(delta_ms).max(0);
            }
        }
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Set the conceptual elapsed value to exactly `max(0, target_ms)`,
    /// keeping the running/paused status.
    pub fn with_jump_to(&self, target_ms: i64, now: EpochMillis) -> Self {
        let target = target_ms.max(0);
        let mut next = self.clone();
        if self.is_running {
            next.base_elapsed_ms = 0;
            next.start_epoch_ms = Some(now.saturating_sub(target));
        } else {
            next.base_elapsed_ms = target;
        }
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Overwrite the elapsed value as reported by a polling client.
    ///
    /// Unlike [`with_jump_to`](Self::with_jump_to), a running interval is
    /// restarted at `now` with the synced value folded into the base.
    pub fn with_sync(&self, elapsed_ms: i64, now: EpochMillis) -> Self {
        let mut next = self.clone();
        next.base_elapsed_ms = elapsed_ms.max(0);
        if self.is_running {
            next.start_epoch_ms = Some(now);
        }
        next.last_update_epoch_ms = self.stamp(now);
        next
    }

    /// Record the client responsible for this state
    pub fn with_controller(mut self, controller: Option<ClientId>) -> Self {
        self.controller_id = controller;
        self
    }

    /// Repair a state received from an untrusted store.
    ///
    /// A running flag without a start (or the reverse) is treated as paused,
    /// and a negative base is clamped to zero.
    pub fn normalized(mut self) -> Self {
        if self.is_running != self.start_epoch_ms.is_some() {
            self.is_running = false;
            self.start_epoch_ms = None;
        }
        self.base_elapsed_ms = self.base_elapsed_ms.max(0);
        self
    }

    /// True if the running/start pairing and base bound both hold
    pub fn is_well_formed(&self) -> bool {
        self.is_running == self.start_epoch_ms.is_some() && self.base_elapsed_ms >= 0
    }

    /// Last-writer-wins order between two states of the same timer.
    ///
    /// The newer stamp wins. Equal stamps from concurrent writers fall back to
    /// the greater controller id, then to the content itself, so every
    /// observer picks the same winner regardless of delivery order.
    pub fn supersedes(&self, other: &ElapsedState) -> bool {
        self.order_key() > other.order_key()
    }

    fn order_key(&self) -> (EpochMillis, Option<&ClientId>, i64, bool, Option<EpochMillis>) {
        (
            self.last_update_epoch_ms,
            self.controller_id.as_ref(),
            self.base_elapsed_ms,
            self.is_running,
            self.start_epoch_ms,
        )
    }

    /// Timestamp for the next accepted mutation: `now`, or one past the
    /// previous stamp if the local clock has not moved beyond it.
    #[inline]
    fn stamp(&self, now: EpochMillis) -> EpochMillis {
        now.max(self.last_update_epoch_ms.saturating_add(1))
    }
}

impl Default for ElapsedState {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_supersedes_orders_by_stamp_then_controller() {
        let a = ElapsedState::default()
            .with_start(1000)
            .with_controller(Some(ClientId::new("a")));
        let b = ElapsedState::default()
            .with_jump_to(5000, 1000)
            .with_controller(Some(ClientId::new("b")));
        assert_eq!(a.last_update_epoch_ms, b.last_update_epoch_ms);
        assert!(b.supersedes(&a));
        assert!(!a.supersedes(&b));

        let later = a.with_pause(1001);
        assert!(later.supersedes(&b));
        assert!(!a.supersedes(&a));
    }

    #[test]
    fn test_basic_run() {
        let s = ElapsedState::default().with_start(1000);
        assert_eq!(s.current_elapsed(4000), 3000);

        let s = s.with_pause(4000);
        assert_eq!(s.base_elapsed_ms, 3000);
        assert!(!s.is_running);
        assert_eq!(s.start_epoch_ms, None);

        let s = s.with_start(5000);
        assert_eq!(s.current_elapsed(6000), 4000);
    }

    #[test]
    fn test_start_while_running_is_noop() {
        let s = ElapsedState::default().with_start(1000);
        let again = s.with_start(2000);
        assert_eq!(s, again);
    }

    #[test]
    fn test_pause_while_paused_is_noop() {
        let s = ElapsedState::default().with_start(0).with_pause(500);
        assert_eq!(s.with_pause(900), s);
    }

    #[test]
    fn test_reset_is_idempotent() {
        let s = ElapsedState::default().with_start(10).with_pause(5000);
        let once = s.with_reset(6000);
        let twice = once.with_reset(6000);

        for r in [&once, &twice] {
            assert_eq!(r.base_elapsed_ms, 0);
            assert!(!r.is_running);
            assert_eq!(r.start_epoch_ms, None);
            assert_eq!(r.phase(), TimerPhase::Stopped);
        }
    }

    #[test]
    fn test_stamp_strictly_increases() {
        let s = ElapsedState::default().with_start(1000);
        let paused = s.with_pause(1000);
        assert!(paused.last_update_epoch_ms > s.last_update_epoch_ms);

        // clock went backwards
        let reset = paused.with_reset(10);
        assert!(reset.last_update_epoch_ms > paused.last_update_epoch_ms);
    }

    #[test]
    fn test_jump_to_while_running() {
        let running = ElapsedState {
            start_epoch_ms: Some(0),
            is_running: true,
            ..ElapsedState::default()
        };
        let jumped = running.with_jump_to(HALF_TIME_MS, 0);
        assert_eq!(jumped.current_elapsed(1000), HALF_TIME_MS + 1000);
        assert!(jumped.is_running);
    }

    #[test]
    fn test_jump_to_while_paused_and_negative_target() {
        let paused = ElapsedState::default().with_start(0).with_pause(3000);
        assert_eq!(paused.with_jump_to(10_000, 4000).base_elapsed_ms, 10_000);
        assert_eq!(paused.with_jump_to(-5, 4000).current_elapsed(9000), 0);
    }

    #[test]
    fn test_adjust_running_and_paused() {
        let running = ElapsedState::default().with_start(1000);
        let plus = running.with_adjust(MINUTE_MS, 2000);
        assert_eq!(plus.current_elapsed(2000), 1000 + MINUTE_MS);
        assert!(plus.is_running);

        let minus = running.with_adjust(-MINUTE_MS, 2000);
        assert_eq!(minus.current_elapsed(2000), 0);
        // keeps counting from zero
        assert_eq!(minus.current_elapsed(2500), 500);

        let paused = running.with_pause(3000);
        assert_eq!(paused.with_adjust(-500, 3000).base_elapsed_ms, 1500);
        assert_eq!(paused.with_adjust(-5000, 3000).base_elapsed_ms, 0);
    }

    #[test]
    fn test_sync_overwrites_elapsed() {
        let running = ElapsedState::default().with_start(0);
        let synced = running.with_sync(20_000, 5000);
        assert_eq!(synced.current_elapsed(5000), 20_000);
        assert_eq!(synced.current_elapsed(6000), 21_000);

        let paused = synced.with_pause(6000).with_sync(-3, 7000);
        assert_eq!(paused.current_elapsed(8000), 0);
    }

    #[test]
    fn test_phase() {
        let s = ElapsedState::default();
        assert_eq!(s.phase(), TimerPhase::Stopped);
        let s = s.with_start(0);
        assert_eq!(s.phase(), TimerPhase::Running);
        let s = s.with_pause(10);
        assert_eq!(s.phase(), TimerPhase::Paused);
    }

    #[test]
    fn test_normalized() {
        let broken = ElapsedState {
            base_elapsed_ms: -40,
            is_running: true,
            start_epoch_ms: None,
            ..ElapsedState::default()
        };
        assert!(!broken.is_well_formed());
        let fixed = broken.normalized();
        assert!(fixed.is_well_formed());
        assert_eq!(fixed.phase(), TimerPhase::Stopped);
    }

    #[test]
    fn test_wire_field_names() {
        let s = ElapsedState::new(Some(SessionId::new("cup"))).with_start(1000);
        let json = serde_json::to_value(&s).unwrap();
        assert_eq!(json["baseElapsedMs"], 0);
        assert_eq!(json["isRunning"], true);
        assert_eq!(json["startEpochMs"], 1000);
        assert_eq!(json["lastUpdateEpochMs"], 1000);
        assert_eq!(json["sessionId"], "cup");
        assert!(json["controllerId"].is_null());
    }

    #[derive(Clone, Debug)]
    enum Op {
        Start,
        Pause,
        Reset,
        Adjust(i64),
        JumpTo(i64),
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            Just(Op::Start),
            Just(Op::Pause),
            Just(Op::Reset),
            (-10_000_000i64..10_000_000).prop_map(Op::Adjust),
            (-10_000_000i64..10_000_000).prop_map(Op::JumpTo),
        ]
    }

    proptest! {
        #[test]
        fn prop_running_clock_is_monotonic(
            base in 0i64..10_000_000,
            start in 0i64..1_000_000_000,
            d1 in 0i64..1_000_000,
            d2 in 0i64..1_000_000,
        ) {
            let s = ElapsedState {
                base_elapsed_ms: base,
                is_running: true,
                start_epoch_ms: Some(start),
                ..ElapsedState::default()
            };
            let t1 = start + d1;
            let t2 = t1 + d2;
            prop_assert!(s.current_elapsed(t2) >= s.current_elapsed(t1));
        }

        #[test]
        fn prop_pause_resume_identity(
            now1 in 0i64..1_000_000_000,
            read in 0i64..1_000_000,
            gap in 0i64..1_000_000,
        ) {
            let running = ElapsedState::default().with_start(now1);
            let now2 = now1 + read;
            let _ = running.current_elapsed(now2);
            let now3 = now2 + gap;
            let paused = running.with_pause(now3);
            prop_assert_eq!(paused.base_elapsed_ms, now3 - now1);
        }

        #[test]
        fn prop_elapsed_never_negative(
            ops in proptest::collection::vec((op_strategy(), 0i64..100_000), 1..40),
            offset in -1_000_000i64..1_000_000,
        ) {
            let mut s = ElapsedState::default();
            let mut now = 0i64;
            for (op, step) in ops {
                now += step;
                s = match op {
                    Op::Start => s.with_start(now),
                    Op::Pause => s.with_pause(now),
                    Op::Reset => s.with_reset(now),
                    Op::Adjust(d) => s.with_adjust(d, now),
                    Op::JumpTo(t) => s.with_jump_to(t, now),
                };
                prop_assert!(s.is_well_formed());
                prop_assert!(s.current_elapsed(now) >= 0);
                prop_assert!(s.current_elapsed(now + offset) >= 0);
            }
        }
    }
}

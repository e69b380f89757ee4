//! Local tick loop
//!
//! Animates the display between network updates. While the timer runs, a
//! cadence task recomputes `current_elapsed` from the held state every
//! `cadence`; while it is stopped or paused a single frame is emitted and
//! nothing ticks. Every state change cancels the previous cadence before a
//! new one is scheduled, so at most one cadence is alive per loop.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use matchclock_core::{DisplayFrame, DisplayMode, ElapsedState};

use crate::Clock;

/// Consumer of rendered frames (the UI)
pub type FrameSink = Arc<dyn Fn(DisplayFrame) + Send + Sync>;

/// Tick loop configuration
#[derive(Clone, Debug)]
pub struct TickConfig {
    /// Refresh cadence while running
    pub cadence: Duration,
    /// Clock rendering mode
    pub mode: DisplayMode,
}

impl Default for TickConfig {
    fn default() -> Self {
        TickConfig {
            cadence: Duration::from_millis(50),
            mode: DisplayMode::Standard,
        }
    }
}

impl TickConfig {
    /// Soccer display at the default cadence
    pub fn soccer() -> Self {
        TickConfig {
            mode: DisplayMode::Soccer,
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct TickCounters {
    frames: AtomicU64,
    live_cadences: AtomicUsize,
    cadences_started: AtomicU64,
}

/// Decrements the live-cadence count when a cadence task is dropped
struct LiveCadence(Arc<TickCounters>);

impl LiveCadence {
    fn enter(counters: &Arc<TickCounters>) -> Self {
        counters.live_cadences.fetch_add(1, Ordering::SeqCst);
        counters.cadences_started.fetch_add(1, Ordering::SeqCst);
        LiveCadence(Arc::clone(counters))
    }
}

impl Drop for LiveCadence {
    fn drop(&mut self) {
        self.0.live_cadences.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Aborts the owned cadence when replaced or dropped
#[derive(Default)]
struct CadenceSlot(Option<JoinHandle<()>>);

impl CadenceSlot {
    fn cancel(&mut self) {
        if let Some(handle) = self.0.take() {
            handle.abort();
        }
    }

    fn replace(&mut self, handle: JoinHandle<()>) {
        self.cancel();
        self.0 = Some(handle);
    }
}

impl Drop for CadenceSlot {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Tick loop handle. Dropping it stops the loop.
pub struct TickLoop {
    driver: Option<JoinHandle<()>>,
    counters: Arc<TickCounters>,
}

impl TickLoop {
    /// Spawn a loop that follows `states` and renders into `sink`.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        clock: Arc<dyn Clock>,
        mut states: watch::Receiver<ElapsedState>,
        config: TickConfig,
        sink: FrameSink,
    ) -> Self {
        let counters = Arc::new(TickCounters::default());
        let driver_counters = Arc::clone(&counters);

        let driver = tokio::spawn(async move {
            let mut slot = CadenceSlot::default();
            loop {
                let state = states.borrow_and_update().clone();
                slot.cancel();

                emit(&state, clock.as_ref(), &config, &sink, &driver_counters);

                if state.is_running {
                    slot.replace(tokio::spawn(run_cadence(
                        state,
                        Arc::clone(&clock),
                        config.clone(),
                        Arc::clone(&sink),
                        Arc::clone(&driver_counters),
                    )));
                }

                if states.changed().await.is_err() {
                    tracing::debug!("state source closed; tick loop exiting");
                    break;
                }
            }
        });

        TickLoop {
            driver: Some(driver),
            counters,
        }
    }

    /// Stop the loop and any pending cadence
    pub fn stop(&mut self) {
        if let Some(driver) = self.driver.take() {
            driver.abort();
        }
    }

    pub fn is_stopped(&self) -> bool {
        match &self.driver {
            Some(driver) => driver.is_finished(),
            None => true,
        }
    }

    /// Frames emitted so far
    pub fn frames(&self) -> u64 {
        self.counters.frames.load(Ordering::SeqCst)
    }

    /// Cadence tasks currently alive (0 or 1 unless something leaks)
    pub fn live_cadences(&self) -> usize {
        self.counters.live_cadences.load(Ordering::SeqCst)
    }

    /// Cadence tasks started over the loop's lifetime
    pub fn cadences_started(&self) -> u64 {
        self.counters.cadences_started.load(Ordering::SeqCst)
    }
}

impl Drop for TickLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

fn emit(
    state: &ElapsedState,
    clock: &dyn Clock,
    config: &TickConfig,
    sink: &FrameSink,
    counters: &TickCounters,
) {
    let elapsed = state.current_elapsed(clock.now_ms());
    counters.frames.fetch_add(1, Ordering::SeqCst);
    sink(DisplayFrame::new(elapsed, state.phase(), config.mode));
}

async fn run_cadence(
    state: ElapsedState,
    clock: Arc<dyn Clock>,
    config: TickConfig,
    sink: FrameSink,
    counters: Arc<TickCounters>,
) {
    let _live = LiveCadence::enter(&counters);
    let mut ticks = interval_at(Instant::now() + config.cadence, config.cadence);
    ticks.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticks.tick().await;
        emit(&state, clock.as_ref(), &config, &sink, &counters);
    }
}

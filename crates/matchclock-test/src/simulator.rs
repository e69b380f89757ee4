//! Cluster simulator for convergence testing
//!
//! Writers and observers share a chaos store. By default there is a single
//! writer (the controller) on the same manual clock as the observers. With
//! [`ClusterSimulator::with_writers`] several unleased writers command
//! concurrently, each on its own skewed clock.
//!
//! After a flush every client must hold the highest published state under
//! last-writer-wins order. The one exception is a writer still carrying an
//! optimistic state whose publish failed.

use std::sync::Arc;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use matchclock_core::{ClientId, ElapsedState, TimerCommand, MINUTE_MS};
use matchclock_state::{CommandOutcome, EngineConfig, TimerEngine};
use matchclock_store::Subscription;
use matchclock_time::ManualClock;

use crate::chaos::{ChaosConfig, ChaosStore};

/// Clock value the simulation starts at
pub const SIM_EPOCH_MS: i64 = 1_700_000_000_000;

/// One simulated client
pub struct SimClient {
    pub engine: Arc<TimerEngine>,
    /// Private clock of a skewed writer; `None` follows the reference clock
    own_clock: Option<ManualClock>,
    _subscription: Subscription,
}

/// Simulation statistics
#[derive(Clone, Debug, Default)]
pub struct SimStats {
    pub steps: u64,
    pub applied: u64,
    pub unchanged: u64,
    pub unpublished: u64,
}

/// Cluster simulator
pub struct ClusterSimulator {
    store: ChaosStore<ElapsedState>,
    clock: ManualClock,
    clients: Vec<SimClient>,
    writers: usize,
    rng: StdRng,
    stats: SimStats,
}

impl ClusterSimulator {
    fn empty(config: ChaosConfig, seed: u64, writers: usize) -> Self {
        ClusterSimulator {
            store: ChaosStore::new(config, seed),
            clock: ManualClock::new(SIM_EPOCH_MS),
            clients: Vec::new(),
            writers,
            rng: StdRng::seed_from_u64(seed.wrapping_add(1)),
            stats: SimStats::default(),
        }
    }

    /// Controller plus `observers` observers
    pub fn new(observers: usize, config: ChaosConfig, seed: u64) -> Self {
        let mut sim = Self::empty(config, seed, 1);
        for _ in 0..=observers {
            sim.add_client();
        }
        sim
    }

    /// `writers` concurrent writers plus `observers` observers.
    ///
    /// Each writer runs on a private clock offset from the reference by up
    /// to `max_skew_ms` either way.
    pub fn with_writers(
        writers: usize,
        observers: usize,
        max_skew_ms: i64,
        config: ChaosConfig,
        seed: u64,
    ) -> Self {
        let mut sim = Self::empty(config, seed, writers.max(1));
        for _ in 0..sim.writers {
            let skew = sim.rng.gen_range(-max_skew_ms..=max_skew_ms);
            sim.join(Some(ManualClock::new(SIM_EPOCH_MS + skew)));
        }
        for _ in 0..observers {
            sim.add_client();
        }
        sim
    }

    pub fn calm(observers: usize) -> Self {
        Self::new(observers, ChaosConfig::calm(), 0)
    }

    pub fn lossy(observers: usize, seed: u64) -> Self {
        Self::new(observers, ChaosConfig::lossy(), seed)
    }

    pub fn hostile(observers: usize, seed: u64) -> Self {
        Self::new(observers, ChaosConfig::hostile(), seed)
    }

    /// Join a new client on the reference clock (late joiners included)
    pub fn add_client(&mut self) -> usize {
        self.join(None)
    }

    fn join(&mut self, own_clock: Option<ManualClock>) -> usize {
        let index = self.clients.len();
        let config = EngineConfig::default().with_client(ClientId::new(format!("client-{}", index)));
        let clock = own_clock.clone().unwrap_or_else(|| self.clock.clone());
        let engine = Arc::new(TimerEngine::new(
            config,
            Arc::new(self.store.clone()),
            Arc::new(clock),
        ));
        let subscription = engine.attach();
        self.clients.push(SimClient {
            engine,
            own_clock,
            _subscription: subscription,
        });
        index
    }

    pub fn store(&self) -> &ChaosStore<ElapsedState> {
        &self.store
    }

    /// Reference clock, shared by observers and unskewed writers
    pub fn clock(&self) -> &ManualClock {
        &self.clock
    }

    /// Move every clock forward by `ms`, skewed ones included
    pub fn advance_ms(&self, ms: i64) {
        self.clock.advance_ms(ms);
        for client in &self.clients {
            if let Some(clock) = &client.own_clock {
                clock.advance_ms(ms);
            }
        }
    }

    /// Shift one skewed writer's clock by `ms`. No-op for clients on the
    /// reference clock.
    pub fn skew(&self, index: usize, ms: i64) {
        if let Some(clock) = &self.clients[index].own_clock {
            clock.advance_ms(ms);
        }
    }

    pub fn writers(&self) -> usize {
        self.writers
    }

    pub fn controller(&self) -> &Arc<TimerEngine> {
        &self.clients[0].engine
    }

    pub fn client(&self, index: usize) -> &Arc<TimerEngine> {
        &self.clients[index].engine
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    fn random_command(&mut self) -> TimerCommand {
        match self.rng.gen_range(0..10) {
            0..=2 => TimerCommand::Start,
            3..=4 => TimerCommand::Pause,
            5 => TimerCommand::Reset,
            6 => TimerCommand::add_minute(),
            7 => TimerCommand::subtract_minute(),
            8 => TimerCommand::Adjust(self.rng.gen_range(-5_000..=5_000)),
            _ => TimerCommand::JumpTo(self.rng.gen_range(0..=100 * MINUTE_MS)),
        }
    }

    /// Writers issuing a command this step: the controller alone, or a
    /// random non-empty subset of the writers
    fn issuing(&mut self) -> Vec<usize> {
        if self.writers == 1 {
            return vec![0];
        }
        let mut chosen: Vec<usize> = (0..self.writers).filter(|_| self.rng.gen_bool(0.5)).collect();
        if chosen.is_empty() {
            chosen.push(self.rng.gen_range(0..self.writers));
        }
        chosen
    }

    /// Advance the clocks, issue random commands on the writers and release
    /// a random share of queued deliveries. Returns the last outcome.
    pub async fn step(&mut self) -> CommandOutcome {
        let advance = self.rng.gen_range(0..=5_000);
        self.advance_ms(advance);

        let mut outcome = CommandOutcome::PermissionDenied;
        for writer in self.issuing() {
            let command = self.random_command();
            let engine = Arc::clone(&self.clients[writer].engine);
            outcome = engine.execute(command).await;
            match &outcome {
                CommandOutcome::Applied { published, .. } => {
                    self.stats.applied += 1;
                    if !published {
                        self.stats.unpublished += 1;
                    }
                }
                CommandOutcome::Unchanged(_) => self.stats.unchanged += 1,
                CommandOutcome::PermissionDenied => {}
            }
        }
        self.stats.steps += 1;

        let pending = self.store.pending();
        if pending > 0 {
            let n = self.rng.gen_range(0..=pending);
            self.store.deliver(n);
        }
        outcome
    }

    pub async fn run(&mut self, steps: usize) {
        for _ in 0..steps {
            self.step().await;
        }
    }

    /// Release every queued delivery
    pub fn flush(&self) -> usize {
        self.store.flush()
    }

    /// The store's value, or the zero state if nothing was ever published
    pub fn authoritative(&self) -> ElapsedState {
        let key = self.controller().key().to_string();
        self.store.get(&key).unwrap_or_default()
    }

    /// Highest published state under last-writer-wins order, or the zero
    /// state if nothing was ever published.
    ///
    /// With one writer this is the store's value. With skewed writers the
    /// store may end on a lower stamp that lost to an earlier write.
    pub fn highest_published(&self) -> ElapsedState {
        let key = self.controller().key().to_string();
        self.store
            .published(&key)
            .into_iter()
            .fold(ElapsedState::default(), |best, state| {
                if state.supersedes(&best) {
                    state
                } else {
                    best
                }
            })
    }

    /// Indices of clients not holding [`highest_published`](Self::highest_published).
    ///
    /// A writer whose last publish failed legitimately holds a newer
    /// optimistic state that nobody else has seen.
    pub fn divergent(&self) -> Vec<usize> {
        let expected = self.highest_published();
        let published = self.store.published(self.controller().key());
        self.clients
            .iter()
            .enumerate()
            .filter(|(i, client)| {
                let held = client.engine.snapshot();
                if held == expected {
                    return false;
                }
                let unpublished = *i < self.writers
                    && !published.contains(&held)
                    && held.supersedes(&expected);
                !unpublished
            })
            .map(|(i, _)| i)
            .collect()
    }

    pub fn converged(&self) -> bool {
        self.divergent().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchclock_core::TimerPhase;
    use proptest::prelude::*;

    #[tokio::test]
    async fn test_calm_cluster_converges() {
        let mut sim = ClusterSimulator::calm(3);
        sim.run(50).await;
        sim.flush();
        assert!(sim.converged(), "divergent: {:?}", sim.divergent());
        assert_eq!(sim.stats().unpublished, 0);
    }

    #[tokio::test]
    async fn test_lossy_cluster_converges() {
        for seed in 0..10 {
            let mut sim = ClusterSimulator::lossy(4, seed);
            sim.run(100).await;
            sim.flush();
            assert!(sim.converged(), "seed {}: divergent {:?}", seed, sim.divergent());
        }
    }

    #[tokio::test]
    async fn test_hostile_cluster_converges() {
        for seed in 0..10 {
            let mut sim = ClusterSimulator::hostile(4, seed);
            sim.run(200).await;
            sim.flush();
            assert!(sim.converged(), "seed {}: divergent {:?}", seed, sim.divergent());
        }
    }

    #[tokio::test]
    async fn test_failed_publish_is_carried_by_next_command() {
        let mut sim = ClusterSimulator::calm(2);
        sim.store().set_config(ChaosConfig {
            publish_failure_rate: 1.0,
            ..ChaosConfig::calm()
        });
        assert!(sim.controller().start().await.accepted());
        sim.flush();
        assert!(!sim.controller().is_connected());
        assert_eq!(sim.client(1).phase(), TimerPhase::Stopped);

        sim.store().set_config(ChaosConfig::calm());
        sim.clock().advance_ms(1_000);
        sim.controller().add_minute().await;
        sim.flush();

        assert!(sim.controller().is_connected());
        assert!(sim.client(1).snapshot().is_running);
        assert_eq!(sim.client(2).elapsed_now(), 1_000 + MINUTE_MS);
        assert!(sim.converged());
    }

    #[tokio::test]
    async fn test_late_joiner_converges() {
        let mut sim = ClusterSimulator::lossy(1, 5);
        sim.run(30).await;
        let late = sim.add_client();
        sim.run(30).await;
        sim.flush();

        assert_eq!(sim.len(), 3);
        assert!(sim.converged(), "divergent: {:?}", sim.divergent());
        assert_eq!(sim.client(late).snapshot(), sim.authoritative());
    }

    #[tokio::test]
    async fn test_observers_agree_on_elapsed() {
        let mut sim = ClusterSimulator::hostile(3, 11);
        sim.run(50).await;
        sim.flush();

        let now_elapsed: Vec<i64> = (1..sim.len()).map(|i| sim.client(i).elapsed_now()).collect();
        assert!(now_elapsed.windows(2).all(|w| w[0] == w[1]));
        assert!(now_elapsed.iter().all(|e| *e >= 0));
    }

    #[tokio::test]
    async fn test_skewed_writers_converge_on_highest_stamp() {
        for seed in 0..10 {
            let mut sim = ClusterSimulator::with_writers(3, 2, 3_000, ChaosConfig::calm(), seed);
            sim.run(60).await;
            sim.flush();

            let expected = sim.highest_published();
            for i in 0..sim.len() {
                assert_eq!(sim.client(i).snapshot(), expected, "seed {} client {}", seed, i);
            }
        }
    }

    #[tokio::test]
    async fn test_skewed_writers_converge_under_chaos() {
        for seed in 0..10 {
            let mut sim = ClusterSimulator::with_writers(3, 3, 5_000, ChaosConfig::hostile(), seed);
            sim.run(100).await;
            sim.flush();
            assert!(sim.converged(), "seed {}: divergent {:?}", seed, sim.divergent());
        }
    }

    #[tokio::test]
    async fn test_lagging_writer_cannot_roll_back_newer_state() {
        let sim = ClusterSimulator::with_writers(2, 1, 0, ChaosConfig::calm(), 0);
        sim.advance_ms(1_000);

        // writer 0 runs fast; writer 1 lags by two seconds and has not seen it yet
        sim.skew(1, -2_000);
        sim.client(0).jump_to(50_000).await;
        sim.client(1).jump_to(10_000).await;
        sim.flush();

        assert_eq!(sim.highest_published().base_elapsed_ms, 50_000);
        assert_eq!(sim.authoritative().base_elapsed_ms, 10_000);
        for i in 0..sim.len() {
            assert_eq!(sim.client(i).snapshot().base_elapsed_ms, 50_000, "client {}", i);
        }
    }

    #[tokio::test]
    async fn test_simultaneous_writes_resolve_identically() {
        let sim = ClusterSimulator::with_writers(2, 2, 0, ChaosConfig::calm(), 0);
        sim.advance_ms(1_000);

        let a = sim.client(0).jump_to(10_000).await;
        let b = sim.client(1).jump_to(20_000).await;
        assert_eq!(
            a.state().unwrap().last_update_epoch_ms,
            b.state().unwrap().last_update_epoch_ms
        );
        sim.flush();

        // same stamp: the greater controller id wins everywhere
        for i in 0..sim.len() {
            let held = sim.client(i).snapshot();
            assert_eq!(held.base_elapsed_ms, 20_000, "client {}", i);
            assert_eq!(held.controller_id, Some(ClientId::new("client-1")));
        }
        assert!(sim.converged());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_concurrent_writers_converge(
            seed in any::<u64>(),
            writers in 2usize..4,
            observers in 0usize..3,
            skew in 0i64..10_000,
            steps in 1usize..60,
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let divergent = rt.block_on(async {
                let mut sim = ClusterSimulator::with_writers(writers, observers, skew, ChaosConfig::hostile(), seed);
                sim.run(steps).await;
                sim.flush();
                sim.divergent()
            });
            prop_assert!(divergent.is_empty(), "divergent: {:?}", divergent);
        }

        #[test]
        fn prop_any_schedule_converges(seed in any::<u64>(), observers in 1usize..5, steps in 1usize..80) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            let divergent = rt.block_on(async {
                let mut sim = ClusterSimulator::hostile(observers, seed);
                sim.run(steps).await;
                sim.flush();
                sim.divergent()
            });
            prop_assert!(divergent.is_empty(), "divergent: {:?}", divergent);
        }
    }
}

//! Timer session - one client's live view of one session
//!
//! Opening a session wires together:
//! 1. a Timer Engine subscribed to the session's timer key
//! 2. a lease subscription on the session's lease key (when a lease is in effect)
//! 3. a heartbeat task that claims and renews the lease (controllers only)
//! 4. a local tick loop rendering frames from the engine's state
//!
//! Closing (or dropping) the session undoes all four.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use matchclock_core::{lease_key, ClientId, ElapsedState, MatchclockResult, SessionId};
use matchclock_state::{
    ControllerLease, EngineConfig, LeaseChange, LeaseConfig, LeaseRecord, SharedLease, TimerEngine,
};
use matchclock_store::{StateStore, StoreBackend, Subscription};
use matchclock_time::{Clock, FrameSink, TickConfig, TickLoop};

use crate::RuntimeConfig;

/// What this client does in the session
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionRole {
    /// Issues commands; claims the lease when one is in effect
    Controller,
    /// Renders only; never claims the lease
    Display,
}

/// Session configuration
#[derive(Clone, Debug)]
pub struct SessionConfig {
    pub session_id: Option<SessionId>,
    pub client_id: ClientId,
    pub role: SessionRole,
    pub tick: TickConfig,
    /// `None` disables the controller lease: every client may command
    pub lease: Option<LeaseConfig>,
    pub echo_ttl: Duration,
}

impl SessionConfig {
    /// Lease-gated controller
    pub fn controller(session_id: Option<SessionId>) -> Self {
        let engine = EngineConfig::for_session(session_id);
        SessionConfig {
            session_id: engine.session_id,
            client_id: engine.client_id,
            role: SessionRole::Controller,
            tick: TickConfig::default(),
            lease: Some(LeaseConfig::default()),
            echo_ttl: engine.echo_ttl,
        }
    }

    /// Read-only display
    pub fn display(session_id: Option<SessionId>) -> Self {
        SessionConfig {
            role: SessionRole::Display,
            ..Self::controller(session_id)
        }
    }

    /// Controller without a lease
    pub fn unleased(session_id: Option<SessionId>) -> Self {
        SessionConfig {
            lease: None,
            ..Self::controller(session_id)
        }
    }

    /// Controller for `session_id` with the runtime's tick and lease settings
    pub fn from_runtime(config: &RuntimeConfig, session_id: Option<SessionId>) -> Self {
        SessionConfig {
            tick: config.tick.clone(),
            lease: config.lease.clone(),
            ..Self::controller(session_id)
        }
    }

    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }

    pub fn with_session(mut self, session_id: Option<SessionId>) -> Self {
        self.session_id = session_id;
        self
    }

    pub fn with_tick(mut self, tick: TickConfig) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_lease(mut self, lease: LeaseConfig) -> Self {
        self.lease = Some(lease);
        self
    }

    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            session_id: self.session_id.clone(),
            client_id: self.client_id.clone(),
            echo_ttl: self.echo_ttl,
        }
    }
}

/// Stores for timer state and lease records, opened on one backend
#[derive(Clone)]
pub struct SessionStores {
    pub timer: Arc<dyn StateStore<ElapsedState>>,
    pub lease: Arc<dyn StateStore<LeaseRecord>>,
}

impl SessionStores {
    pub fn open(backend: &StoreBackend) -> MatchclockResult<Self> {
        Ok(SessionStores {
            timer: backend.open()?,
            lease: backend.open()?,
        })
    }

    /// Fresh process-local stores
    pub fn memory() -> Self {
        SessionStores {
            timer: Arc::new(matchclock_store::MemoryStore::new()),
            lease: Arc::new(matchclock_store::MemoryStore::new()),
        }
    }
}

/// A live session. Must be opened inside a tokio runtime.
pub struct TimerSession {
    role: SessionRole,
    engine: Arc<TimerEngine>,
    timer_subscription: Option<Subscription>,
    lease_subscription: Option<Subscription>,
    heartbeat: Option<JoinHandle<()>>,
    tick: Option<TickLoop>,
}

impl TimerSession {
    pub fn open(
        config: SessionConfig,
        stores: &SessionStores,
        clock: Arc<dyn Clock>,
        sink: FrameSink,
    ) -> Self {
        let lease = config
            .lease
            .clone()
            .map(|lease| ControllerLease::new(config.client_id.clone(), lease).shared());

        let mut engine = TimerEngine::new(
            config.engine_config(),
            Arc::clone(&stores.timer),
            Arc::clone(&clock),
        );
        if let Some(lease) = &lease {
            engine = engine.with_lease(Arc::clone(lease));
        }
        let engine = Arc::new(engine);
        let timer_subscription = engine.attach();

        let key = lease_key(config.session_id.as_ref());
        let lease_subscription = lease
            .as_ref()
            .map(|lease| watch_lease(stores.lease.as_ref(), &key, Arc::clone(lease)));

        let heartbeat = match (&lease, config.role) {
            (Some(lease), SessionRole::Controller) => {
                // subscribe has delivered the current holder; a vacant lease
                // is claimed locally before the first heartbeat publishes it
                let claimed = lease.lock().heartbeat(clock.now_ms()).is_some();
                if claimed {
                    tracing::debug!(key = %key, client = %config.client_id, "lease claimed at open");
                }
                let period = lease.lock().config().renew_period;
                Some(tokio::spawn(run_heartbeat(
                    Arc::clone(lease),
                    Arc::clone(&stores.lease),
                    key,
                    Arc::clone(&clock),
                    period,
                )))
            }
            _ => None,
        };

        let tick = TickLoop::spawn(clock, engine.watch(), config.tick, sink);

        tracing::info!(
            key = %engine.key(),
            client = %config.client_id,
            role = ?config.role,
            leased = lease.is_some(),
            "session opened"
        );

        TimerSession {
            role: config.role,
            engine,
            timer_subscription: Some(timer_subscription),
            lease_subscription,
            heartbeat,
            tick: Some(tick),
        }
    }

    pub fn engine(&self) -> &Arc<TimerEngine> {
        &self.engine
    }

    pub fn role(&self) -> SessionRole {
        self.role
    }

    /// True if this client may issue commands right now
    pub fn is_controller(&self) -> bool {
        self.engine.is_controller()
    }

    /// Client holding a live lease, if any
    pub fn controller(&self) -> Option<ClientId> {
        let lease = self.engine.lease()?.lock();
        let now = self.engine.clock().now_ms();
        if lease.is_vacant(now) {
            return None;
        }
        lease.holder().map(|record| record.client_id.clone())
    }

    pub fn is_open(&self) -> bool {
        self.tick.is_some()
    }

    /// Frames rendered by the tick loop so far
    pub fn frames(&self) -> u64 {
        self.tick.as_ref().map_or(0, TickLoop::frames)
    }

    /// Unsubscribe from the store and cancel every task. Idempotent.
    pub fn close(&mut self) {
        if self.tick.is_none() {
            return;
        }
        if let Some(mut sub) = self.timer_subscription.take() {
            sub.unsubscribe();
        }
        if let Some(mut sub) = self.lease_subscription.take() {
            sub.unsubscribe();
        }
        if let Some(heartbeat) = self.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(mut tick) = self.tick.take() {
            tick.stop();
        }
        if let Some(lease) = self.engine.lease() {
            lease.lock().release();
        }
        tracing::info!(key = %self.engine.key(), "session closed");
    }
}

impl Drop for TimerSession {
    fn drop(&mut self) {
        self.close();
    }
}

fn watch_lease(
    store: &dyn StateStore<LeaseRecord>,
    key: &str,
    lease: SharedLease,
) -> Subscription {
    let log_key = key.to_string();
    store.subscribe(
        key,
        Arc::new(move |record: Option<LeaseRecord>| {
            let change = lease.lock().observe(record.clone());
            match change {
                LeaseChange::Acquired => tracing::info!(key = %log_key, "lease acquired"),
                LeaseChange::Lost => tracing::info!(
                    key = %log_key,
                    holder = ?record.map(|r| r.client_id),
                    "lease lost"
                ),
                LeaseChange::Updated | LeaseChange::Unchanged => {}
            }
        }),
    )
}

async fn run_heartbeat(
    lease: SharedLease,
    store: Arc<dyn StateStore<LeaseRecord>>,
    key: String,
    clock: Arc<dyn Clock>,
    period: Duration,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let record = lease.lock().heartbeat(clock.now_ms());
        let Some(record) = record else {
            continue;
        };
        if let Err(e) = store.publish(&key, &record).await {
            tracing::warn!(key = %key, error = %e, "lease heartbeat failed");
        }
    }
}

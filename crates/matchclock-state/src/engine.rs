//! Timer Engine - applies commands, publishes, reconciles
//!
//! The engine is the only component that publishes timer state. Each command:
//! 1. checks the controller lease (if one is in effect)
//! 2. reads `now` from the clock
//! 3. applies the model transform to the last-known state
//! 4. updates local state optimistically and notifies observers
//! 5. publishes to the store without holding any lock
//!
//! A failed publish is not retried; the next command publishes a newer
//! state that supersedes it.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;

use matchclock_core::{
    timer_key, ClientId, ElapsedState, SessionId, TimerCommand, TimerPhase,
};
use matchclock_store::{StateStore, Subscription};
use matchclock_time::Clock;

use crate::{EngineState, EngineStats, ReconcileOutcome, SharedLease};

/// Timer Engine configuration
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Session this engine drives (`None` for the default timer)
    pub session_id: Option<SessionId>,
    /// Identity stamped into published states
    pub client_id: ClientId,
    /// How long a published stamp is awaited as a self-echo
    pub echo_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            session_id: None,
            client_id: ClientId::generate(),
            echo_ttl: Duration::from_secs(5),
        }
    }
}

impl EngineConfig {
    pub fn for_session(session_id: Option<SessionId>) -> Self {
        EngineConfig {
            session_id,
            ..Self::default()
        }
    }

    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = client_id;
        self
    }
}

/// Result of a command
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommandOutcome {
    /// State changed locally; `published` is false if the store rejected it
    Applied { state: ElapsedState, published: bool },
    /// Command was a no-op on the current state
    Unchanged(ElapsedState),
    /// A controller lease is in effect and this client does not hold it
    PermissionDenied,
}

impl CommandOutcome {
    /// False only for `PermissionDenied`
    pub fn accepted(&self) -> bool {
        !matches!(self, CommandOutcome::PermissionDenied)
    }

    pub fn state(&self) -> Option<&ElapsedState> {
        match self {
            CommandOutcome::Applied { state, .. } | CommandOutcome::Unchanged(state) => Some(state),
            CommandOutcome::PermissionDenied => None,
        }
    }
}

/// Timer Engine for one session
pub struct TimerEngine {
    config: EngineConfig,
    key: String,
    state: Mutex<EngineState>,
    store: Arc<dyn StateStore<ElapsedState>>,
    clock: Arc<dyn Clock>,
    lease: Option<SharedLease>,
    changes: watch::Sender<ElapsedState>,
}

impl TimerEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn StateStore<ElapsedState>>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let state = EngineState::new(config.session_id.clone(), config.echo_ttl);
        let (changes, _) = watch::channel(state.held().clone());
        TimerEngine {
            key: timer_key(config.session_id.as_ref()),
            config,
            state: Mutex::new(state),
            store,
            clock,
            lease: None,
            changes,
        }
    }

    /// Require the lease for every mutating command
    pub fn with_lease(mut self, lease: SharedLease) -> Self {
        self.lease = Some(lease);
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn session_id(&self) -> Option<&SessionId> {
        self.config.session_id.as_ref()
    }

    pub fn client_id(&self) -> &ClientId {
        &self.config.client_id
    }

    pub fn lease(&self) -> Option<&SharedLease> {
        self.lease.as_ref()
    }

    /// True if this client may issue mutating commands
    pub fn is_controller(&self) -> bool {
        match &self.lease {
            Some(lease) => lease.lock().is_controller(self.clock.now_ms()),
            None => true,
        }
    }

    pub async fn start(&self) -> CommandOutcome {
        self.execute(TimerCommand::Start).await
    }

    pub async fn pause(&self) -> CommandOutcome {
        self.execute(TimerCommand::Pause).await
    }

    pub async fn reset(&self) -> CommandOutcome {
        self.execute(TimerCommand::Reset).await
    }

    /// Shift the elapsed value by a signed amount
    pub async fn add_interval(&self, delta_ms: i64) -> CommandOutcome {
        self.execute(TimerCommand::Adjust(delta_ms)).await
    }

    pub async fn add_minute(&self) -> CommandOutcome {
        self.execute(TimerCommand::add_minute()).await
    }

    pub async fn subtract_minute(&self) -> CommandOutcome {
        self.execute(TimerCommand::subtract_minute()).await
    }

    pub async fn jump_to(&self, target_ms: i64) -> CommandOutcome {
        self.execute(TimerCommand::JumpTo(target_ms)).await
    }

    /// Overwrite the elapsed value (HTTP `sync`)
    pub async fn sync_to(&self, elapsed_ms: i64) -> CommandOutcome {
        self.execute(TimerCommand::Sync(elapsed_ms)).await
    }

    /// Run one command through lease check, optimistic update and publish
    pub async fn execute(&self, command: TimerCommand) -> CommandOutcome {
        if !self.is_controller() {
            self.state.lock().record_denied();
            tracing::debug!(client = %self.config.client_id, %command, "command denied: not controller");
            return CommandOutcome::PermissionDenied;
        }

        let now = self.clock.now_ms();
        let next = {
            let mut state = self.state.lock();
            let next = match state.apply(command, now, &self.config.client_id) {
                Some(next) => next,
                None => return CommandOutcome::Unchanged(state.held().clone()),
            };
            // watch updates stay ordered with the held state
            self.changes.send_replace(next.clone());
            next
        };
        tracing::info!(
            key = %self.key,
            %command,
            stamp = next.last_update_epoch_ms,
            "command applied"
        );

        let stamp = next.last_update_epoch_ms;
        let published = match self.store.publish(&self.key, &next).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(key = %self.key, error = %e, "publish failed; keeping local state");
                false
            }
        };
        self.state.lock().publish_finished(stamp, published);

        CommandOutcome::Applied {
            state: next,
            published,
        }
    }

    /// Reconcile an update delivered by the store
    pub fn reconcile(&self, incoming: Option<ElapsedState>) -> ReconcileOutcome {
        let now = self.clock.now_ms();
        let outcome = {
            let mut state = self.state.lock();
            let outcome = state.reconcile(incoming, now);
            if matches!(
                outcome,
                ReconcileOutcome::Replaced | ReconcileOutcome::Initialized
            ) {
                self.changes.send_replace(state.held().clone());
            }
            outcome
        };
        if outcome == ReconcileOutcome::Confirmed {
            tracing::trace!(key = %self.key, "publish confirmed by echo");
        }
        outcome
    }

    /// Subscribe this engine to its store key. Keep the handle alive for as
    /// long as remote updates should be applied.
    pub fn attach(self: &Arc<Self>) -> Subscription {
        let engine = Arc::downgrade(self);
        self.store.subscribe(
            &self.key,
            Arc::new(move |incoming: Option<ElapsedState>| {
                if let Some(engine) = engine.upgrade() {
                    engine.reconcile(incoming);
                }
            }),
        )
    }

    /// Last-known state
    pub fn snapshot(&self) -> ElapsedState {
        self.state.lock().held().clone()
    }

    /// `current_elapsed` of the last-known state at the clock's now
    pub fn elapsed_now(&self) -> i64 {
        let now = self.clock.now_ms();
        self.state.lock().held().current_elapsed(now)
    }

    pub fn phase(&self) -> TimerPhase {
        self.state.lock().held().phase()
    }

    /// False after a failed publish until the store is reachable again
    pub fn is_connected(&self) -> bool {
        self.state.lock().is_connected()
    }

    pub fn stats(&self) -> EngineStats {
        self.state.lock().stats().clone()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Observe every change of held state
    pub fn watch(&self) -> watch::Receiver<ElapsedState> {
        self.changes.subscribe()
    }
}

//! Session registry for the HTTP surface
//!
//! One [`TimerSession`] per session id, opened on the first command and kept
//! attached to the store so updates from other processes are reconciled.
//! Reads of a session nobody has commanded yet go to the store once and
//! leave nothing behind.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use matchclock_core::{timer_key, ClientId, DisplayFrame, ElapsedState, MatchclockResult, SessionId};
use matchclock_state::TimerEngine;
use matchclock_time::{Clock, FrameSink};

use crate::{RuntimeConfig, SessionConfig, SessionStores, TimerSession};

/// Sessions keyed by id
pub struct SessionRegistry {
    stores: SessionStores,
    clock: Arc<dyn Clock>,
    template: SessionConfig,
    default_session: Option<SessionId>,
    sessions: Mutex<HashMap<Option<SessionId>, TimerSession>>,
}

impl SessionRegistry {
    /// Unleased controller sessions with default tick settings
    pub fn new(stores: SessionStores, clock: Arc<dyn Clock>) -> Self {
        Self::with_template(stores, clock, SessionConfig::unleased(None))
    }

    /// Sessions opened with the runtime's tick, lease and default session
    pub fn from_config(config: &RuntimeConfig, stores: SessionStores, clock: Arc<dyn Clock>) -> Self {
        Self::with_template(stores, clock, SessionConfig::from_runtime(config, None))
            .with_default_session(config.default_session.clone())
    }

    /// Every session is opened from `template` with its own session id
    pub fn with_template(stores: SessionStores, clock: Arc<dyn Clock>, template: SessionConfig) -> Self {
        SessionRegistry {
            stores,
            clock,
            template,
            default_session: None,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Session used when a request names none
    pub fn with_default_session(mut self, session: Option<SessionId>) -> Self {
        self.default_session = session;
        self
    }

    pub fn client_id(&self) -> &ClientId {
        &self.template.client_id
    }

    pub fn default_session(&self) -> Option<&SessionId> {
        self.default_session.as_ref()
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    fn resolve(&self, session: Option<SessionId>) -> Option<SessionId> {
        session.or_else(|| self.default_session.clone())
    }

    /// Engine for `session` (or the default), opening the session if needed
    pub fn engine(&self, session: Option<SessionId>) -> Arc<TimerEngine> {
        let session = self.resolve(session);
        let mut sessions = self.sessions.lock();
        if let Some(open) = sessions.get(&session) {
            return Arc::clone(open.engine());
        }

        let config = self.template.clone().with_session(session.clone());
        let opened = TimerSession::open(
            config,
            &self.stores,
            Arc::clone(&self.clock),
            frame_logger(session.as_ref()),
        );
        let engine = Arc::clone(opened.engine());
        sessions.insert(session, opened);
        engine
    }

    /// Engine for `session` if it is already open
    pub fn existing(&self, session: Option<SessionId>) -> Option<Arc<TimerEngine>> {
        let session = self.resolve(session);
        self.sessions
            .lock()
            .get(&session)
            .map(|open| Arc::clone(open.engine()))
    }

    /// Last-known state of `session`: the open engine's view, else one read
    /// of the store. Never opens a session.
    pub async fn state(&self, session: Option<SessionId>) -> MatchclockResult<ElapsedState> {
        let session = self.resolve(session);
        if let Some(engine) = self.existing(session.clone()) {
            return Ok(engine.snapshot());
        }
        let stored = self.stores.timer.fetch(&timer_key(session.as_ref())).await?;
        Ok(match stored {
            Some(state) if state.session_id == session => state.normalized(),
            _ => ElapsedState::new(session),
        })
    }

    /// Close `session`, dropping its subscriptions and tasks
    pub fn close(&self, session: Option<&SessionId>) -> bool {
        let key = session.cloned();
        let removed = self.sessions.lock().remove(&key);
        removed.is_some()
    }

    pub fn sessions(&self) -> Vec<Option<SessionId>> {
        let mut ids: Vec<_> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server-side sessions have no screen; rendered frames go to the trace log
fn frame_logger(session: Option<&SessionId>) -> FrameSink {
    let key = timer_key(session);
    Arc::new(move |frame: DisplayFrame| {
        tracing::trace!(key = %key, text = %frame.text, phase = ?frame.phase, "frame");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use matchclock_state::{CommandOutcome, LeaseConfig, LeaseRecord};
    use matchclock_store::MemoryStore;
    use matchclock_time::ManualClock;

    struct Rig {
        timer: MemoryStore<ElapsedState>,
        lease: MemoryStore<LeaseRecord>,
    }

    impl Rig {
        fn new() -> Self {
            Rig {
                timer: MemoryStore::new(),
                lease: MemoryStore::new(),
            }
        }

        fn stores(&self) -> SessionStores {
            SessionStores {
                timer: Arc::new(self.timer.clone()),
                lease: Arc::new(self.lease.clone()),
            }
        }

        fn registry(&self) -> SessionRegistry {
            SessionRegistry::new(self.stores(), Arc::new(ManualClock::new(1_000)))
        }
    }

    #[tokio::test]
    async fn test_engine_created_once() {
        let rig = Rig::new();
        let registry = rig.registry();
        assert!(registry.is_empty());

        let a = registry.engine(None);
        let b = registry.engine(None);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
        assert_eq!(rig.timer.subscriber_count("timer"), 1);
    }

    #[tokio::test]
    async fn test_default_session() {
        let rig = Rig::new();
        let registry = rig.registry().with_default_session(Some(SessionId::new("HOME")));

        let engine = registry.engine(None);
        assert_eq!(engine.key(), "timer/HOME");
        assert!(Arc::ptr_eq(&engine, &registry.engine(Some(SessionId::new("HOME")))));
        assert_eq!(registry.sessions(), vec![Some(SessionId::new("HOME"))]);
    }

    #[tokio::test]
    async fn test_sessions_are_isolated() {
        let rig = Rig::new();
        let registry = rig.registry();

        registry.engine(Some(SessionId::new("A"))).start().await;
        assert!(registry.engine(Some(SessionId::new("A"))).snapshot().is_running);
        assert!(!registry.engine(Some(SessionId::new("B"))).snapshot().is_running);
        assert!(!registry.engine(None).snapshot().is_running);
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_close_unsubscribes() {
        let rig = Rig::new();
        let registry = rig.registry();
        let session = SessionId::new("A");
        registry.engine(Some(session.clone()));

        assert!(registry.close(Some(&session)));
        assert!(!registry.close(Some(&session)));
        assert_eq!(rig.timer.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_picks_up_existing_state() {
        let rig = Rig::new();
        let other = rig.registry();
        other.engine(None).start().await;

        let registry = rig.registry();
        assert!(registry.engine(None).snapshot().is_running);
    }

    #[tokio::test]
    async fn test_reading_unknown_session_opens_nothing() {
        let rig = Rig::new();
        let registry = rig.registry();

        let state = registry.state(Some(SessionId::new("NOBODY"))).await.unwrap();
        assert_eq!(state, ElapsedState::new(Some(SessionId::new("NOBODY"))));
        assert!(registry.is_empty());
        assert!(registry.existing(Some(SessionId::new("NOBODY"))).is_none());
        assert_eq!(rig.timer.total_subscribers(), 0);
    }

    #[tokio::test]
    async fn test_reading_stored_session_without_opening() {
        let rig = Rig::new();
        let writer = rig.registry();
        writer.engine(Some(SessionId::new("A"))).jump_to(5_000).await;

        let reader = rig.registry();
        let state = reader.state(Some(SessionId::new("A"))).await.unwrap();
        assert_eq!(state.base_elapsed_ms, 5_000);
        assert!(reader.is_empty());
    }

    #[tokio::test]
    async fn test_leased_registries_have_one_controller() {
        let rig = Rig::new();
        let mut runtime = RuntimeConfig::local();
        runtime.lease = Some(LeaseConfig::default());
        let clock = Arc::new(ManualClock::new(1_000));

        let first = SessionRegistry::from_config(&runtime, rig.stores(), clock.clone());
        let second = SessionRegistry::from_config(&runtime, rig.stores(), clock);

        assert!(first.engine(None).start().await.accepted());
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(second.engine(None).pause().await, CommandOutcome::PermissionDenied);
        assert_eq!(rig.lease.get("controller").map(|r| r.client_id), Some(first.client_id().clone()));
    }
}

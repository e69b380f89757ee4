//! HTTP control surface
//!
//! - `GET /timer[?session=ID]` returns the current state
//! - `POST /timer[?session=ID]` with `{action, elapsedMs?}` applies a command
//! - `GET /healthz` liveness check
//!
//! There is no authentication. An unknown action leaves the state unchanged
//! and still answers 200.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::net::TcpListener;

use matchclock_core::{parse_http_action, ElapsedState, EpochMillis, MatchclockResult, SessionId};
use matchclock_state::TimerEngine;
use matchclock_time::SystemClock;

use crate::{RuntimeConfig, SessionRegistry, SessionStores};

/// State as seen by poll clients
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerView {
    /// Elapsed at the moment of the response
    pub elapsed_ms: i64,
    pub is_running: bool,
    pub last_update_epoch_ms: i64,
    pub session_id: Option<SessionId>,
}

impl TimerView {
    pub fn of(engine: &TimerEngine) -> Self {
        Self::at(&engine.snapshot(), engine.clock().now_ms())
    }

    /// View of `state` as of `now`
    pub fn at(state: &ElapsedState, now: EpochMillis) -> Self {
        TimerView {
            elapsed_ms: state.current_elapsed(now),
            is_running: state.is_running,
            last_update_epoch_ms: state.last_update_epoch_ms,
            session_id: state.session_id.clone(),
        }
    }
}

/// `POST /timer` body
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerRequest {
    pub action: String,
    #[serde(default, alias = "elapsed")]
    pub elapsed_ms: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct SessionQuery {
    session: Option<String>,
}

impl SessionQuery {
    fn session_id(&self) -> Option<SessionId> {
        self.session
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(SessionId::new)
    }
}

/// Errors answered to HTTP clients
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("malformed request body: {0}")]
    MalformedBody(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MalformedBody(_) => StatusCode::BAD_REQUEST,
        };
        let body = serde_json::json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the router over `registry`
pub fn router(registry: Arc<SessionRegistry>) -> Router {
    Router::new()
        .route("/timer", get(get_timer).post(post_timer))
        .route("/healthz", get(healthz))
        .with_state(registry)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn get_timer(
    State(registry): State<Arc<SessionRegistry>>,
    Query(query): Query<SessionQuery>,
) -> Json<TimerView> {
    let session = query.session_id();
    // reads never open a session
    let state = match registry.state(session.clone()).await {
        Ok(state) => state,
        Err(e) => {
            tracing::warn!(?session, error = %e, "store read failed; answering zero state");
            ElapsedState::new(session.or_else(|| registry.default_session().cloned()))
        }
    };
    Json(TimerView::at(&state, registry.clock().now_ms()))
}

async fn post_timer(
    State(registry): State<Arc<SessionRegistry>>,
    Query(query): Query<SessionQuery>,
    body: Bytes,
) -> Result<Json<TimerView>, ApiError> {
    let request: TimerRequest =
        serde_json::from_slice(&body).map_err(|e| ApiError::MalformedBody(e.to_string()))?;
    let engine = registry.engine(query.session_id());

    match parse_http_action(&request.action, request.elapsed_ms) {
        Ok(Some(command)) => {
            let outcome = engine.execute(command).await;
            tracing::debug!(key = %engine.key(), %command, ?outcome, "http command");
        }
        Ok(None) => {
            tracing::debug!(key = %engine.key(), "sync without elapsedMs; state unchanged");
        }
        Err(e) => {
            tracing::debug!(key = %engine.key(), error = %e, "ignoring http command");
        }
    }

    Ok(Json(TimerView::of(&engine)))
}

/// Bound, not yet serving
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
}

impl Server {
    /// Bind the listener and open the configured store
    pub async fn bind(config: &RuntimeConfig) -> MatchclockResult<Self> {
        config.validate()?;
        let stores = SessionStores::open(&config.store)?;
        let registry = SessionRegistry::from_config(config, stores, Arc::new(SystemClock::new()));
        let listener = TcpListener::bind(config.bind).await?;
        Ok(Server {
            listener,
            registry: Arc::new(registry),
        })
    }

    pub fn local_addr(&self) -> MatchclockResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> MatchclockResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        tracing::info!(%addr, "http listening");
        axum::serve(self.listener, router(self.registry))
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("http stopped");
        Ok(())
    }
}

/// Bind and serve `config` until `shutdown` resolves
pub async fn serve<F>(config: RuntimeConfig, shutdown: F) -> MatchclockResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    tracing::info!(
        bind = %config.bind,
        store = config.store.name(),
        tick = %humantime::format_duration(config.tick.cadence),
        leased = config.lease.is_some(),
        "starting"
    );
    Server::bind(&config).await?.run(shutdown).await
}

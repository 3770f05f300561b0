//! Streaming web bridge for the tool-calling orchestrator
//!
//! `GET /api/chat` runs one query and streams every step event as
//! server-sent events. Tools are discovered per request from the tool server
//! named in the query string; the LLM client is shared across requests.
//! Everything outside `/api` and `/health` is served from the web directory.

use axum::{
    extract::{Query, State},
    response::sse::{Event, KeepAlive, Sse},
    routing::get,
    Json, Router,
};
use futures::{Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::agent::{run_session, SessionTarget};
use crate::config::{
    ConfigSource, BRIDGE_WEB_DIR_VAR, DEFAULT_BASE_URL, DEFAULT_SERVER_URL, DEFAULT_TIMEOUT_SECS,
    DEFAULT_WEB_DIR, TRANSPORT_VAR,
};
use crate::error::OrchestrationError;
use crate::events::{ChannelSink, Emitter, EventEnvelope, StepEvent};
use crate::llm::LlmGateway;
use crate::models::{
    OrchestrationConfig, DEFAULT_MAX_STEPS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
use crate::tools::Transport;
use crate::Result;

/// Events buffered per stream before the run waits on the subscriber.
const EVENT_BUFFER: usize = 64;

/// =============================
/// API State
/// =============================

/// Server-wide defaults applied to every chat request.
#[derive(Debug, Clone)]
pub struct BridgeSettings {
    pub model: String,
    pub base_url: String,
    pub server_url: String,
    pub temperature: f32,
    pub tool_timeout: Duration,
    pub transport: Transport,
    pub web_dir: PathBuf,
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            server_url: DEFAULT_SERVER_URL.to_string(),
            temperature: DEFAULT_TEMPERATURE,
            tool_timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            transport: Transport::Auto,
            web_dir: PathBuf::from(DEFAULT_WEB_DIR),
        }
    }
}

impl BridgeSettings {
    pub fn from_source(source: &ConfigSource, base_url: impl Into<String>) -> Result<Self> {
        let transport = match source.get(TRANSPORT_VAR) {
            Some(raw) => raw.parse()?,
            None => Transport::Auto,
        };

        Ok(Self {
            model: source.model(None),
            base_url: base_url.into(),
            transport,
            web_dir: PathBuf::from(source.get_or(BRIDGE_WEB_DIR_VAR, DEFAULT_WEB_DIR)),
            ..Self::default()
        })
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub gateway: Arc<dyn LlmGateway>,
    pub settings: Arc<BridgeSettings>,
}

/// =============================
/// Request Models
/// =============================

#[derive(Debug, Default, Deserialize)]
pub struct ChatParams {
    #[serde(default)]
    pub query: String,
    pub server_url: Option<String>,
    pub max_steps: Option<String>,
    pub verbose: Option<String>,
}

impl ChatParams {
    fn verbose(&self) -> bool {
        matches!(self.verbose.as_deref(), Some("1" | "true" | "True"))
    }

    fn server_url<'a>(&'a self, settings: &'a BridgeSettings) -> &'a str {
        self.server_url
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .unwrap_or(&settings.server_url)
    }

    fn run_config(&self, settings: &BridgeSettings) -> Result<OrchestrationConfig> {
        let max_steps = match self.max_steps.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
            Some(raw) => raw.parse().map_err(|_| {
                OrchestrationError::Config(format!("max_steps must be a positive integer: {}", raw))
            })?,
            None => DEFAULT_MAX_STEPS,
        };

        Ok(OrchestrationConfig {
            max_steps,
            temperature: settings.temperature,
            model: settings.model.clone(),
            verbose: self.verbose(),
            require_tools: true,
        })
    }
}

/// =============================
/// Health Endpoint
/// =============================

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

/// =============================
/// Chat Endpoint (SSE)
/// =============================

async fn chat_stream(
    State(state): State<ApiState>,
    Query(params): Query<ChatParams>,
) -> Sse<impl Stream<Item = std::result::Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let cancel = CancellationToken::new();

    tokio::spawn(run_chat(
        state,
        params,
        ChannelSink::new(tx, cancel.clone()),
        cancel.clone(),
    ));

    // The guard lives as long as the response stream; a client disconnect
    // drops it and cancels the run.
    let guard = cancel.drop_guard();
    let stream = ReceiverStream::new(rx).map(move |envelope| {
        let _ = &guard;
        Ok::<_, Infallible>(to_sse_event(&envelope))
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn to_sse_event(envelope: &EventEnvelope) -> Event {
    match serde_json::to_string(envelope) {
        Ok(data) => Event::default().data(data),
        Err(e) => {
            warn!(error = %e, "Failed to serialize event");
            Event::default().comment("unserializable event")
        }
    }
}

async fn run_chat(
    state: ApiState,
    params: ChatParams,
    sink: ChannelSink,
    cancel: CancellationToken,
) {
    let mut emitter = Emitter::new(sink);
    let settings = &state.settings;

    let query = params.query.trim();
    if query.is_empty() {
        let err = OrchestrationError::Config("missing query parameter".to_string());
        emitter.emit(StepEvent::error(None, &err)).await;
        return;
    }

    let config = match params.run_config(settings) {
        Ok(config) => config,
        Err(e) => {
            emitter.emit(StepEvent::error(None, &e)).await;
            return;
        }
    };
    let target = SessionTarget {
        server_url: params.server_url(settings).to_string(),
        base_url: settings.base_url.clone(),
        tool_timeout: settings.tool_timeout,
        transport: settings.transport,
    };

    info!(server_url = %target.server_url, max_steps = config.max_steps, "Chat request received");

    let report = run_session(state.gateway.clone(), &target, config, query, &mut emitter, &cancel).await;

    info!(
        steps = report.steps,
        exit_code = report.outcome.exit_code(),
        "Chat run finished"
    );
}

/// =============================
/// Router Setup
/// =============================

pub fn create_router(state: ApiState) -> Router {
    let static_files = ServeDir::new(state.settings.web_dir.clone());

    Router::new()
        .route("/health", get(health))
        .route("/api/chat", get(chat_stream))
        .fallback_service(static_files)
        .with_state(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// =============================
/// Server Startup
/// =============================

pub async fn start_server(state: ApiState, host: &str, port: u16) -> Result<()> {
    let router = create_router(state);

    let listener = tokio::net::TcpListener::bind((host, port)).await?;

    info!("Bridge listening on http://{}:{}", host, port);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}

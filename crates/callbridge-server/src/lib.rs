//! Telephone call to conversational AI bridge.
//!
//! Serves the carrier's voice webhook and media stream WebSocket, and runs
//! one turn controller per live call.

pub mod api_stream;
pub mod api_voice;
pub mod codec;
pub mod config;
pub mod providers;
pub mod registry;
pub mod turn;

use axum::{
    extract::Extension,
    routing::{get, post},
    Json, Router,
};
use callbridge_types::SessionEvent;
use config::Config;
use registry::SessionRegistry;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::trace::TraceLayer;
use turn::{TurnSettings, VoicePipeline};

/// Session events buffered for slow subscribers.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Immutable startup configuration.
    pub config: Arc<Config>,
    /// Provider clients shared by every call.
    pub pipeline: VoicePipeline,
    /// Turn-taking behavior derived from `config`.
    pub settings: TurnSettings,
    /// Live call sessions.
    pub registry: SessionRegistry,
    /// Broadcast channel for session lifecycle events.
    pub events_tx: broadcast::Sender<SessionEvent>,
}

impl AppState {
    pub fn new(config: Config, pipeline: VoicePipeline) -> Self {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            settings: TurnSettings::from_config(&config),
            config: Arc::new(config),
            pipeline,
            registry: SessionRegistry::new(),
            events_tx,
        }
    }
}

/// Health check handler.
///
/// Returns `200 OK` with server status, version and the number of live calls.
async fn health(Extension(state): Extension<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeSessions": state.registry.len().await,
    }))
}

/// Builds the application router with all routes.
pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/voice",
            post(api_voice::voice_webhook_handler).get(api_voice::voice_webhook_handler),
        )
        .route("/stream", get(api_stream::stream_handler))
        .layer(TraceLayer::new_for_http())
        .layer(Extension(Arc::new(state)))
}

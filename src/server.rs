//! Process-wide wiring: collaborator construction, the axum router, and
//! graceful shutdown.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use tracing::{error, info, warn};

use crate::clients::http::{HttpLlmClient, HttpProvider, HttpSttClient, HttpTtsClient};
use crate::clients::{LlmClient, SttClient, TtsClient};
use crate::config::{AppConfig, TurnConfig};
use crate::controller::handle_connection;
use crate::error::Result;
use crate::keepwarm::KeepWarmPinger;
use crate::opener_cache::OpenerCache;
use crate::scope::{HttpScopeResolver, ScopeResolver};

/// Collaborators shared by every connection.
pub struct AppState {
    pub stt: Arc<dyn SttClient>,
    pub llm: Arc<dyn LlmClient>,
    pub tts: Arc<dyn TtsClient>,
    pub opener_cache: Arc<OpenerCache>,
    pub scope_resolver: Arc<dyn ScopeResolver>,
    pub turn_config: TurnConfig,

    active_sessions: AtomicI64,
    total_sessions: AtomicU64,
}

impl AppState {
    /// Build state directly from collaborators, bypassing environment
    /// configuration and provider HTTP construction. Used by tests that
    /// need an `AppState` wired to fakes.
    #[cfg(any(test, feature = "test-support"))]
    pub fn for_test(
        stt: Arc<dyn SttClient>,
        llm: Arc<dyn LlmClient>,
        tts: Arc<dyn TtsClient>,
        opener_cache: Arc<OpenerCache>,
        scope_resolver: Arc<dyn ScopeResolver>,
        turn_config: TurnConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            stt,
            llm,
            tts,
            opener_cache,
            scope_resolver,
            turn_config,
            active_sessions: AtomicI64::new(0),
            total_sessions: AtomicU64::new(0),
        })
    }

    pub fn sessions_opened(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
        self.total_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn sessions_closed(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Build the process-wide collaborators from configuration: the inference
/// clients, the opener-phrase cache (synthesising any missing entries), and
/// the scope resolver.
pub async fn build_state(config: AppConfig) -> Result<Arc<AppState>> {
    let provider = HttpProvider::new(config.provider.clone())?;
    let stt: Arc<dyn SttClient> = Arc::new(HttpSttClient::new(
        provider.clone(),
        config.turn.min_audio_bytes,
    ));
    let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(provider.clone()));
    let tts: Arc<dyn TtsClient> = Arc::new(HttpTtsClient::new(provider));

    let opener_cache = Arc::new(
        OpenerCache::load_or_generate_all(&config.opener_cache.phrases, &config.opener_cache.dir, &tts)
            .await?,
    );

    let scope_resolver: Arc<dyn ScopeResolver> =
        Arc::new(HttpScopeResolver::new(config.scope.base_url));

    Ok(Arc::new(AppState {
        stt,
        llm,
        tts,
        opener_cache,
        scope_resolver,
        turn_config: config.turn,
        active_sessions: AtomicI64::new(0),
        total_sessions: AtomicU64::new(0),
    }))
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/voice/{table_token}", get(voice_handler))
        .route("/healthz", get(healthz))
        .with_state(state)
}

async fn voice_handler(
    State(state): State<Arc<AppState>>,
    Path(table_token): Path<String>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    match state.scope_resolver.lookup_scope(&table_token).await {
        Ok(scope) => ws.on_upgrade(move |socket| handle_connection(state, scope, socket)),
        Err(e) => {
            warn!("table token did not resolve to a scope: {e}");
            ws.on_upgrade(|mut socket| async move {
                use axum::extract::ws::{CloseFrame, Message};
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: 4004,
                        reason: "unknown table token".into(),
                    })))
                    .await;
            })
        }
    }
}

async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "active_sessions": state.active_sessions.load(Ordering::Relaxed),
        "total_sessions": state.total_sessions.load(Ordering::Relaxed),
        "opener_cache_entries": state.opener_cache.len(),
    }))
}

/// Start the keep-warm pinger and serve until shutdown is requested.
pub async fn serve(config: AppConfig) -> Result<()> {
    let bind_addr = config.server.bind_addr.clone();
    let keep_warm_interval = config.turn.keep_warm_interval;

    let state = build_state(config).await?;
    let pinger = KeepWarmPinger::start(Arc::clone(&state.stt), Arc::clone(&state.tts), keep_warm_interval);

    let app = router(Arc::clone(&state));
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .map_err(crate::error::CoreError::Io)?;
    info!("listening on {bind_addr}");

    let result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    pinger.stop();
    if let Err(e) = result {
        error!("server exited with error: {e}");
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received, draining connections");
}

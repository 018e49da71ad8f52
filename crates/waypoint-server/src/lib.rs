//! Waypoint Server — HTTP adapter for the Waypoint workflow
//! orchestrator.
//!
//! This crate provides the HTTP layer (via axum) on top of
//! `waypoint-core`: the MCP Streamable HTTP endpoint exposing the five
//! orchestrator tools, a small REST surface per resource, and the
//! server bootstrap.
//!
//! # Architecture
//!
//! ```text
//! waypoint-core    (domain: engine, definitions, store, AI clients)
//!      ↑
//! waypoint-server  (adapter: HTTP/axum, this crate)
//! ```

pub mod api;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use waypoint_core::ai::{AiClient, GeminiClient, StubAiClient};
use waypoint_core::config::OrchestratorConfig;
use waypoint_core::db::Database;
use waypoint_core::definitions::WorkflowDefinitionService;
use waypoint_core::state::{AppState, AppStateInner};

/// Configuration for the Waypoint backend server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub orchestrator: OrchestratorConfig,
}

/// Initialize tracing from the environment. `LOG_LEVEL` (or `RUST_LOG`)
/// feeds the filter; `ORCHESTRATOR_LOG_DIR` / `ORCHESTRATOR_LOG_FILE`
/// redirect output to an append-mode log file.
pub fn init_tracing() {
    let filter = if let Ok(level) = std::env::var("LOG_LEVEL") {
        tracing_subscriber::EnvFilter::new(level)
    } else {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "waypoint_core=info,waypoint_server=info,tower_http=info".into())
    };

    match log_file_writer() {
        Some(file) => {
            let _ = tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(file)
                .try_init();
        }
        None => {
            let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
        }
    }
}

fn log_file_writer() -> Option<Arc<std::fs::File>> {
    let dir = std::env::var("ORCHESTRATOR_LOG_DIR").ok().filter(|v| !v.is_empty());
    let file = std::env::var("ORCHESTRATOR_LOG_FILE").ok().filter(|v| !v.is_empty());

    let path: PathBuf = match (dir, file) {
        (_, Some(f)) if Path::new(&f).is_absolute() => PathBuf::from(f),
        (Some(d), Some(f)) => Path::new(&d).join(f),
        (Some(d), None) => Path::new(&d).join("orchestrator.log"),
        (None, Some(f)) => PathBuf::from(f),
        (None, None) => return None,
    };

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
        Ok(f) => Some(Arc::new(f)),
        Err(e) => {
            eprintln!("cannot open log file {}: {}", path.display(), e);
            None
        }
    }
}

/// Build a shared `AppState` from the orchestrator configuration.
pub async fn create_app_state(config: &OrchestratorConfig) -> Result<AppState, String> {
    let db = Database::open(&config.db_path.to_string_lossy())
        .map_err(|e| format!("failed to open database: {}", e))?;

    let definitions = Arc::new(WorkflowDefinitionService::new(&config.definitions_dir));

    let ai: Arc<dyn AiClient> = if config.use_stub_ai {
        tracing::info!("using stub AI client");
        Arc::new(StubAiClient::new())
    } else {
        let model = config
            .gemini_model
            .clone()
            .ok_or("GEMINI_MODEL_NAME is required when not using the stub AI client")?;
        let api_key = config
            .gemini_api_key
            .clone()
            .ok_or("GEMINI_API_KEY is required when not using the stub AI client")?;
        tracing::info!("using Gemini AI client with model: {}", model);
        Arc::new(GeminiClient::new(model, api_key, config.gemini_timeout))
    };

    Ok(Arc::new(AppStateInner::new(db, definitions, ai)))
}

/// Assemble the full application router with CORS and trace layers.
pub fn app_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(api::api_router())
        .route("/api/health", axum::routing::get(health_check))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the backend server. Returns the actual address the server is
/// listening on; the accept loop runs in a background task.
pub async fn start_server(config: ServerConfig) -> Result<SocketAddr, String> {
    tracing::info!(
        "starting Waypoint backend server on {}:{}",
        config.host,
        config.port
    );

    let state = create_app_state(&config.orchestrator).await?;
    let app = app_router(state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .map_err(|e| format!("invalid address: {}", e))?;

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind to {}: {}", addr, e))?;

    let local_addr = listener
        .local_addr()
        .map_err(|e| format!("failed to get local address: {}", e))?;

    tracing::info!("Waypoint backend server listening on {}", local_addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("server error: {}", e);
        }
    });

    Ok(local_addr)
}

async fn health_check() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({
        "status": "ok",
        "server": "waypoint-server",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

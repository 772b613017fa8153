//! # charlink-server
//!
//! HTTP front end for Charlink.
//!
//! This binary provides:
//! - **Character browsing and creation**: feeds, search, and multipart
//!   creation with avatar upload to the image host
//! - **Conversations**: one orchestrator per user, live-subscribed to the
//!   Message Log, with persona replies from the generative backend
//! - **Template administration** behind a bearer admin token
//! - **Per-IP rate limiting**

mod api;
mod backend;
mod config;
mod error;
mod rate_limit;
mod sessions;

use std::sync::Arc;
use std::time::Duration;

use charlink_client::OrchestratorConfig;
use charlink_net::GenerativeBackend;
use charlink_prompt::SystemInstructionTemplate;
use charlink_store::{Database, MemoryStore, MessageLog, PersonaStore};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::api::AppState;
use crate::config::{ServerConfig, StoreBackend};
use crate::rate_limit::RateLimiter;
use crate::sessions::SessionRegistry;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // -----------------------------------------------------------------------
    // 1. Initialize tracing (respects RUST_LOG env var)
    // -----------------------------------------------------------------------
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                EnvFilter::new("info,charlink_server=debug,charlink_client=debug")
            }),
        )
        .init();

    info!("Starting Charlink server v{}", env!("CARGO_PKG_VERSION"));

    // -----------------------------------------------------------------------
    // 2. Load configuration
    // -----------------------------------------------------------------------
    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    // -----------------------------------------------------------------------
    // 3. Initialize subsystems
    // -----------------------------------------------------------------------
    let (personas, log) = open_store(&config)?;

    let template = SystemInstructionTemplate::new();
    if let Some(path) = &config.system_instruction_path {
        let text = tokio::fs::read_to_string(path).await?;
        template.set(text)?;
        info!(path = %path.display(), "System instruction loaded from file");
    }

    let generative: Arc<dyn GenerativeBackend> = backend::generative_backend(&config)?;
    let images = backend::image_host(&config)?;

    let sessions = Arc::new(SessionRegistry::new(
        log.clone(),
        generative,
        template.clone(),
        OrchestratorConfig {
            history_window: config.history_window,
            ..OrchestratorConfig::default()
        },
    ));

    let rate_limiter = RateLimiter::default();

    let app_state = AppState {
        personas,
        log,
        images,
        sessions: sessions.clone(),
        template,
        rate_limiter: rate_limiter.clone(),
        replies_enabled: config.gemini_api_key.is_some(),
        config: Arc::new(config.clone()),
        started_at: chrono::Utc::now(),
    };

    // -----------------------------------------------------------------------
    // 4. Spawn background tasks
    // -----------------------------------------------------------------------

    // Every 5 minutes, forget clients and sessions idle for more than 10.
    let rl = rate_limiter.clone();
    let idle_sessions = sessions.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            rl.purge_idle(Duration::from_secs(600)).await;
            idle_sessions.evict_idle(Duration::from_secs(600)).await;
        }
    });

    // -----------------------------------------------------------------------
    // 5. Run the HTTP API server until it fails or Ctrl+C
    // -----------------------------------------------------------------------
    let result = tokio::select! {
        result = api::serve(app_state, config.http_addr) => {
            if let Err(e) = &result {
                tracing::error!(error = %e, "HTTP server failed");
            }
            result
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
            Ok(())
        }
    };

    sessions.shutdown_all().await;
    result
}

fn open_store(config: &ServerConfig) -> anyhow::Result<(Arc<dyn PersonaStore>, Arc<dyn MessageLog>)> {
    match config.store_backend {
        StoreBackend::Memory => {
            info!("Using in-memory store (data is lost on exit)");
            let store = Arc::new(MemoryStore::new());
            let personas: Arc<dyn PersonaStore> = store.clone();
            let log: Arc<dyn MessageLog> = store;
            Ok((personas, log))
        }
        StoreBackend::Sqlite => {
            let db = match &config.database_path {
                Some(path) => Database::open_at(path)?,
                None => Database::open()?,
            };
            if let Some(path) = db.path() {
                info!(path = %path.display(), "Using SQLite store");
            }
            let db = Arc::new(db);
            let personas: Arc<dyn PersonaStore> = db.clone();
            let log: Arc<dyn MessageLog> = db;
            Ok((personas, log))
        }
    }
}

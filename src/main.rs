//! Server binary: settings from the environment, SQLite store on disk,
//! axum serving REST + WebSocket until ctrl-c.

use std::sync::Arc;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use tabula::auth::TokenVerifier;
use tabula::config::Settings;
use tabula::llm::OpenAiClient;
use tabula::server::{AppState, router};
use tabula::session::SessionManager;
use tabula::store::MessageStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("tabula=info,tower_http=info")),
        )
        .init();

    let settings = Settings::from_env().context("reading settings")?;

    std::fs::create_dir_all(&settings.data_dir)
        .with_context(|| format!("creating data dir {}", settings.data_dir))?;
    let db_path = std::path::Path::new(&settings.data_dir).join("tabula.db");
    let store = Arc::new(MessageStore::open(&db_path).context("opening message store")?);

    let verifier = TokenVerifier::new(&settings.signing_secret, settings.token_ttl);
    let model = Arc::new(OpenAiClient::new(&settings).context("building model client")?);
    let manager = Arc::new(SessionManager::new(settings.clone(), store, model));

    let app = router(AppState { manager, verifier });

    let listener = tokio::net::TcpListener::bind(&settings.bind_addr)
        .await
        .with_context(|| format!("binding {}", settings.bind_addr))?;
    tracing::info!(addr = %settings.bind_addr, model = %settings.llm_model, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await
        .context("serving")?;

    Ok(())
}

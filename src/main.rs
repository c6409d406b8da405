use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use lumo_lite::{
    api::{self, AppState},
    config::{LlamaSettings, ServerConfig},
    inference::{InferenceService, TextGenerator},
};

#[tokio::main]
async fn main() -> Result<()> {
    // -----------------------------
    // Logging
    // -----------------------------
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("lumo_lite=info,tower_http=info")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServerConfig::from_env()?;
    info!("🚀 Starting lumo-lite inference server...");

    // -----------------------------
    // Model (loaded once, shared read-only)
    // -----------------------------
    let engine = load_engine(&config.llama)?;
    let state = AppState::new(InferenceService::new(engine), &config);

    let app = api::router()
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state);

    let listener = TcpListener::bind(config.bind_addr).await?;
    info!("🌐 HTTP listening on http://{}", config.bind_addr);
    info!("💬 Chat at POST /chat, completions at POST /v1/completions");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("server stopped");
    Ok(())
}

#[cfg(feature = "llama-cpp")]
fn load_engine(settings: &LlamaSettings) -> Result<Arc<dyn TextGenerator>> {
    use lumo_lite::inference::llama_cpp_service::LlamaCppService;

    Ok(Arc::new(LlamaCppService::new(settings)?))
}

#[cfg(not(feature = "llama-cpp"))]
fn load_engine(settings: &LlamaSettings) -> Result<Arc<dyn TextGenerator>> {
    if !settings.model_path.exists() {
        anyhow::bail!("GGUF model not found at {}", settings.model_path.display());
    }
    anyhow::bail!(
        "lumo-lite was built without an inference engine; rebuild with `--features llama-cpp` to serve {}",
        settings.model_path.display()
    )
}

async fn shutdown_signal() {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("shutdown signal received");
    }
}

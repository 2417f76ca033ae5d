use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{fmt, EnvFilter};

use bmad_pipeline::clients::gemini::{usable_api_key, GeminiClient};
use bmad_pipeline::clients::memory::{InMemoryObjectStore, InMemoryRecipeStore};
use bmad_pipeline::clients::object_store::HttpObjectStore;
use bmad_pipeline::clients::ObjectStore;
use bmad_pipeline::placeholders::PlaceholderPool;
use bmad_pipeline::routes::{router, AppState};
use bmad_pipeline::{Collaborators, Coordinator, PipelineConfig, ProgressTracker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).init();

    let config = PipelineConfig::from_env();
    tracing::info!(?config, "pipeline configuration");

    let api_key = usable_api_key(std::env::var("GEMINI_API_KEY").ok())
        .context("GEMINI_API_KEY must be set to a real key, every chunk calls the Gemini API")?;
    tracing::info!("Using API key: {}...", api_key.chars().take(10).collect::<String>());
    let gemini = Arc::new(
        GeminiClient::new(api_key, std::env::var("GEMINI_API_BASE").ok(), config.content_timeout.max(config.image_timeout))
            .context("building Gemini HTTP client")?,
    );

    let objects: Arc<dyn ObjectStore> = match std::env::var("OBJECT_STORE_URL") {
        Ok(endpoint) => {
            let bucket = std::env::var("OBJECT_STORE_BUCKET").unwrap_or_else(|_| "recipe-images".into());
            tracing::info!(%endpoint, %bucket, "☁️ Using HTTP object store");
            Arc::new(
                HttpObjectStore::new(
                    endpoint,
                    bucket,
                    std::env::var("OBJECT_STORE_TOKEN").ok(),
                    std::env::var("OBJECT_STORE_PUBLIC_URL").ok(),
                    config.upload_timeout,
                )
                .context("building object store client")?,
            )
        }
        Err(_) => {
            tracing::warn!("OBJECT_STORE_URL not set, images are kept in memory");
            Arc::new(InMemoryObjectStore::new("memory://recipe-images"))
        }
    };

    let tracker = Arc::new(ProgressTracker::new(&config));
    let collaborators = Collaborators {
        content: gemini.clone(),
        images: gemini,
        objects,
        recipes: Arc::new(InMemoryRecipeStore::new()),
    };
    let coordinator = Coordinator::new(collaborators, tracker.clone(), Arc::new(PlaceholderPool::embedded()), config.clone());

    spawn_janitor(tracker, config.retention);

    let app = router(AppState::new(coordinator)).layer(
        ServiceBuilder::new()
            .layer(TraceLayer::new_for_http())
            .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any)),
    );

    let port: u16 = std::env::var("PORT").ok().and_then(|v| v.parse().ok()).unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!(%addr, "Starting server");
    let listener = tokio::net::TcpListener::bind(addr).await.with_context(|| format!("binding {addr}"))?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await.context("serving HTTP")?;
    Ok(())
}

/// Evicts finished jobs once their retention window has passed.
fn spawn_janitor(tracker: Arc<ProgressTracker>, retention: Duration) {
    let period = (retention / 4).clamp(Duration::from_secs(1), Duration::from_secs(60));
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        loop {
            ticker.tick().await;
            let evicted = tracker.evict_expired(Instant::now());
            if evicted > 0 {
                tracing::info!(evicted, "🧹 expired jobs evicted");
            }
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}

// Windlass host server: wires the configured world, the in-process queue,
// and the HTTP endpoints. Workflow and step registration happens in the
// embedding application before `attach`; this binary serves an empty
// registry, which is still useful for health checks and manifest hosting.

use std::sync::Arc;

use anyhow::{Context, Result};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use windlass_api::routes::{routes, AppState};
use windlass_engine::Runtime;
use windlass_world::{InMemoryQueue, WorldConfig};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "windlass=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = WorldConfig::from_env();
    let world = config
        .connect()
        .await
        .context("failed to connect the configured world")?;
    let queue = Arc::new(InMemoryQueue::new());

    let runtime = Arc::new(Runtime::new(world, queue));
    Runtime::attach(&runtime)
        .await
        .context("failed to attach runtime to queue")?;

    if runtime.manifest().workflows.is_empty() {
        tracing::warn!("no workflows registered; serving manifest and health only");
    }

    let state = AppState::new(Arc::clone(&runtime), &config);
    let app = routes(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any));

    let addr = config
        .local_base_url
        .as_deref()
        .and_then(|url| url.strip_prefix("http://").map(str::to_string))
        .unwrap_or_else(|| "127.0.0.1:8787".to_string());

    tracing::info!(%addr, "windlass host listening");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    axum::serve(listener, app).await.context("server error")?;

    Ok(())
}

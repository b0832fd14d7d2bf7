use anyhow::Result;
use axum::{extract::State, http::StatusCode, middleware, response::Json, routing::get, Router};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distributed_ratelimit::{
    config::{load_settings, Settings},
    limiter::RateLimiter,
    metrics::Metrics,
    middleware::{rate_limit, RateLimitState},
    redis::RedisStore,
    store::AtomicStore,
};

#[derive(Clone)]
struct AppState {
    store: Arc<dyn AtomicStore>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "distributed_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting distributed rate limiter");

    let config_path = std::env::var("CONFIG_PATH").ok();
    let settings = load_settings(config_path.as_deref())?;

    let store: Arc<dyn AtomicStore> =
        Arc::new(RedisStore::connect(settings.redis.clone().into()).await?);
    let metrics = Arc::new(Metrics::new()?);
    let state = AppState { store, metrics };

    let app = build_router(&settings, &state)?;
    let addr = settings.server.http_addr;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    let server = async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    };

    // Wait for shutdown signal
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

/// One limited route per configured entry, plus health and metrics
fn build_router(settings: &Settings, state: &AppState) -> Result<Router> {
    let mut router = Router::new().route("/", get(|| async { "Hello from the server" }));

    for route in &settings.routes {
        let options = route.to_options(settings.key_prefix.as_deref())?;
        let limiter = RateLimiter::new(options, state.store.clone())?;
        info!(
            path = %route.path,
            algorithm = %limiter.algorithm(),
            limit = route.limit,
            window = route.window,
            "Registering rate limited route"
        );

        let greeting = format!("Hello from the {}", route.algorithm.replace('-', " "));
        let limit_state = RateLimitState::new(Arc::new(limiter), state.metrics.clone());
        router = router.route(
            &route.path,
            get(move || async move { greeting })
                .layer(middleware::from_fn_with_state(limit_state, rate_limit)),
        );
    }

    Ok(router
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state.clone()))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.store.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(e) => {
            warn!("Health check failed: {}", e);
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    state
        .metrics
        .render()
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

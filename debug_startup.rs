use anyhow::Result;
use std::{sync::Arc, time::{Duration, Instant}};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use distributed_ratelimit::{
    algorithms::{Algorithm, RateLimitOptions},
    limiter::RateLimiter,
    redis::{RedisConfig, RedisStore},
    store::AtomicStore,
};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug_startup=info,distributed_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting store connectivity probe");
    let start_time = Instant::now();

    let store = connect_store().await?;
    probe_algorithms(store).await?;

    info!("All checks completed successfully in {:?}", start_time.elapsed());
    Ok(())
}

async fn connect_store() -> Result<Arc<dyn AtomicStore>> {
    let redis_url = std::env::var("REDIS_URL")
        .unwrap_or_else(|_| "redis://localhost:6379".to_string());
    info!("Using Redis URL: {}", redis_url);

    let redis_config = RedisConfig {
        url: redis_url,
        connection_timeout: Some(Duration::from_secs(5)),
        command_timeout: Some(Duration::from_secs(3)),
        ..Default::default()
    };

    let connection_start = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(10), RedisStore::connect(redis_config)).await;

    match result {
        Ok(Ok(store)) => {
            info!("Redis store connected in {:?}", connection_start.elapsed());
            Ok(Arc::new(store))
        }
        Ok(Err(e)) => {
            error!("Redis connection failed: {}", e);
            Err(e.into())
        }
        Err(_) => {
            error!("Redis connection timed out after 10 seconds");
            Err(anyhow::anyhow!("Redis connection timeout"))
        }
    }
}

/// Run one decision per algorithm against a throwaway identifier
async fn probe_algorithms(store: Arc<dyn AtomicStore>) -> Result<()> {
    let identifier = format!("debug-startup-{}", chrono::Utc::now().timestamp_millis());

    for algorithm in Algorithm::ALL {
        let limiter = RateLimiter::new(RateLimitOptions::new(algorithm, 10, 30), store.clone())?;
        let decision_start = Instant::now();
        match limiter.check_limit(&identifier).await {
            Ok(decision) => info!(
                "{}: allowed={} remaining={} used={} in {:?}",
                algorithm,
                decision.allowed,
                decision.remaining,
                decision.used_tokens,
                decision_start.elapsed()
            ),
            Err(e) => {
                error!("{} decision failed: {}", algorithm, e);
                return Err(e.into());
            }
        }
    }

    Ok(())
}

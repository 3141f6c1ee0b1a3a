//! Guarded service demo.
//!
//! Simulates a request handler that calls two downstream dependencies
//! through a shared `ServiceContext`:
//!
//! - `inventory` fails hard for a while, trips its breaker, then recovers
//! - `pricing` is healthy and cached, so repeated lookups skip the origin;
//!   it rejects discontinued SKUs, which is never retried and never trips
//!   its breaker
//!
//! Run with:
//!
//! ```bash
//! RUST_LOG=floodgate=debug cargo run -p guarded-service
//! LOG_FORMAT=json cargo run -p guarded-service -- config.json
//! ```

use floodgate::config::{CircuitBreakerConfig, RateLimitConfig};
use floodgate::prelude::*;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Errors returned by the simulated dependencies.
#[derive(Debug, thiserror::Error)]
enum DependencyError {
    #[error("connection reset by {0}")]
    ConnectionReset(&'static str),
    #[error("{0} returned 503")]
    Unavailable(&'static str),
    #[error("sku {0} is discontinued")]
    Discontinued(u32),
}

impl DependencyError {
    /// Transport failures and 5xx responses; never rejected input.
    fn is_retryable(&self) -> bool {
        matches!(self, Self::ConnectionReset(_) | Self::Unavailable(_))
    }
}

/// A dependency that is down for its first `outage_calls` invocations.
struct Inventory {
    calls: AtomicU32,
    outage_calls: u32,
}

impl Inventory {
    async fn stock_level(&self, sku: u32) -> Result<u32, DependencyError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(20)).await;
        if call < self.outage_calls {
            return Err(DependencyError::Unavailable("inventory"));
        }
        if call % 7 == 0 {
            return Err(DependencyError::ConnectionReset("inventory"));
        }
        Ok(sku * 3)
    }
}

async fn price(sku: u32) -> Result<u64, DependencyError> {
    tokio::time::sleep(Duration::from_millis(5)).await;
    if sku == 3 {
        return Err(DependencyError::Discontinued(sku));
    }
    Ok(u64::from(sku) * 100 + 99)
}

fn init_tracing() -> Result<(), Box<dyn std::error::Error>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
        .add_directive("floodgate=debug".parse()?);

    if std::env::var("LOG_FORMAT").is_ok_and(|format| format == "json") {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
    Ok(())
}

fn load_config() -> Result<ResilienceConfig, Box<dyn std::error::Error>> {
    if let Some(path) = std::env::args().nth(1) {
        info!(%path, "loading configuration");
        return Ok(ResilienceConfig::from_path(path)?);
    }

    let mut config = ResilienceConfig::default();
    config.rate_limit = RateLimitConfig::default().with_per_principal(TierLimit::new(600.0, 8.0));
    config.circuit_breaker = CircuitBreakerConfig::default()
        .failure_threshold(3)
        .success_threshold(1)
        .recovery_timeout(Duration::from_secs(1));
    Ok(config)
}

async fn handle(
    context: Arc<ServiceContext>,
    inventory: Arc<Inventory>,
    principal: String,
    sku: u32,
    cancel: CancellationToken,
) {
    let stock_request = GuardedRequest::new(principal.clone(), "inventory");
    let stock = context
        .execute_with_fallback(
            &stock_request,
            || inventory.stock_level(sku),
            DependencyError::is_retryable,
            || async { Ok(0) },
            &cancel,
        )
        .await;

    let price_request = GuardedRequest::new(principal.clone(), "pricing").cache_key(format!("price:{sku}"));
    let price = context
        .execute(&price_request, || price(sku), DependencyError::is_retryable, &cancel)
        .await;

    match (stock, price) {
        (Ok(stock), Ok(price)) => info!(
            %principal,
            sku,
            stock = stock.value,
            stock_degraded = stock.is_degraded(),
            price = price.value,
            price_source = ?price.source,
            "request served"
        ),
        (Err(err), _) | (_, Err(err)) => {
            warn!(%principal, sku, error = %err, overload = err.is_overload(), "request failed");
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing()?;

    let config = load_config()?;
    let context = Arc::new(ServiceContext::new(config, Arc::new(MemoryStore::new()))?);
    let inventory = Arc::new(Inventory {
        calls: AtomicU32::new(0),
        outage_calls: 4,
    });
    let cancel = CancellationToken::new();

    info!("starting simulated traffic");
    for wave in 0..3u32 {
        let mut tasks = Vec::new();
        for i in 0..12u32 {
            tasks.push(tokio::spawn(handle(
                context.clone(),
                inventory.clone(),
                format!("tenant-{}", i % 3),
                i % 4,
                cancel.child_token(),
            )));
        }
        for task in tasks {
            task.await?;
        }

        let snapshot = context.snapshot();
        info!(
            wave,
            shed = snapshot.shed(),
            open_circuits = ?snapshot.circuits_in(CircuitState::Open),
            "wave complete"
        );
        tokio::time::sleep(Duration::from_millis(1200)).await;
    }

    println!("{}", serde_json::to_string_pretty(&context.snapshot())?);
    println!("{}", serde_json::to_string_pretty(&context.health())?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_errors_retry_and_rejections_do_not() {
        assert!(DependencyError::Unavailable("inventory").is_retryable());
        assert!(DependencyError::ConnectionReset("inventory").is_retryable());
        assert!(!DependencyError::Discontinued(3).is_retryable());
    }

    #[tokio::test]
    async fn test_discontinued_sku_leaves_pricing_circuit_closed() {
        let mut config = ResilienceConfig::default();
        config.circuit_breaker = CircuitBreakerConfig::default().failure_threshold(3);
        let context = ServiceContext::local(config).unwrap();
        let request = GuardedRequest::new("tenant-0", "pricing");
        let cancel = CancellationToken::new();

        for _ in 0..5 {
            let err = context
                .execute(&request, || price(3), DependencyError::is_retryable, &cancel)
                .await
                .unwrap_err();
            assert!(!err.is_dependency_failure());
        }
        assert!(context.snapshot().circuits_in(CircuitState::Open).is_empty());
    }
}

// src/telemetry.rs
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::RwLock;

/// A single named source of health information a component can register —
/// e.g. "store", "gateway:BTC", "pool:ETH". Errors are caught per-source so
/// one unreachable dependency never poisons the whole report.
#[async_trait::async_trait]
pub trait HealthSource: Send + Sync {
    fn name(&self) -> &str;
    async fn check(&self) -> Result<(), String>;
}

#[derive(Debug, Clone)]
pub struct HealthReport {
    pub healthy: bool,
    pub sources: HashMap<String, Option<String>>,
}

/// Counters and timings the engine accumulates in-process. Not a metrics
/// exporter — just the aggregation point something like a Prometheus
/// registry would be wired onto (out of scope for this crate).
#[derive(Default)]
pub struct Telemetry {
    counters: RwLock<HashMap<&'static str, u64>>,
    timings: RwLock<HashMap<&'static str, Vec<Duration>>>,
    sources: RwLock<Vec<Arc<dyn HealthSource>>>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn incr(&self, name: &'static str) {
        *self.counters.write().await.entry(name).or_insert(0) += 1;
    }

    pub async fn record_timing(&self, name: &'static str, duration: Duration) {
        self.timings.write().await.entry(name).or_default().push(duration);
    }

    pub async fn counter(&self, name: &'static str) -> u64 {
        self.counters.read().await.get(name).copied().unwrap_or(0)
    }

    pub async fn register_source(&self, source: Arc<dyn HealthSource>) {
        self.sources.write().await.push(source);
    }

    /// Fans out to every registered `HealthSource` concurrently and waits
    /// for all of them; a source that errors is recorded as unhealthy
    /// without failing the others or the overall call.
    pub async fn health(&self) -> HealthReport {
        let sources = self.sources.read().await;
        let futures = sources.iter().map(|source| {
            let source = Arc::clone(source);
            async move {
                let name = source.name().to_string();
                let result = source.check().await;
                (name, result)
            }
        });
        let results = join_all(futures).await;

        let mut report = HealthReport { healthy: true, sources: HashMap::new() };
        for (name, result) in results {
            match result {
                Ok(()) => {
                    report.sources.insert(name, None);
                }
                Err(err) => {
                    report.healthy = false;
                    report.sources.insert(name, Some(err));
                }
            }
        }
        report
    }
}

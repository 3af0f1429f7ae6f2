//! Counter-style metric provider contract.
//!
//! The core only adds and increments named counters around payload ingress,
//! egress and failures. Backends implement [`MetricProvider`]; [`MemoryMetrics`]
//! keeps everything in process.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

/// Errors returned by metric providers.
#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("Unknown metric: {}", _0)]
    UnknownMetric(String),
}

/// Point-in-time view of a counter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metric {
    pub name: String,
    pub description: String,
    pub value: u64,
}

/// Destination for counters emitted by processors.
pub trait MetricProvider: std::fmt::Debug + Send + Sync + 'static {
    /// Declares a counter. Declaring an existing counter keeps its value.
    fn add_counter(&self, name: &str, description: &str);

    /// Adds `value` to a declared counter.
    fn increment(&self, name: &str, value: u64) -> Result<(), Error>;

    /// Reads a counter.
    fn get(&self, name: &str) -> Option<Metric>;
}

#[derive(Debug)]
struct Counter {
    description: String,
    value: AtomicU64,
}

/// Thread-safe in-memory metric provider.
#[derive(Debug, Clone, Default)]
pub struct MemoryMetrics {
    counters: Arc<DashMap<String, Counter>>,
}

impl MemoryMetrics {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MetricProvider for MemoryMetrics {
    fn add_counter(&self, name: &str, description: &str) {
        self.counters
            .entry(name.to_string())
            .or_insert_with(|| Counter {
                description: description.to_string(),
                value: AtomicU64::new(0),
            });
    }

    fn increment(&self, name: &str, value: u64) -> Result<(), Error> {
        let counter = self
            .counters
            .get(name)
            .ok_or_else(|| Error::UnknownMetric(name.to_string()))?;
        counter.value.fetch_add(value, Ordering::Relaxed);
        Ok(())
    }

    fn get(&self, name: &str) -> Option<Metric> {
        self.counters.get(name).map(|counter| Metric {
            name: name.to_string(),
            description: counter.description.clone(),
            value: counter.value.load(Ordering::Relaxed),
        })
    }
}

/// Counters a processor maintains under a common prefix.
#[derive(Debug, Clone)]
pub struct StageCounters {
    provider: Arc<dyn MetricProvider>,
    payloads_in: String,
    payloads_out: String,
    failures: String,
}

impl StageCounters {
    /// Declares `<prefix>.payloads_in`, `<prefix>.payloads_out` and `<prefix>.failures`.
    pub fn register(provider: Arc<dyn MetricProvider>, prefix: &str) -> Self {
        let counters = StageCounters {
            payloads_in: format!("{prefix}.payloads_in"),
            payloads_out: format!("{prefix}.payloads_out"),
            failures: format!("{prefix}.failures"),
            provider,
        };
        counters
            .provider
            .add_counter(&counters.payloads_in, "Payloads received by the processor");
        counters
            .provider
            .add_counter(&counters.payloads_out, "Payloads emitted by the processor");
        counters
            .provider
            .add_counter(&counters.failures, "Failures raised by the processor");
        counters
    }

    pub fn provider(&self) -> &Arc<dyn MetricProvider> {
        &self.provider
    }

    pub fn record_in(&self, count: u64) {
        self.bump(&self.payloads_in, count);
    }

    pub fn record_out(&self, count: u64) {
        self.bump(&self.payloads_out, count);
    }

    pub fn record_failure(&self) {
        self.bump(&self.failures, 1);
    }

    fn bump(&self, name: &str, count: u64) {
        if let Err(e) = self.provider.increment(name, count) {
            warn!("{}", e);
        }
    }
}

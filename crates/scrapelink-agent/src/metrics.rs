//! Agent counters keyed by (launch id, outcome label), plus the scrape
//! latency summary

use hdrhistogram::Histogram;
use std::collections::HashMap;
use std::sync::{Mutex, RwLock};
use std::time::Duration;

/// Outcome labels
pub mod labels {
    pub const SUCCESS: &str = "success";
    pub const FAILURE: &str = "failure";

    pub const NON_GZIPPED: &str = "non-gzipped";
    pub const GZIPPED: &str = "gzipped";
    pub const CHUNKED: &str = "chunked";

    pub const INVALID_PATH: &str = "invalid_path";
    pub const UNSUCCESSFUL: &str = "unsuccessful";
    pub const TIMEOUT: &str = "timeout";
}

/// Counter with a (launch id, label) key
#[derive(Debug)]
pub struct LabeledCounter {
    name: &'static str,
    values: RwLock<HashMap<(String, String), u64>>,
}

impl LabeledCounter {
    fn new(name: &'static str) -> Self {
        Self {
            name,
            values: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn inc(&self, launch_id: &str, label: &str) {
        let mut values = self.values.write().unwrap_or_else(|e| e.into_inner());
        *values
            .entry((launch_id.to_string(), label.to_string()))
            .or_insert(0) += 1;
    }

    pub fn get(&self, launch_id: &str, label: &str) -> u64 {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values
            .get(&(launch_id.to_string(), label.to_string()))
            .copied()
            .unwrap_or(0)
    }

    fn samples(&self) -> Vec<MetricSample> {
        let values = self.values.read().unwrap_or_else(|e| e.into_inner());
        values
            .iter()
            .map(|((launch_id, label), value)| MetricSample {
                name: self.name,
                launch_id: launch_id.clone(),
                label: label.clone(),
                value: *value,
            })
            .collect()
    }
}

/// Scrape latencies in milliseconds, from 1 ms to one hour
pub struct LatencySummary {
    name: &'static str,
    /// `None` only if hdrhistogram rejects the constant bounds
    histogram: Mutex<Option<Histogram<u64>>>,
}

impl std::fmt::Debug for LatencySummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LatencySummary")
            .field("name", &self.name)
            .field("count", &self.count())
            .finish()
    }
}

impl LatencySummary {
    const MAX_MS: u64 = 3_600_000;

    fn new(name: &'static str) -> Self {
        Self {
            name,
            histogram: Mutex::new(Histogram::new_with_bounds(1, Self::MAX_MS, 3).ok()),
        }
    }

    pub fn record(&self, latency: Duration) {
        let millis = (latency.as_millis() as u64).clamp(1, Self::MAX_MS);
        let mut histogram = self.histogram.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(histogram) = histogram.as_mut() {
            if let Err(e) = histogram.record(millis) {
                tracing::warn!("Failed to record scrape latency: {}", e);
            }
        }
    }

    pub fn count(&self) -> u64 {
        let histogram = self.histogram.lock().unwrap_or_else(|e| e.into_inner());
        histogram.as_ref().map_or(0, |h| h.len())
    }

    /// Latency at `quantile` in milliseconds, 0 when nothing was recorded
    pub fn quantile_ms(&self, quantile: f64) -> u64 {
        let histogram = self.histogram.lock().unwrap_or_else(|e| e.into_inner());
        match histogram.as_ref() {
            Some(h) if !h.is_empty() => h.value_at_quantile(quantile),
            _ => 0,
        }
    }

    fn samples(&self, launch_id: &str) -> Vec<MetricSample> {
        if self.count() == 0 {
            return Vec::new();
        }
        let sample = |label: &str, value: u64| MetricSample {
            name: self.name,
            launch_id: launch_id.to_string(),
            label: label.to_string(),
            value,
        };
        vec![
            sample("count", self.count()),
            sample("p50_ms", self.quantile_ms(0.50)),
            sample("p99_ms", self.quantile_ms(0.99)),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSample {
    pub name: &'static str,
    pub launch_id: String,
    pub label: String,
    pub value: u64,
}

/// Counters of one agent launch
#[derive(Debug)]
pub struct AgentMetrics {
    launch_id: String,
    pub connect_count: LabeledCounter,
    pub scrape_result_count: LabeledCounter,
    pub scrape_request_count: LabeledCounter,
    pub scrape_request_latency: LatencySummary,
}

impl Default for AgentMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentMetrics {
    /// Metrics for a fresh launch with a random launch id
    pub fn new() -> Self {
        Self::with_launch_id(uuid::Uuid::new_v4().to_string())
    }

    pub fn with_launch_id(launch_id: impl Into<String>) -> Self {
        Self {
            launch_id: launch_id.into(),
            connect_count: LabeledCounter::new("agent_connect_count"),
            scrape_result_count: LabeledCounter::new("agent_scrape_result_count"),
            scrape_request_count: LabeledCounter::new("agent_scrape_request_count"),
            scrape_request_latency: LatencySummary::new("agent_scrape_request_latency"),
        }
    }

    pub fn launch_id(&self) -> &str {
        &self.launch_id
    }

    pub fn record_connect(&self, label: &str) {
        self.connect_count.inc(&self.launch_id, label);
    }

    pub fn record_scrape_result(&self, label: &str) {
        self.scrape_result_count.inc(&self.launch_id, label);
    }

    pub fn record_scrape_request(&self, label: &str) {
        self.scrape_request_count.inc(&self.launch_id, label);
    }

    pub fn record_scrape_latency(&self, latency: Duration) {
        self.scrape_request_latency.record(latency);
    }

    /// All non-zero samples, sorted by name then label
    pub fn snapshot(&self) -> Vec<MetricSample> {
        let mut samples: Vec<_> = [
            &self.connect_count,
            &self.scrape_result_count,
            &self.scrape_request_count,
        ]
        .iter()
        .flat_map(|counter| counter.samples())
        .chain(self.scrape_request_latency.samples(&self.launch_id))
        .collect();
        samples.sort_by(|a, b| (a.name, &a.label).cmp(&(b.name, &b.label)));
        samples
    }
}

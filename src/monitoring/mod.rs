//! A lightweight metrics facade: counters and gauges for the handful of
//! numbers an operator actually needs dashboards for (batch size, signatures
//! gathered, replenishments this period). Not a full metrics pipeline —
//! values are logged as structured `tracing` fields so they flow through
//! whatever log shipper is already in place.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

use dashmap::DashMap;

#[derive(Default)]
pub struct Metrics {
    counters: DashMap<&'static str, AtomicU64>,
    gauges: DashMap<&'static str, AtomicI64>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, name: &'static str) {
        self.counters.entry(name).or_insert_with(|| AtomicU64::new(0)).fetch_add(1, Ordering::Relaxed);
    }

    pub fn incr_by(&self, name: &'static str, amount: u64) {
        self.counters.entry(name).or_insert_with(|| AtomicU64::new(0)).fetch_add(amount, Ordering::Relaxed);
    }

    pub fn set_gauge(&self, name: &'static str, value: i64) {
        self.gauges.entry(name).or_insert_with(|| AtomicI64::new(0)).store(value, Ordering::Relaxed);
    }

    pub fn counter(&self, name: &'static str) -> u64 {
        self.counters.get(name).map(|c| c.load(Ordering::Relaxed)).unwrap_or(0)
    }

    pub fn gauge(&self, name: &'static str) -> i64 {
        self.gauges.get(name).map(|g| g.load(Ordering::Relaxed)).unwrap_or(0)
    }

    /// Emit every current value as one structured log line, for a periodic
    /// "metrics snapshot" tick.
    pub fn log_snapshot(&self) {
        for entry in self.counters.iter() {
            tracing::info!(metric = *entry.key(), value = entry.value().load(Ordering::Relaxed), kind = "counter", "metrics snapshot");
        }
        for entry in self.gauges.iter() {
            tracing::info!(metric = *entry.key(), value = entry.value().load(Ordering::Relaxed), kind = "gauge", "metrics snapshot");
        }
    }
}

pub mod names {
    pub const BATCH_SIZE: &str = "batch_size";
    pub const SENDING_SIGNATURES_GATHERED: &str = "sending_signatures_gathered";
    pub const MINED_SIGNATURES_GATHERED: &str = "mined_signatures_gathered";
    pub const BITCOIN_SIGNATURES_GATHERED: &str = "bitcoin_signatures_gathered";
    pub const REPLENISHMENTS_THIS_PERIOD: &str = "replenishments_this_period";
    pub const ITERATIONS_COMPLETED: &str = "iterations_completed";
    pub const ITERATION_ERRORS: &str = "iteration_errors";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let metrics = Metrics::new();
        metrics.incr(names::ITERATIONS_COMPLETED);
        metrics.incr(names::ITERATIONS_COMPLETED);
        assert_eq!(metrics.counter(names::ITERATIONS_COMPLETED), 2);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = Metrics::new();
        metrics.set_gauge(names::BATCH_SIZE, 5);
        metrics.set_gauge(names::BATCH_SIZE, 8);
        assert_eq!(metrics.gauge(names::BATCH_SIZE), 8);
    }
}

//! Transparent metrics decorator that wraps any [`IndexBackend`] to record
//! call counts and latency, using the usual pattern of process-wide
//! gauges registered once via `once_cell::sync::Lazy`.

use async_trait::async_trait;
use kvindex_common::model::{BlockKey, PodEntry};
use kvindex_common::Result;
use once_cell::sync::Lazy;
use prometheus::{Histogram, HistogramVec, IntCounterVec};
use std::time::Instant;

use crate::IndexBackend;

static OPS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    prometheus::register_int_counter_vec!(
        "kvindex_backend_ops_total",
        "Block index backend operations by kind and outcome",
        &["op", "outcome"]
    )
    .expect("register kvindex_backend_ops_total")
});

static OP_LATENCY: Lazy<HistogramVec> = Lazy::new(|| {
    prometheus::register_histogram_vec!(
        "kvindex_backend_op_latency_seconds",
        "Block index backend operation latency",
        &["op"]
    )
    .expect("register kvindex_backend_op_latency_seconds")
});

/// Wraps any [`IndexBackend`], recording a counter and latency histogram
/// per call without altering behavior (`kvBlockIndexConfig.enableMetrics`).
pub struct InstrumentedBackend<B: IndexBackend> {
    inner: B,
}

impl<B: IndexBackend> InstrumentedBackend<B> {
    pub fn new(inner: B) -> Self {
        let _ = &*OPS_TOTAL;
        let _ = &*OP_LATENCY;
        Self { inner }
    }

    fn timer(op: &str) -> (Instant, Histogram) {
        (Instant::now(), OP_LATENCY.with_label_values(&[op]))
    }

    fn record<T>(op: &str, start: Instant, hist: &Histogram, result: &Result<T>) {
        hist.observe(start.elapsed().as_secs_f64());
        let outcome = if result.is_ok() { "ok" } else { "err" };
        OPS_TOTAL.with_label_values(&[op, outcome]).inc();
    }
}

#[async_trait]
impl<B: IndexBackend> IndexBackend for InstrumentedBackend<B> {
    async fn add(&self, keys: &[BlockKey], entries: &[PodEntry]) -> Result<()> {
        let (start, hist) = Self::timer("add");
        let result = self.inner.add(keys, entries).await;
        Self::record("add", start, &hist, &result);
        result
    }

    async fn evict(&self, key: &BlockKey, entries: &[PodEntry]) -> Result<()> {
        let (start, hist) = Self::timer("evict");
        let result = self.inner.evict(key, entries).await;
        Self::record("evict", start, &hist, &result);
        result
    }

    async fn lookup(
        &self,
        keys: &[BlockKey],
        allowed_pods: &[String],
    ) -> Result<Vec<(BlockKey, Vec<String>)>> {
        let (start, hist) = Self::timer("lookup");
        let result = self.inner.lookup(keys, allowed_pods).await;
        Self::record("lookup", start, &hist, &result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bounded_lru::BoundedLruBackend;

    #[tokio::test]
    async fn wraps_without_changing_behavior() {
        let backend = InstrumentedBackend::new(BoundedLruBackend::new(10, 10));
        let key = BlockKey::new("m", 1);
        let entry = PodEntry::new("p1", "gpu");
        backend.add(&[key.clone()], &[entry]).await.unwrap();
        let result = backend.lookup(&[key], &[]).await.unwrap();
        assert_eq!(result[0].1, vec!["p1".to_string()]);
    }
}

use crate::MetricsSink;

pub const EMBEDDING_CACHE_HIT: &str = "embedding_cache.hit";
pub const EMBEDDING_CACHE_MISS: &str = "embedding_cache.miss";
pub const RETRIEVAL_DEGRADED: &str = "rag.degraded";
pub const RERANK_UNSCORED: &str = "rerank.unscored";
pub const STAGE_LATENCY_PREFIX: &str = "rag.stage_ms";

/// Emits every observation as a `tracing` debug event under the `brain_metrics` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;
impl MetricsSink for TracingMetrics {
	fn increment(&self, name: &str, by: u64) {
		tracing::debug!(target: "brain_metrics", metric = name, by, "Counter incremented.");
	}

	fn observe_ms(&self, name: &str, ms: u64) {
		tracing::debug!(target: "brain_metrics", metric = name, ms, "Latency observed.");
	}
}

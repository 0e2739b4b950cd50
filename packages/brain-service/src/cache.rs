use std::{sync::Arc, time::Duration};

use moka::sync::Cache;
use serde_json::Value;
use unicode_normalization::UnicodeNormalization;

use crate::{
	Error, MetricsSink, Result,
	metrics::{EMBEDDING_CACHE_HIT, EMBEDDING_CACHE_MISS},
	model::EmbeddingVector,
};

const EMBEDDING_CACHE_SCHEMA_VERSION: i32 = 1;

/// Content-addressed embedding cache shared by every query a service handles.
///
/// The cache never calls the provider. Callers compute embeddings on a miss and `put` them back.
pub struct EmbeddingCache {
	entries: Option<Cache<String, Arc<EmbeddingVector>>>,
	case_fold: bool,
	metrics: Arc<dyn MetricsSink>,
}
impl EmbeddingCache {
	pub fn new(cfg: &brain_config::EmbeddingCache, metrics: Arc<dyn MetricsSink>) -> Self {
		let entries = cfg.enabled.then(|| {
			Cache::builder()
				.max_capacity(cfg.capacity)
				.time_to_idle(Duration::from_secs(cfg.sliding_expiration_secs))
				.build()
		});

		Self { entries, case_fold: cfg.case_fold, metrics }
	}

	pub fn is_enabled(&self) -> bool {
		self.entries.is_some()
	}

	pub fn get(&self, text: &str, provider: &str, model: &str) -> Option<Arc<EmbeddingVector>> {
		let found = self.lookup(text, provider, model);
		let metric = if found.is_some() { EMBEDDING_CACHE_HIT } else { EMBEDDING_CACHE_MISS };

		self.metrics.increment(metric, 1);

		found
	}

	pub fn put(&self, text: &str, provider: &str, model: &str, vector: EmbeddingVector) {
		let Some(entries) = &self.entries else {
			return;
		};

		if vector.provider() != provider || vector.model() != model {
			tracing::warn!(
				provider,
				model,
				vector_provider = vector.provider(),
				vector_model = vector.model(),
				"Refusing to cache an embedding produced by a different model."
			);

			return;
		}

		match cache_key(text, provider, model, self.case_fold) {
			Ok(key) => entries.insert(key, Arc::new(vector)),
			Err(err) => {
				tracing::warn!(error = %err, "Embedding cache key build failed.");
			},
		}
	}

	pub fn entry_count(&self) -> u64 {
		self.entries.as_ref().map(|entries| entries.entry_count()).unwrap_or(0)
	}

	/// Applies pending inserts and evictions so counts are exact.
	pub fn run_pending_tasks(&self) {
		if let Some(entries) = &self.entries {
			entries.run_pending_tasks();
		}
	}

	fn lookup(&self, text: &str, provider: &str, model: &str) -> Option<Arc<EmbeddingVector>> {
		let entries = self.entries.as_ref()?;
		let key = match cache_key(text, provider, model, self.case_fold) {
			Ok(key) => key,
			Err(err) => {
				tracing::warn!(error = %err, "Embedding cache key build failed.");

				return None;
			},
		};
		let vector = entries.get(&key)?;

		if vector.provider() != provider || vector.model() != model || vector.dimensions() == 0 {
			tracing::warn!(
				cache_key_prefix = cache_key_prefix(&key),
				"Embedding cache entry does not match its key; invalidating."
			);
			entries.invalidate(&key);

			return None;
		}

		tracing::debug!(cache_key_prefix = cache_key_prefix(&key), "Embedding cache hit.");

		Some(vector)
	}
}

/// NFKC, trimmed, whitespace runs collapsed, and lowercased when `case_fold` is set.
pub fn normalize_text(text: &str, case_fold: bool) -> String {
	let composed: String = text.nfkc().collect();
	let collapsed = composed.split_whitespace().collect::<Vec<_>>().join(" ");

	if case_fold { collapsed.to_lowercase() } else { collapsed }
}

pub fn cache_key(text: &str, provider: &str, model: &str, case_fold: bool) -> Result<String> {
	let payload = serde_json::json!({
		"kind": "embedding",
		"schema_version": EMBEDDING_CACHE_SCHEMA_VERSION,
		"text": normalize_text(text, case_fold),
		"provider": provider,
		"model": model,
	});

	hash_cache_key(&payload)
}

pub fn hash_cache_key(payload: &Value) -> Result<String> {
	let raw = serde_json::to_vec(payload).map_err(|err| Error::Storage {
		message: format!("Failed to encode cache key payload: {err}"),
	})?;

	Ok(blake3::hash(&raw).to_hex().to_string())
}

pub fn cache_key_prefix(key: &str) -> &str {
	let len = key.len().min(12);

	&key[..len]
}

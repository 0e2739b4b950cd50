mod error;
mod types;

pub use error::{Error, Result};
pub use types::{
	Analytics, Config, EmbeddingCache, EmbeddingProviderConfig, EmbeddingVendor, Limits,
	LlmProviderConfig, LlmVendor, Postgres, Providers, Qdrant, Rag, Rerank, Service, Storage,
	Timeouts,
};

use std::{cmp::Ordering, fs, path::Path};

pub const MAX_MULTI_QUERY_COUNT: u32 = 10;
pub const MAX_RERANK_SCORE: f32 = 10.0;

pub fn load(path: &Path) -> Result<Config> {
	let raw = fs::read_to_string(path)
		.map_err(|err| Error::ReadConfig { path: path.to_path_buf(), source: err })?;
	let mut cfg: Config = toml::from_str(&raw)
		.map_err(|err| Error::ParseConfig { path: path.to_path_buf(), source: err })?;

	normalize(&mut cfg);

	validate(&cfg)?;

	Ok(cfg)
}

pub fn validate(cfg: &Config) -> Result<()> {
	if cfg.storage.postgres.dsn.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.postgres.dsn must be non-empty.".to_string(),
		});
	}
	if cfg.storage.postgres.pool_max_conns == 0 {
		return Err(Error::Validation {
			message: "storage.postgres.pool_max_conns must be greater than zero.".to_string(),
		});
	}
	if cfg.storage.qdrant.collection.trim().is_empty() {
		return Err(Error::Validation {
			message: "storage.qdrant.collection must be non-empty.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions == 0 {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must be greater than zero.".to_string(),
		});
	}
	if cfg.providers.embedding.dimensions != cfg.storage.qdrant.vector_dim {
		return Err(Error::Validation {
			message: "providers.embedding.dimensions must match storage.qdrant.vector_dim."
				.to_string(),
		});
	}

	for (label, model, timeout_ms) in [
		("embedding", &cfg.providers.embedding.model, cfg.providers.embedding.timeout_ms),
		("llm", &cfg.providers.llm.model, cfg.providers.llm.timeout_ms),
	] {
		if model.trim().is_empty() {
			return Err(Error::Validation {
				message: format!("providers.{label}.model must be non-empty."),
			});
		}
		if timeout_ms == 0 {
			return Err(Error::Validation {
				message: format!("providers.{label}.timeout_ms must be greater than zero."),
			});
		}
	}

	if !cfg.providers.llm.temperature.is_finite() || cfg.providers.llm.temperature < 0.0 {
		return Err(Error::Validation {
			message: "providers.llm.temperature must be a finite number, zero or greater."
				.to_string(),
		});
	}
	if cfg.cache.enabled && cfg.cache.capacity == 0 {
		return Err(Error::Validation {
			message: "cache.capacity must be greater than zero when the cache is enabled."
				.to_string(),
		});
	}
	if cfg.cache.enabled && cfg.cache.sliding_expiration_secs == 0 {
		return Err(Error::Validation {
			message: "cache.sliding_expiration_secs must be greater than zero.".to_string(),
		});
	}

	validate_rag(&cfg.rag).map_err(|err| match err {
		Error::Validation { message } => Error::Validation { message: format!("rag.{message}") },
		other => other,
	})?;

	if cfg.rerank.max_concurrency == 0 {
		return Err(Error::Validation {
			message: "rerank.max_concurrency must be greater than zero.".to_string(),
		});
	}

	for (label, value) in [
		("embedding_ms", cfg.timeouts.embedding_ms),
		("vector_search_ms", cfg.timeouts.vector_search_ms),
		("lexical_search_ms", cfg.timeouts.lexical_search_ms),
		("expansion_ms", cfg.timeouts.expansion_ms),
		("rerank_ms", cfg.timeouts.rerank_ms),
	] {
		if value == 0 {
			return Err(Error::Validation {
				message: format!("timeouts.{label} must be greater than zero."),
			});
		}
	}

	if cfg.analytics.score_bands.len() < 2 {
		return Err(Error::Validation {
			message: "analytics.score_bands must contain at least two edges.".to_string(),
		});
	}
	if cfg
		.analytics
		.score_bands
		.windows(2)
		.any(|pair| pair[0].partial_cmp(&pair[1]) != Some(Ordering::Less))
	{
		return Err(Error::Validation {
			message: "analytics.score_bands must be strictly increasing.".to_string(),
		});
	}
	if !(0.0..=1.0).contains(&cfg.analytics.target_positive_rate) {
		return Err(Error::Validation {
			message: "analytics.target_positive_rate must be in the range 0.0-1.0.".to_string(),
		});
	}
	if cfg.limits.max_query_chars == 0 {
		return Err(Error::Validation {
			message: "limits.max_query_chars must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

/// Validates a retrieval options table. Messages are relative to the table so callers can prefix
/// them with wherever the options came from.
pub fn validate_rag(rag: &Rag) -> Result<()> {
	if rag.top_k == 0 {
		return Err(Error::Validation { message: "top_k must be greater than zero.".to_string() });
	}
	if rag.initial_retrieval_count == 0 {
		return Err(Error::Validation {
			message: "initial_retrieval_count must be greater than zero.".to_string(),
		});
	}
	if !rag.similarity_threshold.is_finite() || !(0.0..=1.0).contains(&rag.similarity_threshold) {
		return Err(Error::Validation {
			message: "similarity_threshold must be in the range 0.0-1.0.".to_string(),
		});
	}
	if !rag.min_rerank_score.is_finite()
		|| !(0.0..=MAX_RERANK_SCORE).contains(&rag.min_rerank_score)
	{
		return Err(Error::Validation {
			message: "min_rerank_score must be in the range 0.0-10.0.".to_string(),
		});
	}

	for (label, weight) in [("vector_weight", rag.vector_weight), ("bm25_weight", rag.bm25_weight)]
	{
		if !weight.is_finite() {
			return Err(Error::Validation { message: format!("{label} must be a finite number.") });
		}
		if weight < 0.0 {
			return Err(Error::Validation { message: format!("{label} must be zero or greater.") });
		}
	}

	if rag.vector_weight + rag.bm25_weight <= 0.0 {
		return Err(Error::Validation {
			message: "vector_weight and bm25_weight must not both be zero.".to_string(),
		});
	}
	if rag.multi_query_count > MAX_MULTI_QUERY_COUNT {
		return Err(Error::Validation {
			message: format!("multi_query_count must be {MAX_MULTI_QUERY_COUNT} or less."),
		});
	}
	if rag.enable_multi_query && rag.multi_query_count == 0 {
		return Err(Error::Validation {
			message: "multi_query_count must be greater than zero when multi-query is enabled."
				.to_string(),
		});
	}
	if rag.max_context_length == 0 {
		return Err(Error::Validation {
			message: "max_context_length must be greater than zero.".to_string(),
		});
	}

	Ok(())
}

fn normalize(cfg: &mut Config) {
	for key in [&mut cfg.providers.embedding.api_key, &mut cfg.providers.llm.api_key] {
		if key.as_deref().map(|value| value.trim().is_empty()).unwrap_or(false) {
			*key = None;
		}
	}
	for path in [&mut cfg.providers.embedding.path, &mut cfg.providers.llm.path] {
		if path.as_deref().map(|value| value.trim().is_empty()).unwrap_or(false) {
			*path = None;
		}
	}

	cfg.providers.embedding.api_base =
		cfg.providers.embedding.api_base.trim_end_matches('/').to_string();
	cfg.providers.llm.api_base = cfg.providers.llm.api_base.trim_end_matches('/').to_string();
}

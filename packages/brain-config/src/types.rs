use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Deserialize)]
pub struct Config {
	pub service: Service,
	pub storage: Storage,
	pub providers: Providers,
	#[serde(default)]
	pub cache: EmbeddingCache,
	#[serde(default)]
	pub rag: Rag,
	#[serde(default)]
	pub rerank: Rerank,
	#[serde(default)]
	pub timeouts: Timeouts,
	#[serde(default)]
	pub analytics: Analytics,
	#[serde(default)]
	pub limits: Limits,
}

#[derive(Debug, Deserialize)]
pub struct Service {
	pub log_level: String,
}

#[derive(Debug, Deserialize)]
pub struct Storage {
	pub postgres: Postgres,
	pub qdrant: Qdrant,
}

#[derive(Debug, Deserialize)]
pub struct Postgres {
	pub dsn: String,
	pub pool_max_conns: u32,
}

#[derive(Debug, Deserialize)]
pub struct Qdrant {
	pub url: String,
	pub collection: String,
	pub vector_dim: u32,
	/// Disables the BM25 leg when the collection was built without a sparse `bm25` vector.
	#[serde(default = "default_true")]
	pub lexical_enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct Providers {
	pub embedding: EmbeddingProviderConfig,
	pub llm: LlmProviderConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EmbeddingVendor {
	#[serde(rename = "openai")]
	OpenAi,
	Gemini,
	Ollama,
}
impl EmbeddingVendor {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::OpenAi => "openai",
			Self::Gemini => "gemini",
			Self::Ollama => "ollama",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmVendor {
	#[serde(rename = "openai")]
	OpenAi,
	Anthropic,
	Gemini,
	Ollama,
}
impl LlmVendor {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::OpenAi => "openai",
			Self::Anthropic => "anthropic",
			Self::Gemini => "gemini",
			Self::Ollama => "ollama",
		}
	}
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingProviderConfig {
	pub vendor: EmbeddingVendor,
	pub api_base: String,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	pub model: String,
	pub dimensions: u32,
	pub timeout_ms: u64,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_retry_backoff_ms")]
	pub retry_backoff_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmProviderConfig {
	pub vendor: LlmVendor,
	pub api_base: String,
	#[serde(default)]
	pub api_key: Option<String>,
	#[serde(default)]
	pub path: Option<String>,
	pub model: String,
	pub temperature: f32,
	#[serde(default = "default_max_output_tokens")]
	pub max_output_tokens: u32,
	pub timeout_ms: u64,
	#[serde(default = "default_max_retries")]
	pub max_retries: u32,
	#[serde(default = "default_retry_backoff_ms")]
	pub retry_backoff_ms: u64,
	#[serde(default)]
	pub default_headers: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EmbeddingCache {
	pub enabled: bool,
	pub capacity: u64,
	pub sliding_expiration_secs: u64,
	pub case_fold: bool,
}
impl Default for EmbeddingCache {
	fn default() -> Self {
		Self { enabled: true, capacity: 10_000, sliding_expiration_secs: 1_800, case_fold: true }
	}
}

/// Per-query retrieval options. The `[rag]` table supplies the defaults, and callers may pass a
/// full replacement with each request.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct Rag {
	pub top_k: u32,
	pub similarity_threshold: f32,
	pub initial_retrieval_count: u32,
	pub min_rerank_score: f32,
	pub vector_weight: f32,
	pub bm25_weight: f32,
	pub multi_query_count: u32,
	pub max_context_length: u32,
	pub enable_hyde: bool,
	pub enable_multi_query: bool,
	pub enable_hybrid: bool,
	pub enable_reranking: bool,
}
impl Default for Rag {
	fn default() -> Self {
		Self {
			top_k: 5,
			similarity_threshold: 0.3,
			initial_retrieval_count: 20,
			min_rerank_score: 3.0,
			vector_weight: 0.7,
			bm25_weight: 0.3,
			multi_query_count: 3,
			max_context_length: 4_000,
			enable_hyde: false,
			enable_multi_query: false,
			enable_hybrid: true,
			enable_reranking: false,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Rerank {
	pub max_concurrency: u32,
	pub max_passage_chars: u32,
}
impl Default for Rerank {
	fn default() -> Self {
		Self { max_concurrency: 4, max_passage_chars: 2_000 }
	}
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Timeouts {
	pub embedding_ms: u64,
	pub vector_search_ms: u64,
	pub lexical_search_ms: u64,
	pub expansion_ms: u64,
	pub rerank_ms: u64,
}
impl Default for Timeouts {
	fn default() -> Self {
		Self {
			embedding_ms: 10_000,
			vector_search_ms: 5_000,
			lexical_search_ms: 5_000,
			expansion_ms: 15_000,
			rerank_ms: 15_000,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Analytics {
	pub enabled: bool,
	pub score_bands: Vec<f32>,
	pub target_positive_rate: f32,
}
impl Default for Analytics {
	fn default() -> Self {
		Self {
			enabled: true,
			score_bands: vec![0.0, 0.3, 0.5, 0.7, 0.85, 1.0],
			target_positive_rate: 0.6,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct Limits {
	pub max_query_chars: u32,
	pub max_feedback_comment_chars: u32,
}
impl Default for Limits {
	fn default() -> Self {
		Self { max_query_chars: 4_000, max_feedback_comment_chars: 2_000 }
	}
}

fn default_true() -> bool {
	true
}

fn default_max_retries() -> u32 {
	2
}

fn default_retry_backoff_ms() -> u64 {
	250
}

fn default_max_output_tokens() -> u32 {
	512
}

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{Error, Result};

/// Per-query retrieval options; the configured `[rag]` table supplies the defaults.
pub type RagOptions = brain_config::Rag;

#[derive(Debug, Clone)]
pub struct Query {
	pub text: String,
	pub user_id: Uuid,
	pub conversation_id: Option<Uuid>,
	pub received_at: OffsetDateTime,
}

/// A dense vector tagged with the provider and model that produced it.
///
/// Vectors from different embedding spaces are never comparable; searches that would mix them
/// fail through [`EmbeddingVector::ensure_same_space`] instead of returning scores.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
	provider: String,
	model: String,
	values: Vec<f32>,
}
impl EmbeddingVector {
	pub fn new(
		provider: impl Into<String>,
		model: impl Into<String>,
		values: Vec<f32>,
	) -> Result<Self> {
		if values.is_empty() {
			return Err(Error::EmbeddingMismatch {
				message: "Embedding vectors must not be empty.".to_string(),
			});
		}
		if values.iter().any(|value| !value.is_finite()) {
			return Err(Error::EmbeddingMismatch {
				message: "Embedding vectors must contain only finite values.".to_string(),
			});
		}

		Ok(Self { provider: provider.into(), model: model.into(), values })
	}

	pub fn provider(&self) -> &str {
		&self.provider
	}

	pub fn model(&self) -> &str {
		&self.model
	}

	pub fn dimensions(&self) -> usize {
		self.values.len()
	}

	pub fn values(&self) -> &[f32] {
		&self.values
	}

	pub fn same_space(&self, other: &Self) -> bool {
		self.provider == other.provider
			&& self.model == other.model
			&& self.dimensions() == other.dimensions()
	}

	pub fn ensure_same_space(&self, other: &Self) -> Result<()> {
		if self.same_space(other) {
			return Ok(());
		}

		Err(Error::EmbeddingMismatch {
			message: format!(
				"Cannot compare {}/{} ({} dims) with {}/{} ({} dims).",
				self.provider,
				self.model,
				self.dimensions(),
				other.provider,
				other.model,
				other.dimensions()
			),
		})
	}
}

/// A chunk returned by a vector or lexical index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
	pub note_id: Uuid,
	pub chunk_index: i32,
	pub text: String,
	pub title: String,
	pub tags: Vec<String>,
	pub updated_at: Option<OffsetDateTime>,
	pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct Candidate {
	pub note_id: Uuid,
	pub chunk_index: i32,
	pub text: String,
	pub title: String,
	pub tags: Vec<String>,
	#[serde(with = "time::serde::rfc3339::option")]
	pub updated_at: Option<OffsetDateTime>,
	pub vector_score: Option<f32>,
	pub lexical_score: Option<f32>,
	pub fused_score: f32,
	pub rerank_score: Option<f32>,
	pub rerank_reasoning: Option<String>,
	/// Set when reranking ran but this candidate could not be judged.
	pub unscored: bool,
}
impl Candidate {
	pub fn from_hit(hit: IndexHit) -> Self {
		Self {
			note_id: hit.note_id,
			chunk_index: hit.chunk_index,
			text: hit.text,
			title: hit.title,
			tags: hit.tags,
			updated_at: hit.updated_at,
			vector_score: None,
			lexical_score: None,
			fused_score: 0.0,
			rerank_score: None,
			rerank_reasoning: None,
			unscored: false,
		}
	}

	pub fn key(&self) -> (Uuid, i32) {
		(self.note_id, self.chunk_index)
	}

	/// The score the final ordering uses. Unscored candidates are lifted onto the 0-10 rerank
	/// scale so they sort alongside judged ones.
	pub fn relevance(&self) -> f32 {
		match self.rerank_score {
			Some(score) => score,
			None if self.unscored => self.fused_score * brain_config::MAX_RERANK_SCORE,
			None => self.fused_score,
		}
	}
}

/// Orders by fused score, then the most recently updated note, then note id and chunk index.
pub(crate) fn cmp_fused(a: &Candidate, b: &Candidate) -> Ordering {
	b.fused_score
		.total_cmp(&a.fused_score)
		.then_with(|| cmp_recency(a, b))
		.then_with(|| a.note_id.cmp(&b.note_id))
		.then_with(|| a.chunk_index.cmp(&b.chunk_index))
}

pub(crate) fn cmp_relevance(a: &Candidate, b: &Candidate) -> Ordering {
	b.relevance().total_cmp(&a.relevance()).then_with(|| cmp_fused(a, b))
}

fn cmp_recency(a: &Candidate, b: &Candidate) -> Ordering {
	match (a.updated_at, b.updated_at) {
		(Some(left), Some(right)) => right.cmp(&left),
		(Some(_), None) => Ordering::Less,
		(None, Some(_)) => Ordering::Greater,
		(None, None) => Ordering::Equal,
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureFlags {
	pub hybrid: bool,
	pub hyde: bool,
	pub multi_query: bool,
	pub rerank: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Degradation {
	EmbeddingFailed,
	VectorSearchFailed,
	/// Some, but not all, of the query-variant vector searches failed.
	VectorSearchPartial,
	LexicalSearchFailed,
	HydeFailed,
	MultiQueryFailed,
	RerankUnscored,
	UserLookupFailed,
}
impl Degradation {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::EmbeddingFailed => "embedding_failed",
			Self::VectorSearchFailed => "vector_search_failed",
			Self::VectorSearchPartial => "vector_search_partial",
			Self::LexicalSearchFailed => "lexical_search_failed",
			Self::HydeFailed => "hyde_failed",
			Self::MultiQueryFailed => "multi_query_failed",
			Self::RerankUnscored => "rerank_unscored",
			Self::UserLookupFailed => "user_lookup_failed",
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
	Embedding,
	Expansion,
	Retrieval,
	Reranking,
	Finalize,
}
impl Stage {
	pub fn as_str(self) -> &'static str {
		match self {
			Self::Embedding => "embedding",
			Self::Expansion => "expansion",
			Self::Retrieval => "retrieval",
			Self::Reranking => "reranking",
			Self::Finalize => "finalize",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Citation {
	pub number: u32,
	pub note_id: Uuid,
	pub chunk_index: i32,
	pub title: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RagContext {
	/// Id of the query log for this run. The log is written in the background, so it may land
	/// shortly after the context is returned; `submit_feedback` waits for it.
	pub log_id: Uuid,
	pub query: String,
	pub candidates: Vec<Candidate>,
	/// Passages rendered as numbered blocks ready to be placed in a prompt.
	pub rendered: String,
	pub citations: Vec<Citation>,
	pub total_tokens: u32,
	pub features: FeatureFlags,
	pub degradations: Vec<Degradation>,
}
impl RagContext {
	pub fn is_empty(&self) -> bool {
		self.candidates.is_empty()
	}

	pub fn is_degraded(&self) -> bool {
		!self.degradations.is_empty()
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageTimings {
	pub embedding_ms: u64,
	pub expansion_ms: u64,
	pub retrieval_ms: u64,
	pub rerank_ms: u64,
	pub total_ms: u64,
}
impl StageTimings {
	pub fn record(&mut self, stage: Stage, elapsed_ms: u64) {
		match stage {
			Stage::Embedding => self.embedding_ms += elapsed_ms,
			Stage::Expansion => self.expansion_ms += elapsed_ms,
			Stage::Retrieval => self.retrieval_ms += elapsed_ms,
			Stage::Reranking => self.rerank_ms += elapsed_ms,
			Stage::Finalize => {},
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ScoreStats {
	pub top_cosine: Option<f32>,
	pub avg_cosine: Option<f32>,
	pub top_rerank: Option<f32>,
	pub avg_rerank: Option<f32>,
}
impl ScoreStats {
	pub fn from_scores(cosine: &[f32], rerank: &[f32]) -> Self {
		let (top_cosine, avg_cosine) = top_and_mean(cosine);
		let (top_rerank, avg_rerank) = top_and_mean(rerank);

		Self { top_cosine, avg_cosine, top_rerank, avg_rerank }
	}
}

fn top_and_mean(scores: &[f32]) -> (Option<f32>, Option<f32>) {
	if scores.is_empty() {
		return (None, None);
	}

	let top = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
	let mean = scores.iter().sum::<f32>() / scores.len() as f32;

	(Some(top), Some(mean))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeedbackCategory {
	Irrelevant,
	Incomplete,
	Outdated,
	WrongSource,
	Helpful,
	Other,
}
impl FeedbackCategory {
	/// Unrecognized labels are kept as [`FeedbackCategory::Other`].
	pub fn parse(raw: &str) -> Self {
		match raw.trim().to_ascii_lowercase().replace(['-', ' '], "_").as_str() {
			"irrelevant" => Self::Irrelevant,
			"incomplete" => Self::Incomplete,
			"outdated" => Self::Outdated,
			"wrong_source" => Self::WrongSource,
			"helpful" => Self::Helpful,
			_ => Self::Other,
		}
	}

	pub fn as_str(self) -> &'static str {
		match self {
			Self::Irrelevant => "irrelevant",
			Self::Incomplete => "incomplete",
			Self::Outdated => "outdated",
			Self::WrongSource => "wrong_source",
			Self::Helpful => "helpful",
			Self::Other => "other",
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feedback {
	pub positive: bool,
	pub category: Option<FeedbackCategory>,
	pub comment: Option<String>,
	#[serde(with = "time::serde::rfc3339")]
	pub submitted_at: OffsetDateTime,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryLog {
	pub log_id: Uuid,
	pub user_id: Uuid,
	pub conversation_id: Option<Uuid>,
	pub query: String,
	#[serde(with = "time::serde::rfc3339")]
	pub created_at: OffsetDateTime,
	pub timings: StageTimings,
	pub retrieved_count: u32,
	pub final_count: u32,
	pub unscored_count: u32,
	pub scores: ScoreStats,
	pub embedding_cache_hit: bool,
	pub features: FeatureFlags,
	pub degradations: Vec<Degradation>,
	pub feedback: Option<Feedback>,
}

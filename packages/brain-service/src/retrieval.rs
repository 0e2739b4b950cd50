use std::{collections::HashMap, time::Duration};

use futures_util::future;
use uuid::Uuid;

use crate::{
	Error, LexicalIndex, Result, VectorIndex,
	cancel::{self, CancellationToken},
	model::{self, Candidate, Degradation, EmbeddingVector, IndexHit, RagOptions},
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
	pub vector: f32,
	pub lexical: f32,
}
impl FusionWeights {
	/// Resolves the weights for the legs that actually produced results. A surviving single leg is
	/// renormalized to 1 so its scores stay comparable with the similarity threshold.
	pub fn resolve(options: &RagOptions, vector_ok: bool, lexical_ok: bool) -> Self {
		match (vector_ok, lexical_ok && options.enable_hybrid) {
			(true, true) => Self { vector: options.vector_weight, lexical: options.bm25_weight },
			(true, false) => Self { vector: 1.0, lexical: 0.0 },
			(false, true) => Self { vector: 0.0, lexical: 1.0 },
			(false, false) => Self { vector: 0.0, lexical: 0.0 },
		}
	}
}

pub struct RetrievalPlan<'a> {
	pub vectors: &'a [EmbeddingVector],
	pub query_text: &'a str,
	pub user_id: Uuid,
	pub options: &'a RagOptions,
	pub vector_timeout: Duration,
	pub lexical_timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RetrievalOutcome {
	pub candidates: Vec<Candidate>,
	pub degradations: Vec<Degradation>,
	pub lexical_issued: bool,
}

/// Runs one vector search per query embedding plus one lexical search, all concurrently, and
/// fuses the results. Index failures degrade the outcome; only cancellation and query vectors
/// from mixed embedding spaces are returned as errors.
pub async fn retrieve(
	vector_index: &dyn VectorIndex,
	lexical_index: Option<&dyn LexicalIndex>,
	plan: RetrievalPlan<'_>,
	cancel: &CancellationToken,
) -> Result<RetrievalOutcome> {
	if let Some((first, rest)) = plan.vectors.split_first() {
		for vector in rest {
			first.ensure_same_space(vector)?;
		}
	}

	let options = plan.options;
	let limit = options.initial_retrieval_count;
	let lexical_index = lexical_index.filter(|_| options.enable_hybrid);
	let vector_calls = plan.vectors.iter().map(|vector| {
		cancel::guard(
			cancel,
			"vector_search",
			plan.vector_timeout,
			vector_index.search(vector, plan.user_id, limit, options.similarity_threshold),
		)
	});
	let lexical_call = async {
		match lexical_index {
			Some(index) => Some(
				cancel::guard(
					cancel,
					"lexical_search",
					plan.lexical_timeout,
					index.search(plan.query_text, plan.user_id, limit),
				)
				.await,
			),
			None => None,
		}
	};
	let (vector_results, lexical_result) =
		tokio::join!(future::join_all(vector_calls), lexical_call);
	let mut outcome =
		RetrievalOutcome { lexical_issued: lexical_result.is_some(), ..Default::default() };
	let mut vector_hits = Vec::new();
	let mut vector_failures = 0_usize;

	for result in vector_results {
		match result {
			Ok(hits) => vector_hits.extend(hits),
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(err) => {
				tracing::warn!(error = %err, "Vector search failed.");

				vector_failures += 1;
			},
		}
	}

	let vector_ok = !plan.vectors.is_empty() && vector_failures < plan.vectors.len();

	if vector_failures > 0 {
		outcome.degradations.push(if vector_ok {
			Degradation::VectorSearchPartial
		} else {
			Degradation::VectorSearchFailed
		});
	}

	let lexical_hits = match lexical_result {
		Some(Ok(hits)) => Some(hits),
		Some(Err(Error::Cancelled)) => return Err(Error::Cancelled),
		Some(Err(err)) => {
			tracing::warn!(error = %err, "Lexical search failed.");
			outcome.degradations.push(Degradation::LexicalSearchFailed);

			None
		},
		None => None,
	};
	let weights = FusionWeights::resolve(options, vector_ok, lexical_hits.is_some());

	outcome.candidates = fuse(
		vector_hits,
		lexical_hits.unwrap_or_default(),
		weights,
		options.similarity_threshold,
		limit as usize,
	);

	tracing::debug!(
		vector_searches = plan.vectors.len(),
		vector_failures,
		lexical = outcome.lexical_issued,
		vector_weight = weights.vector,
		lexical_weight = weights.lexical,
		candidates = outcome.candidates.len(),
		"Hybrid retrieval completed."
	);

	Ok(outcome)
}

/// Merges vector and lexical hits by `(note_id, chunk_index)`, scores them, applies the
/// threshold, and returns the best `limit` candidates.
pub fn fuse(
	vector_hits: Vec<IndexHit>,
	lexical_hits: Vec<IndexHit>,
	weights: FusionWeights,
	threshold: f32,
	limit: usize,
) -> Vec<Candidate> {
	let lexical_scale = lexical_scale(&lexical_hits);
	let mut merged: HashMap<(Uuid, i32), Candidate> = HashMap::new();

	for hit in vector_hits {
		let score = hit.score.clamp(0.0, 1.0);
		let candidate = merged
			.entry((hit.note_id, hit.chunk_index))
			.or_insert_with(|| Candidate::from_hit(hit));

		candidate.vector_score = Some(candidate.vector_score.map_or(score, |prev| prev.max(score)));
	}
	for hit in lexical_hits {
		let score = (hit.score.max(0.0) / lexical_scale).clamp(0.0, 1.0);
		let candidate = merged
			.entry((hit.note_id, hit.chunk_index))
			.or_insert_with(|| Candidate::from_hit(hit));

		candidate.lexical_score =
			Some(candidate.lexical_score.map_or(score, |prev| prev.max(score)));
	}

	let mut candidates: Vec<Candidate> = merged
		.into_values()
		.map(|mut candidate| {
			candidate.fused_score = weights.vector * candidate.vector_score.unwrap_or(0.0)
				+ weights.lexical * candidate.lexical_score.unwrap_or(0.0);

			candidate
		})
		.filter(|candidate| candidate.fused_score >= threshold)
		.collect();

	candidates.sort_by(model::cmp_fused);
	candidates.truncate(limit);

	candidates
}

/// Lexical scores already on a 0-1 scale are used as-is; anything larger is divided by the batch
/// maximum.
fn lexical_scale(hits: &[IndexHit]) -> f32 {
	let max =
		hits.iter().map(|hit| hit.score).filter(|score| score.is_finite()).fold(0.0, f32::max);

	if max > 1.0 { max } else { 1.0 }
}

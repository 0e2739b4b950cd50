use std::time::Duration;

use futures_util::{StreamExt, stream};

use brain_config::LlmProviderConfig;

use crate::{
	Error, LlmProvider, Result,
	cancel::{self, CancellationToken},
	model::{self, Candidate},
	structured::{RelevanceJudgment, StructuredOutput},
};

const RERANK_SYSTEM_PROMPT: &str = "\
You judge how relevant a passage from a person's notes is to their question. Score from 0 to 10: \
0 means unrelated, 5 means partially useful, 10 means it directly answers the question. Judge \
only the passage you are given.";

#[derive(Debug, Clone, Copy)]
pub struct RerankSettings {
	pub min_score: f32,
	pub max_concurrency: usize,
	pub max_passage_chars: usize,
	pub timeout: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct RerankOutcome {
	pub candidates: Vec<Candidate>,
	/// Every score the judge produced, including ones later dropped by the floor.
	pub judged_scores: Vec<f32>,
	pub unscored: usize,
	pub dropped: usize,
}

/// Scores each candidate with an LLM judge using bounded fan-out.
///
/// A failed judgment leaves the candidate in place, flagged as unscored. Only cancellation is
/// returned as an error, after every in-flight call has settled.
pub async fn rerank(
	llm: &dyn LlmProvider,
	cfg: &LlmProviderConfig,
	query: &str,
	candidates: Vec<Candidate>,
	settings: RerankSettings,
	cancel: &CancellationToken,
) -> Result<RerankOutcome> {
	let judgments: Vec<(Candidate, Result<RelevanceJudgment>)> =
		stream::iter(candidates.into_iter().map(|candidate| async move {
			let judgment = judge(llm, cfg, query, &candidate, settings, cancel).await;

			(candidate, judgment)
		}))
		.buffered(settings.max_concurrency.max(1))
		.collect()
		.await;
	let mut outcome = RerankOutcome::default();
	let mut cancelled = false;

	for (mut candidate, judgment) in judgments {
		match judgment {
			Ok(judgment) => {
				outcome.judged_scores.push(judgment.score);

				if judgment.score < settings.min_score {
					outcome.dropped += 1;

					continue;
				}

				candidate.rerank_score = Some(judgment.score);
				candidate.rerank_reasoning =
					Some(judgment.reasoning.trim().to_string()).filter(|text| !text.is_empty());
			},
			Err(Error::Cancelled) => {
				cancelled = true;

				continue;
			},
			Err(err) => {
				tracing::warn!(
					error = %err,
					note_id = %candidate.note_id,
					chunk_index = candidate.chunk_index,
					"Rerank judgment failed; keeping the fused score."
				);

				candidate.unscored = true;
				outcome.unscored += 1;
			},
		}

		outcome.candidates.push(candidate);
	}

	if cancelled {
		return Err(Error::Cancelled);
	}

	outcome.candidates.sort_by(model::cmp_relevance);

	Ok(outcome)
}

async fn judge(
	llm: &dyn LlmProvider,
	cfg: &LlmProviderConfig,
	query: &str,
	candidate: &Candidate,
	settings: RerankSettings,
	cancel: &CancellationToken,
) -> Result<RelevanceJudgment> {
	let request = RelevanceJudgment::request(
		RERANK_SYSTEM_PROMPT,
		build_user_prompt(query, candidate, settings.max_passage_chars),
	);
	let value =
		cancel::guard(cancel, "rerank", settings.timeout, llm.generate_structured(cfg, &request))
			.await?;

	RelevanceJudgment::parse(value)
}

fn build_user_prompt(query: &str, candidate: &Candidate, max_passage_chars: usize) -> String {
	let passage: String = candidate.text.chars().take(max_passage_chars).collect();
	let mut prompt = format!("Question: {query}\n\n");

	if !candidate.title.is_empty() {
		prompt.push_str(&format!("Note title: {}\n", candidate.title));
	}
	if !candidate.tags.is_empty() {
		prompt.push_str(&format!("Tags: {}\n", candidate.tags.join(", ")));
	}

	prompt.push_str(&format!("Passage:\n{passage}"));

	prompt
}

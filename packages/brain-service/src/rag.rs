use std::time::{Duration, Instant};

use serde::Deserialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
	Error, RagService, Result,
	analytics::{self, FeedbackCorrelation},
	cancel::{self, CancellationToken},
	context,
	expansion::{self, ExpansionOptions},
	metrics::{RERANK_UNSCORED, RETRIEVAL_DEGRADED, STAGE_LATENCY_PREFIX},
	model::{
		Candidate, Degradation, EmbeddingVector, FeatureFlags, Query, QueryLog, RagContext,
		RagOptions, ScoreStats, Stage, StageTimings,
	},
	rerank::{self, RerankSettings},
	retrieval::{self, RetrievalPlan},
};

#[derive(Debug, Clone, Deserialize)]
pub struct RetrieveRequest {
	pub user_id: Uuid,
	pub query: String,
	#[serde(default)]
	pub conversation_id: Option<Uuid>,
	#[serde(default)]
	pub options: Option<RagOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FeedbackRequest {
	pub log_id: Uuid,
	pub positive: bool,
	#[serde(default)]
	pub category: Option<String>,
	#[serde(default)]
	pub comment: Option<String>,
}

const PENDING_LOG_WAIT: Duration = Duration::from_secs(2);

struct EmbeddedTexts {
	vectors: Vec<EmbeddingVector>,
	all_cached: bool,
}

/// Accumulates what happened during one retrieval for the context metadata and the query log.
struct RunState {
	started: Instant,
	timings: StageTimings,
	features: FeatureFlags,
	degradations: Vec<Degradation>,
	embedding_cache_hit: bool,
	retrieved_count: u32,
	cosine_scores: Vec<f32>,
	rerank_scores: Vec<f32>,
	unscored_count: u32,
}
impl RunState {
	fn new() -> Self {
		Self {
			started: Instant::now(),
			timings: StageTimings::default(),
			features: FeatureFlags::default(),
			degradations: Vec::new(),
			embedding_cache_hit: false,
			retrieved_count: 0,
			cosine_scores: Vec::new(),
			rerank_scores: Vec::new(),
			unscored_count: 0,
		}
	}

	fn degrade(&mut self, degradation: Degradation) {
		if !self.degradations.contains(&degradation) {
			self.degradations.push(degradation);
		}
	}
}

impl RagService {
	/// Runs embedding, expansion, retrieval, reranking, and finalization for one query.
	///
	/// Only invalid input and cancellation are returned as errors. Every other failure degrades
	/// the run and is reported through [`RagContext::degradations`].
	pub async fn retrieve_context(
		&self,
		req: RetrieveRequest,
		cancel: &CancellationToken,
	) -> Result<RagContext> {
		let (query, options) = self.validate_request(req)?;
		let mut state = RunState::new();

		self.check_user(query.user_id, &mut state).await?;
		cancel.check()?;

		// Embedding.
		let stage_started = Instant::now();
		let query_vector = match self.embed_texts(std::slice::from_ref(&query.text), cancel).await
		{
			Ok(embedded) => {
				state.embedding_cache_hit = embedded.all_cached;

				embedded.vectors.into_iter().next()
			},
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(err) => {
				tracing::warn!(error = %err, "Query embedding failed; continuing without vectors.");
				state.degrade(Degradation::EmbeddingFailed);

				None
			},
		};

		self.finish_stage(&mut state, Stage::Embedding, stage_started);
		cancel.check()?;

		// Expansion.
		let mut vectors: Vec<EmbeddingVector> = query_vector.into_iter().collect();
		let expansion_options = ExpansionOptions::from(&options);

		if !vectors.is_empty() && expansion_options.is_enabled() {
			let stage_started = Instant::now();

			self.expand_vectors(&query.text, expansion_options, &mut vectors, &mut state, cancel)
				.await?;
			self.finish_stage(&mut state, Stage::Expansion, stage_started);
		}

		cancel.check()?;

		// Retrieval.
		let stage_started = Instant::now();
		let lexical = self.backends.lexical.as_deref().filter(|_| options.enable_hybrid);
		let mut candidates = if vectors.is_empty() && lexical.is_none() {
			Vec::new()
		} else {
			let plan = RetrievalPlan {
				vectors: &vectors,
				query_text: &query.text,
				user_id: query.user_id,
				options: &options,
				vector_timeout: Duration::from_millis(self.cfg.timeouts.vector_search_ms),
				lexical_timeout: Duration::from_millis(self.cfg.timeouts.lexical_search_ms),
			};
			let outcome =
				retrieval::retrieve(self.backends.vector.as_ref(), lexical, plan, cancel).await?;

			state.features.hybrid = outcome.lexical_issued;

			for degradation in outcome.degradations {
				state.degrade(degradation);
			}

			outcome.candidates
		};

		state.retrieved_count = candidates.len() as u32;
		state.cosine_scores = candidates.iter().filter_map(|c| c.vector_score).collect();

		self.finish_stage(&mut state, Stage::Retrieval, stage_started);
		cancel.check()?;

		// Reranking.
		if options.enable_reranking && !candidates.is_empty() {
			let stage_started = Instant::now();

			candidates = self
				.rerank_candidates(&query.text, candidates, &options, &mut state, cancel)
				.await?;

			self.finish_stage(&mut state, Stage::Reranking, stage_started);
		}

		cancel.check()?;

		// Finalize.
		let stage_started = Instant::now();
		let finalized = context::finalize(candidates, options.top_k, options.max_context_length);

		self.finish_stage(&mut state, Stage::Finalize, stage_started);

		state.timings.total_ms = state.started.elapsed().as_millis() as u64;

		let log_id = Uuid::new_v4();
		let ctx = RagContext {
			log_id,
			query: query.text.clone(),
			candidates: finalized.candidates,
			rendered: finalized.rendered,
			citations: finalized.citations,
			total_tokens: finalized.total_tokens,
			features: state.features,
			degradations: state.degradations.clone(),
		};

		if ctx.is_degraded() {
			self.backends.metrics.increment(RETRIEVAL_DEGRADED, 1);
		}

		tracing::info!(
			%log_id,
			user_id = %query.user_id,
			retrieved = state.retrieved_count,
			returned = ctx.candidates.len(),
			total_tokens = ctx.total_tokens,
			elapsed_ms = state.timings.total_ms,
			degraded = ctx.is_degraded(),
			"Retrieval completed."
		);

		self.recorder.record(build_log(log_id, &query, &ctx, state));

		Ok(ctx)
	}

	/// Attaches feedback to a recorded query log. A log whose append is still in flight is waited
	/// for once before the id is reported as unknown.
	pub async fn submit_feedback(&self, req: FeedbackRequest) -> Result<()> {
		let feedback = analytics::normalize_feedback(
			req.positive,
			req.category.as_deref(),
			req.comment.as_deref(),
			self.cfg.limits.max_feedback_comment_chars as usize,
			OffsetDateTime::now_utc(),
		);

		let was_pending = self.recorder.is_pending(req.log_id);
		let attached = match self.backends.logs.attach_feedback(req.log_id, &feedback).await {
			Err(Error::NotFound { .. }) if was_pending => {
				self.recorder.wait_settled(req.log_id, PENDING_LOG_WAIT).await;
				self.backends.logs.attach_feedback(req.log_id, &feedback).await
			},
			other => other,
		};

		attached?;

		tracing::info!(log_id = %req.log_id, positive = req.positive, "Feedback recorded.");

		Ok(())
	}

	pub async fn list_logs_since(&self, since: OffsetDateTime) -> Result<Vec<QueryLog>> {
		self.backends.logs.list_since(since).await
	}

	/// Offline aggregation over logs created at or after `since`.
	pub async fn correlate_feedback(&self, since: OffsetDateTime) -> Result<FeedbackCorrelation> {
		let logs = self.list_logs_since(since).await?;

		Ok(analytics::correlate_feedback(
			&logs,
			&self.cfg.analytics.score_bands,
			self.cfg.analytics.target_positive_rate,
		))
	}

	fn validate_request(&self, req: RetrieveRequest) -> Result<(Query, RagOptions)> {
		let text = req.query.trim();

		if text.is_empty() {
			return Err(Error::InvalidRequest { message: "query must be non-empty.".to_string() });
		}

		let max_chars = self.cfg.limits.max_query_chars as usize;

		if text.chars().count() > max_chars {
			return Err(Error::InvalidRequest {
				message: format!("query must be {max_chars} characters or fewer."),
			});
		}
		if req.user_id.is_nil() {
			return Err(Error::InvalidRequest { message: "user_id must be set.".to_string() });
		}

		let options = req.options.unwrap_or_else(|| self.cfg.rag.clone());

		brain_config::validate_rag(&options)?;

		let query = Query {
			text: text.to_string(),
			user_id: req.user_id,
			conversation_id: req.conversation_id,
			received_at: OffsetDateTime::now_utc(),
		};

		Ok((query, options))
	}

	/// Rejects users the directory does not know. A directory outage is not proof that the user is
	/// unknown, so the request is accepted and the run is flagged.
	async fn check_user(&self, user_id: Uuid, state: &mut RunState) -> Result<()> {
		let Some(users) = &self.backends.users else {
			return Ok(());
		};

		match users.user_exists(user_id).await {
			Ok(true) => Ok(()),
			Ok(false) => Err(Error::UnknownUser { user_id }),
			Err(err) => {
				tracing::warn!(error = %err, %user_id, "User lookup failed; accepting request.");
				state.degrade(Degradation::UserLookupFailed);

				Ok(())
			},
		}
	}

	/// Embeds `texts` in input order, serving what it can from the cache and sending the rest to
	/// the provider in one batch.
	async fn embed_texts(
		&self,
		texts: &[String],
		cancel: &CancellationToken,
	) -> Result<EmbeddedTexts> {
		let cfg = &self.cfg.providers.embedding;
		let provider = cfg.vendor.as_str();
		let mut slots: Vec<Option<EmbeddingVector>> = texts
			.iter()
			.map(|text| {
				self.cache.get(text, provider, &cfg.model).map(|vector| vector.as_ref().clone())
			})
			.collect();
		let missing: Vec<usize> = slots
			.iter()
			.enumerate()
			.filter(|(_, slot)| slot.is_none())
			.map(|(idx, _)| idx)
			.collect();
		let all_cached = missing.is_empty();

		if !missing.is_empty() {
			let batch: Vec<String> = missing.iter().map(|idx| texts[*idx].clone()).collect();
			let timeout = Duration::from_millis(self.cfg.timeouts.embedding_ms);
			let raw = cancel::guard(
				cancel,
				"embedding",
				timeout,
				self.providers.embedding.embed(cfg, &batch),
			)
			.await?;

			if raw.len() != batch.len() {
				return Err(Error::Provider {
					message: format!(
						"Embedding provider returned {} vectors for {} inputs.",
						raw.len(),
						batch.len()
					),
				});
			}

			for (idx, values) in missing.into_iter().zip(raw) {
				if values.len() != cfg.dimensions as usize {
					return Err(Error::EmbeddingMismatch {
						message: format!(
							"Embedding has {} dimensions; {} are configured.",
							values.len(),
							cfg.dimensions
						),
					});
				}

				let vector = EmbeddingVector::new(provider, cfg.model.as_str(), values)?;

				self.cache.put(&texts[idx], provider, &cfg.model, vector.clone());

				slots[idx] = Some(vector);
			}
		}

		Ok(EmbeddedTexts { vectors: slots.into_iter().flatten().collect(), all_cached })
	}

	async fn expand_vectors(
		&self,
		query: &str,
		options: ExpansionOptions,
		vectors: &mut Vec<EmbeddingVector>,
		state: &mut RunState,
		cancel: &CancellationToken,
	) -> Result<()> {
		let expansion = expansion::expand(
			self.providers.llm.as_ref(),
			&self.cfg.providers.llm,
			query,
			options,
			Duration::from_millis(self.cfg.timeouts.expansion_ms),
			cancel,
		)
		.await?;

		for degradation in &expansion.degradations {
			state.degrade(*degradation);
		}

		let has_hyde = expansion.hypothetical.is_some();
		let texts: Vec<String> =
			expansion.hypothetical.into_iter().chain(expansion.rewrites).collect();

		if texts.is_empty() {
			return Ok(());
		}

		match self.embed_texts(&texts, cancel).await {
			Ok(embedded) => {
				state.features.hyde = has_hyde;
				state.features.multi_query = texts.len() > usize::from(has_hyde);

				vectors.extend(embedded.vectors);
			},
			Err(Error::Cancelled) => return Err(Error::Cancelled),
			Err(err) => {
				tracing::warn!(error = %err, "Embedding expanded queries failed.");

				if has_hyde {
					state.degrade(Degradation::HydeFailed);
				}
				if texts.len() > usize::from(has_hyde) {
					state.degrade(Degradation::MultiQueryFailed);
				}
			},
		}

		Ok(())
	}

	async fn rerank_candidates(
		&self,
		query: &str,
		candidates: Vec<Candidate>,
		options: &RagOptions,
		state: &mut RunState,
		cancel: &CancellationToken,
	) -> Result<Vec<Candidate>> {
		let settings = RerankSettings {
			min_score: options.min_rerank_score,
			max_concurrency: self.cfg.rerank.max_concurrency as usize,
			max_passage_chars: self.cfg.rerank.max_passage_chars as usize,
			timeout: Duration::from_millis(self.cfg.timeouts.rerank_ms),
		};
		let outcome = rerank::rerank(
			self.providers.llm.as_ref(),
			&self.cfg.providers.llm,
			query,
			candidates,
			settings,
			cancel,
		)
		.await?;

		state.features.rerank = true;
		state.rerank_scores = outcome.judged_scores;
		state.unscored_count = outcome.unscored as u32;

		if outcome.unscored > 0 {
			state.degrade(Degradation::RerankUnscored);
			self.backends.metrics.increment(RERANK_UNSCORED, outcome.unscored as u64);
		}

		tracing::debug!(
			kept = outcome.candidates.len(),
			dropped = outcome.dropped,
			unscored = outcome.unscored,
			"Rerank completed."
		);

		Ok(outcome.candidates)
	}

	fn finish_stage(&self, state: &mut RunState, stage: Stage, started: Instant) {
		let elapsed_ms = started.elapsed().as_millis() as u64;

		state.timings.record(stage, elapsed_ms);
		self.backends
			.metrics
			.observe_ms(&format!("{STAGE_LATENCY_PREFIX}.{}", stage.as_str()), elapsed_ms);

		tracing::debug!(stage = stage.as_str(), elapsed_ms, "Stage finished.");
	}
}

fn build_log(log_id: Uuid, query: &Query, ctx: &RagContext, state: RunState) -> QueryLog {
	QueryLog {
		log_id,
		user_id: query.user_id,
		conversation_id: query.conversation_id,
		query: query.text.clone(),
		created_at: query.received_at,
		timings: state.timings,
		retrieved_count: state.retrieved_count,
		final_count: ctx.candidates.len() as u32,
		unscored_count: state.unscored_count,
		scores: ScoreStats::from_scores(&state.cosine_scores, &state.rerank_scores),
		embedding_cache_hit: state.embedding_cache_hit,
		features: state.features,
		degradations: state.degradations,
		feedback: None,
	}
}

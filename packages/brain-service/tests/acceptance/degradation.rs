use std::time::Duration;

use serde_json::json;
use uuid::Uuid;

use brain_service::{
	CancellationToken, Degradation, Error, RagOptions, metrics::RETRIEVAL_DEGRADED,
};
use brain_testkit::{
	Harness,
	fakes::{ScriptedLlm, vector_at_cosine},
};

use super::{DIMENSIONS, LOG_WAIT, QUERY};

#[tokio::test]
async fn vector_outage_falls_back_to_lexical_results() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.vector.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A vector outage must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);

	let top = &ctx.candidates[0];

	assert_eq!(top.note_id, seeded.auth_note);
	assert!(top.vector_score.is_none());
	assert_eq!(top.lexical_score, Some(top.fused_score));
	assert_eq!(ctx.degradations, vec![Degradation::VectorSearchFailed]);
	assert!(ctx.is_degraded());
	assert_eq!(harness.metrics.count(RETRIEVAL_DEGRADED), 1);

	let logs = harness.logs.wait_for_len(1, LOG_WAIT).await;

	assert_eq!(logs[0].degradations, vec![Degradation::VectorSearchFailed]);
}

#[tokio::test]
async fn vector_outage_without_hybrid_returns_an_empty_context() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.vector.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A vector outage must not fail retrieval.");

	assert!(ctx.is_empty());
	assert_eq!(ctx.degradations, vec![Degradation::VectorSearchFailed]);
}

#[tokio::test]
async fn embedding_outage_uses_lexical_search_only() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("An embedding outage must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert_eq!(ctx.degradations, vec![Degradation::EmbeddingFailed]);
	assert_eq!(harness.vector.searches(), 0);
	assert_eq!(harness.lexical.searches(), 1);
}

#[tokio::test]
async fn embedding_outage_without_hybrid_returns_an_empty_context() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("An embedding outage must not fail retrieval.");

	assert!(ctx.is_empty());
	assert_eq!(ctx.degradations, vec![Degradation::EmbeddingFailed]);
	assert_eq!(harness.vector.searches(), 0);
	assert_eq!(harness.lexical.searches(), 0);
}

#[tokio::test]
async fn wrong_embedding_dimensions_count_as_an_embedding_failure() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_vector(QUERY, vec![1.0, 0.0, 0.0]);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A dimension mismatch must not fail retrieval.");

	assert!(ctx.is_empty());
	assert_eq!(ctx.degradations, vec![Degradation::EmbeddingFailed]);
	assert_eq!(service.cache.entry_count(), 0);
}

#[tokio::test]
async fn lexical_outage_keeps_vector_results_at_full_weight() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.lexical.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A lexical outage must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert!((ctx.candidates[0].fused_score - 0.92).abs() < 1e-4);
	assert_eq!(ctx.degradations, vec![Degradation::LexicalSearchFailed]);
}

#[tokio::test]
async fn log_store_failures_do_not_reach_the_caller() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.logs.set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("Log persistence must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert!(harness.logs.logs().is_empty());
}

#[tokio::test]
async fn one_failed_variant_search_is_flagged_as_partial() {
	let harness = Harness::new(
		DIMENSIONS,
		ScriptedLlm::new(|request| match request.name.as_str() {
			"query_rewrites" => Ok(json!({ "queries": ["jwt login flow"] })),
			other => Err(Error::Provider { message: format!("No script for {other}.") }),
		}),
	);
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_vector("jwt login flow", vector_at_cosine(0.99, DIMENSIONS));
	// The query vector is searched first, the rewrite second.
	harness.vector.fail_search(2);

	let service = harness.service(super::config());
	let options = RagOptions {
		enable_multi_query: true,
		multi_query_count: 1,
		..super::options(false, false)
	};
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("A failed variant search must not fail retrieval.");

	assert_eq!(harness.vector.searches(), 2);
	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert!((ctx.candidates[0].fused_score - 0.92).abs() < 1e-4);
	assert_eq!(ctx.degradations, vec![Degradation::VectorSearchPartial]);
	assert!(ctx.is_degraded());
	assert_eq!(harness.metrics.count(RETRIEVAL_DEGRADED), 1);

	let logs = harness.logs.wait_for_len(1, LOG_WAIT).await;

	assert_eq!(logs[0].degradations, vec![Degradation::VectorSearchPartial]);
}

#[tokio::test]
async fn slow_vector_search_times_out_and_falls_back_to_lexical() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.vector.set_delay(Some(Duration::from_millis(300)));

	let mut cfg = super::config();

	cfg.timeouts.vector_search_ms = 20;

	let service = harness.service(cfg);
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A slow vector index must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert!(ctx.candidates[0].vector_score.is_none());
	assert_eq!(ctx.degradations, vec![Degradation::VectorSearchFailed]);
}

#[tokio::test]
async fn slow_lexical_search_times_out_and_keeps_vector_results() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.lexical.set_delay(Some(Duration::from_millis(300)));

	let mut cfg = super::config();

	cfg.timeouts.lexical_search_ms = 20;

	let service = harness.service(cfg);
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A slow lexical index must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert!((ctx.candidates[0].fused_score - 0.92).abs() < 1e-4);
	assert_eq!(ctx.degradations, vec![Degradation::LexicalSearchFailed]);
}

#[tokio::test]
async fn missing_lexical_index_is_not_a_degradation() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable()).without_lexical();
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert_eq!(ctx.candidates.len(), 1);
	assert!((ctx.candidates[0].fused_score - 0.92).abs() < 1e-4);
	assert!(!ctx.features.hybrid);
	assert!(ctx.degradations.is_empty());
	assert_eq!(harness.lexical.searches(), 0);
}

#[tokio::test]
async fn user_directory_outage_accepts_the_request_and_is_flagged() {
	let user_id = Uuid::new_v4();
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable()).with_users([user_id]);

	harness.users.as_ref().expect("directory configured").set_failing(true);

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(Uuid::new_v4(), QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A directory outage must not reject the request.");

	assert!(ctx.is_empty());
	assert_eq!(ctx.degradations, vec![Degradation::UserLookupFailed]);
}

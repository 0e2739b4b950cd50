use std::time::Duration;

use serde_json::json;

use brain_service::{CancellationToken, Degradation, Error, RagOptions};
use brain_testkit::{
	Harness,
	fakes::{ScriptedLlm, vector_at_cosine},
};

use super::{DIMENSIONS, QUERY};

const HYDE_PASSAGE: &str = "My app signs short-lived JWTs and refreshes them from a cookie.";

fn expanding_llm() -> ScriptedLlm {
	ScriptedLlm::new(|request| match request.name.as_str() {
		"hypothetical_passage" => Ok(json!({ "passage": HYDE_PASSAGE })),
		"query_rewrites" => Ok(json!({
			"queries": ["jwt login flow", "What did I write about authentication", "token expiry"]
		})),
		other => Err(Error::Provider { message: format!("No script for {other}.") }),
	})
}

#[tokio::test]
async fn multi_query_variants_are_deduplicated_by_chunk() {
	let harness = Harness::new(DIMENSIONS, expanding_llm());
	let seeded = super::seed_auth_and_grocery(&harness);

	// The first rewrite sits closer to the auth note than the query does; the second is
	// orthogonal to both notes.
	harness.embedding.set_vector("jwt login flow", vector_at_cosine(0.99, DIMENSIONS));
	harness.embedding.set_vector("token expiry", vec![0.0, 0.0, 1.0, 0.0]);

	let service = harness.service(super::config());
	let options = RagOptions {
		enable_multi_query: true,
		multi_query_count: 3,
		..super::options(false, false)
	};
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("Retrieval failed.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert!(ctx.candidates[0].vector_score.is_some_and(|score| score > 0.95));
	assert!(ctx.features.multi_query);
	assert!(!ctx.features.hyde);
	assert!(ctx.degradations.is_empty());
	assert_eq!(harness.llm.calls("query_rewrites"), 1);
	assert_eq!(harness.llm.calls("hypothetical_passage"), 0);
	// One call for the query and one batch for the two surviving rewrites.
	assert_eq!(harness.embedding.calls(), 2);
	assert_eq!(harness.embedding.texts_embedded(), 3);
	assert_eq!(harness.vector.searches(), 3);
}

#[tokio::test]
async fn hyde_and_rewrites_share_one_embedding_batch() {
	let harness = Harness::new(DIMENSIONS, expanding_llm());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_vector(HYDE_PASSAGE, vec![0.0, 0.0, 0.0, 1.0]);
	harness.embedding.set_vector("jwt login flow", vec![0.0, 0.0, 1.0, 0.0]);
	harness.embedding.set_vector("token expiry", vec![0.0, 0.0, 1.0, 0.0]);

	let service = harness.service(super::config());
	let options = RagOptions {
		enable_hyde: true,
		enable_multi_query: true,
		multi_query_count: 2,
		..super::options(false, false)
	};
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("Retrieval failed.");

	assert!(ctx.features.hyde);
	assert!(ctx.features.multi_query);
	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(harness.embedding.calls(), 2);
	assert_eq!(harness.embedding.texts_embedded(), 4);
	assert_eq!(harness.vector.searches(), 4);
}

#[tokio::test]
async fn failed_hyde_is_dropped_and_flagged() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let options = RagOptions { enable_hyde: true, ..super::options(false, false) };
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("A failed expansion must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.degradations, vec![Degradation::HydeFailed]);
	assert!(!ctx.features.hyde);
	assert_eq!(harness.llm.calls("hypothetical_passage"), 1);
	assert_eq!(harness.vector.searches(), 1);
}

#[tokio::test]
async fn slow_expansion_times_out_and_is_flagged() {
	let harness = Harness::new(DIMENSIONS, expanding_llm());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.llm.set_delay(Some(Duration::from_millis(300)));

	let mut cfg = super::config();

	cfg.timeouts.expansion_ms = 20;

	let service = harness.service(cfg);
	let options = RagOptions {
		enable_hyde: true,
		enable_multi_query: true,
		multi_query_count: 2,
		..super::options(false, false)
	};
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("A slow expansion must not fail retrieval.");

	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
	assert!(ctx.degradations.contains(&Degradation::HydeFailed));
	assert!(ctx.degradations.contains(&Degradation::MultiQueryFailed));
	assert!(!ctx.features.hyde);
	assert!(!ctx.features.multi_query);
	assert_eq!(harness.embedding.calls(), 1);
	assert_eq!(harness.vector.searches(), 1);
}

#[tokio::test]
async fn expansion_is_skipped_without_a_query_vector() {
	let harness = Harness::new(DIMENSIONS, expanding_llm());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_failing(true);

	let service = harness.service(super::config());
	let options = RagOptions { enable_hyde: true, ..super::options(true, false) };
	let ctx = service
		.retrieve_context(super::request(seeded.user_id, QUERY, options), &CancellationToken::new())
		.await
		.expect("Retrieval failed.");

	assert_eq!(ctx.degradations, vec![Degradation::EmbeddingFailed]);
	assert_eq!(harness.llm.calls("hypothetical_passage"), 0);
}

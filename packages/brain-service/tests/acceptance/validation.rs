use uuid::Uuid;

use brain_service::{CancellationToken, Error, RagOptions};
use brain_testkit::{Harness, fakes::ScriptedLlm};

use super::{DIMENSIONS, QUERY};

#[tokio::test]
async fn blank_and_oversized_queries_are_rejected() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let oversized = "a".repeat(4_001);

	for query in ["", "   \n\t", oversized.as_str()] {
		let result = service
			.retrieve_context(
				super::request(seeded.user_id, query, super::options(true, false)),
				&CancellationToken::new(),
			)
			.await;

		assert!(matches!(result, Err(Error::InvalidRequest { .. })), "query {query:?} passed");
	}

	assert_eq!(harness.embedding.calls(), 0);
}

#[tokio::test]
async fn nil_and_unknown_users_are_rejected() {
	let known = Uuid::new_v4();
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable()).with_users([known]);
	let service = harness.service(super::config());
	let nil = service
		.retrieve_context(
			super::request(Uuid::nil(), QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await;
	let stranger = Uuid::new_v4();
	let unknown = service
		.retrieve_context(
			super::request(stranger, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await;
	let allowed = service
		.retrieve_context(
			super::request(known, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await;

	assert!(matches!(nil, Err(Error::InvalidRequest { .. })));
	assert!(matches!(unknown, Err(Error::UnknownUser { user_id }) if user_id == stranger));
	assert!(allowed.is_ok_and(|ctx| ctx.is_empty()));
}

#[tokio::test]
async fn invalid_options_are_rejected() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let invalid = [
		RagOptions { top_k: 0, ..RagOptions::default() },
		RagOptions { vector_weight: 0.0, bm25_weight: 0.0, ..RagOptions::default() },
		RagOptions { vector_weight: -0.5, ..RagOptions::default() },
		RagOptions { similarity_threshold: 1.5, ..RagOptions::default() },
		RagOptions { min_rerank_score: 11.0, ..RagOptions::default() },
		RagOptions { multi_query_count: 11, ..RagOptions::default() },
	];

	for options in invalid {
		let result = service
			.retrieve_context(
				super::request(seeded.user_id, QUERY, options.clone()),
				&CancellationToken::new(),
			)
			.await;

		assert!(matches!(result, Err(Error::InvalidRequest { .. })), "{options:?} passed");
	}
}

#[tokio::test]
async fn missing_options_fall_back_to_configured_defaults() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let mut cfg = super::config();

	cfg.rag.enable_hybrid = false;

	let service = harness.service(cfg);
	let mut req = super::request(seeded.user_id, QUERY, RagOptions::default());

	req.options = None;

	let ctx =
		service.retrieve_context(req, &CancellationToken::new()).await.expect("Retrieval failed.");

	assert_eq!(ctx.candidates.len(), 1);
	assert!(!ctx.features.hybrid);
	assert_eq!(harness.lexical.searches(), 0);
}

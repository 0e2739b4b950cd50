use brain_service::{
	CancellationToken,
	metrics::{EMBEDDING_CACHE_HIT, EMBEDDING_CACHE_MISS},
};
use brain_testkit::{Harness, fakes::ScriptedLlm};

use super::{DIMENSIONS, LOG_WAIT, QUERY};

#[tokio::test]
async fn repeated_query_is_served_from_the_cache() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let first = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("First retrieval failed.");
	let second = service
		.retrieve_context(
			super::request(
				seeded.user_id,
				"  What did I   write about AUTHENTICATION ",
				super::options(false, false),
			),
			&CancellationToken::new(),
		)
		.await
		.expect("Second retrieval failed.");

	assert_eq!(harness.embedding.calls(), 1);
	assert_eq!(harness.metrics.count(EMBEDDING_CACHE_MISS), 1);
	assert_eq!(harness.metrics.count(EMBEDDING_CACHE_HIT), 1);
	assert_eq!(first.candidates[0].note_id, second.candidates[0].note_id);

	let logs = harness.logs.wait_for_len(2, LOG_WAIT).await;
	let first_log = logs.iter().find(|log| log.log_id == first.log_id).expect("Missing log.");
	let second_log = logs.iter().find(|log| log.log_id == second.log_id).expect("Missing log.");

	assert!(!first_log.embedding_cache_hit);
	assert!(second_log.embedding_cache_hit);
}

#[tokio::test]
async fn disabled_cache_embeds_every_time() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let mut cfg = super::config();

	cfg.cache.enabled = false;

	let service = harness.service(cfg);

	for _ in 0..2 {
		service
			.retrieve_context(
				super::request(seeded.user_id, QUERY, super::options(false, false)),
				&CancellationToken::new(),
			)
			.await
			.expect("Retrieval failed.");
	}

	assert_eq!(harness.embedding.calls(), 2);
	assert!(!service.cache.is_enabled());
}

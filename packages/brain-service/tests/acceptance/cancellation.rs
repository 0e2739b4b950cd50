use std::time::Duration;

use brain_service::{CancellationToken, Degradation, Error};
use brain_testkit::{Harness, fakes::ScriptedLlm};

use super::{DIMENSIONS, QUERY};

#[tokio::test]
async fn cancelled_token_stops_before_any_provider_call() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let cancel = CancellationToken::new();

	cancel.cancel();

	let result = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&cancel,
		)
		.await;

	assert!(matches!(result, Err(Error::Cancelled)));
	assert_eq!(harness.embedding.calls(), 0);
	assert_eq!(harness.vector.searches(), 0);
}

#[tokio::test]
async fn cancelling_during_embedding_writes_no_log() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_delay(Some(Duration::from_millis(500)));

	let service = harness.service(super::config());
	let cancel = CancellationToken::new();
	let (result, ()) = tokio::join!(
		service.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&cancel,
		),
		async {
			tokio::time::sleep(Duration::from_millis(20)).await;
			cancel.cancel();
		},
	);

	assert!(result.is_err_and(|err| err.is_cancelled()));
	assert_eq!(harness.vector.searches(), 0);
	assert!(harness.logs.wait_for_len(1, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test]
async fn cancelling_during_rerank_surfaces_as_cancelled() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 9.0)]));
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.llm.set_delay(Some(Duration::from_millis(500)));

	let service = harness.service(super::config());
	let cancel = CancellationToken::new();
	let (result, ()) = tokio::join!(
		service.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, true)),
			&cancel,
		),
		async {
			tokio::time::sleep(Duration::from_millis(50)).await;
			cancel.cancel();
		},
	);

	assert!(matches!(result, Err(Error::Cancelled)));
	assert_eq!(harness.llm.calls("relevance_judgment"), 1);
	assert!(harness.logs.wait_for_len(1, Duration::from_millis(200)).await.is_empty());
}

#[tokio::test]
async fn slow_embedding_times_out_and_degrades() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.embedding.set_delay(Some(Duration::from_millis(300)));

	let mut cfg = super::config();

	cfg.timeouts.embedding_ms = 20;

	let service = harness.service(cfg);
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(true, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("A slow embedding provider must not fail retrieval.");

	assert_eq!(ctx.degradations, vec![Degradation::EmbeddingFailed]);
	assert_eq!(ctx.candidates.len(), 1);
	assert_eq!(ctx.candidates[0].note_id, seeded.auth_note);
}

use std::time::Duration;

use uuid::Uuid;

use brain_service::{CancellationToken, Degradation, metrics::RERANK_UNSCORED};
use brain_testkit::{
	Harness,
	fakes::{NoteChunk, ScriptedLlm, axis, vector_at_cosine},
};

use super::{DIMENSIONS, LOG_WAIT, QUERY};

struct Notes {
	user_id: Uuid,
	auth: Uuid,
	session: Uuid,
	deploy: Uuid,
}

fn seed(harness: &Harness) -> Notes {
	let notes = Notes {
		user_id: Uuid::new_v4(),
		auth: Uuid::new_v4(),
		session: Uuid::new_v4(),
		deploy: Uuid::new_v4(),
	};

	harness.embedding.set_vector(QUERY, axis(DIMENSIONS));

	for (note_id, title, text, cosine) in [
		(notes.auth, "JWT Auth Guide", "Access tokens are JWTs that expire after an hour.", 0.92),
		(notes.session, "Sessions", "Session cookies refresh every day.", 0.8),
		(notes.deploy, "Deploy checklist", "Deploys run on Fridays after review.", 0.7),
	] {
		harness.vector.insert(
			notes.user_id,
			NoteChunk::new(note_id, 0, title, text),
			vector_at_cosine(cosine, DIMENSIONS),
		);
	}

	notes
}

#[tokio::test]
async fn rerank_drops_low_scores_and_keeps_unscored_candidates() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 9.0), ("cookie", 1.0)]));
	let notes = seed(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(notes.user_id, QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");
	let order: Vec<Uuid> = ctx.candidates.iter().map(|candidate| candidate.note_id).collect();

	assert_eq!(order, vec![notes.auth, notes.deploy]);
	assert!(ctx.candidates.iter().all(|candidate| candidate.note_id != notes.session));

	let auth = &ctx.candidates[0];
	let deploy = &ctx.candidates[1];

	assert_eq!(auth.rerank_score, Some(9.0));
	assert_eq!(auth.rerank_reasoning.as_deref(), Some("Mentions jwt."));
	assert!(!auth.unscored);
	assert!(deploy.unscored);
	assert!(deploy.rerank_score.is_none());
	assert!((deploy.relevance() - 7.0).abs() < 1e-3);
	assert!(ctx.features.rerank);
	assert_eq!(ctx.degradations, vec![Degradation::RerankUnscored]);
	assert_eq!(harness.llm.calls("relevance_judgment"), 3);
	assert_eq!(harness.metrics.count(RERANK_UNSCORED), 1);

	let logs = harness.logs.wait_for_len(1, LOG_WAIT).await;
	let log = &logs[0];

	assert_eq!(log.retrieved_count, 3);
	assert_eq!(log.final_count, 2);
	assert_eq!(log.unscored_count, 1);
	assert_eq!(log.scores.top_rerank, Some(9.0));
	assert_eq!(log.scores.avg_rerank, Some(5.0));
}

#[tokio::test]
async fn unscored_candidates_rank_on_the_fused_scale() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 4.0)]));
	let notes = seed(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(notes.user_id, QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");
	let order: Vec<Uuid> = ctx.candidates.iter().map(|candidate| candidate.note_id).collect();

	assert_eq!(order, vec![notes.session, notes.deploy, notes.auth]);
	assert_eq!(ctx.candidates.iter().filter(|candidate| candidate.unscored).count(), 2);
}

#[tokio::test]
async fn rerank_can_reject_every_candidate() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("question", 0.5)]));
	let notes = seed(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(notes.user_id, QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert!(ctx.is_empty());
	assert!(ctx.degradations.is_empty());
	assert!(ctx.features.rerank);
}

#[tokio::test]
async fn rerank_is_skipped_when_nothing_was_retrieved() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 9.0)]));
	let _notes = seed(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(Uuid::new_v4(), QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert!(ctx.is_empty());
	assert!(!ctx.features.rerank);
	assert_eq!(harness.llm.calls("relevance_judgment"), 0);
}

#[tokio::test]
async fn rerank_fan_out_is_bounded_by_max_concurrency() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 8.0)]));
	let user_id = Uuid::new_v4();

	harness.embedding.set_vector(QUERY, axis(DIMENSIONS));

	for idx in 0..6 {
		harness.vector.insert(
			user_id,
			NoteChunk::new(Uuid::new_v4(), 0, "JWT notes", "Rotate the JWT signing key."),
			vector_at_cosine(0.9 - idx as f32 * 0.05, DIMENSIONS),
		);
	}

	harness.llm.set_delay(Some(Duration::from_millis(30)));

	let mut cfg = super::config();

	cfg.rerank.max_concurrency = 2;

	let service = harness.service(cfg);
	let ctx = service
		.retrieve_context(
			super::request(user_id, QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert_eq!(harness.llm.calls("relevance_judgment"), 6);
	assert_eq!(harness.llm.max_in_flight(), 2);
	assert_eq!(ctx.candidates.len(), 5);
	assert!(ctx.candidates.iter().all(|candidate| candidate.rerank_score == Some(8.0)));
	assert!(ctx.degradations.is_empty());
}

#[tokio::test]
async fn slow_judgments_time_out_as_unscored() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::judging(&[("jwt", 9.0)]));
	let notes = seed(&harness);

	harness.llm.set_delay(Some(Duration::from_millis(300)));

	let mut cfg = super::config();

	cfg.timeouts.rerank_ms = 20;

	let service = harness.service(cfg);
	let ctx = service
		.retrieve_context(
			super::request(notes.user_id, QUERY, super::options(false, true)),
			&CancellationToken::new(),
		)
		.await
		.expect("Slow judgments must not fail retrieval.");
	let order: Vec<Uuid> = ctx.candidates.iter().map(|candidate| candidate.note_id).collect();

	assert_eq!(order, vec![notes.auth, notes.session, notes.deploy]);
	assert!(ctx.candidates.iter().all(|candidate| candidate.unscored));
	assert!(ctx.candidates.iter().all(|candidate| candidate.rerank_score.is_none()));
	assert_eq!(ctx.degradations, vec![Degradation::RerankUnscored]);
	assert_eq!(harness.metrics.count(RERANK_UNSCORED), 3);
}

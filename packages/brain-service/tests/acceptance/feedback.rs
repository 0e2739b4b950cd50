use std::time::Duration;

use time::{Duration as TimeDuration, OffsetDateTime};
use uuid::Uuid;

use brain_service::{CancellationToken, Error, FeedbackCategory, FeedbackRequest};
use brain_testkit::{Harness, fakes::ScriptedLlm};

use super::{DIMENSIONS, LOG_WAIT, QUERY};

#[tokio::test]
async fn feedback_attaches_to_the_query_log() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	harness.logs.wait_for_len(1, LOG_WAIT).await;
	service
		.submit_feedback(FeedbackRequest {
			log_id: ctx.log_id,
			positive: false,
			category: Some("Not Sure".to_string()),
			comment: Some("  The note is from last year.  ".to_string()),
		})
		.await
		.expect("Feedback failed.");

	let logs = service
		.list_logs_since(OffsetDateTime::now_utc() - TimeDuration::hours(1))
		.await
		.expect("Listing logs failed.");
	let feedback = logs[0].feedback.as_ref().expect("Feedback was not stored.");

	assert!(!feedback.positive);
	assert_eq!(feedback.category, Some(FeedbackCategory::Other));
	assert_eq!(feedback.comment.as_deref(), Some("The note is from last year."));
}

#[tokio::test]
async fn feedback_waits_for_a_log_still_being_written() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);

	harness.logs.set_append_delay(Some(Duration::from_millis(100)));

	let service = harness.service(super::config());
	let ctx = service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert!(harness.logs.logs().is_empty());

	service
		.submit_feedback(FeedbackRequest {
			log_id: ctx.log_id,
			positive: true,
			category: Some("helpful".to_string()),
			comment: None,
		})
		.await
		.expect("Feedback for a pending log failed.");

	let logs = harness.logs.logs();

	assert_eq!(logs.len(), 1);
	assert!(logs[0].feedback.as_ref().is_some_and(|feedback| feedback.positive));
}

#[tokio::test]
async fn feedback_for_an_unknown_log_is_not_found() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let service = harness.service(super::config());
	let result = service
		.submit_feedback(FeedbackRequest {
			log_id: Uuid::new_v4(),
			positive: true,
			category: Some("helpful".to_string()),
			comment: None,
		})
		.await;

	assert!(matches!(result, Err(Error::NotFound { .. })));
}

#[tokio::test]
async fn correlation_buckets_logs_by_top_cosine() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let service = harness.service(super::config());
	let since = OffsetDateTime::now_utc() - TimeDuration::minutes(5);
	let mut log_ids = Vec::new();

	for _ in 0..2 {
		let ctx = service
			.retrieve_context(
				super::request(seeded.user_id, QUERY, super::options(false, false)),
				&CancellationToken::new(),
			)
			.await
			.expect("Retrieval failed.");

		log_ids.push(ctx.log_id);
	}

	harness.logs.wait_for_len(2, LOG_WAIT).await;
	service
		.submit_feedback(FeedbackRequest {
			log_id: log_ids[0],
			positive: true,
			category: Some("helpful".to_string()),
			comment: None,
		})
		.await
		.expect("Feedback failed.");

	let report = service.correlate_feedback(since).await.expect("Correlation failed.");
	let top_band = report.cosine.bands.last().expect("Missing bands.");

	assert_eq!(report.logs_considered, 2);
	assert_eq!(report.logs_with_feedback, 1);
	assert_eq!(report.positive_rate, Some(1.0));
	assert_eq!(top_band.total, 2);
	assert_eq!(top_band.with_feedback, 1);
	assert_eq!(top_band.positives, 1);
	assert!(report.rerank.bands.iter().all(|band| band.total == 0));
}

#[tokio::test]
async fn disabled_analytics_writes_no_logs() {
	let harness = Harness::new(DIMENSIONS, ScriptedLlm::unavailable());
	let seeded = super::seed_auth_and_grocery(&harness);
	let mut cfg = super::config();

	cfg.analytics.enabled = false;

	let service = harness.service(cfg);

	service
		.retrieve_context(
			super::request(seeded.user_id, QUERY, super::options(false, false)),
			&CancellationToken::new(),
		)
		.await
		.expect("Retrieval failed.");

	assert!(harness.logs.wait_for_len(1, Duration::from_millis(200)).await.is_empty());
}

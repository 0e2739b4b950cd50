use std::{
	collections::HashSet,
	sync::{Arc, Mutex, MutexGuard},
	time::Duration,
};

use serde::Serialize;
use time::OffsetDateTime;
use tokio::{sync::Notify, task::JoinHandle};
use uuid::Uuid;

use brain_config::MAX_RERANK_SCORE;

use crate::{
	QueryLogStore,
	model::{Feedback, FeedbackCategory, QueryLog},
};

/// Persists query logs off the retrieval path.
#[derive(Clone)]
pub struct AnalyticsRecorder {
	store: Arc<dyn QueryLogStore>,
	enabled: bool,
	pending: Arc<PendingLogs>,
}
impl AnalyticsRecorder {
	pub fn new(store: Arc<dyn QueryLogStore>, enabled: bool) -> Self {
		Self { store, enabled, pending: Arc::new(PendingLogs::default()) }
	}

	/// Spawns the append and returns immediately. Failures are logged and dropped.
	pub fn record(&self, log: QueryLog) -> Option<JoinHandle<()>> {
		if !self.enabled {
			return None;
		}

		let store = self.store.clone();
		let pending = self.pending.clone();

		pending.ids().insert(log.log_id);

		Some(tokio::spawn(async move {
			let log_id = log.log_id;

			if let Err(err) = store.append(&log).await {
				tracing::warn!(error = %err, %log_id, "Failed to persist query log.");
			}

			pending.ids().remove(&log_id);
			pending.settled.notify_waiters();
		}))
	}

	/// Whether the append for `log_id` has been spawned but not finished.
	pub fn is_pending(&self, log_id: Uuid) -> bool {
		self.pending.ids().contains(&log_id)
	}

	/// Waits until the append for `log_id` finishes or `timeout` passes.
	pub async fn wait_settled(&self, log_id: Uuid, timeout: Duration) {
		let deadline = tokio::time::Instant::now() + timeout;

		loop {
			let settled = self.pending.settled.notified();

			if !self.is_pending(log_id) {
				return;
			}
			if tokio::time::timeout_at(deadline, settled).await.is_err() {
				tracing::debug!(%log_id, "Query log append still pending.");

				return;
			}
		}
	}
}

#[derive(Default)]
struct PendingLogs {
	ids: Mutex<HashSet<Uuid>>,
	settled: Notify,
}
impl PendingLogs {
	fn ids(&self) -> MutexGuard<'_, HashSet<Uuid>> {
		self.ids.lock().unwrap_or_else(|err| err.into_inner())
	}
}

/// Builds a feedback record: unknown categories become `other`, blank comments are dropped, and
/// long comments are cut at `max_comment_chars`.
pub fn normalize_feedback(
	positive: bool,
	category: Option<&str>,
	comment: Option<&str>,
	max_comment_chars: usize,
	now: OffsetDateTime,
) -> Feedback {
	let category =
		category.map(str::trim).filter(|raw| !raw.is_empty()).map(FeedbackCategory::parse);
	let comment = comment
		.map(str::trim)
		.filter(|text| !text.is_empty())
		.map(|text| text.chars().take(max_comment_chars).collect::<String>());

	Feedback { positive, category, comment, submitted_at: now }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandStats {
	pub lower: f32,
	pub upper: f32,
	pub total: u32,
	pub with_feedback: u32,
	pub positives: u32,
	pub positive_rate: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreCorrelation {
	pub bands: Vec<BandStats>,
	/// Pearson correlation between the score and the thumbs-up indicator.
	pub pearson: Option<f32>,
	/// Lowest band edge whose positive rate reaches the target.
	pub suggested_threshold: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedbackCorrelation {
	pub logs_considered: u32,
	pub logs_with_feedback: u32,
	pub positive_rate: Option<f32>,
	pub cosine: ScoreCorrelation,
	pub rerank: ScoreCorrelation,
}

/// Correlates top cosine and top rerank scores with user feedback. Rerank bands reuse the cosine
/// edges scaled onto the 0-10 range.
pub fn correlate_feedback(
	logs: &[QueryLog],
	band_edges: &[f32],
	target_positive_rate: f32,
) -> FeedbackCorrelation {
	let rerank_edges: Vec<f32> = band_edges.iter().map(|edge| edge * MAX_RERANK_SCORE).collect();
	let with_feedback: Vec<&QueryLog> = logs.iter().filter(|log| log.feedback.is_some()).collect();
	let positives = with_feedback.iter().filter(|log| is_positive(log)).count() as u32;

	FeedbackCorrelation {
		logs_considered: logs.len() as u32,
		logs_with_feedback: with_feedback.len() as u32,
		positive_rate: rate(positives, with_feedback.len() as u32),
		cosine: correlate(logs, band_edges, target_positive_rate, |log| log.scores.top_cosine),
		rerank: correlate(logs, &rerank_edges, target_positive_rate, |log| log.scores.top_rerank),
	}
}

fn correlate<F>(logs: &[QueryLog], edges: &[f32], target: f32, score_of: F) -> ScoreCorrelation
where
	F: Fn(&QueryLog) -> Option<f32>,
{
	let mut bands: Vec<BandStats> = edges
		.windows(2)
		.map(|pair| BandStats {
			lower: pair[0],
			upper: pair[1],
			total: 0,
			with_feedback: 0,
			positives: 0,
			positive_rate: None,
		})
		.collect();
	let mut pairs = Vec::new();

	for log in logs {
		let Some(score) = score_of(log).filter(|score| score.is_finite()) else {
			continue;
		};
		let Some(idx) = band_index(edges, score) else {
			continue;
		};
		let band = &mut bands[idx];

		band.total += 1;

		if log.feedback.is_some() {
			let positive = is_positive(log);

			band.with_feedback += 1;

			if positive {
				band.positives += 1;
			}

			pairs.push((score, if positive { 1.0 } else { 0.0 }));
		}
	}

	for band in &mut bands {
		band.positive_rate = rate(band.positives, band.with_feedback);
	}

	let suggested_threshold = bands
		.iter()
		.find(|band| band.positive_rate.is_some_and(|rate| rate >= target))
		.map(|band| band.lower);

	ScoreCorrelation { bands, pearson: pearson(&pairs), suggested_threshold }
}

/// Bands are half-open `[lower, upper)` except the last, which includes its upper edge. Scores
/// outside the edges are clamped into the first or last band.
fn band_index(edges: &[f32], score: f32) -> Option<usize> {
	let band_count = edges.len().checked_sub(1).filter(|count| *count > 0)?;
	let idx = edges[1..band_count].iter().take_while(|edge| score >= **edge).count();

	Some(idx.min(band_count - 1))
}

fn pearson(pairs: &[(f32, f32)]) -> Option<f32> {
	if pairs.len() < 2 {
		return None;
	}

	let n = pairs.len() as f64;
	let mean_x = pairs.iter().map(|(x, _)| *x as f64).sum::<f64>() / n;
	let mean_y = pairs.iter().map(|(_, y)| *y as f64).sum::<f64>() / n;
	let mut cov = 0.0;
	let mut var_x = 0.0;
	let mut var_y = 0.0;

	for (x, y) in pairs {
		let dx = *x as f64 - mean_x;
		let dy = *y as f64 - mean_y;

		cov += dx * dy;
		var_x += dx * dx;
		var_y += dy * dy;
	}

	if var_x == 0.0 || var_y == 0.0 {
		return None;
	}

	Some((cov / (var_x.sqrt() * var_y.sqrt())) as f32)
}

fn is_positive(log: &QueryLog) -> bool {
	log.feedback.as_ref().is_some_and(|feedback| feedback.positive)
}

fn rate(positives: u32, total: u32) -> Option<f32> {
	(total > 0).then(|| positives as f32 / total as f32)
}

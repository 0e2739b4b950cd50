use std::{
	collections::HashSet,
	fs,
	path::{Path, PathBuf},
	time::Instant,
};

use clap::{Parser, Subcommand};
use color_eyre::eyre;
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime, format_description::well_known::Rfc3339};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use brain_config::Config;
use brain_service::{
	CancellationToken, FeedbackCorrelation, RagOptions, RagService, RetrieveRequest,
};

#[derive(Debug, Parser)]
#[command(version, rename_all = "kebab", about = "Offline evaluation for note retrieval.")]
pub struct Args {
	#[command(subcommand)]
	pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
	/// Correlates recorded feedback with retrieval scores over a time window.
	Feedback {
		#[arg(long, short = 'c', value_name = "FILE")]
		config: PathBuf,
		#[arg(long, value_name = "N", default_value_t = 30)]
		days: u32,
	},
	/// Replays a labeled query set and reports ranking quality and latency.
	Dataset {
		#[arg(long, short = 'c', value_name = "FILE")]
		config: PathBuf,
		#[arg(long, short = 'd', value_name = "FILE")]
		dataset: PathBuf,
		#[arg(long, value_name = "N")]
		top_k: Option<u32>,
		/// Persist query logs for replayed queries.
		#[arg(long)]
		record_logs: bool,
	},
}

#[derive(Debug, Deserialize)]
struct EvalDataset {
	name: Option<String>,
	#[serde(default)]
	defaults: EvalDefaults,
	queries: Vec<EvalQuery>,
}

#[derive(Debug, Default, Deserialize)]
struct EvalDefaults {
	user_id: Option<Uuid>,
	options: Option<RagOptions>,
}

#[derive(Debug, Deserialize)]
struct EvalQuery {
	id: Option<String>,
	query: String,
	user_id: Option<Uuid>,
	options: Option<RagOptions>,
	expected_note_ids: Vec<Uuid>,
}

#[derive(Debug, Serialize)]
struct FeedbackOutput {
	config_path: String,
	since: String,
	days: u32,
	report: FeedbackCorrelation,
}

#[derive(Debug, Serialize)]
struct EvalOutput {
	dataset: EvalDatasetInfo,
	settings: EvalSettings,
	summary: EvalSummary,
	queries: Vec<QueryReport>,
}

#[derive(Debug, Serialize)]
struct EvalDatasetInfo {
	name: String,
	query_count: usize,
}

#[derive(Debug, Serialize)]
struct EvalSettings {
	config_path: String,
	top_k: u32,
	record_logs: bool,
}

#[derive(Debug, Serialize)]
struct EvalSummary {
	avg_recall_at_k: f64,
	avg_precision_at_k: f64,
	mean_rr: f64,
	mean_ndcg: f64,
	latency_ms_p50: f64,
	latency_ms_p95: f64,
	degraded_queries: usize,
}

#[derive(Debug, Serialize)]
struct QueryReport {
	id: String,
	query: String,
	log_id: Uuid,
	expected_count: usize,
	retrieved_count: usize,
	relevant_count: usize,
	recall_at_k: f64,
	precision_at_k: f64,
	rr: f64,
	ndcg: f64,
	latency_ms: f64,
	degradations: Vec<&'static str>,
	expected_note_ids: Vec<Uuid>,
	retrieved_note_ids: Vec<Uuid>,
}

#[derive(Debug, Clone)]
struct MergedQuery {
	id: String,
	request: RetrieveRequest,
	expected_note_ids: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Metrics {
	recall_at_k: f64,
	precision_at_k: f64,
	rr: f64,
	ndcg: f64,
	relevant_count: usize,
}

pub async fn run(args: Args) -> color_eyre::Result<()> {
	match args.command {
		Command::Feedback { config, days } => {
			let cfg = load_config(&config)?;
			let service = RagService::connect(cfg).await?;
			let since = OffsetDateTime::now_utc() - Duration::days(i64::from(days));
			let report = service.correlate_feedback(since).await?;
			let output = FeedbackOutput {
				config_path: config.display().to_string(),
				since: since.format(&Rfc3339)?,
				days,
				report,
			};

			print_json(&output)
		},
		Command::Dataset { config, dataset, top_k, record_logs } => {
			let mut cfg = load_config(&config)?;

			cfg.analytics.enabled = record_logs;

			let dataset = load_dataset(&dataset)?;
			let output = eval_dataset(&config, cfg, &dataset, top_k, record_logs).await?;

			print_json(&output)
		},
	}
}

/// Loads the configuration and installs the log subscriber at its level.
fn load_config(path: &Path) -> color_eyre::Result<Config> {
	let cfg = brain_config::load(path)?;
	let filter = EnvFilter::try_new(cfg.service.log_level.as_str())
		.unwrap_or_else(|_| EnvFilter::new("info"));

	tracing_subscriber::fmt().with_env_filter(filter).with_writer(std::io::stderr).init();

	Ok(cfg)
}

fn print_json<T>(output: &T) -> color_eyre::Result<()>
where
	T: Serialize,
{
	let json = serde_json::to_string_pretty(output)?;

	println!("{json}");

	Ok(())
}

fn load_dataset(path: &Path) -> color_eyre::Result<EvalDataset> {
	let raw = fs::read_to_string(path)?;
	let dataset: EvalDataset = serde_json::from_str(&raw)?;

	if dataset.queries.is_empty() {
		return Err(eyre::eyre!("Dataset must include at least one query."));
	}

	Ok(dataset)
}

async fn eval_dataset(
	config_path: &Path,
	cfg: Config,
	dataset: &EvalDataset,
	top_k: Option<u32>,
	record_logs: bool,
) -> color_eyre::Result<EvalOutput> {
	let service = RagService::connect(cfg).await?;
	let mut reports = Vec::with_capacity(dataset.queries.len());
	let mut latencies_ms = Vec::with_capacity(dataset.queries.len());

	for (index, query) in dataset.queries.iter().enumerate() {
		let merged = merge_query(&dataset.defaults, query, &service.cfg.rag, top_k, index)?;
		let expected: HashSet<Uuid> = merged.expected_note_ids.iter().copied().collect();
		let query_text = merged.request.query.clone();
		let start = Instant::now();
		let ctx = service.retrieve_context(merged.request, &CancellationToken::new()).await?;
		let latency_ms = start.elapsed().as_secs_f64() * 1_000.0;
		let retrieved = unique_ids(ctx.candidates.iter().map(|candidate| candidate.note_id));
		let metrics = compute_metrics(&retrieved, &expected);

		tracing::debug!(id = %merged.id, latency_ms, rr = metrics.rr, "Query replayed.");

		reports.push(QueryReport {
			id: merged.id,
			query: query_text,
			log_id: ctx.log_id,
			expected_count: expected.len(),
			retrieved_count: retrieved.len(),
			relevant_count: metrics.relevant_count,
			recall_at_k: metrics.recall_at_k,
			precision_at_k: metrics.precision_at_k,
			rr: metrics.rr,
			ndcg: metrics.ndcg,
			latency_ms,
			degradations: ctx.degradations.iter().map(|degradation| degradation.as_str()).collect(),
			expected_note_ids: merged.expected_note_ids,
			retrieved_note_ids: retrieved,
		});
		latencies_ms.push(latency_ms);
	}

	let summary = summarize(&reports, &latencies_ms);
	let settings = EvalSettings {
		config_path: config_path.display().to_string(),
		top_k: top_k
			.or(dataset.defaults.options.as_ref().map(|options| options.top_k))
			.unwrap_or(service.cfg.rag.top_k),
		record_logs,
	};

	Ok(EvalOutput {
		dataset: EvalDatasetInfo {
			name: dataset.name.clone().unwrap_or_else(|| "eval".to_string()),
			query_count: reports.len(),
		},
		settings,
		summary,
		queries: reports,
	})
}

/// Query fields win over dataset defaults, which win over the configured `[rag]` table. A
/// `--top-k` override applies to every query.
fn merge_query(
	defaults: &EvalDefaults,
	query: &EvalQuery,
	configured: &RagOptions,
	top_k: Option<u32>,
	index: usize,
) -> color_eyre::Result<MergedQuery> {
	let user_id = query
		.user_id
		.or(defaults.user_id)
		.ok_or_else(|| eyre::eyre!("Query {index} has no user_id and the dataset sets none."))?;
	let mut options = query
		.options
		.clone()
		.or_else(|| defaults.options.clone())
		.unwrap_or_else(|| configured.clone());

	if let Some(top_k) = top_k {
		options.top_k = top_k;
	}

	Ok(MergedQuery {
		id: query.id.clone().unwrap_or_else(|| index.to_string()),
		request: RetrieveRequest {
			user_id,
			query: query.query.clone(),
			conversation_id: None,
			options: Some(options),
		},
		expected_note_ids: query.expected_note_ids.clone(),
	})
}

fn unique_ids<I>(iter: I) -> Vec<Uuid>
where
	I: Iterator<Item = Uuid>,
{
	let mut seen = HashSet::new();
	let mut out = Vec::new();

	for id in iter {
		if seen.insert(id) {
			out.push(id);
		}
	}

	out
}

fn compute_metrics(retrieved: &[Uuid], expected: &HashSet<Uuid>) -> Metrics {
	let expected_count = expected.len();
	let mut relevant_count = 0_usize;
	let mut dcg = 0.0_f64;
	let mut first_hit: Option<usize> = None;

	for (idx, id) in retrieved.iter().enumerate() {
		if !expected.contains(id) {
			continue;
		}

		let rank = idx + 1;

		relevant_count += 1;
		dcg += 1.0 / (rank as f64 + 1.0).log2();

		if first_hit.is_none() {
			first_hit = Some(rank);
		}
	}

	let rr = first_hit.map(|rank| 1.0 / rank as f64).unwrap_or(0.0);
	let idcg: f64 = (1..=expected_count.min(retrieved.len()))
		.map(|rank| 1.0 / (rank as f64 + 1.0).log2())
		.sum();
	let ndcg = if idcg > 0.0 { dcg / idcg } else { 0.0 };
	let precision_at_k =
		if retrieved.is_empty() { 0.0 } else { relevant_count as f64 / retrieved.len() as f64 };
	let recall_at_k =
		if expected_count == 0 { 0.0 } else { relevant_count as f64 / expected_count as f64 };

	Metrics { recall_at_k, precision_at_k, rr, ndcg, relevant_count }
}

fn summarize(reports: &[QueryReport], latencies_ms: &[f64]) -> EvalSummary {
	let count = reports.len().max(1) as f64;
	let mut sorted = latencies_ms.to_vec();

	sorted.sort_by(f64::total_cmp);

	EvalSummary {
		avg_recall_at_k: reports.iter().map(|r| r.recall_at_k).sum::<f64>() / count,
		avg_precision_at_k: reports.iter().map(|r| r.precision_at_k).sum::<f64>() / count,
		mean_rr: reports.iter().map(|r| r.rr).sum::<f64>() / count,
		mean_ndcg: reports.iter().map(|r| r.ndcg).sum::<f64>() / count,
		latency_ms_p50: percentile(&sorted, 0.50),
		latency_ms_p95: percentile(&sorted, 0.95),
		degraded_queries: reports.iter().filter(|r| !r.degradations.is_empty()).count(),
	}
}

/// Linear interpolation between closest ranks over already sorted values.
fn percentile(values: &[f64], percentile: f64) -> f64 {
	if values.is_empty() {
		return 0.0;
	}

	let pos = percentile.clamp(0.0, 1.0) * (values.len() as f64 - 1.0);
	let lower = pos.floor() as usize;
	let upper = pos.ceil() as usize;

	if lower == upper {
		return values[lower];
	}

	let weight = pos - lower as f64;

	values[lower] * (1.0 - weight) + values[upper] * weight
}

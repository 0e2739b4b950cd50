use std::{collections::HashSet, time::Duration};

use brain_config::LlmProviderConfig;

use crate::{
	Error, LlmProvider, Result,
	cancel::{self, CancellationToken},
	model::{Degradation, RagOptions},
	structured::{HypotheticalPassage, QueryRewrites, StructuredOutput},
};

const HYDE_SYSTEM_PROMPT: &str = "\
You write short passages that could appear in a person's own notes. Given a question, write one \
passage of two to four sentences that would answer it. Write plain prose without headings, lists, \
or citations.";
const MULTI_QUERY_SYSTEM_PROMPT: &str = "\
You rewrite search questions for a personal note search engine. Produce alternative phrasings \
that keep the original intent but vary vocabulary and specificity. Do not answer the question.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExpansionOptions {
	pub enable_hyde: bool,
	pub enable_multi_query: bool,
	pub multi_query_count: u32,
}
impl ExpansionOptions {
	pub fn is_enabled(&self) -> bool {
		self.enable_hyde || (self.enable_multi_query && self.multi_query_count > 0)
	}
}
impl From<&RagOptions> for ExpansionOptions {
	fn from(options: &RagOptions) -> Self {
		Self {
			enable_hyde: options.enable_hyde,
			enable_multi_query: options.enable_multi_query,
			multi_query_count: options.multi_query_count,
		}
	}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExpansionResult {
	pub hypothetical: Option<String>,
	pub rewrites: Vec<String>,
	pub degradations: Vec<Degradation>,
}

/// Drafts a hypothetical answer and alternative phrasings concurrently.
///
/// Either request may fail or time out on its own; the failure only drops that variant. The only
/// error returned is [`Error::Cancelled`].
pub async fn expand(
	llm: &dyn LlmProvider,
	cfg: &LlmProviderConfig,
	query: &str,
	options: ExpansionOptions,
	timeout: Duration,
	cancel: &CancellationToken,
) -> Result<ExpansionResult> {
	let mut result = ExpansionResult::default();

	if !options.is_enabled() {
		return Ok(result);
	}

	let hyde = async {
		if !options.enable_hyde {
			return None;
		}

		Some(draft_hypothetical(llm, cfg, query, timeout, cancel).await)
	};
	let rewrites = async {
		if !options.enable_multi_query || options.multi_query_count == 0 {
			return None;
		}

		Some(rewrite_query(llm, cfg, query, options.multi_query_count, timeout, cancel).await)
	};
	let (hyde, rewrites) = tokio::join!(hyde, rewrites);

	match hyde {
		Some(Ok(passage)) => result.hypothetical = Some(passage),
		Some(Err(Error::Cancelled)) => return Err(Error::Cancelled),
		Some(Err(err)) => {
			tracing::warn!(error = %err, "HyDE expansion failed; continuing without it.");

			result.degradations.push(Degradation::HydeFailed);
		},
		None => {},
	}
	match rewrites {
		Some(Ok(queries)) => result.rewrites = queries,
		Some(Err(Error::Cancelled)) => return Err(Error::Cancelled),
		Some(Err(err)) => {
			tracing::warn!(error = %err, "Multi-query expansion failed; continuing without it.");

			result.degradations.push(Degradation::MultiQueryFailed);
		},
		None => {},
	}

	Ok(result)
}

async fn draft_hypothetical(
	llm: &dyn LlmProvider,
	cfg: &LlmProviderConfig,
	query: &str,
	timeout: Duration,
	cancel: &CancellationToken,
) -> Result<String> {
	let request = HypotheticalPassage::request(HYDE_SYSTEM_PROMPT, format!("Question: {query}"));
	let value =
		cancel::guard(cancel, "hyde", timeout, llm.generate_structured(cfg, &request)).await?;
	let parsed = HypotheticalPassage::parse(value)?;

	Ok(parsed.passage.trim().to_string())
}

async fn rewrite_query(
	llm: &dyn LlmProvider,
	cfg: &LlmProviderConfig,
	query: &str,
	count: u32,
	timeout: Duration,
	cancel: &CancellationToken,
) -> Result<Vec<String>> {
	let request = QueryRewrites::request(
		MULTI_QUERY_SYSTEM_PROMPT,
		format!("Question: {query}\nReturn exactly {count} alternative phrasings."),
	);
	let value =
		cancel::guard(cancel, "multi_query", timeout, llm.generate_structured(cfg, &request))
			.await?;
	let parsed = QueryRewrites::parse(value)?;

	Ok(clean_rewrites(query, parsed.queries, count as usize))
}

/// Trims, drops blanks and restatements of the original query, dedups case-insensitively, and
/// keeps at most `count`.
pub fn clean_rewrites(original: &str, rewrites: Vec<String>, count: usize) -> Vec<String> {
	let mut seen = HashSet::new();

	seen.insert(original.trim().to_lowercase());

	rewrites
		.into_iter()
		.map(|rewrite| rewrite.trim().to_string())
		.filter(|rewrite| !rewrite.is_empty() && seen.insert(rewrite.to_lowercase()))
		.take(count)
		.collect()
}

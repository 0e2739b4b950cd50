use serde::{Deserialize, de::DeserializeOwned};
use serde_json::Value;

use brain_config::MAX_RERANK_SCORE;
use brain_providers::StructuredRequest;

use crate::{Error, Result};

/// A typed answer an LLM must return instead of free text.
///
/// Schemas are written by hand and close every object with `additionalProperties: false`.
pub trait StructuredOutput
where
	Self: Sized + DeserializeOwned,
{
	const NAME: &'static str;

	fn schema() -> Value;

	fn validate(&self) -> Result<()>;

	fn request(system: &str, user: String) -> StructuredRequest {
		StructuredRequest {
			name: Self::NAME.to_string(),
			system: system.to_string(),
			user,
			schema: Self::schema(),
		}
	}

	fn parse(value: Value) -> Result<Self> {
		let parsed: Self = serde_json::from_value(value).map_err(|err| Error::StructuredOutput {
			message: format!("{} did not match its schema: {err}", Self::NAME),
		})?;

		parsed.validate()?;

		Ok(parsed)
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HypotheticalPassage {
	pub passage: String,
}
impl StructuredOutput for HypotheticalPassage {
	const NAME: &'static str = "hypothetical_passage";

	fn schema() -> Value {
		serde_json::json!({
			"type": "object",
			"additionalProperties": false,
			"properties": {
				"passage": {
					"type": "string",
					"description": "A short passage, written as if from the user's notes, answering the question."
				}
			},
			"required": ["passage"]
		})
	}

	fn validate(&self) -> Result<()> {
		if self.passage.trim().is_empty() {
			return Err(Error::StructuredOutput {
				message: "hypothetical_passage.passage must be non-empty.".to_string(),
			});
		}

		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct QueryRewrites {
	pub queries: Vec<String>,
}
impl StructuredOutput for QueryRewrites {
	const NAME: &'static str = "query_rewrites";

	fn schema() -> Value {
		serde_json::json!({
			"type": "object",
			"additionalProperties": false,
			"properties": {
				"queries": {
					"type": "array",
					"items": { "type": "string" },
					"description": "Alternative phrasings of the question."
				}
			},
			"required": ["queries"]
		})
	}

	fn validate(&self) -> Result<()> {
		if self.queries.iter().all(|query| query.trim().is_empty()) {
			return Err(Error::StructuredOutput {
				message: "query_rewrites.queries must contain at least one non-empty query."
					.to_string(),
			});
		}

		Ok(())
	}
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct RelevanceJudgment {
	pub score: f32,
	#[serde(default)]
	pub reasoning: String,
}
impl StructuredOutput for RelevanceJudgment {
	const NAME: &'static str = "relevance_judgment";

	fn schema() -> Value {
		serde_json::json!({
			"type": "object",
			"additionalProperties": false,
			"properties": {
				"score": {
					"type": "number",
					"minimum": 0,
					"maximum": MAX_RERANK_SCORE,
					"description": "0 means unrelated, 10 means the passage directly answers the question."
				},
				"reasoning": {
					"type": "string",
					"description": "One or two sentences explaining the score."
				}
			},
			"required": ["score", "reasoning"]
		})
	}

	fn validate(&self) -> Result<()> {
		if !self.score.is_finite() || !(0.0..=MAX_RERANK_SCORE).contains(&self.score) {
			return Err(Error::StructuredOutput {
				message: format!("relevance_judgment.score {} is outside 0-10.", self.score),
			});
		}

		Ok(())
	}
}

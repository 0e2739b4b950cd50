use std::time::Duration;

use reqwest::Client;
use serde::Serialize;
use serde_json::Value;

use crate::{
	AuthScheme, Error, Result,
	retry::{self, RetryPolicy},
};
use brain_config::{LlmProviderConfig, LlmVendor};

const MAX_PARSE_ATTEMPTS: usize = 2;

/// One structured-output call: the model must answer with a JSON value that satisfies `schema`.
#[derive(Debug, Clone, Serialize)]
pub struct StructuredRequest {
	pub name: String,
	pub system: String,
	pub user: String,
	pub schema: Value,
}

pub async fn generate_structured(
	cfg: &LlmProviderConfig,
	request: &StructuredRequest,
) -> Result<Value> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = crate::endpoint_url(
		&cfg.api_base,
		cfg.path.as_deref(),
		default_path(cfg.vendor),
		&cfg.model,
	);
	let headers =
		crate::auth_headers(auth_scheme(cfg.vendor), cfg.api_key.as_deref(), &cfg.default_headers)?;
	let body = build_request_body(cfg, request);
	let policy = RetryPolicy::new(cfg.max_retries, cfg.retry_backoff_ms);
	let mut last_err = None;

	for _ in 0..MAX_PARSE_ATTEMPTS {
		let json = retry::post_json(&client, &url, &headers, &body, policy).await?;

		match parse_structured_response(cfg.vendor, &request.name, json) {
			Ok(value) => return Ok(value),
			Err(err) => {
				tracing::debug!(
					error = %err,
					output = %request.name,
					"Structured output rejected."
				);

				last_err = Some(err);
			},
		}
	}

	Err(last_err.unwrap_or_else(|| Error::InvalidResponse {
		message: "Structured output response was empty.".to_string(),
	}))
}

fn default_path(vendor: LlmVendor) -> &'static str {
	match vendor {
		LlmVendor::OpenAi => "/v1/chat/completions",
		LlmVendor::Anthropic => "/v1/messages",
		LlmVendor::Gemini => "/v1beta/models/{model}:generateContent",
		LlmVendor::Ollama => "/api/chat",
	}
}

fn auth_scheme(vendor: LlmVendor) -> AuthScheme {
	match vendor {
		LlmVendor::OpenAi | LlmVendor::Ollama => AuthScheme::Bearer,
		LlmVendor::Anthropic => AuthScheme::AnthropicApiKey,
		LlmVendor::Gemini => AuthScheme::GoogApiKey,
	}
}

fn build_request_body(cfg: &LlmProviderConfig, request: &StructuredRequest) -> Value {
	match cfg.vendor {
		LlmVendor::OpenAi => serde_json::json!({
			"model": cfg.model,
			"temperature": cfg.temperature,
			"max_tokens": cfg.max_output_tokens,
			"messages": [
				{ "role": "system", "content": request.system },
				{ "role": "user", "content": request.user },
			],
			"response_format": {
				"type": "json_schema",
				"json_schema": {
					"name": request.name,
					"strict": true,
					"schema": request.schema,
				},
			},
		}),
		LlmVendor::Anthropic => serde_json::json!({
			"model": cfg.model,
			"temperature": cfg.temperature,
			"max_tokens": cfg.max_output_tokens,
			"system": request.system,
			"messages": [{ "role": "user", "content": request.user }],
			"tools": [{
				"name": request.name,
				"description": format!("Record the {} answer.", request.name),
				"input_schema": request.schema,
			}],
			"tool_choice": { "type": "tool", "name": request.name },
		}),
		LlmVendor::Gemini => serde_json::json!({
			"systemInstruction": { "parts": [{ "text": request.system }] },
			"contents": [{ "role": "user", "parts": [{ "text": request.user }] }],
			"generationConfig": {
				"temperature": cfg.temperature,
				"maxOutputTokens": cfg.max_output_tokens,
				"responseMimeType": "application/json",
				"responseSchema": strip_additional_properties(request.schema.clone()),
			},
		}),
		LlmVendor::Ollama => serde_json::json!({
			"model": cfg.model,
			"stream": false,
			"format": request.schema,
			"options": { "temperature": cfg.temperature },
			"messages": [
				{ "role": "system", "content": request.system },
				{ "role": "user", "content": request.user },
			],
		}),
	}
}

/// Gemini's response-schema dialect rejects `additionalProperties`, so it is removed at every
/// depth before the schema is sent.
pub fn strip_additional_properties(mut schema: Value) -> Value {
	match &mut schema {
		Value::Object(map) => {
			map.remove("additionalProperties");

			for value in map.values_mut() {
				*value = strip_additional_properties(value.take());
			}
		},
		Value::Array(items) =>
			for item in items.iter_mut() {
				*item = strip_additional_properties(item.take());
			},
		_ => {},
	}

	schema
}

fn parse_structured_response(vendor: LlmVendor, name: &str, json: Value) -> Result<Value> {
	match vendor {
		LlmVendor::OpenAi => {
			let content = json
				.get("choices")
				.and_then(|v| v.as_array())
				.and_then(|arr| arr.first())
				.and_then(|choice| choice.get("message"))
				.and_then(|msg| msg.get("content"))
				.and_then(|c| c.as_str())
				.ok_or_else(|| missing("choices[0].message.content"))?;

			parse_json_text(content)
		},
		LlmVendor::Anthropic => {
			let blocks = json
				.get("content")
				.and_then(|v| v.as_array())
				.ok_or_else(|| missing("content"))?;

			blocks
				.iter()
				.find(|block| {
					block.get("type").and_then(|t| t.as_str()) == Some("tool_use")
						&& block.get("name").and_then(|n| n.as_str()) == Some(name)
				})
				.and_then(|block| block.get("input"))
				.cloned()
				.ok_or_else(|| missing("tool_use input"))
		},
		LlmVendor::Gemini => {
			let text = json
				.get("candidates")
				.and_then(|v| v.as_array())
				.and_then(|arr| arr.first())
				.and_then(|candidate| candidate.get("content"))
				.and_then(|content| content.get("parts"))
				.and_then(|parts| parts.as_array())
				.and_then(|parts| parts.first())
				.and_then(|part| part.get("text"))
				.and_then(|t| t.as_str())
				.ok_or_else(|| missing("candidates[0].content.parts[0].text"))?;

			parse_json_text(text)
		},
		LlmVendor::Ollama => {
			let content = json
				.get("message")
				.and_then(|msg| msg.get("content"))
				.and_then(|c| c.as_str())
				.ok_or_else(|| missing("message.content"))?;

			parse_json_text(content)
		},
	}
}

fn parse_json_text(text: &str) -> Result<Value> {
	let trimmed = text.trim();
	let unfenced = trimmed
		.strip_prefix("```json")
		.or_else(|| trimmed.strip_prefix("```"))
		.and_then(|rest| rest.strip_suffix("```"))
		.unwrap_or(trimmed)
		.trim();
	let value: Value = serde_json::from_str(unfenced).map_err(|_| Error::InvalidResponse {
		message: "Structured output content is not valid JSON.".to_string(),
	})?;

	if !value.is_object() {
		return Err(Error::InvalidResponse {
			message: "Structured output must be a JSON object.".to_string(),
		});
	}

	Ok(value)
}

fn missing(field: &str) -> Error {
	Error::InvalidResponse { message: format!("Structured output response is missing {field}.") }
}

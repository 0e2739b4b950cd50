use std::time::Duration;

use reqwest::Client;
use serde_json::Value;

use crate::{
	AuthScheme, Error, Result,
	retry::{self, RetryPolicy},
};
use brain_config::{EmbeddingProviderConfig, EmbeddingVendor};

pub async fn embed(cfg: &EmbeddingProviderConfig, texts: &[String]) -> Result<Vec<Vec<f32>>> {
	if texts.is_empty() {
		return Ok(Vec::new());
	}

	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = crate::endpoint_url(
		&cfg.api_base,
		cfg.path.as_deref(),
		default_path(cfg.vendor),
		&cfg.model,
	);
	let headers =
		crate::auth_headers(auth_scheme(cfg.vendor), cfg.api_key.as_deref(), &cfg.default_headers)?;
	let body = build_embedding_body(cfg, texts);
	let policy = RetryPolicy::new(cfg.max_retries, cfg.retry_backoff_ms);
	let json = retry::post_json(&client, &url, &headers, &body, policy).await?;
	let vectors = parse_embedding_response(cfg.vendor, json)?;

	if vectors.len() != texts.len() {
		return Err(Error::InvalidResponse {
			message: format!(
				"Embedding provider returned {} vectors for {} inputs.",
				vectors.len(),
				texts.len()
			),
		});
	}

	Ok(vectors)
}

fn default_path(vendor: EmbeddingVendor) -> &'static str {
	match vendor {
		EmbeddingVendor::OpenAi => "/v1/embeddings",
		EmbeddingVendor::Gemini => "/v1beta/models/{model}:batchEmbedContents",
		EmbeddingVendor::Ollama => "/api/embed",
	}
}

fn auth_scheme(vendor: EmbeddingVendor) -> AuthScheme {
	match vendor {
		EmbeddingVendor::OpenAi | EmbeddingVendor::Ollama => AuthScheme::Bearer,
		EmbeddingVendor::Gemini => AuthScheme::GoogApiKey,
	}
}

fn build_embedding_body(cfg: &EmbeddingProviderConfig, texts: &[String]) -> Value {
	match cfg.vendor {
		EmbeddingVendor::OpenAi => serde_json::json!({
			"model": cfg.model,
			"input": texts,
			"dimensions": cfg.dimensions,
		}),
		EmbeddingVendor::Gemini => {
			let model = format!("models/{}", cfg.model);
			let requests: Vec<Value> = texts
				.iter()
				.map(|text| {
					serde_json::json!({
						"model": model,
						"content": { "parts": [{ "text": text }] },
						"outputDimensionality": cfg.dimensions,
					})
				})
				.collect();

			serde_json::json!({ "requests": requests })
		},
		EmbeddingVendor::Ollama => serde_json::json!({
			"model": cfg.model,
			"input": texts,
		}),
	}
}

fn parse_embedding_response(vendor: EmbeddingVendor, json: Value) -> Result<Vec<Vec<f32>>> {
	match vendor {
		EmbeddingVendor::OpenAi => parse_openai_response(json),
		EmbeddingVendor::Gemini => {
			let items = json.get("embeddings").and_then(|v| v.as_array()).ok_or_else(|| {
				Error::InvalidResponse {
					message: "Embedding response is missing embeddings array.".to_string(),
				}
			})?;

			items
				.iter()
				.map(|item| {
					item.get("values").map(parse_vector).unwrap_or_else(|| {
						Err(Error::InvalidResponse {
							message: "Embedding item missing values array.".to_string(),
						})
					})
				})
				.collect()
		},
		EmbeddingVendor::Ollama => {
			let items = json.get("embeddings").and_then(|v| v.as_array()).ok_or_else(|| {
				Error::InvalidResponse {
					message: "Embedding response is missing embeddings array.".to_string(),
				}
			})?;

			items.iter().map(parse_vector).collect()
		},
	}
}

fn parse_openai_response(json: Value) -> Result<Vec<Vec<f32>>> {
	let data = json.get("data").and_then(|v| v.as_array()).ok_or_else(|| {
		Error::InvalidResponse { message: "Embedding response is missing data array.".to_string() }
	})?;
	let mut indexed: Vec<(usize, Vec<f32>)> = Vec::with_capacity(data.len());

	for (fallback_index, item) in data.iter().enumerate() {
		let index = item
			.get("index")
			.and_then(|v| v.as_u64())
			.map(|v| v as usize)
			.unwrap_or(fallback_index);
		let embedding = item.get("embedding").ok_or_else(|| Error::InvalidResponse {
			message: "Embedding item missing embedding array.".to_string(),
		})?;

		indexed.push((index, parse_vector(embedding)?));
	}

	indexed.sort_by_key(|(index, _)| *index);

	Ok(indexed.into_iter().map(|(_, vec)| vec).collect())
}

fn parse_vector(value: &Value) -> Result<Vec<f32>> {
	let values = value.as_array().ok_or_else(|| Error::InvalidResponse {
		message: "Embedding must be a numeric array.".to_string(),
	})?;
	let mut vec = Vec::with_capacity(values.len());

	for value in values {
		let number = value.as_f64().ok_or_else(|| Error::InvalidResponse {
			message: "Embedding value must be numeric.".to_string(),
		})?;

		vec.push(number as f32);
	}

	Ok(vec)
}

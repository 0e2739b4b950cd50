pub mod embedding;
pub mod llm;

mod error;
mod retry;

pub use error::{Error, Result};
pub use llm::StructuredRequest;

use reqwest::header::{AUTHORIZATION, HeaderMap, HeaderName, HeaderValue};
use serde_json::{Map, Value};

const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthScheme {
	Bearer,
	GoogApiKey,
	AnthropicApiKey,
}

pub fn auth_headers(
	scheme: AuthScheme,
	api_key: Option<&str>,
	default_headers: &Map<String, Value>,
) -> Result<HeaderMap> {
	let mut headers = HeaderMap::new();

	if let Some(key) = api_key {
		match scheme {
			AuthScheme::Bearer => {
				headers.insert(AUTHORIZATION, format!("Bearer {key}").parse()?);
			},
			AuthScheme::GoogApiKey => {
				headers.insert(HeaderName::from_static("x-goog-api-key"), key.parse()?);
			},
			AuthScheme::AnthropicApiKey => {
				headers.insert(HeaderName::from_static("x-api-key"), key.parse()?);
			},
		}
	}
	if scheme == AuthScheme::AnthropicApiKey {
		headers.insert(
			HeaderName::from_static("anthropic-version"),
			HeaderValue::from_static(ANTHROPIC_VERSION),
		);
	}

	for (key, value) in default_headers {
		let Some(raw) = value.as_str() else {
			return Err(Error::InvalidConfig {
				message: "Default header values must be strings.".to_string(),
			});
		};

		headers.insert(HeaderName::from_bytes(key.as_bytes())?, raw.parse()?);
	}

	Ok(headers)
}

pub(crate) fn endpoint_url(
	api_base: &str,
	path: Option<&str>,
	default_path: &str,
	model: &str,
) -> String {
	let path = path.unwrap_or(default_path).replace("{model}", model);

	format!("{api_base}{path}")
}

use std::time::Duration;

use reqwest::{
	Client, StatusCode,
	header::{HeaderMap, RETRY_AFTER},
};
use serde_json::Value;

use crate::{Error, Result};

const MAX_BACKOFF: Duration = Duration::from_secs(8);
const MAX_ERROR_BODY_CHARS: usize = 512;

#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
	pub(crate) max_retries: u32,
	pub(crate) initial_backoff: Duration,
}
impl RetryPolicy {
	pub(crate) fn new(max_retries: u32, initial_backoff_ms: u64) -> Self {
		Self { max_retries, initial_backoff: Duration::from_millis(initial_backoff_ms) }
	}

	pub(crate) fn delay_for(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
		let computed = self.initial_backoff.saturating_mul(2_u32.saturating_pow(attempt));

		retry_after.unwrap_or(computed).min(MAX_BACKOFF)
	}
}

pub(crate) async fn post_json(
	client: &Client,
	url: &str,
	headers: &HeaderMap,
	body: &Value,
	policy: RetryPolicy,
) -> Result<Value> {
	let mut attempt = 0_u32;

	loop {
		let res = client.post(url).headers(headers.clone()).json(body).send().await?;
		let status = res.status();

		if status.is_success() {
			return Ok(res.json().await?);
		}
		if is_transient(status) {
			if attempt >= policy.max_retries {
				return Err(Error::RateLimited { status: status.as_u16(), attempts: attempt + 1 });
			}

			let delay = policy.delay_for(attempt, parse_retry_after(res.headers()));

			tracing::warn!(
				status = status.as_u16(),
				attempt,
				delay_ms = delay.as_millis() as u64,
				"Provider throttled the request; backing off."
			);
			tokio::time::sleep(delay).await;

			attempt += 1;

			continue;
		}

		let body = res.text().await.unwrap_or_default();

		return Err(Error::Status {
			status: status.as_u16(),
			body: body.chars().take(MAX_ERROR_BODY_CHARS).collect(),
		});
	}
}

pub(crate) fn is_transient(status: StatusCode) -> bool {
	matches!(status, StatusCode::TOO_MANY_REQUESTS | StatusCode::SERVICE_UNAVAILABLE)
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
	let raw = headers.get(RETRY_AFTER)?.to_str().ok()?;
	let secs: f64 = raw.trim().parse().ok()?;

	if !secs.is_finite() || secs < 0.0 {
		return None;
	}

	Some(Duration::from_secs_f64(secs))
}

use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Error, Result};

const MAX_ATTEMPTS: usize = 3;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GeneratedAnswer {
	pub answer: String,
	/// Segment or document ids the model cited. Empty when the model answered in plain text.
	#[serde(default)]
	pub citations: Vec<String>,
}

/// Sends a chat completion request and parses the first choice into an answer.
///
/// Responses whose content is missing are retried; transport and status errors are not.
pub async fn generate(
	cfg: &sift_config::LlmProviderConfig,
	messages: &[Value],
) -> Result<GeneratedAnswer> {
	let client = Client::builder().timeout(Duration::from_millis(cfg.timeout_ms)).build()?;
	let url = crate::endpoint(&cfg.api_base, &cfg.path);
	let body = serde_json::json!({
		"model": cfg.model,
		"temperature": cfg.temperature,
		"messages": messages,
	});

	for _ in 0..MAX_ATTEMPTS {
		let res = client
			.post(&url)
			.headers(crate::auth_headers(&cfg.api_key, &cfg.default_headers)?)
			.json(&body)
			.send()
			.await?;
		let json: Value = res.error_for_status()?.json().await?;

		if let Ok(parsed) = parse_generation_response(&json) {
			return Ok(parsed);
		}
	}

	Err(Error::InvalidResponse {
		message: format!("Generation response had no content after {MAX_ATTEMPTS} attempts."),
	})
}

fn parse_generation_response(json: &Value) -> Result<GeneratedAnswer> {
	let content = json
		.get("choices")
		.and_then(|v| v.as_array())
		.and_then(|arr| arr.first())
		.and_then(|choice| choice.get("message"))
		.and_then(|msg| msg.get("content"))
		.and_then(|c| c.as_str())
		.map(str::trim)
		.filter(|c| !c.is_empty())
		.ok_or_else(|| Error::InvalidResponse {
			message: "Generation response is missing message content.".to_string(),
		})?;

	// Structured output is preferred; anything else is taken as the answer text.
	if let Ok(structured) = serde_json::from_str::<GeneratedAnswer>(content) {
		return Ok(structured);
	}

	Ok(GeneratedAnswer { answer: content.to_string(), citations: Vec::new() })
}

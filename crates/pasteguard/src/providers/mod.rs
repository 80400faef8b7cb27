use std::time::Duration;

use secrecy::ExposeSecret;
use tracing::debug;

use crate::config::{ProviderConfig, ProviderType};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
/// Whole-response deadline for buffered calls; streams get no deadline
/// beyond the connect timeout since LLM responses run minutes-class.
const RESPONSE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
	#[error("provider request failed: {0}")]
	Transport(#[from] reqwest::Error),
}

/// Shared outbound HTTP client for the configured providers. The provider
/// is a black box that takes a chat request body and returns JSON or SSE.
#[derive(Debug, Clone)]
pub struct ProviderClient {
	http: reqwest::Client,
}

impl Default for ProviderClient {
	fn default() -> Self {
		Self::new()
	}
}

impl ProviderClient {
	pub fn new() -> Self {
		let http = reqwest::Client::builder()
			.connect_timeout(CONNECT_TIMEOUT)
			.build()
			.expect("client construction only fails on invalid TLS config");
		Self { http }
	}

	/// Forward a chat body to the provider's completion endpoint, with the
	/// provider's own auth header convention.
	pub async fn send_chat(
		&self,
		provider: &ProviderConfig,
		body: Vec<u8>,
		streaming: bool,
	) -> Result<reqwest::Response, ProviderError> {
		let url = format!(
			"{}{}",
			provider.base_url.trim_end_matches('/'),
			endpoint_path(provider.r#type)
		);
		debug!(url = %url, streaming, "forwarding chat request");
		let mut req = self
			.http
			.post(&url)
			.header(http::header::CONTENT_TYPE, "application/json");
		if let Some(key) = &provider.api_key {
			req = match provider.r#type {
				ProviderType::Openai => {
					req.header(
						http::header::AUTHORIZATION,
						format!("Bearer {}", key.expose_secret()),
					)
				},
				ProviderType::Anthropic => req
					.header("x-api-key", key.expose_secret())
					.header("anthropic-version", "2023-06-01"),
			};
		} else if provider.r#type == ProviderType::Anthropic {
			req = req.header("anthropic-version", "2023-06-01");
		}
		if !streaming {
			req = req.timeout(RESPONSE_TIMEOUT);
		}
		Ok(req.body(body).send().await?)
	}
}

fn endpoint_path(provider_type: ProviderType) -> &'static str {
	match provider_type {
		ProviderType::Openai => "/chat/completions",
		ProviderType::Anthropic => "/messages",
	}
}

#[cfg(test)]
mod tests {
	use serde_json::json;
	use wiremock::matchers::{header, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;

	fn provider(server: &MockServer, t: ProviderType, key: Option<&str>) -> ProviderConfig {
		ProviderConfig {
			r#type: t,
			base_url: format!("{}/v1", server.uri()),
			api_key: key.map(|k| k.to_string().into()),
			model: None,
		}
	}

	#[tokio::test]
	async fn openai_gets_bearer_auth() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.and(header("authorization", "Bearer sk-test"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
			.expect(1)
			.mount(&server)
			.await;

		let client = ProviderClient::new();
		let resp = client
			.send_chat(
				&provider(&server, ProviderType::Openai, Some("sk-test")),
				b"{}".to_vec(),
				false,
			)
			.await
			.unwrap();
		assert!(resp.status().is_success());
	}

	#[tokio::test]
	async fn anthropic_gets_api_key_and_version() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/messages"))
			.and(header("x-api-key", "key-123"))
			.and(header("anthropic-version", "2023-06-01"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"content": []})))
			.expect(1)
			.mount(&server)
			.await;

		let client = ProviderClient::new();
		let resp = client
			.send_chat(
				&provider(&server, ProviderType::Anthropic, Some("key-123")),
				b"{}".to_vec(),
				false,
			)
			.await
			.unwrap();
		assert!(resp.status().is_success());
	}

	#[tokio::test]
	async fn keyless_local_provider_needs_no_auth() {
		let server = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/v1/chat/completions"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"choices": []})))
			.expect(1)
			.mount(&server)
			.await;

		let client = ProviderClient::new();
		let resp = client
			.send_chat(
				&provider(&server, ProviderType::Openai, None),
				b"{}".to_vec(),
				true,
			)
			.await
			.unwrap();
		assert!(resp.status().is_success());
	}
}

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::PiiDetectionConfig;
use crate::detect::span::{ScoredEntity, slice_chars};
use crate::extract::TextSpan;

const ANALYZE_TIMEOUT: Duration = Duration::from_secs(30);

/// The marker a Presidio-style analyzer puts in its 4xx body when asked for
/// a language it has no recognizers for.
const NO_RECOGNIZERS_MARKER: &str = "No matching recognizers";

#[derive(thiserror::Error, Debug)]
pub enum PiiError {
	#[error("analyzer request failed: {0}")]
	Transport(#[from] reqwest::Error),
	#[error("analyzer returned status {0}")]
	Status(reqwest::StatusCode),
}

#[derive(Debug, Serialize)]
struct AnalyzeRequest<'a> {
	text: &'a str,
	language: &'a str,
	#[serde(skip_serializing_if = "Option::is_none")]
	entities: Option<&'a [String]>,
	score_threshold: f64,
}

#[derive(Debug, Deserialize)]
struct AnalyzeFinding {
	entity_type: String,
	start: usize,
	end: usize,
	score: f64,
}

/// Per-request PII findings, aligned index-for-index with the extracted
/// spans.
#[derive(Debug, Clone, Default)]
pub struct PiiResult {
	pub span_entities: Vec<Vec<ScoredEntity>>,
}

impl PiiResult {
	pub fn detected(&self) -> bool {
		self.span_entities.iter().any(|e| !e.is_empty())
	}

	pub fn empty(span_count: usize) -> Self {
		Self {
			span_entities: vec![Vec::new(); span_count],
		}
	}
}

/// HTTP client for the external analyzer service. The analyzer is a black
/// box; all the proxy knows is `/analyze` and `/health`.
#[derive(Debug, Clone)]
pub struct AnalyzerClient {
	http: reqwest::Client,
	base_url: String,
}

impl AnalyzerClient {
	pub fn new(base_url: &str) -> Self {
		let http = reqwest::Client::builder()
			.timeout(ANALYZE_TIMEOUT)
			.build()
			.expect("client construction only fails on invalid TLS config");
		Self {
			http,
			base_url: base_url.trim_end_matches('/').to_string(),
		}
	}

	pub async fn analyze(
		&self,
		text: &str,
		language: &str,
		entities: &[String],
		score_threshold: f64,
	) -> Result<Vec<ScoredEntity>, PiiError> {
		let body = AnalyzeRequest {
			text,
			language,
			entities: (!entities.is_empty()).then_some(entities),
			score_threshold,
		};
		let resp = self
			.http
			.post(format!("{}/analyze", self.base_url))
			.json(&body)
			.send()
			.await?;
		if !resp.status().is_success() {
			return Err(PiiError::Status(resp.status()));
		}
		let findings: Vec<AnalyzeFinding> = resp.json().await?;
		Ok(
			findings
				.into_iter()
				.map(|f| ScoredEntity {
					entity_type: f.entity_type,
					start: f.start,
					end: f.end,
					score: f.score,
				})
				.collect(),
		)
	}

	pub async fn health(&self) -> Result<(), PiiError> {
		let resp = self
			.http
			.get(format!("{}/health", self.base_url))
			.send()
			.await?;
		if resp.status().is_success() {
			Ok(())
		} else {
			Err(PiiError::Status(resp.status()))
		}
	}

	/// Bounded readiness probe. The proxy starts serving either way; a
	/// missing analyzer surfaces as 503 per request until it appears.
	pub async fn wait_ready(&self, attempts: u32, delay: Duration) -> bool {
		for attempt in 1..=attempts {
			match self.health().await {
				Ok(()) => {
					debug!(attempt, "analyzer is ready");
					return true;
				},
				Err(e) => {
					debug!(attempt, error = %e, "analyzer not ready yet");
				},
			}
			tokio::time::sleep(delay).await;
		}
		warn!(attempts, "analyzer did not become ready; serving anyway");
		false
	}

	/// Probe whether the analyzer has recognizers for `language` by sending
	/// a trivial analyze call.
	pub async fn language_supported(&self, language: &str) -> Result<bool, PiiError> {
		let body = AnalyzeRequest {
			text: "ping",
			language,
			entities: None,
			score_threshold: 0.5,
		};
		let resp = self
			.http
			.post(format!("{}/analyze", self.base_url))
			.json(&body)
			.send()
			.await?;
		let status = resp.status();
		if status.is_success() {
			return Ok(true);
		}
		if status.is_client_error() {
			let text = resp.text().await.unwrap_or_default();
			if text.contains(NO_RECOGNIZERS_MARKER) {
				return Ok(false);
			}
		}
		Err(PiiError::Status(status))
	}

	/// Scan every span concurrently and return findings aligned with the
	/// input. Spans whose role is filtered out by `scan_roles` come back
	/// with an empty finding list so the alignment holds.
	pub async fn scan_spans(
		&self,
		spans: &[TextSpan],
		language: &str,
		config: &PiiDetectionConfig,
		whitelist: &[String],
	) -> Result<PiiResult, PiiError> {
		let futures = spans.iter().map(|span| async move {
			if !role_in_scope(span, config.scan_roles.as_deref()) {
				return Ok(Vec::new());
			}
			let entities = self
				.analyze(
					&span.text,
					language,
					&config.entities,
					config.score_threshold,
				)
				.await?;
			Ok::<_, PiiError>(apply_whitelist(&span.text, entities, whitelist))
		});
		let span_entities = futures::future::try_join_all(futures).await?;
		Ok(PiiResult { span_entities })
	}
}

fn role_in_scope(span: &TextSpan, scan_roles: Option<&[String]>) -> bool {
	match (scan_roles, &span.role) {
		(None, _) => true,
		(Some(roles), Some(role)) => roles.iter().any(|r| r == role),
		(Some(_), None) => false,
	}
}

/// Drop any finding whose detected substring contains, or is contained by,
/// a whitelist entry. The comparison is case-sensitive.
pub fn apply_whitelist(
	text: &str,
	entities: Vec<ScoredEntity>,
	whitelist: &[String],
) -> Vec<ScoredEntity> {
	if whitelist.is_empty() {
		return entities;
	}
	entities
		.into_iter()
		.filter(|e| {
			let detected = slice_chars(text, e.start, e.end);
			!whitelist
				.iter()
				.any(|w| detected.contains(w.as_str()) || w.contains(detected))
		})
		.collect()
}

#[cfg(test)]
#[path = "pii_tests.rs"]
mod tests;

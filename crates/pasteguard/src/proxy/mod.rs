use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use http::{HeaderMap, HeaderValue, header};
use indexmap::IndexMap;
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use crate::config::{Config, Mode};
use crate::detect::language::{LanguageDetection, detect_language};
use crate::detect::pii::{AnalyzerClient, PiiResult, apply_whitelist};
use crate::detect::secrets::{SecretLocation, SecretType, detect_secrets};
use crate::detect::span::resolve_overlaps;
use crate::extract::RequestExtractor;
use crate::extract::anthropic::AnthropicExtractor;
use crate::extract::openai::OpenAiExtractor;
use crate::mask::placeholder::{placeholder_label, replace_with_placeholders};
use crate::mask::service::{mask_request, unmask_response, value_formatter};
use crate::mask::{PlaceholderContext, PlaceholderKind};
use crate::parse::sse::{RestoreStages, StreamRestorer, unmask_sse_body};
use crate::providers::ProviderClient;
use crate::route::{Decision, ProviderKind, SecretOutcome, decide, process_secrets};
use crate::telemetry::accesslog::{self, AccessRecord};

pub mod error;

pub use error::{ApiError, WireFormat};

#[derive(Clone)]
pub struct AppState {
	config: Arc<Config>,
	analyzer: Arc<AnalyzerClient>,
	providers: Arc<ProviderClient>,
}

impl AppState {
	pub fn new(config: Config) -> Self {
		let analyzer = Arc::new(AnalyzerClient::new(&config.pii_detection.presidio_url));
		Self {
			config: Arc::new(config),
			analyzer,
			providers: Arc::new(ProviderClient::new()),
		}
	}

	pub fn config(&self) -> &Config {
		&self.config
	}

	pub fn analyzer(&self) -> &AnalyzerClient {
		&self.analyzer
	}
}

pub fn router(state: AppState) -> Router {
	Router::new()
		.route("/openai/v1/chat/completions", post(openai_chat))
		.route("/anthropic/v1/messages", post(anthropic_messages))
		.route("/api/mask", post(api_mask))
		.route("/healthz", get(healthz))
		.with_state(state)
}

async fn healthz() -> &'static str {
	"ok"
}

async fn openai_chat(State(state): State<AppState>, body: Bytes) -> Response {
	proxy_chat::<OpenAiExtractor>(&state, body, WireFormat::OpenAi, "/openai/v1/chat/completions")
		.await
		.unwrap_or_else(|e| e.into_response())
}

async fn anthropic_messages(State(state): State<AppState>, body: Bytes) -> Response {
	proxy_chat::<AnthropicExtractor>(&state, body, WireFormat::Anthropic, "/anthropic/v1/messages")
		.await
		.unwrap_or_else(|e| e.into_response())
}

/// Everything the response headers and access record need to know about how
/// the request was handled.
struct RequestMeta<'a> {
	request_id: &'a str,
	mode: Mode,
	decision: Decision,
	pii_detected: bool,
	pii_masked: bool,
	language: &'a LanguageDetection,
	secret_types: &'a [SecretType],
	secrets_masked: bool,
}

async fn proxy_chat<E: RequestExtractor>(
	state: &AppState,
	body: Bytes,
	format: WireFormat,
	route_path: &'static str,
) -> Result<Response, ApiError> {
	let started = Instant::now();
	let request_id = Uuid::new_v4().to_string();
	let cfg = &state.config;

	let req: E::Request = serde_json::from_slice(&body)
		.map_err(|e| ApiError::validation(format, format!("invalid request body: {e}")))?;
	let spans = E::extract_texts(&req);

	// The secrets policy runs first and may short-circuit the whole request
	// before any provider or analyzer is involved.
	let mut secret_ctx = PlaceholderContext::new();
	let mut secret_types: Vec<SecretType> = Vec::new();
	let mut secrets_masked = false;
	let mut secrets_detected = false;
	let req = match process_secrets::<E>(&req, &spans, &cfg.secrets_detection, &mut secret_ctx) {
		SecretOutcome::Clean => req,
		SecretOutcome::Block { types } => {
			let joined = types.iter().map(|t| t.as_str()).join(",");
			warn!(request_id = %request_id, types = %joined, "blocking request with detected secrets");
			let mut headers = HeaderMap::new();
			set_header(&mut headers, "x-pasteguard-mode", cfg.mode.as_str());
			set_header(&mut headers, "x-pasteguard-secrets-detected", "true");
			set_header(&mut headers, "x-pasteguard-secrets-types", &joined);
			set_header(&mut headers, "x-request-id", &request_id);
			return Err(ApiError::secrets_blocked(format, &joined).with_headers(headers));
		},
		SecretOutcome::Masked { request, types } => {
			secrets_detected = true;
			secrets_masked = true;
			secret_types = types;
			request
		},
		SecretOutcome::RouteLocal { types } => {
			secrets_detected = true;
			secret_types = types;
			req
		},
	};

	// Language detection and PII analysis both run over the secret-masked
	// text, so the analyzer's offsets line up with what is actually
	// forwarded.
	let spans = E::extract_texts(&req);
	let user_text = spans
		.iter()
		.filter(|s| s.role.as_deref() == Some("user"))
		.map(|s| s.text.as_str())
		.join("\n");
	let language = detect_language(
		&user_text,
		&cfg.pii_detection.languages,
		&cfg.pii_detection.fallback_language,
	);
	let pii = if cfg.pii_detection.enabled {
		state
			.analyzer
			.scan_spans(
				&spans,
				&language.language,
				&cfg.pii_detection,
				&cfg.masking.whitelist,
			)
			.await
			.map_err(|e| {
				warn!(request_id = %request_id, error = %e, "pii detection failed");
				ApiError::detection_unavailable(format)
			})?
	} else {
		PiiResult::empty(spans.len())
	};

	let decision = decide(
		cfg.mode,
		cfg.secrets_detection.action,
		secrets_detected,
		pii.detected(),
	);

	let mut pii_ctx = PlaceholderContext::new();
	let mut pii_masked = false;
	let mut req = req;
	if decision.mask_pii {
		let outcome = mask_request::<E>(&req, &spans, &pii.span_entities, &mut pii_ctx);
		pii_masked = outcome.masked;
		req = outcome.request;
	}

	let provider_cfg = match decision.provider {
		ProviderKind::Upstream => &cfg.providers.upstream,
		ProviderKind::Local => cfg
			.providers
			.local
			.as_ref()
			.expect("config validation guarantees a local provider"),
	};
	if let Some(model) = &provider_cfg.model {
		E::set_model(&mut req, model);
	}
	let streaming = E::is_streaming(&req);

	let meta = RequestMeta {
		request_id: &request_id,
		mode: cfg.mode,
		decision,
		pii_detected: pii.detected(),
		pii_masked,
		language: &language,
		secret_types: &secret_types,
		secrets_masked,
	};
	let headers = proxy_headers(&meta);

	let outbound = serde_json::to_vec(&req).map_err(|e| {
		ApiError::bad_gateway(format, format!("failed to serialize request: {e}"))
			.with_headers(headers.clone())
	})?;

	let upstream = state
		.providers
		.send_chat(provider_cfg, outbound, streaming)
		.await
		.map_err(|e| {
			warn!(request_id = %request_id, error = %e, "provider call failed");
			ApiError::bad_gateway(format, "provider request failed").with_headers(headers.clone())
		})?;

	let status = upstream.status();
	let is_event_stream = upstream
		.headers()
		.get(header::CONTENT_TYPE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.starts_with("text/event-stream"))
		.unwrap_or(false);

	let response = if status.is_success() && is_event_stream {
		let stages = restore_stages(cfg, pii_ctx, secret_ctx);
		let body = unmask_sse_body(
			Body::from_stream(upstream.bytes_stream()),
			format.framing(),
			stages,
		);
		let mut response = Response::builder()
			.status(status)
			.header(header::CONTENT_TYPE, "text/event-stream")
			.header(header::CACHE_CONTROL, "no-cache")
			.body(body)
			.expect("static response should build");
		response.headers_mut().extend(headers.clone());
		response
	} else {
		let bytes = upstream.bytes().await.map_err(|e| {
			warn!(request_id = %request_id, error = %e, "failed to read provider response");
			ApiError::bad_gateway(format, "failed to read provider response")
				.with_headers(headers.clone())
		})?;
		if !status.is_success() {
			// Provider-shaped error bodies pass through untouched; anything
			// else wraps as a gateway failure.
			if serde_json::from_slice::<Value>(&bytes).is_err() {
				return Err(
					ApiError::bad_gateway(format, "provider returned an unexpected error")
						.with_headers(headers),
				);
			}
			let mut response = Response::builder()
				.status(status)
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(bytes))
				.expect("static response should build");
			response.headers_mut().extend(headers.clone());
			response
		} else {
			let mut parsed: E::Response = serde_json::from_slice(&bytes).map_err(|e| {
				warn!(request_id = %request_id, error = %e, "provider response did not parse");
				ApiError::bad_gateway(format, "provider returned an invalid response")
					.with_headers(headers.clone())
			})?;
			let format_value =
				value_formatter(cfg.masking.show_markers, cfg.masking.marker_text.clone());
			unmask_response::<E>(
				&mut parsed,
				non_empty(&pii_ctx),
				non_empty(&secret_ctx),
				&format_value,
			);
			let body = serde_json::to_vec(&parsed).map_err(|e| {
				ApiError::bad_gateway(format, format!("failed to serialize response: {e}"))
					.with_headers(headers.clone())
			})?;
			let mut response = Response::builder()
				.status(status)
				.header(header::CONTENT_TYPE, "application/json")
				.body(Body::from(body))
				.expect("static response should build");
			response.headers_mut().extend(headers.clone());
			response
		}
	};

	let secret_types_log = (cfg.secrets_detection.log_detected_types && !secret_types.is_empty())
		.then(|| secret_types.iter().map(|t| t.as_str()).join(","));
	accesslog::emit(&AccessRecord {
		request_id: &request_id,
		route: route_path,
		mode: cfg.mode.as_str(),
		provider: decision.provider.as_str(),
		reason: decision.reason.as_str(),
		language: &language.language,
		language_fallback: language.used_fallback,
		pii_detected: pii.detected(),
		pii_masked,
		secrets_detected,
		secret_types: secret_types_log.as_deref(),
		status: response.status().as_u16(),
		duration_ms: started.elapsed().as_millis() as u64,
	});

	Ok(response)
}

fn non_empty(ctx: &PlaceholderContext) -> Option<&PlaceholderContext> {
	(!ctx.is_empty()).then_some(ctx)
}

fn restore_stages(
	cfg: &Config,
	pii_ctx: PlaceholderContext,
	secret_ctx: PlaceholderContext,
) -> RestoreStages {
	let format_value: Arc<dyn Fn(&str) -> String + Send + Sync> = Arc::new(value_formatter(
		cfg.masking.show_markers,
		cfg.masking.marker_text.clone(),
	));
	let pii = (!pii_ctx.is_empty())
		.then(|| StreamRestorer::new(Arc::new(pii_ctx), format_value.clone()));
	let secret = (!secret_ctx.is_empty())
		.then(|| StreamRestorer::new(Arc::new(secret_ctx), format_value.clone()));
	RestoreStages::new(pii, secret)
}

fn set_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
	if let Ok(value) = HeaderValue::from_str(value) {
		headers.insert(name, value);
	}
}

fn proxy_headers(meta: &RequestMeta<'_>) -> HeaderMap {
	let mut headers = HeaderMap::new();
	set_header(&mut headers, "x-pasteguard-mode", meta.mode.as_str());
	set_header(
		&mut headers,
		"x-pasteguard-provider",
		meta.decision.provider.as_str(),
	);
	set_header(
		&mut headers,
		"x-pasteguard-pii-detected",
		if meta.pii_detected { "true" } else { "false" },
	);
	set_header(&mut headers, "x-pasteguard-language", &meta.language.language);
	if meta.language.used_fallback {
		set_header(&mut headers, "x-pasteguard-language-fallback", "true");
	}
	if meta.mode == Mode::Mask {
		set_header(
			&mut headers,
			"x-pasteguard-pii-masked",
			if meta.pii_masked { "true" } else { "false" },
		);
	}
	if !meta.secret_types.is_empty() {
		set_header(&mut headers, "x-pasteguard-secrets-detected", "true");
		let joined = meta.secret_types.iter().map(|t| t.as_str()).join(",");
		set_header(&mut headers, "x-pasteguard-secrets-types", &joined);
		if meta.secrets_masked {
			set_header(&mut headers, "x-pasteguard-secrets-masked", "true");
		}
	}
	set_header(&mut headers, "x-request-id", meta.request_id);
	headers
}

#[derive(Debug, Deserialize)]
struct MaskApiRequest {
	text: String,
	#[serde(default)]
	language: Option<String>,
	#[serde(default, rename = "startFrom")]
	start_from: Option<HashMap<String, u64>>,
	#[serde(default)]
	detect: Option<Vec<DetectKind>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
enum DetectKind {
	Pii,
	Secrets,
}

#[derive(Debug, Serialize)]
struct MaskApiResponse {
	masked: String,
	context: IndexMap<String, String>,
	counters: HashMap<String, u64>,
	entities: Vec<MaskApiEntity>,
	language: String,
	#[serde(rename = "languageFallback")]
	language_fallback: bool,
}

#[derive(Debug, Serialize)]
struct MaskApiEntity {
	r#type: String,
	placeholder: String,
}

async fn api_mask(State(state): State<AppState>, body: Bytes) -> Response {
	mask_endpoint(&state, body)
		.await
		.map(|resp| {
			(
				[(header::CONTENT_TYPE, "application/json")],
				serde_json::to_string(&resp).expect("response serializes"),
			)
				.into_response()
		})
		.unwrap_or_else(|e| e.into_response())
}

/// Standalone masking endpoint: one text in, masked text plus the full
/// context out. Follows the proxy pipeline ordering (secrets, then PII).
async fn mask_endpoint(state: &AppState, body: Bytes) -> Result<MaskApiResponse, ApiError> {
	let format = WireFormat::OpenAi;
	let cfg = &state.config;
	let req: MaskApiRequest = serde_json::from_slice(&body)
		.map_err(|e| ApiError::validation(format, format!("invalid request body: {e}")))?;

	let text = req.text.trim().to_string();
	if text.is_empty() {
		return Err(ApiError::validation(format, "text must not be empty"));
	}
	let detect = req
		.detect
		.unwrap_or_else(|| vec![DetectKind::Pii, DetectKind::Secrets]);

	let (language, language_fallback) = match req.language {
		Some(lang) => {
			if !cfg.pii_detection.languages.contains(&lang) {
				return Err(ApiError::validation(
					format,
					format!("language {lang} is not in the configured set"),
				));
			}
			(lang, false)
		},
		None => {
			let detection = detect_language(
				&text,
				&cfg.pii_detection.languages,
				&cfg.pii_detection.fallback_language,
			);
			(detection.language, detection.used_fallback)
		},
	};

	let mut ctx = PlaceholderContext::with_counters(req.start_from.unwrap_or_default());
	let mut masked = text;

	if detect.contains(&DetectKind::Secrets) && cfg.secrets_detection.enabled {
		let scan = detect_secrets(
			&masked,
			&cfg.secrets_detection.enabled_types(),
			cfg.secrets_detection.max_scan_chars,
		);
		if scan.detected() {
			masked = replace_with_placeholders(
				&masked,
				&scan.locations,
				&mut ctx,
				PlaceholderKind::Secret,
				|items| resolve_overlaps(items, SecretLocation::span),
			);
		}
	}

	if detect.contains(&DetectKind::Pii) && cfg.pii_detection.enabled {
		let entities = state
			.analyzer
			.analyze(
				&masked,
				&language,
				&cfg.pii_detection.entities,
				cfg.pii_detection.score_threshold,
			)
			.await
			.map_err(|e| {
				warn!(error = %e, "pii detection failed");
				ApiError::detection_unavailable(format)
			})?;
		let entities = apply_whitelist(&masked, entities, &cfg.masking.whitelist);
		if !entities.is_empty() {
			masked = replace_with_placeholders(
				&masked,
				&entities,
				&mut ctx,
				PlaceholderKind::Pii,
				crate::detect::span::resolve_conflicts,
			);
		}
	}

	let entities = ctx
		.mapping()
		.keys()
		.map(|placeholder| MaskApiEntity {
			r#type: placeholder_label(placeholder).unwrap_or_default().to_string(),
			placeholder: placeholder.clone(),
		})
		.collect();

	Ok(MaskApiResponse {
		masked,
		context: ctx.mapping().clone(),
		counters: ctx.counters().clone(),
		entities,
		language,
		language_fallback,
	})
}

#[cfg(test)]
#[path = "proxy_tests.rs"]
mod tests;

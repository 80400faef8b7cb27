use axum::response::{IntoResponse, Response};
use http::{HeaderMap, StatusCode, header};
use serde_json::{Value, json};

use crate::parse::sse::SseFraming;

/// Which provider dialect the client speaks; errors and streams are shaped
/// to match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFormat {
	OpenAi,
	Anthropic,
}

impl WireFormat {
	pub fn framing(&self) -> SseFraming {
		match self {
			WireFormat::OpenAi => SseFraming::OpenAi,
			WireFormat::Anthropic => SseFraming::Anthropic,
		}
	}

	pub fn error_body(&self, status: StatusCode, code: Option<&str>, message: &str) -> Value {
		match self {
			WireFormat::OpenAi => json!({
				"error": {
					"message": message,
					"type": if status.is_server_error() { "server_error" } else { "invalid_request_error" },
					"param": null,
					"code": code,
				}
			}),
			WireFormat::Anthropic => json!({
				"type": "error",
				"error": {
					"type": if status.is_server_error() { "api_error" } else { "invalid_request_error" },
					"message": message,
				}
			}),
		}
	}
}

/// A terminal proxy error, rendered in the client's wire format.
#[derive(Debug)]
pub struct ApiError {
	pub status: StatusCode,
	pub code: Option<String>,
	pub message: String,
	pub format: WireFormat,
	pub headers: HeaderMap,
}

impl ApiError {
	pub fn validation(format: WireFormat, message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			code: Some("validation_error".to_string()),
			message: message.into(),
			format,
			headers: HeaderMap::new(),
		}
	}

	pub fn detection_unavailable(format: WireFormat) -> Self {
		Self {
			status: StatusCode::SERVICE_UNAVAILABLE,
			code: Some("detection_error".to_string()),
			message: "PII detection service is unavailable".to_string(),
			format,
			headers: HeaderMap::new(),
		}
	}

	pub fn secrets_blocked(format: WireFormat, types: &str) -> Self {
		Self {
			status: StatusCode::BAD_REQUEST,
			code: Some("secrets_detected".to_string()),
			message: format!("request blocked: secrets detected ({types})"),
			format,
			headers: HeaderMap::new(),
		}
	}

	pub fn bad_gateway(format: WireFormat, message: impl Into<String>) -> Self {
		Self {
			status: StatusCode::BAD_GATEWAY,
			code: None,
			message: message.into(),
			format,
			headers: HeaderMap::new(),
		}
	}

	pub fn with_headers(mut self, headers: HeaderMap) -> Self {
		self.headers.extend(headers);
		self
	}
}

impl IntoResponse for ApiError {
	fn into_response(self) -> Response {
		let body = self
			.format
			.error_body(self.status, self.code.as_deref(), &self.message);
		let mut response = Response::builder()
			.status(self.status)
			.header(header::CONTENT_TYPE, "application/json")
			.body(axum::body::Body::from(body.to_string()))
			.expect("static response should build");
		response.headers_mut().extend(self.headers);
		response
	}
}

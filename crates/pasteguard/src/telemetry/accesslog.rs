use tracing::info;

/// One structured record per proxied request. The external request log
/// consumes these events; the proxy itself only emits them.
#[derive(Debug)]
pub struct AccessRecord<'a> {
	pub request_id: &'a str,
	pub route: &'a str,
	pub mode: &'a str,
	pub provider: &'a str,
	pub reason: &'a str,
	pub language: &'a str,
	pub language_fallback: bool,
	pub pii_detected: bool,
	pub pii_masked: bool,
	pub secrets_detected: bool,
	/// Comma-joined detected types; absent when logging them is disabled.
	pub secret_types: Option<&'a str>,
	pub status: u16,
	pub duration_ms: u64,
}

pub fn emit(record: &AccessRecord<'_>) {
	info!(
		target: "pasteguard::access",
		request_id = record.request_id,
		route = record.route,
		mode = record.mode,
		provider = record.provider,
		reason = record.reason,
		language = record.language,
		language_fallback = record.language_fallback,
		pii_detected = record.pii_detected,
		pii_masked = record.pii_masked,
		secrets_detected = record.secrets_detected,
		secret_types = record.secret_types,
		status = record.status,
		duration_ms = record.duration_ms,
		"request completed"
	);
}

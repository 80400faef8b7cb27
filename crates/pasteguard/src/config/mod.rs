use std::collections::HashSet;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

use crate::detect::secrets::SecretType;

/// How the proxy treats requests with findings: rewrite them in place and
/// always use the upstream provider, or pick a provider per request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
	Route,
	Mask,
}

impl Mode {
	pub fn as_str(&self) -> &'static str {
		match self {
			Mode::Route => "route",
			Mode::Mask => "mask",
		}
	}
}

/// Policy for deterministic secret findings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecretAction {
	Block,
	Mask,
	RouteLocal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderType {
	Openai,
	Anthropic,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
	pub mode: Mode,
	#[serde(default)]
	pub server: ServerConfig,
	pub providers: ProvidersConfig,
	#[serde(default)]
	pub masking: MaskingConfig,
	#[serde(default)]
	pub pii_detection: PiiDetectionConfig,
	#[serde(default)]
	pub secrets_detection: SecretsDetectionConfig,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
	#[serde(default = "default_host")]
	pub host: String,
	#[serde(default = "default_port")]
	pub port: u16,
}

impl Default for ServerConfig {
	fn default() -> Self {
		Self {
			host: default_host(),
			port: default_port(),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProvidersConfig {
	pub upstream: ProviderConfig,
	#[serde(default)]
	pub local: Option<ProviderConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ProviderConfig {
	pub r#type: ProviderType,
	pub base_url: String,
	#[serde(default)]
	pub api_key: Option<SecretString>,
	#[serde(default)]
	pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaskingConfig {
	#[serde(default)]
	pub show_markers: bool,
	#[serde(default = "default_marker_text")]
	pub marker_text: String,
	#[serde(default)]
	pub whitelist: Vec<String>,
}

impl Default for MaskingConfig {
	fn default() -> Self {
		Self {
			show_markers: false,
			marker_text: default_marker_text(),
			whitelist: Vec::new(),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PiiDetectionConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_presidio_url")]
	pub presidio_url: String,
	#[serde(default = "default_languages")]
	pub languages: Vec<String>,
	#[serde(default = "default_fallback_language")]
	pub fallback_language: String,
	#[serde(default = "default_score_threshold")]
	pub score_threshold: f64,
	#[serde(default)]
	pub entities: Vec<String>,
	#[serde(default)]
	pub scan_roles: Option<Vec<String>>,
}

impl Default for PiiDetectionConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			presidio_url: default_presidio_url(),
			languages: default_languages(),
			fallback_language: default_fallback_language(),
			score_threshold: default_score_threshold(),
			entities: Vec::new(),
			scan_roles: None,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SecretsDetectionConfig {
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_secret_action")]
	pub action: SecretAction,
	#[serde(default = "default_secret_entities")]
	pub entities: Vec<SecretType>,
	#[serde(default)]
	pub max_scan_chars: usize,
	#[serde(default = "default_true")]
	pub log_detected_types: bool,
	#[serde(default)]
	pub scan_roles: Option<Vec<String>>,
}

impl Default for SecretsDetectionConfig {
	fn default() -> Self {
		Self {
			enabled: true,
			action: default_secret_action(),
			entities: default_secret_entities(),
			max_scan_chars: 0,
			log_detected_types: true,
			scan_roles: None,
		}
	}
}

impl SecretsDetectionConfig {
	pub fn enabled_types(&self) -> HashSet<SecretType> {
		self.entities.iter().copied().collect()
	}
}

fn default_host() -> String {
	"127.0.0.1".to_string()
}

fn default_port() -> u16 {
	8411
}

fn default_marker_text() -> String {
	"[protected]".to_string()
}

fn default_true() -> bool {
	true
}

fn default_presidio_url() -> String {
	"http://127.0.0.1:5002".to_string()
}

fn default_languages() -> Vec<String> {
	vec!["en".to_string()]
}

fn default_fallback_language() -> String {
	"en".to_string()
}

fn default_score_threshold() -> f64 {
	0.5
}

fn default_secret_action() -> SecretAction {
	SecretAction::Mask
}

fn default_secret_entities() -> Vec<SecretType> {
	SecretType::ALL.to_vec()
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
	#[error("failed to read config: {0}")]
	Io(#[from] std::io::Error),
	#[error("failed to parse config: {0}")]
	Parse(#[from] serde_yaml::Error),
	#[error("environment variable {0} is not set and has no default")]
	MissingEnv(String),
	#[error("invalid config: {0}")]
	Invalid(String),
}

static ENV_PATTERN: Lazy<Regex> = Lazy::new(|| {
	Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)(?::-([^}]*))?\}").expect("static pattern")
});

/// Expand `${VAR}` and `${VAR:-default}` references against the process
/// environment. A reference without a default to an unset variable is an
/// error.
pub fn substitute_env(raw: &str) -> Result<String, ConfigError> {
	let mut missing: Option<String> = None;
	let out = ENV_PATTERN.replace_all(raw, |caps: &regex::Captures| {
		let name = &caps[1];
		match std::env::var(name) {
			Ok(value) => value,
			Err(_) => match caps.get(2) {
				Some(default) => default.as_str().to_string(),
				None => {
					missing.get_or_insert_with(|| name.to_string());
					String::new()
				},
			},
		}
	});
	match missing {
		Some(name) => Err(ConfigError::MissingEnv(name)),
		None => Ok(out.into_owned()),
	}
}

impl Config {
	pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
		let substituted = substitute_env(raw)?;
		let config: Config = serde_yaml::from_str(&substituted)?;
		config.validate()?;
		Ok(config)
	}

	pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
		let raw = std::fs::read_to_string(path)?;
		Self::from_yaml(&raw)
	}

	/// Cross-field validation; failures are fatal at load time.
	fn validate(&self) -> Result<(), ConfigError> {
		if self.mode == Mode::Mask && self.secrets_detection.action == SecretAction::RouteLocal {
			return Err(ConfigError::Invalid(
				"secrets_detection.action=route_local is not valid with mode=mask".to_string(),
			));
		}
		if self.mode == Mode::Route && self.providers.local.is_none() {
			return Err(ConfigError::Invalid(
				"mode=route requires a providers.local entry".to_string(),
			));
		}
		if !(0.0..=1.0).contains(&self.pii_detection.score_threshold) {
			return Err(ConfigError::Invalid(format!(
				"pii_detection.score_threshold must be within 0..1, got {}",
				self.pii_detection.score_threshold
			)));
		}
		if self.pii_detection.enabled {
			if self.pii_detection.languages.is_empty() {
				return Err(ConfigError::Invalid(
					"pii_detection.languages must not be empty".to_string(),
				));
			}
			if !self
				.pii_detection
				.languages
				.contains(&self.pii_detection.fallback_language)
			{
				return Err(ConfigError::Invalid(format!(
					"pii_detection.fallback_language {} is not in pii_detection.languages",
					self.pii_detection.fallback_language
				)));
			}
			if self.pii_detection.presidio_url.is_empty() {
				return Err(ConfigError::Invalid(
					"pii_detection.presidio_url must not be empty".to_string(),
				));
			}
		}
		Ok(())
	}
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;

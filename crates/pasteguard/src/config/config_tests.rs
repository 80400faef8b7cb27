use assert_matches::assert_matches;

use super::*;

const MINIMAL: &str = r#"
mode: mask
providers:
  upstream:
    type: openai
    base_url: https://api.openai.com/v1
    api_key: sk-test
"#;

#[test]
fn minimal_config_fills_defaults() {
	let config = Config::from_yaml(MINIMAL).unwrap();
	assert_eq!(config.mode, Mode::Mask);
	assert_eq!(config.server.port, 8411);
	assert!(config.pii_detection.enabled);
	assert_eq!(config.pii_detection.fallback_language, "en");
	assert_eq!(config.secrets_detection.action, SecretAction::Mask);
	assert_eq!(config.secrets_detection.entities.len(), 10);
	assert!(!config.masking.show_markers);
	assert_eq!(config.masking.marker_text, "[protected]");
}

#[test]
fn full_config_parses() {
	let yaml = r#"
mode: route
server:
  host: 0.0.0.0
  port: 9000
providers:
  upstream:
    type: anthropic
    base_url: https://api.anthropic.com/v1
    api_key: key-123
    model: claude-sonnet-4-5
  local:
    type: openai
    base_url: http://localhost:11434/v1
masking:
  show_markers: true
  marker_text: "[restored]"
  whitelist:
    - "support@company.example"
pii_detection:
  enabled: true
  presidio_url: http://localhost:5002
  languages: [en, de, ja]
  fallback_language: en
  score_threshold: 0.7
  entities: [PERSON, EMAIL_ADDRESS, PHONE_NUMBER]
  scan_roles: [user, system]
secrets_detection:
  enabled: true
  action: route_local
  entities: [OPENSSH_PRIVATE_KEY, API_KEY_AWS, JWT_TOKEN]
  max_scan_chars: 100000
  log_detected_types: false
"#;
	let config = Config::from_yaml(yaml).unwrap();
	assert_eq!(config.mode, Mode::Route);
	assert_eq!(config.server.port, 9000);
	assert_eq!(config.providers.local.as_ref().unwrap().r#type, ProviderType::Openai);
	assert_eq!(config.pii_detection.languages, vec!["en", "de", "ja"]);
	assert_eq!(config.secrets_detection.action, SecretAction::RouteLocal);
	assert_eq!(config.secrets_detection.max_scan_chars, 100_000);
	assert_eq!(
		config.secrets_detection.enabled_types(),
		[
			SecretType::OpensshPrivateKey,
			SecretType::ApiKeyAws,
			SecretType::JwtToken
		]
		.into_iter()
		.collect()
	);
}

#[test]
fn route_local_with_mask_mode_is_rejected() {
	let yaml = r#"
mode: mask
providers:
  upstream:
    type: openai
    base_url: https://api.openai.com/v1
secrets_detection:
  action: route_local
"#;
	let err = Config::from_yaml(yaml).unwrap_err();
	assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("route_local"));
}

#[test]
fn route_mode_requires_local_provider() {
	let yaml = r#"
mode: route
providers:
  upstream:
    type: openai
    base_url: https://api.openai.com/v1
"#;
	let err = Config::from_yaml(yaml).unwrap_err();
	assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("providers.local"));
}

#[test]
fn score_threshold_must_be_normalized() {
	let yaml = r#"
mode: mask
providers:
  upstream:
    type: openai
    base_url: https://api.openai.com/v1
pii_detection:
  score_threshold: 1.5
"#;
	let err = Config::from_yaml(yaml).unwrap_err();
	assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("score_threshold"));
}

#[test]
fn fallback_language_must_be_supported() {
	let yaml = r#"
mode: mask
providers:
  upstream:
    type: openai
    base_url: https://api.openai.com/v1
pii_detection:
  languages: [de]
  fallback_language: en
"#;
	let err = Config::from_yaml(yaml).unwrap_err();
	assert_matches!(err, ConfigError::Invalid(msg) if msg.contains("fallback_language"));
}

#[test]
fn unknown_keys_are_rejected() {
	let yaml = format!("{MINIMAL}\nsurprise: true\n");
	assert!(Config::from_yaml(&yaml).is_err());
}

#[test]
fn env_substitution_with_defaults() {
	// Unique names keep parallel tests from interfering.
	unsafe {
		std::env::set_var("PG_TEST_SUB_KEY", "from-env");
	}
	let out = substitute_env("a=${PG_TEST_SUB_KEY} b=${PG_TEST_SUB_UNSET:-fallback} c=${PG_TEST_SUB_UNSET:-}").unwrap();
	assert_eq!(out, "a=from-env b=fallback c=");
}

#[test]
fn env_substitution_missing_var_errors() {
	let err = substitute_env("key: ${PG_TEST_SUB_DEFINITELY_UNSET}").unwrap_err();
	assert_matches!(err, ConfigError::MissingEnv(name) if name == "PG_TEST_SUB_DEFINITELY_UNSET");
}

#[test]
fn env_substitution_in_yaml() {
	unsafe {
		std::env::set_var("PG_TEST_API_KEY", "sk-from-env");
	}
	let yaml = r#"
mode: mask
providers:
  upstream:
    type: openai
    base_url: ${PG_TEST_BASE_URL:-https://api.openai.com/v1}
    api_key: ${PG_TEST_API_KEY}
"#;
	let config = Config::from_yaml(yaml).unwrap();
	assert_eq!(config.providers.upstream.base_url, "https://api.openai.com/v1");
}

#[test]
fn shipped_example_config_is_valid() {
	unsafe {
		std::env::set_var("OPENAI_API_KEY", "sk-example");
	}
	let raw = include_str!("../../../../config.example.yaml");
	let config = Config::from_yaml(raw).unwrap();
	assert_eq!(config.mode, Mode::Mask);
	assert_eq!(config.pii_detection.languages, vec!["en", "de"]);
	assert_eq!(config.secrets_detection.entities.len(), 10);
}

#[test]
fn from_file_round_trips() {
	let mut path = tempfile::NamedTempFile::new().unwrap();
	std::io::Write::write_all(&mut path, MINIMAL.as_bytes()).unwrap();
	let config = Config::from_file(path.path()).unwrap();
	assert_eq!(config.mode, Mode::Mask);
}

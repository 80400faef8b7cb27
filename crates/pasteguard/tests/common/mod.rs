use std::future::IntoFuture;

use pasteguard::config::{
	Config, MaskingConfig, Mode, PiiDetectionConfig, ProviderConfig, ProviderType,
	ProvidersConfig, SecretAction, SecretsDetectionConfig, ServerConfig,
};
use pasteguard::proxy::{AppState, router};
use wiremock::MockServer;

/// A proxy bound to a real socket, talking to mock collaborators.
pub struct TestProxy {
	pub base_url: String,
	pub analyzer: MockServer,
	pub upstream: MockServer,
	pub local: MockServer,
}

impl TestProxy {
	pub async fn start(mode: Mode, action: SecretAction) -> Self {
		Self::start_with_upstream(mode, action, ProviderType::Openai).await
	}

	pub async fn start_with_upstream(
		mode: Mode,
		action: SecretAction,
		upstream_type: ProviderType,
	) -> Self {
		let analyzer = MockServer::start().await;
		let upstream = MockServer::start().await;
		let local = MockServer::start().await;

		let config = Config {
			mode,
			server: ServerConfig::default(),
			providers: ProvidersConfig {
				upstream: ProviderConfig {
					r#type: upstream_type,
					base_url: format!("{}/v1", upstream.uri()),
					api_key: Some("test-key".to_string().into()),
					model: None,
				},
				local: Some(ProviderConfig {
					r#type: ProviderType::Openai,
					base_url: format!("{}/v1", local.uri()),
					api_key: None,
					model: None,
				}),
			},
			masking: MaskingConfig::default(),
			pii_detection: PiiDetectionConfig {
				presidio_url: analyzer.uri(),
				..Default::default()
			},
			secrets_detection: SecretsDetectionConfig {
				action,
				..Default::default()
			},
		};
		let state = AppState::new(config);
		let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
			.await
			.expect("bind an ephemeral port");
		let addr = listener.local_addr().expect("local addr");
		tokio::spawn(axum::serve(listener, router(state)).into_future());

		Self {
			base_url: format!("http://{addr}"),
			analyzer,
			upstream,
			local,
		}
	}

	pub fn client(&self) -> reqwest::Client {
		reqwest::Client::new()
	}
}

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use pasteguard::config::Config;
use pasteguard::proxy::{AppState, router};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
	name = "pasteguard",
	about = "Privacy-aware reverse proxy for chat-completion APIs"
)]
struct Args {
	/// Path to the YAML configuration file.
	#[arg(short = 'f', long = "config", default_value = "pasteguard.yaml")]
	config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(
			EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
		)
		.init();

	let args = Args::parse();
	let config = Config::from_file(&args.config)
		.with_context(|| format!("loading {}", args.config.display()))?;

	let addr = format!("{}:{}", config.server.host, config.server.port);
	let pii_enabled = config.pii_detection.enabled;
	let languages = config.pii_detection.languages.clone();
	let state = AppState::new(config);
	if pii_enabled && state.analyzer().wait_ready(30, Duration::from_secs(1)).await {
		for language in &languages {
			match state.analyzer().language_supported(language).await {
				Ok(true) => {},
				Ok(false) => tracing::warn!(
					language = %language,
					"analyzer has no recognizers for configured language"
				),
				Err(e) => {
					tracing::warn!(language = %language, error = %e, "language probe failed")
				},
			}
		}
	}

	let listener = tokio::net::TcpListener::bind(&addr)
		.await
		.with_context(|| format!("binding {addr}"))?;
	info!(addr = %addr, "pasteguard listening");
	axum::serve(listener, router(state))
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	Ok(())
}

async fn shutdown_signal() {
	let ctrl_c = async {
		tokio::signal::ctrl_c()
			.await
			.expect("ctrl-c handler installs");
	};
	#[cfg(unix)]
	let terminate = async {
		tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
			.expect("signal handler installs")
			.recv()
			.await;
	};
	#[cfg(not(unix))]
	let terminate = std::future::pending::<()>();

	tokio::select! {
		_ = ctrl_c => {},
		_ = terminate => {},
	}
	info!("shutting down");
}

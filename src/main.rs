use anyhow::{Context as _, Result};
use clap::Parser;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use stackwire::config::Config;
use stackwire::listener;

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
	/// Path to a JSON config file.
	#[arg(short, long, value_name = "file")]
	file: std::path::PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
	tracing_subscriber::fmt()
		.with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()))
		.with_writer(std::io::stderr)
		.with_ansi(false)
		.init();

	rustls::crypto::ring::default_provider()
		.install_default()
		.map_err(|_| anyhow::anyhow!("a rustls crypto provider was already installed"))?;

	let args = Args::parse();
	let text = tokio::fs::read_to_string(&args.file)
		.await
		.with_context(|| format!("reading config file {}", args.file.display()))?;
	let cfg: Config = serde_json::from_str(&text).context("parsing config file")?;

	let hub = if cfg.workers > 0 {
		stackwire_io::Hub::with_worker_count(cfg.workers)
	} else {
		stackwire_io::Hub::create()
	};

	info!(addr = %cfg.listen_addr, "starting stackwire listener");
	if let Err(err) = listener::run(Arc::new(cfg), hub).await {
		error!(%err, "listener exited with error");
		return Err(err);
	}
	warn!("listener exited");
	Ok(())
}

//! TCP accept loop wiring a [`stackwire_proto::Stack`] per connection:
//! ack filter, optional TLS, header exchange, then a byte-stream endpoint.

use anyhow::{Context as _, Result};
use rustls::ServerConfig;
use rustls::server::WebPkiClientVerifier;
use stackwire_app::ByteStreamApp;
use stackwire_proto::filters::{AckFilter, HeaderFilter, TlsFilter, accepting_listener};
use stackwire_proto::{BioNetwork, StackBuilder};
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::config::Config;

pub async fn run(cfg: Arc<Config>, hub: Arc<stackwire_io::Hub>) -> Result<()> {
	let tls_config = match &cfg.tls {
		Some(tls) => Some(Arc::new(load_server_config(tls)?)),
		None => None,
	};

	let listener = TcpListener::bind(&cfg.listen_addr)
		.await
		.with_context(|| format!("binding {}", cfg.listen_addr))?;

	loop {
		let (stream, peer) = listener.accept().await.context("accepting connection")?;
		info!(%peer, "accepted connection");
		let cfg = cfg.clone();
		let hub = hub.clone();
		let tls_config = tls_config.clone();
		tokio::spawn(async move {
			if let Err(err) = handle_connection(stream, peer, cfg, hub, tls_config).await {
				warn!(%peer, %err, "connection failed");
			}
		});
	}
}

async fn handle_connection(
	stream: tokio::net::TcpStream,
	peer: std::net::SocketAddr,
	cfg: Arc<Config>,
	hub: Arc<stackwire_io::Hub>,
	tls_config: Option<Arc<ServerConfig>>,
) -> Result<()> {
	stream.set_nodelay(true).ok();

	let mut builder = StackBuilder::on(Box::new(BioNetwork::new(stream)))
		.filter(Box::new(AckFilter::new(cfg.magic.clone().into_bytes())))
		.named(format!("peer-{peer}"))
		.idle_timeout(hub, std::time::Duration::from_secs(cfg.idle_timeout_secs));

	if let Some(tls_config) = tls_config {
		let conn = rustls::ServerConnection::new(tls_config).context("building tls server connection")?;
		builder = builder.filter(Box::new(TlsFilter::server(conn, None)));
	}

	let headers = cfg.headers.clone();
	builder = builder.filter(Box::new(
		HeaderFilter::new(&headers, accepting_listener()).context("building header filter")?,
	));

	let app = ByteStreamApp::new();
	let stack = builder.build(app).await.context("starting stack")?;

	let mut endpoint = stack.endpoint();
	let mut buf = Vec::new();
	endpoint.read_to_end(&mut buf).await.ok();
	info!(%peer, bytes = buf.len(), "stream drained");
	stack.close(None).await;
	Ok(())
}

fn load_server_config(tls: &crate::config::TlsConfig) -> Result<ServerConfig> {
	let cert_file =
		std::fs::File::open(&tls.cert_path).with_context(|| format!("opening {}", tls.cert_path.display()))?;
	let mut cert_reader = std::io::BufReader::new(cert_file);
	let certs = rustls_pemfile::certs(&mut cert_reader)
		.collect::<Result<Vec<_>, _>>()
		.context("parsing certificate chain")?;

	let key_file =
		std::fs::File::open(&tls.key_path).with_context(|| format!("opening {}", tls.key_path.display()))?;
	let mut key_reader = std::io::BufReader::new(key_file);
	let key = rustls_pemfile::private_key(&mut key_reader)
		.context("parsing private key")?
		.context("no private key found")?;

	// Client authentication is mandatory in the server role (spec.md §6):
	// the caller always supplies a trust root, there is no no-client-auth
	// fallback.
	let ca_file = std::fs::File::open(&tls.client_ca_path)
		.with_context(|| format!("opening {}", tls.client_ca_path.display()))?;
	let mut ca_reader = std::io::BufReader::new(ca_file);
	let mut roots = rustls::RootCertStore::empty();
	for cert in rustls_pemfile::certs(&mut ca_reader) {
		roots.add(cert.context("parsing client CA certificate")?)?;
	}
	let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
		.build()
		.context("building client certificate verifier")?;

	ServerConfig::builder()
		.with_client_cert_verifier(verifier)
		.with_single_cert(certs, key)
		.context("building tls server config")
}

//! TLS filter (spec §4.G): wraps outbound cleartext into TLS records,
//! unwraps inbound ciphertext, surfaces a post-handshake verification
//! callback.
//!
//! Drives `rustls`'s raw `Connection` API directly rather than going through
//! `tokio_rustls`'s `AsyncRead`/`AsyncWrite` adapter: this filter speaks the
//! stack's push-based `accept_recv`/`accept_send` contract, not a stream, so
//! the lower-level buffer-in/buffer-out API rustls itself exposes is the
//! better fit. Unlike the source system's SSLEngine, rustls never marks
//! handshake work as "delegated" to a separate executor — its crypto runs
//! inline with no blocking syscalls — so there is no task-dispatch queue
//! here; `process_new_packets` runs synchronously under the engine lock.

use crate::layer::{Layer, NeighborHandle};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rustls::pki_types::CertificateDer;
use rustls::{ClientConnection, ServerConnection};
use stackwire_core::{CloseCause, StackError};
use std::io::{Cursor, Read, Write};
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, warn};

use crate::state::HalfOpenState;

enum Engine {
	Client(ClientConnection),
	Server(ServerConnection),
}

impl Engine {
	fn is_handshaking(&self) -> bool {
		match self {
			Engine::Client(c) => c.is_handshaking(),
			Engine::Server(c) => c.is_handshaking(),
		}
	}

	fn read_tls(&mut self, data: &[u8]) -> std::io::Result<usize> {
		let mut cursor = Cursor::new(data);
		match self {
			Engine::Client(c) => c.read_tls(&mut cursor),
			Engine::Server(c) => c.read_tls(&mut cursor),
		}
	}

	fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
		match self {
			Engine::Client(c) => c.process_new_packets(),
			Engine::Server(c) => c.process_new_packets(),
		}
	}

	fn drain_plaintext(&mut self) -> Vec<u8> {
		let mut out = Vec::new();
		let result = match self {
			Engine::Client(c) => c.reader().read_to_end(&mut out),
			Engine::Server(c) => c.reader().read_to_end(&mut out),
		};
		// A zero-byte read (WouldBlock-shaped EOF) is expected once all
		// currently-available plaintext has drained.
		let _ = result;
		out
	}

	fn write_plaintext(&mut self, data: &[u8]) -> std::io::Result<()> {
		match self {
			Engine::Client(c) => c.writer().write_all(data),
			Engine::Server(c) => c.writer().write_all(data),
		}
	}

	fn drain_tls(&mut self) -> Vec<u8> {
		let mut out = Vec::new();
		loop {
			let wrote = match self {
				Engine::Client(c) => c.write_tls(&mut out),
				Engine::Server(c) => c.write_tls(&mut out),
			};
			match wrote {
				Ok(0) => break,
				Ok(_) => continue,
				Err(_) => break,
			}
		}
		out
	}

	fn wants_write(&self) -> bool {
		match self {
			Engine::Client(c) => c.wants_write(),
			Engine::Server(c) => c.wants_write(),
		}
	}

	fn send_close_notify(&mut self) {
		match self {
			Engine::Client(c) => c.send_close_notify(),
			Engine::Server(c) => c.send_close_notify(),
		}
	}

	fn peer_certificates(&self) -> Option<&[CertificateDer<'static>]> {
		match self {
			Engine::Client(c) => c.peer_certificates(),
			Engine::Server(c) => c.peer_certificates(),
		}
	}
}

/// Negotiated session info handed to the post-handshake callback.
pub struct PeerInfo<'a> {
	pub peer_certificates: Option<&'a [CertificateDer<'static>]>,
}

pub type PostHandshakeHook = Box<dyn Fn(&PeerInfo<'_>) -> Result<(), StackError> + Send + Sync>;

pub struct TlsFilter {
	engine: Mutex<Engine>,
	state: HalfOpenState,
	hook: Option<PostHandshakeHook>,
	hook_fired: AtomicBool,
	close_notify_seen: AtomicBool,
	io: OnceLock<NeighborHandle>,
}

impl TlsFilter {
	pub fn client(conn: ClientConnection, hook: Option<PostHandshakeHook>) -> Self {
		Self::new(Engine::Client(conn), hook)
	}

	pub fn server(conn: ServerConnection, hook: Option<PostHandshakeHook>) -> Self {
		Self::new(Engine::Server(conn), hook)
	}

	fn new(engine: Engine, hook: Option<PostHandshakeHook>) -> Self {
		Self {
			engine: Mutex::new(engine),
			state: HalfOpenState::new(),
			hook,
			hook_fired: AtomicBool::new(false),
			close_notify_seen: AtomicBool::new(false),
			io: OnceLock::new(),
		}
	}

	fn io(&self) -> &NeighborHandle {
		self.io.get().expect("tls filter used before start")
	}

	async fn flush_outbound_tls(&self) -> Result<(), StackError> {
		let out = self.engine.lock().drain_tls();
		if !out.is_empty() {
			self.io().send_down(Bytes::from(out)).await?;
		}
		Ok(())
	}

	async fn maybe_fire_hook(&self) -> Option<CloseCause> {
		let handshaking = self.engine.lock().is_handshaking();
		if handshaking || self.hook_fired.swap(true, Ordering::AcqRel) {
			return None;
		}
		let Some(hook) = &self.hook else { return None };
		let certs = self.engine.lock().peer_certificates().map(<[_]>::to_vec);
		let info = PeerInfo { peer_certificates: certs.as_deref() };
		if let Err(err) = hook(&info) {
			warn!(%err, "tls filter: post-handshake callback refused connection");
			return Some(CloseCause::new(err));
		}
		None
	}
}

#[async_trait]
impl Layer for TlsFilter {
	async fn start(&self, io: NeighborHandle) -> Result<(), StackError> {
		let _ = self.io.set(io);
		// A client-role engine has initial ClientHello bytes queued as soon
		// as it's constructed; flush them immediately so the handshake
		// begins without waiting on a peer byte first.
		self.flush_outbound_tls().await
	}

	async fn accept_recv(&self, data: Bytes) {
		if let Err(e) = self.engine.lock().read_tls(&data) {
			warn!(error = %e, "tls filter: read_tls failed");
			let cause = CloseCause::new(StackError::HandshakeFailure(e.to_string()));
			self.state.close_send();
			self.state.close_read();
			self.io().close_send_down(Some(cause.clone())).await;
			self.io().close_recv_up(Some(cause)).await;
			return;
		}

		let process_result = self.engine.lock().process_new_packets();
		match process_result {
			Ok(state) => {
				if state.peer_has_closed() {
					self.close_notify_seen.store(true, Ordering::Release);
				}
			},
			Err(e) => {
				let was_handshaking = self.engine.lock().is_handshaking();
				let cause = CloseCause::new(if was_handshaking {
					StackError::HandshakeFailure(e.to_string())
				} else {
					StackError::Refusal(format!("tls error: {e}"))
				});
				self.state.close_send();
				self.state.close_read();
				self.io().close_send_down(Some(cause.clone())).await;
				self.io().close_recv_up(Some(cause)).await;
				return;
			},
		}

		if self.engine.lock().wants_write() {
			if let Err(err) = self.flush_outbound_tls().await {
				warn!(%err, "tls filter: failed flushing handshake bytes");
				return;
			}
		}

		if let Some(cause) = self.maybe_fire_hook().await {
			self.state.close_send();
			self.state.close_read();
			self.io().close_send_down(Some(cause.clone())).await;
			self.io().close_recv_up(Some(cause)).await;
			return;
		}

		let plaintext = self.engine.lock().drain_plaintext();
		if !plaintext.is_empty() {
			self.io().forward_up(Bytes::from(plaintext)).await;
		}
	}

	async fn accept_send(&self, data: Bytes) -> Result<(), StackError> {
		if !self.state.is_send_open() {
			return Err(StackError::Closed);
		}
		self.engine
			.lock()
			.write_plaintext(&data)
			.map_err(StackError::Transport)?;
		self.flush_outbound_tls().await
	}

	async fn accept_close_send(&self, cause: Option<CloseCause>) {
		if self.state.close_send() {
			self.engine.lock().send_close_notify();
			let _ = self.flush_outbound_tls().await;
			self.io().close_send_down(cause).await;
		}
	}

	async fn accept_recv_closed(&self, cause: Option<CloseCause>) {
		if self.state.close_read() {
			let effective = if self.close_notify_seen.load(Ordering::Acquire) {
				cause
			} else {
				debug!("tls filter: EOF before close_notify");
				Some(cause.unwrap_or_else(|| CloseCause::new(StackError::TruncatedStream)))
			};
			self.io().close_recv_up(effective).await;
		}
	}

	fn is_send_open(&self) -> bool {
		self.state.is_send_open()
	}

	fn is_read_open(&self) -> bool {
		self.state.is_read_open()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::app::ApplicationLayer;
	use crate::network::BioNetwork;
	use crate::stack::StackBuilder;
	use parking_lot::Mutex as SyncMutex;
	use rcgen::{CertifiedKey, generate_simple_self_signed};
	use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
	use rustls::{ClientConfig, RootCertStore};
	use std::sync::Arc;
	use std::time::Duration;

	fn install_crypto_provider() {
		let _ = rustls::crypto::ring::default_provider().install_default();
	}

	fn self_signed_cert() -> (CertificateDer<'static>, PrivateKeyDer<'static>) {
		let CertifiedKey { cert, key_pair } =
			generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
		let cert_der = cert.der().clone();
		let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
		(cert_der, key_der)
	}

	fn server_config(cert: CertificateDer<'static>, key: PrivateKeyDer<'static>) -> Arc<rustls::ServerConfig> {
		Arc::new(
			rustls::ServerConfig::builder()
				.with_no_client_auth()
				.with_single_cert(vec![cert], key)
				.unwrap(),
		)
	}

	fn client_config_trusting(cert: CertificateDer<'static>) -> Arc<ClientConfig> {
		let mut roots = RootCertStore::empty();
		roots.add(cert).unwrap();
		Arc::new(ClientConfig::builder().with_root_certificates(roots).with_no_client_auth())
	}

	struct RecordingApp {
		received: Arc<SyncMutex<Vec<u8>>>,
		close_causes: Arc<SyncMutex<Vec<Option<StackError>>>>,
	}

	fn clone_opt_err(e: &Option<CloseCause>) -> Option<StackError> {
		e.as_ref().map(|c| match c.primary.as_ref() {
			StackError::HandshakeFailure(s) => StackError::HandshakeFailure(s.clone()),
			StackError::TruncatedStream => StackError::TruncatedStream,
			StackError::Refusal(s) => StackError::Refusal(s.clone()),
			other => StackError::Refusal(format!("{other}")),
		})
	}

	#[async_trait]
	impl ApplicationLayer for RecordingApp {
		type Endpoint = ();

		async fn start(&self) -> Result<(), StackError> {
			Ok(())
		}
		async fn on_read(&self, data: Bytes) {
			self.received.lock().extend_from_slice(&data);
		}
		async fn on_read_closed(&self, cause: Option<CloseCause>) {
			self.close_causes.lock().push(clone_opt_err(&cause));
		}
		fn is_read_open(&self) -> bool {
			true
		}
		fn get(&self) -> Self::Endpoint {}
	}

	#[tokio::test]
	async fn handshake_completes_and_round_trips_plaintext() {
		install_crypto_provider();
		let (cert, key) = self_signed_cert();
		let server_cfg = server_config(cert.clone(), key);
		let client_cfg = client_config_trusting(cert);

		let (client_io, server_io) = tokio::io::duplex(16 * 1024);

		let server_received = Arc::new(SyncMutex::new(Vec::new()));
		let server_app = RecordingApp { received: server_received.clone(), close_causes: Arc::new(SyncMutex::new(Vec::new())) };
		let server_stack = StackBuilder::on(Box::new(BioNetwork::new(server_io)))
			.filter(Box::new(TlsFilter::server(ServerConnection::new(server_cfg).unwrap(), None)))
			.build(server_app)
			.await
			.unwrap();

		let client_received = Arc::new(SyncMutex::new(Vec::new()));
		let client_app = RecordingApp { received: client_received.clone(), close_causes: Arc::new(SyncMutex::new(Vec::new())) };
		let name: ServerName<'static> = "localhost".try_into().unwrap();
		let client_stack = StackBuilder::on(Box::new(BioNetwork::new(client_io)))
			.filter(Box::new(TlsFilter::client(ClientConnection::new(client_cfg, name).unwrap(), None)))
			.build(client_app)
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;

		client_stack.send(Bytes::from_static(b"hello")).await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(&*server_received.lock(), b"hello");

		server_stack.send(Bytes::from_static(b"world")).await.unwrap();
		tokio::time::sleep(Duration::from_millis(50)).await;
		assert_eq!(&*client_received.lock(), b"world");
	}

	#[tokio::test]
	async fn abrupt_close_before_close_notify_reports_truncated_stream() {
		install_crypto_provider();
		let (cert, key) = self_signed_cert();
		let server_cfg = server_config(cert.clone(), key);
		let client_cfg = client_config_trusting(cert);

		let (client_io, server_io) = tokio::io::duplex(16 * 1024);

		let server_close = Arc::new(SyncMutex::new(Vec::new()));
		let server_app =
			RecordingApp { received: Arc::new(SyncMutex::new(Vec::new())), close_causes: server_close.clone() };
		let _server_stack = StackBuilder::on(Box::new(BioNetwork::new(server_io)))
			.filter(Box::new(TlsFilter::server(ServerConnection::new(server_cfg).unwrap(), None)))
			.build(server_app)
			.await
			.unwrap();

		let client_app =
			RecordingApp { received: Arc::new(SyncMutex::new(Vec::new())), close_causes: Arc::new(SyncMutex::new(Vec::new())) };
		let name: ServerName<'static> = "localhost".try_into().unwrap();
		let client_stack = StackBuilder::on(Box::new(BioNetwork::new(client_io)))
			.filter(Box::new(TlsFilter::client(ClientConnection::new(client_cfg, name).unwrap(), None)))
			.build(client_app)
			.await
			.unwrap();

		// let the handshake finish before yanking the connection out from
		// under it without a close_notify
		tokio::time::sleep(Duration::from_millis(50)).await;
		drop(client_stack);
		tokio::time::sleep(Duration::from_millis(50)).await;

		let causes = server_close.lock();
		assert_eq!(causes.len(), 1);
		assert!(matches!(causes[0], Some(StackError::TruncatedStream)));
	}

	#[tokio::test]
	async fn untrusted_certificate_fails_handshake() {
		install_crypto_provider();
		let (server_cert, server_key) = self_signed_cert();
		let (other_cert, _other_key) = self_signed_cert();
		let server_cfg = server_config(server_cert, server_key);
		let client_cfg = client_config_trusting(other_cert);

		let (client_io, server_io) = tokio::io::duplex(16 * 1024);

		let server_app =
			RecordingApp { received: Arc::new(SyncMutex::new(Vec::new())), close_causes: Arc::new(SyncMutex::new(Vec::new())) };
		let _server_stack = StackBuilder::on(Box::new(BioNetwork::new(server_io)))
			.filter(Box::new(TlsFilter::server(ServerConnection::new(server_cfg).unwrap(), None)))
			.build(server_app)
			.await
			.unwrap();

		let client_close = Arc::new(SyncMutex::new(Vec::new()));
		let client_app = RecordingApp { received: Arc::new(SyncMutex::new(Vec::new())), close_causes: client_close.clone() };
		let name: ServerName<'static> = "localhost".try_into().unwrap();
		let _client_stack = StackBuilder::on(Box::new(BioNetwork::new(client_io)))
			.filter(Box::new(TlsFilter::client(ClientConnection::new(client_cfg, name).unwrap(), None)))
			.build(client_app)
			.await
			.unwrap();

		tokio::time::sleep(Duration::from_millis(50)).await;
		let causes = client_close.lock();
		assert_eq!(causes.len(), 1);
		assert!(matches!(causes[0], Some(StackError::HandshakeFailure(_))));
	}
}

use std::io;

/// Error kinds surfaced at the stack boundary (spec §6/§7).
#[derive(thiserror::Error, Debug)]
pub enum StackError {
	#[error("bad magic: expected {expected:?}, received {received:?}")]
	BadMagic { expected: Vec<u8>, received: Vec<u8> },

	#[error("connection refused: {0}")]
	Refusal(String),

	#[error("connection permanently refused: {0}")]
	PermanentRefusal(String),

	#[error("tls handshake failed: {0}")]
	HandshakeFailure(String),

	#[error("malformed header block: {0}")]
	ParseError(String),

	#[error("operation attempted on a closed stack")]
	Closed,

	#[error("transport error: {0}")]
	Transport(#[from] io::Error),

	#[error("timed out after {0:?}")]
	Timeout(std::time::Duration),

	#[error("stream closed before TLS close_notify was received")]
	TruncatedStream,
}

/// A close cause carries the primary error plus any secondary errors that
/// occurred while propagating it (spec §7 "Suppressed secondary errors
/// attach to the primary using a suppression list").
#[derive(Debug)]
pub struct CloseCause {
	pub primary: std::sync::Arc<StackError>,
	pub suppressed: Vec<std::sync::Arc<StackError>>,
}

impl CloseCause {
	pub fn new(primary: StackError) -> Self {
		Self {
			primary: std::sync::Arc::new(primary),
			suppressed: Vec::new(),
		}
	}

	pub fn suppress(&mut self, err: StackError) {
		self.suppressed.push(std::sync::Arc::new(err));
	}
}

impl Clone for CloseCause {
	fn clone(&self) -> Self {
		Self {
			primary: self.primary.clone(),
			suppressed: self.suppressed.clone(),
		}
	}
}

impl std::fmt::Display for CloseCause {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		write!(f, "{}", self.primary)?;
		for s in &self.suppressed {
			write!(f, " (suppressed: {s})")?;
		}
		Ok(())
	}
}

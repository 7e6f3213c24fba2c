//! Runtime configuration for the `stackwire` binary.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
	pub listen_addr: String,
	#[serde(default = "default_magic")]
	pub magic: String,
	#[serde(default)]
	pub headers: BTreeMap<String, Option<String>>,
	#[serde(default)]
	pub tls: Option<TlsConfig>,
	#[serde(default = "default_workers")]
	pub workers: usize,
	/// Force-close a stack that sits half-open (one direction closed, the
	/// other still open) for longer than this many seconds.
	#[serde(default = "default_idle_timeout_secs")]
	pub idle_timeout_secs: u64,
}

fn default_magic() -> String {
	"ACK".to_string()
}

fn default_workers() -> usize {
	0 // 0 means "let the hub pick cores*2-1"
}

fn default_idle_timeout_secs() -> u64 {
	30
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
	pub cert_path: PathBuf,
	pub key_path: PathBuf,
	/// Client certificates are mandatory in the server role; this is the CA
	/// bundle they're verified against. Trust-store discovery itself is
	/// outside the core's scope; this binary is the "caller" that builds the
	/// context the core consumes.
	pub client_ca_path: PathBuf,
}

//! Header exchange filter (spec §4.H): after the transport (and TLS, if
//! present) is ready, each side sends one length-prefixed JSON-subset
//! dictionary and waits for the peer's.
//!
//! The wire grammar is a deliberately strict subset of JSON (object of
//! string keys to string-or-null values only; no arrays, numbers, booleans,
//! or comments) and must reject anything outside it, so this filter parses
//! and serializes by hand instead of reusing `serde_json` the way the rest
//! of this crate reaches for it elsewhere.

use crate::layer::{Layer, NeighborHandle};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use stackwire_core::{CloseCause, StackError};
use std::collections::BTreeMap;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::state::HalfOpenState;

pub type HeaderMap = BTreeMap<String, Option<String>>;

const MAX_PAYLOAD: usize = 65535;

/// Outcome of the listener invoked once the peer's header block decodes.
pub enum HeaderDecision {
	Accept,
	Refuse(String),
	PermanentRefuse(String),
}

pub type HeaderListener = Box<dyn Fn(&HeaderMap) -> HeaderDecision + Send + Sync>;

pub struct HeaderFilter {
	local: Bytes,
	listener: HeaderListener,
	state: HalfOpenState,
	sent: AtomicBool,
	inbox: Mutex<BytesMut>,
	io: OnceLock<NeighborHandle>,
}

impl HeaderFilter {
	pub fn new(local: &HeaderMap, listener: HeaderListener) -> Result<Self, StackError> {
		let encoded = encode(local)?;
		if encoded.len() > MAX_PAYLOAD {
			return Err(StackError::ParseError(format!(
				"local header block is {} bytes, exceeds {MAX_PAYLOAD}",
				encoded.len()
			)));
		}
		let mut framed = BytesMut::with_capacity(4 + encoded.len());
		framed.extend_from_slice(&(encoded.len() as u32).to_be_bytes());
		framed.extend_from_slice(encoded.as_bytes());
		Ok(Self {
			local: framed.freeze(),
			listener,
			state: HalfOpenState::new(),
			sent: AtomicBool::new(false),
			inbox: Mutex::new(BytesMut::new()),
			io: OnceLock::new(),
		})
	}

	fn io(&self) -> &NeighborHandle {
		self.io.get().expect("header filter used before start")
	}

	async fn close_both(&self, cause: CloseCause) {
		self.state.close_send();
		self.state.close_read();
		self.io().close_send_down(Some(cause.clone())).await;
		self.io().close_recv_up(Some(cause)).await;
	}
}

#[async_trait]
impl Layer for HeaderFilter {
	async fn start(&self, io: NeighborHandle) -> Result<(), StackError> {
		let _ = self.io.set(io.clone());
		io.send_down(self.local.clone()).await?;
		self.sent.store(true, Ordering::Release);
		Ok(())
	}

	async fn accept_recv(&self, data: Bytes) {
		let mut inbox = self.inbox.lock().await;
		inbox.extend_from_slice(&data);

		if inbox.len() < 4 {
			return;
		}
		let len = u32::from_be_bytes([inbox[0], inbox[1], inbox[2], inbox[3]]) as usize;
		if len > MAX_PAYLOAD {
			let cause = CloseCause::new(StackError::ParseError(format!(
				"peer header block length {len} exceeds {MAX_PAYLOAD}"
			)));
			drop(inbox);
			self.close_both(cause).await;
			return;
		}
		if inbox.len() < 4 + len {
			return;
		}

		let mut framed = inbox.split_to(4 + len);
		let rest = inbox.split_off(0);
		drop(inbox);
		let payload = framed.split_off(4);
		let text = match std::str::from_utf8(&payload) {
			Ok(t) => t,
			Err(e) => {
				self.close_both(CloseCause::new(StackError::ParseError(e.to_string()))).await;
				return;
			},
		};

		let decoded = match decode(text) {
			Ok(map) => map,
			Err(e) => {
				warn!(error = %e, "header filter: malformed header block");
				self.close_both(CloseCause::new(StackError::ParseError(e))).await;
				return;
			},
		};

		match (self.listener)(&decoded) {
			HeaderDecision::Accept => {
				debug!(entries = decoded.len(), "header filter: peer headers accepted");
				if !rest.is_empty() {
					self.io().forward_up(rest.freeze()).await;
				}
			},
			HeaderDecision::Refuse(msg) => {
				self.close_both(CloseCause::new(StackError::Refusal(msg))).await;
			},
			HeaderDecision::PermanentRefuse(msg) => {
				self.close_both(CloseCause::new(StackError::PermanentRefusal(msg))).await;
			},
		}
	}

	async fn accept_send(&self, data: Bytes) -> Result<(), StackError> {
		if !self.state.is_send_open() {
			return Err(StackError::Closed);
		}
		self.io().send_down(data).await
	}

	async fn accept_close_send(&self, cause: Option<CloseCause>) {
		if self.state.close_send() {
			self.io().close_send_down(cause).await;
		}
	}

	async fn accept_recv_closed(&self, cause: Option<CloseCause>) {
		if self.state.close_read() {
			self.io().close_recv_up(cause).await;
		}
	}

	fn is_send_open(&self) -> bool {
		self.state.is_send_open()
	}

	fn is_read_open(&self) -> bool {
		self.state.is_read_open()
	}
}

/// Serializes a dictionary to the exact grammar §4.H describes: `{"k":"v",
/// "k2":null}`, no extraneous whitespace.
fn encode(map: &HeaderMap) -> Result<String, StackError> {
	let mut out = String::from("{");
	for (i, (k, v)) in map.iter().enumerate() {
		if i > 0 {
			out.push(',');
		}
		encode_string(k, &mut out);
		out.push(':');
		match v {
			Some(s) => encode_string(s, &mut out),
			None => out.push_str("null"),
		}
	}
	out.push('}');
	Ok(out)
}

fn encode_string(s: &str, out: &mut String) {
	out.push('"');
	for c in s.chars() {
		match c {
			'"' => out.push_str("\\\""),
			'\\' => out.push_str("\\\\"),
			'\n' => out.push_str("\\n"),
			'\r' => out.push_str("\\r"),
			'\t' => out.push_str("\\t"),
			'\u{8}' => out.push_str("\\b"),
			'\u{c}' => out.push_str("\\f"),
			c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
			c => out.push(c),
		}
	}
	out.push('"');
}

/// Parses the strict subset grammar §4.H defines: object only, string or
/// `null` values, double-quoted strings with a fixed escape set, no
/// arrays/numbers/booleans/comments, nothing after the closing brace.
fn decode(text: &str) -> Result<HeaderMap, String> {
	let mut parser = Parser { chars: text.chars().peekable() };
	parser.skip_ws();
	let map = parser.parse_object()?;
	parser.skip_ws();
	if parser.chars.peek().is_some() {
		return Err("trailing data after header object".into());
	}
	Ok(map)
}

struct Parser<'a> {
	chars: std::iter::Peekable<std::str::Chars<'a>>,
}

const WS: &[char] = &[' ', '\t', '\n', '\r', '\u{c}', '\u{8}'];

impl<'a> Parser<'a> {
	fn skip_ws(&mut self) {
		while matches!(self.chars.peek(), Some(c) if WS.contains(c)) {
			self.chars.next();
		}
	}

	fn expect(&mut self, c: char) -> Result<(), String> {
		match self.chars.next() {
			Some(x) if x == c => Ok(()),
			Some(x) => Err(format!("expected '{c}', found '{x}'")),
			None => Err(format!("expected '{c}', found end of input")),
		}
	}

	fn parse_object(&mut self) -> Result<HeaderMap, String> {
		self.expect('{')?;
		let mut map = HeaderMap::new();
		self.skip_ws();
		if self.chars.peek() == Some(&'}') {
			self.chars.next();
			return Ok(map);
		}
		loop {
			self.skip_ws();
			let key = self.parse_string()?;
			self.skip_ws();
			self.expect(':')?;
			self.skip_ws();
			let value = self.parse_value()?;
			map.insert(key, value);
			self.skip_ws();
			match self.chars.next() {
				Some(',') => continue,
				Some('}') => break,
				Some(c) => return Err(format!("expected ',' or '}}', found '{c}'")),
				None => return Err("unterminated object".into()),
			}
		}
		Ok(map)
	}

	fn parse_value(&mut self) -> Result<Option<String>, String> {
		match self.chars.peek() {
			Some('"') => Ok(Some(self.parse_string()?)),
			Some('n') => {
				for expected in ['n', 'u', 'l', 'l'] {
					self.expect(expected)?;
				}
				Ok(None)
			},
			Some(c) => Err(format!("expected string or null, found '{c}'")),
			None => Err("expected string or null, found end of input".into()),
		}
	}

	fn parse_string(&mut self) -> Result<String, String> {
		self.expect('"')?;
		let mut out = String::new();
		loop {
			match self.chars.next() {
				Some('"') => return Ok(out),
				Some('\\') => match self.chars.next() {
					Some('"') => out.push('"'),
					Some('\\') => out.push('\\'),
					Some('/') => out.push('/'),
					Some('b') => out.push('\u{8}'),
					Some('f') => out.push('\u{c}'),
					Some('n') => out.push('\n'),
					Some('r') => out.push('\r'),
					Some('t') => out.push('\t'),
					Some('u') => {
						let mut hex = String::with_capacity(4);
						for _ in 0..4 {
							hex.push(self.chars.next().ok_or("unterminated \\u escape")?);
						}
						let code = u32::from_str_radix(&hex, 16).map_err(|_| "invalid \\u escape")?;
						out.push(char::from_u32(code).ok_or("invalid unicode scalar in \\u escape")?);
					},
					Some(c) => return Err(format!("invalid escape '\\{c}'")),
					None => return Err("unterminated escape".into()),
				},
				Some(c) => out.push(c),
				None => return Err("unterminated string".into()),
			}
		}
	}
}

pub fn accepting_listener() -> HeaderListener {
	Box::new(|_| HeaderDecision::Accept)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn encode_decode_round_trips() {
		let mut map = HeaderMap::new();
		map.insert("id".into(), Some("east".into()));
		map.insert("note".into(), None);
		map.insert("weird".into(), Some("line\nbreak\t\"quote\"".into()));
		let encoded = encode(&map).unwrap();
		let decoded = decode(&encoded).unwrap();
		assert_eq!(decoded, map);
	}

	#[test]
	fn decode_rejects_single_quotes() {
		assert!(decode("{'id':'east'}").is_err());
	}

	#[test]
	fn decode_rejects_numbers() {
		assert!(decode(r#"{"id":5}"#).is_err());
	}

	#[test]
	fn decode_rejects_trailing_object() {
		assert!(decode(r#"{"id":"east"}{"id":"west"}"#).is_err());
	}

	#[test]
	fn decode_permits_whitespace_between_tokens() {
		let text = "{ \"id\" : \"east\" , \"k\" : null }";
		let decoded = decode(text).unwrap();
		assert_eq!(decoded.get("id").unwrap().as_deref(), Some("east"));
		assert_eq!(decoded.get("k").unwrap(), &None);
	}

	#[test]
	fn decode_unicode_escape() {
		let decoded = decode(r#"{"k":"Aé"}"#).unwrap();
		assert_eq!(decoded.get("k").unwrap().as_deref(), Some("A\u{e9}"));
	}

	#[tokio::test]
	async fn local_header_block_exceeding_cap_fails_construction() {
		let mut map = HeaderMap::new();
		map.insert("big".into(), Some("x".repeat(70_000)));
		let result = HeaderFilter::new(&map, accepting_listener());
		assert!(matches!(result, Err(StackError::ParseError(_))));
	}
}

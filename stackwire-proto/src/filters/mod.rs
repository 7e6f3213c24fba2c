pub mod ack;
pub mod header;
pub mod tls;

pub use ack::AckFilter;
pub use header::{HeaderDecision, HeaderFilter, HeaderListener, HeaderMap, accepting_listener};
pub use tls::{PeerInfo, PostHandshakeHook, TlsFilter};

//! Upstream brokerage session.
//!
//! This crate owns the single logical connection to the brokerage API and
//! exposes exactly two surfaces to the rest of the gateway: an outbound
//! request sink ([`SessionHandle`]) and an inbound event stream (the receiver
//! returned by [`UpstreamSession::new`]). Connection lifecycle — dial,
//! handshake, heartbeat, reconnect with exponential backoff — is entirely
//! internal; other components observe it only through the session phase and
//! the synthetic `ConnectionReady`/`ConnectionLost` events.
//!
//! The vendor SDK boundary is the [`transport`] module: a trait pair that
//! yields typed requests and events, with a length-prefixed JSON TCP codec as
//! the production implementation and a scripted in-memory one for tests.

pub mod backoff;
pub mod error;
pub mod session;
pub mod testing;
pub mod transport;

pub use backoff::Backoff;
pub use error::{SessionError, TransportError};
pub use session::{
    SessionConfig, SessionEvent, SessionHandle, SessionPhase, UpstreamSession,
};
pub use transport::{TcpTransport, VendorSink, VendorStream, VendorTransport};

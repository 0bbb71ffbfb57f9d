//! Error types for the upstream session.

use thiserror::Error;

/// Failures surfaced to components that send through a [`crate::SessionHandle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    /// The session phase is not `Ready`; sends are not permitted.
    #[error("upstream session is not ready")]
    NotReady,

    /// The outbound queue is full.
    #[error("upstream outbound queue is full")]
    BackpressureExceeded,

    /// The send deadline elapsed before the request was enqueued.
    #[error("upstream send deadline elapsed")]
    Timeout,

    /// The session task has terminated.
    #[error("upstream session is closed")]
    Closed,

    /// The reconnect attempt bound was exhausted; the session is terminal.
    #[error("upstream session failed permanently")]
    Failed,
}

/// Transport-level failures below the session state machine.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame arrived that does not decode to a known event. The session
    /// drops the frame and keeps the connection.
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("frame of {0} bytes exceeds the frame limit")]
    FrameTooLarge(usize),

    #[error("connection closed by peer")]
    Closed,
}

//! Gateway error types.

use thiserror::Error;
use upstream::SessionError;

/// Client-visible command failures. The variant determines the `error_code`
/// field of the resulting `error` message; the connection stays open.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{0}")]
    BadRequest(String),

    #[error("upstream session is not connected")]
    NotConnected,

    #[error("an identical subscription already exists")]
    DuplicateSubscription,

    #[error("order not found")]
    NotFound,

    #[error("order belongs to another client")]
    NotOwned,

    #[error("order is already in a terminal state")]
    Terminal,

    #[error("upstream send timed out")]
    Timeout,
}

impl CommandError {
    pub fn code(&self) -> &'static str {
        match self {
            CommandError::BadRequest(_) => "bad_request",
            CommandError::NotConnected => "not_connected",
            CommandError::DuplicateSubscription => "duplicate_subscription",
            CommandError::NotFound => "not_found",
            CommandError::NotOwned => "not_owned",
            CommandError::Terminal => "terminal",
            CommandError::Timeout => "timeout",
        }
    }
}

impl From<SessionError> for CommandError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotReady | SessionError::Closed | SessionError::Failed => {
                CommandError::NotConnected
            }
            SessionError::BackpressureExceeded | SessionError::Timeout => CommandError::Timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_the_wire_contract() {
        assert_eq!(CommandError::NotConnected.code(), "not_connected");
        assert_eq!(CommandError::NotOwned.code(), "not_owned");
        assert_eq!(
            CommandError::BadRequest("x".to_string()).code(),
            "bad_request"
        );
    }

    #[test]
    fn session_errors_collapse_to_client_codes() {
        assert_eq!(
            CommandError::from(SessionError::NotReady),
            CommandError::NotConnected
        );
        assert_eq!(
            CommandError::from(SessionError::BackpressureExceeded),
            CommandError::Timeout
        );
    }
}

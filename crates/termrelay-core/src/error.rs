use crate::frame::{DecodeError, ErrorCode, SessionId};
use std::time::Duration;
use thiserror::Error;

/// Errors produced by the relay.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    #[error("spawn failed: {0}")]
    Spawn(String),

    #[error("session {0} already has a live connection")]
    AlreadyBound(SessionId),

    #[error("connection {0} is already bound to another session")]
    ConnectionBusy(u64),

    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("connection is not attached to a session")]
    NotAttached,

    #[error("pty read failure: {0}")]
    PtyRead(String),

    #[error("pty closed")]
    PtyClosed,

    #[error("client did not drain output within {0:?}")]
    BackpressureTimeout(Duration),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("ssh connect failed: {0}")]
    SshConnect(String),

    #[error("max sessions ({0}) reached")]
    Capacity(usize),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("token error: {0}")]
    Token(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl RelayError {
    /// Stable wire code reported to clients in an `error` frame.
    pub fn code(&self) -> ErrorCode {
        match self {
            RelayError::Decode(DecodeError::MalformedFrame(_)) => ErrorCode::MalformedFrame,
            RelayError::Decode(DecodeError::UnknownFrameType(_)) => ErrorCode::UnknownFrameType,
            RelayError::Spawn(_) | RelayError::SshConnect(_) => ErrorCode::SpawnFailed,
            RelayError::AlreadyBound(_) | RelayError::ConnectionBusy(_) => ErrorCode::AlreadyBound,
            RelayError::SessionNotFound(_) => ErrorCode::SessionNotFound,
            RelayError::NotAttached => ErrorCode::NotAttached,
            RelayError::PtyRead(_) | RelayError::PtyClosed => ErrorCode::PtyReadFailure,
            RelayError::BackpressureTimeout(_) => ErrorCode::WriteBackpressureTimeout,
            RelayError::AuthFailed(_) | RelayError::Token(_) => ErrorCode::Unauthorized,
            RelayError::Capacity(_) => ErrorCode::CapacityExceeded,
            RelayError::RateLimited(_) => ErrorCode::RateLimited,
            RelayError::Transport(_)
            | RelayError::Config(_)
            | RelayError::Io(_)
            | RelayError::Other(_) => ErrorCode::Internal,
        }
    }
}

pub type RelayResult<T> = Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let id = SessionId::new();
        assert_eq!(RelayError::AlreadyBound(id).code(), ErrorCode::AlreadyBound);
        assert_eq!(RelayError::SessionNotFound(id).code(), ErrorCode::SessionNotFound);
        assert_eq!(RelayError::SshConnect("refused".into()).code(), ErrorCode::SpawnFailed);
        assert_eq!(
            RelayError::BackpressureTimeout(Duration::from_secs(1)).code(),
            ErrorCode::WriteBackpressureTimeout
        );
        assert_eq!(
            RelayError::from(DecodeError::UnknownFrameType("x".into())).code(),
            ErrorCode::UnknownFrameType
        );
    }
}

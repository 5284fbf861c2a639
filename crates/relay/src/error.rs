//! Error taxonomy for the relay. The kind decides the reaction: `Config`
//! and startup `Auth` are process-fatal; everything else is handled by the
//! owning pipeline (retry or rebuild); `Cancelled` is a clean exit, not a
//! failure.

use camrelay_rtsp::RtspError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("configuration: {0}")]
    Config(String),
    #[error("authentication: {0}")]
    Auth(String),
    #[error("protocol: {0}")]
    Protocol(String),
    #[error("transport: {0}")]
    Transport(String),
    #[error("negotiation: {0}")]
    Negotiation(String),
    #[error("stream expired before renewal completed")]
    Expiry,
    #[error("cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RelayError>;

impl From<RtspError> for RelayError {
    fn from(e: RtspError) -> Self {
        let message = e.to_string();
        match e {
            RtspError::Io(_) | RtspError::Closed | RtspError::Timeout => {
                RelayError::Transport(message)
            }
            RtspError::Protocol(_) | RtspError::Status { .. } => RelayError::Protocol(message),
        }
    }
}

impl From<reqwest::Error> for RelayError {
    fn from(e: reqwest::Error) -> Self {
        RelayError::Transport(e.to_string())
    }
}

impl From<webrtc::Error> for RelayError {
    fn from(e: webrtc::Error) -> Self {
        RelayError::Negotiation(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rtsp_errors_map_to_kinds() {
        let closed: RelayError = RtspError::Closed.into();
        assert!(matches!(closed, RelayError::Transport(_)));
        let bad: RelayError = RtspError::Protocol("bad frame".into()).into();
        assert!(matches!(bad, RelayError::Protocol(_)));
        let status: RelayError = RtspError::Status {
            method: "PLAY",
            status: 454,
            reason: "Session Not Found".into(),
        }
        .into();
        assert!(matches!(status, RelayError::Protocol(_)));
    }
}

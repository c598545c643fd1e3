use crate::config::ConfigError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, AvsError>;

/// Protocol-level failures: the server answered, but not in a shape we accept.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Unexpected status code: {0}")]
    UnexpectedStatus(u16),

    #[error("Response is missing a Content-Type header")]
    MissingContentType,

    #[error("No boundary attribute in content type: {0}")]
    MissingBoundary(String),

    #[error("Malformed directive: {0}")]
    MalformedDirective(String),
}

#[derive(Error, Debug)]
pub enum AvsError {
    #[error("Transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Downchannel is already open")]
    DownchannelAlreadyOpen,

    #[error("No Speak directive has been received yet")]
    NoSpeakToken,

    #[error("Client has been shut down")]
    ClientClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("No Tokio runtime available to run the client")]
    NoRuntime,
}

impl AvsError {
    /// True when the failure happened before the server produced a response.
    pub fn is_transport(&self) -> bool {
        matches!(self, AvsError::Transport(_))
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            AvsError::Protocol(ProtocolError::UnexpectedStatus(code)) => Some(*code),
            AvsError::Transport(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_from_protocol_error() {
        let err: AvsError = ProtocolError::UnexpectedStatus(500).into();
        assert_eq!(err.status(), Some(500));
        assert!(!err.is_transport());
        assert_eq!(err.to_string(), "Protocol error: Unexpected status code: 500");
    }

    #[test]
    fn test_auth_error_has_no_status() {
        let err = AvsError::Auth("no token".to_string());
        assert_eq!(err.status(), None);
    }
}

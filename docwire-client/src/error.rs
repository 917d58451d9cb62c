//! Client error types.

use thiserror::Error;

/// Client errors.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] docwire_protocol::ProtocolError),

    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    ConnectionClosed,

    #[error("connection {host}:{port} was destroyed")]
    ConnectionDestroyed { host: String, port: u16 },

    #[error("connection timed out: {0}")]
    Timeout(String),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("server {command} command does not support a readConcern level of {level}")]
    UnsupportedReadConcern { command: String, level: String },

    #[error("server does not support collation")]
    CollationUnsupported,

    #[error("cursor is closed")]
    CursorClosed,

    #[error("cursor does not exist, was killed or timed out")]
    CursorNotFound,

    #[error("Tailable cursor doesn't support {0}")]
    TailableUnsupported(&'static str),

    #[error("No more documents in tailed cursor")]
    TailedCursorEmpty,

    #[error("tailable cursor timed out")]
    TailableRetriesExhausted,

    #[error("count can only be used with find command")]
    CountRequiresFind,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("exceeded maximum write batch size of {max}")]
    BatchTooLarge { size: usize, max: usize },

    #[error("server error{}: {message}", code_suffix(.code))]
    ServerError { code: Option<i32>, message: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

fn code_suffix(code: &Option<i32>) -> String {
    code.map(|c| format!(" {}", c)).unwrap_or_default()
}

impl ClientError {
    /// Returns whether this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::Timeout(_)
                | ClientError::ConnectionClosed
                | ClientError::ConnectionDestroyed { .. }
                | ClientError::CursorNotFound
        )
    }

    /// Returns whether this error came from the transport rather than the server.
    pub fn is_network_error(&self) -> bool {
        matches!(
            self,
            ClientError::Io(_)
                | ClientError::NotConnected
                | ClientError::ConnectionClosed
                | ClientError::ConnectionDestroyed { .. }
                | ClientError::Timeout(_)
                | ClientError::TlsHandshake(_)
        )
    }

    /// Server error code, when one was reported.
    pub fn code(&self) -> Option<i32> {
        match self {
            ClientError::ServerError { code, .. } => *code,
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable() {
        assert!(ClientError::ConnectionClosed.is_retryable());
        assert!(ClientError::Timeout("connection 1 to localhost:27017 timed out".into())
            .is_retryable());
        assert!(!ClientError::CursorClosed.is_retryable());
        assert!(!ClientError::ServerError {
            code: Some(11000),
            message: "dup".into()
        }
        .is_retryable());
    }

    #[test]
    fn test_messages() {
        assert_eq!(ClientError::CursorClosed.to_string(), "cursor is closed");
        assert_eq!(
            ClientError::UnsupportedReadConcern {
                command: "find".into(),
                level: "majority".into()
            }
            .to_string(),
            "server find command does not support a readConcern level of majority"
        );
        assert_eq!(
            ClientError::BatchTooLarge { size: 1001, max: 1000 }.to_string(),
            "exceeded maximum write batch size of 1000"
        );
        assert_eq!(
            ClientError::ServerError {
                code: Some(2),
                message: "bad".into()
            }
            .to_string(),
            "server error 2: bad"
        );
        assert_eq!(
            ClientError::ServerError {
                code: None,
                message: "bad".into()
            }
            .to_string(),
            "server error: bad"
        );
    }

    #[test]
    fn test_network_classification() {
        assert!(ClientError::NotConnected.is_network_error());
        assert!(!ClientError::CountRequiresFind.is_network_error());
        assert_eq!(
            ClientError::ServerError {
                code: Some(13),
                message: "unauthorized".into()
            }
            .code(),
            Some(13)
        );
    }
}

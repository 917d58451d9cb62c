//! Protocol error types.

use thiserror::Error;

/// Protocol-level errors that can occur during framing or message handling.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("invalid message length: {size} (must be > 4 and <= {max})")]
    InvalidMessageLength { size: i64, max: usize },

    #[error("truncated message: need {needed} more bytes")]
    Truncated { needed: usize },

    #[error("unknown opcode: {0}")]
    UnknownOpCode(i32),

    #[error("invalid namespace: {0:?}")]
    InvalidNamespace(String),

    #[error("document too large: {size} bytes (max {max})")]
    DocumentTooLarge { size: usize, max: usize },

    #[error("invalid document: {0}")]
    InvalidDocument(String),

    #[error("reply contains no documents")]
    EmptyReply,

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid UTF-8 in cstring")]
    InvalidUtf8,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::InvalidMessageLength { size: -1, max: 64 };
        let msg = err.to_string();
        assert!(msg.contains("-1"));
        assert!(msg.contains("64"));

        let err = ProtocolError::Truncated { needed: 10 };
        assert!(err.to_string().contains("10"));

        let err = ProtocolError::UnknownOpCode(9999);
        assert!(err.to_string().contains("9999"));

        let err = ProtocolError::InvalidNamespace("db\0coll".to_string());
        assert!(err.to_string().contains("namespace"));

        let err = ProtocolError::DocumentTooLarge { size: 100, max: 50 };
        assert!(err.to_string().contains("100"));

        let err = ProtocolError::InvalidUtf8;
        assert!(err.to_string().contains("UTF-8"));
    }
}

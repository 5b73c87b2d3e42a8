use std::io;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("TOML serialization error: {0}")]
    TomlSerialization(#[from] toml::ser::Error),

    #[error("TOML deserialization error: {0}")]
    TomlDeserialization(#[from] toml::de::Error),

    #[error("Timeout error: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Invalid file metadata: {0}")]
    Validation(String),

    #[error("Session store error: {0}")]
    Storage(String),

    #[error("No registered session for content hash {0}")]
    UnknownSession(String),

    #[error("Merged file digest {actual} does not match content hash {expected}")]
    IntegrityMismatch { expected: String, actual: String },

    #[error("Transfer protocol error: {0}")]
    ProtocolError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("File not found: {0}")]
    FileNotFound(PathBuf),

    #[error("Received error from remote (code {code}): {msg}")]
    RemoteError { code: i32, msg: String },
}

impl TransferError {
    /// Response code reported by the registration endpoint.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::Validation(_) => 1,
            TransferError::Serialization(_) => 2,
            TransferError::Storage(_) => 3,
            _ => 4,
        }
    }

    /// Whether a later attempt at the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransferError::Io(_)
            | TransferError::Timeout(_)
            | TransferError::Http(_)
            | TransferError::Storage(_) => true,
            TransferError::RemoteError { code, .. } => *code >= 3,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "File not found");
        let transfer_error: TransferError = io_error.into();

        match transfer_error {
            TransferError::Io(_) => {}
            _ => panic!("Expected Io error variant"),
        }
    }

    #[test]
    fn test_serialization_error_conversion() {
        let json_error = serde_json::from_str::<i32>("invalid json").unwrap_err();
        let transfer_error: TransferError = json_error.into();

        match transfer_error {
            TransferError::Serialization(_) => {}
            _ => panic!("Expected Serialization error variant"),
        }
    }

    #[test]
    fn test_toml_deserialization_error_conversion() {
        let toml_error = toml::from_str::<i32>("invalid toml").unwrap_err();
        let transfer_error: TransferError = toml_error.into();

        match transfer_error {
            TransferError::TomlDeserialization(_) => {}
            _ => panic!("Expected TomlDeserialization error variant"),
        }
    }

    #[test]
    fn test_unknown_session_error() {
        let error = TransferError::UnknownSession("abc123".to_string());
        assert!(error.to_string().contains("abc123"));
    }

    #[test]
    fn test_integrity_mismatch_error() {
        let error = TransferError::IntegrityMismatch {
            expected: "aa".to_string(),
            actual: "bb".to_string(),
        };
        let error_string = error.to_string();
        assert!(error_string.contains("aa"));
        assert!(error_string.contains("bb"));
    }

    #[test]
    fn test_response_codes() {
        assert_eq!(TransferError::Validation("x".to_string()).code(), 1);
        let json_error = serde_json::from_str::<i32>("nope").unwrap_err();
        assert_eq!(TransferError::Serialization(json_error).code(), 2);
        assert_eq!(TransferError::Storage("down".to_string()).code(), 3);
        assert_eq!(TransferError::UnknownSession("h".to_string()).code(), 4);
    }

    #[test]
    fn test_retryable_errors() {
        assert!(TransferError::Storage("down".to_string()).is_retryable());
        assert!(TransferError::RemoteError { code: 3, msg: "redis".to_string() }.is_retryable());
        assert!(!TransferError::RemoteError { code: 1, msg: "bad".to_string() }.is_retryable());
        assert!(!TransferError::Validation("x".to_string()).is_retryable());
    }

    #[test]
    fn test_error_debug_format() {
        let error = TransferError::ProtocolError("Test error".to_string());
        let debug_string = format!("{:?}", error);
        assert!(debug_string.contains("ProtocolError"));
        assert!(debug_string.contains("Test error"));
    }
}

//! Error types for voxpipe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum VoxpipeError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Chain construction errors
    #[error("Chain cannot be empty")]
    ChainEmpty,

    #[error("Type mismatch: stage '{from}' outputs {output} but stage '{to}' expects {input}")]
    ChainTypeMismatch {
        from: String,
        to: String,
        output: String,
        input: String,
    },

    #[error("Entry index {entry} out of range for chain of {len} stages")]
    EntryOutOfRange { entry: usize, len: usize },

    // Request errors
    #[error("Invalid input for stage '{stage}': {message}")]
    InputRejected { stage: String, message: String },

    #[error("User {user} already has an active request on stage '{stage}'")]
    UserBusy { stage: String, user: String },

    // Backend errors
    #[error("Backend request failed: {message}")]
    Backend { message: String },

    #[error("Backend returned status {status}: {message}")]
    BackendStatus { status: u16, message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

impl VoxpipeError {
    /// True for failures worth retrying against the backend (connection
    /// resets, timeouts, 5xx responses). Everything else is final.
    pub fn is_transient(&self) -> bool {
        match self {
            VoxpipeError::Backend { .. } => true,
            VoxpipeError::BackendStatus { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxpipeError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_file_not_found_display() {
        let error = VoxpipeError::ConfigFileNotFound {
            path: "/path/to/config.toml".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Configuration file not found at /path/to/config.toml"
        );
    }

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoxpipeError::ConfigInvalidValue {
            key: "server.port".to_string(),
            message: "must be positive".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for server.port: must be positive"
        );
    }

    #[test]
    fn test_chain_type_mismatch_display() {
        let error = VoxpipeError::ChainTypeMismatch {
            from: "asr".to_string(),
            to: "tts".to_string(),
            output: "text".to_string(),
            input: "audio".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Type mismatch: stage 'asr' outputs text but stage 'tts' expects audio"
        );
    }

    #[test]
    fn test_user_busy_display() {
        let error = VoxpipeError::UserBusy {
            stage: "llm".to_string(),
            user: "u1".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "User u1 already has an active request on stage 'llm'"
        );
    }

    #[test]
    fn test_backend_status_is_transient() {
        let server_side = VoxpipeError::BackendStatus {
            status: 503,
            message: "overloaded".to_string(),
        };
        assert!(server_side.is_transient());

        let client_side = VoxpipeError::BackendStatus {
            status: 404,
            message: "no such route".to_string(),
        };
        assert!(!client_side.is_transient());
    }

    #[test]
    fn test_backend_is_transient() {
        let error = VoxpipeError::Backend {
            message: "connection reset".to_string(),
        };
        assert!(error.is_transient());
    }

    #[test]
    fn test_input_rejected_not_transient() {
        let error = VoxpipeError::InputRejected {
            stage: "asr".to_string(),
            message: "not base64".to_string(),
        };
        assert!(!error.is_transient());
    }

    #[test]
    fn test_from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoxpipeError = io_error.into();
        assert!(error.to_string().contains("file not found"));
    }

    #[test]
    fn test_from_toml_error() {
        let toml_str = "invalid = toml = syntax";
        let toml_error = toml::from_str::<toml::Value>(toml_str).unwrap_err();
        let error: VoxpipeError = toml_error.into();
        assert!(error.to_string().contains("Configuration error"));
    }

    #[test]
    fn test_error_is_send_and_sync() {
        fn assert_send<T: Send>() {}
        fn assert_sync<T: Sync>() {}

        assert_send::<VoxpipeError>();
        assert_sync::<VoxpipeError>();
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<i32> {
            Ok(42)
        }
        assert_eq!(returns_result().unwrap(), 42);
    }
}

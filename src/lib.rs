//! voxpipe - streaming voice AI pipeline gateway
//!
//! Routes a user's request through an ordered chain of processing stages
//! (speech recognition -> language model -> speech synthesis) and streams
//! intermediate and final outputs back as newline-delimited JSON, one
//! independent chain instance per concurrent user.

// Enforce error handling discipline in non-test code
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod api;
pub mod backend;
pub mod chain;
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod payload;
pub mod protocol;
pub mod stage;
pub mod stages;
pub mod text;

// Core framework (stage -> chain -> multiplexer -> response)
pub use chain::{Chain, ChainBuilder, OutputMux, SessionSupervisor};
pub use stage::{OverlapPolicy, Stage, StageContext, StageWorkers};

// Backend collaborators
pub use backend::{Backend, HttpBackend, MockBackend};

// Data model
pub use payload::{Chunk, Payload, PayloadKind, StreamItem};
pub use protocol::ApiRequest;

// Error handling
pub use error::{Result, VoxpipeError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.3.1+abc1234"` when git hash is available, `"0.3.1"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_string_starts_with_cargo_version() {
        let ver = version_string();
        assert!(
            ver.starts_with(env!("CARGO_PKG_VERSION")),
            "version_string should start with CARGO_PKG_VERSION, got: {}",
            ver
        );
    }
}

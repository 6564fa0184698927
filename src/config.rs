use crate::defaults;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Root configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub asr: AsrConfig,
    pub llm: LlmConfig,
    pub tts: TtsConfig,
}

/// API server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Cap on simultaneously admitted requests (admission semaphore).
    pub max_sessions: usize,
    /// Seconds without output after which an inactive response stream ends.
    pub stream_idle_timeout_secs: u64,
}

/// Connection settings for one stage's inference backend
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// URL the stage posts its requests to.
    pub endpoint: String,
    /// URL probed by heartbeat; defaults to `endpoint` when empty.
    pub health_endpoint: String,
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
    /// Bounded retries on transient failures (5xx, connect/read errors).
    pub retries: u32,
    pub retry_delay_ms: u64,
}

/// Speech recognition stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AsrConfig {
    /// Watchdog limit on one request's processing time, in seconds.
    pub max_duration_secs: u64,
    pub backend: BackendConfig,
}

/// Language model stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    pub max_duration_secs: u64,
    /// Strip `<think>...</think>` segments from the text forwarded
    /// downstream. The client still receives them in incremental output.
    pub strip_think: bool,
    pub backend: BackendConfig,
}

/// Speech synthesis stage configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TtsConfig {
    pub max_duration_secs: u64,
    pub backend: BackendConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::HOST.to_string(),
            port: defaults::PORT,
            max_sessions: defaults::MAX_SESSIONS,
            stream_idle_timeout_secs: defaults::STREAM_IDLE_TIMEOUT_SECS,
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            health_endpoint: String::new(),
            timeout_secs: defaults::BACKEND_TIMEOUT_SECS,
            connect_timeout_secs: defaults::BACKEND_CONNECT_TIMEOUT_SECS,
            retries: defaults::BACKEND_RETRIES,
            retry_delay_ms: defaults::BACKEND_RETRY_DELAY_MS,
        }
    }
}

impl Default for AsrConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                endpoint: "http://127.0.0.1:10095/recognize".to_string(),
                ..Default::default()
            },
            max_duration_secs: defaults::STAGE_MAX_DURATION_SECS,
        }
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                endpoint: "http://127.0.0.1:11434/api/chat".to_string(),
                ..Default::default()
            },
            max_duration_secs: defaults::STAGE_MAX_DURATION_SECS,
            strip_think: true,
        }
    }
}

impl Default for TtsConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig {
                endpoint: "http://127.0.0.1:9880/synthesize".to_string(),
                ..Default::default()
            },
            max_duration_secs: defaults::STAGE_MAX_DURATION_SECS,
        }
    }
}

impl BackendConfig {
    /// Request timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connect timeout as a `Duration`.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    /// Delay between retries as a `Duration`.
    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    /// URL to probe for liveness.
    pub fn health_url(&self) -> &str {
        if self.health_endpoint.is_empty() {
            &self.endpoint
        } else {
            &self.health_endpoint
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// Returns an error if the file contains invalid TOML.
    /// Missing fields will use default values.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load configuration from a file or return defaults if file doesn't exist
    ///
    /// Only returns defaults if the file is missing.
    /// Returns errors for invalid TOML.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match Self::load(path) {
            Ok(config) => Ok(config),
            Err(e) => {
                if e.downcast_ref::<std::io::Error>()
                    .map(|io_err| io_err.kind() == std::io::ErrorKind::NotFound)
                    .unwrap_or(false)
                {
                    Ok(Self::default())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Apply environment variable overrides
    ///
    /// Supported environment variables:
    /// - VOXPIPE_HOST → server.host
    /// - VOXPIPE_PORT → server.port
    /// - VOXPIPE_ASR_ENDPOINT → asr.backend.endpoint
    /// - VOXPIPE_LLM_ENDPOINT → llm.backend.endpoint
    /// - VOXPIPE_TTS_ENDPOINT → tts.backend.endpoint
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(host) = std::env::var("VOXPIPE_HOST")
            && !host.is_empty()
        {
            self.server.host = host;
        }

        if let Ok(port) = std::env::var("VOXPIPE_PORT")
            && let Ok(port) = port.parse()
        {
            self.server.port = port;
        }

        if let Ok(endpoint) = std::env::var("VOXPIPE_ASR_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.asr.backend.endpoint = endpoint;
        }

        if let Ok(endpoint) = std::env::var("VOXPIPE_LLM_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.llm.backend.endpoint = endpoint;
        }

        if let Ok(endpoint) = std::env::var("VOXPIPE_TTS_ENDPOINT")
            && !endpoint.is_empty()
        {
            self.tts.backend.endpoint = endpoint;
        }

        self
    }

    /// Get the default configuration file path
    ///
    /// Returns ~/.config/voxpipe/config.toml on Linux
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voxpipe")
            .join("config.toml")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.port, 8000);
        assert_eq!(config.server.max_sessions, 5);
        assert!(config.llm.strip_think);
        assert!(!config.asr.backend.endpoint.is_empty());
    }

    #[test]
    fn test_load_full_config() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
[server]
host = "127.0.0.1"
port = 9000
max_sessions = 2

[asr.backend]
endpoint = "http://asr.local/recognize"
retries = 5

[llm]
strip_think = false

[llm.backend]
endpoint = "http://llm.local/chat"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.max_sessions, 2);
        assert_eq!(config.asr.backend.endpoint, "http://asr.local/recognize");
        assert_eq!(config.asr.backend.retries, 5);
        assert!(!config.llm.strip_think);
        assert_eq!(config.llm.backend.endpoint, "http://llm.local/chat");
        // Unspecified sections keep defaults
        assert_eq!(config.tts.backend.retries, 2);
    }

    #[test]
    fn test_load_missing_fields_use_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 1234").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 1234);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.server.stream_idle_timeout_secs, 30);
    }

    #[test]
    fn test_load_invalid_toml_is_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server = not valid toml =").unwrap();
        assert!(Config::load(file.path()).is_err());
    }

    #[test]
    fn test_load_or_default_missing_file() {
        let config = Config::load_or_default(Path::new("/nonexistent/voxpipe.toml")).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn test_load_or_default_propagates_parse_error() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "server = [broken").unwrap();
        assert!(Config::load_or_default(file.path()).is_err());
    }

    #[test]
    fn test_backend_durations() {
        let backend = BackendConfig {
            timeout_secs: 7,
            connect_timeout_secs: 3,
            retry_delay_ms: 250,
            ..Default::default()
        };
        assert_eq!(backend.timeout(), Duration::from_secs(7));
        assert_eq!(backend.connect_timeout(), Duration::from_secs(3));
        assert_eq!(backend.retry_delay(), Duration::from_millis(250));
    }

    #[test]
    fn test_health_url_falls_back_to_endpoint() {
        let backend = BackendConfig {
            endpoint: "http://x/run".to_string(),
            ..Default::default()
        };
        assert_eq!(backend.health_url(), "http://x/run");

        let backend = BackendConfig {
            endpoint: "http://x/run".to_string(),
            health_endpoint: "http://x/health".to_string(),
            ..Default::default()
        };
        assert_eq!(backend.health_url(), "http://x/health");
    }

    #[test]
    fn test_config_roundtrip() {
        let config = Config::default();
        let serialized = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}

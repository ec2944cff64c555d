//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level RoleCall configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stream: Option<StreamConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub playback: Option<PlaybackConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub capture: Option<CaptureConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Duplex endpoint base. Derived from `base_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: None,
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_base_url() -> String {
    "http://localhost:8000".into()
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl ServerConfig {
    /// Resolve the websocket base URL, swapping `http(s)` for `ws(s)`.
    pub fn resolve_ws_url(&self) -> String {
        if let Some(url) = &self.ws_url {
            return url.trim_end_matches('/').to_string();
        }
        let base = self.base_url.trim_end_matches('/');
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            base.to_string()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Ask the server to stream its own synthesized audio (`enable_tts`).
    #[serde(default)]
    pub server_tts: bool,

    #[serde(default)]
    pub reconnect: ReconnectConfig,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            handshake_timeout_secs: default_handshake_timeout_secs(),
            server_tts: false,
            reconnect: ReconnectConfig::default(),
        }
    }
}

fn default_handshake_timeout_secs() -> u64 {
    10
}

/// Exponential backoff parameters for the duplex channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Fractional jitter applied to each delay (0.2 = ±20%).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// A connection that stays up this long, or delivers a frame, restores
    /// the full attempt budget. Shorter-lived connections count as failures.
    #[serde(default = "default_stable_after_ms")]
    pub stable_after_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: default_jitter(),
            max_attempts: default_max_attempts(),
            stable_after_ms: default_stable_after_ms(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    30_000
}

fn default_jitter() -> f64 {
    0.2
}

fn default_max_attempts() -> u32 {
    5
}

fn default_stable_after_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackConfig {
    /// Speak every AI reply as soon as it lands.
    #[serde(default = "default_true")]
    pub auto_play: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pitch: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub volume: Option<f32>,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            auto_play: true,
            rate: None,
            pitch: None,
            volume: None,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaptureConfig {
    #[serde(default = "default_mime_type")]
    pub mime_type: String,

    /// Recordings held while the duplex channel is down. The oldest is
    /// discarded once the limit is reached.
    #[serde(default = "default_max_queued_segments")]
    pub max_queued_segments: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            mime_type: default_mime_type(),
            max_queued_segments: default_max_queued_segments(),
        }
    }
}

fn default_max_queued_segments() -> usize {
    4
}

fn default_mime_type() -> String {
    "audio/webm;codecs=opus".into()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "rolecall_engine=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: default_log_format(),
            level: None,
            filters: Vec::new(),
            output: default_log_output(),
        }
    }
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let Ok(re) = regex::Regex::new(r"\$\{([^}]+)\}") else {
        return input.to_string();
    };
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_else(|_| {
            tracing::warn!(var = var_name, "Config references an unset environment variable");
            String::new()
        })
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            tracing::debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::RoleCallError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::RoleCallError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file path.
    pub fn config_dir() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    pub fn stream(&self) -> StreamConfig {
        self.stream.clone().unwrap_or_default()
    }

    pub fn playback(&self) -> PlaybackConfig {
        self.playback.clone().unwrap_or_default()
    }

    pub fn capture(&self) -> CaptureConfig {
        self.capture.clone().unwrap_or_default()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server().request_timeout_secs)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.stream().handshake_timeout_secs)
    }

    /// Get a config value by dotted path (e.g. "server.base_url").
    pub fn get_path(&self, path: &str) -> Option<serde_json::Value> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;
        for segment in path.split('.') {
            current = current.get(segment)?;
        }
        Some(current.clone())
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let server = self.server();
        if !server.base_url.starts_with("http://") && !server.base_url.starts_with("https://") {
            errors.push(format!(
                "server.base_url must be an http(s) URL, got '{}'",
                server.base_url
            ));
        }
        if server.request_timeout_secs == 0 {
            errors.push("server.request_timeout_secs cannot be 0".to_string());
        }
        if let Some(ws) = &server.ws_url {
            if !ws.starts_with("ws://") && !ws.starts_with("wss://") {
                errors.push(format!("server.ws_url must be a ws(s) URL, got '{ws}'"));
            }
        }

        let reconnect = self.stream().reconnect;
        if !(0.0..1.0).contains(&reconnect.jitter) {
            errors.push(format!(
                "stream.reconnect.jitter must be in [0, 1), got {}",
                reconnect.jitter
            ));
        }
        if reconnect.max_attempts == 0 {
            errors.push("stream.reconnect.max_attempts cannot be 0".to_string());
        }
        if reconnect.base_delay_ms > reconnect.max_delay_ms {
            warnings.push(format!(
                "stream.reconnect.base_delay_ms ({}) exceeds max_delay_ms ({}); every delay will be capped",
                reconnect.base_delay_ms, reconnect.max_delay_ms
            ));
        }

        (warnings, errors)
    }
}

/// Base directory for RoleCall data: `~/.rolecall/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rolecall")
}

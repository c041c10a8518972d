/// Configuration management
use crate::error::{FluxError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:8080";
const DEFAULT_DATA_DIR: &str = ".flux";

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base URL of the REST collaborator (plain HTTP)
    pub api_url: String,

    /// Base URL of the push channel (derived from `api_url` when unset)
    pub ws_url: Option<String>,

    /// Timeout applied to every REST call
    pub request_timeout: Duration,

    /// Ping interval on the push channel while connected
    pub keepalive_interval: Duration,

    /// First reconnect delay after the push channel drops
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the reconnect delay
    pub reconnect_max_delay: Duration,

    /// Growth factor applied to the reconnect delay after each failed attempt
    pub reconnect_multiplier: f64,

    /// Give up after this many consecutive failed reconnects (unlimited when unset)
    pub max_reconnect_attempts: Option<u32>,

    /// Page size used when scanning `/friends/users` for unknown peers
    pub users_page_limit: u32,

    /// Directory holding `session.json` (defaults to `~/.flux`)
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            ws_url: None,
            request_timeout: Duration::from_secs(10),
            keepalive_interval: Duration::from_secs(30),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_multiplier: 2.0,
            max_reconnect_attempts: None,
            users_page_limit: 50,
            data_dir: None,
        }
    }
}

impl Config {
    /// Create config from command line arguments.
    ///
    /// Known flags are consumed; the remaining positional arguments (command and
    /// its operands, without the program name) are returned alongside.
    pub fn from_args(args: &[String]) -> Result<(Self, Vec<String>)> {
        let mut config = Config::default();
        let mut rest = Vec::new();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--api-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        FluxError::Config("--api-url requires a URL argument".to_string())
                    })?;
                    config.api_url = url.trim_end_matches('/').to_string();
                    i += 2;
                }
                "--ws-url" => {
                    let url = args.get(i + 1).ok_or_else(|| {
                        FluxError::Config("--ws-url requires a URL argument".to_string())
                    })?;
                    config.ws_url = Some(url.trim_end_matches('/').to_string());
                    i += 2;
                }
                "--data-dir" => {
                    let path = args.get(i + 1).ok_or_else(|| {
                        FluxError::Config("--data-dir requires a path argument".to_string())
                    })?;
                    config.data_dir = Some(PathBuf::from(path));
                    i += 2;
                }
                "--timeout-ms" => {
                    let ms = args.get(i + 1).ok_or_else(|| {
                        FluxError::Config("--timeout-ms requires a number".to_string())
                    })?;
                    let ms = ms.parse::<u64>().map_err(|_| {
                        FluxError::Config("--timeout-ms must be a whole number".to_string())
                    })?;
                    config.request_timeout = Duration::from_millis(ms);
                    i += 2;
                }
                other => {
                    rest.push(other.to_string());
                    i += 1;
                }
            }
        }

        // Env overrides (nice for scripts)
        if let Ok(url) = std::env::var("FLUX_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        if let Ok(url) = std::env::var("FLUX_WS_URL") {
            config.ws_url = Some(url.trim_end_matches('/').to_string());
        }
        if let Ok(dir) = std::env::var("FLUX_DATA_DIR") {
            config.data_dir = Some(PathBuf::from(dir));
        }
        if let Some(ms) = std::env::var("FLUX_TIMEOUT_MS")
            .ok()
            .and_then(|s| s.parse::<u64>().ok())
        {
            config.request_timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok((config, rest))
    }

    /// Reject values the client cannot work with
    pub fn validate(&self) -> Result<()> {
        if !self.api_url.starts_with("http://") {
            return Err(FluxError::Config(format!(
                "api_url must be a plain http:// URL, got {}",
                self.api_url
            )));
        }
        if let Some(ws) = &self.ws_url {
            if !ws.starts_with("ws://") {
                return Err(FluxError::Config(format!(
                    "ws_url must be a plain ws:// URL, got {}",
                    ws
                )));
            }
        }
        if self.keepalive_interval.is_zero() {
            return Err(FluxError::Config("keepalive_interval must be non-zero".to_string()));
        }
        if self.request_timeout.is_zero() {
            return Err(FluxError::Config("request_timeout must be non-zero".to_string()));
        }
        if self.reconnect_initial_delay.is_zero() {
            return Err(FluxError::Config(
                "reconnect_initial_delay must be non-zero".to_string(),
            ));
        }
        if self.reconnect_max_delay < self.reconnect_initial_delay {
            return Err(FluxError::Config(
                "reconnect_max_delay must not be below reconnect_initial_delay".to_string(),
            ));
        }
        if !(self.reconnect_multiplier >= 1.0) {
            return Err(FluxError::Config("reconnect_multiplier must be >= 1.0".to_string()));
        }
        if self.users_page_limit == 0 {
            return Err(FluxError::Config("users_page_limit must be positive".to_string()));
        }
        Ok(())
    }

    /// Base URL of the push channel
    pub fn ws_base(&self) -> String {
        if let Some(ws) = &self.ws_url {
            return ws.clone();
        }
        // `validate` guarantees a plain http:// api_url
        format!("ws://{}", self.api_url.trim_start_matches("http://"))
    }

    /// Full push channel URL for a trust token
    pub fn push_url(&self, token: &str) -> String {
        format!("{}/ws/connect?token={}", self.ws_base(), urlencoding::encode(token))
    }

    /// Directory holding client state files
    pub fn data_dir(&self) -> PathBuf {
        if let Some(dir) = &self.data_dir {
            return dir.clone();
        }
        match std::env::var("HOME") {
            Ok(home) => PathBuf::from(home).join(DEFAULT_DATA_DIR),
            Err(_) => PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

//! # Engine Configuration
//!
//! `EngineConfig` gathers everything the engine reads at start-up: listener
//! ports, coroutine stack size, cache defaults, body limits, WebSocket limits
//! and cookie settings.
//!
//! Configuration is layered:
//!
//! 1. built-in defaults (HTTP on port 9000, HTTPS disabled, `max-age=3600`, ETags on)
//! 2. an optional YAML file ([`EngineConfig::load`])
//! 3. `SAGE_*` environment variables ([`EngineConfig::apply_env`])
//!
//! ## Environment Variables
//!
//! | Variable | Field |
//! |---|---|
//! | `SAGE_HOSTNAME` | `hostname` |
//! | `SAGE_BIND_ADDRESS` | `bind_address` |
//! | `SAGE_HTTP_PORT` | `http_port` (`-1` disables HTTP) |
//! | `SAGE_HTTPS_PORT` | `https_port` (`-1` disables HTTPS) |
//! | `SAGE_STACK_SIZE` | `stack_size`, decimal or `0x` hexadecimal |
//! | `SAGE_CACHE_MAX_AGE` | `cache.max_age` |
//! | `SAGE_USE_ETAG` | `cache.use_etag` |
//! | `SAGE_IDLE_TIMEOUT_SECS` | `idle_timeout_secs` |
//!
//! ## Example
//!
//! ```yaml
//! hostname: example.org
//! http_port: 8080
//! https_port: 8443
//! tls:
//!   cert_path: certs/server.pem
//!   key_path: certs/server.key
//! cache:
//!   max_age: 600
//! websocket:
//!   subprotocols: [chat]
//! ```

use crate::error::EngineError;
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default coroutine stack size (64 KiB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Host name reported by the server handle and used in absolute URLs
    pub hostname: String,
    /// Address both listeners bind to
    pub bind_address: String,
    /// HTTP port; `None` disables the plain listener, `Some(0)` picks an ephemeral port
    pub http_port: Option<u16>,
    /// HTTPS port; requires [`TlsConfig`]
    pub https_port: Option<u16>,
    pub tls: Option<TlsConfig>,
    /// Stack size of connection and async coroutines, in bytes
    pub stack_size: usize,
    /// Connections idle for longer than this are torn down
    pub idle_timeout_secs: Option<u64>,
    pub cache: CacheConfig,
    pub body: BodyConfig,
    pub websocket: WebSocketConfig,
    pub cookies: CookieConfig,
    /// Value of the `Server` response header
    pub server_name: String,
}

/// PEM files for the HTTPS listener.
#[derive(Debug, Clone, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

/// Conditional-response defaults used by [`crate::cache`].
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// `Cache-Control: max-age` in seconds; `0` sends `no-cache`
    pub max_age: u64,
    /// Compute and honour ETags
    pub use_etag: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age: 3600,
            use_etag: true,
        }
    }
}

/// Limits applied while decoding request bodies.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyConfig {
    /// Raw bodies and uploaded files larger than this are spilled to a temporary file
    pub spill_threshold: usize,
    /// Maximum size of an `application/x-www-form-urlencoded` body
    pub max_form_size: usize,
    /// Maximum size of a request line plus headers
    pub max_head_size: usize,
}

impl Default for BodyConfig {
    fn default() -> Self {
        Self {
            spill_threshold: 16 * 1024,
            max_form_size: 1024 * 1024,
            max_head_size: 64 * 1024,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebSocketConfig {
    /// Largest frame or reassembled message accepted from a client
    pub max_payload: usize,
    /// Sub-protocols offered during the handshake, in preference order
    pub subprotocols: Vec<String>,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            max_payload: 16 * 1024 * 1024,
            subprotocols: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CookieConfig {
    /// Prefix of the session and flash cookie names (`{prefix}_SESSION`, `{prefix}_FLASH`)
    pub prefix: String,
    /// Secret used to sign the session cookie; unsigned when absent
    pub secret: Option<String>,
    /// Session cookie lifetime in seconds; a browser-session cookie when absent
    pub session_max_age: Option<u64>,
    pub secure: bool,
    pub http_only: bool,
}

impl Default for CookieConfig {
    fn default() -> Self {
        Self {
            prefix: "SAGE".to_string(),
            secret: None,
            session_max_age: None,
            secure: false,
            http_only: true,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            bind_address: "0.0.0.0".to_string(),
            http_port: Some(9000),
            https_port: None,
            tls: None,
            stack_size: DEFAULT_STACK_SIZE,
            idle_timeout_secs: None,
            cache: CacheConfig::default(),
            body: BodyConfig::default(),
            websocket: WebSocketConfig::default(),
            cookies: CookieConfig::default(),
            server_name: concat!("sagewire/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a YAML file. Missing keys keep their defaults.
    pub fn load(path: &Path) -> Result<Self, EngineError> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("{}: {e}", path.display())))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, EngineError> {
        serde_yaml::from_str(raw).map_err(|e| EngineError::Config(e.to_string()))
    }

    /// Override fields from `SAGE_*` environment variables.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| env::var(key).ok());
    }

    /// Override fields from an arbitrary variable lookup.
    ///
    /// Unparseable values are ignored with a warning and the current value is kept.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("SAGE_HOSTNAME") {
            self.hostname = v;
        }
        if let Some(v) = lookup("SAGE_BIND_ADDRESS") {
            self.bind_address = v;
        }
        if let Some(v) = lookup("SAGE_HTTP_PORT") {
            if let Some(port) = parse_port("SAGE_HTTP_PORT", &v) {
                self.http_port = port;
            }
        }
        if let Some(v) = lookup("SAGE_HTTPS_PORT") {
            if let Some(port) = parse_port("SAGE_HTTPS_PORT", &v) {
                self.https_port = port;
            }
        }
        if let Some(v) = lookup("SAGE_STACK_SIZE") {
            match parse_size(&v) {
                Some(size) => self.stack_size = size,
                None => tracing::warn!(value = %v, "Ignoring invalid SAGE_STACK_SIZE"),
            }
        }
        if let Some(v) = lookup("SAGE_CACHE_MAX_AGE") {
            match v.trim().parse() {
                Ok(age) => self.cache.max_age = age,
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid SAGE_CACHE_MAX_AGE"),
            }
        }
        if let Some(v) = lookup("SAGE_USE_ETAG") {
            match parse_bool(&v) {
                Some(flag) => self.cache.use_etag = flag,
                None => tracing::warn!(value = %v, "Ignoring invalid SAGE_USE_ETAG"),
            }
        }
        if let Some(v) = lookup("SAGE_IDLE_TIMEOUT_SECS") {
            match v.trim().parse::<u64>() {
                Ok(0) => self.idle_timeout_secs = None,
                Ok(secs) => self.idle_timeout_secs = Some(secs),
                Err(_) => tracing::warn!(value = %v, "Ignoring invalid SAGE_IDLE_TIMEOUT_SECS"),
            }
        }
    }

    /// Validate cross-field constraints before the server starts.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.http_port.is_none() && self.https_port.is_none() {
            return Err(EngineError::Config(
                "at least one of http_port and https_port must be set".to_string(),
            ));
        }
        if self.https_port.is_some() && self.tls.is_none() {
            return Err(EngineError::Config(
                "https_port requires tls.cert_path and tls.key_path".to_string(),
            ));
        }
        if self.stack_size < 0x1000 {
            return Err(EngineError::Config(format!(
                "stack_size {} is below the 4 KiB minimum",
                self.stack_size
            )));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_secs.map(Duration::from_secs)
    }
}

/// Parse a byte size given in decimal or `0x` hexadecimal.
pub fn parse_size(value: &str) -> Option<usize> {
    let value = value.trim();
    if let Some(hex) = value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
    {
        usize::from_str_radix(hex, 16).ok()
    } else {
        value.parse().ok()
    }
}

fn parse_port(name: &str, value: &str) -> Option<Option<u16>> {
    match value.trim() {
        "-1" | "" => Some(None),
        v => match v.parse::<u16>() {
            Ok(port) => Some(Some(port)),
            Err(_) => {
                tracing::warn!(variable = name, value = %value, "Ignoring invalid port");
                None
            }
        },
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

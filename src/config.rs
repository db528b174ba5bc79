//! Engine configuration, loadable from TOML.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, XmppError};

/// Standard client-to-server port (RFC 6120).
pub const DEFAULT_PORT: u16 = 5222;

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_true() -> bool {
    true
}

fn default_language() -> String {
    "en".to_string()
}

fn default_negotiation_timeout() -> u64 {
    10
}

fn default_connect_timeout() -> u64 {
    15
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    /// XMPP domain of the account; the stream `to` attribute.
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Connect here instead of resolving `hostname` (`tcp://host:port`, `host:port` or a domain).
    #[serde(default)]
    pub server: Option<String>,
    /// Negotiate STARTTLS when offered.
    #[serde(default = "default_true")]
    pub starttls: bool,
    /// Name checked against the server certificate; defaults to `hostname`.
    #[serde(default)]
    pub validation_host: Option<String>,
    #[serde(default = "default_language")]
    pub language: String,
    /// Default wait for `iq` replies; absent means wait forever.
    #[serde(default)]
    pub default_request_timeout_ms: Option<u64>,
    #[serde(default = "default_negotiation_timeout")]
    pub negotiation_timeout_secs: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Ping the server at this interval once ready.
    #[serde(default)]
    pub keepalive_interval_secs: Option<u64>,
    /// Log every stanza sent and received.
    #[serde(default)]
    pub debug_stanzas: bool,
    /// Skip certificate verification. Development only.
    #[serde(default)]
    pub dangerous_insecure_tls: bool,
    #[serde(default = "default_true")]
    pub resolve_srv: bool,
}

impl EngineConfig {
    pub fn new(hostname: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port: DEFAULT_PORT,
            server: None,
            starttls: true,
            validation_host: None,
            language: default_language(),
            default_request_timeout_ms: None,
            negotiation_timeout_secs: default_negotiation_timeout(),
            connect_timeout_secs: default_connect_timeout(),
            keepalive_interval_secs: None,
            debug_stanzas: false,
            dangerous_insecure_tls: false,
            resolve_srv: true,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| XmppError::Config(format!("Failed to read config file: {e}")))?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| XmppError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.hostname.trim().is_empty() {
            return Err(XmppError::Config("hostname must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(XmppError::Config("port must not be 0".to_string()));
        }
        if self.negotiation_timeout_secs == 0 {
            return Err(XmppError::Config("negotiation_timeout_secs must be positive".to_string()));
        }
        Ok(())
    }

    pub fn validation_host(&self) -> &str {
        self.validation_host.as_deref().unwrap_or(&self.hostname)
    }

    pub fn default_request_timeout(&self) -> Option<Duration> {
        self.default_request_timeout_ms.map(Duration::from_millis)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_secs(self.negotiation_timeout_secs)
    }

    pub fn keepalive_interval(&self) -> Option<Duration> {
        self.keepalive_interval_secs
            .filter(|s| *s > 0)
            .map(Duration::from_secs)
    }
}

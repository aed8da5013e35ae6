//! Proxy configuration.
//!
//! Loads configuration from a TOML file. `$VAR` and `${VAR}` references in
//! the raw text are expanded from the environment before parsing.
//!
//! # Example Configuration
//!
//! ```toml
//! port = 4022
//! upstream_url = "http://127.0.0.1:3000/mcp"
//!
//! [facilitator]
//! url = "https://x402.org/facilitator"
//! api_key = "$FACILITATOR_API_KEY"
//!
//! [payment]
//! networks = ["base-sepolia"]
//!
//! [payment.recipient.evm]
//! address = "0x209693Bc6afc0C5328bA36FaF03C514EF312287C"
//!
//! [payment.prices]
//! search = "$0.01"
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tollgate::networks::NetworkRegistry;
use tollgate_http::DEFAULT_FACILITATOR_URL;
use tollgate_mcp::PaymentGateConfig;
use url::Url;

/// Errors raised while loading the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file exists but could not be read.
    #[error("Failed to read {path}: {source}")]
    Read {
        /// Path of the configuration file.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The TOML is malformed or a key has the wrong shape.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    /// A value parsed but is not usable.
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Top-level proxy configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Bind address (default: `0.0.0.0`).
    #[serde(default = "default_host")]
    pub host: IpAddr,

    /// Bind port (default: `4022`).
    #[serde(default = "default_port")]
    pub port: u16,

    /// The MCP server being proxied.
    pub upstream_url: Url,

    /// Server id attached to every call.
    #[serde(default)]
    pub server_id: Option<String>,

    /// Upstream request timeout in seconds (default: 60).
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,

    /// Static headers added to every upstream request.
    #[serde(default)]
    pub forward_headers: HashMap<String, String>,

    /// Remote facilitator settings.
    #[serde(default)]
    pub facilitator: FacilitatorSettings,

    /// Prices, networks and recipients.
    #[serde(default)]
    pub payment: PaymentGateConfig,
}

/// The `[facilitator]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct FacilitatorSettings {
    /// Facilitator base URL.
    #[serde(default = "default_facilitator_url")]
    pub url: String,

    /// Sent as `Authorization: Bearer <api_key>`.
    #[serde(default)]
    pub api_key: Option<String>,

    /// Per-request timeout in seconds. Unset means no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,

    /// How long `/supported` answers are cached (default: 600).
    #[serde(default = "default_supported_cache_ttl_secs")]
    pub supported_cache_ttl_secs: u64,
}

impl Default for FacilitatorSettings {
    fn default() -> Self {
        Self {
            url: default_facilitator_url(),
            api_key: None,
            timeout_secs: None,
            supported_cache_ttl_secs: default_supported_cache_ttl_secs(),
        }
    }
}

impl FacilitatorSettings {
    /// Request timeout, if one is configured.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    /// Lifetime of a cached `/supported` answer.
    #[must_use]
    pub const fn supported_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.supported_cache_ttl_secs)
    }
}

const fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

const fn default_port() -> u16 {
    4022
}

const fn default_upstream_timeout_secs() -> u64 {
    60
}

const fn default_supported_cache_ttl_secs() -> u64 {
    600
}

fn default_facilitator_url() -> String {
    DEFAULT_FACILITATOR_URL.to_owned()
}

impl ProxyConfig {
    /// Loads configuration from a file path.
    ///
    /// A missing file is read as empty TOML, which fails on the required
    /// `upstream_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, does not parse, or
    /// fails [`validate`](Self::validate).
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = if path.exists() {
            std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.to_owned(),
                source,
            })?
        } else {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            String::new()
        };
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text, expanding environment variables first.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text does not parse or fails validation.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(content);
        let config: Self = toml::from_str(&expanded)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `HOST` / `PORT` overrides.
    #[must_use]
    pub const fn with_overrides(mut self, host: Option<IpAddr>, port: Option<u16>) -> Self {
        if let Some(host) = host {
            self.host = host;
        }
        if let Some(port) = port {
            self.port = port;
        }
        self
    }

    /// Checks values serde cannot.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for a non-HTTP upstream, a facilitator
    /// URL that does not parse, or a network outside the known registry.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !matches!(self.upstream_url.scheme(), "http" | "https") {
            return Err(ConfigError::Invalid(format!(
                "upstream_url must be http or https, got {}",
                self.upstream_url
            )));
        }
        Url::parse(&self.facilitator.url).map_err(|e| {
            ConfigError::Invalid(format!("facilitator.url {}: {e}", self.facilitator.url))
        })?;
        let registry = NetworkRegistry::known();
        for network in &self.payment.networks {
            registry
                .require(network)
                .map_err(|e| ConfigError::Invalid(e.to_string()))?;
        }
        if !self.payment.prices.is_empty() && self.payment.networks.is_empty() {
            tracing::warn!("Tools are priced but no payment networks are configured");
        }
        Ok(())
    }
}

/// Expands `$VAR` and `${VAR}` patterns from the environment.
///
/// Unresolved variables are left as-is.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch != '$' {
            result.push(ch);
            continue;
        }
        let braced = chars.next_if_eq(&'{').is_some();

        let mut name = String::new();
        let mut closed = false;
        while let Some(&c) = chars.peek() {
            if braced && c == '}' {
                chars.next();
                closed = true;
                break;
            }
            if !braced && !c.is_ascii_alphanumeric() && c != '_' {
                break;
            }
            name.push(c);
            chars.next();
        }

        match std::env::var(&name) {
            Ok(value) if !name.is_empty() => result.push_str(&value),
            _ => {
                result.push('$');
                if braced {
                    result.push('{');
                }
                result.push_str(&name);
                if closed {
                    result.push('}');
                }
            }
        }
    }

    result
}

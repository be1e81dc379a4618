use crate::error::ProxyError;
use crate::options::{ProxyOptions, Target, TlsMaterial};
use crate::server::DEFAULT_MAX_HEADER_SIZE;
use crate::transport::Agent;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl std::fmt::Display for LogLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LogLevel::Trace => write!(f, "trace"),
            LogLevel::Debug => write!(f, "debug"),
            LogLevel::Info => write!(f, "info"),
            LogLevel::Warn => write!(f, "warn"),
            LogLevel::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub level: Option<LogLevel>,
}

/// Upstream connection pool settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Maximum idle connections to keep per upstream host
    /// 0 = no reuse (every call opens a new connection)
    /// Default: 10
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    /// How long an idle connection is kept, in seconds
    /// Default: 90s
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            pool_max_idle_per_host: 10,
            pool_idle_timeout_secs: 90,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub listen_addr: SocketAddr,
    #[serde(default = "default_max_header_size")]
    pub max_header_size: usize,
    /// PEM private key file for the TLS listener
    #[serde(default)]
    pub private_key: Option<String>,
    /// PEM certificate chain file for the TLS listener
    #[serde(default)]
    pub certificate: Option<String>,
    /// Without a pool every call opens its own upstream connection.
    #[serde(default)]
    pub connection_pool_enabled: Option<bool>,
    #[serde(default)]
    pub pool: Option<PoolConfig>,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
    #[serde(default)]
    pub proxy: ProxyOptions,
}

fn default_max_header_size() -> usize {
    DEFAULT_MAX_HEADER_SIZE
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            max_header_size: default_max_header_size(),
            private_key: None,
            certificate: None,
            connection_pool_enabled: Some(true),
            pool: None,
            logging: None,
            proxy: ProxyOptions::default(),
        }
    }
}

/// Outcome of [`Config::validate`].
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: String) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: String) {
        self.warnings.push(warning);
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, ProxyError> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content)
            .map_err(|e| ProxyError::Config(format!("Invalid configuration file {}: {}", path, e)))
    }

    pub fn to_file(&self, path: &str) -> Result<(), ProxyError> {
        let content = serde_json::to_string_pretty(self)
            .map_err(|e| ProxyError::Config(format!("Failed to serialize configuration: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn log_level(&self) -> LogLevel {
        self.logging
            .as_ref()
            .and_then(|logging| logging.level.clone())
            .unwrap_or_default()
    }

    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        if self.proxy.target.is_none() && self.proxy.forward.is_none() {
            result.add_error("Either a target or a forward URL is required".to_string());
        }
        for (name, target) in [("target", &self.proxy.target), ("forward", &self.proxy.forward)] {
            if let Some(url @ Target::Url(raw)) = target {
                if let Err(e) = url.resolve() {
                    result.add_error(format!("Invalid {} URL '{}': {}", name, raw, e));
                }
            }
        }

        match (&self.private_key, &self.certificate) {
            (Some(_), None) | (None, Some(_)) => result.add_error(
                "HTTPS requires both a private key and a certificate".to_string(),
            ),
            _ => {}
        }

        if self.max_header_size < 1024 {
            result.add_error(format!(
                "max_header_size {} is too small (minimum 1024 bytes)",
                self.max_header_size
            ));
        }

        for (name, value) in [
            ("timeout", self.proxy.timeout),
            ("proxy_timeout", self.proxy.proxy_timeout),
        ] {
            if value == Some(0) {
                result.add_error(format!("{} must be greater than zero", name));
            }
        }

        if self.proxy.ws_enabled() && self.proxy.target.is_none() {
            result.add_warning(
                "WebSocket proxying is enabled but only a forward URL is set; upgrades will fail"
                    .to_string(),
            );
        }
        if !self.proxy.verify_upstream_tls() {
            result.add_warning("Upstream TLS certificates will not be verified".to_string());
        }
        if let Some(pool) = &self.pool {
            if pool.pool_max_idle_per_host > 100 {
                result.add_warning(format!(
                    "pool_max_idle_per_host {} is unusually high",
                    pool.pool_max_idle_per_host
                ));
            }
        }

        result
    }

    /// Options for a `ProxyServer`: TLS listener material loaded from the key
    /// and certificate files, plus a pooled agent unless pooling is disabled.
    pub fn to_proxy_options(&self) -> Result<ProxyOptions, ProxyError> {
        let mut options = self.proxy.clone();

        if let (Some(key_path), Some(cert_path)) = (&self.private_key, &self.certificate) {
            let key = std::fs::read_to_string(key_path).map_err(|e| {
                ProxyError::Config(format!("Failed to open private key file: {}", e))
            })?;
            let cert = std::fs::read_to_string(cert_path).map_err(|e| {
                ProxyError::Config(format!("Failed to open certificate file: {}", e))
            })?;
            let mut ssl = options.ssl.take().unwrap_or_else(TlsMaterial::default);
            ssl.key = Some(key);
            ssl.cert = Some(cert);
            options.ssl = Some(ssl);
        }

        if self.connection_pool_enabled.unwrap_or(true) && options.agent.is_none() {
            let pool = self.pool.clone().unwrap_or_default();
            options.agent = Some(Agent::new(
                pool.pool_max_idle_per_host,
                Duration::from_secs(pool.pool_idle_timeout_secs),
                options.verify_upstream_tls(),
            )?);
        }

        Ok(options)
    }
}

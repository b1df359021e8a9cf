use crate::error::ProxyError;
use hyper::header::HeaderName;
use log::LevelFilter;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Ordered from most to least verbose, so `record >= threshold` means "emit".
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<log::Level> for LogLevel {
    fn from(level: log::Level) -> Self {
        match level {
            log::Level::Trace => LogLevel::Trace,
            log::Level::Debug => LogLevel::Debug,
            log::Level::Info => LogLevel::Info,
            log::Level::Warn => LogLevel::Warn,
            log::Level::Error => LogLevel::Error,
        }
    }
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::Trace,
            LogLevel::Debug => LevelFilter::Debug,
            LogLevel::Info => LevelFilter::Info,
            LogLevel::Warn => LevelFilter::Warn,
            LogLevel::Error => LevelFilter::Error,
        }
    }
}

impl FromStr for LogLevel {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            _ => Err(ProxyError::Config(format!(
                "Invalid log level: {} (expected trace, debug, info, warn or error)",
                s
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            _ => Err(ProxyError::Config(format!("Invalid log format: {} (expected text or json)", s))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutputType {
    Stdout,
    File,
}

/// One place log lines go. `level` raises the threshold for this output only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogTarget {
    #[serde(rename = "type")]
    pub output_type: LogOutputType,
    pub path: Option<PathBuf>,
    pub level: Option<LogLevel>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: Option<LogLevel>,
    pub format: Option<LogFormat>,
    pub targets: Option<Vec<LogTarget>>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Some(LogLevel::Info),
            format: Some(LogFormat::Text),
            targets: Some(vec![LogTarget {
                output_type: LogOutputType::Stdout,
                path: None,
                level: None,
            }]),
        }
    }
}
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ProxyMode {
    /// Target derived from each request (absolute-form URI, Host header or a default origin)
    Forward,
    /// Every request goes to `reverse_proxy_target`
    Reverse,
}

/// Settings applied to every outbound request for the lifetime of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// 3xx responses are relayed to the caller; the relay never follows them itself.
    #[serde(default)]
    pub redirects_enabled: bool,
    /// Forward the caller's Host header instead of the upstream authority
    #[serde(default)]
    pub preserve_host_header: bool,
    /// Add X-Forwarded-For, X-Forwarded-Proto and X-Forwarded-Host
    #[serde(default = "default_true")]
    pub forwarded_headers: bool,
}

fn default_true() -> bool {
    true
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            redirects_enabled: false,
            preserve_host_header: false,
            forwarded_headers: true,
        }
    }
}

/// Outbound connection pool limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_total_connections")]
    pub max_total_connections: usize,
    #[serde(default = "default_max_connections_per_route")]
    pub max_connections_per_route: usize,
    /// Idle keep-alive connections retained per route.
    /// 0 = no reuse (one connection per exchange)
    #[serde(default = "default_max_idle_per_route")]
    pub max_idle_per_route: usize,
    #[serde(default = "default_pool_idle_timeout")]
    pub idle_timeout_secs: u64,
}

fn default_max_total_connections() -> usize {
    1000
}

fn default_max_connections_per_route() -> usize {
    100
}

fn default_max_idle_per_route() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_total_connections: default_max_total_connections(),
            max_connections_per_route: default_max_connections_per_route(),
            max_idle_per_route: default_max_idle_per_route(),
            idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl PoolConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// Time allowed between submitting the request and receiving the response head
    #[serde(default = "default_response_timeout")]
    pub response_timeout_secs: u64,
    /// Time allowed between two body chunks from the upstream
    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_response_timeout() -> u64 {
    30
}

fn default_read_timeout() -> u64 {
    60
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout(),
            response_timeout_secs: default_response_timeout(),
            read_timeout_secs: default_read_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub mode: ProxyMode,
    pub listen_addr: SocketAddr,
    // Reverse mode upstream base URI
    #[serde(default)]
    pub reverse_proxy_target: Option<String>,
    // Append the request path to the reverse target (path info forwarding)
    #[serde(default = "default_forward_path")]
    pub forward_path: bool,
    // Forward mode fallback origin for origin-form requests, e.g. "http://localhost:80"
    #[serde(default)]
    pub default_upstream: Option<String>,
    #[serde(default)]
    pub request: RequestConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    // Extra header names never copied, on top of the hop-by-hop set
    #[serde(default)]
    pub excluded_headers: Vec<String>,
    // Capacity of the per-exchange response channel, in chunks
    #[serde(default = "default_response_buffer_chunks")]
    pub response_buffer_chunks: usize,
    #[serde(default)]
    pub logging: Option<LoggingConfig>,
}

fn default_forward_path() -> bool {
    true
}

fn default_response_buffer_chunks() -> usize {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: ProxyMode::Forward,
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            reverse_proxy_target: None,
            forward_path: true,
            default_upstream: None,
            request: RequestConfig::default(),
            pool: PoolConfig::default(),
            timeouts: TimeoutConfig::default(),
            excluded_headers: Vec::new(),
            response_buffer_chunks: default_response_buffer_chunks(),
            logging: None,
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> Result<(), Box<dyn std::error::Error>> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Semantic checks that serde cannot express.
    pub fn validate(&self) -> Result<(), ProxyError> {
        match self.mode {
            ProxyMode::Reverse => {
                let target = self.reverse_proxy_target.as_deref().ok_or_else(|| {
                    ProxyError::Config("Reverse proxy mode requires a target URL".to_string())
                })?;
                url::Url::parse(target)?;
            }
            ProxyMode::Forward => {
                if let Some(origin) = &self.default_upstream {
                    url::Url::parse(origin)?;
                }
            }
        }

        if self.request.redirects_enabled {
            return Err(ProxyError::Config(
                "redirects_enabled is not supported: 3xx responses are always relayed to the caller".to_string(),
            ));
        }
        if self.pool.max_total_connections == 0 || self.pool.max_connections_per_route == 0 {
            return Err(ProxyError::Config("Connection limits must be greater than zero".to_string()));
        }
        if self.pool.max_connections_per_route > self.pool.max_total_connections {
            return Err(ProxyError::Config(format!(
                "max_connections_per_route ({}) exceeds max_total_connections ({})",
                self.pool.max_connections_per_route, self.pool.max_total_connections
            )));
        }
        let timeouts = &self.timeouts;
        for (name, secs) in [
            ("connect_timeout_secs", timeouts.connect_timeout_secs),
            ("response_timeout_secs", timeouts.response_timeout_secs),
            ("read_timeout_secs", timeouts.read_timeout_secs),
        ] {
            if secs == 0 {
                return Err(ProxyError::Config(format!("{} must be greater than zero", name)));
            }
        }
        if self.response_buffer_chunks == 0 {
            return Err(ProxyError::Config("response_buffer_chunks must be at least 1".to_string()));
        }
        self.excluded_header_names()?;
        Ok(())
    }

    pub fn excluded_header_names(&self) -> Result<Vec<HeaderName>, ProxyError> {
        self.excluded_headers
            .iter()
            .map(|name| {
                HeaderName::from_bytes(name.trim().as_bytes())
                    .map_err(|e| ProxyError::Config(format!("Invalid excluded header '{}': {}", name, e)))
            })
            .collect()
    }
}

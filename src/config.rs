use crate::error::{ProxyError, Result, Side};
use crate::ray::{DEFAULT_CAPACITY, DEFAULT_CHUNK_SIZE};
use bytes::Bytes;
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Bootstrap configuration of one proxy endpoint
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Server configuration
    pub server: ServerConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration a [`Server`](crate::server::Server) is built from
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port the inbound handler listens on
    pub port: u16,
    /// Inbound protocol and its settings file
    pub inbound: ConnectionConfig,
    /// Outbound protocol and its settings file
    pub outbound: ConnectionConfig,
    /// Per-connection ray sizing
    #[serde(default)]
    pub ray: RayConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Registered protocol name
    pub protocol: String,
    /// Raw protocol settings, handed to the factory unparsed
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl ConnectionConfig {
    pub fn new(protocol: impl Into<String>) -> Self {
        Self { protocol: protocol.into(), file: None }
    }

    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }
}

/// Bounded flow sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RayConfig {
    /// Chunks buffered per direction before writers wait
    pub capacity: usize,
    /// Largest chunk in bytes
    pub chunk_size: usize,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 1080,
            inbound: ConnectionConfig::new("socks"),
            outbound: ConnectionConfig::new("freedom"),
            ray: RayConfig::default(),
        }
    }
}

impl Default for RayConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: "info".to_string() }
    }
}

impl ServerConfig {
    pub fn new(port: u16, inbound: ConnectionConfig, outbound: ConnectionConfig) -> Self {
        Self { port, inbound, outbound, ray: RayConfig::default() }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(ProxyError::InvalidPort { port: self.port });
        }
        if self.inbound.protocol.is_empty() {
            return Err(ProxyError::InvalidConfig("inbound protocol must be set".to_string()));
        }
        if self.outbound.protocol.is_empty() {
            return Err(ProxyError::InvalidConfig("outbound protocol must be set".to_string()));
        }
        if self.ray.capacity == 0 {
            return Err(ProxyError::InvalidConfig("ray capacity must be > 0".to_string()));
        }
        if self.ray.chunk_size == 0 {
            return Err(ProxyError::InvalidConfig("ray chunk_size must be > 0".to_string()));
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| ProxyError::InvalidConfig(e.to_string()))?;

        info!("Configuration loaded from file");
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        self.server.validate()?;

        match self.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            _ => return Err(ProxyError::InvalidConfig("Invalid log level".to_string())),
        }

        Ok(())
    }
}

/// Read the raw settings blob of one side.
pub fn load_settings(side: Side, path: &Path) -> Result<Bytes> {
    let content = fs::read(path).map_err(|source| ProxyError::ConfigLoadFailed {
        side,
        path: path.to_path_buf(),
        source,
    })?;
    info!("Loaded {} settings from {}", side, path.display());
    Ok(Bytes::from(content))
}

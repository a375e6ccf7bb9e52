use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Which handler kind an error refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Inbound,
    Outbound,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Inbound => f.write_str("inbound"),
            Side::Outbound => f.write_str("outbound"),
        }
    }
}

#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Unknown {side} protocol: {name}")]
    UnknownProtocol { side: Side, name: String },

    #[error("Protocol {name} is already registered as {side}")]
    DuplicateProtocol { side: Side, name: String },

    #[error("Unable to read {side} config file {}: {source}", path.display())]
    ConfigLoadFailed {
        side: Side,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid port {port}")]
    InvalidPort { port: u16 },

    #[error("Failed to listen: {source}")]
    ListenFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to create {side} handler: {source}")]
    HandlerConstructionFailed {
        side: Side,
        #[source]
        source: anyhow::Error,
    },

    #[error("Failed to start outbound handler: {source}")]
    OutboundStartFailed {
        #[source]
        source: anyhow::Error,
    },

    #[error("Ray aborted: {cause}")]
    BridgeAborted { cause: String },

    #[error("Flow closed")]
    FlowClosed,

    #[error("Server is already listening")]
    AlreadyStarted,

    #[error("Server is not listening")]
    NotListening,

    #[error("Global registry already initialized")]
    RegistryAlreadyInitialized,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SOCKS5 protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed")]
    AuthFailed,

    #[error("Unsupported command: {0}")]
    UnsupportedCommand(u8),

    #[error("Invalid address type: {0}")]
    InvalidAddressType(u8),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("DNS resolution failed: {0}")]
    DnsResolution(String),
}

pub type Result<T> = std::result::Result<T, ProxyError>;

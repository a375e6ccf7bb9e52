pub mod address;
pub mod config;
pub mod dns;
pub mod error;
pub mod handler;
pub mod protocols;
pub mod ray;
pub mod registry;
pub mod relay;
pub mod server;

pub use address::{Address, Destination, Network};
pub use config::{Config, ConnectionConfig, RayConfig, ServerConfig};
pub use error::{ProxyError, Result, Side};
pub use handler::{InboundFactory, InboundHandler, OutboundFactory, OutboundHandler};
pub use protocols::{BlackholeFactory, FreedomFactory, SocksInboundFactory};
pub use ray::{AbortHandle, FlowReader, FlowWriter, InboundRay, OutboundRay};
pub use registry::{global_registry, init_global_registry, Registry};
pub use server::{Server, ServerState};

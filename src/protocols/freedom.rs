use super::parse_settings;
use crate::address::{Destination, Network};
use crate::dns::DnsResolver;
use crate::error::{ProxyError, Result};
use crate::handler::{OutboundFactory, OutboundHandler};
use crate::ray::OutboundRay;
use crate::relay::relay_stream;
use crate::server::Server;
use async_trait::async_trait;
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

pub const PROTOCOL: &str = "freedom";

/// Settings of the direct outbound
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FreedomSettings {
    /// Connect timeout
    pub connect_timeout_secs: u64,
    /// Try A records before AAAA for domain destinations
    pub prefer_ipv4: bool,
}

impl Default for FreedomSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 10,
            prefer_ipv4: false,
        }
    }
}

/// Outbound that connects straight to the destination.
pub struct FreedomFactory {
    // 首次使用时创建，所有连接共享
    resolver: OnceCell<Arc<DnsResolver>>,
}

impl FreedomFactory {
    pub fn new() -> Self {
        Self { resolver: OnceCell::new() }
    }
}

impl Default for FreedomFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl OutboundFactory for FreedomFactory {
    fn create(&self, _server: &Server, config: &[u8], destination: Destination) -> anyhow::Result<Box<dyn OutboundHandler>> {
        let settings: FreedomSettings = parse_settings(config)?;
        if destination.network != Network::Tcp {
            anyhow::bail!("freedom outbound does not support {} destinations", destination.network);
        }
        let resolver = self.resolver.get_or_init(|| Arc::new(DnsResolver::new())).clone();
        Ok(Box::new(FreedomOutbound { destination, settings, resolver }))
    }
}

struct FreedomOutbound {
    destination: Destination,
    settings: FreedomSettings,
    resolver: Arc<DnsResolver>,
}

impl FreedomOutbound {
    async fn connect(&self) -> Result<(TcpStream, SocketAddr)> {
        let target = self
            .resolver
            .resolve(&self.destination.address, self.destination.port, self.settings.prefer_ipv4)
            .await?;
        let stream = TcpStream::connect(target)
            .await
            .map_err(|e| ProxyError::ConnectionFailed(format!("{}: {}", target, e)))?;
        Ok((stream, target))
    }
}

#[async_trait]
impl OutboundHandler for FreedomOutbound {
    async fn start(self: Box<Self>, ray: OutboundRay) -> anyhow::Result<()> {
        // Resolution counts against the connect deadline.
        let connect_timeout = Duration::from_secs(self.settings.connect_timeout_secs);
        let (stream, target) = timeout(connect_timeout, self.connect())
            .await
            .map_err(|_| ProxyError::ConnectionFailed(format!("connect to {} timed out", self.destination)))??;
        if let Err(e) = stream.set_nodelay(true) {
            log::debug!("Failed to set TCP_NODELAY for {}: {}", target, e);
        }
        log::info!("Connected to {} ({})", self.destination, target);

        let peer = self.destination.to_string();
        tokio::spawn(async move {
            let (reader, writer, abort) = ray.split();
            if let Err(e) = relay_stream(stream, reader, writer, abort, &peer).await {
                log::debug!("Freedom relay to {} ended: {}", peer, e);
            }
        });
        Ok(())
    }
}

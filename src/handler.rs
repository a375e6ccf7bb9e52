//! Capability contracts every protocol plug-in implements.
//!
//! The server never branches on protocol identity: it only sees these traits.
//! Errors from a protocol are opaque to the core and travel as `anyhow::Error`.

use crate::address::Destination;
use crate::ray::OutboundRay;
use crate::server::Server;
use async_trait::async_trait;
use std::sync::Arc;

/// Accepts client connections on a port.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// Bind `port` and start accepting connections.
    ///
    /// Resolves once the listener is bound (or binding failed). The accept
    /// loop keeps running on the runtime and calls
    /// [`Server::on_inbound_accepted`] for every connection.
    async fn listen(&self, port: u16) -> anyhow::Result<()>;
}

/// Builds an inbound handler from its raw settings blob.
pub trait InboundFactory: Send + Sync {
    fn create(&self, server: Arc<Server>, config: &[u8]) -> anyhow::Result<Box<dyn InboundHandler>>;
}

/// Opens the connection towards one destination.
#[async_trait]
pub trait OutboundHandler: Send {
    /// Connect and start relaying against `ray`.
    ///
    /// Resolves once the outbound side is established; the relay itself runs
    /// in the background until either side closes or the ray is aborted.
    async fn start(self: Box<Self>, ray: OutboundRay) -> anyhow::Result<()>;
}

/// Builds an outbound handler for one destination.
pub trait OutboundFactory: Send + Sync {
    fn create(
        &self,
        server: &Server,
        config: &[u8],
        destination: Destination,
    ) -> anyhow::Result<Box<dyn OutboundHandler>>;
}

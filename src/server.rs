use crate::address::Destination;
use crate::config::{load_settings, ConnectionConfig, RayConfig, ServerConfig};
use crate::error::{ProxyError, Result, Side};
use crate::handler::{InboundFactory, OutboundFactory};
use crate::ray::{self, InboundRay};
use crate::registry::Registry;
use bytes::Bytes;
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

const UNSTARTED: u8 = 0;
const STARTING: u8 = 1;
const LISTENING: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Unstarted,
    Listening,
}

/// One proxy endpoint: an inbound protocol listening on a port, routing every
/// accepted connection through a fresh ray to a new outbound handler.
///
/// Factories and settings blobs are fixed at construction and only read
/// afterwards, so routing needs no locking.
pub struct Server {
    port: u16,
    inbound_protocol: String,
    inbound_factory: Arc<dyn InboundFactory>,
    inbound_config: Bytes,
    outbound_protocol: String,
    outbound_factory: Arc<dyn OutboundFactory>,
    outbound_config: Bytes,
    ray: RayConfig,
    state: AtomicU8,
}

impl Server {
    /// Resolve both protocols and load their settings. The server is not
    /// listening yet.
    pub fn new(config: &ServerConfig, registry: &Registry) -> Result<Arc<Self>> {
        let inbound_factory = registry.resolve_inbound(&config.inbound.protocol)?;
        let outbound_factory = registry.resolve_outbound(&config.outbound.protocol)?;
        let inbound_config = load_side(Side::Inbound, &config.inbound)?;
        let outbound_config = load_side(Side::Outbound, &config.outbound)?;

        info!(
            "Server created: port {}, inbound {}, outbound {}",
            config.port, config.inbound.protocol, config.outbound.protocol
        );

        Ok(Arc::new(Self {
            port: config.port,
            inbound_protocol: config.inbound.protocol.clone(),
            inbound_factory,
            inbound_config,
            outbound_protocol: config.outbound.protocol.clone(),
            outbound_factory,
            outbound_config,
            ray: config.ray.clone(),
            state: AtomicU8::new(UNSTARTED),
        }))
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn state(&self) -> ServerState {
        match self.state.load(Ordering::Acquire) {
            LISTENING => ServerState::Listening,
            _ => ServerState::Unstarted,
        }
    }

    /// Create the inbound handler and bind it to the configured port.
    ///
    /// Returns an error whenever the server did not end up listening.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.port == 0 {
            return Err(ProxyError::InvalidPort { port: self.port });
        }
        if self
            .state
            .compare_exchange(UNSTARTED, STARTING, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(ProxyError::AlreadyStarted);
        }

        match self.listen().await {
            Ok(()) => {
                self.state.store(LISTENING, Ordering::Release);
                info!("{} inbound listening on port {}", self.inbound_protocol, self.port);
                Ok(())
            }
            Err(e) => {
                self.state.store(UNSTARTED, Ordering::Release);
                Err(e)
            }
        }
    }

    async fn listen(self: &Arc<Self>) -> Result<()> {
        let handler = self
            .inbound_factory
            .create(Arc::clone(self), &self.inbound_config)
            .map_err(|source| ProxyError::HandlerConstructionFailed { side: Side::Inbound, source })?;

        handler
            .listen(self.port)
            .await
            .map_err(|source| ProxyError::ListenFailed { source })
    }

    /// Route one accepted connection: build and start an outbound handler for
    /// `destination` and hand back the inbound end of its ray.
    ///
    /// On error nothing services the ray, so the caller must close the client
    /// connection. Fails with `NotListening` before `start` has been called;
    /// an inbound may route connections while `start` is still completing.
    pub async fn on_inbound_accepted(&self, destination: Destination) -> Result<InboundRay> {
        if self.state.load(Ordering::Acquire) == UNSTARTED {
            return Err(ProxyError::NotListening);
        }

        let (inbound_ray, outbound_ray) = ray::channel(self.ray.capacity, self.ray.chunk_size);

        let handler = self
            .outbound_factory
            .create(self, &self.outbound_config, destination.clone())
            .map_err(|source| {
                warn!("Failed to create {} outbound for {}: {}", self.outbound_protocol, destination, source);
                ProxyError::HandlerConstructionFailed { side: Side::Outbound, source }
            })?;

        let abort = outbound_ray.abort_handle();
        if let Err(source) = handler.start(outbound_ray).await {
            warn!("Failed to start {} outbound for {}: {}", self.outbound_protocol, destination, source);
            abort.abort(format!("outbound start failed: {}", source));
            return Err(ProxyError::OutboundStartFailed { source });
        }

        debug!("Routed connection to {} via {}", destination, self.outbound_protocol);
        Ok(inbound_ray)
    }
}

fn load_side(side: Side, config: &ConnectionConfig) -> Result<Bytes> {
    match &config.file {
        Some(path) => load_settings(side, path),
        None => Ok(Bytes::new()),
    }
}

use crate::error::{ProxyError, Result, Side};
use crate::handler::{InboundFactory, OutboundFactory};
use log::{debug, info};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;

/// Protocol name -> factory mappings for both handler kinds.
///
/// Registration takes `&mut self`, so a registry is filled during startup and
/// only shared (read-only) once it has been handed to servers or installed as
/// the process-wide instance.
#[derive(Default)]
pub struct Registry {
    inbound: HashMap<String, Arc<dyn InboundFactory>>,
    outbound: HashMap<String, Arc<dyn OutboundFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the bundled protocols.
    pub fn with_builtin() -> Result<Self> {
        let mut registry = Self::new();
        crate::protocols::register_builtin(&mut registry)?;
        Ok(registry)
    }

    pub fn register_inbound(&mut self, name: impl Into<String>, factory: Arc<dyn InboundFactory>) -> Result<()> {
        let name = name.into();
        if self.inbound.contains_key(&name) {
            return Err(ProxyError::DuplicateProtocol { side: Side::Inbound, name });
        }
        debug!("Registered inbound protocol {}", name);
        self.inbound.insert(name, factory);
        Ok(())
    }

    pub fn register_outbound(&mut self, name: impl Into<String>, factory: Arc<dyn OutboundFactory>) -> Result<()> {
        let name = name.into();
        if self.outbound.contains_key(&name) {
            return Err(ProxyError::DuplicateProtocol { side: Side::Outbound, name });
        }
        debug!("Registered outbound protocol {}", name);
        self.outbound.insert(name, factory);
        Ok(())
    }

    pub fn resolve_inbound(&self, name: &str) -> Result<Arc<dyn InboundFactory>> {
        self.inbound.get(name).cloned().ok_or_else(|| ProxyError::UnknownProtocol {
            side: Side::Inbound,
            name: name.to_string(),
        })
    }

    pub fn resolve_outbound(&self, name: &str) -> Result<Arc<dyn OutboundFactory>> {
        self.outbound.get(name).cloned().ok_or_else(|| ProxyError::UnknownProtocol {
            side: Side::Outbound,
            name: name.to_string(),
        })
    }

    pub fn inbound_protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inbound.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn outbound_protocols(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.outbound.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

/// Process-wide registry, installed once at startup.
static GLOBAL_REGISTRY: OnceCell<Registry> = OnceCell::new();

/// Install the process-wide registry. Must happen before any server is built
/// from it; afterwards it is only reachable through a shared reference.
pub fn init_global_registry(registry: Registry) -> Result<&'static Registry> {
    let registry = GLOBAL_REGISTRY
        .try_insert(registry)
        .map_err(|_| ProxyError::RegistryAlreadyInitialized)?;
    info!("Global protocol registry initialized");
    Ok(registry)
}

pub fn global_registry() -> Option<&'static Registry> {
    GLOBAL_REGISTRY.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Destination;
    use crate::handler::{InboundHandler, OutboundHandler};
    use crate::server::Server;

    struct NullInbound;

    impl InboundFactory for NullInbound {
        fn create(&self, _server: Arc<Server>, _config: &[u8]) -> anyhow::Result<Box<dyn InboundHandler>> {
            anyhow::bail!("not used")
        }
    }

    struct NullOutbound;

    impl OutboundFactory for NullOutbound {
        fn create(&self, _server: &Server, _config: &[u8], _dest: Destination) -> anyhow::Result<Box<dyn OutboundHandler>> {
            anyhow::bail!("not used")
        }
    }

    fn same<T: ?Sized>(a: &Arc<T>, b: &Arc<T>) -> bool {
        Arc::as_ptr(a) as *const u8 == Arc::as_ptr(b) as *const u8
    }

    #[test]
    fn test_register_then_resolve() {
        let mut registry = Registry::new();
        let inbound: Arc<dyn InboundFactory> = Arc::new(NullInbound);
        let outbound: Arc<dyn OutboundFactory> = Arc::new(NullOutbound);
        registry.register_inbound("null", inbound.clone()).unwrap();
        registry.register_outbound("null", outbound.clone()).unwrap();

        assert!(same(&registry.resolve_inbound("null").unwrap(), &inbound));
        assert!(same(&registry.resolve_outbound("null").unwrap(), &outbound));
    }

    #[test]
    fn test_duplicate_keeps_original() {
        let mut registry = Registry::new();
        let first: Arc<dyn InboundFactory> = Arc::new(NullInbound);
        registry.register_inbound("dup", first.clone()).unwrap();

        let err = registry.register_inbound("dup", Arc::new(NullInbound)).unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateProtocol { side: Side::Inbound, ref name } if name == "dup"));
        assert!(same(&registry.resolve_inbound("dup").unwrap(), &first));

        registry.register_outbound("dup", Arc::new(NullOutbound)).unwrap();
        let err = registry.register_outbound("dup", Arc::new(NullOutbound)).unwrap_err();
        assert!(matches!(err, ProxyError::DuplicateProtocol { side: Side::Outbound, .. }));
    }

    #[test]
    fn test_unknown_names() {
        let mut registry = Registry::new();
        registry.register_inbound("only-in", Arc::new(NullInbound)).unwrap();

        for name in ["", "bogus", "only-out", "ONLY-IN"] {
            let err = registry.resolve_inbound(name).err().unwrap();
            assert!(matches!(err, ProxyError::UnknownProtocol { side: Side::Inbound, .. }));
        }
        let err = registry.resolve_outbound("only-in").err().unwrap();
        assert!(matches!(err, ProxyError::UnknownProtocol { side: Side::Outbound, ref name } if name == "only-in"));
    }

    #[test]
    fn test_builtin_protocols() {
        let registry = Registry::with_builtin().unwrap();
        assert_eq!(registry.inbound_protocols(), vec!["socks"]);
        assert_eq!(registry.outbound_protocols(), vec!["blackhole", "freedom"]);
    }

    #[test]
    fn test_global_registry_installs_once() {
        let _ = init_global_registry(Registry::new());
        assert!(global_registry().is_some());
        assert!(matches!(init_global_registry(Registry::new()), Err(ProxyError::RegistryAlreadyInitialized)));
    }
}

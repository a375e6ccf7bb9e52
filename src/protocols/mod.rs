// 协议模块 - 内置的inbound/outbound协议实现
use crate::error::Result;
use crate::registry::Registry;
use anyhow::Context;
use serde::de::DeserializeOwned;
use std::sync::Arc;

pub mod blackhole;
pub mod freedom;
pub mod socks5;

pub use blackhole::BlackholeFactory;
pub use freedom::FreedomFactory;
pub use socks5::SocksInboundFactory;

/// Register every bundled protocol.
pub fn register_builtin(registry: &mut Registry) -> Result<()> {
    registry.register_inbound(socks5::PROTOCOL, Arc::new(SocksInboundFactory))?;
    registry.register_outbound(freedom::PROTOCOL, Arc::new(FreedomFactory::new()))?;
    registry.register_outbound(blackhole::PROTOCOL, Arc::new(BlackholeFactory))?;
    Ok(())
}

/// Decode a JSON settings blob; an empty blob means defaults.
pub(crate) fn parse_settings<T>(config: &[u8]) -> anyhow::Result<T>
where
    T: DeserializeOwned + Default,
{
    if config.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(config).context("invalid protocol settings")
}

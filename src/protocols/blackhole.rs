use crate::address::Destination;
use crate::handler::{OutboundFactory, OutboundHandler};
use crate::ray::OutboundRay;
use crate::server::Server;
use async_trait::async_trait;

pub const PROTOCOL: &str = "blackhole";

/// Outbound that answers nothing and discards every request byte.
pub struct BlackholeFactory;

impl OutboundFactory for BlackholeFactory {
    fn create(&self, _server: &Server, _config: &[u8], destination: Destination) -> anyhow::Result<Box<dyn OutboundHandler>> {
        Ok(Box::new(BlackholeOutbound { destination }))
    }
}

struct BlackholeOutbound {
    destination: Destination,
}

#[async_trait]
impl OutboundHandler for BlackholeOutbound {
    async fn start(self: Box<Self>, ray: OutboundRay) -> anyhow::Result<()> {
        let (mut reader, mut writer, _abort) = ray.split();
        writer.close();

        let destination = self.destination;
        tokio::spawn(async move {
            let mut dropped = 0u64;
            while let Ok(Some(chunk)) = reader.recv().await {
                dropped += chunk.len() as u64;
            }
            log::debug!("Blackhole outbound - dropped {} bytes for {}", dropped, destination);
        });
        Ok(())
    }
}

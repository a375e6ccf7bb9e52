use super::parse_settings;
use crate::address::{Address, Destination};
use crate::error::{ProxyError, Result};
use crate::handler::{InboundFactory, InboundHandler};
use crate::relay::relay_stream;
use crate::server::Server;
use anyhow::Context;
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

pub const PROTOCOL: &str = "socks";

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHODS: u8 = 0xFF;

/// Pause after a failed accept before trying again
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_CONNECTION_REFUSED: u8 = 0x05;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

/// Settings of the SOCKS5 inbound
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SocksSettings {
    /// IP address to bind to
    pub host: IpAddr,
    /// Deadline for method negotiation plus the CONNECT request
    pub handshake_timeout_secs: u64,
}

impl Default for SocksSettings {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            handshake_timeout_secs: 10,
        }
    }
}

#[derive(Debug)]
pub struct Socks5Request {
    pub command: u8,
    pub address: Address,
    pub port: u16,
}

pub struct Socks5Response {
    pub status: u8,
    pub address: Address,
    pub port: u16,
}

impl Socks5Response {
    pub fn new(status: u8, address: Address, port: u16) -> Self {
        Self { status, address, port }
    }

    /// Failure replies carry an all-zero bound address.
    pub fn failure(status: u8) -> Self {
        Self::new(status, Address::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(262);

        buf.put_u8(VERSION);
        buf.put_u8(self.status);
        // Reserved
        buf.put_u8(0x00);

        match &self.address {
            Address::V4(ip) => {
                buf.put_u8(ATYP_IPV4);
                buf.put_slice(&ip.octets());
            }
            Address::V6(ip) => {
                buf.put_u8(ATYP_IPV6);
                buf.put_slice(&ip.octets());
            }
            Address::Domain(domain) => {
                let len = domain.len().min(u8::MAX as usize);
                buf.put_u8(ATYP_DOMAIN);
                buf.put_u8(len as u8);
                buf.put_slice(&domain.as_bytes()[..len]);
            }
        }

        buf.put_u16(self.port);
        buf.freeze()
    }
}

/// Method negotiation; only "no authentication" is offered.
pub async fn handle_socks5_handshake<T>(stream: &mut T) -> Result<()>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(ProxyError::Protocol(format!("Unsupported SOCKS version: {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHODS]).await?;
        return Err(ProxyError::AuthFailed);
    }

    stream.write_all(&[VERSION, NO_AUTH]).await?;
    Ok(())
}

/// Read one request: VER CMD RSV ATYP DST.ADDR DST.PORT
pub async fn read_socks5_request<T>(stream: &mut T) -> Result<Socks5Request>
where
    T: AsyncRead + Unpin,
{
    let mut head = [0u8; 4];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(ProxyError::Protocol(format!("Unsupported SOCKS version: {}", head[0])));
    }

    let address = match head[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Address::V4(Ipv4Addr::from(octets))
        }
        ATYP_DOMAIN => {
            let len = stream.read_u8().await? as usize;
            let mut domain = vec![0u8; len];
            stream.read_exact(&mut domain).await?;
            let domain = String::from_utf8(domain)
                .map_err(|_| ProxyError::Protocol("Invalid domain name".to_string()))?;
            Address::Domain(domain)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Address::V6(Ipv6Addr::from(octets))
        }
        other => return Err(ProxyError::InvalidAddressType(other)),
    };
    let port = stream.read_u16().await?;

    Ok(Socks5Request { command: head[1], address, port })
}

pub struct SocksInboundFactory;

impl InboundFactory for SocksInboundFactory {
    fn create(&self, server: Arc<Server>, config: &[u8]) -> anyhow::Result<Box<dyn InboundHandler>> {
        let settings: SocksSettings = parse_settings(config)?;
        Ok(Box::new(SocksInbound { server, settings }))
    }
}

struct SocksInbound {
    server: Arc<Server>,
    settings: SocksSettings,
}

#[async_trait]
impl InboundHandler for SocksInbound {
    async fn listen(&self, port: u16) -> anyhow::Result<()> {
        let bind_addr = SocketAddr::new(self.settings.host, port);
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", bind_addr))?;
        log::info!("SOCKS5 inbound listening on {}", bind_addr);

        let server = Arc::clone(&self.server);
        let handshake_timeout = Duration::from_secs(self.settings.handshake_timeout_secs);
        tokio::spawn(async move {
            let listener = &listener;
            accept_loop(
                || listener.accept(),
                |stream, client_addr| {
                    log::debug!("SOCKS5 connection from {}", client_addr);
                    let server = Arc::clone(&server);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(server, stream, client_addr, handshake_timeout).await {
                            log::warn!("Error handling connection from {}: {}", client_addr, e);
                        }
                    });
                },
            )
            .await
        });
        Ok(())
    }
}

/// Accept forever, backing off after errors such as EMFILE so a persistent
/// failure does not spin.
async fn accept_loop<S, A, Fut, H>(mut accept: A, mut on_accepted: H)
where
    A: FnMut() -> Fut,
    Fut: Future<Output = std::io::Result<(S, SocketAddr)>>,
    H: FnMut(S, SocketAddr),
{
    loop {
        match accept().await {
            Ok((stream, client_addr)) => on_accepted(stream, client_addr),
            Err(e) => {
                log::error!("SOCKS5 accept error: {}", e);
                tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}

async fn handle_connection(
    server: Arc<Server>,
    mut stream: TcpStream,
    client_addr: SocketAddr,
    handshake_timeout: Duration,
) -> Result<()> {
    let request = tokio::time::timeout(handshake_timeout, async {
        handle_socks5_handshake(&mut stream).await?;
        Ok::<_, ProxyError>(read_socks5_request(&mut stream).await?)
    })
    .await
    .map_err(|_| ProxyError::Protocol(format!("handshake with {} timed out", client_addr)))??;
    log::debug!("SOCKS5 request from {}: {:?}", client_addr, request);
    if request.command != CMD_CONNECT {
        let _ = stream.write_all(&Socks5Response::failure(REPLY_COMMAND_NOT_SUPPORTED).to_bytes()).await;
        return Err(ProxyError::UnsupportedCommand(request.command));
    }

    let destination = Destination::tcp(request.address, request.port);
    let ray = match server.on_inbound_accepted(destination.clone()).await {
        Ok(ray) => ray,
        Err(e) => {
            let status = match e {
                ProxyError::OutboundStartFailed { .. } => REPLY_CONNECTION_REFUSED,
                _ => REPLY_GENERAL_FAILURE,
            };
            // 路由失败，直接关闭客户端连接
            let _ = stream.write_all(&Socks5Response::failure(status).to_bytes()).await;
            return Err(e);
        }
    };

    let bound = stream.local_addr()?;
    let reply = Socks5Response::new(REPLY_SUCCEEDED, bound.ip().into(), bound.port());
    if let Err(e) = stream.write_all(&reply.to_bytes()).await {
        ray.abort(format!("client {} went away: {}", client_addr, e));
        return Err(e.into());
    }

    log::info!("Connection from {} routed to {}", client_addr, destination);
    let (reader, writer, abort) = ray.split();
    relay_stream(stream, reader, writer, abort, &client_addr.to_string()).await?;
    log::debug!("Connection from {} completed", client_addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ConnectionConfig, ServerConfig};
    use crate::registry::Registry;

    #[tokio::test]
    async fn test_read_request_domain() {
        let mut raw = vec![0x05, 0x01, 0x00, ATYP_DOMAIN, 7];
        raw.extend_from_slice(b"example");
        raw.extend_from_slice(&80u16.to_be_bytes());

        let request = read_socks5_request(&mut &raw[..]).await.unwrap();
        assert_eq!(request.command, CMD_CONNECT);
        assert_eq!(request.address, Address::Domain("example".to_string()));
        assert_eq!(request.port, 80);
    }

    #[tokio::test]
    async fn test_read_request_rejects_bad_input() {
        let raw = [0x05, 0x01, 0x00, 0x09, 0, 0];
        assert!(matches!(read_socks5_request(&mut &raw[..]).await, Err(ProxyError::InvalidAddressType(0x09))));

        let truncated = [0x05, 0x01, 0x00, ATYP_IPV4, 127];
        assert!(matches!(read_socks5_request(&mut &truncated[..]).await, Err(ProxyError::Io(_))));
    }

    #[test]
    fn test_response_bytes() {
        let response = Socks5Response::new(REPLY_SUCCEEDED, Address::V4(Ipv4Addr::new(127, 0, 0, 1)), 1080);
        assert_eq!(&response.to_bytes()[..], &[0x05, 0x00, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38]);
    }

    async fn free_port() -> u16 {
        TcpListener::bind("127.0.0.1:0").await.unwrap().local_addr().unwrap().port()
    }

    async fn connect_via(proxy_port: u16, target: SocketAddr) -> (TcpStream, [u8; 10]) {
        let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).await.unwrap();
        client.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
        let mut method = [0u8; 2];
        client.read_exact(&mut method).await.unwrap();
        assert_eq!(method, [0x05, 0x00]);

        let ip = match target.ip() {
            IpAddr::V4(ip) => ip.octets(),
            IpAddr::V6(_) => unreachable!(),
        };
        let mut request = vec![0x05, CMD_CONNECT, 0x00, ATYP_IPV4];
        request.extend_from_slice(&ip);
        request.extend_from_slice(&target.port().to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut reply = [0u8; 10];
        client.read_exact(&mut reply).await.unwrap();
        (client, reply)
    }

    #[tokio::test]
    async fn test_socks_to_freedom_end_to_end() {
        let target = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let target_addr = target.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = target.accept().await.unwrap();
            let mut buf = [0u8; 5];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(b"world").await.unwrap();
        });

        let registry = Registry::with_builtin().unwrap();
        let port = free_port().await;
        let config = ServerConfig::new(port, ConnectionConfig::new(PROTOCOL), ConnectionConfig::new("freedom"));
        let server = Server::new(&config, &registry).unwrap();
        server.start().await.unwrap();

        let (mut client, reply) = connect_via(port, target_addr).await;
        assert_eq!(reply[1], REPLY_SUCCEEDED);

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world");
    }

    #[tokio::test]
    async fn test_unroutable_connection_gets_failure_reply() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let closed_addr = closed.local_addr().unwrap();
        drop(closed);

        let registry = Registry::with_builtin().unwrap();
        let port = free_port().await;
        let config = ServerConfig::new(port, ConnectionConfig::new(PROTOCOL), ConnectionConfig::new("freedom"));
        let server = Server::new(&config, &registry).unwrap();
        server.start().await.unwrap();

        let (_client, reply) = connect_via(port, closed_addr).await;
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);

        // The listener keeps serving after a failed connection.
        let (_client, reply) = connect_via(port, closed_addr).await;
        assert_eq!(reply[1], REPLY_CONNECTION_REFUSED);
    }

    #[tokio::test]
    async fn test_port_in_use_is_listen_failure() {
        let registry = Registry::with_builtin().unwrap();
        let port = free_port().await;
        let config = ServerConfig::new(port, ConnectionConfig::new(PROTOCOL), ConnectionConfig::new("blackhole"));

        let first = Server::new(&config, &registry).unwrap();
        first.start().await.unwrap();
        let second = Server::new(&config, &registry).unwrap();
        assert!(matches!(second.start().await, Err(ProxyError::ListenFailed { .. })));
    }

    #[tokio::test]
    async fn test_silent_client_is_closed_after_handshake_timeout() {
        let registry = Registry::with_builtin().unwrap();
        let mut settings = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut settings, b"{\"handshake_timeout_secs\": 1}").unwrap();

        let port = free_port().await;
        let config = ServerConfig::new(
            port,
            ConnectionConfig::new(PROTOCOL).with_file(settings.path()),
            ConnectionConfig::new("blackhole"),
        );
        let server = Server::new(&config, &registry).unwrap();
        server.start().await.unwrap();

        let mut client = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf)).await;
        // Closed by the server: EOF or reset, but not still waiting.
        match read {
            Ok(Ok(n)) => assert_eq!(n, 0),
            Ok(Err(_)) => {}
            Err(_) => panic!("silent client was never closed"),
        }
    }

    #[tokio::test]
    async fn test_accept_errors_back_off() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        let task = tokio::spawn(accept_loop(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                std::future::ready(Err::<((), SocketAddr), _>(std::io::Error::from_raw_os_error(24)))
            },
            |_: (), _| {},
        ));

        tokio::time::sleep(Duration::from_millis(350)).await;
        task.abort();
        let attempts = attempts.load(Ordering::SeqCst);
        assert!((1..=5).contains(&attempts), "{} accept attempts in 350ms", attempts);
    }

    #[test]
    fn test_default_settings() {
        let settings: SocksSettings = parse_settings(b"").unwrap();
        assert_eq!(settings.host, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(settings.handshake_timeout_secs, 10);
    }

    #[tokio::test]
    async fn test_malformed_settings() {
        let registry = Registry::with_builtin().unwrap();
        let mut settings = tempfile::NamedTempFile::new().unwrap();
        std::io::Write::write_all(&mut settings, b"{\"host\": \"not an ip\"}").unwrap();

        let config = ServerConfig::new(
            free_port().await,
            ConnectionConfig::new(PROTOCOL).with_file(settings.path()),
            ConnectionConfig::new("blackhole"),
        );
        let server = Server::new(&config, &registry).unwrap();
        assert!(matches!(
            server.start().await,
            Err(ProxyError::HandlerConstructionFailed { side: crate::error::Side::Inbound, .. })
        ));
    }
}

use log::{debug, info};
use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpSocket, TcpStream};

use crate::utils::{P2PError, Result};

/// Backlog for listening sockets.
const MAX_PENDING: i32 = 5;

pub struct Transport;

impl Transport {
    pub async fn listen(addr: SocketAddr) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| P2PError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;

        info!("Listening on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Resolve `host:port` to the first IPv4 address. Search responses only
    /// carry IPv4, so peers speak IPv4 end to end.
    pub async fn resolve_ipv4(host: &str, port: u16) -> Result<SocketAddrV4> {
        let addrs = tokio::net::lookup_host((host, port))
            .await
            .map_err(|e| P2PError::ResolutionFailed(format!("{}:{}: {}", host, port, e)))?;

        addrs
            .filter_map(|addr| match addr {
                SocketAddr::V4(v4) => Some(v4),
                SocketAddr::V6(_) => None,
            })
            .next()
            .ok_or_else(|| P2PError::ResolutionFailed(format!("{}:{}: no IPv4 address", host, port)))
    }

    pub async fn connect(addr: SocketAddr) -> Result<TcpStream> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            P2PError::ConnectionFailed(format!("Failed to connect to {}: {}", addr, e))
        })?;

        debug!("Connected to {}", addr);
        Ok(stream)
    }

    /// Listening socket on `port` (0 picks one) that another socket may
    /// share. Paired with [`Transport::connect_from`] so a peer's outbound
    /// control connection and its file server use the same local port.
    pub fn listen_shared(port: u16) -> Result<TcpListener> {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let socket = Self::reusable_socket()?;

        socket
            .bind(&addr.into())
            .map_err(|e| P2PError::NetworkError(format!("Failed to bind to {}: {}", addr, e)))?;
        socket
            .listen(MAX_PENDING)
            .map_err(|e| P2PError::NetworkError(format!("Failed to listen on {}: {}", addr, e)))?;

        let std_listener: std::net::TcpListener = socket.into();
        let listener = TcpListener::from_std(std_listener).map_err(|e| {
            P2PError::NetworkError(format!("Failed to convert to tokio listener: {}", e))
        })?;

        info!("Serving files on {}", listener.local_addr()?);
        Ok(listener)
    }

    /// Connect to `remote` from local port `local_port`.
    pub async fn connect_from(local_port: u16, remote: SocketAddr) -> Result<TcpStream> {
        let local = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, local_port));
        let socket = Self::reusable_socket()?;

        socket
            .bind(&local.into())
            .map_err(|e| P2PError::NetworkError(format!("Failed to bind to {}: {}", local, e)))?;

        let std_stream: std::net::TcpStream = socket.into();
        let stream = TcpSocket::from_std_stream(std_stream)
            .connect(remote)
            .await
            .map_err(|e| {
                P2PError::ConnectionFailed(format!("Failed to connect to {}: {}", remote, e))
            })?;

        debug!("Connected to {} from local port {}", remote, local_port);
        Ok(stream)
    }

    fn reusable_socket() -> Result<Socket> {
        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
            .map_err(|e| P2PError::NetworkError(format!("Failed to create socket: {}", e)))?;

        socket
            .set_reuse_address(true)
            .map_err(|e| P2PError::NetworkError(format!("Failed to set reuse_address: {}", e)))?;

        #[cfg(all(unix, not(target_os = "solaris"), not(target_os = "illumos")))]
        socket
            .set_reuse_port(true)
            .map_err(|e| P2PError::NetworkError(format!("Failed to set reuse_port: {}", e)))?;

        socket
            .set_nonblocking(true)
            .map_err(|e| P2PError::NetworkError(format!("Failed to set nonblocking: {}", e)))?;

        Ok(socket)
    }

    pub async fn send_data(stream: &mut TcpStream, data: &[u8]) -> Result<()> {
        stream.write_all(data).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read exactly `buf.len()` bytes.
    pub async fn receive_exact(stream: &mut TcpStream, buf: &mut [u8]) -> Result<()> {
        stream.read_exact(buf).await.map_err(|e| {
            P2PError::NetworkError(format!("Expected {} bytes: {}", buf.len(), e))
        })?;
        Ok(())
    }

    /// Read until the remote side closes.
    pub async fn receive_to_end(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut buffer = Vec::new();
        stream.read_to_end(&mut buffer).await?;
        Ok(buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_shared_port_pair() {
        let registry = Transport::listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let registry_addr = registry.local_addr().unwrap();

        let files = Transport::listen_shared(0).unwrap();
        let port = files.local_addr().unwrap().port();

        let _control = Transport::connect_from(port, registry_addr).await.unwrap();
        let (_, seen_from) = registry.accept().await.unwrap();
        assert_eq!(seen_from.port(), port);
    }

    #[tokio::test]
    async fn test_resolve_localhost() {
        let addr = Transport::resolve_ipv4("127.0.0.1", 4000).await.unwrap();
        assert_eq!(addr, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 4000));
    }
}

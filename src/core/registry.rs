use log::{debug, info, warn};
use std::io;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;

use crate::core::peer::PeerRegistry;
use crate::core::protocol::{dump_frame, Packet, SearchResponse};
use crate::core::ServerConfig;
use crate::network::{ConnectionId, ConnectionMultiplexer};
use crate::utils::{P2PError, Result};

/// The registry's reactor.
///
/// Everything runs on one task: wait for readiness, then handle each ready
/// connection to completion before waiting again. Sends happen inline, so a
/// peer that stops reading can stall every other connection until its
/// socket buffer drains. There are no read or write timeouts.
pub struct RegistryServer {
    multiplexer: ConnectionMultiplexer,
    registry: PeerRegistry,
    recv_buffer: Vec<u8>,
}

impl RegistryServer {
    pub async fn bind(config: &ServerConfig) -> Result<Self> {
        config.validate()?;

        let addr: SocketAddr = format!("{}:{}", config.bind_addr, config.port)
            .parse()
            .map_err(|e| {
                P2PError::ConfigError(format!(
                    "invalid bind address {}:{}: {}",
                    config.bind_addr, config.port, e
                ))
            })?;

        let multiplexer = ConnectionMultiplexer::bind(addr).await?;
        Ok(Self {
            multiplexer,
            registry: PeerRegistry::new(),
            recv_buffer: vec![0u8; config.recv_buffer_size],
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.multiplexer.local_addr()
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Serve forever. Failures stay with the connection that caused them,
    /// and listener errors only pause accepting for a while.
    pub async fn run(mut self) -> Result<()> {
        info!("Registry serving on {}", self.local_addr()?);
        loop {
            self.serve_once().await;
        }
    }

    /// One reactor turn: wait for readiness and handle every ready
    /// connection in id order.
    pub async fn serve_once(&mut self) {
        let ready = self.multiplexer.await_ready().await;
        for id in ready {
            self.handle_readable(id).await;
        }
    }

    /// Number of open peer connections.
    pub fn connection_count(&self) -> usize {
        self.multiplexer.len()
    }

    /// True while accepting is paused after a listener error.
    pub fn accept_paused(&self) -> bool {
        self.multiplexer.accept_paused()
    }

    async fn handle_readable(&mut self, id: ConnectionId) {
        let Some(stream) = self.multiplexer.stream_mut(id) else {
            return;
        };

        let received = match stream.try_read(&mut self.recv_buffer) {
            Ok(0) => {
                debug!("{} closed by peer", id);
                self.drop_connection(id);
                return;
            }
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                warn!("Receive failed on {}: {}", id, e);
                self.drop_connection(id);
                return;
            }
        };

        let chunk = self.recv_buffer[..received].to_vec();
        debug!("{} sent {} byte(s): {}", id, received, dump_frame(&chunk));

        let mut offset = 0;
        while offset < chunk.len() {
            match Packet::decode_frame(&chunk[offset..]) {
                Ok((packet, used)) => {
                    offset += used;
                    if let Err(e) = self.dispatch(id, packet).await {
                        warn!("Dropping {}: {}", id, e);
                        self.drop_connection(id);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Ignoring bytes from {}: {}", id, e);
                    break;
                }
            }
        }
    }

    /// Apply one packet. An `Err` means the connection itself is unusable.
    async fn dispatch(&mut self, id: ConnectionId, packet: Packet) -> Result<()> {
        match packet {
            Packet::Join { peer_id: 0 } => {
                warn!("{} tried to join with reserved peer id 0", id);
            }
            Packet::Join { peer_id } => {
                let addr = self.multiplexer.peer_addr(id)?;
                self.registry.join(id, peer_id, addr)?;
            }
            Packet::Publish { filenames } => {
                if let Err(e) = self.registry.publish(id, &filenames) {
                    warn!("Ignoring publish of {} file(s): {}", filenames.len(), e);
                }
            }
            Packet::Search { term } => {
                let response = self
                    .registry
                    .search(&term)
                    .map(|peer| peer.search_response())
                    .unwrap_or_else(SearchResponse::not_found);

                info!(
                    "Search {:?} -> peer {} at {}",
                    term,
                    response.peer_id,
                    response.socket_addr()
                );
                self.send(id, &response.encode()).await?;
            }
            Packet::Fetch { filename } => {
                warn!(
                    "{} sent Fetch {:?} to the registry; fetches go to peers",
                    id, filename
                );
            }
        }
        Ok(())
    }

    async fn send(&mut self, id: ConnectionId, data: &[u8]) -> Result<()> {
        let stream = self
            .multiplexer
            .stream_mut(id)
            .ok_or_else(|| P2PError::NetworkError(format!("{} is not open", id)))?;
        stream
            .write_all(data)
            .await
            .map_err(|e| P2PError::NetworkError(format!("send to {} failed: {}", id, e)))?;
        Ok(())
    }

    fn drop_connection(&mut self, id: ConnectionId) {
        self.registry.disconnect(id);
        self.multiplexer.release(id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::SEARCH_RESPONSE_LEN;
    use socket2::SockRef;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;
    use tokio::time::timeout;

    async fn server() -> RegistryServer {
        let config = ServerConfig {
            bind_addr: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        RegistryServer::bind(&config).await.unwrap()
    }

    async fn turn(server: &mut RegistryServer) {
        timeout(Duration::from_secs(5), server.serve_once())
            .await
            .expect("reactor turn timed out");
    }

    /// Keep the reactor turning until the client has a full search response.
    async fn read_response(
        server: &mut RegistryServer,
        client: &mut TcpStream,
    ) -> [u8; SEARCH_RESPONSE_LEN] {
        let mut buf = [0u8; SEARCH_RESPONSE_LEN];
        let read = async {
            loop {
                tokio::select! {
                    r = client.read_exact(&mut buf) => break r,
                    _ = server.serve_once() => {}
                }
            }
        };
        timeout(Duration::from_secs(5), read)
            .await
            .expect("no search response")
            .unwrap();
        buf
    }

    #[tokio::test]
    async fn test_join_publish_search_over_one_connection() {
        let mut server = server().await;
        let mut client = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();

        let mut frames = Packet::Join { peer_id: 3 }.encode();
        frames.extend(
            Packet::Publish {
                filenames: vec!["song.mp3".to_string()],
            }
            .encode(),
        );
        client.write_all(&frames).await.unwrap();

        while server.registry().file_count() == 0 {
            turn(&mut server).await;
        }
        let local_port = client.local_addr().unwrap().port();
        let peer = server.registry().search("song.mp3").unwrap();
        assert_eq!(peer.id, 3);
        assert_eq!(peer.addr.port(), local_port);

        client
            .write_all(
                &Packet::Search {
                    term: "song.mp3".to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();

        let buf = read_response(&mut server, &mut client).await;
        let response = SearchResponse::decode(&buf).unwrap();
        assert_eq!(response.peer_id, 3);
        assert_eq!(response.port, local_port);
    }

    #[tokio::test]
    async fn test_garbage_keeps_connection_open() {
        let mut server = server().await;
        let mut client = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();

        client.write_all(&[0xee, 1, 2, 3]).await.unwrap();
        turn(&mut server).await;
        assert_eq!(server.multiplexer.len(), 1);

        client
            .write_all(
                &Packet::Search {
                    term: "absent".to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();

        let buf = read_response(&mut server, &mut client).await;
        assert_eq!(buf, [0u8; SEARCH_RESPONSE_LEN]);
    }

    #[tokio::test]
    async fn test_disconnect_releases_and_withdraws() {
        let mut server = server().await;
        let mut client = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();

        let mut frames = Packet::Join { peer_id: 8 }.encode();
        frames.extend(
            Packet::Publish {
                filenames: vec!["gone.txt".to_string()],
            }
            .encode(),
        );
        client.write_all(&frames).await.unwrap();
        while server.registry().file_count() == 0 {
            turn(&mut server).await;
        }

        drop(client);
        while server.registry().peer_count() > 0 {
            turn(&mut server).await;
        }
        assert!(server.registry().search("gone.txt").is_none());
        assert!(server.multiplexer.is_empty());
    }

    #[tokio::test]
    async fn test_publish_before_join_is_ignored() {
        let mut server = server().await;
        let mut client = TcpStream::connect(server.local_addr().unwrap())
            .await
            .unwrap();

        client
            .write_all(
                &Packet::Publish {
                    filenames: vec!["early".to_string()],
                }
                .encode(),
            )
            .await
            .unwrap();
        turn(&mut server).await;

        assert_eq!(server.registry().file_count(), 0);
        assert_eq!(server.multiplexer.len(), 1);
    }

    #[tokio::test]
    async fn test_reset_releases_only_that_connection() {
        let mut server = server().await;
        let addr = server.local_addr().unwrap();

        let mut keeper = TcpStream::connect(addr).await.unwrap();
        let mut frames = Packet::Join { peer_id: 5 }.encode();
        frames.extend(
            Packet::Publish {
                filenames: vec!["k".to_string()],
            }
            .encode(),
        );
        keeper.write_all(&frames).await.unwrap();
        while server.registry().file_count() == 0 {
            turn(&mut server).await;
        }

        let mut doomed = Vec::new();
        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(&[0xee]).await.unwrap();
            doomed.push(client);
        }
        while server.connection_count() < 4 {
            turn(&mut server).await;
        }

        for client in doomed {
            SockRef::from(&client)
                .set_linger(Some(Duration::ZERO))
                .unwrap();
            drop(client);
        }
        while server.connection_count() > 1 {
            turn(&mut server).await;
        }
        assert_eq!(server.registry().peer_count(), 1);

        keeper
            .write_all(
                &Packet::Search {
                    term: "k".to_string(),
                }
                .encode(),
            )
            .await
            .unwrap();
        let buf = read_response(&mut server, &mut keeper).await;
        assert_eq!(SearchResponse::decode(&buf).unwrap().peer_id, 5);
    }
}

use log::{debug, error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{sleep, Duration};

use crate::core::protocol::{dump_frame, Packet, FETCH_ERROR, FETCH_OK, MAX_FETCH_FRAME_LEN};
use crate::storage::{FileManager, HashUtils};
use crate::utils::{P2PError, Result};

/// Serves `Fetch` requests from other peers out of the shared directory.
///
/// Each data connection carries one request. The reply is a status byte and
/// then the file contents; closing the socket marks the end of the file.
pub struct Uploader {
    file_manager: FileManager,
}

impl Uploader {
    pub fn new(file_manager: FileManager) -> Self {
        Self { file_manager }
    }

    /// Accept data connections forever, one task per connection.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Data connection from {}", addr);

                    let uploader = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = uploader.handle_connection(stream, addr).await {
                            warn!("Upload to {} failed: {}", addr, e);
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept data connection: {}", e);
                    sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }

    pub async fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> Result<()> {
        let request = Self::read_request(&mut stream).await?;
        debug!("Request from {}: {}", addr, dump_frame(&request));

        match Packet::decode(&request)? {
            Packet::Fetch { filename } => self.send_file(&mut stream, &filename, addr).await,
            other => Err(P2PError::InvalidResponse(format!(
                "expected Fetch on a data connection, got {:?}",
                other.tag()
            ))),
        }
    }

    async fn send_file(&self, stream: &mut TcpStream, filename: &str, addr: SocketAddr) -> Result<()> {
        match self.file_manager.read_file(filename).await {
            Ok(content) => {
                stream.write_all(&[FETCH_OK]).await?;
                stream.write_all(&content).await?;
                stream.shutdown().await?;
                info!(
                    "Sent {} ({} bytes, sha256 {}) to {}",
                    filename,
                    content.len(),
                    HashUtils::hash_data(&content),
                    addr
                );
                Ok(())
            }
            Err(e) => {
                warn!("Cannot serve {:?} to {}: {}", filename, addr, e);
                stream.write_all(&[FETCH_ERROR]).await?;
                stream.shutdown().await?;
                Ok(())
            }
        }
    }

    /// Read one Fetch frame: stop at the terminator, at EOF, or once the
    /// longest legal frame has arrived.
    async fn read_request(stream: &mut TcpStream) -> Result<Vec<u8>> {
        let mut request = Vec::with_capacity(MAX_FETCH_FRAME_LEN);
        let mut buf = [0u8; MAX_FETCH_FRAME_LEN];

        while request.len() < MAX_FETCH_FRAME_LEN {
            let want = MAX_FETCH_FRAME_LEN - request.len();
            let n = stream.read(&mut buf[..want]).await?;
            if n == 0 {
                break;
            }
            request.extend_from_slice(&buf[..n]);
            if request.len() > 1 && request[1..].contains(&0) {
                break;
            }
        }

        if request.is_empty() {
            return Err(P2PError::NetworkError(
                "data connection closed before a request".to_string(),
            ));
        }
        Ok(request)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::protocol::FetchResult;
    use crate::network::Transport;

    async fn start(dir: &std::path::Path) -> SocketAddr {
        let fm = FileManager::new(dir.to_path_buf()).await.unwrap();
        let listener = Transport::listen("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(Arc::new(Uploader::new(fm)).serve(listener));
        addr
    }

    async fn request(addr: SocketAddr, packet: Packet) -> FetchResult {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(&packet.encode()).await.unwrap();
        let raw = Transport::receive_to_end(&mut stream).await.unwrap();
        FetchResult::from_stream(raw)
    }

    #[tokio::test]
    async fn test_serves_file_contents() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.txt"), b"peer to peer").unwrap();
        let addr = start(tmp.path()).await;

        let result = request(
            addr,
            Packet::Fetch {
                filename: "a.txt".to_string(),
            },
        )
        .await;
        assert!(!result.error);
        assert_eq!(result.bytes, b"peer to peer");
    }

    #[tokio::test]
    async fn test_missing_file_reports_error() {
        let tmp = tempfile::tempdir().unwrap();
        let addr = start(tmp.path()).await;

        let result = request(
            addr,
            Packet::Fetch {
                filename: "nope.txt".to_string(),
            },
        )
        .await;
        assert!(result.error);
    }

    #[tokio::test]
    async fn test_non_fetch_is_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let addr = start(tmp.path()).await;

        let result = request(addr, Packet::Join { peer_id: 1 }).await;
        assert!(result.error);
        assert!(result.bytes.is_empty());
    }
}

use log::{debug, info, warn};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

use crate::core::protocol::{
    dump_frame, Packet, SearchResponse, MAX_FILES, RECV_BUFFER_SIZE, SEARCH_RESPONSE_LEN,
};
use crate::core::ClientConfig;
use crate::network::Transport;
use crate::storage::FileManager;
use crate::transfer::{Downloader, Uploader};
use crate::utils::{P2PError, Result};

/// A peer: one long-lived control connection to the registry plus a file
/// server other peers fetch from.
///
/// The control connection and the file server share a local port, so the
/// address the registry records at Join is the address this peer serves on.
pub struct P2PClient {
    peer_id: u32,
    control: TcpStream,
    serve_addr: SocketAddr,
    shared: FileManager,
    downloads: FileManager,
    uploader_task: JoinHandle<()>,
}

impl P2PClient {
    pub async fn connect(config: &ClientConfig) -> Result<Self> {
        config.validate()?;

        let registry =
            Transport::resolve_ipv4(&config.registry_host, config.registry_port).await?;

        let shared = FileManager::new(config.shared_dir.clone()).await?;
        let downloads = FileManager::new(config.download_dir.clone()).await?;

        let listener = Transport::listen_shared(config.serve_port)?;
        let serve_addr = listener.local_addr()?;
        let uploader = Arc::new(Uploader::new(shared.clone()));
        let uploader_task = tokio::spawn(uploader.serve(listener));

        let control = match Transport::connect_from(serve_addr.port(), SocketAddr::V4(registry)).await
        {
            Ok(stream) => stream,
            Err(e) => {
                uploader_task.abort();
                return Err(e);
            }
        };
        if let Err(e) = control.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY on control connection: {}", e);
        }

        info!(
            "Peer {} connected to registry {} (serving on port {})",
            config.peer_id,
            registry,
            serve_addr.port()
        );

        Ok(Self {
            peer_id: config.peer_id,
            control,
            serve_addr,
            shared,
            downloads,
            uploader_task,
        })
    }

    pub fn peer_id(&self) -> u32 {
        self.peer_id
    }

    /// Local address of this peer's file server.
    pub fn serve_addr(&self) -> SocketAddr {
        self.serve_addr
    }

    pub fn shared_dir(&self) -> &Path {
        self.shared.dir()
    }

    pub fn download_dir(&self) -> &Path {
        self.downloads.dir()
    }

    pub async fn join(&mut self) -> Result<()> {
        self.send(&Packet::Join {
            peer_id: self.peer_id,
        })
        .await
    }

    pub async fn publish(&mut self, filenames: Vec<String>) -> Result<usize> {
        let count = filenames.len();
        self.send(&Packet::Publish { filenames }).await?;
        Ok(count)
    }

    /// Publish every regular file in the shared directory.
    pub async fn publish_shared(&mut self) -> Result<Vec<String>> {
        let files = self.shared.list_files().await?;
        for file in &files {
            debug!("Publishing {}", file);
        }
        if exceeds_registry_buffer(&files) {
            warn!(
                "Publishing {} file(s) in one frame; the registry reads at most {} \
                 bytes at a time and may drop part of the list",
                files.len(),
                RECV_BUFFER_SIZE
            );
        }
        self.publish(files.clone()).await?;
        Ok(files)
    }

    /// Ask the registry who holds `term`. The sentinel comes back as a
    /// response with `peer_id == 0`, not as an error.
    pub async fn search(&mut self, term: &str) -> Result<SearchResponse> {
        self.send(&Packet::Search {
            term: term.to_string(),
        })
        .await?;

        let mut buf = [0u8; SEARCH_RESPONSE_LEN];
        Transport::receive_exact(&mut self.control, &mut buf).await?;
        let response = SearchResponse::decode(&buf)?;

        if response.is_found() {
            debug!(
                "{:?} is held by peer {} at {}",
                term,
                response.peer_id,
                response.socket_addr()
            );
        } else {
            debug!("{:?} is not indexed", term);
        }
        Ok(response)
    }

    /// Look `filename` up and pull its bytes from the holder. The control
    /// connection is untouched by failures here.
    pub async fn fetch(&mut self, filename: &str) -> Result<Vec<u8>> {
        let location = self.search(filename).await?;
        if !location.is_found() {
            return Err(P2PError::FileNotFound(filename.to_string()));
        }

        let result = Downloader::fetch(&location, filename).await?;
        if result.error {
            return Err(P2PError::FetchFailed(format!(
                "peer {} could not serve {:?}",
                location.peer_id, filename
            )));
        }
        Ok(result.bytes)
    }

    /// Fetch `filename` and store it in the download directory.
    pub async fn fetch_to_disk(&mut self, filename: &str) -> Result<PathBuf> {
        let bytes = self.fetch(filename).await?;
        self.downloads.write_file(filename, &bytes).await
    }

    async fn send(&mut self, packet: &Packet) -> Result<()> {
        let frame = packet.encode();
        debug!("Sending {:?}: {}", packet.tag(), dump_frame(&frame));
        Transport::send_data(&mut self.control, &frame).await
    }
}

/// The registry receives each Publish with a single read of its default
/// buffer size and sizes that buffer for `MAX_FILES` names.
fn exceeds_registry_buffer(filenames: &[String]) -> bool {
    if filenames.len() > MAX_FILES {
        return true;
    }
    let frame_len = 1 + 4 + filenames.iter().map(|f| f.len() + 1).sum::<usize>();
    frame_len > RECV_BUFFER_SIZE
}

impl Drop for P2PClient {
    fn drop(&mut self) {
        self.uploader_task.abort();
    }
}

use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::framing::{connect_with_timeout, read_get, recv_frame, send_frame, send_get, FrameError};
use crate::jobs::{Job, JobReceiver};
use crate::listing::{resolve_under_root, INVALID_REQUEST};

/// A request must arrive promptly once the client connected.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Bound on the wait for the reply's length header. The server reads the
/// whole file before framing it, so large files need headroom here; the
/// 2-second body timeout only starts ticking once the header arrived.
const REPLY_HEADER_TIMEOUT: Duration = Duration::from_secs(60);

/// Serves file contents: one `GET <path>` per connection, one framed reply,
/// then the connection closes. A path that does not resolve to a regular
/// file under the sync root gets the error string instead of file bytes.
pub struct FileServer {
    listener: TcpListener,
    sync_root: PathBuf,
}

impl FileServer {
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let listener =
            TcpListener::bind((Ipv6Addr::UNSPECIFIED, config.transfer_port)).await?;
        Ok(Self { listener, sync_root: config.sync_root.clone() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("file server listening on {:?}", self.local_addr().ok());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("file request from {}", peer);
                        tokio::spawn(serve_file_request(stream, self.sync_root.clone()));
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                },
            }
        }
        tracing::info!("file server ended");
    }
}

async fn serve_file_request(mut stream: TcpStream, root: PathBuf) {
    let request = match read_get(&mut stream, REQUEST_TIMEOUT).await {
        Ok(Some(path)) => path,
        Ok(None) => return,
        Err(e) => {
            tracing::debug!("file request failed: {}", e);
            return;
        }
    };
    let reply = match load_file(&root, &request).await {
        Some(contents) => contents,
        None => {
            tracing::info!("rejecting file request for {}", request);
            INVALID_REQUEST.to_vec()
        }
    };
    if let Err(e) = send_frame(&mut stream, &reply).await {
        tracing::debug!("file reply for {} failed: {}", request, e);
    }
}

/// Reads the requested file fully into memory, or `None` when the path does
/// not name a readable regular file under the root.
async fn load_file(root: &std::path::Path, request_path: &str) -> Option<Vec<u8>> {
    let local = resolve_under_root(root, request_path)?;
    let metadata = tokio::fs::symlink_metadata(&local).await.ok()?;
    if !metadata.is_file() {
        return None;
    }
    tokio::fs::read(&local).await.ok()
}

/// Consumes download jobs: fetches each file from the peer that listed it
/// and writes it to the mirrored path under the local sync root.
pub struct FileClient {
    sync_root: PathBuf,
    transfer_port: u16,
    connect_timeout: Duration,
    max_file_bytes: u32,
}

impl FileClient {
    pub fn new(config: &Config) -> Self {
        Self {
            sync_root: config.sync_root.clone(),
            transfer_port: config.transfer_port,
            connect_timeout: config.connect_timeout(),
            max_file_bytes: config.max_file_bytes,
        }
    }

    pub async fn run(self, mut jobs: JobReceiver, cancel: CancellationToken) {
        tracing::info!("file client started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(Job::DownloadFile { addr, path }) => {
                        match self.download(addr, &path).await {
                            Ok(bytes) => {
                                tracing::info!("downloaded {} ({} bytes) from {}", path, bytes, addr)
                            }
                            // Abandon and move on; the file is picked up
                            // again on the peer's next introduction.
                            Err(e) => tracing::warn!("download of {} from {} failed: {}", path, addr, e),
                        }
                    }
                    Some(other) => tracing::warn!("unhandled {} job, discarding", other.kind()),
                    None => break,
                },
            }
        }
        tracing::info!("file client ended");
    }

    /// Fetches one file and writes it under the sync root, creating parent
    /// directories as needed. Returns the number of bytes written.
    async fn download(&self, peer: SocketAddr, path: &str) -> Result<usize, FrameError> {
        let Some(local) = resolve_under_root(&self.sync_root, path) else {
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("path {} escapes the sync root", path),
            )));
        };

        let target = SocketAddr::new(peer.ip(), self.transfer_port);
        let mut stream = connect_with_timeout(target, self.connect_timeout).await?;
        send_get(&mut stream, path).await?;
        let contents = recv_frame(&mut stream, self.max_file_bytes, REPLY_HEADER_TIMEOUT).await?;

        // The error string is in-band; a file with exactly this content is
        // indistinguishable from a rejection and is skipped.
        if contents == INVALID_REQUEST {
            return Err(FrameError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                format!("peer rejected request for {}", path),
            )));
        }

        if let Some(parent) = local.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &contents).await?;
        Ok(contents.len())
    }
}

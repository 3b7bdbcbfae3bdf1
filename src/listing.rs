use std::io;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, NaiveDateTime, Utc};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::framing::{connect_with_timeout, read_get, recv_frame, send_frame, send_get, FrameError};
use crate::jobs::{Job, JobReceiver, JobSender};

/// Literal reply for a request that does not name a readable directory
/// (or, on the file port, a regular file).
pub const INVALID_REQUEST: &[u8] = b"requested invalid directory";

/// Wire timestamp layout, e.g. `01.01.2024 Mon 00:00:00`. Textual so both
/// ends stay endianness- and width-agnostic.
const TIMESTAMP_FORMAT: &str = "%d.%m.%Y %a %T";

/// How long a connection may sit idle between two requests of one tree
/// walk before the server polls its shutdown state again.
const REQUEST_POLL: Duration = Duration::from_secs(1);

/// Bound for one listing reply after the request went out.
const REPLY_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    File,
    Directory,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListingEntry {
    pub kind: EntryKind,
    pub name: String,
    pub changed: NaiveDateTime,
}

/// Maps a peer-supplied `/`-separated path to a local path under `root`.
///
/// Components are resolved one by one; `..`, absolute prefixes and drive
/// roots are rejected so a request can never escape the sync root. The
/// original implementation concatenated naively; this tightening is
/// deliberate (see DESIGN.md).
pub fn resolve_under_root(root: &Path, request_path: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for component in Path::new(request_path.trim_start_matches('/')).components() {
        match component {
            Component::Normal(part) => resolved.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    Some(resolved)
}

pub fn format_timestamp(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).format(TIMESTAMP_FORMAT).to_string()
}

/// Renders the listing reply for one request: `<F|D>><name>><timestamp><`
/// per entry, only regular files and directories, in directory order. A
/// path that does not resolve to a directory yields [`INVALID_REQUEST`].
pub async fn render_listing(root: &Path, request_path: &str) -> Vec<u8> {
    let Some(local) = resolve_under_root(root, request_path) else {
        return INVALID_REQUEST.to_vec();
    };
    let Ok(mut entries) = tokio::fs::read_dir(&local).await else {
        return INVALID_REQUEST.to_vec();
    };

    let mut reply = Vec::new();
    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("directory walk under {:?} aborted: {}", local, e);
                break;
            }
        };
        let Ok(metadata) = entry.metadata().await else {
            tracing::debug!("unreadable entry {:?}", entry.path());
            continue;
        };
        let kind = if metadata.is_file() {
            'F'
        } else if metadata.is_dir() {
            'D'
        } else {
            // Sockets, fifos and friends are not synchronized.
            continue;
        };
        let changed = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let name = entry.file_name();
        reply.push(kind as u8);
        reply.push(b'>');
        reply.extend_from_slice(name.to_string_lossy().as_bytes());
        reply.push(b'>');
        reply.extend_from_slice(format_timestamp(changed).as_bytes());
        reply.push(b'<');
    }
    reply
}

/// Splits a listing reply into entries: records on `<`, fields on `>`.
/// Unparseable records (including the error-string reply) are logged and
/// skipped; a bad entry never aborts the walk.
pub fn parse_listing(payload: &[u8]) -> Vec<ListingEntry> {
    let text = String::from_utf8_lossy(payload);
    let mut entries = Vec::new();
    for record in text.split('<').filter(|r| !r.is_empty()) {
        let mut fields = record.splitn(3, '>');
        let kind = match fields.next() {
            Some("F") => EntryKind::File,
            Some("D") => EntryKind::Directory,
            _ => {
                tracing::debug!("entry not recognized: {}", record);
                continue;
            }
        };
        let (Some(name), Some(timestamp)) = (fields.next(), fields.next()) else {
            tracing::debug!("entry not recognized: {}", record);
            continue;
        };
        let Ok(changed) = NaiveDateTime::parse_from_str(timestamp, TIMESTAMP_FORMAT) else {
            tracing::debug!("bad timestamp in entry: {}", record);
            continue;
        };
        if name.is_empty() {
            continue;
        }
        entries.push(ListingEntry { kind, name: name.to_string(), changed });
    }
    entries
}

/// Serves `GET <path>` directory listings rooted under the sync root.
/// Connections persist across requests; a client walks a whole remote tree
/// over one connection.
pub struct ListingServer {
    listener: TcpListener,
    sync_root: PathBuf,
}

impl ListingServer {
    pub async fn bind(config: &Config) -> io::Result<Self> {
        let listener =
            TcpListener::bind((Ipv6Addr::UNSPECIFIED, config.listing_port)).await?;
        Ok(Self { listener, sync_root: config.sync_root.clone() })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self, cancel: CancellationToken) {
        tracing::info!("listing server listening on {:?}", self.local_addr().ok());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        tracing::debug!("listing connection from {}", peer);
                        let root = self.sync_root.clone();
                        let cancel = cancel.clone();
                        tokio::spawn(serve_listing_connection(stream, root, cancel));
                    }
                    Err(e) => tracing::warn!("accept failed: {}", e),
                },
            }
        }
        tracing::info!("listing server ended");
    }
}

async fn serve_listing_connection(mut stream: TcpStream, root: PathBuf, cancel: CancellationToken) {
    loop {
        if cancel.is_cancelled() {
            return;
        }
        let request = match read_get(&mut stream, REQUEST_POLL).await {
            Ok(Some(path)) => path,
            Ok(None) => return,
            Err(FrameError::Timeout) => continue,
            Err(e) => {
                tracing::debug!("listing request failed: {}", e);
                return;
            }
        };
        let reply = render_listing(&root, &request).await;
        if let Err(e) = send_frame(&mut stream, &reply).await {
            tracing::debug!("listing reply failed: {}", e);
            return;
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    /// Listing requests issued: the root plus one per remote directory.
    pub requests: usize,
    /// Download jobs enqueued for locally absent files.
    pub enqueued: usize,
}

/// Walks a freshly seen peer's tree and enqueues downloads for every
/// remote file that is absent locally.
pub struct ListingClient {
    sync_root: PathBuf,
    listing_port: u16,
    connect_timeout: Duration,
    max_listing_bytes: u32,
    downloads: JobSender,
}

impl ListingClient {
    pub fn new(config: &Config, downloads: JobSender) -> Self {
        Self {
            sync_root: config.sync_root.clone(),
            listing_port: config.listing_port,
            connect_timeout: config.connect_timeout(),
            max_listing_bytes: config.max_listing_bytes,
            downloads,
        }
    }

    pub async fn run(self, mut jobs: JobReceiver, cancel: CancellationToken) {
        tracing::info!("listing client started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                job = jobs.recv() => match job {
                    Some(Job::PeerSeen { peer_id, addr, seen }) => {
                        tracing::info!(
                            "peer {} at {} seen {}",
                            peer_id,
                            addr,
                            format_timestamp(seen)
                        );
                        match self.sync_peer(addr).await {
                            Ok(stats) => tracing::debug!(
                                "walked {} in {} request(s), {} download(s) enqueued",
                                addr,
                                stats.requests,
                                stats.enqueued
                            ),
                            // No retry here; the next discovery sighting of
                            // this peer walks it again.
                            Err(e) => tracing::warn!("listing fetch from {} failed: {}", addr, e),
                        }
                    }
                    Some(other) => tracing::warn!("unhandled {} job, discarding", other.kind()),
                    None => break,
                },
            }
        }
        tracing::info!("listing client ended");
    }

    /// Fetches the peer's tree over a single connection, depth first from
    /// `/`. Directory paths keep a trailing `/` so file paths concatenate
    /// without separators.
    async fn sync_peer(&self, peer: SocketAddr) -> Result<SyncStats, FrameError> {
        let target = SocketAddr::new(peer.ip(), self.listing_port);
        let mut stream = connect_with_timeout(target, self.connect_timeout).await?;

        let mut stats = SyncStats::default();
        let mut pending = vec![String::from("/")];
        while let Some(dir) = pending.pop() {
            send_get(&mut stream, &dir).await?;
            let reply = recv_frame(&mut stream, self.max_listing_bytes, REPLY_TIMEOUT).await?;
            stats.requests += 1;

            for entry in parse_listing(&reply) {
                match entry.kind {
                    EntryKind::Directory => pending.push(format!("{}{}/", dir, entry.name)),
                    EntryKind::File => {
                        let remote_path = format!("{}{}", dir, entry.name);
                        let Some(local) = resolve_under_root(&self.sync_root, &remote_path)
                        else {
                            tracing::warn!("entry escapes the sync root: {}", remote_path);
                            continue;
                        };
                        let present = tokio::fs::symlink_metadata(&local)
                            .await
                            .map(|m| m.is_file())
                            .unwrap_or(false);
                        if !present {
                            tracing::info!("file not present: {}", remote_path);
                            self.downloads.send(Job::DownloadFile {
                                addr: peer,
                                path: remote_path,
                            });
                            stats.enqueued += 1;
                        }
                    }
                }
            }
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs;
    use std::collections::HashSet;
    use std::fs;

    #[test]
    fn resolver_joins_normal_paths() {
        let root = Path::new("/srv/sync");
        assert_eq!(
            resolve_under_root(root, "/docs/notes.txt"),
            Some(PathBuf::from("/srv/sync/docs/notes.txt"))
        );
        assert_eq!(resolve_under_root(root, "/"), Some(PathBuf::from("/srv/sync")));
        assert_eq!(
            resolve_under_root(root, "/a/./b"),
            Some(PathBuf::from("/srv/sync/a/b"))
        );
    }

    #[test]
    fn resolver_rejects_escapes() {
        let root = Path::new("/srv/sync");
        assert_eq!(resolve_under_root(root, "/../etc/passwd"), None);
        assert_eq!(resolve_under_root(root, "/docs/../../x"), None);
        assert_eq!(resolve_under_root(root, "/a/.."), None);
    }

    #[test]
    fn timestamp_round_trips() {
        let formatted = format_timestamp(SystemTime::UNIX_EPOCH);
        assert_eq!(formatted, "01.01.1970 Thu 00:00:00");
        let parsed = NaiveDateTime::parse_from_str(&formatted, TIMESTAMP_FORMAT).unwrap();
        assert_eq!(parsed.and_utc().timestamp(), 0);
    }

    #[test]
    fn parses_the_documented_record_shape() {
        let entries = parse_listing(b"F>notes.txt>01.01.2024 Mon 00:00:00<");
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::File);
        assert_eq!(entries[0].name, "notes.txt");
    }

    #[test]
    fn error_reply_and_garbage_records_parse_to_nothing() {
        assert!(parse_listing(INVALID_REQUEST).is_empty());
        assert!(parse_listing(b"").is_empty());
        assert!(parse_listing(b"X>bad>01.01.2024 Mon 00:00:00<").is_empty());
        assert!(parse_listing(b"F>missing-timestamp<").is_empty());
        assert!(parse_listing(b"F>bad-ts>yesterday<").is_empty());
    }

    #[tokio::test]
    async fn render_and_parse_agree() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        fs::create_dir(dir.path().join("docs")).unwrap();

        let reply = render_listing(dir.path(), "/").await;
        let entries = parse_listing(&reply);
        assert_eq!(entries.len(), 2);
        let names: HashSet<(&str, EntryKind)> =
            entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
        assert!(names.contains(&("a.txt", EntryKind::File)));
        assert!(names.contains(&("docs", EntryKind::Directory)));
    }

    #[tokio::test]
    async fn non_directories_render_the_error_string() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"hello").unwrap();
        assert_eq!(render_listing(dir.path(), "/a.txt").await, INVALID_REQUEST);
        assert_eq!(render_listing(dir.path(), "/missing").await, INVALID_REQUEST);
        assert_eq!(render_listing(dir.path(), "/../x").await, INVALID_REQUEST);
    }

    #[tokio::test]
    async fn client_walks_a_tree_and_enqueues_only_absent_files() {
        // Remote tree: /a.txt, /docs/b.txt, /docs/inner/c.txt.
        let remote = tempfile::tempdir().unwrap();
        fs::write(remote.path().join("a.txt"), b"a").unwrap();
        fs::create_dir_all(remote.path().join("docs/inner")).unwrap();
        fs::write(remote.path().join("docs/b.txt"), b"b").unwrap();
        fs::write(remote.path().join("docs/inner/c.txt"), b"c").unwrap();

        // Local mirror already has /docs/b.txt.
        let local = tempfile::tempdir().unwrap();
        fs::create_dir_all(local.path().join("docs")).unwrap();
        fs::write(local.path().join("docs/b.txt"), b"b").unwrap();

        let mut config = Config::default();
        config.listing_port = 0;
        config.sync_root = remote.path().to_path_buf();
        let server = ListingServer::bind(&config).await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let cancel = CancellationToken::new();
        tokio::spawn(server.run(cancel.clone()));

        let mut client_config = Config::default();
        client_config.sync_root = local.path().to_path_buf();
        client_config.listing_port = server_addr.port();
        let (downloads_tx, mut downloads_rx) = jobs::queue();
        let client = ListingClient::new(&client_config, downloads_tx);

        let peer = SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), 44700);
        let stats = client.sync_peer(peer).await.unwrap();

        // Root plus /docs/ plus /docs/inner/: D + 1 requests.
        assert_eq!(stats.requests, 3);
        assert_eq!(stats.enqueued, 2);

        let mut paths = HashSet::new();
        while let Ok(job) = downloads_rx.try_recv() {
            match job {
                Job::DownloadFile { addr, path } => {
                    assert_eq!(addr, peer);
                    paths.insert(path);
                }
                other => panic!("unexpected job {:?}", other),
            }
        }
        let expected: HashSet<String> =
            ["/a.txt".to_string(), "/docs/inner/c.txt".to_string()].into();
        assert_eq!(paths, expected);

        cancel.cancel();
    }

    #[tokio::test]
    async fn client_connect_failure_produces_no_jobs() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let mut config = Config::default();
        config.listing_port = addr.port();
        let (downloads_tx, mut downloads_rx) = jobs::queue();
        let client = ListingClient::new(&config, downloads_tx);

        let peer = SocketAddr::new(std::net::Ipv4Addr::LOCALHOST.into(), 44700);
        assert!(client.sync_peer(peer).await.is_err());
        assert!(downloads_rx.try_recv().is_err());
    }
}

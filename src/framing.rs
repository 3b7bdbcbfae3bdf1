use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Longest a peer may stall between body bytes once the header has arrived.
/// The bound is per read, not per frame, so a slow but steadily flowing
/// transfer never trips it.
pub const BODY_TIMEOUT: Duration = Duration::from_secs(2);

/// Upper bound for one plain-text `GET <path>` request line.
pub const MAX_REQUEST_LEN: usize = 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    /// The transport closed, or fewer bytes arrived than the header
    /// promised. Partial frames are never surfaced to callers.
    #[error("connection closed before a full frame arrived")]
    Incomplete,
    #[error("timed out waiting for frame data")]
    Timeout,
    #[error("announced frame of {announced} bytes exceeds the {limit} byte limit")]
    Oversized { announced: u32, limit: u32 },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

fn map_read_err(e: io::Error) -> FrameError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        FrameError::Incomplete
    } else {
        FrameError::Io(e)
    }
}

/// Writes one length-prefixed frame: a 4-byte network-byte-order length
/// followed by the payload, written fully. Any write failure aborts and
/// propagates; there is no partial-send recovery.
pub async fn send_frame<S>(stream: &mut S, payload: &[u8]) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    let len = u32::try_from(payload.len()).map_err(|_| FrameError::Oversized {
        announced: u32::MAX,
        limit: u32::MAX,
    })?;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(payload).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one length-prefixed frame. The 4 header bytes must arrive within
/// `header_timeout`; the body must fit in `max_len`, and each body read
/// must make progress within [`BODY_TIMEOUT`]. A short read discards the
/// whole message.
pub async fn recv_frame<S>(
    stream: &mut S,
    max_len: u32,
    header_timeout: Duration,
) -> Result<Vec<u8>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    timeout(header_timeout, stream.read_exact(&mut header))
        .await
        .map_err(|_| FrameError::Timeout)?
        .map_err(map_read_err)?;

    let announced = u32::from_be_bytes(header);
    if announced > max_len {
        return Err(FrameError::Oversized { announced, limit: max_len });
    }

    let mut payload = vec![0u8; announced as usize];
    let mut filled = 0;
    while filled < payload.len() {
        let n = timeout(BODY_TIMEOUT, stream.read(&mut payload[filled..]))
            .await
            .map_err(|_| FrameError::Timeout)??;
        if n == 0 {
            return Err(FrameError::Incomplete);
        }
        filled += n;
    }
    Ok(payload)
}

/// Connects with a bounded wait. Tokio already performs the non-blocking
/// connect and reports the socket's pending error state on writability, so
/// a completed future is a genuinely established connection.
pub async fn connect_with_timeout(
    addr: SocketAddr,
    connect_timeout: Duration,
) -> io::Result<TcpStream> {
    match timeout(connect_timeout, TcpStream::connect(addr)).await {
        Ok(result) => result,
        Err(_) => Err(io::Error::new(
            io::ErrorKind::TimedOut,
            format!("connecting to {} timed out", addr),
        )),
    }
}

/// Sends the one-shot plain-text request both TCP protocols open with.
/// This is the only unframed message on the wire.
pub async fn send_get<S>(stream: &mut S, path: &str) -> Result<(), FrameError>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(b"GET ").await?;
    stream.write_all(path.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one `GET <path>` request with a single bounded read. Returns
/// `Ok(None)` when the remote closed the connection instead of sending
/// another request.
pub async fn read_get<S>(
    stream: &mut S,
    read_timeout: Duration,
) -> Result<Option<String>, FrameError>
where
    S: AsyncRead + Unpin,
{
    let mut buf = [0u8; MAX_REQUEST_LEN];
    let n = timeout(read_timeout, stream.read(&mut buf))
        .await
        .map_err(|_| FrameError::Timeout)??;
    if n == 0 {
        return Ok(None);
    }
    let text = String::from_utf8_lossy(&buf[..n]);
    match text.strip_prefix("GET ") {
        Some(path) if !path.is_empty() => Ok(Some(path.trim_end().to_string())),
        _ => Err(FrameError::Incomplete),
    }
}

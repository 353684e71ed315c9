//! Body relay with bounded capture, and the opaque byte tunnel.

use std::time::Duration;

use lens_http::BodyMode;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;

use crate::io::{BufferedStream, IO_CHUNK_SIZE};
use crate::ProxyError;

/// Captured body bytes, cut off at the configured cap. Relay always
/// forwards the full body; only the copy kept for the record is bounded.
#[derive(Debug)]
pub struct BodyCapture {
    data: Vec<u8>,
    truncated: bool,
    cap: usize,
}

impl BodyCapture {
    pub fn new(cap: usize) -> Self {
        Self {
            data: Vec::new(),
            truncated: false,
            cap,
        }
    }

    pub fn push(&mut self, bytes: &[u8]) {
        let room = self.cap.saturating_sub(self.data.len());
        if bytes.len() > room {
            self.truncated = true;
        }
        self.data.extend_from_slice(&bytes[..bytes.len().min(room)]);
    }

    pub fn truncated(&self) -> bool {
        self.truncated
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.data
    }
}

/// Forward one message body from `source` to `sink` per its delimitation
/// mode, feeding the capture along the way. Returns the forwarded payload
/// byte count.
pub async fn relay_body<R, W>(
    source: &mut BufferedStream<R>,
    sink: &mut W,
    mode: BodyMode,
    capture: &mut BodyCapture,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let total = match mode {
        BodyMode::None => 0,
        BodyMode::ContentLength(length) => relay_exact(source, sink, length, capture).await?,
        BodyMode::Chunked => relay_chunked(source, sink, capture).await?,
        BodyMode::CloseDelimited => relay_until_eof(source, sink, capture).await?,
    };
    sink.flush().await?;
    Ok(total)
}

async fn relay_exact<R, W>(
    source: &mut BufferedStream<R>,
    sink: &mut W,
    mut remaining: u64,
    capture: &mut BodyCapture,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;

    if !source.read_buf.is_empty() && remaining > 0 {
        let take = (remaining as usize).min(source.read_buf.len());
        sink.write_all(&source.read_buf[..take]).await?;
        capture.push(&source.read_buf[..take]);
        source.read_buf.drain(..take);
        remaining -= take as u64;
        total += take as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    while remaining > 0 {
        let want = IO_CHUNK_SIZE.min(remaining as usize);
        let read = source.stream.read(&mut chunk[..want]).await?;
        if read == 0 {
            return Err(ProxyError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "connection closed before the body completed",
            )));
        }
        sink.write_all(&chunk[..read]).await?;
        capture.push(&chunk[..read]);
        remaining -= read as u64;
        total += read as u64;
    }
    Ok(total)
}

/// Chunked transfer coding. Size lines, chunk terminators, and trailers are
/// forwarded verbatim but excluded from the capture, so the captured body
/// is exactly the concatenated chunk payloads.
async fn relay_chunked<R, W>(
    source: &mut BufferedStream<R>,
    sink: &mut W,
    capture: &mut BodyCapture,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    loop {
        let size_line = source.read_line().await?;
        sink.write_all(&size_line).await?;
        let chunk_len = parse_chunk_len(&size_line)?;

        if chunk_len == 0 {
            // Trailer section: zero or more header lines, then a bare CRLF.
            loop {
                let trailer = source.read_line().await?;
                sink.write_all(&trailer).await?;
                if trailer == b"\r\n" {
                    return Ok(total);
                }
            }
        }

        total += relay_exact(source, sink, chunk_len, capture).await?;

        let terminator = source.read_exact_bytes(2).await?;
        if terminator != b"\r\n" {
            return Err(ProxyError::MalformedResponse(
                "chunk data not followed by CRLF".to_string(),
            ));
        }
        sink.write_all(&terminator).await?;
    }
}

async fn relay_until_eof<R, W>(
    source: &mut BufferedStream<R>,
    sink: &mut W,
    capture: &mut BodyCapture,
) -> Result<u64, ProxyError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut total = 0_u64;
    if !source.read_buf.is_empty() {
        sink.write_all(&source.read_buf).await?;
        capture.push(&source.read_buf);
        total += source.read_buf.len() as u64;
        source.read_buf.clear();
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read = source.stream.read(&mut chunk).await?;
        if read == 0 {
            return Ok(total);
        }
        sink.write_all(&chunk[..read]).await?;
        capture.push(&chunk[..read]);
        total += read as u64;
    }
}

fn parse_chunk_len(line: &[u8]) -> Result<u64, ProxyError> {
    let text = std::str::from_utf8(line)
        .map_err(|_| ProxyError::MalformedResponse("chunk size line is not UTF-8".to_string()))?;
    let trimmed = text.trim();
    let size_text = trimmed.split(';').next().unwrap_or(trimmed).trim();
    u64::from_str_radix(size_text, 16).map_err(|_| {
        ProxyError::MalformedResponse(format!("invalid chunk size line: {trimmed:?}"))
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RelayOutcome {
    pub from_client: u64,
    pub from_server: u64,
}

/// Opaque tunnel: both directions pumped concurrently, bytes forwarded
/// verbatim. EOF on one side half-closes the peer's write side so the
/// other direction can drain; errors abort both directions.
pub async fn relay_opaque(
    client: TcpStream,
    server: TcpStream,
    client_preamble: Vec<u8>,
    server_preamble: Vec<u8>,
    idle: Duration,
    shutdown: watch::Receiver<bool>,
) -> Result<RelayOutcome, ProxyError> {
    let (client_read, client_write) = client.into_split();
    let (server_read, server_write) = server.into_split();

    let (abort_tx, abort_rx) = watch::channel(false);

    let client_to_server = tokio::spawn(pump(
        client_read,
        server_write,
        client_preamble,
        idle,
        shutdown.clone(),
        abort_tx.clone(),
        abort_rx.clone(),
    ));
    let server_to_client = tokio::spawn(pump(
        server_read,
        client_write,
        server_preamble,
        idle,
        shutdown,
        abort_tx,
        abort_rx,
    ));

    let (client_result, server_result) = tokio::join!(client_to_server, server_to_client);
    let from_client = flatten_pump_result(client_result)?;
    let from_server = flatten_pump_result(server_result)?;
    Ok(RelayOutcome {
        from_client,
        from_server,
    })
}

fn flatten_pump_result(
    joined: Result<Result<u64, ProxyError>, tokio::task::JoinError>,
) -> Result<u64, ProxyError> {
    match joined {
        Ok(result) => result,
        Err(join_error) => Err(ProxyError::Io(std::io::Error::other(format!(
            "relay task join failed: {join_error}"
        )))),
    }
}

async fn pump(
    mut read: OwnedReadHalf,
    mut write: OwnedWriteHalf,
    preamble: Vec<u8>,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
    abort_tx: watch::Sender<bool>,
    mut abort_rx: watch::Receiver<bool>,
) -> Result<u64, ProxyError> {
    let mut total = 0_u64;
    if !preamble.is_empty() {
        write.write_all(&preamble).await?;
        total += preamble.len() as u64;
    }

    let mut chunk = [0_u8; IO_CHUNK_SIZE];
    loop {
        let read_count = tokio::select! {
            result = tokio::time::timeout(idle, read.read(&mut chunk)) => {
                match result {
                    Ok(Ok(count)) => count,
                    Ok(Err(error)) => {
                        let _ = abort_tx.send(true);
                        return Err(error.into());
                    }
                    Err(_) => {
                        let _ = abort_tx.send(true);
                        return Err(ProxyError::Timeout("tunnel_idle"));
                    }
                }
            }
            _ = shutdown.changed() => {
                let _ = abort_tx.send(true);
                return Err(ProxyError::Cancelled);
            }
            _ = abort_rx.changed() => {
                return Ok(total);
            }
        };

        if read_count == 0 {
            let _ = write.shutdown().await;
            return Ok(total);
        }
        write.write_all(&chunk[..read_count]).await.map_err(|error| {
            let _ = abort_tx.send(true);
            ProxyError::from(error)
        })?;
        total += read_count as u64;
    }
}

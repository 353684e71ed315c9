//! Buffered socket reads with head delimiting, phase timeouts, and
//! synthesized proxy responses.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::ProxyError;

/// One relay cycle reads at most this much before the forward write must
/// complete.
pub const IO_CHUNK_SIZE: usize = 64 * 1024;

const HEAD_TERMINATOR: &[u8] = b"\r\n\r\n";
const CHUNK_LINE_LIMIT: usize = 8 * 1024;

/// A stream plus bytes read past the last parsed boundary. Overread bytes
/// stay here and are replayed before the next socket read.
pub struct BufferedStream<S> {
    pub stream: S,
    pub read_buf: Vec<u8>,
}

impl<S> BufferedStream<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            read_buf: Vec::new(),
        }
    }

    pub fn with_prefetch(stream: S, prefetch: Vec<u8>) -> Self {
        Self {
            stream,
            read_buf: prefetch,
        }
    }

    /// Hand back the stream and any unconsumed bytes.
    pub fn into_parts(self) -> (S, Vec<u8>) {
        (self.stream, self.read_buf)
    }
}

impl<S: AsyncRead + Unpin> BufferedStream<S> {
    /// Read through the next `CRLF CRLF`, returning the complete head
    /// including the terminator. `None` on a clean EOF before any byte.
    pub async fn read_head(&mut self, max_bytes: usize) -> Result<Option<Vec<u8>>, ProxyError> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, HEAD_TERMINATOR) {
                let end = start + HEAD_TERMINATOR.len();
                return Ok(Some(self.read_buf.drain(..end).collect()));
            }
            if self.read_buf.len() > max_bytes {
                return Err(ProxyError::HeaderTooLarge);
            }

            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                if self.read_buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the message head completed",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    /// Read through the next bare `CRLF`, used for chunk size and trailer
    /// lines.
    pub async fn read_line(&mut self) -> Result<Vec<u8>, ProxyError> {
        loop {
            if let Some(start) = find_subsequence(&self.read_buf, b"\r\n") {
                let end = start + 2;
                return Ok(self.read_buf.drain(..end).collect());
            }
            if self.read_buf.len() > CHUNK_LINE_LIMIT {
                return Err(ProxyError::MalformedResponse(
                    "chunk line exceeded the size limit".to_string(),
                ));
            }

            let mut chunk = [0_u8; 1024];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed mid chunk line",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
    }

    pub async fn read_exact_bytes(&mut self, count: usize) -> Result<Vec<u8>, ProxyError> {
        while self.read_buf.len() < count {
            let mut chunk = [0_u8; IO_CHUNK_SIZE];
            let read = self.stream.read(&mut chunk).await?;
            if read == 0 {
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection closed before the expected bytes arrived",
                )));
            }
            self.read_buf.extend_from_slice(&chunk[..read]);
        }
        Ok(self.read_buf.drain(..count).collect())
    }
}

/// Replays buffered bytes ahead of live socket reads; writes pass through.
/// Used to hand overread bytes (a buffered ClientHello, a post-CONNECT
/// preamble) to a TLS handshake.
pub struct PrefixedStream<S> {
    prefix: Vec<u8>,
    offset: usize,
    stream: S,
}

impl<S> PrefixedStream<S> {
    pub fn new(prefix: Vec<u8>, stream: S) -> Self {
        Self {
            prefix,
            offset: 0,
            stream,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for PrefixedStream<S> {
    fn poll_read(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        if self.offset < self.prefix.len() {
            let remaining = &self.prefix[self.offset..];
            let take = remaining.len().min(buf.remaining());
            buf.put_slice(&remaining[..take]);
            self.offset += take;
            return std::task::Poll::Ready(Ok(()));
        }
        std::pin::Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for PrefixedStream<S> {
    fn poll_write(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
        data: &[u8],
    ) -> std::task::Poll<io::Result<usize>> {
        std::pin::Pin::new(&mut self.stream).poll_write(cx, data)
    }

    fn poll_flush(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<io::Result<()>> {
        std::pin::Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

pub fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Bound a connection phase; elapsing maps to [`ProxyError::Timeout`] with
/// the phase name.
pub async fn with_phase_timeout<T, F>(
    phase: &'static str,
    limit: Duration,
    future: F,
) -> Result<T, ProxyError>
where
    F: Future<Output = Result<T, ProxyError>>,
{
    match tokio::time::timeout(limit, future).await {
        Ok(result) => result,
        Err(_) => Err(ProxyError::Timeout(phase)),
    }
}

/// Synthesized plain-text response for proxy-level failures (400, 431,
/// 502).
pub async fn write_proxy_response<W>(
    stream: &mut W,
    status: &str,
    body: &str,
) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let response = format!(
        "HTTP/1.1 {status}\r\nConnection: close\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.flush().await
}

//! WebSocket frame relay after a confirmed upgrade.
//!
//! Each direction runs its own pump: decode a frame (enforcing masking
//! discipline), forward the raw bytes verbatim, validate fragmentation
//! sequencing through the per-connection assembler, and emit one frame
//! record per decoded frame with the unmasked payload. Pings are the
//! exception: the relay answers them itself with a Pong on the side the
//! Ping arrived from and withholds the Ping from the peer.
//!
//! Both write halves are shared behind async mutexes because each serves
//! two pumps: the peer's forward sink and the local side's control sink.

use std::sync::Arc;
use std::time::Duration;

use lens_http::{build_frame, parse_frame, FrameParse, MessageAssembler, Opcode, WsDirection};
use lens_store::WsFrameRecord;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::capture::unix_timestamp;
use crate::engine::ProxyEngine;
use crate::io::{BufferedStream, IO_CHUNK_SIZE};
use crate::ProxyError;

/// A single frame larger than this closes the connection rather than
/// buffering without bound.
const MAX_WS_FRAME_BYTES: usize = 16 * 1024 * 1024;

pub(crate) async fn relay_frames<C, S>(
    engine: &ProxyEngine,
    connection_id: &str,
    client: BufferedStream<C>,
    server: BufferedStream<S>,
    shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (client_stream, client_prefetch) = client.into_parts();
    let (server_stream, server_prefetch) = server.into_parts();
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);
    let client_write = Arc::new(Mutex::new(client_write));
    let server_write = Arc::new(Mutex::new(server_write));

    let (abort_tx, abort_rx) = watch::channel(false);
    let idle = engine.config.timeouts.tunnel_idle;

    let client_to_server = pump_frames(
        engine,
        connection_id,
        WsDirection::ClientToServer,
        client_prefetch,
        client_read,
        Arc::clone(&server_write),
        Arc::clone(&client_write),
        idle,
        shutdown.clone(),
        abort_tx.clone(),
        abort_rx.clone(),
    );
    let server_to_client = pump_frames(
        engine,
        connection_id,
        WsDirection::ServerToClient,
        server_prefetch,
        server_read,
        client_write,
        server_write,
        idle,
        shutdown,
        abort_tx,
        abort_rx,
    );

    let (client_result, server_result) = tokio::join!(client_to_server, server_to_client);
    client_result?;
    server_result?;
    Ok(())
}

#[allow(clippy::too_many_arguments)]
async fn pump_frames<R, WF, WC>(
    engine: &ProxyEngine,
    connection_id: &str,
    direction: WsDirection,
    prefetch: Vec<u8>,
    mut read: R,
    forward_sink: Arc<Mutex<WF>>,
    control_sink: Arc<Mutex<WC>>,
    idle: Duration,
    mut shutdown: watch::Receiver<bool>,
    abort_tx: watch::Sender<bool>,
    mut abort_rx: watch::Receiver<bool>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Unpin,
    WF: AsyncWrite + Unpin,
    WC: AsyncWrite + Unpin,
{
    let mut buf = prefetch;
    let mut assembler = MessageAssembler::new();

    loop {
        match parse_frame(&buf, direction) {
            Ok(FrameParse::Frame { frame, consumed }) => {
                // Sequencing rules hold even though we forward per frame.
                if let Err(violation) = assembler.push(&frame) {
                    let _ = abort_tx.send(true);
                    return Err(violation.into());
                }

                if frame.opcode == Opcode::Ping {
                    // Answer on the side the Ping arrived from and keep
                    // it away from the peer.
                    buf.drain(..consumed);
                    record_frame(engine, connection_id, direction, &frame);
                    send_pong(direction, &control_sink, &frame.payload)
                        .await
                        .map_err(|error| {
                            let _ = abort_tx.send(true);
                            error
                        })?;
                    continue;
                }

                {
                    let mut sink = forward_sink.lock().await;
                    sink.write_all(&buf[..consumed]).await.map_err(|error| {
                        let _ = abort_tx.send(true);
                        ProxyError::from(error)
                    })?;
                    sink.flush().await.map_err(ProxyError::from)?;
                }
                buf.drain(..consumed);
                record_frame(engine, connection_id, direction, &frame);

                if frame.opcode == Opcode::Close {
                    return Ok(());
                }
            }
            Ok(FrameParse::Incomplete) => {
                if buf.len() > MAX_WS_FRAME_BYTES {
                    let _ = abort_tx.send(true);
                    return Err(ProxyError::ProtocolViolation(
                        "frame exceeds the relay buffer cap".to_string(),
                    ));
                }

                let mut chunk = [0_u8; IO_CHUNK_SIZE];
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
                    _ = abort_rx.changed() => return Ok(()),
                };

                if read_count == 0 {
                    let mut sink = forward_sink.lock().await;
                    let _ = sink.shutdown().await;
                    return Ok(());
                }
                buf.extend_from_slice(&chunk[..read_count]);
            }
            Err(violation) => {
                let _ = abort_tx.send(true);
                return Err(violation.into());
            }
        }
    }
}

/// Self-originated Pong mirroring the Ping payload. The reply toward the
/// server leaves the proxy acting as a WebSocket client, so only that
/// direction masks.
async fn send_pong<W>(
    direction: WsDirection,
    sink: &Arc<Mutex<W>>,
    payload: &[u8],
) -> Result<(), ProxyError>
where
    W: AsyncWrite + Unpin,
{
    let mask = match direction {
        WsDirection::ServerToClient => Some(control_masking_key(payload)),
        WsDirection::ClientToServer => None,
    };
    let pong = build_frame(true, Opcode::Pong, payload, mask);
    let mut sink = sink.lock().await;
    sink.write_all(&pong).await?;
    sink.flush().await?;
    Ok(())
}

fn control_masking_key(payload: &[u8]) -> [u8; 4] {
    let seed = 0x6C50_3341_u32 ^ (payload.len() as u32);
    seed.to_be_bytes()
}

fn record_frame(
    engine: &ProxyEngine,
    connection_id: &str,
    direction: WsDirection,
    frame: &lens_http::Frame,
) {
    let cap = engine.config.max_body_bytes;
    let mut payload = frame.payload.clone();
    payload.truncate(cap);
    engine.record_ws_frame(WsFrameRecord {
        id: Uuid::new_v4().to_string(),
        connection_id: connection_id.to_string(),
        timestamp: unix_timestamp(),
        direction: direction.as_str().to_string(),
        opcode: frame.opcode.to_wire(),
        fin: frame.fin,
        payload,
    });
}

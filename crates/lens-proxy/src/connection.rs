//! Per-connection state machine: classification, the plain HTTP path, and
//! CONNECT tunnel establishment.
//!
//! One accepted socket gets one task running [`handle_connection`]. Modes
//! only move forward; a keep-alive exchange loops back to classification
//! on the same socket but never out of an established tunnel.

use std::net::SocketAddr;
use std::sync::Arc;

use lens_http::{BodyMode, HttpError, RequestHead, ResponseHead};
use lens_store::Protocol;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::watch;
use uuid::Uuid;

use crate::capture::ExchangeCapture;
use crate::engine::ProxyEngine;
use crate::io::{with_phase_timeout, write_proxy_response, BufferedStream, PrefixedStream};
use crate::relay::{relay_body, relay_opaque};
use crate::{intercept, ws_relay, ProxyError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectionMode {
    Classifying,
    PlainHttp,
    AwaitUpstreamTunnel,
    TlsTerminating,
    InterceptedStream,
    OpaqueTunnel,
    OpaqueForward,
    Closed,
}

impl ConnectionMode {
    fn as_str(self) -> &'static str {
        match self {
            Self::Classifying => "classifying",
            Self::PlainHttp => "plain_http",
            Self::AwaitUpstreamTunnel => "await_upstream_tunnel",
            Self::TlsTerminating => "tls_terminating",
            Self::InterceptedStream => "intercepted_stream",
            Self::OpaqueTunnel => "opaque_tunnel",
            Self::OpaqueForward => "opaque_forward",
            Self::Closed => "closed",
        }
    }
}

fn enter(connection_id: &str, mode: ConnectionMode) {
    tracing::debug!(connection_id, mode = mode.as_str(), "connection mode");
}

pub(crate) async fn handle_connection(
    engine: Arc<ProxyEngine>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let connection_id = Uuid::new_v4().to_string();
    tracing::debug!(connection_id, %peer, "accepted connection");
    let mut client = BufferedStream::new(stream);

    loop {
        enter(&connection_id, ConnectionMode::Classifying);
        let head_bytes = tokio::select! {
            result = with_phase_timeout(
                "classify_read",
                engine.config.timeouts.classify_read,
                client.read_head(engine.config.max_head_bytes),
            ) => result,
            _ = shutdown.changed() => {
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
        };

        let head_bytes = match head_bytes {
            Ok(Some(bytes)) => bytes,
            Ok(None) => {
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
            Err(ProxyError::HeaderTooLarge) => {
                let _ = write_proxy_response(
                    &mut client.stream,
                    "431 Request Header Fields Too Large",
                    "request head exceeded the configured limit",
                )
                .await;
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
            Err(error) => {
                tracing::debug!(connection_id, %error, "closing before classification");
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
        };

        let request = match RequestHead::parse(&head_bytes) {
            Ok(request) => request,
            Err(HttpError::MalformedRequest(detail)) => {
                if engine.config.upstream_proxy.is_some() {
                    enter(&connection_id, ConnectionMode::OpaqueForward);
                    opaque_forward(&engine, &connection_id, client, head_bytes, shutdown).await;
                } else {
                    tracing::debug!(connection_id, detail, "unparsable bytes without upstream");
                    let _ = write_proxy_response(
                        &mut client.stream,
                        "400 Bad Request",
                        "could not parse an HTTP request",
                    )
                    .await;
                }
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
            Err(error) => {
                tracing::debug!(connection_id, %error, "request parse failed");
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
        };

        if request.is_connect() {
            serve_connect(&engine, &connection_id, client, request, shutdown).await;
            enter(&connection_id, ConnectionMode::Closed);
            return;
        }

        enter(&connection_id, ConnectionMode::PlainHttp);
        match serve_plain_http(&engine, &connection_id, client, request, &mut shutdown).await {
            Some(reusable) => client = reusable,
            None => {
                enter(&connection_id, ConnectionMode::Closed);
                return;
            }
        }
    }
}

/// Unparsable client bytes with an upstream configured: hand the raw
/// stream to the upstream proxy and relay verbatim.
async fn opaque_forward(
    engine: &ProxyEngine,
    connection_id: &str,
    client: BufferedStream<TcpStream>,
    head_bytes: Vec<u8>,
    shutdown: watch::Receiver<bool>,
) {
    let Some(upstream) = engine.config.upstream_proxy.clone() else {
        return;
    };
    let connect_result = with_phase_timeout(
        "upstream_connect",
        engine.config.timeouts.upstream_connect,
        async {
            TcpStream::connect((upstream.host.as_str(), upstream.port))
                .await
                .map_err(|error| ProxyError::UpstreamUnreachable(error.to_string()))
        },
    )
    .await;

    let upstream_stream = match connect_result {
        Ok(stream) => stream,
        Err(error) => {
            tracing::debug!(connection_id, %error, "opaque forward connect failed");
            return;
        }
    };

    let (client_stream, prefetch) = client.into_parts();
    let mut preamble = head_bytes;
    preamble.extend_from_slice(&prefetch);

    if let Err(error) = relay_opaque(
        client_stream,
        upstream_stream,
        preamble,
        Vec::new(),
        engine.config.timeouts.tunnel_idle,
        shutdown,
    )
    .await
    {
        tracing::debug!(connection_id, %error, "opaque forward ended with error");
    }
}

/// One plain HTTP exchange. Returns the client stream when the socket can
/// be reused for another classification round.
async fn serve_plain_http(
    engine: &Arc<ProxyEngine>,
    connection_id: &str,
    mut client: BufferedStream<TcpStream>,
    request: RequestHead,
    shutdown: &mut watch::Receiver<bool>,
) -> Option<BufferedStream<TcpStream>> {
    let (host, port) = match request.effective_host_port() {
        Ok(pair) => pair,
        Err(error) => {
            let proxy_error = ProxyError::from(error);
            let mut capture = ExchangeCapture::begin(
                connection_id,
                Protocol::Http,
                &request,
                "",
                0,
                engine.config.max_body_bytes,
            );
            capture.fail(&proxy_error);
            engine.record_exchange(capture.finish());
            let _ = write_proxy_response(
                &mut client.stream,
                "400 Bad Request",
                "request target could not be resolved",
            )
            .await;
            return None;
        }
    };

    let mut capture = ExchangeCapture::begin(
        connection_id,
        Protocol::Http,
        &request,
        &host,
        port,
        engine.config.max_body_bytes,
    );

    let (target_host, target_port) = match &engine.config.upstream_proxy {
        Some(upstream) => (upstream.host.clone(), upstream.port),
        None => (host.clone(), port),
    };
    let connect_result = with_phase_timeout(
        "upstream_connect",
        engine.config.timeouts.upstream_connect,
        async {
            TcpStream::connect((target_host.as_str(), target_port))
                .await
                .map_err(|error| ProxyError::UpstreamUnreachable(error.to_string()))
        },
    )
    .await;
    let server_stream = match connect_result {
        Ok(stream) => stream,
        Err(error) => {
            capture.fail(&error);
            engine.record_exchange(capture.finish());
            let _ = write_proxy_response(
                &mut client.stream,
                "502 Bad Gateway",
                "could not reach the target",
            )
            .await;
            return None;
        }
    };
    let mut server = BufferedStream::new(server_stream);

    match run_plain_exchange(engine, &mut client, &mut server, &request, &mut capture, shutdown)
        .await
    {
        Ok(PlainExchangeEnd::KeepAlive) => {
            engine.record_exchange(capture.finish());
            Some(client)
        }
        Ok(PlainExchangeEnd::Close) => {
            engine.record_exchange(capture.finish());
            None
        }
        Ok(PlainExchangeEnd::Upgraded) => {
            capture.set_protocol(Protocol::Ws);
            engine.record_exchange(capture.finish());
            if let Err(error) =
                ws_relay::relay_frames(engine, connection_id, client, server, shutdown.clone())
                    .await
            {
                let mut diagnostic = ExchangeCapture::begin_tunnel(
                    connection_id,
                    Protocol::Ws,
                    &request.method,
                    &host,
                    port,
                );
                diagnostic.fail(&error);
                engine.record_exchange(diagnostic.finish());
            }
            None
        }
        Err(error) => {
            capture.fail(&error);
            engine.record_exchange(capture.finish());
            let _ = write_proxy_response(
                &mut client.stream,
                "502 Bad Gateway",
                "exchange with the target failed",
            )
            .await;
            None
        }
    }
}

enum PlainExchangeEnd {
    KeepAlive,
    Close,
    /// A confirmed WebSocket upgrade; both heads were already forwarded.
    Upgraded,
}

async fn run_plain_exchange(
    engine: &ProxyEngine,
    client: &mut BufferedStream<TcpStream>,
    server: &mut BufferedStream<TcpStream>,
    request: &RequestHead,
    capture: &mut ExchangeCapture,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<PlainExchangeEnd, ProxyError> {
    let head_to_send = match &engine.config.upstream_proxy {
        Some(_) => request.encode_for_proxy(),
        None => request.encode_for_origin(),
    };
    server.stream.write_all(&head_to_send).await?;
    relay_body(
        client,
        &mut server.stream,
        request.body_mode()?,
        &mut capture.request_body,
    )
    .await?;

    let response_head = tokio::select! {
        result = with_phase_timeout(
            "response_headers",
            engine.config.timeouts.response_headers,
            server.read_head(engine.config.max_head_bytes),
        ) => result?,
        _ = shutdown.changed() => return Err(ProxyError::Cancelled),
    };
    let Some(response_head) = response_head else {
        return Err(ProxyError::MalformedResponse(
            "target closed before sending response headers".to_string(),
        ));
    };
    let response = ResponseHead::parse(&response_head)?;
    capture.set_response(&response);
    client.stream.write_all(&response.raw).await?;

    let upgrade_confirmed = request.is_websocket_upgrade()
        && request
            .websocket_key()
            .map(|key| response.confirms_websocket_upgrade(key))
            .unwrap_or(false);
    if upgrade_confirmed {
        client.stream.flush().await?;
        return Ok(PlainExchangeEnd::Upgraded);
    }

    let body_mode = response.body_mode(&request.method)?;
    relay_body(server, &mut client.stream, body_mode, &mut capture.response_body).await?;
    client.stream.flush().await?;

    let close = request.wants_close()
        || response.wants_close()
        || body_mode == BodyMode::CloseDelimited;
    Ok(if close {
        PlainExchangeEnd::Close
    } else {
        PlainExchangeEnd::KeepAlive
    })
}

/// CONNECT handling: establish the server leg (direct or through the
/// upstream proxy), answer 200, then either intercept or go opaque.
async fn serve_connect(
    engine: &Arc<ProxyEngine>,
    connection_id: &str,
    mut client: BufferedStream<TcpStream>,
    request: RequestHead,
    shutdown: watch::Receiver<bool>,
) {
    let (host, port) = match request.effective_host_port() {
        Ok(pair) => pair,
        Err(error) => {
            let _ = write_proxy_response(
                &mut client.stream,
                "400 Bad Request",
                "invalid CONNECT authority",
            )
            .await;
            tracing::debug!(connection_id, %error, "CONNECT authority rejected");
            return;
        }
    };

    let mut capture =
        ExchangeCapture::begin_tunnel(connection_id, Protocol::Https, "CONNECT", &host, port);

    let established = establish_server_leg(engine, connection_id, &request, &host, port).await;
    let (server_stream, server_prefetch) = match established {
        Ok(parts) => parts,
        Err(error) => {
            capture.fail(&error);
            engine.record_exchange(capture.finish());
            let _ = write_proxy_response(
                &mut client.stream,
                "502 Bad Gateway",
                "tunnel could not be established",
            )
            .await;
            return;
        }
    };

    if client
        .stream
        .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
        .await
        .is_err()
    {
        return;
    }

    if engine.should_intercept(&host) {
        enter(connection_id, ConnectionMode::TlsTerminating);
        serve_intercepted_tunnel(
            engine,
            connection_id,
            capture,
            client,
            server_stream,
            server_prefetch,
            &host,
            port,
            shutdown,
        )
        .await;
        return;
    }

    enter(connection_id, ConnectionMode::OpaqueTunnel);
    let (client_stream, client_prefetch) = client.into_parts();
    let relay_result = relay_opaque(
        client_stream,
        server_stream,
        client_prefetch,
        server_prefetch,
        engine.config.timeouts.tunnel_idle,
        shutdown,
    )
    .await;
    if let Err(error) = &relay_result {
        capture.fail(error);
    }
    engine.record_exchange(capture.finish());
}

/// Direct TCP connect, or a literal CONNECT through the upstream proxy.
/// Returns the open stream plus any bytes the upstream sent past its
/// response head.
async fn establish_server_leg(
    engine: &ProxyEngine,
    connection_id: &str,
    request: &RequestHead,
    host: &str,
    port: u16,
) -> Result<(TcpStream, Vec<u8>), ProxyError> {
    let timeout = engine.config.timeouts.upstream_connect;
    match engine.config.upstream_proxy.clone() {
        None => {
            let stream = with_phase_timeout("upstream_connect", timeout, async {
                TcpStream::connect((host, port))
                    .await
                    .map_err(|error| ProxyError::UpstreamUnreachable(error.to_string()))
            })
            .await?;
            Ok((stream, Vec::new()))
        }
        Some(upstream) => {
            enter(connection_id, ConnectionMode::AwaitUpstreamTunnel);
            let stream = with_phase_timeout("upstream_connect", timeout, async {
                TcpStream::connect((upstream.host.as_str(), upstream.port))
                    .await
                    .map_err(|error| ProxyError::UpstreamUnreachable(error.to_string()))
            })
            .await?;
            let mut upstream_conn = BufferedStream::new(stream);

            // The client's CONNECT head goes through literally.
            upstream_conn.stream.write_all(&request.raw).await?;

            let head = with_phase_timeout(
                "upstream_connect",
                timeout,
                upstream_conn.read_head(engine.config.max_head_bytes),
            )
            .await?
            .ok_or_else(|| {
                ProxyError::UpstreamProtocol(
                    "upstream closed before answering CONNECT".to_string(),
                )
            })?;
            let response = ResponseHead::parse(&head)
                .map_err(|error| ProxyError::UpstreamProtocol(error.to_string()))?;
            if !(200..300).contains(&response.status) {
                return Err(ProxyError::UpstreamProtocol(format!(
                    "non-2xx CONNECT response: {}",
                    response.status
                )));
            }
            let (stream, prefetch) = upstream_conn.into_parts();
            Ok((stream, prefetch))
        }
    }
}

/// Mint a leaf, terminate TLS on both legs simultaneously, then run the
/// intercepted exchange loop.
#[allow(clippy::too_many_arguments)]
async fn serve_intercepted_tunnel(
    engine: &Arc<ProxyEngine>,
    connection_id: &str,
    mut capture: ExchangeCapture,
    client: BufferedStream<TcpStream>,
    server_stream: TcpStream,
    server_prefetch: Vec<u8>,
    host: &str,
    port: u16,
    shutdown: watch::Receiver<bool>,
) {
    let identity = match engine.mint_identity(host).await {
        Ok(identity) => identity,
        Err(error) => {
            capture.fail(&error);
            engine.record_exchange(capture.finish());
            return;
        }
    };
    let Some(authority) = engine.ca().active() else {
        capture.fail(&ProxyError::CaUnavailable);
        engine.record_exchange(capture.finish());
        return;
    };

    let (client_stream, client_prefetch) = client.into_parts();
    let handshake_timeout = engine.config.timeouts.tls_handshake;
    let accept_fut = with_phase_timeout(
        "tls_handshake",
        handshake_timeout,
        engine.tls.accept(
            PrefixedStream::new(client_prefetch, client_stream),
            &identity,
            authority.cert_der(),
        ),
    );
    let connect_fut = with_phase_timeout(
        "tls_handshake",
        handshake_timeout,
        engine
            .tls
            .connect(PrefixedStream::new(server_prefetch, server_stream), host),
    );

    let (client_tls, server_tls) = match tokio::try_join!(accept_fut, connect_fut) {
        Ok(streams) => streams,
        Err(error) => {
            tracing::debug!(
                connection_id,
                host,
                reason = crate::tls::classify_tls_error(&error.to_string()),
                "TLS termination failed"
            );
            capture.fail(&error);
            engine.record_exchange(capture.finish());
            return;
        }
    };

    enter(connection_id, ConnectionMode::InterceptedStream);
    // The CONNECT-level capture is superseded by per-exchange records.
    drop(capture);
    if let Err(error) = intercept::run_exchanges(
        engine,
        connection_id,
        host,
        port,
        BufferedStream::new(client_tls),
        BufferedStream::new(server_tls),
        shutdown,
    )
    .await
    {
        let mut diagnostic =
            ExchangeCapture::begin_tunnel(connection_id, Protocol::Https, "CONNECT", host, port);
        diagnostic.fail(&error);
        engine.record_exchange(diagnostic.finish());
    }
}

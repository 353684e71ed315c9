//! The intercepted exchange loop: both legs are plaintext after TLS
//! termination, so requests and responses parse and capture exactly like
//! the plain path, until close or a WebSocket upgrade.

use std::sync::Arc;

use lens_http::{BodyMode, RequestHead, ResponseHead};
use lens_store::Protocol;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;

use crate::capture::ExchangeCapture;
use crate::engine::ProxyEngine;
use crate::io::{with_phase_timeout, BufferedStream};
use crate::relay::relay_body;
use crate::{ws_relay, ProxyError};

/// Parse alternating request/response pairs until either side closes. A
/// confirmed 101 upgrade hands the streams to the frame relay.
pub(crate) async fn run_exchanges<C, S>(
    engine: &Arc<ProxyEngine>,
    connection_id: &str,
    host: &str,
    port: u16,
    mut client: BufferedStream<C>,
    mut server: BufferedStream<S>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let head_bytes = tokio::select! {
            result = with_phase_timeout(
                "classify_read",
                engine.config.timeouts.classify_read,
                client.read_head(engine.config.max_head_bytes),
            ) => result?,
            _ = shutdown.changed() => return Err(ProxyError::Cancelled),
        };
        let Some(head_bytes) = head_bytes else {
            return Ok(());
        };

        let request = RequestHead::parse(&head_bytes).map_err(ProxyError::from)?;
        let mut capture = ExchangeCapture::begin(
            connection_id,
            Protocol::Https,
            &request,
            host,
            port,
            engine.config.max_body_bytes,
        );

        let outcome = run_one_exchange(
            engine,
            &mut client,
            &mut server,
            &request,
            &mut capture,
            &mut shutdown,
        )
        .await;

        match outcome {
            Ok(ExchangeEnd::KeepAlive) => {
                engine.record_exchange(capture.finish());
            }
            Ok(ExchangeEnd::Close) => {
                engine.record_exchange(capture.finish());
                return Ok(());
            }
            Ok(ExchangeEnd::Upgraded) => {
                capture.set_protocol(Protocol::Wss);
                engine.record_exchange(capture.finish());
                return ws_relay::relay_frames(engine, connection_id, client, server, shutdown)
                    .await;
            }
            Err(error) => {
                capture.fail(&error);
                engine.record_exchange(capture.finish());
                return Ok(());
            }
        }
    }
}

enum ExchangeEnd {
    KeepAlive,
    Close,
    Upgraded,
}

async fn run_one_exchange<C, S>(
    engine: &ProxyEngine,
    client: &mut BufferedStream<C>,
    server: &mut BufferedStream<S>,
    request: &RequestHead,
    capture: &mut ExchangeCapture,
    shutdown: &mut watch::Receiver<bool>,
) -> Result<ExchangeEnd, ProxyError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    // Inside a tunnel the target is already origin-form; forward verbatim.
    server.stream.write_all(&request.raw).await?;
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
            "server closed before sending response headers".to_string(),
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
        return Ok(ExchangeEnd::Upgraded);
    }

    let body_mode = response.body_mode(&request.method)?;
    relay_body(
        server,
        &mut client.stream,
        body_mode,
        &mut capture.response_body,
    )
    .await?;
    client.stream.flush().await?;

    let close = request.wants_close()
        || response.wants_close()
        || body_mode == BodyMode::CloseDelimited;
    Ok(if close {
        ExchangeEnd::Close
    } else {
        ExchangeEnd::KeepAlive
    })
}

//! TCP listener: bind (preferred or ephemeral on conflict), spawn one
//! connection task per accept, cancel everything on shutdown.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};

use crate::connection::handle_connection;
use crate::engine::ProxyEngine;
use crate::ProxyError;

pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    accept_handle: JoinHandle<()>,
}

impl Listener {
    /// Bind the configured port, falling back to an ephemeral one when the
    /// preferred port is taken, and start accepting.
    pub async fn bind(engine: Arc<ProxyEngine>) -> Result<Self, ProxyError> {
        let preferred = SocketAddr::new(
            engine.config.listen_addr,
            engine.config.listen_port.unwrap_or(0),
        );
        let listener = match TcpListener::bind(preferred).await {
            Ok(listener) => listener,
            Err(error) if error.kind() == io::ErrorKind::AddrInUse && preferred.port() != 0 => {
                tracing::warn!(%preferred, "preferred port in use, binding ephemeral");
                let fallback = SocketAddr::new(engine.config.listen_addr, 0);
                TcpListener::bind(fallback).await.map_err(|error| {
                    ProxyError::Config(format!("failed to bind {fallback}: {error}"))
                })?
            }
            Err(error) => {
                return Err(ProxyError::Config(format!(
                    "failed to bind {preferred}: {error}"
                )))
            }
        };
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "listener bound");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_handle = tokio::spawn(accept_loop(engine, listener, shutdown_rx));

        Ok(Self {
            local_addr,
            shutdown_tx,
            accept_handle,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// Stop accepting and cancel every live connection.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.accept_handle.await;
    }
}

async fn accept_loop(
    engine: Arc<ProxyEngine>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    connections.spawn(handle_connection(
                        Arc::clone(&engine),
                        stream,
                        peer,
                        shutdown.clone(),
                    ));
                }
                Err(error) => {
                    tracing::warn!(%error, "accept failed");
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown.changed() => break,
        }
    }
    // Connections were signalled; anything still alive gets aborted.
    connections.shutdown().await;
}

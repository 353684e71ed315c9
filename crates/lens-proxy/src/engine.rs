//! The engine context: configuration, CA store, leaf minter, TLS
//! capability, and traffic store, wired once and shared by every
//! connection task. No process-wide mutable state.

use std::sync::Arc;

use lens_pki::{CaStore, LeafIdentity, LeafMinter, MinterMetricsSnapshot, SecretStore};
use lens_store::{StoreError, TrafficRecord, TrafficStore, WsFrameRecord};

use crate::config::ProxyConfig;
use crate::tls::TlsEngine;
use crate::ProxyError;

pub struct ProxyEngine {
    pub config: ProxyConfig,
    ca: Arc<CaStore>,
    minter: Arc<LeafMinter>,
    pub tls: TlsEngine,
    store: Arc<TrafficStore>,
}

impl ProxyEngine {
    /// Wire an engine around an on-disk traffic database, capped at the
    /// configured `max_records`.
    pub fn open(
        config: ProxyConfig,
        secrets: Arc<dyn SecretStore>,
        traffic_db_path: impl AsRef<std::path::Path>,
    ) -> Result<Arc<Self>, ProxyError> {
        let store = TrafficStore::open(traffic_db_path, config.max_records)
            .map_err(|error| ProxyError::Persistence(error.to_string()))?;
        Self::new(config, secrets, store)
    }

    pub fn new(
        config: ProxyConfig,
        secrets: Arc<dyn SecretStore>,
        store: TrafficStore,
    ) -> Result<Arc<Self>, ProxyError> {
        config.validate()?;
        let ca = Arc::new(CaStore::new("Lensproxy", secrets));
        let minter = Arc::new(LeafMinter::new(Arc::clone(&ca), config.leaf_cache_ttl));
        let tls = TlsEngine::new(config.upstream_tls_insecure);
        Ok(Arc::new(Self {
            config,
            ca,
            minter,
            tls,
            store: Arc::new(store),
        }))
    }

    pub fn ca(&self) -> &CaStore {
        &self.ca
    }

    pub fn store(&self) -> &TrafficStore {
        &self.store
    }

    pub fn minter_metrics(&self) -> MinterMetricsSnapshot {
        self.minter.metrics_snapshot()
    }

    /// Interception applies when it is enabled, the host is not excluded,
    /// and a CA is actually loaded.
    pub fn should_intercept(&self, host: &str) -> bool {
        self.config.intercept_tls
            && !self.config.host_is_excluded(host)
            && self.ca.active().is_some()
    }

    /// Mint (or fetch) the leaf for a host off the async worker; RSA
    /// keygen is far too slow to run inline.
    pub async fn mint_identity(&self, host: &str) -> Result<Arc<LeafIdentity>, ProxyError> {
        let minter = Arc::clone(&self.minter);
        let host = host.to_string();
        tokio::task::spawn_blocking(move || minter.identity_for(&host))
            .await
            .map_err(|error| {
                ProxyError::CertIssueFailed(format!("mint task join failed: {error}"))
            })?
            .map_err(ProxyError::from)
    }

    /// Persist a finished exchange. Storage failures are logged and
    /// dropped; capture must never stall a connection.
    pub fn record_exchange(&self, record: TrafficRecord) {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(error) = store.insert(&record) {
                log_store_error("traffic record", &error);
            }
        });
    }

    pub fn record_ws_frame(&self, frame: WsFrameRecord) {
        let store = Arc::clone(&self.store);
        tokio::task::spawn_blocking(move || {
            if let Err(error) = store.insert_frame(&frame) {
                log_store_error("websocket frame", &error);
            }
        });
    }
}

fn log_store_error(what: &str, error: &StoreError) {
    tracing::warn!(%error, "dropping {what}: store insert failed");
}

//! Per-host leaf issuance with a TTL cache.
//!
//! Minting a 2048-bit RSA key is the expensive step, so lookups for the
//! same hostname are single-flighted: concurrent requests for one host
//! serialize on a per-host lock while other hosts mint in parallel. Cache
//! entries are invalidated by TTL expiry and by any CA change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;

use crate::authority::CaStore;
use crate::x509::{build_certificate, random_serial, CertProfile, CertificateParams, Name, SubjectAltName};
use crate::PkiError;

pub const DEFAULT_LEAF_CACHE_TTL: Duration = Duration::from_secs(3600);

const LEAF_RSA_BITS: usize = 2048;
const LEAF_VALIDITY: Duration = Duration::from_secs(30 * 24 * 3600);
const LEAF_BACKDATE: Duration = Duration::from_secs(300);
const LEAF_CACHE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafIdentity {
    pub host: String,
    pub cert_der: Vec<u8>,
    pub key_pkcs8_der: Vec<u8>,
    pub minted_at: SystemTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MinterMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub leaves_minted: u64,
}

struct CachedLeaf {
    minted_at: SystemTime,
    ca_generation: u64,
    identity: Arc<LeafIdentity>,
}

pub struct LeafMinter {
    authority: Arc<CaStore>,
    cache_ttl: Duration,
    cache: Mutex<HashMap<String, CachedLeaf>>,
    inflight: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    leaves_minted: AtomicU64,
}

impl LeafMinter {
    pub fn new(authority: Arc<CaStore>, cache_ttl: Duration) -> Self {
        Self {
            authority,
            cache_ttl,
            cache: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            leaves_minted: AtomicU64::new(0),
        }
    }

    /// Leaf identity for `host`, minting on cache miss. Fails with
    /// [`PkiError::CaUnavailable`] when no CA is loaded.
    pub fn identity_for(&self, host: &str) -> Result<Arc<LeafIdentity>, PkiError> {
        let normalized = normalize_host(host);
        let ca_generation = self.authority.generation();

        if let Some(identity) = self.cached(&normalized, ca_generation) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(identity);
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let host_lock = self.host_lock(&normalized);
        let _guard = host_lock
            .lock()
            .map_err(|_| PkiError::CertIssueFailed("host mint lock poisoned".to_string()))?;

        // Another minter may have finished while we waited on the host lock.
        let ca_generation = self.authority.generation();
        if let Some(identity) = self.cached(&normalized, ca_generation) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok(identity);
        }

        let identity = self.mint(&normalized)?;
        self.leaves_minted.fetch_add(1, Ordering::Relaxed);
        self.insert(&normalized, ca_generation, Arc::clone(&identity));
        Ok(identity)
    }

    pub fn metrics_snapshot(&self) -> MinterMetricsSnapshot {
        MinterMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            leaves_minted: self.leaves_minted.load(Ordering::Relaxed),
        }
    }

    fn cached(&self, host: &str, ca_generation: u64) -> Option<Arc<LeafIdentity>> {
        let cache = self.cache.lock().ok()?;
        let entry = cache.get(host)?;
        if entry.ca_generation != ca_generation {
            return None;
        }
        let age = SystemTime::now()
            .duration_since(entry.minted_at)
            .unwrap_or(Duration::ZERO);
        if age > self.cache_ttl {
            return None;
        }
        Some(Arc::clone(&entry.identity))
    }

    fn mint(&self, host: &str) -> Result<Arc<LeafIdentity>, PkiError> {
        let authority = self.authority.active().ok_or(PkiError::CaUnavailable)?;

        let key = RsaPrivateKey::new(&mut rand::thread_rng(), LEAF_RSA_BITS)
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?;
        let key_pkcs8_der = key
            .to_pkcs8_der()
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?
            .as_bytes()
            .to_vec();

        let now = SystemTime::now();
        let params = CertificateParams {
            serial: random_serial(),
            issuer: authority.subject().clone(),
            subject: Name::common_name(host),
            not_before: now - LEAF_BACKDATE,
            not_after: now + LEAF_VALIDITY,
            profile: CertProfile::Leaf,
            subject_alt_names: vec![SubjectAltName::for_host(host)],
        };
        let cert_der = build_certificate(&params, &key.to_public_key(), authority.signing_key())
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?;

        tracing::debug!(host, "minted leaf certificate");
        Ok(Arc::new(LeafIdentity {
            host: host.to_string(),
            cert_der,
            key_pkcs8_der,
            minted_at: now,
        }))
    }

    /// Last write wins; expired and over-capacity entries are pruned here
    /// rather than on a timer.
    fn insert(&self, host: &str, ca_generation: u64, identity: Arc<LeafIdentity>) {
        let Ok(mut cache) = self.cache.lock() else {
            return;
        };
        let now = SystemTime::now();
        cache.retain(|_, entry| {
            now.duration_since(entry.minted_at)
                .map(|age| age <= self.cache_ttl)
                .unwrap_or(true)
        });
        if cache.len() >= LEAF_CACHE_CAPACITY {
            if let Some(oldest) = cache
                .iter()
                .min_by_key(|(_, entry)| entry.minted_at)
                .map(|(host, _)| host.clone())
            {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            host.to_string(),
            CachedLeaf {
                minted_at: identity.minted_at,
                ca_generation,
                identity,
            },
        );
    }

    fn host_lock(&self, host: &str) -> Arc<Mutex<()>> {
        let Ok(mut inflight) = self.inflight.lock() else {
            return Arc::new(Mutex::new(()));
        };
        inflight.retain(|_, lock| Arc::strong_count(lock) > 1);
        Arc::clone(
            inflight
                .entry(host.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }
}

fn normalize_host(host: &str) -> String {
    match host.parse::<std::net::IpAddr>() {
        Ok(_) => host.to_string(),
        Err(_) => host.to_ascii_lowercase(),
    }
}

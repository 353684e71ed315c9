//! Root CA ownership: generation, persistence, fingerprinting, deletion.
//!
//! The store keeps the active CA behind a read-write lock so concurrent
//! leaf minters share it while generate/delete stay exclusive. Key and
//! certificate persist through the [`SecretStore`] as a named blob pair.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, SystemTime};

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use rsa::RsaPrivateKey;
use sha2::{Digest, Sha256};

use crate::secret_store::SecretStore;
use crate::x509::{build_certificate, random_serial, CertProfile, CertificateParams, Name};
use crate::PkiError;

pub const CA_CERT_BLOB: &str = "ca_certificate.der";
pub const CA_KEY_BLOB: &str = "ca_private_key.der";

const CA_RSA_BITS: usize = 2048;
const CA_VALIDITY: Duration = Duration::from_secs(10 * 365 * 24 * 3600);
// Leeway so a freshly minted root is valid on devices with a lagging clock.
const CA_BACKDATE: Duration = Duration::from_secs(3600);

#[derive(Debug)]
pub struct CertificateAuthority {
    key: RsaPrivateKey,
    cert_der: Vec<u8>,
    subject: Name,
}

impl CertificateAuthority {
    /// Handed by reference to the X.509 builder; the key never leaves the
    /// store except as the persisted PKCS#8 blob.
    pub fn signing_key(&self) -> &RsaPrivateKey {
        &self.key
    }

    pub fn subject(&self) -> &Name {
        &self.subject
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn fingerprint(&self) -> [u8; 32] {
        Sha256::digest(&self.cert_der).into()
    }

    pub fn fingerprint_hex(&self) -> String {
        self.fingerprint()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }

    /// PEM rendering with 64-column base64 body, for device provisioning.
    pub fn cert_pem(&self) -> String {
        let encoded = BASE64_STANDARD.encode(&self.cert_der);
        let mut pem = String::with_capacity(encoded.len() + 64);
        pem.push_str("-----BEGIN CERTIFICATE-----\n");
        for chunk in encoded.as_bytes().chunks(64) {
            pem.push_str(&String::from_utf8_lossy(chunk));
            pem.push('\n');
        }
        pem.push_str("-----END CERTIFICATE-----\n");
        pem
    }
}

pub struct CaStore {
    product_name: String,
    secrets: Arc<dyn SecretStore>,
    active: RwLock<Option<Arc<CertificateAuthority>>>,
    generation: AtomicU64,
}

impl CaStore {
    pub fn new(product_name: impl Into<String>, secrets: Arc<dyn SecretStore>) -> Self {
        Self {
            product_name: product_name.into(),
            secrets,
            active: RwLock::new(None),
            generation: AtomicU64::new(0),
        }
    }

    /// The currently loaded CA, if any. Cheap; taken on every leaf mint.
    pub fn active(&self) -> Option<Arc<CertificateAuthority>> {
        self.active
            .read()
            .ok()
            .and_then(|guard| guard.as_ref().cloned())
    }

    /// Bumped whenever the CA changes so leaf caches can invalidate.
    pub fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// SHA-256 of the active CA certificate DER.
    pub fn fingerprint(&self) -> Option<[u8; 32]> {
        self.active().map(|authority| authority.fingerprint())
    }

    /// PEM export of the active CA certificate, for device provisioning.
    pub fn cert_pem(&self) -> Option<String> {
        self.active().map(|authority| authority.cert_pem())
    }

    /// Load persisted material into the store. Returns `None` when neither
    /// blob exists; a partial pair is rejected.
    pub fn load(&self) -> Result<Option<Arc<CertificateAuthority>>, PkiError> {
        let cert_der = self.secrets.get(CA_CERT_BLOB)?;
        let key_der = self.secrets.get(CA_KEY_BLOB)?;
        let (cert_der, key_der) = match (cert_der, key_der) {
            (Some(cert), Some(key)) => (cert, key),
            (None, None) => return Ok(None),
            _ => {
                return Err(PkiError::InvalidCaMaterial(
                    "certificate and private key blobs must exist as a pair".to_string(),
                ))
            }
        };

        let key = RsaPrivateKey::from_pkcs8_der(&key_der)
            .map_err(|error| PkiError::InvalidCaMaterial(error.to_string()))?;
        let authority = Arc::new(CertificateAuthority {
            key,
            cert_der,
            subject: self.ca_name(),
        });
        self.install(Some(Arc::clone(&authority)));
        Ok(Some(authority))
    }

    /// Generate a fresh self-signed root and persist it. Replaces any
    /// previously active CA.
    pub fn generate(&self) -> Result<Arc<CertificateAuthority>, PkiError> {
        let key = RsaPrivateKey::new(&mut rand::thread_rng(), CA_RSA_BITS)
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?;

        let name = self.ca_name();
        let now = SystemTime::now();
        let params = CertificateParams {
            serial: random_serial(),
            issuer: name.clone(),
            subject: name.clone(),
            not_before: now - CA_BACKDATE,
            not_after: now + CA_VALIDITY,
            profile: CertProfile::CertificateAuthority,
            subject_alt_names: Vec::new(),
        };
        let cert_der = build_certificate(&params, &key.to_public_key(), &key)
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?;

        let key_der = key
            .to_pkcs8_der()
            .map_err(|error| PkiError::CertIssueFailed(error.to_string()))?;
        self.secrets.put(CA_CERT_BLOB, &cert_der)?;
        self.secrets.put(CA_KEY_BLOB, key_der.as_bytes())?;

        let authority = Arc::new(CertificateAuthority {
            key,
            cert_der,
            subject: name,
        });
        self.install(Some(Arc::clone(&authority)));
        tracing::debug!(
            fingerprint = %authority.fingerprint_hex(),
            "generated new root certificate authority"
        );
        Ok(authority)
    }

    pub fn load_or_generate(&self) -> Result<Arc<CertificateAuthority>, PkiError> {
        if let Some(authority) = self.load()? {
            return Ok(authority);
        }
        self.generate()
    }

    /// Remove both persisted blobs and drop the active CA.
    pub fn delete(&self) -> Result<(), PkiError> {
        self.install(None);
        let cert_result = self.secrets.delete(CA_CERT_BLOB);
        let key_result = self.secrets.delete(CA_KEY_BLOB);
        cert_result?;
        key_result?;
        Ok(())
    }

    fn install(&self, authority: Option<Arc<CertificateAuthority>>) {
        if let Ok(mut guard) = self.active.write() {
            *guard = authority;
        }
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    fn ca_name(&self) -> Name {
        Name {
            country: None,
            organization: Some(self.product_name.clone()),
            common_name: format!("{} Root CA", self.product_name),
        }
    }
}

//! Certificate authority and leaf-minting subsystem for lensproxy.
//!
//! `der` and `x509` build certificates byte-by-byte; `authority` owns the
//! root CA and its persistence through an abstract [`SecretStore`];
//! `minter` issues cached per-host leaves for TLS interception.

pub mod authority;
pub mod der;
pub mod minter;
pub mod secret_store;
pub mod x509;

pub use authority::{CaStore, CertificateAuthority, CA_CERT_BLOB, CA_KEY_BLOB};
pub use minter::{LeafIdentity, LeafMinter, MinterMetricsSnapshot, DEFAULT_LEAF_CACHE_TTL};
pub use secret_store::{DirSecretStore, MemorySecretStore, SecretStore, SecretStoreError};
pub use x509::{CertProfile, CertificateParams, Name, SubjectAltName, X509Error};

#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    #[error("no certificate authority is loaded")]
    CaUnavailable,
    #[error("certificate issuance failed: {0}")]
    CertIssueFailed(String),
    #[error("invalid certificate authority material: {0}")]
    InvalidCaMaterial(String),
    #[error("secret store operation failed: {0}")]
    Persistence(#[from] SecretStoreError),
}

//! TLS as a capability: accept toward the client with a minted leaf,
//! connect toward the real server with WebPKI verification.

use std::sync::Arc;

use lens_pki::LeafIdentity;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::{client, server, TlsAcceptor, TlsConnector};

use crate::{HandshakeSide, ProxyError};

pub struct TlsEngine {
    connector: TlsConnector,
}

impl TlsEngine {
    pub fn new(upstream_tls_insecure: bool) -> Self {
        let mut config = if upstream_tls_insecure {
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
                .with_no_client_auth()
        } else {
            let roots = RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
            ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Self {
            connector: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Terminate TLS toward the client using a minted leaf. The chain
    /// presents the leaf followed by the issuing CA.
    pub async fn accept<S>(
        &self,
        stream: S,
        identity: &LeafIdentity,
        ca_cert_der: &[u8],
    ) -> Result<server::TlsStream<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let chain = vec![
            CertificateDer::from(identity.cert_der.clone()),
            CertificateDer::from(ca_cert_der.to_vec()),
        ];
        let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(identity.key_pkcs8_der.clone()));
        let mut server_config = ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(chain, key)
            .map_err(|error| ProxyError::TlsHandshakeFailed {
                side: HandshakeSide::Client,
                detail: format!("server config build failed: {error}"),
            })?;
        server_config.alpn_protocols = vec![b"http/1.1".to_vec()];

        TlsAcceptor::from(Arc::new(server_config))
            .accept(stream)
            .await
            .map_err(|error| ProxyError::TlsHandshakeFailed {
                side: HandshakeSide::Client,
                detail: error.to_string(),
            })
    }

    /// Open the server-facing TLS leg with SNI set to the target host.
    pub async fn connect<S>(
        &self,
        stream: S,
        host: &str,
    ) -> Result<client::TlsStream<S>, ProxyError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let server_name =
            ServerName::try_from(host.to_string()).map_err(|_| ProxyError::TlsHandshakeFailed {
                side: HandshakeSide::Server,
                detail: format!("invalid server name: {host:?}"),
            })?;
        self.connector
            .connect(server_name, stream)
            .await
            .map_err(|error| ProxyError::TlsHandshakeFailed {
                side: HandshakeSide::Server,
                detail: error.to_string(),
            })
    }
}

/// Coarse failure reason recorded alongside a failed handshake.
pub fn classify_tls_error(detail: &str) -> &'static str {
    let lower = detail.to_ascii_lowercase();
    if contains_any(
        &lower,
        &["unknown ca", "unknown issuer", "unknownissuer", "self signed", "unknown authority"],
    ) {
        return "unknown_ca";
    }
    if contains_any(&lower, &["timed out", "timeout", "deadline has elapsed"]) {
        return "timeout";
    }
    if contains_any(
        &lower,
        &["unexpected eof", "eof", "connection reset", "broken pipe", "connection aborted"],
    ) {
        return "eof_or_reset";
    }
    if contains_any(
        &lower,
        &["certificate", "cert", "x509", "name mismatch", "hostname mismatch", "expired"],
    ) {
        return "cert_validation";
    }
    if contains_any(&lower, &["handshake", "alert", "protocol version", "decrypt error"]) {
        return "handshake";
    }
    "other"
}

fn contains_any(haystack: &str, needles: &[&str]) -> bool {
    needles.iter().any(|needle| haystack.contains(needle))
}

#[derive(Debug)]
struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ED25519,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
        ]
    }
}

//! X.509 v3 certificate assembly over the DER primitives.
//!
//! One builder serves both the self-signed root and per-host leaves; the
//! profile picks the extension set. Signing is SHA-256 over the encoded
//! TBSCertificate with RSA PKCS#1 v1.5.

use std::net::IpAddr;
use std::time::SystemTime;

use rand::RngCore;
use rsa::pkcs1::EncodeRsaPublicKey;
use rsa::{Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use crate::der;

const OID_RSA_ENCRYPTION: &[u64] = &[1, 2, 840, 113_549, 1, 1, 1];
const OID_SHA256_WITH_RSA: &[u64] = &[1, 2, 840, 113_549, 1, 1, 11];
const OID_COUNTRY: &[u64] = &[2, 5, 4, 6];
const OID_ORGANIZATION: &[u64] = &[2, 5, 4, 10];
const OID_COMMON_NAME: &[u64] = &[2, 5, 4, 3];
const OID_KEY_USAGE: &[u64] = &[2, 5, 29, 15];
const OID_SUBJECT_ALT_NAME: &[u64] = &[2, 5, 29, 17];
const OID_BASIC_CONSTRAINTS: &[u64] = &[2, 5, 29, 19];
const OID_EXT_KEY_USAGE: &[u64] = &[2, 5, 29, 37];
const OID_KP_SERVER_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 1];
const OID_KP_CLIENT_AUTH: &[u64] = &[1, 3, 6, 1, 5, 5, 7, 3, 2];

// keyCertSign + cRLSign for the root, digitalSignature + keyEncipherment
// for leaves.
const KEY_USAGE_CA: u8 = 0x06;
const KEY_USAGE_LEAF: u8 = 0xA0;

const SAN_TAG_DNS: u8 = 2;
const SAN_TAG_IP: u8 = 7;

#[derive(Debug, thiserror::Error)]
pub enum X509Error {
    #[error("public key encoding failed: {0}")]
    KeyEncoding(String),
    #[error("signing failed: {0}")]
    Signing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertProfile {
    CertificateAuthority,
    Leaf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Name {
    pub country: Option<String>,
    pub organization: Option<String>,
    pub common_name: String,
}

impl Name {
    pub fn common_name(common_name: impl Into<String>) -> Self {
        Self {
            country: None,
            organization: None,
            common_name: common_name.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubjectAltName {
    Dns(String),
    Ip(IpAddr),
}

impl SubjectAltName {
    /// A hostname that parses as an IPv4/IPv6 literal becomes an IP SAN,
    /// everything else a DNS SAN.
    pub fn for_host(host: &str) -> Self {
        match host.parse::<IpAddr>() {
            Ok(ip) => Self::Ip(ip),
            Err(_) => Self::Dns(host.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateParams {
    pub serial: [u8; 16],
    pub issuer: Name,
    pub subject: Name,
    pub not_before: SystemTime,
    pub not_after: SystemTime,
    pub profile: CertProfile,
    pub subject_alt_names: Vec<SubjectAltName>,
}

/// 16 random bytes with the top bit cleared so the INTEGER stays positive.
pub fn random_serial() -> [u8; 16] {
    let mut serial = [0_u8; 16];
    rand::thread_rng().fill_bytes(&mut serial);
    serial[0] &= 0x7F;
    serial
}

/// Assemble and sign a complete certificate, returning its DER bytes.
pub fn build_certificate(
    params: &CertificateParams,
    subject_key: &RsaPublicKey,
    signing_key: &RsaPrivateKey,
) -> Result<Vec<u8>, X509Error> {
    let tbs = build_tbs(params, subject_key)?;
    let signature = sign_tbs(&tbs, signing_key)?;

    let mut certificate = Vec::new();
    certificate.extend_from_slice(&tbs);
    certificate.extend_from_slice(&signature_algorithm());
    certificate.extend_from_slice(&der::bit_string(&signature));
    Ok(der::sequence(&certificate))
}

/// SHA-256 digest of the TBS bytes, RSA PKCS#1 v1.5. Shared by root and
/// leaf issuance.
pub fn sign_tbs(tbs: &[u8], signing_key: &RsaPrivateKey) -> Result<Vec<u8>, X509Error> {
    let digest = Sha256::digest(tbs);
    signing_key
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|error| X509Error::Signing(error.to_string()))
}

fn build_tbs(params: &CertificateParams, subject_key: &RsaPublicKey) -> Result<Vec<u8>, X509Error> {
    let mut tbs = Vec::new();
    // version [0] EXPLICIT INTEGER(2) = v3
    tbs.extend_from_slice(&der::context_explicit(0, &der::integer(&[2])));
    tbs.extend_from_slice(&der::integer(&params.serial));
    tbs.extend_from_slice(&signature_algorithm());
    tbs.extend_from_slice(&encode_name(&params.issuer));
    tbs.extend_from_slice(&encode_validity(params.not_before, params.not_after));
    tbs.extend_from_slice(&encode_name(&params.subject));
    tbs.extend_from_slice(&encode_subject_public_key_info(subject_key)?);
    tbs.extend_from_slice(&der::context_explicit(3, &encode_extensions(params)));
    Ok(der::sequence(&tbs))
}

fn signature_algorithm() -> Vec<u8> {
    let mut inner = der::oid(OID_SHA256_WITH_RSA);
    inner.extend_from_slice(&der::null());
    der::sequence(&inner)
}

/// RDNSequence with attributes in C, O, CN order. C is PrintableString,
/// O and CN are UTF8String.
fn encode_name(name: &Name) -> Vec<u8> {
    let mut rdns = Vec::new();
    if let Some(country) = &name.country {
        rdns.extend_from_slice(&encode_rdn(OID_COUNTRY, der::printable_string(country)));
    }
    if let Some(organization) = &name.organization {
        rdns.extend_from_slice(&encode_rdn(OID_ORGANIZATION, der::utf8_string(organization)));
    }
    rdns.extend_from_slice(&encode_rdn(OID_COMMON_NAME, der::utf8_string(&name.common_name)));
    der::sequence(&rdns)
}

fn encode_rdn(attribute_oid: &[u64], value: Vec<u8>) -> Vec<u8> {
    let mut attribute = der::oid(attribute_oid);
    attribute.extend_from_slice(&value);
    der::set(&der::sequence(&attribute))
}

fn encode_validity(not_before: SystemTime, not_after: SystemTime) -> Vec<u8> {
    let mut validity = encode_time(not_before);
    validity.extend_from_slice(&encode_time(not_after));
    der::sequence(&validity)
}

fn encode_time(at: SystemTime) -> Vec<u8> {
    let utc = OffsetDateTime::from(at);
    let (year, month, day) = (utc.year(), u8::from(utc.month()), utc.day());
    let (hour, minute, second) = (utc.hour(), utc.minute(), utc.second());
    if year >= 2050 {
        der::generalized_time(year, month, day, hour, minute, second)
    } else {
        der::utc_time(year, month, day, hour, minute, second)
    }
}

fn encode_subject_public_key_info(subject_key: &RsaPublicKey) -> Result<Vec<u8>, X509Error> {
    let public_der = subject_key
        .to_pkcs1_der()
        .map_err(|error| X509Error::KeyEncoding(error.to_string()))?;

    let mut algorithm = der::oid(OID_RSA_ENCRYPTION);
    algorithm.extend_from_slice(&der::null());

    let mut spki = der::sequence(&algorithm);
    spki.extend_from_slice(&der::bit_string(public_der.as_bytes()));
    Ok(der::sequence(&spki))
}

fn encode_extensions(params: &CertificateParams) -> Vec<u8> {
    let mut extensions = Vec::new();
    let is_ca = params.profile == CertProfile::CertificateAuthority;

    let basic_constraints = if is_ca {
        der::sequence(&der::boolean(true))
    } else {
        der::sequence(&[])
    };
    extensions.extend_from_slice(&encode_extension(
        OID_BASIC_CONSTRAINTS,
        true,
        &basic_constraints,
    ));

    let key_usage_bits = if is_ca { KEY_USAGE_CA } else { KEY_USAGE_LEAF };
    extensions.extend_from_slice(&encode_extension(
        OID_KEY_USAGE,
        true,
        &der::bit_string(&[key_usage_bits]),
    ));

    if !is_ca {
        let mut purposes = der::oid(OID_KP_SERVER_AUTH);
        purposes.extend_from_slice(&der::oid(OID_KP_CLIENT_AUTH));
        extensions.extend_from_slice(&encode_extension(
            OID_EXT_KEY_USAGE,
            false,
            &der::sequence(&purposes),
        ));

        if !params.subject_alt_names.is_empty() {
            let mut names = Vec::new();
            for san in &params.subject_alt_names {
                match san {
                    SubjectAltName::Dns(host) => {
                        names.extend_from_slice(&der::context_implicit(
                            SAN_TAG_DNS,
                            host.as_bytes(),
                        ));
                    }
                    SubjectAltName::Ip(IpAddr::V4(ip)) => {
                        names.extend_from_slice(&der::context_implicit(SAN_TAG_IP, &ip.octets()));
                    }
                    SubjectAltName::Ip(IpAddr::V6(ip)) => {
                        names.extend_from_slice(&der::context_implicit(SAN_TAG_IP, &ip.octets()));
                    }
                }
            }
            extensions.extend_from_slice(&encode_extension(
                OID_SUBJECT_ALT_NAME,
                false,
                &der::sequence(&names),
            ));
        }
    }

    der::sequence(&extensions)
}

/// Extension ::= SEQUENCE { extnID, critical BOOLEAN DEFAULT FALSE,
/// extnValue OCTET STRING }. A false critical flag is omitted per DER.
fn encode_extension(extension_oid: &[u64], critical: bool, inner: &[u8]) -> Vec<u8> {
    let mut extension = der::oid(extension_oid);
    if critical {
        extension.extend_from_slice(&der::boolean(true));
    }
    extension.extend_from_slice(&der::octet_string(inner));
    der::sequence(&extension)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::{Duration, SystemTime};

    use x509_parser::prelude::*;

    use super::*;

    fn test_key() -> RsaPrivateKey {
        RsaPrivateKey::new(&mut rand::thread_rng(), 2048).expect("generate RSA key")
    }

    fn ca_params() -> CertificateParams {
        let name = Name {
            country: Some("US".to_string()),
            organization: Some("Lensproxy".to_string()),
            common_name: "Lensproxy Root CA".to_string(),
        };
        CertificateParams {
            serial: random_serial(),
            issuer: name.clone(),
            subject: name,
            not_before: SystemTime::now() - Duration::from_secs(60),
            not_after: SystemTime::now() + Duration::from_secs(10 * 365 * 24 * 3600),
            profile: CertProfile::CertificateAuthority,
            subject_alt_names: Vec::new(),
        }
    }

    fn leaf_params(issuer: &Name, host: &str) -> CertificateParams {
        CertificateParams {
            serial: random_serial(),
            issuer: issuer.clone(),
            subject: Name::common_name(host),
            not_before: SystemTime::now() - Duration::from_secs(60),
            not_after: SystemTime::now() + Duration::from_secs(30 * 24 * 3600),
            profile: CertProfile::Leaf,
            subject_alt_names: vec![SubjectAltName::for_host(host)],
        }
    }

    /// Decode every nested TLV and re-encode it; the output must be the
    /// input, byte for byte.
    fn reencode_tlv_tree(buf: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        let mut rest = buf;
        while !rest.is_empty() {
            let tag = rest[0];
            let first = rest[1];
            let (len, header) = if first < 0x80 {
                (first as usize, 2)
            } else {
                let count = (first & 0x7F) as usize;
                let mut len = 0usize;
                for byte in &rest[2..2 + count] {
                    len = len * 256 + *byte as usize;
                }
                (len, 2 + count)
            };
            let content = &rest[header..header + len];
            let rebuilt = if tag & 0x20 != 0 {
                reencode_tlv_tree(content)
            } else {
                content.to_vec()
            };
            out.push(tag);
            out.extend_from_slice(&crate::der::encode_length(rebuilt.len()));
            out.extend_from_slice(&rebuilt);
            rest = &rest[header + len..];
        }
        out
    }

    #[test]
    fn ca_certificate_round_trips_and_parses_as_v3() {
        let key = test_key();
        let der = build_certificate(&ca_params(), &key.to_public_key(), &key)
            .expect("build CA certificate");

        assert_eq!(reencode_tlv_tree(&der), der);

        let (_, parsed) = parse_x509_certificate(&der).expect("parse CA certificate");
        assert_eq!(parsed.version(), X509Version::V3);
        assert!(parsed.is_ca());
        assert!(parsed
            .subject()
            .iter_common_name()
            .any(|cn| cn.as_str() == Ok("Lensproxy Root CA")));

        let basic = parsed
            .basic_constraints()
            .expect("basic constraints present")
            .expect("basic constraints parsed");
        assert!(basic.critical);
        let key_usage = parsed
            .key_usage()
            .expect("key usage present")
            .expect("key usage parsed");
        assert!(key_usage.critical);
        assert!(key_usage.value.key_cert_sign());
        assert!(key_usage.value.crl_sign());
    }

    #[test]
    fn leaf_verifies_against_ca_and_carries_dns_san() {
        let ca_key = test_key();
        let ca = ca_params();
        let ca_der =
            build_certificate(&ca, &ca_key.to_public_key(), &ca_key).expect("build CA certificate");
        let (_, ca_cert) = parse_x509_certificate(&ca_der).expect("parse CA certificate");

        let leaf_key = test_key();
        let leaf_der = build_certificate(
            &leaf_params(&ca.subject, "api.example.com"),
            &leaf_key.to_public_key(),
            &ca_key,
        )
        .expect("build leaf certificate");
        let (_, leaf) = parse_x509_certificate(&leaf_der).expect("parse leaf certificate");

        leaf.verify_signature(Some(ca_cert.public_key()))
            .expect("leaf signature verifies against CA key");
        assert_eq!(leaf.issuer(), ca_cert.subject());

        let san = leaf
            .subject_alternative_name()
            .expect("SAN present")
            .expect("SAN parsed");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::DNSName("api.example.com"))));

        let key_usage = leaf.key_usage().expect("key usage").expect("parsed");
        assert!(key_usage.value.digital_signature());
        assert!(key_usage.value.key_encipherment());
        let eku = leaf
            .extended_key_usage()
            .expect("EKU present")
            .expect("EKU parsed");
        assert!(eku.value.server_auth);
        assert!(eku.value.client_auth);
    }

    #[test]
    fn ip_host_becomes_ip_san() {
        let ca_key = test_key();
        let ca = ca_params();
        let leaf_key = test_key();
        let leaf_der = build_certificate(
            &leaf_params(&ca.subject, "10.0.0.7"),
            &leaf_key.to_public_key(),
            &ca_key,
        )
        .expect("build leaf certificate");
        let (_, leaf) = parse_x509_certificate(&leaf_der).expect("parse leaf certificate");
        let san = leaf
            .subject_alternative_name()
            .expect("SAN present")
            .expect("SAN parsed");
        assert!(san
            .value
            .general_names
            .iter()
            .any(|name| matches!(name, GeneralName::IPAddress(&[10, 0, 0, 7]))));
    }

    #[test]
    fn serials_are_positive_and_distinct() {
        let mut seen = HashSet::new();
        for _ in 0..256 {
            let serial = random_serial();
            assert_eq!(serial.len(), 16);
            assert_eq!(serial[0] & 0x80, 0);
            assert!(seen.insert(serial));
        }
    }

    #[test]
    fn validity_past_2049_uses_generalized_time() {
        // 2060-01-01 is far enough past the UTCTime horizon.
        let encoded = encode_time(SystemTime::UNIX_EPOCH + Duration::from_secs(2_840_140_800));
        assert_eq!(encoded[0], 0x18);
        // 2026 stays UTCTime.
        let encoded = encode_time(SystemTime::UNIX_EPOCH + Duration::from_secs(1_780_000_000));
        assert_eq!(encoded[0], 0x17);
    }
}

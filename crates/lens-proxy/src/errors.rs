use lens_http::{HttpError, WsError};
use lens_pki::PkiError;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeSide {
    Client,
    Server,
}

impl HandshakeSide {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Client => "client",
            Self::Server => "server",
        }
    }
}

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("no certificate authority is loaded")]
    CaUnavailable,
    #[error("certificate issuance failed: {0}")]
    CertIssueFailed(String),
    #[error("upstream unreachable: {0}")]
    UpstreamUnreachable(String),
    #[error("upstream proxy protocol error: {0}")]
    UpstreamProtocol(String),
    #[error("TLS handshake with {} failed: {detail}", .side.as_str())]
    TlsHandshakeFailed { side: HandshakeSide, detail: String },
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("message head exceeded the configured limit")]
    HeaderTooLarge,
    #[error("message body exceeded the configured limit")]
    BodyTooLarge,
    #[error("websocket protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("timed out during {0}")]
    Timeout(&'static str),
    #[error("persistence failed: {0}")]
    Persistence(String),
    #[error("connection cancelled")]
    Cancelled,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Stable code recorded in the `error` column of a traffic record.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::CaUnavailable => "ca_unavailable",
            Self::CertIssueFailed(_) => "cert_issue_failed",
            Self::UpstreamUnreachable(_) => "upstream_unreachable",
            Self::UpstreamProtocol(_) => "upstream_protocol",
            Self::TlsHandshakeFailed { .. } => "tls_handshake_failed",
            Self::MalformedRequest(_) => "malformed_request",
            Self::MalformedResponse(_) => "malformed_response",
            Self::HeaderTooLarge => "header_too_large",
            Self::BodyTooLarge => "body_too_large",
            Self::ProtocolViolation(_) => "ws_protocol_violation",
            Self::Timeout(_) => "timeout",
            Self::Persistence(_) => "persistence",
            Self::Cancelled => "cancelled",
            Self::Io(_) => "io",
        }
    }

    /// Rendering used for the record `error` column: code plus detail.
    pub fn record_text(&self) -> String {
        format!("{}: {}", self.code(), self)
    }
}

impl From<HttpError> for ProxyError {
    fn from(error: HttpError) -> Self {
        match error {
            HttpError::MalformedRequest(detail) => Self::MalformedRequest(detail),
            HttpError::MalformedResponse(detail) => Self::MalformedResponse(detail),
            HttpError::HeaderTooLarge => Self::HeaderTooLarge,
            HttpError::BodyTooLarge => Self::BodyTooLarge,
        }
    }
}

impl From<PkiError> for ProxyError {
    fn from(error: PkiError) -> Self {
        match error {
            PkiError::CaUnavailable => Self::CaUnavailable,
            other => Self::CertIssueFailed(other.to_string()),
        }
    }
}

impl From<WsError> for ProxyError {
    fn from(error: WsError) -> Self {
        Self::ProtocolViolation(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_text_leads_with_the_code() {
        let error = ProxyError::UpstreamProtocol("non-2xx CONNECT response: 403".to_string());
        assert!(error.record_text().starts_with("upstream_protocol:"));

        let tls = ProxyError::TlsHandshakeFailed {
            side: HandshakeSide::Client,
            detail: "alert received".to_string(),
        };
        assert_eq!(tls.code(), "tls_handshake_failed");
        assert!(tls.to_string().contains("client"));
    }
}

//! HTTP/1.1 response head parsing and body delimitation.

use crate::websocket::accept_key;
use crate::{
    has_header_token, header_value, parse_content_length, parse_header_lines, parse_version,
    wants_close, BodyMode, Header, HttpError, Version,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHead {
    pub raw: Vec<u8>,
    pub version: Version,
    pub status: u16,
    pub reason: String,
    pub headers: Vec<Header>,
}

impl ResponseHead {
    pub fn parse(raw: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            HttpError::MalformedResponse("response head is not valid UTF-8".to_string())
        })?;
        let mut lines = text.split("\r\n");
        let status_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HttpError::MalformedResponse("empty status line".to_string()))?;

        let mut parts = status_line.splitn(3, ' ');
        let version_text = parts
            .next()
            .ok_or_else(|| HttpError::MalformedResponse("missing version".to_string()))?;
        let status_text = parts
            .next()
            .ok_or_else(|| HttpError::MalformedResponse("missing status code".to_string()))?;
        let reason = parts.next().unwrap_or("").to_string();

        let version = parse_version(version_text, HttpError::MalformedResponse)?;
        let status = status_text.parse::<u16>().map_err(|_| {
            HttpError::MalformedResponse(format!("invalid status code: {status_text:?}"))
        })?;
        let headers = parse_header_lines(lines, HttpError::MalformedResponse)?;

        Ok(Self {
            raw: raw.to_vec(),
            version,
            status,
            reason,
            headers,
        })
    }

    /// Body delimitation, in precedence order: status/method exemptions,
    /// chunked transfer coding, Content-Length, close-delimited, none.
    pub fn body_mode(&self, request_method: &str) -> Result<BodyMode, HttpError> {
        if request_method.eq_ignore_ascii_case("HEAD")
            || (100..200).contains(&self.status)
            || self.status == 204
            || self.status == 304
        {
            return Ok(BodyMode::None);
        }
        if has_header_token(&self.headers, "transfer-encoding", "chunked") {
            return Ok(BodyMode::Chunked);
        }
        if let Some(length) = parse_content_length(&self.headers, HttpError::MalformedResponse)? {
            return Ok(if length == 0 {
                BodyMode::None
            } else {
                BodyMode::ContentLength(length)
            });
        }
        if wants_close(self.version, &self.headers) {
            return Ok(BodyMode::CloseDelimited);
        }
        Ok(BodyMode::None)
    }

    pub fn wants_close(&self) -> bool {
        wants_close(self.version, &self.headers)
    }

    pub fn content_type(&self) -> Option<String> {
        header_value(&self.headers, "content-type").map(|value| value.to_string())
    }

    /// A 101 that completes the RFC 6455 handshake: upgrade and connection
    /// tokens present and the accept digest matching the client key.
    pub fn confirms_websocket_upgrade(&self, client_key: &str) -> bool {
        self.status == 101
            && has_header_token(&self.headers, "connection", "upgrade")
            && header_value(&self.headers, "upgrade")
                .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
            && header_value(&self.headers, "sec-websocket-accept")
                .map(|value| value.trim() == accept_key(client_key))
                .unwrap_or(false)
    }
}

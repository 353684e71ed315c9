//! HTTP/1.1 and WebSocket wire codecs.
//!
//! These parsers work on complete head byte slices (everything up to and
//! including the `CRLF CRLF` terminator); the connection layer owns the
//! socket reads and the size caps that feed them.

pub mod request;
pub mod response;
pub mod websocket;

pub use request::{RequestHead, RequestTarget};
pub use response::ResponseHead;
pub use websocket::{
    accept_key, apply_mask, build_frame, parse_frame, AssembledMessage, Frame, FrameParse,
    MessageAssembler, Opcode, WsDirection, WsError,
};

/// Hard cap on a request or response head. Anything larger is rejected
/// before parsing.
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum HttpError {
    #[error("malformed request: {0}")]
    MalformedRequest(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("message head exceeded {MAX_HEAD_BYTES} bytes")]
    HeaderTooLarge,
    #[error("message body exceeded the configured cap")]
    BodyTooLarge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Version {
    Http10,
    Http11,
}

impl Version {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Http10 => "HTTP/1.0",
            Self::Http11 => "HTTP/1.1",
        }
    }
}

/// How the message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyMode {
    None,
    ContentLength(u64),
    Chunked,
    CloseDelimited,
}

/// Header with original-case name. Comparison is always case-insensitive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub name: String,
    pub value: String,
}

pub fn header_value<'a>(headers: &'a [Header], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|header| header.name.eq_ignore_ascii_case(name))
        .map(|header| header.value.as_str())
}

/// True when any comma-separated token of the named header equals `token`.
pub fn has_header_token(headers: &[Header], name: &str, token: &str) -> bool {
    headers
        .iter()
        .filter(|header| header.name.eq_ignore_ascii_case(name))
        .flat_map(|header| header.value.split(','))
        .any(|value| value.trim().eq_ignore_ascii_case(token))
}

pub(crate) fn parse_header_lines<'a>(
    lines: impl Iterator<Item = &'a str>,
    malformed: impl Fn(String) -> HttpError,
) -> Result<Vec<Header>, HttpError> {
    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| malformed(format!("header line without a colon: {line:?}")))?;
        headers.push(Header {
            name: name.trim().to_string(),
            value: value.trim().to_string(),
        });
    }
    Ok(headers)
}

pub(crate) fn parse_version(text: &str, malformed: impl Fn(String) -> HttpError) -> Result<Version, HttpError> {
    match text {
        "HTTP/1.0" => Ok(Version::Http10),
        "HTTP/1.1" => Ok(Version::Http11),
        other => Err(malformed(format!("unsupported HTTP version: {other}"))),
    }
}

pub(crate) fn parse_content_length(
    headers: &[Header],
    malformed: impl Fn(String) -> HttpError,
) -> Result<Option<u64>, HttpError> {
    let mut value = None;
    for header in headers {
        if header.name.eq_ignore_ascii_case("content-length") {
            let parsed = header
                .value
                .parse::<u64>()
                .map_err(|_| malformed(format!("invalid Content-Length: {:?}", header.value)))?;
            value = Some(parsed);
        }
    }
    Ok(value)
}

/// Connection persistence per HTTP/1.x rules: explicit `close`, or
/// HTTP/1.0 without `keep-alive`.
pub(crate) fn wants_close(version: Version, headers: &[Header]) -> bool {
    if has_header_token(headers, "connection", "close") {
        return true;
    }
    version == Version::Http10 && !has_header_token(headers, "connection", "keep-alive")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_lookup_is_case_insensitive_and_preserves_case() {
        let headers = vec![
            Header {
                name: "X-Custom-Header".to_string(),
                value: "one".to_string(),
            },
            Header {
                name: "Connection".to_string(),
                value: "keep-alive, Upgrade".to_string(),
            },
        ];
        assert_eq!(header_value(&headers, "x-custom-header"), Some("one"));
        assert_eq!(headers[0].name, "X-Custom-Header");
        assert!(has_header_token(&headers, "CONNECTION", "upgrade"));
        assert!(!has_header_token(&headers, "connection", "close"));
    }

    #[test]
    fn duplicate_content_length_takes_last_value() {
        let headers = vec![
            Header {
                name: "Content-Length".to_string(),
                value: "10".to_string(),
            },
            Header {
                name: "content-length".to_string(),
                value: "20".to_string(),
            },
        ];
        let parsed = parse_content_length(&headers, HttpError::MalformedRequest).expect("parse");
        assert_eq!(parsed, Some(20));
    }
}

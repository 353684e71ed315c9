//! HTTP/1.1 request head parsing and target-form handling.

use crate::{
    has_header_token, header_value, parse_content_length, parse_header_lines, parse_version,
    wants_close, BodyMode, Header, HttpError, Version,
};

/// The request-target as written on the request line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestTarget {
    /// `scheme://host[:port]/path?query` — proxy form.
    Absolute {
        scheme: String,
        host: String,
        port: Option<u16>,
        path_and_query: String,
    },
    /// `host:port` — CONNECT form.
    Authority { host: String, port: u16 },
    /// `/path?query` — direct form, host comes from the `Host` header.
    Origin(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    pub raw: Vec<u8>,
    pub method: String,
    pub target_raw: String,
    pub target: RequestTarget,
    pub version: Version,
    pub headers: Vec<Header>,
}

impl RequestHead {
    /// Parse a complete head (through the `CRLF CRLF` terminator).
    pub fn parse(raw: &[u8]) -> Result<Self, HttpError> {
        let text = std::str::from_utf8(raw).map_err(|_| {
            HttpError::MalformedRequest("request head is not valid UTF-8".to_string())
        })?;
        let mut lines = text.split("\r\n");
        let request_line = lines
            .next()
            .filter(|line| !line.is_empty())
            .ok_or_else(|| HttpError::MalformedRequest("empty request line".to_string()))?;

        let mut parts = request_line.split(' ').filter(|part| !part.is_empty());
        let method = parts
            .next()
            .ok_or_else(|| HttpError::MalformedRequest("missing method".to_string()))?;
        let target_raw = parts
            .next()
            .ok_or_else(|| HttpError::MalformedRequest("missing request target".to_string()))?;
        let version_text = parts
            .next()
            .ok_or_else(|| HttpError::MalformedRequest("missing HTTP version".to_string()))?;
        if parts.next().is_some() {
            return Err(HttpError::MalformedRequest(
                "request line has too many fields".to_string(),
            ));
        }

        let version = parse_version(version_text, HttpError::MalformedRequest)?;
        let headers = parse_header_lines(lines, HttpError::MalformedRequest)?;
        let target = parse_target(method, target_raw)?;

        Ok(Self {
            raw: raw.to_vec(),
            method: method.to_string(),
            target_raw: target_raw.to_string(),
            target,
            version,
            headers,
        })
    }

    pub fn is_connect(&self) -> bool {
        self.method.eq_ignore_ascii_case("CONNECT")
    }

    /// Target authority wins; otherwise the `Host` header. No host at all
    /// is a malformed request.
    pub fn effective_host_port(&self) -> Result<(String, u16), HttpError> {
        match &self.target {
            RequestTarget::Authority { host, port } => Ok((host.clone(), *port)),
            RequestTarget::Absolute {
                scheme, host, port, ..
            } => {
                let port = port.unwrap_or(default_port_for_scheme(scheme));
                Ok((host.clone(), port))
            }
            RequestTarget::Origin(_) => {
                let host_header = header_value(&self.headers, "host").ok_or_else(|| {
                    HttpError::MalformedRequest(
                        "origin-form request without a Host header".to_string(),
                    )
                })?;
                split_host_port(host_header, 80).ok_or_else(|| {
                    HttpError::MalformedRequest(format!("invalid Host header: {host_header:?}"))
                })
            }
        }
    }

    /// Path component used for traffic records.
    pub fn path(&self) -> String {
        match &self.target {
            RequestTarget::Origin(path) => path.clone(),
            RequestTarget::Absolute { path_and_query, .. } => path_and_query.clone(),
            RequestTarget::Authority { .. } => String::new(),
        }
    }

    pub fn body_mode(&self) -> Result<BodyMode, HttpError> {
        if has_header_token(&self.headers, "transfer-encoding", "chunked") {
            return Ok(BodyMode::Chunked);
        }
        match parse_content_length(&self.headers, HttpError::MalformedRequest)? {
            Some(0) | None => Ok(BodyMode::None),
            Some(length) => Ok(BodyMode::ContentLength(length)),
        }
    }

    pub fn wants_close(&self) -> bool {
        wants_close(self.version, &self.headers)
    }

    pub fn is_websocket_upgrade(&self) -> bool {
        has_header_token(&self.headers, "connection", "upgrade")
            && header_value(&self.headers, "upgrade")
                .map(|value| value.trim().eq_ignore_ascii_case("websocket"))
                .unwrap_or(false)
    }

    pub fn websocket_key(&self) -> Option<&str> {
        header_value(&self.headers, "sec-websocket-key")
    }

    /// Re-emit the head with the target converted to origin form, for
    /// forwarding to the true server rather than an upstream proxy. Headers
    /// pass through untouched, `Host` included.
    pub fn encode_for_origin(&self) -> Vec<u8> {
        let target = match &self.target {
            RequestTarget::Absolute { path_and_query, .. } => path_and_query.as_str(),
            _ => self.target_raw.as_str(),
        };
        self.encode_with_target(target)
    }

    /// Re-emit the head exactly as parsed (original target form).
    pub fn encode(&self) -> Vec<u8> {
        self.encode_with_target(&self.target_raw)
    }

    /// Re-emit the head with an absolute-form target, as an upstream proxy
    /// expects. Origin-form requests are absolutized from the derived host.
    pub fn encode_for_proxy(&self) -> Vec<u8> {
        match &self.target {
            RequestTarget::Origin(path) => match self.effective_host_port() {
                Ok((host, port)) => {
                    let authority = if port == 80 {
                        host
                    } else {
                        format!("{host}:{port}")
                    };
                    self.encode_with_target(&format!("http://{authority}{path}"))
                }
                Err(_) => self.encode(),
            },
            _ => self.encode(),
        }
    }

    fn encode_with_target(&self, target: &str) -> Vec<u8> {
        let mut head = Vec::with_capacity(self.raw.len());
        head.extend_from_slice(self.method.as_bytes());
        head.push(b' ');
        head.extend_from_slice(target.as_bytes());
        head.push(b' ');
        head.extend_from_slice(self.version.as_str().as_bytes());
        head.extend_from_slice(b"\r\n");
        for header in &self.headers {
            head.extend_from_slice(header.name.as_bytes());
            head.extend_from_slice(b": ");
            head.extend_from_slice(header.value.as_bytes());
            head.extend_from_slice(b"\r\n");
        }
        head.extend_from_slice(b"\r\n");
        head
    }
}

fn parse_target(method: &str, target: &str) -> Result<RequestTarget, HttpError> {
    if method.eq_ignore_ascii_case("CONNECT") {
        let (host, port) = split_host_port(target, 443).ok_or_else(|| {
            HttpError::MalformedRequest(format!("invalid CONNECT authority: {target:?}"))
        })?;
        return Ok(RequestTarget::Authority { host, port });
    }

    if target.starts_with('/') {
        return Ok(RequestTarget::Origin(target.to_string()));
    }

    if let Some((scheme, rest)) = target.split_once("://") {
        let (authority, path_and_query) = match rest.find('/') {
            Some(slash) => (&rest[..slash], rest[slash..].to_string()),
            None => (rest, "/".to_string()),
        };
        let default = default_port_for_scheme(scheme);
        let (host, port) = split_host_port(authority, default).ok_or_else(|| {
            HttpError::MalformedRequest(format!("invalid authority in target: {authority:?}"))
        })?;
        let port = if port == default { None } else { Some(port) };
        return Ok(RequestTarget::Absolute {
            scheme: scheme.to_ascii_lowercase(),
            host,
            port,
            path_and_query,
        });
    }

    Err(HttpError::MalformedRequest(format!(
        "unrecognized request target: {target:?}"
    )))
}

fn default_port_for_scheme(scheme: &str) -> u16 {
    if scheme.eq_ignore_ascii_case("https") || scheme.eq_ignore_ascii_case("wss") {
        443
    } else {
        80
    }
}

/// `host[:port]` with bracketed IPv6 literals. Returns `None` on an empty
/// host or an unparsable port.
pub fn split_host_port(authority: &str, default_port: u16) -> Option<(String, u16)> {
    if authority.is_empty() {
        return None;
    }
    if let Some(rest) = authority.strip_prefix('[') {
        let (host, tail) = rest.split_once(']')?;
        if host.is_empty() {
            return None;
        }
        let port = match tail.strip_prefix(':') {
            Some(port_text) => port_text.parse::<u16>().ok()?,
            None if tail.is_empty() => default_port,
            None => return None,
        };
        return Some((host.to_string(), port));
    }

    match authority.rsplit_once(':') {
        Some((host, port_text)) if !host.contains(':') => {
            if host.is_empty() {
                return None;
            }
            let port = port_text.parse::<u16>().ok()?;
            Some((host.to_string(), port))
        }
        // More than one colon without brackets: a bare IPv6 literal.
        Some(_) => Some((authority.to_string(), default_port)),
        None => Some((authority.to_string(), default_port)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_origin_form_with_host_header() {
        let head = RequestHead::parse(b"GET /foo?x=1 HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .expect("parse request");
        assert_eq!(head.method, "GET");
        assert_eq!(head.target, RequestTarget::Origin("/foo?x=1".to_string()));
        assert_eq!(
            head.effective_host_port().expect("host"),
            ("example.com".to_string(), 80)
        );
        assert_eq!(head.path(), "/foo?x=1");
        assert_eq!(head.body_mode().expect("body mode"), BodyMode::None);
    }

    #[test]
    fn parses_absolute_form_and_rewrites_to_origin() {
        let head = RequestHead::parse(
            b"GET http://example.com:8080/api/v1?q=2 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n",
        )
        .expect("parse request");
        assert_eq!(
            head.effective_host_port().expect("host"),
            ("example.com".to_string(), 8080)
        );

        let rewritten = head.encode_for_origin();
        let text = String::from_utf8(rewritten).expect("utf8");
        assert!(text.starts_with("GET /api/v1?q=2 HTTP/1.1\r\n"));
        assert!(text.contains("Host: example.com:8080\r\n"));
        assert!(text.contains("Accept: */*\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn connect_target_defaults_to_443() {
        let head = RequestHead::parse(b"CONNECT example.com:8443 HTTP/1.1\r\n\r\n")
            .expect("parse CONNECT");
        assert!(head.is_connect());
        assert_eq!(
            head.target,
            RequestTarget::Authority {
                host: "example.com".to_string(),
                port: 8443
            }
        );

        let bare = RequestHead::parse(b"CONNECT example.com HTTP/1.1\r\n\r\n").expect("parse");
        assert_eq!(
            bare.effective_host_port().expect("host"),
            ("example.com".to_string(), 443)
        );
    }

    #[test]
    fn origin_form_without_host_is_malformed() {
        let head = RequestHead::parse(b"GET / HTTP/1.1\r\n\r\n").expect("parse");
        assert!(matches!(
            head.effective_host_port(),
            Err(HttpError::MalformedRequest(_))
        ));
    }

    #[test]
    fn garbage_start_line_is_malformed() {
        assert!(matches!(
            RequestHead::parse(b"\x16\x03\x01\x02\x00garbage\r\n\r\n"),
            Err(HttpError::MalformedRequest(_))
        ));
        assert!(matches!(
            RequestHead::parse(b"GET /\r\n\r\n"),
            Err(HttpError::MalformedRequest(_))
        ));
    }

    #[test]
    fn chunked_transfer_encoding_wins_over_content_length() {
        let head = RequestHead::parse(
            b"POST /up HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\nTransfer-Encoding: chunked\r\n\r\n",
        )
        .expect("parse");
        assert_eq!(head.body_mode().expect("body mode"), BodyMode::Chunked);
    }

    #[test]
    fn websocket_upgrade_detection() {
        let head = RequestHead::parse(
            b"GET /ws HTTP/1.1\r\nHost: h\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n",
        )
        .expect("parse");
        assert!(head.is_websocket_upgrade());
        assert_eq!(head.websocket_key(), Some("dGhlIHNhbXBsZSBub25jZQ=="));
    }

    #[test]
    fn origin_form_absolutizes_for_an_upstream_proxy() {
        let head = RequestHead::parse(b"GET /data HTTP/1.1\r\nHost: example.com:8080\r\n\r\n")
            .expect("parse request");
        let text = String::from_utf8(head.encode_for_proxy()).expect("utf8");
        assert!(text.starts_with("GET http://example.com:8080/data HTTP/1.1\r\n"));

        let default_port = RequestHead::parse(b"GET /data HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .expect("parse request");
        let text = String::from_utf8(default_port.encode_for_proxy()).expect("utf8");
        assert!(text.starts_with("GET http://example.com/data HTTP/1.1\r\n"));
    }

    #[test]
    fn ipv6_authorities_parse_with_brackets() {
        assert_eq!(
            split_host_port("[::1]:8443", 443),
            Some(("::1".to_string(), 8443))
        );
        assert_eq!(split_host_port("[::1]", 443), Some(("::1".to_string(), 443)));
        assert_eq!(split_host_port("", 443), None);
        assert_eq!(split_host_port("host:bogus", 443), None);
    }
}

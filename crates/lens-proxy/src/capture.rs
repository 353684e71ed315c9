//! Per-exchange capture state, finalized into a [`TrafficRecord`].

use std::time::{Instant, SystemTime, UNIX_EPOCH};

use lens_http::{Header, RequestHead, ResponseHead};
use lens_store::{Protocol, TrafficRecord};
use uuid::Uuid;

use crate::relay::BodyCapture;
use crate::ProxyError;

pub fn unix_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

fn headers_to_pairs(headers: &[Header]) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|header| (header.name.clone(), header.value.clone()))
        .collect()
}

/// Accumulates one exchange from the first parsed request line until the
/// response completes or the connection fails.
pub struct ExchangeCapture {
    id: String,
    connection_id: String,
    started_at: Instant,
    started_unix: f64,
    protocol: Protocol,
    method: String,
    host: String,
    port: u16,
    path: String,
    request_headers: Vec<(String, String)>,
    pub request_body: BodyCapture,
    status: Option<u16>,
    response_headers: Vec<(String, String)>,
    pub response_body: BodyCapture,
    response_content_type: Option<String>,
    error: Option<String>,
}

impl ExchangeCapture {
    pub fn begin(
        connection_id: &str,
        protocol: Protocol,
        request: &RequestHead,
        host: &str,
        port: u16,
        body_cap: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            started_at: Instant::now(),
            started_unix: unix_timestamp(),
            protocol,
            method: request.method.clone(),
            host: host.to_string(),
            port,
            path: request.path(),
            request_headers: headers_to_pairs(&request.headers),
            request_body: BodyCapture::new(body_cap),
            status: None,
            response_headers: Vec::new(),
            response_body: BodyCapture::new(body_cap),
            response_content_type: None,
            error: None,
        }
    }

    /// A tunnel-level capture with no parsed request (CONNECT, opaque
    /// forward).
    pub fn begin_tunnel(
        connection_id: &str,
        protocol: Protocol,
        method: &str,
        host: &str,
        port: u16,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            connection_id: connection_id.to_string(),
            started_at: Instant::now(),
            started_unix: unix_timestamp(),
            protocol,
            method: method.to_string(),
            host: host.to_string(),
            port,
            path: String::new(),
            request_headers: Vec::new(),
            request_body: BodyCapture::new(0),
            status: None,
            response_headers: Vec::new(),
            response_body: BodyCapture::new(0),
            response_content_type: None,
            error: None,
        }
    }

    pub fn set_response(&mut self, response: &ResponseHead) {
        self.status = Some(response.status);
        self.response_headers = headers_to_pairs(&response.headers);
        self.response_content_type = response.content_type();
    }

    pub fn set_protocol(&mut self, protocol: Protocol) {
        self.protocol = protocol;
    }

    /// First failure wins; later errors on the same exchange are kept out
    /// of the record.
    pub fn fail(&mut self, error: &ProxyError) {
        if self.error.is_none() {
            self.error = Some(error.record_text());
        }
    }

    pub fn has_error(&self) -> bool {
        self.error.is_some()
    }

    pub fn finish(self) -> TrafficRecord {
        let truncated = self.request_body.truncated() || self.response_body.truncated();
        let error = self.error.or(if truncated {
            Some("body_too_large: capture truncated at the configured cap".to_string())
        } else {
            None
        });
        TrafficRecord {
            id: self.id,
            connection_id: self.connection_id,
            timestamp: self.started_unix,
            protocol: self.protocol,
            method: self.method,
            host: self.host,
            port: self.port,
            path: self.path,
            status: self.status,
            request_headers: self.request_headers,
            request_body: self.request_body.into_bytes(),
            response_headers: self.response_headers,
            response_body: self.response_body.into_bytes(),
            response_content_type: self.response_content_type,
            duration: self.started_at.elapsed().as_secs_f64(),
            error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exchange_finishes_with_status_and_positive_duration() {
        let request = RequestHead::parse(b"GET /foo HTTP/1.1\r\nHost: example.com\r\n\r\n")
            .expect("parse request");
        let mut capture = ExchangeCapture::begin(
            "conn-1",
            Protocol::Http,
            &request,
            "example.com",
            80,
            1024,
        );
        let response = ResponseHead::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 3\r\n\r\n")
            .expect("parse response");
        capture.set_response(&response);
        capture.response_body.push(b"bar");

        let record = capture.finish();
        assert_eq!(record.status, Some(200));
        assert_eq!(record.method, "GET");
        assert_eq!(record.path, "/foo");
        assert_eq!(record.response_body, b"bar");
        assert!(record.duration >= 0.0);
        assert!(record.error.is_none());
    }

    #[test]
    fn first_error_wins_and_truncation_marks_the_record() {
        let request = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").expect("parse");
        let mut capture =
            ExchangeCapture::begin("conn-1", Protocol::Https, &request, "h", 443, 2);
        capture.fail(&ProxyError::Timeout("response_headers"));
        capture.fail(&ProxyError::CaUnavailable);
        let record = capture.finish();
        assert!(record.error.expect("error recorded").starts_with("timeout:"));

        let request = RequestHead::parse(b"GET / HTTP/1.1\r\nHost: h\r\n\r\n").expect("parse");
        let mut capture =
            ExchangeCapture::begin("conn-1", Protocol::Https, &request, "h", 443, 2);
        capture.response_body.push(b"too many bytes");
        let record = capture.finish();
        assert!(record
            .error
            .expect("truncation marked")
            .starts_with("body_too_large"));
    }
}

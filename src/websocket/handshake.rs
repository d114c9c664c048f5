//! HTTP/1.1 upgrade negotiation.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use crate::error::HandshakeError;

/// GUID appended to the client key before hashing (RFC 6455 section 1.3).
pub const MAGIC_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub const KEY_HEADER: &str = "Sec-WebSocket-Key";

const BAD_REQUEST: &str = "HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n";

/// Accept token for `key`: base64(SHA-1(key ++ GUID)).
pub fn accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(MAGIC_GUID.as_bytes());
    STANDARD.encode(hasher.finalize())
}

/// True once the blank line terminating the request head has arrived.
pub fn request_complete(buf: &[u8]) -> bool {
    buf.windows(4).any(|window| window == b"\r\n\r\n")
}

/// Collects `Key: Value` lines from an upgrade request.
///
/// The request line is skipped and parsing stops at the first blank line.
/// Lines without `": "` are ignored.
pub fn parse_headers(request: &str) -> HashMap<String, String> {
    request
        .split('\n')
        .skip(1)
        .map(|line| line.trim_end_matches('\r'))
        .take_while(|line| !line.is_empty())
        .filter_map(|line| line.split_once(": "))
        .map(|(key, value)| (key.trim().to_string(), value.trim().to_string()))
        .collect()
}

/// Case-insensitive lookup into a parsed header map.
pub fn header<'a>(headers: &'a HashMap<String, String>, name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Token for the request described by `headers`.
pub fn token_for(headers: &HashMap<String, String>) -> Result<String, HandshakeError> {
    match header(headers, KEY_HEADER) {
        Some(key) if !key.is_empty() => Ok(accept_token(key)),
        _ => Err(HandshakeError::MissingKey),
    }
}

pub fn response(token: &str) -> String {
    [
        "HTTP/1.1 101 Web Socket Protocol Handshake".to_string(),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Accept: {}", token),
        String::new(),
        String::new(),
    ]
    .join("\r\n")
}

pub fn bad_request() -> &'static str {
    BAD_REQUEST
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_REQUEST: &str = "GET /chat HTTP/1.1\r\n\
        Host: server.example.com\r\n\
        Upgrade: websocket\r\n\
        Connection: Upgrade\r\n\
        Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
        Origin: http://example.com\r\n\
        Sec-WebSocket-Version: 13\r\n\
        \r\n";

    #[test]
    fn test_rfc_accept_token() {
        assert_eq!(accept_token("dGhlIHNhbXBsZSBub25jZQ=="), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_parse_headers() {
        let headers = parse_headers(SAMPLE_REQUEST);
        assert_eq!(headers.len(), 6);
        assert_eq!(headers["Host"], "server.example.com");
        assert_eq!(headers["Sec-WebSocket-Key"], "dGhlIHNhbXBsZSBub25jZQ==");
        assert_eq!(headers["Sec-WebSocket-Version"], "13");
    }

    #[test]
    fn test_parse_headers_without_carriage_returns() {
        let headers = parse_headers("GET / HTTP/1.1\nHost: a\nUpgrade: websocket\n\nignored: body");
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["Upgrade"], "websocket");
    }

    #[test]
    fn test_token_lookup_is_case_insensitive() {
        let headers = parse_headers("GET / HTTP/1.1\r\nsec-websocket-key: dGhlIHNhbXBsZSBub25jZQ==\r\n\r\n");
        assert_eq!(token_for(&headers).unwrap(), "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
    }

    #[test]
    fn test_missing_key() {
        let headers = parse_headers("GET / HTTP/1.1\r\nHost: a\r\n\r\n");
        assert_eq!(token_for(&headers), Err(HandshakeError::MissingKey));
    }

    #[test]
    fn test_response_layout() {
        let response = response("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        assert_eq!(
            response,
            "HTTP/1.1 101 Web Socket Protocol Handshake\r\n\
             Upgrade: websocket\r\n\
             Connection: Upgrade\r\n\
             Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"
        );
    }

    #[test]
    fn test_request_complete() {
        assert!(request_complete(SAMPLE_REQUEST.as_bytes()));
        assert!(!request_complete(b"GET / HTTP/1.1\r\nHost: a\r\n"));
    }
}

//! HTTP request state and authorisation strategies.

use crate::stamp::Stamp;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use std::collections::VecDeque;
use std::fmt::Write as _;
use thiserror::Error;

/// Default per-request response timeout.
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u32 = 60_000;

/// Request methods the datalogger REST surface uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
}

impl Method {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Post => "POST",
            Self::Put => "PUT",
        }
    }
}

/// Failures while interpreting a URI.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("invalid http uri: {0}")]
pub struct BadUri(pub String);

/// A parsed `http`/`https`/`ws`/`wss` URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpUri {
    pub secure: bool,
    pub host: String,
    pub port: u16,
    /// Path plus query, always starting with a slash.
    pub path: String,
}

impl HttpUri {
    /// Parses `scheme://host[:port][/path]`.
    pub fn parse(text: &str) -> Result<Self, BadUri> {
        let (scheme, rest) = text
            .split_once("://")
            .ok_or_else(|| BadUri(text.to_string()))?;
        let secure = match scheme {
            "http" | "ws" => false,
            "https" | "wss" => true,
            _ => return Err(BadUri(text.to_string())),
        };
        let (authority, path) = match rest.find('/') {
            Some(index) => (&rest[..index], &rest[index..]),
            None => (rest, "/"),
        };
        if authority.is_empty() {
            return Err(BadUri(text.to_string()));
        }
        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port_text)) => {
                let port = port_text.parse().map_err(|_| BadUri(text.to_string()))?;
                (host.to_string(), port)
            }
            None => (authority.to_string(), if secure { 443 } else { 80 }),
        };
        Ok(Self {
            secure,
            host,
            port,
            path: path.to_string(),
        })
    }

    /// `host:port` for the socket connect.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// How the request authenticates itself.
#[derive(Debug, Clone, Default)]
pub enum Authorisation {
    #[default]
    None,
    /// `Authorization: Basic b64(user:password)`.
    Basic { user: String, password: String },
    /// `Authorization: Bearer <token>`.
    Bearer { token: String },
    /// Signed-header scheme used by the Konect gateway: an HMAC-SHA1
    /// over device id, message type, body, nonce and timestamp, keyed
    /// by the shared secret, carried as separate headers.
    Kdapi {
        device_id: String,
        message_type: String,
        konect_id: String,
        konect_secret: String,
    },
}

type HmacSha1 = Hmac<Sha1>;

impl Authorisation {
    fn write(&self, out: &mut String, body: &[u8]) {
        match self {
            Self::None => {}
            Self::Basic { user, password } => {
                let encoded = BASE64.encode(format!("{user}:{password}"));
                let _ = write!(out, "Authorization: Basic {encoded}\r\n");
            }
            Self::Bearer { token } => {
                let _ = write!(out, "Authorization: Bearer {token}\r\n");
            }
            Self::Kdapi {
                device_id,
                message_type,
                konect_id,
                konect_secret,
            } => {
                let timestamp = (Stamp::now().nanos() / crate::stamp::NSEC_PER_SEC).to_string();
                let nonce: u64 = rand::random();
                let nonce = format!("{nonce:016x}");
                let mut mac = HmacSha1::new_from_slice(konect_secret.as_bytes())
                    .expect("hmac accepts any key length");
                mac.update(device_id.as_bytes());
                mac.update(message_type.as_bytes());
                mac.update(body);
                mac.update(nonce.as_bytes());
                mac.update(timestamp.as_bytes());
                let signature = BASE64.encode(mac.finalize().into_bytes());
                let _ = write!(out, "Kdapi-Id: {konect_id}\r\n");
                let _ = write!(out, "Kdapi-Timestamp: {timestamp}\r\n");
                let _ = write!(out, "Kdapi-Nonce: {nonce}\r\n");
                let _ = write!(out, "Kdapi-Signature: {signature}\r\n");
            }
        }
    }
}

/// One HTTP request with its response state.
#[derive(Debug)]
pub struct Request {
    pub method: Method,
    pub uri: HttpUri,
    pub authorisation: Authorisation,
    pub content_type: Option<String>,
    pub if_modified_since: Option<Stamp>,
    pub response_timeout_ms: u32,
    /// Push-only queue of request body bytes.
    send_buffer: Vec<u8>,
    /// The application has pushed the whole body.
    pub send_complete: bool,
    /// Body streamed with chunked transfer coding instead of a length.
    pub send_chunked: bool,

    // Websocket upgrade fields.
    pub upgrade: Option<String>,
    pub websock_key: Option<String>,
    pub websock_protocol: Option<String>,

    // Parsed response state.
    pub response_code: u32,
    pub response_description: String,
    pub response_content_length: Option<u64>,
    pub response_chunked: bool,
    pub will_close: bool,
    pub last_modified: Option<Stamp>,
    pub location: Option<String>,
    pub response_content_type: Option<String>,
    pub websock_accept: Option<String>,
    /// Pull-only queue of response body bytes.
    receive_buffer: VecDeque<u8>,
}

impl Request {
    #[must_use]
    pub fn new(method: Method, uri: HttpUri) -> Self {
        Self {
            method,
            uri,
            authorisation: Authorisation::None,
            content_type: None,
            if_modified_since: None,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            send_buffer: Vec::new(),
            send_complete: method == Method::Get,
            send_chunked: false,
            upgrade: None,
            websock_key: None,
            websock_protocol: None,
            response_code: 0,
            response_description: String::new(),
            response_content_length: None,
            response_chunked: false,
            will_close: false,
            last_modified: None,
            location: None,
            response_content_type: None,
            websock_accept: None,
            receive_buffer: VecDeque::new(),
        }
    }

    /// Marks this request as a websocket upgrade with a fresh random
    /// key.
    pub fn set_websocket_upgrade(&mut self, protocol: &str) {
        let key: [u8; 16] = rand::random();
        self.upgrade = Some("websocket".to_string());
        self.websock_key = Some(BASE64.encode(key));
        self.websock_protocol = Some(protocol.to_string());
    }

    /// Pushes request body bytes; `complete` marks the end of the body.
    pub fn add_body(&mut self, bytes: &[u8], complete: bool) {
        self.send_buffer.extend_from_slice(bytes);
        if complete {
            self.send_complete = true;
        }
    }

    /// Drains queued request body bytes for transmission.
    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.send_buffer)
    }

    pub(crate) fn queued_body_len(&self) -> usize {
        self.send_buffer.len()
    }

    /// Appends received body bytes.
    pub(crate) fn push_response(&mut self, bytes: &[u8]) {
        self.receive_buffer.extend(bytes);
    }

    /// Pulls up to `max` received body bytes.
    pub fn read_response(&mut self, max: usize) -> Vec<u8> {
        let take = max.min(self.receive_buffer.len());
        self.receive_buffer.drain(..take).collect()
    }

    /// All received body bytes so far.
    pub fn read_response_all(&mut self) -> Vec<u8> {
        self.receive_buffer.drain(..).collect()
    }

    /// Writes the request header block. The body length must be final
    /// unless the body is chunked.
    #[must_use]
    pub fn format_header(&self) -> String {
        let mut out = String::with_capacity(256);
        let _ = write!(out, "{} {} HTTP/1.1\r\n", self.method.as_str(), self.uri.path);
        let _ = write!(out, "Host: {}\r\n", self.uri.host);
        let _ = write!(out, "User-Agent: fieldlink/{}\r\n", env!("CARGO_PKG_VERSION"));
        if let Some(content_type) = &self.content_type {
            let _ = write!(out, "Content-Type: {content_type}\r\n");
        }
        if self.method != Method::Get || !self.send_buffer.is_empty() {
            if self.send_chunked {
                out.push_str("Transfer-Encoding: chunked\r\n");
            } else {
                let _ = write!(out, "Content-Length: {}\r\n", self.send_buffer.len());
            }
        }
        if let Some(stamp) = self.if_modified_since {
            let _ = write!(out, "If-Modified-Since: {}\r\n", stamp.to_rfc1123());
        }
        self.authorisation.write(&mut out, &self.send_buffer);
        if let Some(upgrade) = &self.upgrade {
            let _ = write!(out, "Upgrade: {upgrade}\r\n");
            out.push_str("Connection: Upgrade\r\n");
            if let Some(key) = &self.websock_key {
                let _ = write!(out, "Sec-WebSocket-Key: {key}\r\n");
            }
            out.push_str("Sec-WebSocket-Version: 13\r\n");
            if let Some(protocol) = &self.websock_protocol {
                let _ = write!(out, "Sec-WebSocket-Protocol: {protocol}\r\n");
            }
        }
        out.push_str("\r\n");
        out
    }

    /// Parses a complete response header block. Returns false when the
    /// status line is unusable.
    pub fn parse_response(&mut self, header: &str) -> bool {
        let mut lines = header.split("\r\n");
        let Some(status) = lines.next() else {
            return false;
        };
        let mut status_parts = status.splitn(3, ' ');
        let Some(version) = status_parts.next() else {
            return false;
        };
        if !version.starts_with("HTTP/") {
            return false;
        }
        let Some(code) = status_parts.next().and_then(|code| code.parse().ok()) else {
            return false;
        };
        self.response_code = code;
        self.response_description = status_parts.next().unwrap_or("").to_string();
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "content-length" => self.response_content_length = value.parse().ok(),
                "transfer-encoding" => {
                    self.response_chunked = value.eq_ignore_ascii_case("chunked");
                }
                "connection" => {
                    if value.eq_ignore_ascii_case("close") {
                        self.will_close = true;
                    }
                }
                "content-type" => self.response_content_type = Some(value.to_string()),
                "last-modified" => self.last_modified = Stamp::parse_rfc1123(value),
                "location" => self.location = Some(value.to_string()),
                "sec-websocket-accept" => self.websock_accept = Some(value.to_string()),
                _ => {}
            }
        }
        true
    }

    /// The accept token the server must echo for this upgrade request.
    #[must_use]
    pub fn expected_websock_accept(&self) -> Option<String> {
        self.websock_key.as_deref().map(websock_accept_for)
    }
}

/// Computes `Sec-WebSocket-Accept` for a key.
#[must_use]
pub fn websock_accept_for(key: &str) -> String {
    use sha1::Digest;
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11");
    BASE64.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uri_parse_defaults_ports() {
        let plain = HttpUri::parse("http://logger.example/tables").unwrap();
        assert_eq!(plain.port, 80);
        assert!(!plain.secure);
        assert_eq!(plain.path, "/tables");
        let secure = HttpUri::parse("https://logger.example:8443").unwrap();
        assert_eq!(secure.port, 8443);
        assert!(secure.secure);
        assert_eq!(secure.path, "/");
        assert!(HttpUri::parse("ftp://x").is_err());
    }

    #[test]
    fn header_carries_basic_authorisation() {
        let uri = HttpUri::parse("http://logger.example/?command=DataQuery").unwrap();
        let mut request = Request::new(Method::Get, uri);
        request.authorisation = Authorisation::Basic {
            user: "admin".to_string(),
            password: "pw".to_string(),
        };
        let header = request.format_header();
        assert!(header.starts_with("GET /?command=DataQuery HTTP/1.1\r\n"));
        assert!(header.contains("Host: logger.example\r\n"));
        // b64("admin:pw")
        assert!(header.contains("Authorization: Basic YWRtaW46cHc=\r\n"));
        assert!(header.ends_with("\r\n\r\n"));
    }

    #[test]
    fn post_carries_content_length() {
        let uri = HttpUri::parse("http://logger.example/values").unwrap();
        let mut request = Request::new(Method::Post, uri);
        request.add_body(b"{\"value\":1}", true);
        let header = request.format_header();
        assert!(header.contains("Content-Length: 11\r\n"));
    }

    #[test]
    fn chunked_body_advertises_transfer_encoding() {
        let uri = HttpUri::parse("http://logger.example/file").unwrap();
        let mut request = Request::new(Method::Put, uri);
        request.send_chunked = true;
        let header = request.format_header();
        assert!(header.contains("Transfer-Encoding: chunked\r\n"));
        assert!(!header.contains("Content-Length"));
    }

    #[test]
    fn response_parse_extracts_fields() {
        let uri = HttpUri::parse("http://logger.example/").unwrap();
        let mut request = Request::new(Method::Get, uri);
        let ok = request.parse_response(
            "HTTP/1.1 200 OK\r\nContent-Length: 120\r\nConnection: close\r\nLast-Modified: Sun, 06 Nov 1994 08:49:37 GMT\r\nContent-Type: application/json",
        );
        assert!(ok);
        assert_eq!(request.response_code, 200);
        assert_eq!(request.response_description, "OK");
        assert_eq!(request.response_content_length, Some(120));
        assert!(request.will_close);
        assert!(request.last_modified.is_some());
    }

    #[test]
    fn websock_accept_matches_rfc_example() {
        // The worked example from RFC 6455 section 1.3.
        assert_eq!(
            websock_accept_for("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn upgrade_header_fields_are_written() {
        let uri = HttpUri::parse("ws://logger.example/ws").unwrap();
        let mut request = Request::new(Method::Get, uri);
        request.set_websocket_upgrade("cs-datalogger");
        let header = request.format_header();
        assert!(header.contains("Upgrade: websocket\r\n"));
        assert!(header.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(header.contains("Sec-WebSocket-Protocol: cs-datalogger\r\n"));
        assert!(header.contains("Sec-WebSocket-Key: "));
    }
}

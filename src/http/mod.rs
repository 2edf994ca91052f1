//! HTTP/1.1 client with request pipelining and websocket upgrade.
//!
//! [`HttpConnection`] is a sans-io state machine: the owning transport
//! feeds received bytes in and drains wire output. [`fetch`] drives one
//! request over a fresh TCP connection for callers that just want a
//! response. [`websocket`] layers RFC 6455 framing over an upgraded
//! connection.

pub mod request;
pub mod websocket;

pub use request::{Authorisation, HttpUri, Method, Request};

use crate::stamp::{Stamp, NSEC_PER_MSEC};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Idle time before a connection with nothing queued is closed.
pub const DEFAULT_WAIT_INTERVAL_MS: u32 = 30_000;

/// Why a request failed.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum HttpFailure {
    #[error("could not connect to the server")]
    Connect,
    #[error("the connection closed mid-response")]
    Disconnected,
    #[error("the response header could not be parsed")]
    BadHeader,
    #[error("a chunk length line could not be parsed")]
    BadChunkLength,
    #[error("the response timed out")]
    Timeout,
    #[error("the websocket upgrade was refused")]
    UpgradeRefused,
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Connecting,
    SendingRequestBody,
    ReadingResponseHeader,
    ReadingResponseBody,
    ReadingResponseChunkLen,
    ReadingResponseChunk,
    /// Consuming the CRLF that trails each chunk.
    ReadingResponseChunkEnd,
    WaitingForNext,
    Closed,
}

/// Events the connection reports while bytes flow through it.
#[derive(Debug)]
pub enum HttpEvent {
    /// The response header arrived; the request is still in flight.
    HeaderReceived { code: u32 },
    /// The request finished; the response body is queued inside it.
    RequestComplete(Request),
    /// The request failed terminally.
    RequestFailed(Request, HttpFailure),
    /// A 101 switched the connection to an upgrade owner; subsequent
    /// bytes arrive as [`HttpEvent::UpgradeData`].
    Upgraded(Request),
    /// Bytes received after an upgrade.
    UpgradeData(Vec<u8>),
}

/// Sans-io HTTP/1.1 client connection.
pub struct HttpConnection {
    state: State,
    queue: std::collections::VecDeque<Request>,
    current: Option<Request>,
    output: Vec<u8>,
    header_buf: Vec<u8>,
    line_buf: Vec<u8>,
    body_remaining: u64,
    read_until_close: bool,
    upgraded: bool,
    wait_interval_ms: u32,
    request_started: Stamp,
    last_activity: Stamp,
}

impl HttpConnection {
    #[must_use]
    pub fn new(now: Stamp) -> Self {
        Self {
            state: State::Idle,
            queue: std::collections::VecDeque::new(),
            current: None,
            output: Vec::new(),
            header_buf: Vec::new(),
            line_buf: Vec::new(),
            body_remaining: 0,
            read_until_close: false,
            upgraded: false,
            wait_interval_ms: DEFAULT_WAIT_INTERVAL_MS,
            request_started: now,
            last_activity: now,
        }
    }

    /// Extends the idle window the application allows before close.
    pub fn set_wait_interval(&mut self, wait_interval_ms: u32) {
        self.wait_interval_ms = wait_interval_ms;
    }

    /// Queues a request. The caller must connect the transport when
    /// [`HttpConnection::wants_connect`] reports true.
    pub fn add_request(&mut self, request: Request, now: Stamp) {
        self.queue.push_back(request);
        if self.state == State::Idle || self.state == State::WaitingForNext {
            self.state = State::Connecting;
            self.request_started = now;
        }
    }

    /// True when a transport should be (re)established.
    #[must_use]
    pub fn wants_connect(&self) -> bool {
        self.state == State::Connecting
    }

    /// The peer the next request targets.
    #[must_use]
    pub fn next_target(&self) -> Option<&HttpUri> {
        self.queue.front().map(|request| &request.uri)
    }

    /// The transport is up; emits the header (and any complete body)
    /// for the front request.
    pub fn on_connected(&mut self, now: Stamp) {
        let Some(mut request) = self.queue.pop_front() else {
            return;
        };
        let header = request.format_header();
        trace!(first_line = header.lines().next().unwrap_or(""), "request header sent");
        self.output.extend_from_slice(header.as_bytes());
        if request.send_complete {
            let body = request.take_body();
            if request.send_chunked {
                self.write_chunked(&body, true);
            } else {
                self.output.extend_from_slice(&body);
            }
            self.state = State::ReadingResponseHeader;
        } else {
            self.state = State::SendingRequestBody;
        }
        self.header_buf.clear();
        self.request_started = now;
        self.last_activity = now;
        self.current = Some(request);
    }

    /// Streams more request body; `complete` finishes the request and
    /// moves to reading the response.
    pub fn push_body(&mut self, bytes: &[u8], complete: bool, now: Stamp) {
        if self.state != State::SendingRequestBody {
            return;
        }
        let chunked = self.current.as_ref().is_some_and(|request| request.send_chunked);
        if chunked {
            if !bytes.is_empty() {
                self.write_chunk(bytes);
            }
            if complete {
                self.output.extend_from_slice(b"0\r\n\r\n");
            }
        } else {
            self.output.extend_from_slice(bytes);
        }
        if complete {
            if let Some(request) = &mut self.current {
                request.send_complete = true;
            }
            self.state = State::ReadingResponseHeader;
            self.request_started = now;
        }
    }

    /// Drains bytes to write to the transport.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// True once the connection is spent.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state == State::Closed
    }

    /// True once an upgrade owner receives the byte stream.
    #[must_use]
    pub fn is_upgraded(&self) -> bool {
        self.upgraded
    }

    /// Idle close check: true when the connection has sat past its
    /// wait interval with nothing to do. The upgrade owner keeps its
    /// own liveness scheme instead.
    #[must_use]
    pub fn idle_expired(&self, now: Stamp) -> bool {
        !self.upgraded
            && self.state == State::WaitingForNext
            && self.queue.is_empty()
            && now - self.last_activity > i64::from(self.wait_interval_ms) * NSEC_PER_MSEC
    }

    /// Per-request response timeout check. Expiry fails only the
    /// current request; the caller closes the transport.
    pub fn poll_timeout(&mut self, now: Stamp) -> Option<HttpEvent> {
        if self.upgraded {
            return None;
        }
        let in_flight = matches!(
            self.state,
            State::ReadingResponseHeader
                | State::ReadingResponseBody
                | State::ReadingResponseChunkLen
                | State::ReadingResponseChunk
                | State::ReadingResponseChunkEnd
        );
        if !in_flight {
            return None;
        }
        let timeout_ms = self
            .current
            .as_ref()
            .map_or(request::DEFAULT_RESPONSE_TIMEOUT_MS, |request| {
                request.response_timeout_ms
            });
        if now - self.request_started > i64::from(timeout_ms) * NSEC_PER_MSEC {
            warn!("response timed out");
            self.state = State::Closed;
            self.current
                .take()
                .map(|request| HttpEvent::RequestFailed(request, HttpFailure::Timeout))
        } else {
            None
        }
    }

    /// Feeds received bytes.
    pub fn on_data(&mut self, bytes: &[u8], now: Stamp) -> Vec<HttpEvent> {
        let mut events = Vec::new();
        self.last_activity = now;
        if self.upgraded {
            events.push(HttpEvent::UpgradeData(bytes.to_vec()));
            return events;
        }
        let mut input = bytes;
        while !input.is_empty() {
            match self.state {
                State::ReadingResponseHeader => {
                    input = self.collect_header(input, &mut events, now);
                }
                State::ReadingResponseBody => {
                    let take = (self.body_remaining.min(input.len() as u64)) as usize;
                    if let Some(request) = &mut self.current {
                        request.push_response(&input[..take]);
                    }
                    if !self.read_until_close {
                        self.body_remaining -= take as u64;
                        if self.body_remaining == 0 {
                            self.complete_current(&mut events, now);
                        }
                    }
                    input = &input[take..];
                }
                State::ReadingResponseChunkLen => {
                    input = self.collect_chunk_len(input, &mut events, now);
                }
                State::ReadingResponseChunk => {
                    let take = (self.body_remaining.min(input.len() as u64)) as usize;
                    if let Some(request) = &mut self.current {
                        request.push_response(&input[..take]);
                    }
                    self.body_remaining -= take as u64;
                    if self.body_remaining == 0 {
                        self.state = State::ReadingResponseChunkEnd;
                        self.line_buf.clear();
                    }
                    input = &input[take..];
                }
                State::ReadingResponseChunkEnd => {
                    // Swallow the CRLF after the chunk data.
                    let mut consumed = 0;
                    for &byte in input {
                        consumed += 1;
                        if byte == b'\n' {
                            self.state = State::ReadingResponseChunkLen;
                            self.line_buf.clear();
                            break;
                        }
                    }
                    input = &input[consumed..];
                }
                State::WaitingForNext | State::Idle => {
                    // Stray bytes between responses are discarded.
                    trace!(count = input.len(), "discarding bytes between responses");
                    input = &[];
                }
                State::Connecting | State::SendingRequestBody | State::Closed => {
                    input = &[];
                }
            }
            if self.upgraded && !input.is_empty() {
                events.push(HttpEvent::UpgradeData(input.to_vec()));
                break;
            }
        }
        events
    }

    /// The transport dropped. A read-until-close body completes; any
    /// other in-flight request fails.
    pub fn on_close(&mut self, now: Stamp) -> Vec<HttpEvent> {
        let mut events = Vec::new();
        if self.read_until_close && self.state == State::ReadingResponseBody {
            self.complete_current(&mut events, now);
        } else if let Some(request) = self.current.take() {
            events.push(HttpEvent::RequestFailed(request, HttpFailure::Disconnected));
        }
        // Requests still queued go back to connecting so a fresh
        // transport can carry them.
        self.state = if self.queue.is_empty() {
            State::Closed
        } else {
            State::Connecting
        };
        events
    }

    fn collect_header<'a>(
        &mut self,
        input: &'a [u8],
        events: &mut Vec<HttpEvent>,
        now: Stamp,
    ) -> &'a [u8] {
        let mut consumed = 0;
        for &byte in input {
            consumed += 1;
            self.header_buf.push(byte);
            if self.header_buf.ends_with(b"\r\n\r\n") {
                let header = String::from_utf8_lossy(&self.header_buf).to_string();
                self.header_buf.clear();
                self.on_header(header.trim_end(), events, now);
                return &input[consumed..];
            }
        }
        &input[consumed..]
    }

    fn on_header(&mut self, header: &str, events: &mut Vec<HttpEvent>, now: Stamp) {
        let Some(request) = &mut self.current else {
            self.state = State::Closed;
            return;
        };
        if !request.parse_response(header) {
            warn!("unparsable response header");
            let request = self.current.take().expect("current checked above");
            events.push(HttpEvent::RequestFailed(request, HttpFailure::BadHeader));
            self.state = State::Closed;
            return;
        }
        let code = request.response_code;
        debug!(code, "response header received");
        events.push(HttpEvent::HeaderReceived { code });

        if request.upgrade.is_some() {
            if code == 101 && request.websock_accept == request.expected_websock_accept() {
                // The upgrade owner takes the byte stream from here;
                // the HTTP lifetime timers no longer apply.
                self.upgraded = true;
                let request = self.current.take().expect("current checked above");
                events.push(HttpEvent::Upgraded(request));
                return;
            }
            let request = self.current.take().expect("current checked above");
            events.push(HttpEvent::RequestFailed(request, HttpFailure::UpgradeRefused));
            self.state = State::Closed;
            return;
        }

        let bodyless = code == 204 || code == 304;
        if bodyless {
            self.complete_current(events, now);
        } else if request.response_chunked {
            self.state = State::ReadingResponseChunkLen;
            self.line_buf.clear();
        } else if let Some(length) = request.response_content_length {
            if length == 0 {
                self.complete_current(events, now);
            } else {
                self.body_remaining = length;
                self.read_until_close = false;
                self.state = State::ReadingResponseBody;
            }
        } else if request.will_close {
            // No framing at all: the body runs to connection close.
            self.read_until_close = true;
            self.body_remaining = u64::MAX;
            self.state = State::ReadingResponseBody;
        } else {
            self.complete_current(events, now);
        }
    }

    fn collect_chunk_len<'a>(
        &mut self,
        input: &'a [u8],
        events: &mut Vec<HttpEvent>,
        now: Stamp,
    ) -> &'a [u8] {
        let mut consumed = 0;
        for &byte in input {
            consumed += 1;
            if byte == b'\n' {
                let line = String::from_utf8_lossy(&self.line_buf).trim().to_string();
                self.line_buf.clear();
                if line.is_empty() {
                    // Blank line before a length; tolerate and keep
                    // scanning.
                    continue;
                }
                let digits = line.split(';').next().unwrap_or("").trim();
                match u64::from_str_radix(digits, 16) {
                    Ok(0) => {
                        // Zero-length chunk ends the body. The trailer
                        // CRLF rides in as the next blank line and is
                        // swallowed by the discard path.
                        self.complete_current(events, now);
                    }
                    Ok(length) => {
                        self.body_remaining = length;
                        self.state = State::ReadingResponseChunk;
                    }
                    Err(_) => {
                        warn!(line, "bad chunk length");
                        if let Some(request) = self.current.take() {
                            events.push(HttpEvent::RequestFailed(request, HttpFailure::BadChunkLength));
                        }
                        self.state = State::Closed;
                    }
                }
                return &input[consumed..];
            }
            if byte != b'\r' {
                self.line_buf.push(byte);
            }
        }
        &input[consumed..]
    }

    fn complete_current(&mut self, events: &mut Vec<HttpEvent>, now: Stamp) {
        if let Some(request) = self.current.take() {
            let will_close = request.will_close;
            events.push(HttpEvent::RequestComplete(request));
            self.last_activity = now;
            if will_close {
                self.state = State::Closed;
            } else if self.queue.is_empty() {
                self.state = State::WaitingForNext;
            } else {
                // Pipelined: the next request header goes out at once.
                self.on_connected(now);
            }
        }
    }

    fn write_chunked(&mut self, body: &[u8], last: bool) {
        if !body.is_empty() {
            self.write_chunk(body);
        }
        if last {
            self.output.extend_from_slice(b"0\r\n\r\n");
        }
    }

    fn write_chunk(&mut self, body: &[u8]) {
        self.output
            .extend_from_slice(format!("{:x}\r\n", body.len()).as_bytes());
        self.output.extend_from_slice(body);
        self.output.extend_from_slice(b"\r\n");
    }
}

/// Drives one request over a fresh TCP connection and returns it with
/// the response body queued inside. Plain-text transport; a TLS target
/// needs a transport the hosting application supplies.
pub async fn fetch(mut request: Request) -> Result<Request, HttpFailure> {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    let timeout = std::time::Duration::from_millis(u64::from(request.response_timeout_ms));
    let address = request.uri.address();
    request.send_complete = true;
    let mut conn = HttpConnection::new(Stamp::now());
    conn.add_request(request, Stamp::now());
    let mut stream = tokio::time::timeout(timeout, tokio::net::TcpStream::connect(&address))
        .await
        .map_err(|_| HttpFailure::Timeout)?
        .map_err(|_| HttpFailure::Connect)?;
    conn.on_connected(Stamp::now());
    stream
        .write_all(&conn.take_output())
        .await
        .map_err(|_| HttpFailure::Disconnected)?;
    let mut buffer = vec![0u8; 8192];
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let read = tokio::time::timeout_at(deadline, stream.read(&mut buffer))
            .await
            .map_err(|_| HttpFailure::Timeout)?
            .map_err(|_| HttpFailure::Disconnected)?;
        let events = if read == 0 {
            conn.on_close(Stamp::now())
        } else {
            conn.on_data(&buffer[..read], Stamp::now())
        };
        for event in events {
            match event {
                HttpEvent::RequestComplete(done) => return Ok(done),
                HttpEvent::RequestFailed(_, failure) => return Err(failure),
                _ => {}
            }
        }
        if read == 0 {
            return Err(HttpFailure::Disconnected);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(path: &str) -> Request {
        Request::new(Method::Get, HttpUri::parse(&format!("http://logger.example{path}")).unwrap())
    }

    fn start(request: Request) -> HttpConnection {
        let now = Stamp::from_nanos(0);
        let mut conn = HttpConnection::new(now);
        conn.add_request(request, now);
        assert!(conn.wants_connect());
        conn.on_connected(now);
        conn
    }

    fn body_of(events: Vec<HttpEvent>) -> Request {
        for event in events {
            if let HttpEvent::RequestComplete(request) = event {
                return request;
            }
        }
        panic!("request never completed");
    }

    #[test]
    fn content_length_response_completes() {
        let mut conn = start(get("/tables"));
        let _ = conn.take_output();
        let events = conn.on_data(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\n\r\nhello",
            Stamp::from_nanos(0),
        );
        let mut done = body_of(events);
        assert_eq!(done.response_code, 200);
        assert_eq!(done.read_response_all(), b"hello");
    }

    #[test]
    fn chunked_response_reassembles() {
        let mut conn = start(get("/data"));
        let _ = conn.take_output();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n";
        let events = conn.on_data(wire, Stamp::from_nanos(0));
        let mut done = body_of(events);
        assert_eq!(done.read_response_all(), b"hello world");
    }

    #[test]
    fn chunked_response_survives_byte_at_a_time_delivery() {
        let mut conn = start(get("/data"));
        let _ = conn.take_output();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabc\r\n0\r\n\r\n";
        let mut completed = None;
        for &byte in wire.iter() {
            for event in conn.on_data(&[byte], Stamp::from_nanos(0)) {
                if let HttpEvent::RequestComplete(request) = event {
                    completed = Some(request);
                }
            }
        }
        assert_eq!(completed.unwrap().read_response_all(), b"abc");
    }

    #[test]
    fn bad_chunk_length_fails_request() {
        let mut conn = start(get("/data"));
        let _ = conn.take_output();
        let wire = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n";
        let events = conn.on_data(wire, Stamp::from_nanos(0));
        assert!(events
            .iter()
            .any(|event| matches!(event, HttpEvent::RequestFailed(_, HttpFailure::BadChunkLength))));
        assert!(conn.is_closed());
    }

    #[test]
    fn read_until_close_body() {
        let mut conn = start(get("/stream"));
        let _ = conn.take_output();
        let _ = conn.on_data(
            b"HTTP/1.1 200 OK\r\nConnection: close\r\n\r\npartial",
            Stamp::from_nanos(0),
        );
        let events = conn.on_close(Stamp::from_nanos(0));
        let mut done = body_of(events);
        assert_eq!(done.read_response_all(), b"partial");
    }

    #[test]
    fn pipelined_requests_run_back_to_back() {
        let now = Stamp::from_nanos(0);
        let mut conn = HttpConnection::new(now);
        conn.add_request(get("/one"), now);
        conn.add_request(get("/two"), now);
        conn.on_connected(now);
        let first_wire = conn.take_output();
        assert!(String::from_utf8_lossy(&first_wire).contains("GET /one"));
        let events = conn.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", now);
        let _ = body_of(events);
        let second_wire = conn.take_output();
        assert!(String::from_utf8_lossy(&second_wire).contains("GET /two"));
    }

    #[test]
    fn response_timeout_fails_only_current_request() {
        let now = Stamp::from_nanos(0);
        let mut request = get("/slow");
        request.response_timeout_ms = 1_000;
        let mut conn = start(request);
        let _ = conn.take_output();
        assert!(conn.poll_timeout(now).is_none());
        let later = now + 2_000 * NSEC_PER_MSEC;
        match conn.poll_timeout(later) {
            Some(HttpEvent::RequestFailed(_, HttpFailure::Timeout)) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn upgrade_hands_over_the_stream() {
        let now = Stamp::from_nanos(0);
        let mut request = get("/ws");
        request.set_websocket_upgrade("cs-datalogger");
        let accept = request.expected_websock_accept().unwrap();
        let mut conn = HttpConnection::new(now);
        conn.add_request(request, now);
        conn.on_connected(now);
        let _ = conn.take_output();
        let header = format!(
            "HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nSec-WebSocket-Accept: {accept}\r\n\r\n"
        );
        let events = conn.on_data(header.as_bytes(), now);
        assert!(events.iter().any(|event| matches!(event, HttpEvent::Upgraded(_))));
        assert!(conn.is_upgraded());
        let events = conn.on_data(&[0x81, 0x01, b'x'], now);
        assert!(matches!(&events[0], HttpEvent::UpgradeData(bytes) if bytes == &vec![0x81, 0x01, b'x']));
    }

    #[test]
    fn upgrade_with_wrong_accept_is_refused() {
        let now = Stamp::from_nanos(0);
        let mut request = get("/ws");
        request.set_websocket_upgrade("cs-datalogger");
        let mut conn = HttpConnection::new(now);
        conn.add_request(request, now);
        conn.on_connected(now);
        let events = conn.on_data(
            b"HTTP/1.1 101 Switching Protocols\r\nSec-WebSocket-Accept: bogus\r\n\r\n",
            now,
        );
        assert!(events
            .iter()
            .any(|event| matches!(event, HttpEvent::RequestFailed(_, HttpFailure::UpgradeRefused))));
    }

    #[test]
    fn idle_connection_expires_after_wait_interval() {
        let now = Stamp::from_nanos(0);
        let mut conn = start(get("/one"));
        let _ = conn.take_output();
        let events = conn.on_data(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n", now);
        let _ = body_of(events);
        assert!(!conn.idle_expired(now));
        assert!(conn.idle_expired(now + 31_000 * NSEC_PER_MSEC));
    }
}

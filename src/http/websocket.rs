//! RFC 6455 websocket client framing and liveness.
//!
//! [`WsCodec`] is the sans-io frame machine: `before_frame -> read_len
//! -> read_mask -> read_payload` and back. [`WebSocket`] assembles
//! fragmented messages, answers pings, and pings an idle peer itself;
//! three unanswered pings close the socket with an unknown failure.

use crate::stamp::{Stamp, NSEC_PER_MSEC};
use thiserror::Error;
use tracing::{debug, trace, warn};

/// Message op-codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Continuation = 0,
    Text = 1,
    Binary = 2,
    Close = 8,
    Ping = 9,
    Pong = 10,
}

impl OpCode {
    #[must_use]
    pub fn from_bits(bits: u8) -> Option<Self> {
        match bits {
            0 => Some(Self::Continuation),
            1 => Some(Self::Text),
            2 => Some(Self::Binary),
            8 => Some(Self::Close),
            9 => Some(Self::Ping),
            10 => Some(Self::Pong),
            _ => None,
        }
    }
}

/// Default idle interval before the client pings the server.
pub const DEFAULT_PING_INTERVAL_MS: u32 = 60_000;
/// Unanswered pings tolerated before the socket is failed.
pub const MAX_UNANSWERED_PINGS: u32 = 3;

/// Why the websocket died.
#[derive(Debug, Error, PartialEq, Eq, Clone, Copy)]
pub enum WsFailure {
    #[error("the websocket connect or upgrade failed")]
    Connect,
    #[error("the server closed the websocket")]
    ServerClosed,
    #[error("the transport failed")]
    Unknown,
}

/// One decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WsFrame {
    pub op_code: OpCode,
    pub fin: bool,
    pub payload: Vec<u8>,
}

/// Frame-level decode failures; any of them poisons the stream.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WsError {
    #[error("reserved op code {0:x}")]
    BadOpCode(u8),
}

enum CodecState {
    BeforeFrame,
    /// Collecting the 2/8-byte extended length.
    ReadLen { needed: usize },
    ReadMask,
    ReadPayload,
}

/// Incremental frame decoder plus the client-side encoder.
pub struct WsCodec {
    state: CodecState,
    buffer: Vec<u8>,
    fin: bool,
    op_code: OpCode,
    masked: bool,
    mask: [u8; 4],
    payload_len: u64,
    payload: Vec<u8>,
}

impl WsCodec {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: CodecState::BeforeFrame,
            buffer: Vec::new(),
            fin: false,
            op_code: OpCode::Binary,
            masked: false,
            mask: [0; 4],
            payload_len: 0,
            payload: Vec::new(),
        }
    }

    /// Encodes a frame. Clients always mask.
    #[must_use]
    pub fn encode(op_code: OpCode, payload: &[u8], fin: bool, mask: bool) -> Vec<u8> {
        let mut wire = Vec::with_capacity(payload.len() + 14);
        let first = (u8::from(fin) << 7) | (op_code as u8);
        wire.push(first);
        let mask_bit = u8::from(mask) << 7;
        if payload.len() < 126 {
            wire.push(mask_bit | payload.len() as u8);
        } else if payload.len() <= 0xFFFF {
            wire.push(mask_bit | 126);
            wire.extend_from_slice(&(payload.len() as u16).to_be_bytes());
        } else {
            wire.push(mask_bit | 127);
            wire.extend_from_slice(&(payload.len() as u64).to_be_bytes());
        }
        if mask {
            let key: [u8; 4] = rand::random();
            wire.extend_from_slice(&key);
            wire.extend(
                payload
                    .iter()
                    .enumerate()
                    .map(|(index, byte)| byte ^ key[index % 4]),
            );
        } else {
            wire.extend_from_slice(payload);
        }
        wire
    }

    /// Feeds received bytes, producing completed frames.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<WsFrame>, WsError> {
        let mut frames = Vec::new();
        for &byte in bytes {
            match self.state {
                CodecState::BeforeFrame => {
                    self.buffer.push(byte);
                    if self.buffer.len() == 2 {
                        let first = self.buffer[0];
                        let second = self.buffer[1];
                        self.buffer.clear();
                        self.fin = first & 0x80 != 0;
                        self.op_code =
                            OpCode::from_bits(first & 0x0F).ok_or(WsError::BadOpCode(first & 0x0F))?;
                        self.masked = second & 0x80 != 0;
                        let len = u64::from(second & 0x7F);
                        match len {
                            126 => self.state = CodecState::ReadLen { needed: 2 },
                            127 => self.state = CodecState::ReadLen { needed: 8 },
                            _ => {
                                self.payload_len = len;
                                self.after_length();
                            }
                        }
                        if let Some(frame) = self.try_finish() {
                            frames.push(frame);
                        }
                    }
                }
                CodecState::ReadLen { needed } => {
                    self.buffer.push(byte);
                    if self.buffer.len() == needed {
                        self.payload_len = self
                            .buffer
                            .iter()
                            .fold(0u64, |acc, &digit| (acc << 8) | u64::from(digit));
                        self.buffer.clear();
                        self.after_length();
                        if let Some(frame) = self.try_finish() {
                            frames.push(frame);
                        }
                    }
                }
                CodecState::ReadMask => {
                    self.buffer.push(byte);
                    if self.buffer.len() == 4 {
                        self.mask.copy_from_slice(&self.buffer);
                        self.buffer.clear();
                        self.state = CodecState::ReadPayload;
                        if let Some(frame) = self.try_finish() {
                            frames.push(frame);
                        }
                    }
                }
                CodecState::ReadPayload => {
                    let index = self.payload.len();
                    let value = if self.masked {
                        byte ^ self.mask[index % 4]
                    } else {
                        byte
                    };
                    self.payload.push(value);
                    if let Some(frame) = self.try_finish() {
                        frames.push(frame);
                    }
                }
            }
        }
        Ok(frames)
    }

    fn after_length(&mut self) {
        self.state = if self.masked {
            CodecState::ReadMask
        } else {
            CodecState::ReadPayload
        };
    }

    fn try_finish(&mut self) -> Option<WsFrame> {
        let reading = matches!(self.state, CodecState::ReadPayload);
        if reading && self.payload.len() as u64 == self.payload_len {
            self.state = CodecState::BeforeFrame;
            Some(WsFrame {
                op_code: self.op_code,
                fin: self.fin,
                payload: std::mem::take(&mut self.payload),
            })
        } else {
            None
        }
    }
}

impl Default for WsCodec {
    fn default() -> Self {
        Self::new()
    }
}

/// What a [`WebSocket`] produces for its owner.
#[derive(Debug, PartialEq, Eq)]
pub enum WsEvent {
    /// A complete (defragmented) message.
    Message { op_code: OpCode, payload: Vec<u8> },
    /// The socket is done; no further events follow.
    Closed(WsFailure),
}

/// Client-side message layer over the frame codec: fragmentation
/// assembly, ping/pong liveness and orderly close.
pub struct WebSocket {
    codec: WsCodec,
    fragments: Vec<u8>,
    fragmented_op: Option<OpCode>,
    ping_interval_ms: u32,
    last_rx: Stamp,
    last_ping: Stamp,
    pings_outstanding: u32,
    /// Frames waiting to be written to the transport.
    output: Vec<u8>,
    closed: bool,
}

impl WebSocket {
    #[must_use]
    pub fn new(now: Stamp) -> Self {
        Self::with_ping_interval(now, DEFAULT_PING_INTERVAL_MS)
    }

    #[must_use]
    pub fn with_ping_interval(now: Stamp, ping_interval_ms: u32) -> Self {
        Self {
            codec: WsCodec::new(),
            fragments: Vec::new(),
            fragmented_op: None,
            ping_interval_ms,
            last_rx: now,
            last_ping: now,
            pings_outstanding: 0,
            output: Vec::new(),
            closed: false,
        }
    }

    /// Queues an outgoing message (client frames are always masked).
    pub fn send(&mut self, op_code: OpCode, payload: &[u8], fin: bool) {
        if !self.closed {
            self.output
                .extend_from_slice(&WsCodec::encode(op_code, payload, fin, true));
        }
    }

    /// Drains bytes to write to the transport.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.output)
    }

    /// True after a close frame or liveness failure.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Feeds received bytes, producing assembled messages.
    pub fn on_data(&mut self, bytes: &[u8], now: Stamp) -> Vec<WsEvent> {
        let mut events = Vec::new();
        self.last_rx = now;
        self.pings_outstanding = 0;
        let frames = match self.codec.feed(bytes) {
            Ok(frames) => frames,
            Err(error) => {
                warn!(%error, "websocket framing failed");
                self.closed = true;
                events.push(WsEvent::Closed(WsFailure::Unknown));
                return events;
            }
        };
        for frame in frames {
            match frame.op_code {
                OpCode::Ping => {
                    trace!("ping answered");
                    self.output
                        .extend_from_slice(&WsCodec::encode(OpCode::Pong, &frame.payload, true, true));
                }
                OpCode::Pong => {}
                OpCode::Close => {
                    debug!("server closed websocket");
                    self.closed = true;
                    events.push(WsEvent::Closed(WsFailure::ServerClosed));
                    return events;
                }
                OpCode::Continuation => {
                    self.fragments.extend_from_slice(&frame.payload);
                    if frame.fin {
                        if let Some(op_code) = self.fragmented_op.take() {
                            events.push(WsEvent::Message {
                                op_code,
                                payload: std::mem::take(&mut self.fragments),
                            });
                        }
                    }
                }
                op_code @ (OpCode::Text | OpCode::Binary) => {
                    if frame.fin {
                        events.push(WsEvent::Message {
                            op_code,
                            payload: frame.payload,
                        });
                    } else {
                        self.fragmented_op = Some(op_code);
                        self.fragments = frame.payload;
                    }
                }
            }
        }
        events
    }

    /// Liveness maintenance: pings an idle peer, and fails the socket
    /// after three unanswered pings.
    pub fn poll(&mut self, now: Stamp) -> Option<WsEvent> {
        if self.closed {
            return None;
        }
        let interval = i64::from(self.ping_interval_ms) * NSEC_PER_MSEC;
        if now - self.last_rx.max(self.last_ping) >= interval {
            if self.pings_outstanding >= MAX_UNANSWERED_PINGS {
                warn!("websocket peer stopped answering pings");
                self.closed = true;
                return Some(WsEvent::Closed(WsFailure::Unknown));
            }
            self.pings_outstanding += 1;
            self.last_ping = now;
            self.output
                .extend_from_slice(&WsCodec::encode(OpCode::Ping, b"", true, true));
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn unmasked_server_frame_decodes() {
        let wire = WsCodec::encode(OpCode::Text, b"hello", true, false);
        let mut codec = WsCodec::new();
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].payload, b"hello");
        assert_eq!(frames[0].op_code, OpCode::Text);
        assert!(frames[0].fin);
    }

    #[test]
    fn masked_frame_round_trips() {
        let wire = WsCodec::encode(OpCode::Binary, b"masked payload", true, true);
        let mut codec = WsCodec::new();
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames[0].payload, b"masked payload");
    }

    #[test]
    fn extended_16_bit_length() {
        let payload = vec![7u8; 300];
        let wire = WsCodec::encode(OpCode::Binary, &payload, true, false);
        assert_eq!(wire[1] & 0x7F, 126);
        let mut codec = WsCodec::new();
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames[0].payload.len(), 300);
    }

    #[test]
    fn extended_64_bit_length() {
        let payload = vec![7u8; 70_000];
        let wire = WsCodec::encode(OpCode::Binary, &payload, true, false);
        assert_eq!(wire[1] & 0x7F, 127);
        let mut codec = WsCodec::new();
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames[0].payload.len(), 70_000);
    }

    #[test]
    fn empty_frame_completes_immediately() {
        let wire = WsCodec::encode(OpCode::Ping, b"", true, false);
        let mut codec = WsCodec::new();
        let frames = codec.feed(&wire).unwrap();
        assert_eq!(frames.len(), 1);
        assert!(frames[0].payload.is_empty());
    }

    #[test]
    fn fragmented_message_reassembles() {
        let now = Stamp::from_nanos(0);
        let mut socket = WebSocket::new(now);
        let first = WsCodec::encode(OpCode::Text, b"hello ", false, false);
        let rest = WsCodec::encode(OpCode::Continuation, b"world", true, false);
        let mut events = socket.on_data(&first, now);
        events.extend(socket.on_data(&rest, now));
        assert_eq!(
            events,
            vec![WsEvent::Message {
                op_code: OpCode::Text,
                payload: b"hello world".to_vec()
            }]
        );
    }

    #[test]
    fn ping_is_answered_with_pong_payload() {
        let now = Stamp::from_nanos(0);
        let mut socket = WebSocket::new(now);
        let ping = WsCodec::encode(OpCode::Ping, b"token", true, false);
        let events = socket.on_data(&ping, now);
        assert!(events.is_empty());
        let pong_wire = socket.take_output();
        let mut codec = WsCodec::new();
        let frames = codec.feed(&pong_wire).unwrap();
        assert_eq!(frames[0].op_code, OpCode::Pong);
        assert_eq!(frames[0].payload, b"token");
    }

    #[test]
    fn close_frame_tears_down() {
        let now = Stamp::from_nanos(0);
        let mut socket = WebSocket::new(now);
        let close = WsCodec::encode(OpCode::Close, &[0x03, 0xe8], true, false);
        let events = socket.on_data(&close, now);
        assert_eq!(events, vec![WsEvent::Closed(WsFailure::ServerClosed)]);
        assert!(socket.is_closed());
    }

    #[test]
    fn three_unanswered_pings_fail_the_socket() {
        let start = Stamp::from_nanos(0);
        let mut socket = WebSocket::new(start);
        let interval = i64::from(DEFAULT_PING_INTERVAL_MS) * NSEC_PER_MSEC;
        let mut now = start;
        for _ in 0..MAX_UNANSWERED_PINGS {
            now = now + interval;
            assert!(socket.poll(now).is_none());
        }
        now = now + interval;
        assert_eq!(socket.poll(now), Some(WsEvent::Closed(WsFailure::Unknown)));
    }

    proptest! {
        #[test]
        fn masking_round_trips(payload in proptest::collection::vec(any::<u8>(), 0..2048)) {
            let wire = WsCodec::encode(OpCode::Binary, &payload, true, true);
            let mut codec = WsCodec::new();
            let frames = codec.feed(&wire).unwrap();
            prop_assert_eq!(frames.len(), 1);
            prop_assert_eq!(&frames[0].payload, &payload);
        }
    }
}

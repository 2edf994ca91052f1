//! Message frames and the length-prefixed wire codec.
//!
//! A message is a mutable frame with a client session number, a message
//! type, and a payload read through a positioned cursor. On the wire a
//! frame is a big-endian 32-bit length followed by the body (session,
//! type, payload). Bodies shorter than four bytes are heartbeats: they
//! prove liveness and are never routed.

use super::messages;
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Errors raised while reading structured fields out of a payload.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReadError {
    #[error("read past the end of the payload (wanted {wanted} bytes, {remaining} remain)")]
    Truncated { wanted: usize, remaining: usize },
    #[error("string field is not valid utf-8")]
    BadUtf8,
}

/// A mutable message frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    session_no: u32,
    msg_type: u32,
    payload: Vec<u8>,
    cursor: usize,
}

impl Message {
    /// Builds an empty message for a session and type.
    #[must_use]
    pub fn new(session_no: u32, msg_type: u32) -> Self {
        Self {
            session_no,
            msg_type,
            payload: Vec::new(),
            cursor: 0,
        }
    }

    /// The canonical heartbeat: session zero, heart-beat type, no
    /// payload.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(0, messages::TYPE_HEART_BEAT)
    }

    /// True when this frame is a heartbeat.
    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.msg_type == messages::TYPE_HEART_BEAT
    }

    /// The client session number.
    #[must_use]
    pub fn session_no(&self) -> u32 {
        self.session_no
    }

    /// Rewrites the session number; used when forwarding a frame onto a
    /// different session.
    pub fn set_session_no(&mut self, session_no: u32) {
        self.session_no = session_no;
    }

    /// The message type.
    #[must_use]
    pub fn msg_type(&self) -> u32 {
        self.msg_type
    }

    /// The payload bytes (excluding the fixed header words).
    #[must_use]
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Rewinds the read cursor to the start of the payload.
    pub fn reset(&mut self) {
        self.cursor = 0;
    }

    /// The full body: session, type, payload. This is the unit the
    /// proxy tunnel signs and encrypts.
    #[must_use]
    pub fn body(&self) -> Vec<u8> {
        let mut body = Vec::with_capacity(8 + self.payload.len());
        body.extend_from_slice(&self.session_no.to_be_bytes());
        body.extend_from_slice(&self.msg_type.to_be_bytes());
        body.extend_from_slice(&self.payload);
        body
    }

    /// Parses a body (session, type, payload) back into a message.
    /// Bodies shorter than four bytes decode as heartbeats; short
    /// header fields read as zero.
    #[must_use]
    pub fn from_body(body: &[u8]) -> Self {
        if body.len() < 4 {
            return Self::heartbeat();
        }
        let mut header = [0u8; 8];
        let take = body.len().min(8);
        header[..take].copy_from_slice(&body[..take]);
        let session_no = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let msg_type = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        Self {
            session_no,
            msg_type,
            payload: body.get(8..).unwrap_or(&[]).to_vec(),
            cursor: 0,
        }
    }

    /// Encodes the frame with its length prefix. Heartbeats use the
    /// compact two-byte body the protocol reserves for them.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        if self.is_heartbeat() && self.payload.is_empty() && self.session_no == 0 {
            return vec![0, 0, 0, 2, 0, messages::TYPE_HEART_BEAT as u8];
        }
        let body_len = 8 + self.payload.len();
        let mut wire = Vec::with_capacity(4 + body_len);
        wire.extend_from_slice(&(body_len as u32).to_be_bytes());
        wire.extend_from_slice(&self.session_no.to_be_bytes());
        wire.extend_from_slice(&self.msg_type.to_be_bytes());
        wire.extend_from_slice(&self.payload);
        wire
    }

    // --- writers ---------------------------------------------------

    pub fn add_u8(&mut self, value: u8) {
        self.payload.push(value);
    }

    pub fn add_bool(&mut self, value: bool) {
        self.payload.push(u8::from(value));
    }

    pub fn add_u16(&mut self, value: u16) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    pub fn add_i64(&mut self, value: i64) {
        self.payload.extend_from_slice(&value.to_be_bytes());
    }

    /// Raw bytes, no length prefix.
    pub fn add_bytes(&mut self, bytes: &[u8]) {
        self.payload.extend_from_slice(bytes);
    }

    /// Length-prefixed byte string.
    pub fn add_bstr(&mut self, bytes: &[u8]) {
        self.add_u32(bytes.len() as u32);
        self.payload.extend_from_slice(bytes);
    }

    /// Length-prefixed utf-8 string.
    pub fn add_str(&mut self, text: &str) {
        self.add_bstr(text.as_bytes());
    }

    // --- readers ---------------------------------------------------

    fn take(&mut self, wanted: usize) -> Result<&[u8], ReadError> {
        let remaining = self.payload.len() - self.cursor;
        if remaining < wanted {
            return Err(ReadError::Truncated { wanted, remaining });
        }
        let slice = &self.payload[self.cursor..self.cursor + wanted];
        self.cursor += wanted;
        Ok(slice)
    }

    pub fn read_u8(&mut self) -> Result<u8, ReadError> {
        Ok(self.take(1)?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool, ReadError> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16, ReadError> {
        let bytes = self.take(2)?;
        Ok(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_u32(&mut self) -> Result<u32, ReadError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_i64(&mut self) -> Result<i64, ReadError> {
        let bytes = self.take(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(i64::from_be_bytes(raw))
    }

    /// Reads a fixed-size block with no length prefix.
    pub fn read_bytes(&mut self, wanted: usize) -> Result<Vec<u8>, ReadError> {
        Ok(self.take(wanted)?.to_vec())
    }

    /// Reads a length-prefixed byte string.
    pub fn read_bstr(&mut self) -> Result<Vec<u8>, ReadError> {
        let len = self.read_u32()? as usize;
        self.read_bytes(len)
    }

    /// Reads a length-prefixed utf-8 string.
    pub fn read_str(&mut self) -> Result<String, ReadError> {
        let bytes = self.read_bstr()?;
        String::from_utf8(bytes).map_err(|_| ReadError::BadUtf8)
    }

    /// Bytes remaining past the cursor.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.payload.len() - self.cursor
    }
}

/// Default ceiling on an inbound frame body. A length past this closes
/// the connection with an unknown-failure classification.
pub const DEFAULT_MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

/// What the frame reader produced from a chunk of input.
#[derive(Debug, PartialEq, Eq)]
pub enum FrameEvent {
    /// A routable message.
    Message(Message),
    /// A heartbeat-length frame; proves liveness, never routed.
    HeartBeat,
}

/// A frame length the reader refuses to buffer.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("frame length {len} exceeds the {max} byte limit")]
pub struct OversizeFrame {
    pub len: u32,
    pub max: u32,
}

enum ReadState {
    /// Collecting the four-byte length prefix.
    BetweenMessages,
    /// Collecting `len` body bytes.
    Reading { len: usize },
}

/// Incremental decoder for the length-prefixed stream.
pub struct FrameReader {
    state: ReadState,
    buffer: BytesMut,
    max_len: u32,
}

impl FrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_len(DEFAULT_MAX_FRAME_LEN)
    }

    #[must_use]
    pub fn with_max_len(max_len: u32) -> Self {
        Self {
            state: ReadState::BetweenMessages,
            buffer: BytesMut::new(),
            max_len,
        }
    }

    /// Feeds received bytes and returns every completed frame. An
    /// oversize length poisons the reader; the connection must close.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<Vec<FrameEvent>, OversizeFrame> {
        self.buffer.put_slice(bytes);
        let mut events = Vec::new();
        loop {
            match self.state {
                ReadState::BetweenMessages => {
                    if self.buffer.len() < 4 {
                        break;
                    }
                    let len = self.buffer.get_u32();
                    if len > self.max_len {
                        return Err(OversizeFrame {
                            len,
                            max: self.max_len,
                        });
                    }
                    self.state = ReadState::Reading { len: len as usize };
                }
                ReadState::Reading { len } => {
                    if self.buffer.len() < len {
                        break;
                    }
                    let body = self.buffer.split_to(len);
                    self.state = ReadState::BetweenMessages;
                    // Any length under four proves liveness and nothing
                    // else; framing resumes with the next length word.
                    if len < 4 {
                        events.push(FrameEvent::HeartBeat);
                    } else {
                        events.push(FrameEvent::Message(Message::from_body(&body)));
                    }
                }
            }
        }
        Ok(events)
    }
}

impl Default for FrameReader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn encode_decode_round_trip() {
        let mut msg = Message::new(42, 100);
        msg.add_str("hello");
        msg.add_u32(7);
        let wire = msg.encode();
        let mut reader = FrameReader::new();
        let mut events = reader.feed(&wire).unwrap();
        assert_eq!(events.len(), 1);
        let FrameEvent::Message(mut decoded) = events.pop().unwrap() else {
            panic!("expected a message");
        };
        assert_eq!(decoded.session_no(), 42);
        assert_eq!(decoded.msg_type(), 100);
        assert_eq!(decoded.read_str().unwrap(), "hello");
        assert_eq!(decoded.read_u32().unwrap(), 7);
    }

    #[test]
    fn heartbeat_encodes_compact() {
        let wire = Message::heartbeat().encode();
        assert_eq!(wire, vec![0, 0, 0, 2, 0, 1]);
    }

    #[test]
    fn short_frames_are_heartbeats() {
        let mut reader = FrameReader::new();
        let events = reader.feed(&[0, 0, 0, 2, 0, 1]).unwrap();
        assert_eq!(events, vec![FrameEvent::HeartBeat]);
    }

    #[test]
    fn four_byte_bodies_are_messages_not_heartbeats() {
        // Only lengths under four are heartbeat-equivalent; a body of
        // four to seven bytes still routes, with the missing header
        // bytes read as zero.
        let mut reader = FrameReader::new();
        let events = reader.feed(&[0, 0, 0, 4, 0, 0, 0, 9]).unwrap();
        assert_eq!(events.len(), 1);
        match &events[0] {
            FrameEvent::Message(msg) => {
                assert_eq!(msg.session_no(), 9);
                assert_eq!(msg.msg_type(), 0);
                assert!(msg.payload().is_empty());
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn framing_resumes_after_heartbeat() {
        let mut reader = FrameReader::new();
        let mut wire = Message::heartbeat().encode();
        wire.extend_from_slice(&Message::new(9, 55).encode());
        let events = reader.feed(&wire).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], FrameEvent::HeartBeat);
        match &events[1] {
            FrameEvent::Message(msg) => {
                assert_eq!(msg.session_no(), 9);
                assert_eq!(msg.msg_type(), 55);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn oversize_length_is_rejected() {
        let mut reader = FrameReader::with_max_len(1024);
        let error = reader.feed(&[0x7f, 0xff, 0xff, 0xff]).unwrap_err();
        assert_eq!(error.len, 0x7fff_ffff);
    }

    #[test]
    fn split_delivery_reassembles() {
        let mut msg = Message::new(1, 2);
        msg.add_bytes(b"payload");
        let wire = msg.encode();
        let mut reader = FrameReader::new();
        for chunk in wire.chunks(3) {
            let events = reader.feed(chunk).unwrap();
            for event in events {
                match event {
                    FrameEvent::Message(decoded) => {
                        assert_eq!(decoded.payload(), b"payload");
                        return;
                    }
                    FrameEvent::HeartBeat => panic!("unexpected heartbeat"),
                }
            }
        }
        panic!("message never completed");
    }

    #[test]
    fn cursor_reads_fail_cleanly_past_end() {
        let mut msg = Message::new(1, 2);
        msg.add_u16(7);
        let mut decoded = Message::from_body(&msg.body());
        assert_eq!(decoded.read_u16().unwrap(), 7);
        assert_eq!(
            decoded.read_u32(),
            Err(ReadError::Truncated { wanted: 4, remaining: 0 })
        );
    }

    proptest! {
        #[test]
        fn any_message_round_trips(
            session in any::<u32>(),
            msg_type in 2u32..1_000_000,
            payload in proptest::collection::vec(any::<u8>(), 0..512),
        ) {
            let mut msg = Message::new(session, msg_type);
            msg.add_bytes(&payload);
            let mut reader = FrameReader::new();
            let events = reader.feed(&msg.encode()).unwrap();
            prop_assert_eq!(events.len(), 1);
            match &events[0] {
                FrameEvent::Message(decoded) => {
                    prop_assert_eq!(decoded.session_no(), session);
                    prop_assert_eq!(decoded.msg_type(), msg_type);
                    prop_assert_eq!(decoded.payload(), &payload[..]);
                }
                FrameEvent::HeartBeat => prop_assert!(false, "unexpected heartbeat"),
            }
        }
    }
}

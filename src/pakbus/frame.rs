//! Serial packet framing: sentinels, quoting and the signature
//! nullifier.
//!
//! Frames travel between `0xBD` sentinel bytes. Body bytes equal to a
//! sentinel or the quote byte are escaped (`BD -> BC DD`, `BC -> BC
//! DC`). The body is a four-byte link header carrying the two 10-bit
//! physical addresses, the 2-bit hop count and the 4-bit link state
//! (the expect-more and priority codes ride in the remaining bits),
//! then the high-level payload, then a two-byte nullifier chosen so
//! the running signature of the whole body is zero.

use super::{ExpectMore, LinkState, PakbusAddr, Priority};
use crate::sig::{sig, sig_nullifier};
use thiserror::Error;

/// Frame sentinel.
pub const SENTINEL: u8 = 0xBD;
/// Quote introducer.
pub const QUOTE: u8 = 0xBC;
/// Quoted form of the sentinel.
const QUOTED_SENTINEL: u8 = 0xDD;
/// Quoted form of the quote byte.
const QUOTED_QUOTE: u8 = 0xDC;

/// Largest body (header + payload + nullifier) a peer may send.
pub const MAX_BODY_LEN: usize = 1010;

/// Framing failures. A bad frame is dropped and the reader resets; the
/// port itself survives.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    #[error("frame signature did not verify")]
    BadSignature,
    #[error("frame is too short to carry a link header")]
    Runt,
    #[error("frame exceeds the {MAX_BODY_LEN} byte body limit")]
    Oversize,
    #[error("invalid quote sequence bc {0:02x}")]
    BadQuote(u8),
    #[error("link state nibble {0:x} is not defined")]
    BadLinkState(u8),
}

/// One link-layer packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialPacket {
    pub link_state: LinkState,
    pub dest: PakbusAddr,
    /// Repeater hop count; zero for frames this port originates.
    pub hops: u8,
    pub expect_more: ExpectMore,
    pub priority: Priority,
    pub source: PakbusAddr,
    /// High-level message bytes; empty for pure link-control packets.
    pub payload: Vec<u8>,
}

impl SerialPacket {
    /// Builds a link-control packet with no payload.
    #[must_use]
    pub fn control(link_state: LinkState, dest: PakbusAddr, source: PakbusAddr) -> Self {
        Self {
            link_state,
            dest,
            hops: 0,
            expect_more: ExpectMore::Last,
            priority: Priority::Normal,
            source,
            payload: Vec::new(),
        }
    }

    /// Packs the 32-bit link header: link state, destination, hop
    /// count, expect-more, priority, two spare bits (always zero) and
    /// the source.
    fn header(&self) -> [u8; 4] {
        let word = (u32::from(self.link_state as u8) << 28)
            | (u32::from(self.dest.value()) << 18)
            | (u32::from(self.hops & 0x3) << 16)
            | (u32::from(self.expect_more as u8) << 14)
            | (u32::from(self.priority as u8) << 12)
            | u32::from(self.source.value());
        word.to_be_bytes()
    }

    /// Serialises the packet as a complete wire frame: sentinel, quoted
    /// body with nullifier, sentinel.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut body = self.header().to_vec();
        body.extend_from_slice(&self.payload);
        let nullifier = sig_nullifier(sig(&body));
        body.extend_from_slice(&nullifier);

        let mut wire = Vec::with_capacity(body.len() + 8);
        wire.push(SENTINEL);
        for &byte in &body {
            match byte {
                SENTINEL => {
                    wire.push(QUOTE);
                    wire.push(QUOTED_SENTINEL);
                }
                QUOTE => {
                    wire.push(QUOTE);
                    wire.push(QUOTED_QUOTE);
                }
                other => wire.push(other),
            }
        }
        wire.push(SENTINEL);
        wire
    }

    /// Parses an unquoted body whose signature already verified.
    fn from_body(body: &[u8]) -> Result<Self, FrameError> {
        if body.len() < 6 {
            return Err(FrameError::Runt);
        }
        let word = u32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let state_bits = (word >> 28) as u8;
        let link_state =
            LinkState::from_nibble(state_bits).ok_or(FrameError::BadLinkState(state_bits))?;
        Ok(Self {
            link_state,
            dest: PakbusAddr::from_wire(((word >> 18) & 0x3FF) as u16),
            hops: ((word >> 16) & 0x3) as u8,
            expect_more: ExpectMore::from_bits(((word >> 14) & 0x3) as u8),
            priority: Priority::from_bits(((word >> 12) & 0x3) as u8),
            source: PakbusAddr::from_wire((word & 0x3FF) as u16),
            payload: body[4..body.len() - 2].to_vec(),
        })
    }
}

enum ReaderState {
    /// Waiting for a sentinel, or idling through sentinel padding.
    Between,
    /// Accumulating unquoted body bytes.
    InFrame,
    /// The last byte was the quote introducer.
    AfterEscape,
}

/// Incremental frame decoder over the quoted byte stream.
pub struct PakbusFrameReader {
    state: ReaderState,
    body: Vec<u8>,
}

impl PakbusFrameReader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: ReaderState::Between,
            body: Vec::new(),
        }
    }

    /// Feeds received bytes, producing decoded packets and per-frame
    /// errors in stream order.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<Result<SerialPacket, FrameError>> {
        let mut out = Vec::new();
        for &byte in bytes {
            match self.state {
                ReaderState::Between => {
                    if byte == SENTINEL {
                        self.state = ReaderState::InFrame;
                        self.body.clear();
                    }
                    // Anything before the first sentinel is line noise.
                }
                ReaderState::InFrame => match byte {
                    SENTINEL => {
                        if self.body.is_empty() {
                            // An all-sentinel run is legal idle padding.
                        } else {
                            out.push(self.finish_frame());
                            // The closing sentinel also opens the next
                            // frame.
                            self.body.clear();
                        }
                    }
                    QUOTE => self.state = ReaderState::AfterEscape,
                    other => {
                        self.body.push(other);
                        if self.body.len() > MAX_BODY_LEN {
                            out.push(Err(FrameError::Oversize));
                            self.reset();
                        }
                    }
                },
                ReaderState::AfterEscape => {
                    match byte {
                        QUOTED_SENTINEL => self.body.push(SENTINEL),
                        QUOTED_QUOTE => self.body.push(QUOTE),
                        other => {
                            out.push(Err(FrameError::BadQuote(other)));
                            self.reset();
                            continue;
                        }
                    }
                    self.state = ReaderState::InFrame;
                }
            }
        }
        out
    }

    /// Drops any partial frame and waits for the next sentinel.
    pub fn reset(&mut self) {
        self.state = ReaderState::Between;
        self.body.clear();
    }

    fn finish_frame(&mut self) -> Result<SerialPacket, FrameError> {
        let body = std::mem::take(&mut self.body);
        self.state = ReaderState::InFrame;
        if sig(&body) != 0 {
            return Err(FrameError::BadSignature);
        }
        SerialPacket::from_body(&body)
    }
}

impl Default for PakbusFrameReader {
    fn default() -> Self {
        Self::new()
    }
}

//! The serial-packet link layer spoken to BMP5 dataloggers.
//!
//! [`frame`] carries the quoted byte-stream codec; [`link`] holds the
//! per-peer state machine with ring/ready/finished handshakes, beacons
//! and half-duplex pacing.

pub mod frame;
pub mod link;

use nutype::nutype;

/// The broadcast physical address: all ten bits set.
pub const BROADCAST_ADDR: u16 = 0x3FF;

/// A physical address on the bus. Ten bits on the wire; the broadcast
/// value addresses every listener.
#[nutype(
    validate(less_or_equal = 1023),
    derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Display, TryFrom, Into)
)]
pub struct PakbusAddr(u16);

impl PakbusAddr {
    /// The broadcast address.
    #[must_use]
    pub fn broadcast() -> Self {
        Self::try_new(BROADCAST_ADDR).expect("broadcast address is valid")
    }

    /// Builds an address from a decoded header field. The ten-bit
    /// mask makes the value valid by construction.
    #[must_use]
    pub fn from_wire(bits: u16) -> Self {
        Self::try_new(bits & BROADCAST_ADDR).expect("masked to ten bits")
    }

    /// Raw wire value.
    #[must_use]
    pub fn value(self) -> u16 {
        self.into_inner()
    }
}

/// Link-state nibble carried in every serial packet header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    /// The sender considers the link down.
    OffLine = 0x8,
    /// The sender wants the link up.
    Ring = 0x9,
    /// The link is up and the packet may carry data.
    Ready = 0xA,
    /// The sender is done and wants to close the link.
    Finished = 0xB,
}

impl LinkState {
    /// Decodes the link-state nibble.
    #[must_use]
    pub fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            0x8 => Some(Self::OffLine),
            0x9 => Some(Self::Ring),
            0xA => Some(Self::Ready),
            0xB => Some(Self::Finished),
            _ => None,
        }
    }
}

/// Expect-more code: whether the sender has further frames queued for
/// the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ExpectMore {
    /// Final frame of the exchange.
    #[default]
    Last = 0,
    /// More frames follow from this sender.
    ExpectMore = 1,
    /// No session bookkeeping either way.
    Neutral = 2,
}

impl ExpectMore {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            1 => Self::ExpectMore,
            2 => Self::Neutral,
            _ => Self::Last,
        }
    }
}

/// Frame priority bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
#[repr(u8)]
pub enum Priority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    ExtraHigh = 3,
}

impl Priority {
    #[must_use]
    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => Self::Low,
            2 => Self::High,
            3 => Self::ExtraHigh,
            _ => Self::Normal,
        }
    }
}

//! Session-multiplexed messaging fabric.
//!
//! One transport carries many logical sessions. A [`router::Router`]
//! owns the transport and demultiplexes inbound frames to per-session
//! channels; a [`stub::Stub`] is its server-side counterpart. The
//! [`proxy`] module tunnels a whole transport through an encrypted
//! relay.

pub mod conn;
pub mod message;
pub mod proxy;
pub mod router;
pub mod stub;

/// Message type identifiers of the base protocol.
pub mod messages {
    /// Zero-payload liveness probe; never routed.
    pub const TYPE_HEART_BEAT: u32 = 1;
    /// Client-initiated session shutdown.
    pub const TYPE_SESSION_CLOSE_CMD: u32 = 2;
    /// Server-initiated session shutdown carrying a reason code.
    pub const TYPE_SESSION_CLOSED_NOT: u32 = 3;
    /// Rejection carrying a reason code and the offending message.
    pub const TYPE_MESSAGE_REJECTED_NOT: u32 = 4;
    /// Asks the peer stub for its name and version.
    pub const TYPE_QUERY_SERVER_CMD: u32 = 5;
    /// Name/version answer to a query command.
    pub const TYPE_QUERY_SERVER_ACK: u32 = 6;
}

/// Reason codes carried by a session-closed notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SessionClosedReason {
    /// The addressed object does not exist.
    NoObject = 1,
    /// The peer could not allocate resources for the session.
    NoResources = 2,
    /// The serving object was deleted or shut down.
    ShutDown = 3,
}

impl SessionClosedReason {
    /// Decodes a wire reason code.
    #[must_use]
    pub fn from_wire(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::NoObject),
            2 => Some(Self::NoResources),
            3 => Some(Self::ShutDown),
            _ => None,
        }
    }
}

/// Reason codes carried by a message-rejected notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MessageRejectedReason {
    Unsupported = 1,
    Malformed = 2,
    /// The session number addressed no route at the receiver.
    OrphanedSession = 3,
    Security = 4,
}

impl MessageRejectedReason {
    /// Decodes a wire reason code.
    #[must_use]
    pub fn from_wire(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Unsupported),
            2 => Some(Self::Malformed),
            3 => Some(Self::OrphanedSession),
            4 => Some(Self::Security),
            _ => None,
        }
    }
}

/// Why a session was reported broken to its node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionBrokenReason {
    /// Mirrors [`SessionClosedReason::NoObject`]; also used for orphans.
    NoObject,
    /// Mirrors [`SessionClosedReason::NoResources`].
    NoResources,
    /// Mirrors [`SessionClosedReason::ShutDown`].
    ShutDown,
    /// The transport failed or the peer disconnected.
    ConnectionFailed,
    /// The receive watchdog expired with no traffic from the peer.
    HeartBeatFailed,
}

impl From<SessionClosedReason> for SessionBrokenReason {
    fn from(reason: SessionClosedReason) -> Self {
        match reason {
            SessionClosedReason::NoObject => Self::NoObject,
            SessionClosedReason::NoResources => Self::NoResources,
            SessionClosedReason::ShutDown => Self::ShutDown,
        }
    }
}

/// How a connection came to be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClosedReason {
    /// The peer disconnected or the socket failed.
    RemoteDisconnect,
    /// The receive watchdog expired.
    HeartBeat,
    /// An unclassified failure, including oversize frames.
    UnknownFailure,
}

impl ClosedReason {
    /// The session-broken classification delivered to nodes when a
    /// connection closes for this reason.
    #[must_use]
    pub fn broken_reason(self) -> SessionBrokenReason {
        match self {
            Self::HeartBeat => SessionBrokenReason::HeartBeatFailed,
            Self::RemoteDisconnect | Self::UnknownFailure => SessionBrokenReason::ConnectionFailed,
        }
    }

    /// Human-readable detail matching the classification.
    #[must_use]
    pub fn describe(self) -> &'static str {
        match self {
            Self::RemoteDisconnect => "remote disconnect",
            Self::HeartBeat => "heart beat triggered",
            Self::UnknownFailure => "unrecognised failure",
        }
    }
}

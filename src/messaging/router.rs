//! The client-side session router.
//!
//! A router owns exactly one connection and demultiplexes inbound
//! frames to per-session channels. Session numbers are allocated
//! monotonically modulo the 32-bit space, skipping zero and any value
//! still in use. Once the connection closes, every session receives
//! exactly one broken notification and nothing further.

use super::conn::Conn;
use super::message::{FrameEvent, FrameReader, Message};
use super::{messages, ClosedReason, MessageRejectedReason, SessionBrokenReason, SessionClosedReason};
use std::collections::BTreeMap;
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

/// Events delivered to a session's node channel.
#[derive(Debug)]
pub enum SessionEvent {
    /// A message routed to this session, cursor rewound.
    Message(Message),
    /// The session is gone; no further events will follow.
    Broken {
        session_no: u32,
        reason: SessionBrokenReason,
        detail: String,
    },
}

/// Sending half of a session channel.
pub type SessionSender = mpsc::UnboundedSender<SessionEvent>;
/// Receiving half of a session channel.
pub type SessionReceiver = mpsc::UnboundedReceiver<SessionEvent>;

/// Builds the channel a node listens on for one or more sessions.
#[must_use]
pub fn session_channel() -> (SessionSender, SessionReceiver) {
    mpsc::unbounded_channel()
}

pub(crate) struct Route {
    pub(crate) node: SessionSender,
    pub(crate) will_close: bool,
}

/// Session demultiplexer over one connection.
pub struct Router {
    pub(crate) conn: Box<dyn Conn>,
    pub(crate) routes: BTreeMap<u32, Route>,
    last_session_no: u32,
    reader: FrameReader,
    closed: bool,
}

impl Router {
    /// Binds a router to its connection. The connection is attached
    /// when the first session opens.
    #[must_use]
    pub fn new(conn: Box<dyn Conn>) -> Self {
        Self {
            conn,
            routes: BTreeMap::new(),
            last_session_no: 0,
            reader: FrameReader::new(),
            closed: false,
        }
    }

    /// Opens a session delivering to `node`. Returns zero once the
    /// connection has closed.
    pub fn open_session(&mut self, node: &SessionSender) -> u32 {
        if self.closed {
            return 0;
        }
        let mut session_no = self.last_session_no.wrapping_add(1);
        loop {
            if session_no == 0 {
                session_no = 1;
            }
            if !self.routes.contains_key(&session_no) {
                break;
            }
            session_no = session_no.wrapping_add(1);
        }
        self.last_session_no = session_no;
        self.add_route(node.clone(), session_no);
        session_no
    }

    /// Registers a route for an externally chosen session number. The
    /// connection attaches when the first route appears.
    pub fn add_route(&mut self, node: SessionSender, session_no: u32) {
        if self.routes.is_empty() {
            self.conn.attach();
        }
        trace!(session_no, "route added");
        self.routes.insert(
            session_no,
            Route {
                node,
                will_close: false,
            },
        );
    }

    /// Closes a session: tells the peer (unless the peer already
    /// announced the close), drops the route, and detaches the
    /// connection when no routes remain.
    pub fn close_session(&mut self, session_no: u32) {
        let Some(route) = self.routes.remove(&session_no) else {
            return;
        };
        if !route.will_close {
            let close = Message::new(session_no, messages::TYPE_SESSION_CLOSE_CMD);
            self.conn.send(&close);
        }
        debug!(session_no, "session closed");
        if self.routes.is_empty() {
            self.conn.detach();
        }
    }

    /// True when the session number refers to an open route.
    #[must_use]
    pub fn is_valid_session(&self, session_no: u32) -> bool {
        self.routes.contains_key(&session_no)
    }

    /// Number of open sessions.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.routes.len()
    }

    /// Sends a message through the connection.
    pub fn send(&mut self, msg: &Message) {
        if !self.closed {
            self.conn.send(msg);
        }
    }

    /// Remote address of the underlying connection.
    #[must_use]
    pub fn remote_address(&self) -> String {
        self.conn.remote_address()
    }

    /// Feeds raw bytes received from the transport. Framing failures
    /// close the connection with an unknown-failure classification.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        match self.reader.feed(bytes) {
            Ok(events) => {
                for event in events {
                    match event {
                        FrameEvent::Message(msg) => self.dispatch(msg),
                        FrameEvent::HeartBeat => trace!("heartbeat received"),
                    }
                }
            }
            Err(error) => {
                warn!(%error, "framing failed; closing connection");
                self.on_conn_closed(ClosedReason::UnknownFailure);
            }
        }
    }

    /// Handles a fully framed inbound message.
    pub fn dispatch(&mut self, mut msg: Message) {
        if msg.is_heartbeat() {
            return;
        }
        let session_no = msg.session_no();
        let msg_type = msg.msg_type();
        if self.routes.contains_key(&session_no) {
            match msg_type {
                messages::TYPE_SESSION_CLOSE_CMD | messages::TYPE_SESSION_CLOSED_NOT => {
                    // The peer is tearing the session down; the reason
                    // code rides in a closed notification's payload.
                    let mut reason = SessionBrokenReason::ShutDown;
                    let mut detail = "";
                    if msg_type == messages::TYPE_SESSION_CLOSED_NOT {
                        if let Ok(code) = msg.read_u32() {
                            if let Some(closed) = SessionClosedReason::from_wire(code) {
                                reason = closed.into();
                                detail = match closed {
                                    SessionClosedReason::NoObject => {
                                        "specified object does not exist"
                                    }
                                    SessionClosedReason::NoResources => "insufficient resources",
                                    SessionClosedReason::ShutDown => {
                                        "the server object was deleted or shut down"
                                    }
                                };
                            }
                        }
                    }
                    self.break_session(session_no, reason, detail);
                }
                messages::TYPE_MESSAGE_REJECTED_NOT => {
                    let code = msg.read_u32().ok();
                    if code.and_then(MessageRejectedReason::from_wire)
                        == Some(MessageRejectedReason::OrphanedSession)
                    {
                        self.break_session(
                            session_no,
                            SessionBrokenReason::NoObject,
                            "orphaned session",
                        );
                    } else {
                        msg.reset();
                        self.deliver(session_no, msg);
                    }
                }
                _ => {
                    msg.reset();
                    self.deliver(session_no, msg);
                }
            }
        } else if msg_type != messages::TYPE_SESSION_CLOSE_CMD
            && msg_type != messages::TYPE_MESSAGE_REJECTED_NOT
        {
            // No route and not itself a close or reject: bounce the
            // whole frame back as an orphan rejection.
            let mut reject = Message::new(session_no, messages::TYPE_MESSAGE_REJECTED_NOT);
            reject.add_u32(MessageRejectedReason::OrphanedSession as u32);
            reject.add_bytes(&msg.body());
            self.conn.send(&reject);
            debug!(session_no, msg_type, "rejected orphaned message");
        }
    }

    /// Handles the connection closing underneath us. Every open session
    /// gets exactly one broken notification with the classification.
    pub fn on_conn_closed(&mut self, reason: ClosedReason) {
        if self.closed {
            return;
        }
        self.closed = true;
        let broken = reason.broken_reason();
        let detail = reason.describe();
        let routes = std::mem::take(&mut self.routes);
        for (session_no, route) in routes {
            let _ = route.node.send(SessionEvent::Broken {
                session_no,
                reason: broken,
                detail: detail.to_string(),
            });
        }
        debug!(?reason, "connection closed");
    }

    /// True once the connection has closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn deliver(&mut self, session_no: u32, msg: Message) {
        if let Some(route) = self.routes.get(&session_no) {
            if route.node.send(SessionEvent::Message(msg)).is_err() {
                // Node went away without closing; drop the route.
                self.routes.remove(&session_no);
                if self.routes.is_empty() {
                    self.conn.detach();
                }
            }
        }
    }

    fn break_session(&mut self, session_no: u32, reason: SessionBrokenReason, detail: &str) {
        if let Some(route) = self.routes.remove(&session_no) {
            let _ = route.node.send(SessionEvent::Broken {
                session_no,
                reason,
                detail: detail.to_string(),
            });
            if self.routes.is_empty() {
                self.conn.detach();
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    /// Connection double that records every frame it is asked to send.
    #[derive(Default, Clone)]
    pub(crate) struct MockConn {
        pub(crate) sent: Arc<Mutex<Vec<Message>>>,
        pub(crate) attached: Arc<Mutex<bool>>,
    }

    impl MockConn {
        pub(crate) fn sent_messages(&self) -> Vec<Message> {
            self.sent.lock().unwrap().clone()
        }
    }

    impl Conn for MockConn {
        fn attach(&mut self) {
            *self.attached.lock().unwrap() = true;
        }

        fn detach(&mut self) {
            *self.attached.lock().unwrap() = false;
        }

        fn send(&mut self, msg: &Message) {
            self.sent.lock().unwrap().push(msg.clone());
        }

        fn remote_address(&self) -> String {
            "mock".to_string()
        }
    }

    fn router_with_mock() -> (Router, MockConn) {
        let conn = MockConn::default();
        (Router::new(Box::new(conn.clone())), conn)
    }

    #[test]
    fn session_numbers_skip_zero_and_active() {
        let (mut router, _conn) = router_with_mock();
        let (tx, _rx) = session_channel();
        let first = router.open_session(&tx);
        let second = router.open_session(&tx);
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        router.close_session(first);
        let third = router.open_session(&tx);
        assert_eq!(third, 3);
    }

    #[test]
    fn first_session_attaches_connection() {
        let (mut router, conn) = router_with_mock();
        let (tx, _rx) = session_channel();
        assert!(!*conn.attached.lock().unwrap());
        router.open_session(&tx);
        assert!(*conn.attached.lock().unwrap());
    }

    #[test]
    fn close_session_sends_close_cmd_and_detaches() {
        let (mut router, conn) = router_with_mock();
        let (tx, _rx) = session_channel();
        let session_no = router.open_session(&tx);
        router.close_session(session_no);
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].msg_type(), messages::TYPE_SESSION_CLOSE_CMD);
        assert_eq!(sent[0].session_no(), session_no);
        assert!(!*conn.attached.lock().unwrap());
    }

    #[test]
    fn messages_route_to_the_owning_session() {
        let (mut router, _conn) = router_with_mock();
        let (tx, mut rx) = session_channel();
        let session_no = router.open_session(&tx);
        let mut msg = Message::new(session_no, 100);
        msg.add_str("hello");
        router.dispatch(msg);
        match rx.try_recv().unwrap() {
            SessionEvent::Message(mut delivered) => {
                assert_eq!(delivered.session_no(), session_no);
                assert_eq!(delivered.msg_type(), 100);
                assert_eq!(delivered.read_str().unwrap(), "hello");
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn orphaned_message_is_rejected_with_original_body() {
        let (mut router, conn) = router_with_mock();
        let mut msg = Message::new(99, 100);
        msg.add_str("hello");
        let original_body = msg.body();
        router.dispatch(msg);
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 1);
        let mut reject = sent[0].clone();
        assert_eq!(reject.msg_type(), messages::TYPE_MESSAGE_REJECTED_NOT);
        assert_eq!(reject.session_no(), 99);
        assert_eq!(reject.read_u32().unwrap(), MessageRejectedReason::OrphanedSession as u32);
        assert_eq!(reject.read_bytes(original_body.len()).unwrap(), original_body);
    }

    #[test]
    fn rejection_for_orphan_breaks_the_session() {
        let (mut router, _conn) = router_with_mock();
        let (tx, mut rx) = session_channel();
        let session_no = router.open_session(&tx);
        let mut reject = Message::new(session_no, messages::TYPE_MESSAGE_REJECTED_NOT);
        reject.add_u32(MessageRejectedReason::OrphanedSession as u32);
        router.dispatch(reject);
        match rx.try_recv().unwrap() {
            SessionEvent::Broken { reason, .. } => {
                assert_eq!(reason, SessionBrokenReason::NoObject);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(!router.is_valid_session(session_no));
    }

    #[test]
    fn conn_close_breaks_every_session_once() {
        let (mut router, _conn) = router_with_mock();
        let (tx, mut rx) = session_channel();
        let first = router.open_session(&tx);
        let second = router.open_session(&tx);
        router.on_conn_closed(ClosedReason::HeartBeat);
        let mut broken = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                SessionEvent::Broken {
                    session_no, reason, ..
                } => {
                    assert_eq!(reason, SessionBrokenReason::HeartBeatFailed);
                    broken.push(session_no);
                }
                other => panic!("unexpected event {other:?}"),
            }
        }
        broken.sort_unstable();
        assert_eq!(broken, vec![first, second]);
        // Nothing further is dispatched after the close.
        router.dispatch(Message::new(first, 100));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn session_closed_not_carries_reason() {
        let (mut router, _conn) = router_with_mock();
        let (tx, mut rx) = session_channel();
        let session_no = router.open_session(&tx);
        let mut closed = Message::new(session_no, messages::TYPE_SESSION_CLOSED_NOT);
        closed.add_u32(SessionClosedReason::ShutDown as u32);
        router.dispatch(closed);
        match rx.try_recv().unwrap() {
            SessionEvent::Broken { reason, .. } => {
                assert_eq!(reason, SessionBrokenReason::ShutDown);
            }
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn oversize_frame_closes_with_unknown_failure() {
        let (mut router, _conn) = router_with_mock();
        let (tx, mut rx) = session_channel();
        router.open_session(&tx);
        router.on_bytes(&[0xff, 0xff, 0xff, 0xff]);
        match rx.try_recv().unwrap() {
            SessionEvent::Broken { reason, .. } => {
                assert_eq!(reason, SessionBrokenReason::ConnectionFailed);
            }
            other => panic!("unexpected event {other:?}"),
        }
        assert!(router.is_closed());
    }
}

//! Server-side session acceptance.
//!
//! A stub is a router created per inbound connection and seeded with a
//! default server. The first message routed through any session adds a
//! route to that server and announces the session; the reserved
//! query-server command is answered synchronously with a name/version
//! ack instead of being dispatched.

use super::conn::Conn;
use super::message::{FrameEvent, FrameReader, Message};
use super::router::{Router, SessionSender};
use super::{messages, ClosedReason, SessionClosedReason};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events a stub reports to the hosting server object.
#[derive(Debug, PartialEq, Eq)]
pub enum ServerEvent {
    /// A new session carried its first message; routes to the default
    /// server are in place.
    SessionOpened(u32),
    /// The stub's connection closed and the stub is spent.
    ConnClosed(ClosedReason),
}

/// Sending half of a server event channel.
pub type ServerSender = mpsc::UnboundedSender<ServerEvent>;
/// Receiving half of a server event channel.
pub type ServerReceiver = mpsc::UnboundedReceiver<ServerEvent>;

/// Builds the channel a server listens on.
#[must_use]
pub fn server_channel() -> (ServerSender, ServerReceiver) {
    mpsc::unbounded_channel()
}

/// Server-side counterpart of a router.
pub struct Stub {
    router: Router,
    reader: FrameReader,
    default_server: Option<SessionSender>,
    server_events: ServerSender,
    server_name: String,
    release_version: String,
}

impl Stub {
    /// Builds a stub over a fresh inbound connection. Messages for new
    /// sessions route to `default_server`; lifecycle notices arrive on
    /// `server_events`.
    #[must_use]
    pub fn new(
        conn: Box<dyn Conn>,
        default_server: SessionSender,
        server_events: ServerSender,
        server_name: &str,
        release_version: &str,
    ) -> Self {
        Self {
            router: Router::new(conn),
            reader: FrameReader::new(),
            default_server: Some(default_server),
            server_events,
            server_name: server_name.to_string(),
            release_version: release_version.to_string(),
        }
    }

    /// Feeds raw bytes from the transport.
    pub fn on_bytes(&mut self, bytes: &[u8]) {
        match self.reader.feed(bytes) {
            Ok(events) => {
                for event in events {
                    if let FrameEvent::Message(msg) = event {
                        self.dispatch(msg);
                    }
                }
            }
            Err(error) => {
                warn!(%error, "stub framing failed");
                self.on_conn_closed(ClosedReason::UnknownFailure);
            }
        }
    }

    /// Routes one inbound message, seeding the default server on the
    /// first message through.
    pub fn dispatch(&mut self, msg: Message) {
        if msg.is_heartbeat() {
            return;
        }
        let session_no = msg.session_no();
        if let Some(server) = self.default_server.take() {
            self.router.add_route(server, session_no);
            debug!(session_no, "session opened");
            let _ = self.server_events.send(ServerEvent::SessionOpened(session_no));
        }
        if msg.msg_type() == messages::TYPE_QUERY_SERVER_CMD {
            let mut ack = Message::new(session_no, messages::TYPE_QUERY_SERVER_ACK);
            ack.add_str(&self.server_name);
            ack.add_str(&self.release_version);
            self.router.send(&ack);
        } else {
            self.router.dispatch(msg);
        }
    }

    /// Adds a route so a further session reaches a specific server
    /// object, announcing it the way the first session was announced.
    pub fn finish_session(&mut self, session_no: u32, node: SessionSender) {
        self.router.add_route(node, session_no);
        let _ = self.server_events.send(ServerEvent::SessionOpened(session_no));
    }

    /// Closes a session from the server side, telling the peer why.
    pub fn close_session(&mut self, session_no: u32, reason: SessionClosedReason) {
        if !self.router.is_valid_session(session_no) {
            return;
        }
        let mut closed = Message::new(session_no, messages::TYPE_SESSION_CLOSED_NOT);
        closed.add_u32(reason as u32);
        self.router.send(&closed);
        // The router's close path would send a close command; the route
        // is removed directly instead since the peer has been told.
        self.router.routes.remove(&session_no);
        if self.router.routes.is_empty() {
            self.router.conn.detach();
        }
        debug!(session_no, ?reason, "stub session closed");
    }

    /// Sends a message to the peer.
    pub fn send(&mut self, msg: &Message) {
        self.router.send(msg);
    }

    /// Number of live sessions. The owner disposes the stub when this
    /// reaches zero after a close.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.router.session_count()
    }

    /// Handles the connection closing; the stub is spent afterwards.
    pub fn on_conn_closed(&mut self, reason: ClosedReason) {
        self.router.on_conn_closed(reason);
        let _ = self.server_events.send(ServerEvent::ConnClosed(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::router::tests::MockConn;
    use crate::messaging::router::{session_channel, SessionEvent};

    fn stub_with_mock() -> (Stub, MockConn, crate::messaging::router::SessionReceiver, ServerReceiver) {
        let conn = MockConn::default();
        let (node_tx, node_rx) = session_channel();
        let (server_tx, server_rx) = server_channel();
        let stub = Stub::new(Box::new(conn.clone()), node_tx, server_tx, "test server", "1.0");
        (stub, conn, node_rx, server_rx)
    }

    #[test]
    fn first_message_opens_session_and_routes() {
        let (mut stub, _conn, mut node_rx, mut server_rx) = stub_with_mock();
        let mut msg = Message::new(42, 100);
        msg.add_str("hello");
        stub.dispatch(msg);
        assert_eq!(server_rx.try_recv().unwrap(), ServerEvent::SessionOpened(42));
        match node_rx.try_recv().unwrap() {
            SessionEvent::Message(mut delivered) => {
                assert_eq!(delivered.session_no(), 42);
                assert_eq!(delivered.read_str().unwrap(), "hello");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn query_server_is_answered_inline() {
        let (mut stub, conn, mut node_rx, _server_rx) = stub_with_mock();
        stub.dispatch(Message::new(7, messages::TYPE_QUERY_SERVER_CMD));
        let sent = conn.sent_messages();
        assert_eq!(sent.len(), 1);
        let mut ack = sent[0].clone();
        assert_eq!(ack.msg_type(), messages::TYPE_QUERY_SERVER_ACK);
        assert_eq!(ack.read_str().unwrap(), "test server");
        assert_eq!(ack.read_str().unwrap(), "1.0");
        // The query is not forwarded to the server node.
        assert!(node_rx.try_recv().is_err());
    }

    #[test]
    fn close_session_sends_reasoned_notification() {
        let (mut stub, conn, _node_rx, _server_rx) = stub_with_mock();
        stub.dispatch(Message::new(9, 100));
        stub.close_session(9, SessionClosedReason::ShutDown);
        let sent = conn.sent_messages();
        let mut closed = sent.last().unwrap().clone();
        assert_eq!(closed.msg_type(), messages::TYPE_SESSION_CLOSED_NOT);
        assert_eq!(closed.read_u32().unwrap(), SessionClosedReason::ShutDown as u32);
        assert_eq!(stub.session_count(), 0);
    }
}

//! End-to-end session behaviour between a client router and a server
//! stub over the in-process transport.

use fieldlink::messaging::conn::{ConnEvent, LocalConn};
use fieldlink::messaging::message::Message;
use fieldlink::messaging::router::{session_channel, Router, SessionEvent};
use fieldlink::messaging::stub::{server_channel, ServerEvent, Stub};
use fieldlink::messaging::{messages, SessionBrokenReason};

/// Wires a router to a stub, pumping frames between them on demand.
struct Pair {
    router: Router,
    stub: Stub,
    router_events: fieldlink::messaging::conn::ConnEventReceiver,
    stub_events: fieldlink::messaging::conn::ConnEventReceiver,
}

impl Pair {
    fn new(
        server_node: fieldlink::messaging::router::SessionSender,
        server_events: fieldlink::messaging::stub::ServerSender,
    ) -> Self {
        let ((client_conn, router_events), (server_conn, stub_events)) = LocalConn::pair();
        Self {
            router: Router::new(Box::new(client_conn)),
            stub: Stub::new(
                Box::new(server_conn),
                server_node,
                server_events,
                "test server",
                "9.9",
            ),
            router_events,
            stub_events,
        }
    }

    /// Ferries queued bytes both ways until the channels drain.
    fn pump(&mut self) {
        loop {
            let mut moved = false;
            while let Ok(event) = self.stub_events.try_recv() {
                moved = true;
                match event {
                    ConnEvent::Bytes(bytes) => self.stub.on_bytes(&bytes),
                    ConnEvent::Closed(reason) => self.stub.on_conn_closed(reason),
                }
            }
            while let Ok(event) = self.router_events.try_recv() {
                moved = true;
                match event {
                    ConnEvent::Bytes(bytes) => self.router.on_bytes(&bytes),
                    ConnEvent::Closed(reason) => self.router.on_conn_closed(reason),
                }
            }
            if !moved {
                break;
            }
        }
    }
}

#[tokio::test]
async fn session_opens_carries_data_and_closes() {
    let (server_node, mut server_rx) = session_channel();
    let (server_events, mut opened_rx) = server_channel();
    let mut pair = Pair::new(server_node, server_events);

    let (client_node, _client_rx) = session_channel();
    let session_no = pair.router.open_session(&client_node);
    assert_ne!(session_no, 0);

    let mut hello = Message::new(session_no, 100);
    hello.add_bytes(b"hello");
    pair.router.send(&hello);
    pair.pump();

    // The server sees exactly one opened session and one message.
    assert_eq!(
        opened_rx.try_recv().unwrap(),
        ServerEvent::SessionOpened(session_no)
    );
    match server_rx.try_recv().unwrap() {
        SessionEvent::Message(msg) => {
            assert_eq!(msg.session_no(), session_no);
            assert_eq!(msg.msg_type(), 100);
            assert_eq!(msg.payload(), b"hello");
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(server_rx.try_recv().is_err(), "exactly one message expected");

    // Closing tells the server exactly once, classified as shut down.
    pair.router.close_session(session_no);
    pair.pump();
    match server_rx.try_recv().unwrap() {
        SessionEvent::Broken {
            session_no: broken, reason, ..
        } => {
            assert_eq!(broken, session_no);
            assert_eq!(reason, SessionBrokenReason::ShutDown);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(server_rx.try_recv().is_err());
}

#[tokio::test]
async fn orphaned_session_is_rejected_and_broken() {
    let (server_node, _server_rx) = session_channel();
    let (server_events, _opened_rx) = server_channel();
    let mut pair = Pair::new(server_node, server_events);

    // Open two sessions; the server only learns about the first, so
    // it will reject traffic on a number it never routed.
    let (client_node, mut client_rx) = session_channel();
    let first = pair.router.open_session(&client_node);
    let mut opener = Message::new(first, 100);
    opener.add_bytes(b"hi");
    pair.router.send(&opener);
    pair.pump();

    let second = pair.router.open_session(&client_node);
    let mut stray = Message::new(second, 100);
    stray.add_bytes(b"stray");
    pair.router.send(&stray);
    pair.pump();

    // The client node sees the second session broken as no-object.
    match client_rx.try_recv().unwrap() {
        SessionEvent::Broken {
            session_no, reason, ..
        } => {
            assert_eq!(session_no, second);
            assert_eq!(reason, SessionBrokenReason::NoObject);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(pair.router.is_valid_session(first));
    assert!(!pair.router.is_valid_session(second));
}

#[tokio::test]
async fn query_server_answers_name_and_version() {
    let (server_node, _server_rx) = session_channel();
    let (server_events, _opened_rx) = server_channel();
    let mut pair = Pair::new(server_node, server_events);

    let (client_node, mut client_rx) = session_channel();
    let session_no = pair.router.open_session(&client_node);
    pair.router
        .send(&Message::new(session_no, messages::TYPE_QUERY_SERVER_CMD));
    pair.pump();

    match client_rx.try_recv().unwrap() {
        SessionEvent::Message(mut ack) => {
            assert_eq!(ack.msg_type(), messages::TYPE_QUERY_SERVER_ACK);
            assert_eq!(ack.read_str().unwrap(), "test server");
            assert_eq!(ack.read_str().unwrap(), "9.9");
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn transport_loss_breaks_every_session_once() {
    let (server_node, _server_rx) = session_channel();
    let (server_events, _opened_rx) = server_channel();
    let mut pair = Pair::new(server_node, server_events);

    let (client_node, mut client_rx) = session_channel();
    let first = pair.router.open_session(&client_node);
    let second = pair.router.open_session(&client_node);
    pair.router
        .on_conn_closed(fieldlink::messaging::ClosedReason::RemoteDisconnect);

    let mut broken = Vec::new();
    while let Ok(event) = client_rx.try_recv() {
        if let SessionEvent::Broken {
            session_no, reason, ..
        } = event
        {
            assert_eq!(reason, SessionBrokenReason::ConnectionFailed);
            broken.push(session_no);
        }
    }
    broken.sort_unstable();
    assert_eq!(broken, vec![first, second]);
}

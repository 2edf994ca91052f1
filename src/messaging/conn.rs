//! Connection transports for the messaging fabric.
//!
//! A [`Conn`] moves encoded frames between a router and its peer. Every
//! connection carries a transmit watch-dog: sixty seconds of transmit
//! silence emits a heartbeat, and sixty seconds of receive silence
//! closes the connection with the heart-beat classification. Resetting
//! the watch-dog is the only side effect of a successful write.

use super::message::Message;
use super::ClosedReason;
use crate::bytelog::ByteLog;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Transmit/receive watch-dog period.
pub const WATCHDOG_PERIOD: Duration = Duration::from_secs(60);

/// Events a transport reports to whoever drives the router.
#[derive(Debug)]
pub enum ConnEvent {
    /// Raw bytes received from the peer.
    Bytes(Vec<u8>),
    /// The transport closed, with a classification.
    Closed(ClosedReason),
}

/// Sending half of a transport event channel.
pub type ConnEventSender = mpsc::UnboundedSender<ConnEvent>;
/// Receiving half of a transport event channel.
pub type ConnEventReceiver = mpsc::UnboundedReceiver<ConnEvent>;

/// A transport the router can own.
pub trait Conn: Send {
    /// Called when the router's first route appears.
    fn attach(&mut self);
    /// Called when the router's last route goes away.
    fn detach(&mut self);
    /// Queues an encoded frame for the peer.
    fn send(&mut self, msg: &Message);
    /// Peer address for diagnostics; empty when unknown.
    fn remote_address(&self) -> String {
        String::new()
    }
}

/// TCP client transport.
///
/// The socket is opened lazily on [`Conn::attach`] and an I/O task owns
/// it from then on. The task services three concerns: writes queued by
/// [`Conn::send`], the transmit watch-dog, and the receive watch-dog.
pub struct TcpConn {
    address: String,
    events: ConnEventSender,
    outgoing: Option<mpsc::UnboundedSender<Vec<u8>>>,
    log: Option<Arc<Mutex<ByteLog>>>,
}

impl TcpConn {
    /// Creates the transport and the event stream its owner drives the
    /// router from.
    #[must_use]
    pub fn new(address: &str) -> (Self, ConnEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                address: address.to_string(),
                events,
                outgoing: None,
                log: None,
            },
            rx,
        )
    }

    /// Injects a byte log that will observe both directions of I/O.
    pub fn set_log(&mut self, log: Arc<Mutex<ByteLog>>) {
        self.log = Some(log);
    }
}

impl Conn for TcpConn {
    fn attach(&mut self) {
        if self.outgoing.is_some() {
            return;
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);
        tokio::spawn(run_tcp(
            self.address.clone(),
            self.events.clone(),
            out_rx,
            self.log.clone(),
        ));
    }

    fn detach(&mut self) {
        // Dropping the sender ends the I/O task's write loop.
        self.outgoing = None;
    }

    fn send(&mut self, msg: &Message) {
        if let Some(outgoing) = &self.outgoing {
            if outgoing.send(msg.encode()).is_err() {
                warn!("send on closed tcp transport dropped");
            }
        } else {
            warn!("send on detached tcp transport dropped");
        }
    }

    fn remote_address(&self) -> String {
        self.address.clone()
    }
}

async fn run_tcp(
    address: String,
    events: ConnEventSender,
    mut outgoing: mpsc::UnboundedReceiver<Vec<u8>>,
    log: Option<Arc<Mutex<ByteLog>>>,
) {
    let mut stream = match TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(%error, address, "tcp connect failed");
            let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
            return;
        }
    };
    debug!(address, "tcp transport connected");
    let mut read_buf = vec![0u8; 8192];
    let mut last_tx = Instant::now();
    let mut last_rx = Instant::now();
    loop {
        let tx_deadline = last_tx + WATCHDOG_PERIOD;
        let rx_deadline = last_rx + WATCHDOG_PERIOD;
        tokio::select! {
            queued = outgoing.recv() => {
                let Some(bytes) = queued else {
                    // Detached: orderly local close, nothing to report.
                    let _ = stream.shutdown().await;
                    return;
                };
                if let Some(log) = &log {
                    log.lock().expect("byte log poisoned").wr(&bytes, false);
                }
                if let Err(error) = stream.write_all(&bytes).await {
                    warn!(%error, "tcp write failed");
                    let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                    return;
                }
                last_tx = Instant::now();
            }
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) => {
                        let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                        return;
                    }
                    Ok(count) => {
                        if let Some(log) = &log {
                            log.lock().expect("byte log poisoned").wr(&read_buf[..count], true);
                        }
                        last_rx = Instant::now();
                        if events.send(ConnEvent::Bytes(read_buf[..count].to_vec())).is_err() {
                            return;
                        }
                    }
                    Err(error) => {
                        warn!(%error, "tcp read failed");
                        let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                        return;
                    }
                }
            }
            () = tokio::time::sleep_until(tx_deadline) => {
                trace!("transmit watch-dog fired; sending heartbeat");
                let heartbeat = Message::heartbeat().encode();
                if let Some(log) = &log {
                    log.lock().expect("byte log poisoned").wr(&heartbeat, false);
                }
                if stream.write_all(&heartbeat).await.is_err() {
                    let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                    return;
                }
                last_tx = Instant::now();
            }
            () = tokio::time::sleep_until(rx_deadline) => {
                warn!("receive watch-dog expired; closing connection");
                let _ = events.send(ConnEvent::Closed(ClosedReason::HeartBeat));
                return;
            }
        }
    }
}

/// In-process transport pair.
///
/// The two halves exchange encoded frames directly; what one half
/// sends arrives as [`ConnEvent::Bytes`] on the other's event stream.
/// This fills the role of the in-process server link on platforms where
/// the server lives inside the hosting application.
pub struct LocalConn {
    peer: ConnEventSender,
    attached: bool,
}

impl LocalConn {
    /// Builds a connected pair and their event streams.
    #[must_use]
    pub fn pair() -> ((Self, ConnEventReceiver), (Self, ConnEventReceiver)) {
        let (a_events, a_rx) = mpsc::unbounded_channel();
        let (b_events, b_rx) = mpsc::unbounded_channel();
        (
            (
                Self {
                    peer: b_events,
                    attached: false,
                },
                a_rx,
            ),
            (
                Self {
                    peer: a_events,
                    attached: false,
                },
                b_rx,
            ),
        )
    }
}

impl Conn for LocalConn {
    fn attach(&mut self) {
        self.attached = true;
    }

    fn detach(&mut self) {
        if self.attached {
            self.attached = false;
            let _ = self.peer.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
        }
    }

    fn send(&mut self, msg: &Message) {
        if self.peer.send(ConnEvent::Bytes(msg.encode())).is_err() {
            warn!("peer half of local transport is gone");
        }
    }

    fn remote_address(&self) -> String {
        "local".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messaging::message::{FrameEvent, FrameReader};

    #[test]
    fn local_pair_delivers_frames() {
        let ((mut a, _a_rx), (mut b, mut b_rx)) = LocalConn::pair();
        a.attach();
        b.attach();
        let mut msg = Message::new(3, 200);
        msg.add_str("ping");
        a.send(&msg);
        let ConnEvent::Bytes(bytes) = b_rx.try_recv().unwrap() else {
            panic!("expected bytes");
        };
        let mut reader = FrameReader::new();
        let events = reader.feed(&bytes).unwrap();
        match &events[0] {
            FrameEvent::Message(decoded) => assert_eq!(decoded.session_no(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn local_detach_closes_peer() {
        let ((mut a, _a_rx), (_b, mut b_rx)) = LocalConn::pair();
        a.attach();
        a.detach();
        match b_rx.try_recv().unwrap() {
            ConnEvent::Closed(reason) => assert_eq!(reason, ClosedReason::RemoteDisconnect),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn tcp_transport_heartbeats_on_idle() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let accept = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 64];
            let mut collected = Vec::new();
            // Collect the first heartbeat frame.
            while collected.len() < 6 {
                let count = peer.read(&mut buf).await.unwrap();
                if count == 0 {
                    break;
                }
                collected.extend_from_slice(&buf[..count]);
            }
            collected
        });
        let (mut conn, _events) = TcpConn::new(&address);
        conn.attach();
        let collected = accept.await.unwrap();
        assert_eq!(&collected[..6], &[0, 0, 0, 2, 0, 1]);
    }
}

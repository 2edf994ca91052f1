//! The encrypted relay tunnel.
//!
//! A proxy relay lets a client and a server that can both reach the
//! relay speak as if directly connected. Either end logs on with an
//! MD5 challenge/response, then user messages travel inside
//! `virtual_conn_forward_cmd` frames: AES-128-CBC over the zero-padded
//! plaintext with the key derived from the shared password and the IV
//! derived from the forward header, plus a 16-bit plaintext signature
//! the receiver checks before routing.

use super::conn::{Conn, ConnEvent, ConnEventReceiver, ConnEventSender, TcpConn};
use super::message::Message;
use super::router::{session_channel, Router, SessionEvent};
use super::ClosedReason;
use crate::sig::sig;
use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use md5::{Digest, Md5};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Message identifiers of the relay protocol.
pub mod messages {
    pub const SERVER_LOGON_CMD: u32 = 2000;
    pub const SERVER_LOGON_CHALLENGE: u32 = 2001;
    pub const SERVER_LOGON_RESPONSE: u32 = 2002;
    pub const SERVER_LOGON_ACK: u32 = 2003;
    pub const CLIENT_LOGON_CMD: u32 = 2004;
    pub const CLIENT_LOGON_CHALLENGE: u32 = 2005;
    pub const CLIENT_LOGON_RESPONSE: u32 = 2006;
    pub const CLIENT_LOGON_ACK: u32 = 2007;
    pub const VIRTUAL_CONN_NOT: u32 = 2008;
    pub const VIRTUAL_CONN_CLOSE_CMD: u32 = 2009;
    pub const VIRTUAL_CONN_FORWARD_CMD: u32 = 2010;
    pub const SERVER_REGISTER_CMD: u32 = 2011;
    pub const SERVER_REGISTER_ACK: u32 = 2012;
}

/// Outcome codes shared by the logon transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LogonOutcome {
    Success = 1,
    InvalidProxy = 2,
    AlreadyRegistered = 3,
    ChallengeTimeOut = 4,
    InvalidResponse = 5,
}

impl LogonOutcome {
    #[must_use]
    pub fn from_wire(code: u32) -> Option<Self> {
        match code {
            1 => Some(Self::Success),
            2 => Some(Self::InvalidProxy),
            3 => Some(Self::AlreadyRegistered),
            4 => Some(Self::ChallengeTimeOut),
            5 => Some(Self::InvalidResponse),
            _ => None,
        }
    }
}

/// Default relay port when the address does not name one.
pub const DEFAULT_PROXY_PORT: u16 = 6788;

/// Tunnel failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProxyError {
    #[error("forward command carried an unsupported cipher code {0}")]
    UnsupportedCipher(u32),
    #[error("forward command plaintext signature mismatch")]
    BadSignature,
    #[error("malformed relay message")]
    BadFormat,
    #[error("relay logon failed with outcome {0:?}")]
    LogonFailed(Option<LogonOutcome>),
}

fn md5_of(parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// The per-password seal/open codec for forwarded messages.
#[derive(Clone)]
pub struct Tunnel {
    key: [u8; 16],
    password: Vec<u8>,
}

impl Tunnel {
    /// Derives the AES key from the shared password.
    #[must_use]
    pub fn new(password: &str) -> Self {
        Self {
            key: md5_of(&[password.as_bytes()]),
            password: password.as_bytes().to_vec(),
        }
    }

    /// Digest answering a logon challenge: md5 over client token,
    /// server token, then the password.
    #[must_use]
    pub fn challenge_digest(&self, client_token: &[u8; 4], server_token: &[u8; 4]) -> [u8; 16] {
        md5_of(&[client_token, server_token, &self.password])
    }

    /// Wraps a user message in a forward command for the relay.
    #[must_use]
    pub fn seal(&self, proxy_session: u32, virtual_conn_id: u32, msg: &Message) -> Message {
        let plain = msg.body();
        let plain_sig = sig(&plain);
        let mut forward = Message::new(proxy_session, messages::VIRTUAL_CONN_FORWARD_CMD);
        forward.add_u32(virtual_conn_id);
        forward.add_u32(1); // AES-128 cipher
        forward.add_u32(plain.len() as u32);
        forward.add_u16(plain_sig);
        // The IV is the digest of the fourteen header bytes just
        // written, binding the ciphertext to this forward command.
        let iv = md5_of(&[forward.payload()]);
        let mut padded = plain;
        while padded.len() % 16 != 0 {
            padded.push(0);
        }
        let ciphertext = Aes128CbcEnc::new(&self.key.into(), &iv.into())
            .encrypt_padded_vec_mut::<NoPadding>(&padded);
        forward.add_bstr(&ciphertext);
        forward
    }

    /// Unwraps a forward command. Returns the original message, or
    /// `None` when the plaintext was a heartbeat.
    pub fn open(&self, forward: &mut Message) -> Result<(u32, Option<Message>), ProxyError> {
        forward.reset();
        let header = forward.payload().get(..14).map(<[u8]>::to_vec);
        let conn_id = forward.read_u32().map_err(|_| ProxyError::BadFormat)?;
        let cipher = forward.read_u32().map_err(|_| ProxyError::BadFormat)?;
        let orig_len = forward.read_u32().map_err(|_| ProxyError::BadFormat)? as usize;
        let orig_sig = forward.read_u16().map_err(|_| ProxyError::BadFormat)?;
        let ciphertext = forward.read_bstr().map_err(|_| ProxyError::BadFormat)?;
        if cipher != 1 {
            return Err(ProxyError::UnsupportedCipher(cipher));
        }
        let header = header.ok_or(ProxyError::BadFormat)?;
        if ciphertext.is_empty() || ciphertext.len() % 16 != 0 || orig_len > ciphertext.len() {
            return Err(ProxyError::BadFormat);
        }
        let iv = md5_of(&[&header]);
        let mut buffer = ciphertext;
        let plain = Aes128CbcDec::new(&self.key.into(), &iv.into())
            .decrypt_padded_mut::<NoPadding>(&mut buffer)
            .map_err(|_| ProxyError::BadFormat)?;
        if sig(&plain[..orig_len]) != orig_sig {
            return Err(ProxyError::BadSignature);
        }
        let msg = Message::from_body(&plain[..orig_len]);
        if msg.is_heartbeat() {
            Ok((conn_id, None))
        } else {
            Ok((conn_id, Some(msg)))
        }
    }
}

/// Splits `host[:port]`, defaulting to the relay port.
fn split_proxy_address(address: &str) -> String {
    if address.contains(':') {
        address.to_string()
    } else {
        format!("{address}:{DEFAULT_PROXY_PORT}")
    }
}

/// Client-side proxy connection: a [`Conn`] whose peer is reached
/// through the relay.
pub struct ProxyConn {
    address: String,
    account: String,
    tunnel: Tunnel,
    events: ConnEventSender,
    outgoing: Option<mpsc::UnboundedSender<Message>>,
}

impl ProxyConn {
    /// Creates the proxy connection and the event stream the owning
    /// router is driven from.
    #[must_use]
    pub fn new(address: &str, account: &str, password: &str) -> (Self, ConnEventReceiver) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                address: split_proxy_address(address),
                account: account.to_string(),
                tunnel: Tunnel::new(password),
                events,
                outgoing: None,
            },
            rx,
        )
    }
}

impl Conn for ProxyConn {
    fn attach(&mut self) {
        if self.outgoing.is_some() {
            return;
        }
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);
        tokio::spawn(run_proxy_client(
            self.address.clone(),
            self.account.clone(),
            self.tunnel.clone(),
            self.events.clone(),
            out_rx,
        ));
    }

    fn detach(&mut self) {
        self.outgoing = None;
    }

    fn send(&mut self, msg: &Message) {
        if let Some(outgoing) = &self.outgoing {
            let _ = outgoing.send(msg.clone());
        } else {
            warn!("send on detached proxy connection dropped");
        }
    }

    fn remote_address(&self) -> String {
        self.address.clone()
    }
}

async fn run_proxy_client(
    address: String,
    account: String,
    tunnel: Tunnel,
    events: ConnEventSender,
    mut out_rx: mpsc::UnboundedReceiver<Message>,
) {
    let (tcp, mut relay_events) = TcpConn::new(&address);
    let mut relay = Router::new(Box::new(tcp));
    let (sess_tx, mut sess_rx) = session_channel();
    let auth_session = relay.open_session(&sess_tx);
    let proxy_session = relay.open_session(&sess_tx);
    let mut virtual_conn_id = 0u32;
    let mut queue: Vec<Message> = Vec::new();

    let mut logon = Message::new(auth_session, messages::CLIENT_LOGON_CMD);
    logon.add_u32(1); // single auth transaction
    logon.add_str(&account);
    logon.add_u32(proxy_session);
    relay.send(&logon);

    loop {
        tokio::select! {
            relay_event = relay_events.recv() => {
                match relay_event {
                    Some(ConnEvent::Bytes(bytes)) => relay.on_bytes(&bytes),
                    Some(ConnEvent::Closed(reason)) => {
                        relay.on_conn_closed(reason);
                    }
                    None => {
                        let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                        return;
                    }
                }
            }
            session_event = sess_rx.recv() => {
                let Some(session_event) = session_event else { return };
                match session_event {
                    SessionEvent::Message(mut msg) => match msg.msg_type() {
                        messages::CLIENT_LOGON_CHALLENGE => {
                            match answer_challenge(&tunnel, &mut msg, messages::CLIENT_LOGON_RESPONSE) {
                                Ok(response) => relay.send(&response),
                                Err(error) => {
                                    warn!(%error, "bad logon challenge");
                                    let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                                    return;
                                }
                            }
                        }
                        messages::CLIENT_LOGON_ACK => {
                            let outcome = read_ack_outcome(&mut msg);
                            if outcome == Some(LogonOutcome::Success) {
                                virtual_conn_id = msg.read_u32().unwrap_or(0);
                                relay.close_session(auth_session);
                                debug!(virtual_conn_id, "proxy tunnel established");
                                for queued in queue.drain(..) {
                                    let sealed = tunnel.seal(proxy_session, virtual_conn_id, &queued);
                                    relay.send(&sealed);
                                }
                            } else {
                                warn!(?outcome, "proxy logon failed");
                                let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                                return;
                            }
                        }
                        messages::VIRTUAL_CONN_FORWARD_CMD => {
                            match tunnel.open(&mut msg) {
                                Ok((_, Some(inner))) => {
                                    let _ = events.send(ConnEvent::Bytes(inner.encode()));
                                }
                                Ok((_, None)) => {}
                                Err(error) => {
                                    warn!(%error, "dropping proxy tunnel");
                                    let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                                    return;
                                }
                            }
                        }
                        _ => {}
                    },
                    SessionEvent::Broken { session_no, .. } => {
                        if session_no == proxy_session {
                            let _ = events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                            return;
                        }
                    }
                }
            }
            queued = out_rx.recv() => {
                let Some(msg) = queued else {
                    relay.close_session(proxy_session);
                    return;
                };
                if virtual_conn_id != 0 {
                    let sealed = tunnel.seal(proxy_session, virtual_conn_id, &msg);
                    relay.send(&sealed);
                } else {
                    queue.push(msg);
                }
            }
        }
    }
}

fn answer_challenge(
    tunnel: &Tunnel,
    challenge: &mut Message,
    response_type: u32,
) -> Result<Message, ProxyError> {
    let tran_no = challenge.read_u32().map_err(|_| ProxyError::BadFormat)?;
    let token_bytes = challenge.read_bytes(4).map_err(|_| ProxyError::BadFormat)?;
    let _server_digest = challenge.read_bstr().map_err(|_| ProxyError::BadFormat)?;
    let mut server_token = [0u8; 4];
    server_token.copy_from_slice(&token_bytes);
    let client_token: [u8; 4] = rand::random();
    let mut response = Message::new(challenge.session_no(), response_type);
    response.add_u32(tran_no);
    response.add_bytes(&client_token);
    response.add_bstr(&tunnel.challenge_digest(&client_token, &server_token));
    Ok(response)
}

fn read_ack_outcome(ack: &mut Message) -> Option<LogonOutcome> {
    let _tran_no = ack.read_u32().ok()?;
    LogonOutcome::from_wire(ack.read_u32().ok()?)
}

/// A virtual connection announced by the relay to a listening server.
pub struct VirtualConn {
    conn_id: u32,
    remote_address: String,
    outgoing: mpsc::UnboundedSender<(u32, Message)>,
}

impl Conn for VirtualConn {
    fn attach(&mut self) {}

    fn detach(&mut self) {}

    fn send(&mut self, msg: &Message) {
        let _ = self.outgoing.send((self.conn_id, msg.clone()));
    }

    fn remote_address(&self) -> String {
        self.remote_address.clone()
    }
}

/// A virtual connection handed to the application by the listener.
pub struct AcceptedConn {
    pub conn_id: u32,
    pub remote_address: String,
    pub conn: VirtualConn,
    pub events: ConnEventReceiver,
}

/// Receiving half of the listener's accept stream.
pub type AcceptReceiver = mpsc::UnboundedReceiver<AcceptedConn>;

/// Registers a server behind the relay and demultiplexes virtual
/// connections into [`AcceptedConn`]s, one per relay notification.
pub struct ProxyListener;

impl ProxyListener {
    /// Starts the listener task. Accepted connections arrive on the
    /// returned stream; the stream closing means the relay is gone.
    #[must_use]
    pub fn listen(address: &str, account: &str, password: &str) -> AcceptReceiver {
        let (accept_tx, accept_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_listener(
            split_proxy_address(address),
            account.to_string(),
            Tunnel::new(password),
            password.to_string(),
            accept_tx,
        ));
        accept_rx
    }
}

async fn run_listener(
    address: String,
    account: String,
    tunnel: Tunnel,
    password: String,
    accept_tx: mpsc::UnboundedSender<AcceptedConn>,
) {
    let (tcp, mut relay_events) = TcpConn::new(&address);
    let mut relay = Router::new(Box::new(tcp));
    let (sess_tx, mut sess_rx) = session_channel();
    let auth_session = relay.open_session(&sess_tx);
    let proxy_session = relay.open_session(&sess_tx);
    let (vc_out_tx, mut vc_out_rx) = mpsc::unbounded_channel::<(u32, Message)>();
    let mut conns: HashMap<u32, ConnEventSender> = HashMap::new();
    let mut tran_no = 1u32;

    let mut logon = Message::new(auth_session, messages::SERVER_LOGON_CMD);
    logon.add_u32(tran_no);
    logon.add_str(&account);
    logon.add_u32(proxy_session);
    relay.send(&logon);

    loop {
        tokio::select! {
            relay_event = relay_events.recv() => {
                match relay_event {
                    Some(ConnEvent::Bytes(bytes)) => relay.on_bytes(&bytes),
                    Some(ConnEvent::Closed(reason)) => relay.on_conn_closed(reason),
                    None => break,
                }
            }
            session_event = sess_rx.recv() => {
                let Some(session_event) = session_event else { break };
                match session_event {
                    SessionEvent::Message(mut msg) => match msg.msg_type() {
                        messages::SERVER_LOGON_CHALLENGE => {
                            match answer_challenge(&tunnel, &mut msg, messages::SERVER_LOGON_RESPONSE) {
                                Ok(mut response) => {
                                    response.set_session_no(proxy_session);
                                    relay.send(&response);
                                }
                                Err(error) => {
                                    warn!(%error, "bad server logon challenge");
                                    break;
                                }
                            }
                        }
                        messages::SERVER_LOGON_ACK => {
                            match read_ack_outcome(&mut msg) {
                                Some(LogonOutcome::Success) => {
                                    debug!("registered with the proxy");
                                }
                                Some(LogonOutcome::InvalidProxy) => {
                                    // No such account yet; ask the relay
                                    // to create it, then log on again.
                                    tran_no += 1;
                                    let mut register = Message::new(auth_session, messages::SERVER_REGISTER_CMD);
                                    register.add_u32(tran_no);
                                    register.add_str(&account);
                                    register.add_str(&password);
                                    relay.send(&register);
                                }
                                outcome => {
                                    warn!(?outcome, "server logon failed");
                                    break;
                                }
                            }
                        }
                        messages::SERVER_REGISTER_ACK => {
                            let outcome = {
                                let _tran = msg.read_u32();
                                msg.read_u32().ok()
                            };
                            if outcome == Some(1) {
                                tran_no += 1;
                                let mut logon = Message::new(auth_session, messages::SERVER_LOGON_CMD);
                                logon.add_u32(tran_no);
                                logon.add_str(&account);
                                logon.add_u32(proxy_session);
                                relay.send(&logon);
                            } else {
                                warn!(?outcome, "server registration failed");
                                break;
                            }
                        }
                        messages::VIRTUAL_CONN_NOT => {
                            let conn_id = msg.read_u32().unwrap_or(0);
                            let remote_address = msg.read_str().unwrap_or_default();
                            if conn_id != 0 {
                                let (conn_events, conn_events_rx) = mpsc::unbounded_channel();
                                conns.insert(conn_id, conn_events);
                                debug!(conn_id, remote_address, "virtual connection accepted");
                                let accepted = AcceptedConn {
                                    conn_id,
                                    remote_address: remote_address.clone(),
                                    conn: VirtualConn {
                                        conn_id,
                                        remote_address,
                                        outgoing: vc_out_tx.clone(),
                                    },
                                    events: conn_events_rx,
                                };
                                if accept_tx.send(accepted).is_err() {
                                    break;
                                }
                            }
                        }
                        messages::VIRTUAL_CONN_FORWARD_CMD => {
                            match tunnel.open(&mut msg) {
                                Ok((conn_id, Some(inner))) => {
                                    if let Some(conn_events) = conns.get(&conn_id) {
                                        let _ = conn_events.send(ConnEvent::Bytes(inner.encode()));
                                    }
                                }
                                Ok((_, None)) => {}
                                Err(error) => warn!(%error, "bad forward command dropped"),
                            }
                        }
                        messages::VIRTUAL_CONN_CLOSE_CMD => {
                            if let Ok(conn_id) = msg.read_u32() {
                                if let Some(conn_events) = conns.remove(&conn_id) {
                                    let _ = conn_events.send(
                                        ConnEvent::Closed(ClosedReason::RemoteDisconnect));
                                }
                            }
                        }
                        _ => {}
                    },
                    SessionEvent::Broken { session_no, .. } => {
                        if session_no == proxy_session {
                            break;
                        }
                    }
                }
            }
            outgoing = vc_out_rx.recv() => {
                let Some((conn_id, msg)) = outgoing else { break };
                let sealed = tunnel.seal(proxy_session, conn_id, &msg);
                relay.send(&sealed);
            }
        }
    }
    for (_, conn_events) in conns {
        let _ = conn_events.send(ConnEvent::Closed(ClosedReason::RemoteDisconnect));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seal_open_round_trip() {
        let tunnel = Tunnel::new("swordfish");
        let mut msg = Message::new(12, 345);
        msg.add_str("records follow");
        let mut sealed = tunnel.seal(2, 77, &msg);
        assert_eq!(sealed.msg_type(), messages::VIRTUAL_CONN_FORWARD_CMD);
        let (conn_id, opened) = tunnel.open(&mut sealed).unwrap();
        assert_eq!(conn_id, 77);
        let mut opened = opened.unwrap();
        assert_eq!(opened.session_no(), 12);
        assert_eq!(opened.msg_type(), 345);
        assert_eq!(opened.read_str().unwrap(), "records follow");
    }

    #[test]
    fn wrong_password_fails_signature() {
        let sender = Tunnel::new("right");
        let receiver = Tunnel::new("wrong");
        let mut msg = Message::new(1, 100);
        msg.add_str("secret");
        let mut sealed = sender.seal(2, 5, &msg);
        assert_eq!(receiver.open(&mut sealed).unwrap_err(), ProxyError::BadSignature);
    }

    #[test]
    fn heartbeats_are_suppressed() {
        let tunnel = Tunnel::new("pw");
        let mut sealed = tunnel.seal(2, 5, &Message::heartbeat());
        let (_, opened) = tunnel.open(&mut sealed).unwrap();
        assert!(opened.is_none());
    }

    #[test]
    fn unsupported_cipher_is_rejected() {
        let tunnel = Tunnel::new("pw");
        let mut forward = Message::new(2, messages::VIRTUAL_CONN_FORWARD_CMD);
        forward.add_u32(5);
        forward.add_u32(2); // unknown cipher
        forward.add_u32(0);
        forward.add_u16(0);
        forward.add_bstr(&[0u8; 16]);
        assert_eq!(tunnel.open(&mut forward).unwrap_err(), ProxyError::UnsupportedCipher(2));
    }

    #[test]
    fn ciphertext_is_block_aligned() {
        let tunnel = Tunnel::new("pw");
        for payload_len in 0..40 {
            let mut msg = Message::new(1, 100);
            msg.add_bytes(&vec![0x5a; payload_len]);
            let mut sealed = tunnel.seal(2, 9, &msg);
            sealed.reset();
            let _ = sealed.read_bytes(14).unwrap();
            let ciphertext = sealed.read_bstr().unwrap();
            assert_eq!(ciphertext.len() % 16, 0, "payload_len {payload_len}");
        }
    }

    #[test]
    fn challenge_digest_matches_manual_md5() {
        let tunnel = Tunnel::new("pw");
        let digest = tunnel.challenge_digest(&[1, 2, 3, 4], &[5, 6, 7, 8]);
        let expected = md5_of(&[&[1, 2, 3, 4], &[5, 6, 7, 8], b"pw"]);
        assert_eq!(digest, expected);
    }
}

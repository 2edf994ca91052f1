//! The BMP5 source: a datalogger reached directly over the PakBus
//! serial packet link.
//!
//! The source drives a serial packet port over TCP, rings its
//! neighbour, and runs BMP5 transactions on top: clock read/set and
//! get-values polling for data requests. Values collected this way are
//! four-byte floats, which is what the get-values transaction returns
//! for numeric fields.

use super::record::{Record, RecordDesc, Value, ValueDesc, ValueType};
use super::request::{RequestHandle, SinkFailure};
use super::settings::SourceSettings;
use super::sink::{DisconnectReason, OpId, Outcome};
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::pakbus::frame::SerialPacket;
use crate::pakbus::link::{OutMessage, PortConfig, PortRouter, SerialPacketPort};
use crate::pakbus::{PakbusAddr, Priority};
use crate::stamp::{Stamp, NSEC_PER_SEC};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// High-level protocol codes carried above the link header.
const PROTO_BMP5: u8 = 1;

/// BMP5 message types this source speaks.
mod msg_types {
    /// Clock read/set command and its response.
    pub const CLOCK_CMD: u8 = 0x17;
    pub const CLOCK_RSP: u8 = 0x97;
    /// Get-values command and its response.
    pub const GET_VALUES_CMD: u8 = 0x1A;
    pub const GET_VALUES_RSP: u8 = 0x9A;
}

/// A BMP5 message riding in a serial packet payload: a four-byte
/// high-level header, then the message type, transaction number and
/// body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Bmp5Message {
    pub protocol: u8,
    pub dst_node: u16,
    pub src_node: u16,
    pub msg_type: u8,
    pub tran_no: u8,
    pub body: Vec<u8>,
}

impl Bmp5Message {
    fn encode(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(6 + self.body.len());
        payload.push((self.protocol << 4) | ((self.dst_node >> 8) as u8 & 0x0F));
        payload.push((self.dst_node & 0xFF) as u8);
        payload.push(((self.src_node >> 8) as u8) & 0x0F);
        payload.push((self.src_node & 0xFF) as u8);
        payload.push(self.msg_type);
        payload.push(self.tran_no);
        payload.extend_from_slice(&self.body);
        payload
    }

    fn decode(payload: &[u8]) -> Option<Self> {
        if payload.len() < 6 {
            return None;
        }
        Some(Self {
            protocol: payload[0] >> 4,
            dst_node: (u16::from(payload[0] & 0x0F) << 8) | u16::from(payload[1]),
            src_node: (u16::from(payload[2] & 0x0F) << 8) | u16::from(payload[3]),
            msg_type: payload[4],
            tran_no: payload[5],
            body: payload[6..].to_vec(),
        })
    }
}

/// Port router bridge: hands queued BMP5 messages to the link layer
/// and forwards received packets to the session task.
struct Bridge {
    outgoing: VecDeque<OutMessage>,
    received: mpsc::UnboundedSender<SerialPacket>,
    offline: mpsc::UnboundedSender<PakbusAddr>,
}

impl PortRouter for Bridge {
    fn next_out_message(&mut self, dest: PakbusAddr) -> Option<OutMessage> {
        if self.outgoing.front().is_some_and(|msg| msg.dest == dest) {
            self.outgoing.pop_front()
        } else {
            None
        }
    }

    fn on_packet_received(&mut self, packet: &SerialPacket) {
        let _ = self.received.send(packet.clone());
    }

    fn on_link_offline(&mut self, dest: PakbusAddr) {
        let _ = self.offline.send(dest);
    }
}

enum Command {
    Activate(Vec<RequestHandle>),
    Remove(RequestHandle),
    ClockCheck { op: OpId, should_set: bool },
    Disconnect,
}

/// Direct PakBus datalogger source.
pub struct Bmp5Source {
    name: String,
    events: SourceEventSender,
    settings: SourceSettings,
    connected: bool,
    queued: Vec<RequestHandle>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl Bmp5Source {
    #[must_use]
    pub fn new(name: &str, events: SourceEventSender, settings: SourceSettings) -> Self {
        Self {
            name: name.to_string(),
            events,
            settings,
            connected: false,
            queued: Vec::new(),
            commands: None,
        }
    }
}

impl DataSource for Bmp5Source {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        let (Some(address), Some(logger_addr)) = (
            self.settings.address(),
            self.settings
                .pakbus_address
                .and_then(|addr| PakbusAddr::try_new(addr).ok()),
        ) else {
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::BadProperties,
            });
            return;
        };
        let my_address = self
            .settings
            .neighbour_address
            .and_then(|addr| PakbusAddr::try_new(addr).ok())
            .unwrap_or_else(|| PakbusAddr::from_wire(0x3FE));
        let security_code = self.settings.security_code.unwrap_or(0);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(command_tx);
        self.connected = true;
        let _ = self.events.send(SourceEvent::Connecting {
            source: self.name.clone(),
        });
        let poll_interval = self.settings.poll_schedule_interval.unwrap_or(10_000);
        tokio::spawn(run_port(
            self.name.clone(),
            address,
            my_address,
            logger_addr,
            security_code,
            u64::from(poll_interval.max(250)),
            self.events.clone(),
            command_rx,
        ));
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            if let Some(commands) = self.commands.take() {
                let _ = commands.send(Command::Disconnect);
            }
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn add_request(&mut self, request: RequestHandle) {
        self.queued.push(request);
    }

    fn activate_requests(&mut self) {
        let batch = std::mem::take(&mut self.queued);
        if batch.is_empty() {
            return;
        }
        match &self.commands {
            Some(commands) => {
                let _ = commands.send(Command::Activate(batch));
            }
            None => {
                for request in batch {
                    let _ = self.events.send(SourceEvent::RequestFailed {
                        request,
                        failure: SinkFailure::ConnectionFailed,
                    });
                }
            }
        }
    }

    fn remove_request(&mut self, request: &RequestHandle) {
        self.queued.retain(|held| !Arc::ptr_eq(held, request));
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Remove(request.clone()));
        }
    }

    fn start_clock_check(&mut self, op: OpId, _uri: &SourceUri, should_set: bool) -> bool {
        match &self.commands {
            Some(commands) => commands.send(Command::ClockCheck { op, should_set }).is_ok(),
            None => false,
        }
    }

    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        // The reduced transaction set cannot enumerate tables; expose
        // the one station the settings name.
        let symbols = if uri.is_source_only() {
            vec![SymbolSeed::branch("logger", SymbolType::Station)]
        } else {
            Vec::new()
        };
        let _ = self.events.send(SourceEvent::Symbols {
            source: self.name.clone(),
            parent: uri.as_str().to_string(),
            symbols,
        });
        true
    }
}

struct PendingTran {
    kind: TranKind,
}

enum TranKind {
    Clock { op: OpId },
    GetValues { requests: Vec<RequestHandle>, column: String, table: String },
}

#[allow(clippy::too_many_arguments)]
async fn run_port(
    name: String,
    address: String,
    my_address: PakbusAddr,
    logger_addr: PakbusAddr,
    security_code: u16,
    poll_interval_ms: u64,
    events: SourceEventSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let mut stream = match tokio::net::TcpStream::connect(&address).await {
        Ok(stream) => stream,
        Err(error) => {
            warn!(name, %error, "pakbus transport connect failed");
            let _ = events.send(SourceEvent::Disconnected {
                source: name,
                reason: DisconnectReason::ConnectionFailed,
            });
            return;
        }
    };
    let (rx_packets_tx, mut rx_packets) = mpsc::unbounded_channel();
    let (offline_tx, mut offline_rx) = mpsc::unbounded_channel();
    let bridge = Bridge {
        outgoing: VecDeque::new(),
        received: rx_packets_tx,
        offline: offline_tx,
    };
    let mut port = SerialPacketPort::new(bridge, PortConfig::new(my_address), Stamp::now());
    let mut read_buf = vec![0u8; 4096];
    let mut trans: HashMap<u8, PendingTran> = HashMap::new();
    let mut last_tran = 0u8;
    let mut active: Vec<(Vec<RequestHandle>, String, String)> = Vec::new();
    let mut announced = false;
    let mut maintenance = tokio::time::interval(tokio::time::Duration::from_millis(100));
    let mut poller = tokio::time::interval(tokio::time::Duration::from_millis(poll_interval_ms));

    // Ring the logger so the link is up before the first transaction.
    port.on_message_ready(logger_addr, Stamp::now());

    loop {
        // Push any paced output onto the wire first.
        while let Some(frame) = port.take_output(Stamp::now()) {
            if stream.write_all(&frame).await.is_err() {
                let _ = events.send(SourceEvent::Disconnected {
                    source: name.clone(),
                    reason: DisconnectReason::ConnectionFailed,
                });
                return;
            }
        }
        tokio::select! {
            read = stream.read(&mut read_buf) => {
                match read {
                    Ok(0) | Err(_) => {
                        let _ = events.send(SourceEvent::Disconnected {
                            source: name.clone(),
                            reason: DisconnectReason::ConnectionFailed,
                        });
                        return;
                    }
                    Ok(count) => {
                        port.on_data_read(&read_buf[..count], Stamp::now());
                        if !announced {
                            announced = true;
                            debug!(name, logger = %logger_addr, "pakbus link answered");
                            let _ = events.send(SourceEvent::Connected { source: name.clone() });
                        }
                    }
                }
            }
            Some(packet) = rx_packets.recv() => {
                if let Some(msg) = Bmp5Message::decode(&packet.payload) {
                    on_bmp5_message(&name, &events, &mut trans, msg);
                }
            }
            Some(addr) = offline_rx.recv() => {
                debug!(name, %addr, "pakbus link offline");
            }
            _ = maintenance.tick() => {
                port.poll(Stamp::now());
            }
            _ = poller.tick() => {
                for (requests, table, column) in &active {
                    last_tran = last_tran.wrapping_add(1);
                    let tran = if last_tran == 0 { 1 } else { last_tran };
                    send_get_values(
                        &mut port, my_address, logger_addr, security_code, tran, table, column,
                    );
                    trans.insert(tran, PendingTran {
                        kind: TranKind::GetValues {
                            requests: requests.clone(),
                            column: column.clone(),
                            table: table.clone(),
                        },
                    });
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Activate(batch)) => {
                        for request in batch {
                            let (table, column, ok) = {
                                let held = request.lock().expect("request poisoned");
                                (
                                    held.uri().table().unwrap_or_default(),
                                    held.uri().column().unwrap_or_default(),
                                    held.uri().column().is_some(),
                                )
                            };
                            if !ok {
                                let _ = events.send(SourceEvent::RequestFailed {
                                    request,
                                    failure: SinkFailure::InvalidColumn,
                                });
                                continue;
                            }
                            let mut desc = RecordDesc::new("logger", &table);
                            desc.values.push(ValueDesc::scalar(&column, ValueType::Float4));
                            let schema = Record::new(desc, Stamp::now(), 0);
                            request.lock().expect("request poisoned").set_description(schema.clone());
                            let _ = events.send(SourceEvent::RequestReady {
                                request: request.clone(),
                                record: schema,
                            });
                            match active.iter_mut().find(|(_, held_table, held_column)| {
                                *held_table == table && *held_column == column
                            }) {
                                Some((requests, _, _)) => requests.push(request),
                                None => active.push((vec![request], table, column)),
                            }
                        }
                        port.on_message_ready(logger_addr, Stamp::now());
                    }
                    Some(Command::Remove(request)) => {
                        for (requests, _, _) in &mut active {
                            requests.retain(|held| !Arc::ptr_eq(held, &request));
                        }
                        active.retain(|(requests, _, _)| !requests.is_empty());
                    }
                    Some(Command::ClockCheck { op, should_set }) => {
                        last_tran = last_tran.wrapping_add(1);
                        let tran = if last_tran == 0 { 1 } else { last_tran };
                        let mut body = Vec::new();
                        body.extend_from_slice(&security_code.to_be_bytes());
                        // A clock set carries the wanted adjustment;
                        // zero means read-only.
                        let adjustment: i64 = if should_set {
                            Stamp::now().nanos() / NSEC_PER_SEC
                        } else {
                            0
                        };
                        body.extend_from_slice(&(adjustment as i32).to_be_bytes());
                        body.extend_from_slice(&0i32.to_be_bytes());
                        queue_message(&mut port, my_address, logger_addr, Bmp5Message {
                            protocol: PROTO_BMP5,
                            dst_node: logger_addr.value(),
                            src_node: my_address.value(),
                            msg_type: msg_types::CLOCK_CMD,
                            tran_no: tran,
                            body,
                        });
                        trans.insert(tran, PendingTran { kind: TranKind::Clock { op } });
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = events.send(SourceEvent::Disconnected {
                            source: name.clone(),
                            reason: DisconnectReason::ByApplication,
                        });
                        return;
                    }
                }
            }
        }
    }
}

fn queue_message(
    port: &mut SerialPacketPort<Bridge>,
    my_address: PakbusAddr,
    logger_addr: PakbusAddr,
    msg: Bmp5Message,
) {
    port.router_mut().outgoing.push_back(OutMessage {
        dest: logger_addr,
        source: my_address,
        priority: Priority::Normal,
        expect_more: true,
        body: msg.encode(),
    });
    port.on_message_ready(logger_addr, Stamp::now());
}

fn send_get_values(
    port: &mut SerialPacketPort<Bridge>,
    my_address: PakbusAddr,
    logger_addr: PakbusAddr,
    security_code: u16,
    tran: u8,
    table: &str,
    column: &str,
) {
    let mut body = Vec::new();
    body.extend_from_slice(&security_code.to_be_bytes());
    body.extend_from_slice(table.as_bytes());
    body.push(0);
    // Type code for a four-byte IEEE float, then the field and swath.
    body.push(9);
    body.extend_from_slice(column.as_bytes());
    body.push(0);
    body.extend_from_slice(&1u16.to_be_bytes());
    queue_message(
        port,
        my_address,
        logger_addr,
        Bmp5Message {
            protocol: PROTO_BMP5,
            dst_node: logger_addr.value(),
            src_node: my_address.value(),
            msg_type: msg_types::GET_VALUES_CMD,
            tran_no: tran,
            body,
        },
    );
}

fn on_bmp5_message(
    name: &str,
    events: &SourceEventSender,
    trans: &mut HashMap<u8, PendingTran>,
    msg: Bmp5Message,
) {
    if msg.protocol != PROTO_BMP5 {
        return;
    }
    let Some(pending) = trans.remove(&msg.tran_no) else {
        return;
    };
    match (msg.msg_type, pending.kind) {
        (msg_types::CLOCK_RSP, TranKind::Clock { op }) => {
            let outcome_code = msg.body.first().copied().unwrap_or(1);
            if outcome_code != 0 {
                let _ = events.send(SourceEvent::ClockComplete {
                    op,
                    outcome: Outcome::PermissionDenied,
                    logger_time: None,
                });
                return;
            }
            let seconds = msg
                .body
                .get(1..5)
                .map(|bytes| i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]));
            let nanos = msg
                .body
                .get(5..9)
                .map(|bytes| i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
                .unwrap_or(0);
            let logger_time = seconds.map(|seconds| {
                Stamp::from_nanos(i64::from(seconds) * NSEC_PER_SEC + i64::from(nanos))
            });
            if let Some(time) = logger_time {
                let _ = events.send(SourceEvent::SourceTime {
                    source: name.to_string(),
                    time,
                });
            }
            let _ = events.send(SourceEvent::ClockComplete {
                op,
                outcome: Outcome::Success,
                logger_time,
            });
        }
        (msg_types::GET_VALUES_RSP, TranKind::GetValues { requests, column, table }) => {
            let outcome_code = msg.body.first().copied().unwrap_or(1);
            if outcome_code != 0 {
                for request in requests {
                    let _ = events.send(SourceEvent::RequestFailed {
                        request,
                        failure: SinkFailure::InvalidColumn,
                    });
                }
                return;
            }
            let Some(bytes) = msg.body.get(1..5) else {
                return;
            };
            let value = f32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
            let mut desc = RecordDesc::new("logger", &table);
            desc.values.push(ValueDesc::scalar(&column, ValueType::Float4));
            let mut record = Record::new(desc, Stamp::now(), 0);
            record.values.push(Value::Float4(value));
            let _ = events.send(SourceEvent::Records {
                requests,
                records: vec![record],
            });
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bmp5_message_round_trips() {
        let msg = Bmp5Message {
            protocol: PROTO_BMP5,
            dst_node: 0x123,
            src_node: 0xFFE,
            msg_type: msg_types::CLOCK_CMD,
            tran_no: 7,
            body: vec![0, 0, 1, 2, 3, 4],
        };
        assert_eq!(Bmp5Message::decode(&msg.encode()).unwrap(), msg);
    }

    #[test]
    fn clock_response_reports_logger_time() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trans = HashMap::new();
        trans.insert(5, PendingTran { kind: TranKind::Clock { op: 11 } });
        let mut body = vec![0u8];
        body.extend_from_slice(&100i32.to_be_bytes());
        body.extend_from_slice(&0i32.to_be_bytes());
        on_bmp5_message(
            "pb",
            &tx,
            &mut trans,
            Bmp5Message {
                protocol: PROTO_BMP5,
                dst_node: 0xFFE,
                src_node: 0x001,
                msg_type: msg_types::CLOCK_RSP,
                tran_no: 5,
                body,
            },
        );
        let mut clock = None;
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::ClockComplete { op, outcome, logger_time } = event {
                clock = Some((op, outcome, logger_time));
            }
        }
        let (op, outcome, logger_time) = clock.unwrap();
        assert_eq!(op, 11);
        assert_eq!(outcome, Outcome::Success);
        assert_eq!(logger_time, Some(Stamp::from_secs(100)));
    }

    #[test]
    fn get_values_response_delivers_a_record() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trans = HashMap::new();
        let request = super::super::request::request_handle(super::super::request::Request::new(
            SourceUri::new("pb:logger.Public.temp"),
        ));
        trans.insert(
            2,
            PendingTran {
                kind: TranKind::GetValues {
                    requests: vec![request],
                    column: "temp".to_string(),
                    table: "Public".to_string(),
                },
            },
        );
        let mut body = vec![0u8];
        body.extend_from_slice(&21.5f32.to_be_bytes());
        on_bmp5_message(
            "pb",
            &tx,
            &mut trans,
            Bmp5Message {
                protocol: PROTO_BMP5,
                dst_node: 0xFFE,
                src_node: 0x001,
                msg_type: msg_types::GET_VALUES_RSP,
                tran_no: 2,
                body,
            },
        );
        match rx.try_recv().unwrap() {
            SourceEvent::Records { records, .. } => {
                assert_eq!(records[0].value_by_name("temp"), Some(&Value::Float4(21.5)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unknown_transaction_is_ignored() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut trans = HashMap::new();
        on_bmp5_message(
            "pb",
            &tx,
            &mut trans,
            Bmp5Message {
                protocol: PROTO_BMP5,
                dst_node: 1,
                src_node: 2,
                msg_type: msg_types::CLOCK_RSP,
                tran_no: 9,
                body: vec![0],
            },
        );
        assert!(rx.try_recv().is_err());
    }
}

//! The collection-server source: tables served by a LoggerNet-style
//! server over the session-multiplexed messaging fabric.
//!
//! The source owns a router task over one TCP transport. Each data
//! request becomes a table-advise transaction on the server session;
//! record notifications fan out to every request advising the same
//! table. Set-value and clock operations run as their own
//! transactions.

use super::record::{Record, RecordDesc, Value, ValueDesc, ValueType};
use super::request::{RequestHandle, SinkFailure};
use super::settings::SourceSettings;
use super::sink::{DisconnectReason, OpId, Outcome};
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::messaging::conn::{ConnEvent, TcpConn};
use crate::messaging::message::Message;
use crate::messaging::router::{session_channel, Router, SessionEvent};
use crate::messaging::messages as base;
use crate::stamp::Stamp;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Message types of the table data service.
pub mod messages {
    pub const LOGON_CMD: u32 = 1001;
    pub const LOGON_ACK: u32 = 1002;
    pub const ADVISE_START_CMD: u32 = 1003;
    /// Carries the table definition for a started advise.
    pub const ADVISE_START_ACK: u32 = 1004;
    /// Carries one or more records for an advise transaction.
    pub const ADVISE_NOT: u32 = 1005;
    pub const ADVISE_STOP_CMD: u32 = 1006;
    pub const SET_VALUE_CMD: u32 = 1007;
    pub const SET_VALUE_ACK: u32 = 1008;
    pub const CLOCK_CHECK_CMD: u32 = 1009;
    pub const CLOCK_CHECK_ACK: u32 = 1010;
    pub const ENUMERATE_CMD: u32 = 1011;
    pub const ENUMERATE_ACK: u32 = 1012;
    pub const TERMINAL_OPEN_CMD: u32 = 1013;
    pub const TERMINAL_DATA: u32 = 1014;
    pub const TERMINAL_CLOSE_CMD: u32 = 1015;
    pub const TERMINAL_CLOSED_NOT: u32 = 1016;
}

/// Wire codes for value storage types.
fn type_code(value_type: ValueType) -> u8 {
    match value_type {
        ValueType::Bool => 1,
        ValueType::Int4 => 2,
        ValueType::UInt4 => 3,
        ValueType::Int8 => 4,
        ValueType::Float4 => 5,
        ValueType::Float8 => 6,
        ValueType::Stamp => 7,
        ValueType::Ascii => 8,
    }
}

fn type_from_code(code: u8) -> Option<ValueType> {
    match code {
        1 => Some(ValueType::Bool),
        2 => Some(ValueType::Int4),
        3 => Some(ValueType::UInt4),
        4 => Some(ValueType::Int8),
        5 => Some(ValueType::Float4),
        6 => Some(ValueType::Float8),
        7 => Some(ValueType::Stamp),
        8 => Some(ValueType::Ascii),
        _ => None,
    }
}

pub(crate) fn write_value(msg: &mut Message, value: &Value) {
    msg.add_u8(type_code(value.value_type()));
    match value {
        Value::Bool(flag) => msg.add_bool(*flag),
        Value::Int4(v) => msg.add_u32(*v as u32),
        Value::UInt4(v) => msg.add_u32(*v),
        Value::Int8(v) => msg.add_i64(*v),
        Value::Float4(v) => msg.add_u32(v.to_bits()),
        Value::Float8(v) => msg.add_i64(v.to_bits() as i64),
        Value::Stamp(v) => msg.add_i64(*v),
        Value::Ascii(text) => msg.add_str(text),
    }
}

pub(crate) fn read_value(msg: &mut Message) -> Option<Value> {
    let value_type = type_from_code(msg.read_u8().ok()?)?;
    Some(match value_type {
        ValueType::Bool => Value::Bool(msg.read_bool().ok()?),
        ValueType::Int4 => Value::Int4(msg.read_u32().ok()? as i32),
        ValueType::UInt4 => Value::UInt4(msg.read_u32().ok()?),
        ValueType::Int8 => Value::Int8(msg.read_i64().ok()?),
        ValueType::Float4 => Value::Float4(f32::from_bits(msg.read_u32().ok()?)),
        ValueType::Float8 => Value::Float8(f64::from_bits(msg.read_i64().ok()? as u64)),
        ValueType::Stamp => Value::Stamp(msg.read_i64().ok()?),
        ValueType::Ascii => Value::Ascii(msg.read_str().ok()?),
    })
}

enum Command {
    Activate(Vec<RequestHandle>),
    Remove(RequestHandle),
    SetValue { op: OpId, uri: SourceUri, value: Value },
    ClockCheck { op: OpId, should_set: bool },
    Enumerate { parent: String },
    TerminalOpen { token: i64, station: String },
    TerminalSend { token: i64, bytes: Vec<u8> },
    TerminalClose { token: i64 },
    Disconnect,
}

/// Collection-server source.
pub struct LgrNetSource {
    name: String,
    events: SourceEventSender,
    settings: SourceSettings,
    connected: bool,
    queued: Vec<RequestHandle>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl LgrNetSource {
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

impl DataSource for LgrNetSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        let Some(address) = self.settings.address() else {
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::BadProperties,
            });
            return;
        };
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        self.commands = Some(command_tx);
        self.connected = true;
        let _ = self.events.send(SourceEvent::Connecting {
            source: self.name.clone(),
        });
        tokio::spawn(run_session(
            self.name.clone(),
            address,
            self.settings.user_name.clone().unwrap_or_default(),
            self.settings.password.clone().unwrap_or_default(),
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
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Activate(batch));
        } else {
            for request in batch {
                let _ = self.events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::ConnectionFailed,
                });
            }
        }
    }

    fn remove_request(&mut self, request: &RequestHandle) {
        self.queued.retain(|held| !Arc::ptr_eq(held, request));
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::Remove(request.clone()));
        }
    }

    fn start_set_value(&mut self, op: OpId, uri: &SourceUri, value: Value) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::SetValue {
                    op,
                    uri: uri.clone(),
                    value,
                })
                .is_ok(),
            None => false,
        }
    }

    fn start_clock_check(&mut self, op: OpId, _uri: &SourceUri, should_set: bool) -> bool {
        match &self.commands {
            Some(commands) => commands.send(Command::ClockCheck { op, should_set }).is_ok(),
            None => false,
        }
    }

    fn start_terminal(&mut self, token: i64, uri: &SourceUri) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::TerminalOpen {
                    token,
                    station: uri.station().unwrap_or_default(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn send_terminal(&mut self, token: i64, bytes: &[u8]) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::TerminalSend {
                token,
                bytes: bytes.to_vec(),
            });
        }
    }

    fn close_terminal(&mut self, token: i64) {
        if let Some(commands) = &self.commands {
            let _ = commands.send(Command::TerminalClose { token });
        }
    }

    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::Enumerate {
                    parent: uri.as_str().to_string(),
                })
                .is_ok(),
            None => false,
        }
    }
}

struct Advise {
    tran: u32,
    requests: Vec<RequestHandle>,
    desc: Option<RecordDesc>,
}

async fn run_session(
    name: String,
    address: String,
    user_name: String,
    password: String,
    events: SourceEventSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let (tcp, mut conn_events) = TcpConn::new(&address);
    let mut router = Router::new(Box::new(tcp));
    let (sess_tx, mut sess_rx) = session_channel();
    let session = router.open_session(&sess_tx);
    // Identify the peer first, then log on.
    router.send(&Message::new(session, base::TYPE_QUERY_SERVER_CMD));
    let mut logon = Message::new(session, messages::LOGON_CMD);
    logon.add_str(&user_name);
    logon.add_str(&password);
    router.send(&logon);

    let mut advises: HashMap<u32, Advise> = HashMap::new();
    let mut last_tran = 0u32;
    let mut logged_on = false;
    let mut pending: Vec<Vec<RequestHandle>> = Vec::new();

    loop {
        tokio::select! {
            conn_event = conn_events.recv() => {
                match conn_event {
                    Some(ConnEvent::Bytes(bytes)) => router.on_bytes(&bytes),
                    Some(ConnEvent::Closed(reason)) => {
                        router.on_conn_closed(reason);
                    }
                    None => break,
                }
            }
            session_event = sess_rx.recv() => {
                let Some(session_event) = session_event else { break };
                match session_event {
                    SessionEvent::Message(mut msg) => match msg.msg_type() {
                        messages::LOGON_ACK => {
                            let outcome = msg.read_u32().unwrap_or(0);
                            if outcome == 1 {
                                logged_on = true;
                                debug!(name, "collection server logon complete");
                                let _ = events.send(SourceEvent::Connected { source: name.clone() });
                                for batch in pending.drain(..) {
                                    start_advises(&mut router, session, &mut last_tran, &mut advises, batch);
                                }
                            } else {
                                warn!(name, outcome, "collection server refused logon");
                                let _ = events.send(SourceEvent::Disconnected {
                                    source: name.clone(),
                                    reason: DisconnectReason::LogonFailed,
                                });
                                return;
                            }
                        }
                        base::TYPE_QUERY_SERVER_ACK => {
                            let server_name = msg.read_str().unwrap_or_default();
                            let version = msg.read_str().unwrap_or_default();
                            debug!(name, server_name, version, "server identified");
                        }
                        messages::ADVISE_START_ACK => on_advise_started(&events, &mut advises, &mut msg),
                        messages::ADVISE_NOT => on_advise_records(&events, &mut advises, &mut msg),
                        messages::SET_VALUE_ACK => {
                            let op = msg.read_i64().unwrap_or(0) as OpId;
                            let outcome = msg.read_u32().unwrap_or(0);
                            let uri_text = msg.read_str().unwrap_or_default();
                            let _ = events.send(SourceEvent::SetComplete {
                                op,
                                uri: SourceUri::new(&uri_text),
                                outcome: decode_outcome(outcome),
                            });
                        }
                        messages::CLOCK_CHECK_ACK => {
                            let op = msg.read_i64().unwrap_or(0) as OpId;
                            let outcome = msg.read_u32().unwrap_or(0);
                            let logger_time = msg.read_i64().ok().map(Stamp::from_nanos);
                            let _ = events.send(SourceEvent::ClockComplete {
                                op,
                                outcome: decode_outcome(outcome),
                                logger_time,
                            });
                            if let Some(time) = logger_time {
                                let _ = events.send(SourceEvent::SourceTime {
                                    source: name.clone(),
                                    time,
                                });
                            }
                        }
                        messages::ENUMERATE_ACK => on_enumerate_ack(&name, &events, &mut msg),
                        messages::TERMINAL_DATA => {
                            let token = msg.read_i64().unwrap_or(0);
                            if let Ok(bytes) = msg.read_bstr() {
                                let _ = events.send(SourceEvent::TerminalData { token, bytes });
                            }
                        }
                        messages::TERMINAL_CLOSED_NOT => {
                            let token = msg.read_i64().unwrap_or(0);
                            let _ = events.send(SourceEvent::TerminalClosed { token });
                        }
                        _ => {}
                    },
                    SessionEvent::Broken { reason, .. } => {
                        warn!(name, ?reason, "server session broken");
                        let _ = events.send(SourceEvent::Disconnected {
                            source: name.clone(),
                            reason: DisconnectReason::ConnectionFailed,
                        });
                        return;
                    }
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Activate(batch)) => {
                        if logged_on {
                            start_advises(&mut router, session, &mut last_tran, &mut advises, batch);
                        } else {
                            pending.push(batch);
                        }
                    }
                    Some(Command::Remove(request)) => {
                        advises.retain(|tran, advise| {
                            advise.requests.retain(|held| !Arc::ptr_eq(held, &request));
                            if advise.requests.is_empty() {
                                let mut stop = Message::new(session, messages::ADVISE_STOP_CMD);
                                stop.add_u32(*tran);
                                router.send(&stop);
                                false
                            } else {
                                true
                            }
                        });
                    }
                    Some(Command::SetValue { op, uri, value }) => {
                        let mut cmd = Message::new(session, messages::SET_VALUE_CMD);
                        cmd.add_i64(op as i64);
                        cmd.add_str(uri.as_str());
                        write_value(&mut cmd, &value);
                        router.send(&cmd);
                    }
                    Some(Command::ClockCheck { op, should_set }) => {
                        let mut cmd = Message::new(session, messages::CLOCK_CHECK_CMD);
                        cmd.add_i64(op as i64);
                        cmd.add_bool(should_set);
                        router.send(&cmd);
                    }
                    Some(Command::Enumerate { parent }) => {
                        let mut cmd = Message::new(session, messages::ENUMERATE_CMD);
                        cmd.add_str(&parent);
                        router.send(&cmd);
                    }
                    Some(Command::TerminalOpen { token, station }) => {
                        let mut cmd = Message::new(session, messages::TERMINAL_OPEN_CMD);
                        cmd.add_i64(token);
                        cmd.add_str(&station);
                        router.send(&cmd);
                    }
                    Some(Command::TerminalSend { token, bytes }) => {
                        let mut cmd = Message::new(session, messages::TERMINAL_DATA);
                        cmd.add_i64(token);
                        cmd.add_bstr(&bytes);
                        router.send(&cmd);
                    }
                    Some(Command::TerminalClose { token }) => {
                        let mut cmd = Message::new(session, messages::TERMINAL_CLOSE_CMD);
                        cmd.add_i64(token);
                        router.send(&cmd);
                    }
                    Some(Command::Disconnect) | None => {
                        router.close_session(session);
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
    let _ = events.send(SourceEvent::Disconnected {
        source: name,
        reason: DisconnectReason::ConnectionFailed,
    });
}

fn start_advises(
    router: &mut Router,
    session: u32,
    last_tran: &mut u32,
    advises: &mut HashMap<u32, Advise>,
    batch: Vec<RequestHandle>,
) {
    // Requests that name the same station and table share one advise
    // transaction so their records arrive co-scheduled.
    let mut by_table: HashMap<(String, String), Vec<RequestHandle>> = HashMap::new();
    for request in batch {
        let key = {
            let held = request.lock().expect("request poisoned");
            (
                held.uri().station().unwrap_or_default(),
                held.uri().table().unwrap_or_default(),
            )
        };
        by_table.entry(key).or_default().push(request);
    }
    for ((station, table), requests) in by_table {
        *last_tran += 1;
        let tran = *last_tran;
        let mut cmd = Message::new(session, messages::ADVISE_START_CMD);
        cmd.add_u32(tran);
        cmd.add_str(&station);
        cmd.add_str(&table);
        {
            // Start and order options travel with the command.
            let held = requests[0].lock().expect("request poisoned");
            cmd.add_u32(held.start_option() as u32);
            cmd.add_u32(held.order_option() as i64 as u32);
            cmd.add_i64(held.start_time().nanos());
            cmd.add_i64(held.end_time().nanos());
            cmd.add_i64(held.backfill_interval());
            cmd.add_u32(held.start_record_offset());
            cmd.add_u32(held.file_mark_no());
            cmd.add_u32(held.record_no());
        }
        router.send(&cmd);
        advises.insert(
            tran,
            Advise {
                tran,
                requests,
                desc: None,
            },
        );
    }
}

fn on_advise_started(
    events: &SourceEventSender,
    advises: &mut HashMap<u32, Advise>,
    msg: &mut Message,
) {
    let Ok(tran) = msg.read_u32() else { return };
    let Some(advise) = advises.get_mut(&tran) else {
        return;
    };
    let outcome = msg.read_u32().unwrap_or(0);
    if outcome != 1 {
        let failure = match outcome {
            2 => SinkFailure::InvalidStation,
            3 => SinkFailure::InvalidTable,
            4 => SinkFailure::InvalidColumn,
            5 => SinkFailure::InvalidLogon,
            _ => SinkFailure::Unknown,
        };
        if let Some(advise) = advises.remove(&tran) {
            for request in advise.requests {
                let _ = events.send(SourceEvent::RequestFailed {
                    request,
                    failure,
                });
            }
        }
        return;
    }
    let station = msg.read_str().unwrap_or_default();
    let table = msg.read_str().unwrap_or_default();
    let count = msg.read_u32().unwrap_or(0);
    let mut desc = RecordDesc::new(&station, &table);
    for _ in 0..count {
        let name = msg.read_str().unwrap_or_default();
        let value_type = type_from_code(msg.read_u8().unwrap_or(0)).unwrap_or(ValueType::Float8);
        desc.values.push(ValueDesc::scalar(&name, value_type));
    }
    let schema = Record::new(desc.clone(), Stamp::now(), 0);
    advise.desc = Some(desc);
    for request in &advise.requests {
        request
            .lock()
            .expect("request poisoned")
            .set_description(schema.clone());
        let _ = events.send(SourceEvent::RequestReady {
            request: request.clone(),
            record: schema.clone(),
        });
    }
}

fn on_advise_records(
    events: &SourceEventSender,
    advises: &mut HashMap<u32, Advise>,
    msg: &mut Message,
) {
    let Ok(tran) = msg.read_u32() else { return };
    let Some(advise) = advises.get_mut(&tran) else {
        return;
    };
    let Some(desc) = advise.desc.clone() else {
        warn!(tran = advise.tran, "records before the table definition");
        return;
    };
    let count = msg.read_u32().unwrap_or(0);
    let mut records = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Ok(stamp) = msg.read_i64() else { break };
        let Ok(record_no) = msg.read_u32() else { break };
        let mut record = Record::new(desc.clone(), Stamp::from_nanos(stamp), record_no);
        record.file_mark_no = msg.read_u32().unwrap_or(0);
        let mut complete = true;
        for _ in 0..desc.values.len() {
            match read_value(msg) {
                Some(value) => record.values.push(value),
                None => {
                    complete = false;
                    break;
                }
            }
        }
        if complete {
            records.push(record);
        }
    }
    if !records.is_empty() {
        let _ = events.send(SourceEvent::Records {
            requests: advise.requests.clone(),
            records,
        });
    }
}

fn on_enumerate_ack(name: &str, events: &SourceEventSender, msg: &mut Message) {
    let parent = msg.read_str().unwrap_or_default();
    let count = msg.read_u32().unwrap_or(0);
    let mut symbols = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let Ok(child) = msg.read_str() else { break };
        let kind = msg.read_u8().unwrap_or(0);
        symbols.push(match kind {
            0 => SymbolSeed::branch(&child, SymbolType::Station),
            1 => SymbolSeed::branch(&child, SymbolType::Table),
            _ => SymbolSeed::leaf(&child, SymbolType::Scalar, ValueType::Float8),
        });
    }
    let _ = events.send(SourceEvent::Symbols {
        source: name.to_string(),
        parent,
        symbols,
    });
}

fn decode_outcome(code: u32) -> Outcome {
    match code {
        1 => Outcome::Success,
        2 => Outcome::InvalidUri,
        3 => Outcome::PermissionDenied,
        4 => Outcome::CommFailed,
        _ => Outcome::Failed(format!("server outcome {code}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_codec_round_trips() {
        let values = vec![
            Value::Bool(true),
            Value::Int4(-5),
            Value::UInt4(7),
            Value::Int8(-1_000_000_000_000),
            Value::Float4(1.5),
            Value::Float8(-2.25),
            Value::Stamp(123_456_789),
            Value::Ascii("text".to_string()),
        ];
        let mut msg = Message::new(1, messages::ADVISE_NOT);
        for value in &values {
            write_value(&mut msg, value);
        }
        let mut decoded = Message::from_body(&msg.body());
        for value in &values {
            assert_eq!(read_value(&mut decoded).as_ref(), Some(value));
        }
    }

    #[test]
    fn advise_ack_builds_description_and_readies_requests() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut advises = HashMap::new();
        let request = super::super::request::request_handle(super::super::request::Request::new(
            SourceUri::new("src:stn.tbl.temp"),
        ));
        advises.insert(
            9,
            Advise {
                tran: 9,
                requests: vec![request.clone()],
                desc: None,
            },
        );
        let mut ack = Message::new(1, messages::ADVISE_START_ACK);
        ack.add_u32(9);
        ack.add_u32(1);
        ack.add_str("stn");
        ack.add_str("tbl");
        ack.add_u32(2);
        ack.add_str("temp");
        ack.add_u8(6);
        ack.add_str("rh");
        ack.add_u8(3);
        let mut ack = Message::from_body(&ack.body());
        on_advise_started(&tx, &mut advises, &mut ack);
        match rx.try_recv().unwrap() {
            SourceEvent::RequestReady { record, .. } => {
                assert_eq!(record.desc.values.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
        // The request's value window points at its column.
        assert_eq!(request.lock().unwrap().value_indices(), (0, 1));
    }

    #[test]
    fn advise_records_decode_in_order() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut advises = HashMap::new();
        let request = super::super::request::request_handle(super::super::request::Request::new(
            SourceUri::new("src:stn.tbl.temp"),
        ));
        let mut desc = RecordDesc::new("stn", "tbl");
        desc.values.push(ValueDesc::scalar("temp", ValueType::Float8));
        advises.insert(
            3,
            Advise {
                tran: 3,
                requests: vec![request],
                desc: Some(desc),
            },
        );
        let mut notice = Message::new(1, messages::ADVISE_NOT);
        notice.add_u32(3);
        notice.add_u32(2);
        for (stamp, record_no, value) in [(100i64, 1u32, 20.0f64), (200, 2, 21.0)] {
            notice.add_i64(stamp);
            notice.add_u32(record_no);
            notice.add_u32(0);
            write_value(&mut notice, &Value::Float8(value));
        }
        let mut notice = Message::from_body(&notice.body());
        on_advise_records(&tx, &mut advises, &mut notice);
        match rx.try_recv().unwrap() {
            SourceEvent::Records { records, .. } => {
                assert_eq!(records.len(), 2);
                assert_eq!(records[1].record_no, 2);
                assert_eq!(records[1].value_by_name("temp"), Some(&Value::Float8(21.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}

//! The web API source: a datalogger's HTTP REST surface.
//!
//! The logger answers `?command=` queries with JSON: `DataQuery` for
//! records, `SetValueEx` for writes, `ClockCheck`/`ClockSet` for time,
//! `ListFiles` for storage, and `BrowseSymbols` for the table tree.
//! Requests poll on a schedule; each poll asks for records since the
//! last delivered stamp.

use super::record::{Record, RecordDesc, Value, ValueDesc, ValueType};
use super::request::{RequestHandle, SinkFailure, StartOption};
use super::settings::SourceSettings;
use super::sink::{DisconnectReason, FileInfo, OpId, Outcome};
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::http::{fetch, HttpFailure, HttpUri, Method, Request as HttpRequest};
use crate::http::request::Authorisation;
use crate::stamp::{Stamp, NSEC_PER_MSEC};
use serde_json::Value as Json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum Command {
    Activate(Vec<RequestHandle>),
    Remove(RequestHandle),
    SetValue { op: OpId, uri: SourceUri, value: Value },
    ClockCheck { op: OpId, should_set: bool },
    ListFiles { op: OpId, pattern: String },
    SendFile { op: OpId, file_name: String, content: Vec<u8> },
    GetNewestFile { op: OpId, pattern: String },
    FileControl { op: OpId, command: u32, file_name: String },
    Enumerate { parent: String },
    Disconnect,
}

/// Datalogger web API source.
pub struct HttpSource {
    name: String,
    events: SourceEventSender,
    settings: SourceSettings,
    connected: bool,
    queued: Vec<RequestHandle>,
    commands: Option<mpsc::UnboundedSender<Command>>,
}

impl HttpSource {
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

    fn base_url(&self) -> Option<String> {
        let address = self.settings.address()?;
        let scheme = if self.settings.use_https.unwrap_or(false) {
            "https"
        } else {
            "http"
        };
        Some(format!("{scheme}://{address}"))
    }

    fn authorisation(&self) -> Authorisation {
        match (&self.settings.user_name, &self.settings.password) {
            (Some(user), Some(password)) => Authorisation::Basic {
                user: user.clone(),
                password: password.clone(),
            },
            _ => Authorisation::None,
        }
    }
}

impl DataSource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        let Some(base_url) = self.base_url() else {
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
        let poll_interval = self.settings.poll_schedule_interval.unwrap_or(10_000).max(250);
        tokio::spawn(run_poller(
            self.name.clone(),
            base_url,
            self.authorisation(),
            u64::from(poll_interval),
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

    fn start_list_files(&mut self, op: OpId, _uri: &SourceUri, pattern: &str) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::ListFiles {
                    op,
                    pattern: pattern.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn start_send_file(&mut self, op: OpId, _uri: &SourceUri, file_name: &str, content: Vec<u8>) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::SendFile {
                    op,
                    file_name: file_name.to_string(),
                    content,
                })
                .is_ok(),
            None => false,
        }
    }

    fn start_get_newest_file(&mut self, op: OpId, _uri: &SourceUri, pattern: &str) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::GetNewestFile {
                    op,
                    pattern: pattern.to_string(),
                })
                .is_ok(),
            None => false,
        }
    }

    fn start_file_control(&mut self, op: OpId, _uri: &SourceUri, command: u32, file_name: &str) -> bool {
        match &self.commands {
            Some(commands) => commands
                .send(Command::FileControl {
                    op,
                    command,
                    file_name: file_name.to_string(),
                })
                .is_ok(),
            None => false,
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

struct Poll {
    requests: Vec<RequestHandle>,
    table_uri: String,
    desc: Option<RecordDesc>,
    last_stamp: Option<Stamp>,
}

async fn api_get(base_url: &str, auth: &Authorisation, query: &str) -> Result<Json, HttpFailure> {
    let body = api_get_raw(base_url, auth, query).await?;
    serde_json::from_slice(&body).map_err(|_| HttpFailure::BadHeader)
}

async fn api_get_raw(
    base_url: &str,
    auth: &Authorisation,
    query: &str,
) -> Result<Vec<u8>, HttpFailure> {
    let uri = HttpUri::parse(&format!("{base_url}/?{query}")).map_err(|_| HttpFailure::Connect)?;
    let mut request = HttpRequest::new(Method::Get, uri);
    request.authorisation = auth.clone();
    let mut done = fetch(request).await?;
    if done.response_code != 200 {
        return Err(HttpFailure::BadHeader);
    }
    Ok(done.read_response_all())
}

async fn send_file(
    base_url: &str,
    auth: &Authorisation,
    file_name: &str,
    content: Vec<u8>,
) -> Outcome {
    let Ok(uri) = HttpUri::parse(&format!("{base_url}/{file_name}")) else {
        return Outcome::InvalidUri;
    };
    let mut request = HttpRequest::new(Method::Put, uri);
    request.authorisation = auth.clone();
    request.content_type = Some("application/octet-stream".to_string());
    request.add_body(&content, true);
    match fetch(request).await {
        Ok(done) if done.response_code < 300 => Outcome::Success,
        Ok(done) if done.response_code == 401 || done.response_code == 403 => {
            Outcome::PermissionDenied
        }
        Ok(done) => Outcome::Failed(format!("http status {}", done.response_code)),
        Err(_) => Outcome::CommFailed,
    }
}

async fn run_poller(
    name: String,
    base_url: String,
    auth: Authorisation,
    poll_interval_ms: u64,
    events: SourceEventSender,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    // Probe the logger before claiming the source is up.
    match api_get(&base_url, &auth, "command=ClockCheck&format=json").await {
        Ok(body) => {
            let _ = events.send(SourceEvent::Connected {
                source: name.clone(),
            });
            if let Some(time) = parse_logger_time(&body) {
                let _ = events.send(SourceEvent::SourceTime {
                    source: name.clone(),
                    time,
                });
            }
        }
        Err(error) => {
            warn!(name, %error, "logger probe failed");
            let _ = events.send(SourceEvent::Disconnected {
                source: name,
                reason: DisconnectReason::ConnectionFailed,
            });
            return;
        }
    }

    let mut polls: Vec<Poll> = Vec::new();
    let mut ticker = tokio::time::interval(tokio::time::Duration::from_millis(poll_interval_ms));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                for poll in &mut polls {
                    run_one_poll(&base_url, &auth, &events, poll).await;
                }
            }
            command = commands.recv() => {
                match command {
                    Some(Command::Activate(batch)) => {
                        for request in batch {
                            let table_uri = {
                                let held = request.lock().expect("request poisoned");
                                let station = held.uri().station().unwrap_or_default();
                                let table = held.uri().table().unwrap_or_default();
                                format!("{station}.{table}")
                            };
                            match polls.iter_mut().find(|poll| poll.table_uri == table_uri) {
                                Some(poll) => poll.requests.push(request),
                                None => polls.push(Poll {
                                    requests: vec![request],
                                    table_uri,
                                    desc: None,
                                    last_stamp: None,
                                }),
                            }
                        }
                        // Poll immediately so new requests get their
                        // schema without waiting a full interval.
                        for poll in &mut polls {
                            if poll.desc.is_none() {
                                run_one_poll(&base_url, &auth, &events, poll).await;
                            }
                        }
                    }
                    Some(Command::Remove(request)) => {
                        for poll in &mut polls {
                            poll.requests.retain(|held| !Arc::ptr_eq(held, &request));
                        }
                        polls.retain(|poll| !poll.requests.is_empty());
                    }
                    Some(Command::SetValue { op, uri, value }) => {
                        let outcome = run_set_value(&base_url, &auth, &uri, &value).await;
                        let _ = events.send(SourceEvent::SetComplete { op, uri, outcome });
                    }
                    Some(Command::ClockCheck { op, should_set }) => {
                        let command = if should_set { "ClockSet" } else { "ClockCheck" };
                        let query = format!("command={command}&format=json");
                        match api_get(&base_url, &auth, &query).await {
                            Ok(body) => {
                                let logger_time = parse_logger_time(&body);
                                if let Some(time) = logger_time {
                                    let _ = events.send(SourceEvent::SourceTime {
                                        source: name.clone(),
                                        time,
                                    });
                                }
                                let _ = events.send(SourceEvent::ClockComplete {
                                    op,
                                    outcome: Outcome::Success,
                                    logger_time,
                                });
                            }
                            Err(_) => {
                                let _ = events.send(SourceEvent::ClockComplete {
                                    op,
                                    outcome: Outcome::CommFailed,
                                    logger_time: None,
                                });
                            }
                        }
                    }
                    Some(Command::ListFiles { op, pattern }) => {
                        let query = format!("command=ListFiles&format=json&expr={pattern}");
                        match api_get(&base_url, &auth, &query).await {
                            Ok(body) => {
                                let files = parse_file_list(&body);
                                let _ = events.send(SourceEvent::ListFilesComplete {
                                    op,
                                    outcome: Outcome::Success,
                                    files,
                                });
                            }
                            Err(_) => {
                                let _ = events.send(SourceEvent::ListFilesComplete {
                                    op,
                                    outcome: Outcome::CommFailed,
                                    files: Vec::new(),
                                });
                            }
                        }
                    }
                    Some(Command::SendFile { op, file_name, content }) => {
                        let outcome = send_file(&base_url, &auth, &file_name, content).await;
                        let _ = events.send(SourceEvent::FileComplete { op, outcome });
                    }
                    Some(Command::GetNewestFile { op, pattern }) => {
                        let query = format!("command=NewestFile&expr={pattern}");
                        let outcome = match api_get_raw(&base_url, &auth, &query).await {
                            Ok(_) => Outcome::Success,
                            Err(_) => Outcome::CommFailed,
                        };
                        let _ = events.send(SourceEvent::FileComplete { op, outcome });
                    }
                    Some(Command::FileControl { op, command, file_name }) => {
                        let query =
                            format!("command=FileControl&file={file_name}&action={command}");
                        let outcome = match api_get_raw(&base_url, &auth, &query).await {
                            Ok(_) => Outcome::Success,
                            Err(_) => Outcome::CommFailed,
                        };
                        let _ = events.send(SourceEvent::FileComplete { op, outcome });
                    }
                    Some(Command::Enumerate { parent }) => {
                        let query = format!("command=BrowseSymbols&format=json&uri={parent}");
                        if let Ok(body) = api_get(&base_url, &auth, &query).await {
                            let symbols = parse_symbols(&body);
                            let _ = events.send(SourceEvent::Symbols {
                                source: name.clone(),
                                parent,
                                symbols,
                            });
                        }
                    }
                    Some(Command::Disconnect) | None => {
                        let _ = events.send(SourceEvent::Disconnected {
                            source: name,
                            reason: DisconnectReason::ByApplication,
                        });
                        return;
                    }
                }
            }
        }
    }
}

async fn run_one_poll(
    base_url: &str,
    auth: &Authorisation,
    events: &SourceEventSender,
    poll: &mut Poll,
) {
    let first = poll.desc.is_none();
    let mode = if first {
        query_mode_for(&poll.requests)
    } else {
        match poll.last_stamp {
            Some(since) => format!(
                "mode=since-time&p1={}",
                Stamp::from_nanos(since.nanos() + NSEC_PER_MSEC).to_log_header()
            ),
            None => "mode=most-recent&p1=1".to_string(),
        }
    };
    let query = format!("command=DataQuery&uri=dl:{}&format=json&{mode}", poll.table_uri);
    let body = match api_get(base_url, auth, &query).await {
        Ok(body) => body,
        Err(error) => {
            debug!(%error, table = poll.table_uri, "data query failed");
            return;
        }
    };
    let Some((desc, records)) = parse_data_query(&poll.table_uri, &body) else {
        if first {
            for request in poll.requests.drain(..) {
                let _ = events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::InvalidTable,
                });
            }
        }
        return;
    };
    if first {
        let schema = Record::new(desc.clone(), Stamp::now(), 0);
        for request in &poll.requests {
            request
                .lock()
                .expect("request poisoned")
                .set_description(schema.clone());
            let _ = events.send(SourceEvent::RequestReady {
                request: request.clone(),
                record: schema.clone(),
            });
        }
        poll.desc = Some(desc);
    }
    if let Some(newest) = records.iter().map(|record| record.stamp).max() {
        poll.last_stamp = Some(newest);
    }
    if !records.is_empty() {
        let _ = events.send(SourceEvent::Records {
            requests: poll.requests.clone(),
            records,
        });
    }
}

fn query_mode_for(requests: &[RequestHandle]) -> String {
    let Some(request) = requests.first() else {
        return "mode=most-recent&p1=1".to_string();
    };
    let held = request.lock().expect("request poisoned");
    match held.start_option() {
        StartOption::AtNewest | StartOption::AfterNewest => "mode=most-recent&p1=1".to_string(),
        StartOption::AtOffsetFromNewest => {
            format!("mode=most-recent&p1={}", held.start_record_offset() + 1)
        }
        StartOption::AtTime => format!(
            "mode=since-time&p1={}",
            held.start_time().to_log_header()
        ),
        StartOption::DateRange => format!(
            "mode=date-range&p1={}&p2={}",
            held.start_time().to_log_header(),
            held.end_time().to_log_header()
        ),
        StartOption::RelativeToNewest => format!(
            "mode=backfill&p1={}",
            held.backfill_interval() / crate::stamp::NSEC_PER_SEC
        ),
        StartOption::AtRecord => format!("mode=since-record&p1={}", held.record_no()),
    }
}

async fn run_set_value(
    base_url: &str,
    auth: &Authorisation,
    uri: &SourceUri,
    value: &Value,
) -> Outcome {
    let Some(column) = uri.column() else {
        return Outcome::InvalidUri;
    };
    let station = uri.station().unwrap_or_default();
    let table = uri.table().unwrap_or_default();
    let query = format!(
        "command=SetValueEx&uri=dl:{station}.{table}.{column}&value={}",
        value.format()
    );
    match api_get(base_url, auth, &query).await {
        Ok(body) => {
            let success = body
                .get("outcome")
                .and_then(Json::as_i64)
                .map_or(true, |outcome| outcome == 1);
            if success {
                Outcome::Success
            } else {
                Outcome::PermissionDenied
            }
        }
        Err(_) => Outcome::CommFailed,
    }
}

/// Parses the `head.fields` + `data` shape of a `DataQuery` response.
fn parse_data_query(table_uri: &str, body: &Json) -> Option<(RecordDesc, Vec<Record>)> {
    let fields = body.get("head")?.get("fields")?.as_array()?;
    let (station, table) = match table_uri.split_once('.') {
        Some((station, table)) => (station, table),
        None => ("", table_uri),
    };
    let mut desc = RecordDesc::new(station, table);
    for field in fields {
        let name = field.get("name")?.as_str()?;
        let value_type = match field.get("type").and_then(Json::as_str).unwrap_or("xsd:double") {
            "xsd:boolean" => ValueType::Bool,
            "xsd:int" | "xsd:long" => ValueType::Int8,
            "xsd:string" => ValueType::Ascii,
            "xsd:dateTime" => ValueType::Stamp,
            _ => ValueType::Float8,
        };
        desc.values.push(ValueDesc::scalar(name, value_type));
    }
    let mut records = Vec::new();
    let empty = Vec::new();
    let rows = body.get("data").and_then(Json::as_array).unwrap_or(&empty);
    for row in rows {
        let stamp = row
            .get("time")
            .and_then(Json::as_str)
            .and_then(parse_api_time)
            .unwrap_or_else(Stamp::now);
        let record_no = row.get("no").and_then(Json::as_u64).unwrap_or(0) as u32;
        let mut record = Record::new(desc.clone(), stamp, record_no);
        let vals = row.get("vals").and_then(Json::as_array).unwrap_or(&empty);
        for (index, value) in vals.iter().enumerate() {
            let value_type = desc
                .values
                .get(index)
                .map_or(ValueType::Float8, |slot| slot.value_type);
            record.values.push(json_value(value, value_type));
        }
        records.push(record);
    }
    Some((desc, records))
}

fn json_value(value: &Json, value_type: ValueType) -> Value {
    match value_type {
        ValueType::Bool => Value::Bool(value.as_bool().unwrap_or(false)),
        ValueType::Int8 => Value::Int8(value.as_i64().unwrap_or(0)),
        ValueType::Ascii => Value::Ascii(value.as_str().unwrap_or("").to_string()),
        ValueType::Stamp => Value::Stamp(
            value
                .as_str()
                .and_then(parse_api_time)
                .map_or(0, Stamp::nanos),
        ),
        _ => Value::Float8(value.as_f64().unwrap_or(f64::NAN)),
    }
}

fn parse_api_time(text: &str) -> Option<Stamp> {
    let cleaned = text.replace('T', " ");
    let parsed = chrono::NaiveDateTime::parse_from_str(&cleaned, "%Y-%m-%d %H:%M:%S%.f").ok()?;
    Some(Stamp::from_utc(chrono::TimeZone::from_utc_datetime(
        &chrono::Utc,
        &parsed,
    )))
}

fn parse_logger_time(body: &Json) -> Option<Stamp> {
    body.get("time").and_then(Json::as_str).and_then(parse_api_time)
}

fn parse_file_list(body: &Json) -> Vec<FileInfo> {
    body.get("files")
        .and_then(Json::as_array)
        .map(|files| {
            files
                .iter()
                .filter_map(|entry| {
                    Some(FileInfo {
                        name: entry.get("name")?.as_str()?.to_string(),
                        size: entry.get("size").and_then(Json::as_u64).unwrap_or(0),
                        modified: entry
                            .get("modified")
                            .and_then(Json::as_str)
                            .and_then(parse_api_time),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

fn parse_symbols(body: &Json) -> Vec<SymbolSeed> {
    body.get("symbols")
        .and_then(Json::as_array)
        .map(|symbols| {
            symbols
                .iter()
                .filter_map(|entry| {
                    let name = entry.get("name")?.as_str()?;
                    let kind = entry.get("type").and_then(Json::as_str).unwrap_or("scalar");
                    Some(match kind {
                        "station" => SymbolSeed::branch(name, SymbolType::Station),
                        "table" => SymbolSeed::branch(name, SymbolType::Table),
                        "array" => SymbolSeed::branch(name, SymbolType::Array),
                        _ => SymbolSeed::leaf(name, SymbolType::Scalar, ValueType::Float8),
                    })
                })
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn data_query_parses_head_and_rows() {
        let body = json!({
            "head": {
                "fields": [
                    {"name": "temp", "type": "xsd:double"},
                    {"name": "label", "type": "xsd:string"}
                ]
            },
            "data": [
                {"time": "2020-03-14T09:25:00", "no": 7, "vals": [21.5, "ok"]},
                {"time": "2020-03-14T09:30:00", "no": 8, "vals": [21.9, "ok"]}
            ]
        });
        let (desc, records) = parse_data_query("stn.tbl", &body).unwrap();
        assert_eq!(desc.station, "stn");
        assert_eq!(desc.values.len(), 2);
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].record_no, 7);
        assert_eq!(records[0].value_by_name("temp"), Some(&Value::Float8(21.5)));
        assert_eq!(
            records[1].value_by_name("label"),
            Some(&Value::Ascii("ok".to_string()))
        );
    }

    #[test]
    fn query_modes_follow_start_options() {
        use super::super::request::{request_handle, Request};
        let newest = request_handle(Request::new(SourceUri::new("s:a.b.c")));
        newest.lock().unwrap().set_start_at_newest();
        assert_eq!(query_mode_for(&[newest]), "mode=most-recent&p1=1");

        let backfill = request_handle(Request::new(SourceUri::new("s:a.b.c")));
        backfill
            .lock()
            .unwrap()
            .set_start_relative_to_newest(60 * crate::stamp::NSEC_PER_SEC);
        assert_eq!(query_mode_for(&[backfill]), "mode=backfill&p1=60");

        let offset = request_handle(Request::new(SourceUri::new("s:a.b.c")));
        offset.lock().unwrap().set_start_at_offset_from_newest(4);
        assert_eq!(query_mode_for(&[offset]), "mode=most-recent&p1=5");
    }

    #[test]
    fn file_list_and_symbols_parse() {
        let body = json!({
            "files": [{"name": "CPU:prog.cr1", "size": 1024}],
            "symbols": [
                {"name": "Public", "type": "table"},
                {"name": "temp", "type": "scalar"}
            ]
        });
        let files = parse_file_list(&body);
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].name, "CPU:prog.cr1");
        let symbols = parse_symbols(&body);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].symbol_type, SymbolType::Table);
    }

    #[test]
    fn logger_time_parses() {
        let body = json!({"time": "2020-03-14T09:25:01.5"});
        let time = parse_logger_time(&body).unwrap();
        assert_eq!(
            time,
            Stamp::from_ymd_hms(2020, 3, 14, 9, 25, 1).unwrap() + 500 * NSEC_PER_MSEC
        );
    }
}

//! The data-file source: a table backed by a delimited text file.
//!
//! The file is the four-header-line delimited format dataloggers and
//! collection servers write: an environment line naming the station
//! and table, a field-name line, a units line and a process line,
//! followed by one record per row (`"timestamp",record_no,values…`).
//! A poll schedule re-reads rows appended since the last pass.

use super::record::{Record, RecordDesc, Value, ValueDesc, ValueType};
use super::request::{RequestHandle, SinkFailure, StartOption};
use super::settings::SourceSettings;
use super::sink::DisconnectReason;
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::stamp::Stamp;
use chrono::NaiveDateTime;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};

/// Splits one line of quoted CSV.
fn split_csv(line: &str) -> Vec<String> {
    let mut fields = Vec::new();
    let mut field = String::new();
    let mut in_quotes = false;
    for ch in line.chars() {
        match ch {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => fields.push(std::mem::take(&mut field)),
            other => field.push(other),
        }
    }
    fields.push(field);
    fields
}

fn parse_stamp(text: &str) -> Option<Stamp> {
    let trimmed = text.trim();
    let parsed = NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M"))
        .ok()?;
    Some(Stamp::from_utc(chrono::TimeZone::from_utc_datetime(&chrono::Utc, &parsed)))
}

fn parse_value(text: &str) -> Value {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("nan") {
        return Value::Float8(f64::NAN);
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return Value::Int8(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        return Value::Float8(value);
    }
    Value::Ascii(trimmed.to_string())
}

/// A parsed data file: its description and every record.
pub struct DataFile {
    pub desc: RecordDesc,
    pub records: Vec<Record>,
}

/// Parses the whole file content.
pub fn parse_data_file(content: &str) -> Option<DataFile> {
    let mut lines = content.lines();
    let environment = split_csv(lines.next()?);
    let station = environment.get(1).cloned().unwrap_or_default();
    let table = environment.last().cloned().unwrap_or_default();
    let field_names = split_csv(lines.next()?);
    // Units and process lines carry presentation detail only.
    let _units = lines.next()?;
    let _process = lines.next()?;

    let mut desc = RecordDesc::new(&station, &table);
    for name in field_names.iter().skip(2) {
        desc.values.push(ValueDesc::scalar(name, ValueType::Float8));
    }
    let mut records = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let fields = split_csv(line);
        if fields.len() < 2 {
            continue;
        }
        let Some(stamp) = parse_stamp(&fields[0]) else {
            continue;
        };
        let record_no: u32 = fields[1].trim().parse().unwrap_or(0);
        let mut record = Record::new(desc.clone(), stamp, record_no);
        record.values = fields[2..].iter().map(|field| parse_value(field)).collect();
        records.push(record);
    }
    Some(DataFile { desc, records })
}

/// File-backed table source.
pub struct FileSource {
    name: String,
    events: SourceEventSender,
    path: PathBuf,
    poll_interval_ms: u32,
    connected: bool,
    queued: Vec<RequestHandle>,
    active: Arc<std::sync::Mutex<Vec<RequestHandle>>>,
    /// Records already delivered, by record number high-water mark.
    delivered_through: Arc<std::sync::Mutex<Option<u32>>>,
    polling: bool,
}

impl FileSource {
    #[must_use]
    pub fn new(name: &str, events: SourceEventSender, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.to_string(),
            events,
            path: path.into(),
            poll_interval_ms: 0,
            connected: false,
            queued: Vec::new(),
            active: Arc::new(std::sync::Mutex::new(Vec::new())),
            delivered_through: Arc::new(std::sync::Mutex::new(None)),
            polling: false,
        }
    }

    /// Applies persisted properties: the file name and poll cadence.
    pub fn apply_settings(&mut self, settings: &SourceSettings) {
        if let Some(file_name) = &settings.file_name {
            self.path = PathBuf::from(file_name);
        }
        if let Some(interval) = settings.poll_schedule_interval {
            self.poll_interval_ms = interval;
        }
    }

    fn read_file(&self) -> Option<DataFile> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => parse_data_file(&content),
            Err(error) => {
                warn!(%error, path = %self.path.display(), "data file unreadable");
                None
            }
        }
    }

    fn deliver_new_records(
        events: &SourceEventSender,
        active: &Arc<std::sync::Mutex<Vec<RequestHandle>>>,
        delivered_through: &Arc<std::sync::Mutex<Option<u32>>>,
        parsed: &DataFile,
    ) {
        let requests = active.lock().expect("file source poisoned").clone();
        if requests.is_empty() {
            return;
        }
        let mut mark = delivered_through.lock().expect("file source poisoned");
        let fresh: Vec<Record> = parsed
            .records
            .iter()
            .filter(|record| mark.map_or(true, |high| record.record_no > high))
            .cloned()
            .collect();
        if fresh.is_empty() {
            return;
        }
        *mark = fresh.iter().map(|record| record.record_no).max().or(*mark);
        let _ = events.send(SourceEvent::Records {
            requests,
            records: fresh,
        });
    }
}

impl DataSource for FileSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn connect(&mut self) {
        if self.connected {
            return;
        }
        let _ = self.events.send(SourceEvent::Connecting {
            source: self.name.clone(),
        });
        if self.read_file().is_none() {
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::BadProperties,
            });
            return;
        }
        self.connected = true;
        let _ = self.events.send(SourceEvent::Connected {
            source: self.name.clone(),
        });
        debug!(name = self.name, path = %self.path.display(), "file source connected");
        if self.poll_interval_ms > 0 && !self.polling {
            self.polling = true;
            let events = self.events.clone();
            let active = self.active.clone();
            let delivered = self.delivered_through.clone();
            let path = self.path.clone();
            let interval = self.poll_interval_ms;
            tokio::spawn(async move {
                let mut ticker =
                    tokio::time::interval(tokio::time::Duration::from_millis(u64::from(interval)));
                ticker.tick().await;
                loop {
                    ticker.tick().await;
                    if Arc::strong_count(&active) == 1 {
                        return;
                    }
                    let Ok(content) = std::fs::read_to_string(&path) else {
                        continue;
                    };
                    if let Some(parsed) = parse_data_file(&content) {
                        FileSource::deliver_new_records(&events, &active, &delivered, &parsed);
                    }
                }
            });
        }
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            let _ = self.events.send(SourceEvent::Disconnected {
                source: self.name.clone(),
                reason: DisconnectReason::ByApplication,
            });
        }
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn add_request(&mut self, request: RequestHandle) {
        self.queued.push(request);
    }

    fn activate_requests(&mut self) {
        let Some(parsed) = self.read_file() else {
            for request in self.queued.drain(..) {
                let _ = self.events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::ConnectionFailed,
                });
            }
            return;
        };
        let queued = std::mem::take(&mut self.queued);
        let mut started = Vec::new();
        for request in queued {
            let valid = {
                let held = request.lock().expect("request poisoned");
                match held.uri().column() {
                    Some(column) => parsed.desc.find_value(&column).is_some(),
                    None => true,
                }
            };
            if !valid {
                let _ = self.events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::InvalidColumn,
                });
                continue;
            }
            let schema = Record::new(parsed.desc.clone(), Stamp::now(), 0);
            request
                .lock()
                .expect("request poisoned")
                .set_description(schema.clone());
            let _ = self.events.send(SourceEvent::RequestReady {
                request: request.clone(),
                record: schema,
            });
            started.push(request);
        }
        if started.is_empty() {
            return;
        }
        // Start options bound what history the first delivery carries.
        let start_all: Vec<Record> = parsed.records.clone();
        let selected: Vec<Record> = {
            let newest_first = start_all.last().cloned();
            let sample_start = started[0].lock().expect("request poisoned").start_option();
            match sample_start {
                StartOption::AtNewest => newest_first.into_iter().collect(),
                StartOption::AfterNewest => Vec::new(),
                StartOption::AtTime | StartOption::DateRange => {
                    let (begin, end) = {
                        let held = started[0].lock().expect("request poisoned");
                        (held.start_time(), held.end_time())
                    };
                    start_all
                        .into_iter()
                        .filter(|record| {
                            record.stamp >= begin
                                && (sample_start != StartOption::DateRange || record.stamp <= end)
                        })
                        .collect()
                }
                StartOption::RelativeToNewest => {
                    let backfill = started[0].lock().expect("request poisoned").backfill_interval();
                    let newest = start_all.last().map(|record| record.stamp);
                    match newest {
                        Some(newest) => start_all
                            .into_iter()
                            .filter(|record| newest - record.stamp <= backfill)
                            .collect(),
                        None => Vec::new(),
                    }
                }
                StartOption::AtOffsetFromNewest => {
                    let offset = started[0]
                        .lock()
                        .expect("request poisoned")
                        .start_record_offset() as usize;
                    let skip = start_all.len().saturating_sub(offset + 1);
                    start_all.into_iter().skip(skip).collect()
                }
                StartOption::AtRecord => {
                    let record_no = started[0].lock().expect("request poisoned").record_no();
                    start_all
                        .into_iter()
                        .filter(|record| record.record_no >= record_no)
                        .collect()
                }
            }
        };
        {
            let mut mark = self.delivered_through.lock().expect("file source poisoned");
            *mark = parsed.records.iter().map(|record| record.record_no).max();
        }
        {
            let mut active = self.active.lock().expect("file source poisoned");
            active.extend(started.iter().cloned());
        }
        if !selected.is_empty() {
            let _ = self.events.send(SourceEvent::Records {
                requests: started,
                records: selected,
            });
        }
    }

    fn remove_request(&mut self, request: &RequestHandle) {
        self.queued.retain(|held| !Arc::ptr_eq(held, request));
        self.active
            .lock()
            .expect("file source poisoned")
            .retain(|held| !Arc::ptr_eq(held, request));
    }

    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        let Some(parsed) = self.read_file() else {
            return false;
        };
        let symbols = if uri.is_source_only() {
            vec![SymbolSeed::branch(&parsed.desc.station, SymbolType::Station)]
        } else if uri.table().is_none() {
            vec![SymbolSeed::branch(&parsed.desc.table, SymbolType::Table)]
        } else {
            parsed
                .desc
                .values
                .iter()
                .map(|value| SymbolSeed::leaf(&value.name, SymbolType::Scalar, value.value_type))
                .collect()
        };
        let _ = self.events.send(SourceEvent::Symbols {
            source: self.name.clone(),
            parent: uri.as_str().to_string(),
            symbols,
        });
        true
    }
}

#[cfg(test)]
mod tests {
    use super::super::request::{request_handle, Request};
    use super::*;
    use std::io::Write;

    const SAMPLE: &str = "\"TOA5\",\"stn\",\"CR1000\",\"1234\",\"os\",\"prog\",\"sig\",\"tbl\"\n\
\"TIMESTAMP\",\"RECORD\",\"temp\",\"rh\"\n\
\"TS\",\"RN\",\"degC\",\"%\"\n\
\"\",\"\",\"Avg\",\"Smp\"\n\
\"2020-03-14 09:25:00\",1,21.5,45\n\
\"2020-03-14 09:30:00\",2,21.7,44\n\
\"2020-03-14 09:35:00\",3,21.9,43\n";

    #[test]
    fn parses_header_and_rows() {
        let parsed = parse_data_file(SAMPLE).unwrap();
        assert_eq!(parsed.desc.station, "stn");
        assert_eq!(parsed.desc.table, "tbl");
        assert_eq!(parsed.desc.values.len(), 2);
        assert_eq!(parsed.records.len(), 3);
        assert_eq!(parsed.records[0].record_no, 1);
        assert_eq!(parsed.records[2].value_by_name("rh"), Some(&Value::Int8(43)));
    }

    #[test]
    fn quoted_commas_stay_in_one_field() {
        let fields = split_csv("\"a,b\",2,\"c\"");
        assert_eq!(fields, vec!["a,b", "2", "c"]);
    }

    fn write_sample() -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.dat");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        (dir, path)
    }

    #[tokio::test]
    async fn activation_honours_start_at_newest() {
        let (_dir, path) = write_sample();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut source = FileSource::new("df", tx, &path);
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("df:stn.tbl.temp")));
        request.lock().unwrap().set_start_at_newest();
        source.add_request(request);
        source.activate_requests();
        let mut delivered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Records { records, .. } = event {
                delivered.extend(records);
            }
        }
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].record_no, 3);
    }

    #[tokio::test]
    async fn at_offset_from_newest_backfills() {
        let (_dir, path) = write_sample();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut source = FileSource::new("df", tx, &path);
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("df:stn.tbl.temp")));
        request.lock().unwrap().set_start_at_offset_from_newest(1);
        source.add_request(request);
        source.activate_requests();
        let mut delivered = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Records { records, .. } = event {
                delivered.extend(records);
            }
        }
        assert_eq!(delivered.len(), 2);
        assert_eq!(delivered[0].record_no, 2);
    }

    #[tokio::test]
    async fn missing_column_fails() {
        let (_dir, path) = write_sample();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut source = FileSource::new("df", tx, &path);
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("df:stn.tbl.nosuch")));
        source.add_request(request);
        source.activate_requests();
        let mut failed = false;
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::RequestFailed { failure, .. } = event {
                failed = true;
                assert_eq!(failure, SinkFailure::InvalidColumn);
            }
        }
        assert!(failed);
    }
}

//! The virtual source: constants-backed synthetic data.
//!
//! A virtual source holds named values that applications can set
//! directly. Requests against it deliver one synthetic station/table
//! whose record is recomputed on demand and, when a refresh interval
//! is configured, on a schedule.

use super::record::{Record, RecordDesc, Value, ValueDesc};
use super::request::{RequestHandle, SinkFailure};
use super::settings::SourceSettings;
use super::sink::{DisconnectReason, OpId, Outcome};
use super::symbol::{SymbolSeed, SymbolType};
use super::uri::SourceUri;
use super::{DataSource, SourceEvent, SourceEventSender};
use crate::stamp::Stamp;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use tokio::time::Duration;
use tracing::debug;

/// The station and table name every virtual source exposes.
pub const STATION: &str = "station";
pub const TABLE: &str = "values";

struct Shared {
    values: BTreeMap<String, Value>,
    active: Vec<RequestHandle>,
    record_no: u32,
}

/// Constants-backed synthetic source.
pub struct VirtualSource {
    name: String,
    events: SourceEventSender,
    connected: bool,
    queued: Vec<RequestHandle>,
    shared: Arc<Mutex<Shared>>,
    refresh_interval_ms: Option<u32>,
    refresh_running: bool,
}

impl VirtualSource {
    #[must_use]
    pub fn new(name: &str, events: SourceEventSender) -> Self {
        Self {
            name: name.to_string(),
            events,
            connected: false,
            queued: Vec::new(),
            shared: Arc::new(Mutex::new(Shared {
                values: BTreeMap::new(),
                active: Vec::new(),
                record_no: 0,
            })),
            refresh_interval_ms: None,
            refresh_running: false,
        }
    }

    /// Applies persisted properties; only the refresh cadence is
    /// meaningful for this source kind.
    pub fn apply_settings(&mut self, settings: &SourceSettings) {
        self.refresh_interval_ms = settings.refresh_interval;
    }

    /// Defines or replaces a named value.
    pub fn define_value(&mut self, name: &str, value: Value) {
        let mut shared = self.shared.lock().expect("virtual source poisoned");
        shared.values.insert(name.to_string(), value);
    }

    /// Recomputes the synthetic record and delivers it to every active
    /// request.
    pub fn refresh(&mut self) {
        refresh_shared(&self.shared, &self.events);
    }

    fn current_record(shared: &mut Shared) -> Record {
        let mut desc = RecordDesc::new(STATION, TABLE);
        for (value_name, value) in &shared.values {
            desc.values.push(ValueDesc::scalar(value_name, value.value_type()));
        }
        shared.record_no += 1;
        let record_no = shared.record_no;
        let mut record = Record::new(desc, Stamp::now(), record_no);
        record.values = shared.values.values().cloned().collect();
        record
    }
}

fn refresh_shared(shared: &Arc<Mutex<Shared>>, events: &SourceEventSender) {
    let mut shared = shared.lock().expect("virtual source poisoned");
    if shared.active.is_empty() {
        return;
    }
    let record = VirtualSource::current_record(&mut shared);
    let _ = events.send(SourceEvent::Records {
        requests: shared.active.clone(),
        records: vec![record],
    });
}

impl DataSource for VirtualSource {
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
        self.connected = true;
        let _ = self.events.send(SourceEvent::Connected {
            source: self.name.clone(),
        });
        if let Some(interval) = self.refresh_interval_ms {
            if !self.refresh_running && interval > 0 {
                self.refresh_running = true;
                let shared = self.shared.clone();
                let events = self.events.clone();
                tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(Duration::from_millis(u64::from(interval)));
                    ticker.tick().await;
                    loop {
                        ticker.tick().await;
                        if Arc::strong_count(&shared) == 1 {
                            return;
                        }
                        refresh_shared(&shared, &events);
                    }
                });
            }
        }
        debug!(name = self.name, "virtual source connected");
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
        let queued = std::mem::take(&mut self.queued);
        let mut shared = self.shared.lock().expect("virtual source poisoned");
        for request in queued {
            let known = {
                let held = request.lock().expect("request poisoned");
                match held.uri().column() {
                    Some(column) => shared.values.contains_key(&column),
                    // A table-level request takes the whole record.
                    None => true,
                }
            };
            if !known {
                let _ = self.events.send(SourceEvent::RequestFailed {
                    request,
                    failure: SinkFailure::InvalidColumn,
                });
                continue;
            }
            let record = Self::current_record(&mut shared);
            request
                .lock()
                .expect("request poisoned")
                .set_description(record.clone());
            let _ = self.events.send(SourceEvent::RequestReady {
                request: request.clone(),
                record: record.clone(),
            });
            let _ = self.events.send(SourceEvent::Records {
                requests: vec![request.clone()],
                records: vec![record],
            });
            shared.active.push(request);
        }
    }

    fn remove_request(&mut self, request: &RequestHandle) {
        self.queued.retain(|held| !Arc::ptr_eq(held, request));
        let mut shared = self.shared.lock().expect("virtual source poisoned");
        shared.active.retain(|held| !Arc::ptr_eq(held, request));
    }

    fn start_set_value(&mut self, op: OpId, uri: &SourceUri, value: Value) -> bool {
        let Some(column) = uri.column() else {
            let _ = self.events.send(SourceEvent::SetComplete {
                op,
                uri: uri.clone(),
                outcome: Outcome::InvalidUri,
            });
            return true;
        };
        {
            let mut shared = self.shared.lock().expect("virtual source poisoned");
            shared.values.insert(column, value);
        }
        let _ = self.events.send(SourceEvent::SetComplete {
            op,
            uri: uri.clone(),
            outcome: Outcome::Success,
        });
        // A set is immediately visible to active requests.
        self.refresh();
        true
    }

    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        let shared = self.shared.lock().expect("virtual source poisoned");
        let symbols = if uri.is_source_only() {
            vec![SymbolSeed::branch(STATION, SymbolType::Station)]
        } else if uri.table().is_none() {
            vec![SymbolSeed::branch(TABLE, SymbolType::Table)]
        } else {
            shared
                .values
                .iter()
                .map(|(name, value)| SymbolSeed::leaf(name, SymbolType::Scalar, value.value_type()))
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
    use tokio::sync::mpsc;

    fn source_with_channel() -> (VirtualSource, mpsc::UnboundedReceiver<SourceEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut source = VirtualSource::new("vs", tx);
        source.define_value("temp", Value::Float8(21.5));
        source.define_value("count", Value::Int4(2));
        (source, rx)
    }

    #[test]
    fn activation_delivers_schema_then_records() {
        let (mut source, mut rx) = source_with_channel();
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("vs:station.values.temp")));
        source.add_request(request.clone());
        source.activate_requests();
        // Skip the connect events.
        let mut ready = false;
        let mut records = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SourceEvent::RequestReady { record, .. } => {
                    ready = true;
                    assert_eq!(record.desc.station, STATION);
                    assert!(record.desc.find_value("temp").is_some());
                }
                SourceEvent::Records { records: batch, .. } => {
                    records = true;
                    assert_eq!(batch.len(), 1);
                }
                _ => {}
            }
        }
        assert!(ready && records);
        let (begin, end) = request.lock().unwrap().value_indices();
        assert_eq!(end - begin, 1);
    }

    #[test]
    fn unknown_column_fails_the_request() {
        let (mut source, mut rx) = source_with_channel();
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("vs:station.values.missing")));
        source.add_request(request);
        source.activate_requests();
        let mut failure = None;
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::RequestFailed { failure: got, .. } = event {
                failure = Some(got);
            }
        }
        assert_eq!(failure, Some(SinkFailure::InvalidColumn));
    }

    #[test]
    fn set_value_updates_and_redelivers() {
        let (mut source, mut rx) = source_with_channel();
        source.connect();
        let request = request_handle(Request::new(SourceUri::new("vs:station.values.temp")));
        source.add_request(request);
        source.activate_requests();
        while rx.try_recv().is_ok() {}
        assert!(source.start_set_value(1, &SourceUri::new("vs:station.values.temp"), Value::Float8(-4.0)));
        let mut outcome = None;
        let mut redelivered = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                SourceEvent::SetComplete { outcome: got, .. } => outcome = Some(got),
                SourceEvent::Records { records, .. } => {
                    redelivered = true;
                    assert_eq!(records[0].value_by_name("temp"), Some(&Value::Float8(-4.0)));
                }
                _ => {}
            }
        }
        assert_eq!(outcome, Some(Outcome::Success));
        assert!(redelivered);
    }

    #[test]
    fn symbol_expansion_walks_the_synthetic_tree() {
        let (mut source, mut rx) = source_with_channel();
        assert!(source.start_symbol_expansion(&SourceUri::new("vs")));
        assert!(source.start_symbol_expansion(&SourceUri::new("vs:station.values")));
        let mut seen = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let SourceEvent::Symbols { symbols, .. } = event {
                seen.push(symbols);
            }
        }
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0][0].symbol_type, SymbolType::Station);
        assert!(seen[1].iter().any(|seed| seed.name == "temp"));
    }
}

//! The data source manager: a uniform, URI-addressed façade over every
//! way this crate can reach telemetry.
//!
//! Applications add named sources, register requests with a sink, and
//! drive the manager's event pump. Sources run their transports on
//! background tasks and report everything through the manager's event
//! channel; sinks and manager clients are called back on the pump
//! thread and may re-enter the manager.

pub mod bmp5;
pub mod database;
pub mod file;
pub mod http_source;
pub mod lgrnet;
pub mod record;
pub mod request;
pub mod settings;
pub mod sink;
pub mod symbol;
pub mod uri;
pub mod virtual_source;

pub use record::{Record, RecordDesc, Value, ValueDesc, ValueType};
pub use request::{OrderOption, Request, RequestHandle, RequestState, SinkFailure, StartOption};
pub use sink::{
    DisconnectReason, FileInfo, ManagerClient, ManagerClientRef, ManagerSupervisor, OpId, Outcome,
    SinkBase, SinkRef,
};
pub use uri::{SourceUri, UriPart, UriPartKind};

use crate::stamp::Stamp;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use symbol::SymbolSeed;
use tokio::sync::mpsc;
use tracing::debug;

/// Everything a source reports back to the manager.
#[derive(Debug)]
pub enum SourceEvent {
    Connecting {
        source: String,
    },
    Connected {
        source: String,
    },
    Disconnected {
        source: String,
        reason: DisconnectReason,
    },
    /// The schema for a request is known.
    RequestReady {
        request: RequestHandle,
        record: Record,
    },
    /// A request failed terminally.
    RequestFailed {
        request: RequestHandle,
        failure: SinkFailure,
    },
    /// A record batch shared by co-scheduled requests.
    Records {
        requests: Vec<RequestHandle>,
        records: Vec<Record>,
    },
    SetComplete {
        op: OpId,
        uri: SourceUri,
        outcome: Outcome,
    },
    FileComplete {
        op: OpId,
        outcome: Outcome,
    },
    ListFilesComplete {
        op: OpId,
        outcome: Outcome,
        files: Vec<FileInfo>,
    },
    ClockComplete {
        op: OpId,
        outcome: Outcome,
        logger_time: Option<Stamp>,
    },
    TerminalData {
        token: i64,
        bytes: Vec<u8>,
    },
    TerminalClosed {
        token: i64,
    },
    /// A symbol expansion produced children for a parent URI.
    Symbols {
        source: String,
        parent: String,
        symbols: Vec<SymbolSeed>,
    },
    /// The source learned its peer's current time.
    SourceTime {
        source: String,
        time: Stamp,
    },
}

/// Sending half of the manager's event channel; sources hold clones.
pub type SourceEventSender = mpsc::UnboundedSender<SourceEvent>;

/// The uniform source contract.
///
/// Operations a source kind cannot perform return false from their
/// `start_*` method and the manager reports an unsupported outcome.
pub trait DataSource {
    fn name(&self) -> &str;

    /// Begins connecting; progress arrives as source events. Calling
    /// this on a connected source is a no-op.
    fn connect(&mut self);

    /// Disconnects; idempotent.
    fn disconnect(&mut self);

    fn is_connected(&self) -> bool;

    /// The source's view of its peer's current time.
    fn source_time(&self) -> Stamp {
        Stamp::now()
    }

    /// Queues a request. The manager calls `activate_requests` when a
    /// batch is complete.
    fn add_request(&mut self, request: RequestHandle);

    /// Starts every queued request.
    fn activate_requests(&mut self);

    /// Cancels a request; idempotent. No sink callback follows.
    fn remove_request(&mut self, request: &RequestHandle);

    fn start_set_value(&mut self, op: OpId, uri: &SourceUri, value: Value) -> bool {
        let _ = (op, uri, value);
        false
    }

    fn start_send_file(&mut self, op: OpId, uri: &SourceUri, file_name: &str, content: Vec<u8>) -> bool {
        let _ = (op, uri, file_name, content);
        false
    }

    fn start_get_newest_file(&mut self, op: OpId, uri: &SourceUri, pattern: &str) -> bool {
        let _ = (op, uri, pattern);
        false
    }

    /// Checks (and optionally sets) the peer's clock.
    fn start_clock_check(&mut self, op: OpId, uri: &SourceUri, should_set: bool) -> bool {
        let _ = (op, uri, should_set);
        false
    }

    fn start_file_control(&mut self, op: OpId, uri: &SourceUri, command: u32, file_name: &str) -> bool {
        let _ = (op, uri, command, file_name);
        false
    }

    fn start_list_files(&mut self, op: OpId, uri: &SourceUri, pattern: &str) -> bool {
        let _ = (op, uri, pattern);
        false
    }

    fn start_terminal(&mut self, token: i64, uri: &SourceUri) -> bool {
        let _ = (token, uri);
        false
    }

    fn send_terminal(&mut self, token: i64, bytes: &[u8]) {
        let _ = (token, bytes);
    }

    fn close_terminal(&mut self, token: i64) {
        let _ = token;
    }

    /// Starts whatever enumeration traffic fills in the children of a
    /// symbol; results arrive as [`SourceEvent::Symbols`].
    fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        let _ = uri;
        false
    }
}

enum PendingOp {
    Set { sink: SinkRef, uri: SourceUri },
    File { sink: SinkRef },
    ListFiles { sink: SinkRef },
    Clock { sink: SinkRef },
}

/// The data source manager.
pub struct Manager {
    sources: Vec<Box<dyn DataSource>>,
    clients: Vec<ManagerClientRef>,
    supervisor: Option<Box<dyn ManagerSupervisor>>,
    requests: Vec<(RequestHandle, SinkRef)>,
    pending_batch: Vec<String>,
    pending_ops: HashMap<OpId, PendingOp>,
    terminals: HashMap<i64, SinkRef>,
    symbol_listeners: Vec<mpsc::UnboundedSender<SourceEvent>>,
    next_op: OpId,
    event_tx: SourceEventSender,
    event_rx: mpsc::UnboundedReceiver<SourceEvent>,
}

impl Manager {
    #[must_use]
    pub fn new() -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        Self {
            sources: Vec::new(),
            clients: Vec::new(),
            supervisor: None,
            requests: Vec::new(),
            pending_batch: Vec::new(),
            pending_ops: HashMap::new(),
            terminals: HashMap::new(),
            symbol_listeners: Vec::new(),
            next_op: 0,
            event_tx,
            event_rx,
        }
    }

    /// The channel sources report through; hand a clone to every
    /// source at construction.
    #[must_use]
    pub fn event_sender(&self) -> SourceEventSender {
        self.event_tx.clone()
    }

    /// Installs the supervisor hook.
    pub fn set_supervisor(&mut self, supervisor: Box<dyn ManagerSupervisor>) {
        self.supervisor = Some(supervisor);
    }

    /// Registers a lifecycle client.
    pub fn add_client(&mut self, client: ManagerClientRef) {
        self.clients.push(client);
    }

    /// Registers a listener for symbol enumeration events (the symbol
    /// browser).
    pub fn add_symbol_listener(&mut self, listener: mpsc::UnboundedSender<SourceEvent>) {
        self.symbol_listeners.push(listener);
    }

    /// Adds a source. Source names are unique; a duplicate replaces
    /// the old source.
    pub fn add_source(&mut self, source: Box<dyn DataSource>) {
        let name = source.name().to_string();
        self.sources.retain(|existing| existing.name() != name);
        self.sources.push(source);
        for client in self.clients.clone() {
            client.borrow_mut().on_source_added(self, &name);
        }
        debug!(name, "source added");
    }

    /// Removes a source, cancelling its requests without failing them.
    pub fn remove_source(&mut self, name: &str) {
        let mut removed = false;
        self.sources.retain(|source| {
            let matches = source.name() == name;
            removed |= matches;
            !matches
        });
        if removed {
            self.requests
                .retain(|(request, _)| request.lock().expect("request poisoned").uri().source_name() != name);
            for client in self.clients.clone() {
                client.borrow_mut().on_source_removed(self, name);
            }
        }
    }

    /// Names of the sources currently held.
    #[must_use]
    pub fn source_names(&self) -> Vec<String> {
        self.sources.iter().map(|source| source.name().to_string()).collect()
    }

    /// True when the named source exists and is connected.
    #[must_use]
    pub fn is_connected(&self, name: &str) -> bool {
        self.find(name).map(|source| source.is_connected()).unwrap_or(false)
    }

    /// The named source's view of its peer's time.
    #[must_use]
    pub fn source_time(&self, name: &str) -> Option<Stamp> {
        self.find(name).map(|source| source.source_time())
    }

    /// Starts connecting a source; idempotent.
    pub fn connect_source(&mut self, name: &str) {
        if let Some(source) = self.find_mut(name) {
            source.connect();
        }
    }

    /// Disconnects a source; idempotent.
    pub fn disconnect_source(&mut self, name: &str) {
        if let Some(source) = self.find_mut(name) {
            source.disconnect();
        }
    }

    /// Queues a request for the source its URI names. With
    /// `more_to_follow` false the whole pending batch activates.
    pub fn add_request(&mut self, sink: SinkRef, request: RequestHandle, more_to_follow: bool) {
        if let Some(supervisor) = &mut self.supervisor {
            supervisor.on_request_added(&request);
        }
        let source_name = {
            let request = request.lock().expect("request poisoned");
            request.uri().source_name().to_string()
        };
        if self.find(&source_name).is_none() {
            let sink_for_failure = sink.clone();
            sink_for_failure
                .borrow_mut()
                .on_sink_failure(self, &request, SinkFailure::InvalidSource);
            return;
        }
        self.requests.push((request.clone(), sink));
        if let Some(source) = self.find_mut(&source_name) {
            source.add_request(request);
        }
        if !self.pending_batch.contains(&source_name) {
            self.pending_batch.push(source_name);
        }
        if !more_to_follow {
            let batch = std::mem::take(&mut self.pending_batch);
            for name in batch {
                if let Some(source) = self.find_mut(&name) {
                    source.activate_requests();
                }
            }
        }
    }

    /// Cancels a request. Synchronously removes the association so no
    /// further sink callback can fire for it.
    pub fn remove_request(&mut self, request: &RequestHandle) {
        let before = self.requests.len();
        self.requests.retain(|(held, _)| !Arc::ptr_eq(held, request));
        if before != self.requests.len() {
            request.lock().expect("request poisoned").set_state(RequestState::Removed);
            let source_name = {
                let request = request.lock().expect("request poisoned");
                request.uri().source_name().to_string()
            };
            if let Some(source) = self.find_mut(&source_name) {
                source.remove_request(request);
            }
        }
    }

    /// Number of live request associations.
    #[must_use]
    pub fn request_count(&self) -> usize {
        self.requests.len()
    }

    /// Starts a set-value operation. Returns false when the source
    /// does not exist or cannot set values.
    pub fn set_value(&mut self, sink: SinkRef, uri: &SourceUri, value: Value) -> bool {
        let op = self.allocate_op();
        let source_name = uri.source_name().to_string();
        let Some(source) = self.find_mut(&source_name) else {
            return false;
        };
        if source.start_set_value(op, uri, value) {
            self.pending_ops.insert(
                op,
                PendingOp::Set {
                    sink,
                    uri: uri.clone(),
                },
            );
            true
        } else {
            false
        }
    }

    /// Starts a file send toward a station.
    pub fn send_file(&mut self, sink: SinkRef, uri: &SourceUri, file_name: &str, content: Vec<u8>) -> Option<OpId> {
        let op = self.allocate_op();
        let source = self.find_mut(&uri.source_name().to_string())?;
        if !source.start_send_file(op, uri, file_name, content) {
            return None;
        }
        self.pending_ops.insert(op, PendingOp::File { sink });
        Some(op)
    }

    /// Starts retrieval of the newest file matching a pattern.
    pub fn get_newest_file(&mut self, sink: SinkRef, uri: &SourceUri, pattern: &str) -> Option<OpId> {
        let op = self.allocate_op();
        let source = self.find_mut(&uri.source_name().to_string())?;
        if !source.start_get_newest_file(op, uri, pattern) {
            return None;
        }
        self.pending_ops.insert(op, PendingOp::File { sink });
        Some(op)
    }

    /// Starts a clock check (or set) against a station.
    pub fn clock_check(&mut self, sink: SinkRef, uri: &SourceUri, should_set: bool) -> Option<OpId> {
        let op = self.allocate_op();
        let source = self.find_mut(&uri.source_name().to_string())?;
        if !source.start_clock_check(op, uri, should_set) {
            return None;
        }
        self.pending_ops.insert(op, PendingOp::Clock { sink });
        Some(op)
    }

    /// Starts a file-control command.
    pub fn file_control(&mut self, sink: SinkRef, uri: &SourceUri, command: u32, file_name: &str) -> Option<OpId> {
        let op = self.allocate_op();
        let source = self.find_mut(&uri.source_name().to_string())?;
        if !source.start_file_control(op, uri, command, file_name) {
            return None;
        }
        self.pending_ops.insert(op, PendingOp::File { sink });
        Some(op)
    }

    /// Starts a file listing.
    pub fn list_files(&mut self, sink: SinkRef, uri: &SourceUri, pattern: &str) -> Option<OpId> {
        let op = self.allocate_op();
        let source = self.find_mut(&uri.source_name().to_string())?;
        if !source.start_list_files(op, uri, pattern) {
            return None;
        }
        self.pending_ops.insert(op, PendingOp::ListFiles { sink });
        Some(op)
    }

    /// Opens a terminal stream keyed by the caller's token.
    pub fn start_terminal(&mut self, sink: SinkRef, uri: &SourceUri, token: i64) -> bool {
        let source_name = uri.source_name().to_string();
        let Some(source) = self.find_mut(&source_name) else {
            return false;
        };
        if source.start_terminal(token, uri) {
            self.terminals.insert(token, sink);
            true
        } else {
            false
        }
    }

    /// Sends bytes on an open terminal stream.
    pub fn send_terminal(&mut self, uri: &SourceUri, token: i64, bytes: &[u8]) {
        let source_name = uri.source_name().to_string();
        if let Some(source) = self.find_mut(&source_name) {
            source.send_terminal(token, bytes);
        }
    }

    /// Closes a terminal stream.
    pub fn close_terminal(&mut self, uri: &SourceUri, token: i64) {
        let source_name = uri.source_name().to_string();
        if let Some(source) = self.find_mut(&source_name) {
            source.close_terminal(token);
        }
        self.terminals.remove(&token);
    }

    /// Breaks a URI into its parts. Total: invalid URIs yield an empty
    /// vector.
    #[must_use]
    pub fn breakdown_uri(&self, uri: &str) -> Vec<UriPart> {
        SourceUri::new(uri).breakdown()
    }

    /// Asks the owning source to expand a symbol.
    pub fn start_symbol_expansion(&mut self, uri: &SourceUri) -> bool {
        let source_name = uri.source_name().to_string();
        match self.find_mut(&source_name) {
            Some(source) => source.start_symbol_expansion(uri),
            None => false,
        }
    }

    /// Drains and dispatches every queued source event. Returns the
    /// number handled.
    pub fn pump(&mut self) -> usize {
        let mut events = Vec::new();
        while let Ok(event) = self.event_rx.try_recv() {
            events.push(event);
        }
        let count = events.len();
        for event in events {
            self.dispatch(event);
        }
        count
    }

    /// Waits for one source event and dispatches it (plus anything
    /// else already queued).
    pub async fn tick(&mut self) {
        if let Some(event) = self.event_rx.recv().await {
            self.dispatch(event);
            self.pump();
        }
    }

    fn dispatch(&mut self, event: SourceEvent) {
        match event {
            SourceEvent::Connecting { source } => {
                for client in self.clients.clone() {
                    client.borrow_mut().on_source_connecting(self, &source);
                }
            }
            SourceEvent::Connected { source } => {
                for client in self.clients.clone() {
                    client.borrow_mut().on_source_connect(self, &source);
                }
                self.forward_to_symbol_listeners(SourceEvent::Connected { source });
            }
            SourceEvent::Disconnected { source, reason } => {
                // Outstanding requests are held against reconnection;
                // sinks see no intermediate notification.
                for (request, _) in &self.requests {
                    let mut request = request.lock().expect("request poisoned");
                    if request.uri().source_name() == source
                        && request.state() != RequestState::Failed
                    {
                        request.set_state(RequestState::Pending);
                    }
                }
                for client in self.clients.clone() {
                    client.borrow_mut().on_source_disconnect(self, &source, reason);
                }
                self.forward_to_symbol_listeners(SourceEvent::Disconnected { source, reason });
            }
            SourceEvent::RequestReady { request, record } => {
                let Some(sink) = self.sink_for(&request) else {
                    return;
                };
                request.lock().expect("request poisoned").set_state(RequestState::Started);
                sink.borrow_mut().on_sink_ready(self, &request, &record);
            }
            SourceEvent::RequestFailed { request, failure } => {
                let Some(sink) = self.sink_for(&request) else {
                    return;
                };
                request.lock().expect("request poisoned").set_state(RequestState::Failed);
                // Terminal: the association goes away before the sink
                // hears about it.
                self.requests.retain(|(held, _)| !Arc::ptr_eq(held, &request));
                sink.borrow_mut().on_sink_failure(self, &request, failure);
            }
            SourceEvent::Records { requests, records } => {
                if let Some(supervisor) = &mut self.supervisor {
                    supervisor.on_records(&requests, &records);
                }
                // Group the batch per sink, preserving request order.
                let mut groups: Vec<(SinkRef, Vec<RequestHandle>)> = Vec::new();
                for request in requests {
                    let Some(sink) = self.sink_for(&request) else {
                        continue;
                    };
                    request
                        .lock()
                        .expect("request poisoned")
                        .set_state(RequestState::ReceivedAdvise);
                    match groups.iter_mut().find(|(held, _)| Rc::ptr_eq(held, &sink)) {
                        Some((_, members)) => members.push(request),
                        None => groups.push((sink, vec![request])),
                    }
                }
                for (sink, members) in groups {
                    sink.borrow_mut().on_sink_records(self, &members, &records);
                }
            }
            SourceEvent::SetComplete { op, uri, outcome } => {
                if let Some(PendingOp::Set { sink, .. }) = self.pending_ops.remove(&op) {
                    sink.borrow_mut().on_set_complete(self, &uri, outcome);
                }
            }
            SourceEvent::FileComplete { op, outcome } => {
                if let Some(PendingOp::File { sink }) = self.pending_ops.remove(&op) {
                    sink.borrow_mut().on_file_complete(self, op, outcome);
                }
            }
            SourceEvent::ListFilesComplete { op, outcome, files } => {
                if let Some(PendingOp::ListFiles { sink }) = self.pending_ops.remove(&op) {
                    sink.borrow_mut().on_list_files_complete(self, op, outcome, &files);
                }
            }
            SourceEvent::ClockComplete { op, outcome, logger_time } => {
                if let Some(PendingOp::Clock { sink }) = self.pending_ops.remove(&op) {
                    sink.borrow_mut().on_clock_complete(self, op, outcome, logger_time);
                }
            }
            SourceEvent::TerminalData { token, bytes } => {
                if let Some(sink) = self.terminals.get(&token).cloned() {
                    sink.borrow_mut().on_terminal_data(self, token, &bytes);
                }
            }
            SourceEvent::TerminalClosed { token } => {
                if let Some(sink) = self.terminals.remove(&token) {
                    sink.borrow_mut().on_terminal_closed(self, token);
                }
            }
            SourceEvent::Symbols { .. } => {
                self.forward_to_symbol_listeners(event);
            }
            SourceEvent::SourceTime { source, time } => {
                for client in self.clients.clone() {
                    client.borrow_mut().on_source_time(self, &source, time);
                }
            }
        }
    }

    fn forward_to_symbol_listeners(&mut self, event: SourceEvent) {
        // Events fan out by clone-light reconstruction; listeners that
        // went away are dropped.
        self.symbol_listeners.retain(|listener| {
            let copy = match &event {
                SourceEvent::Symbols { source, parent, symbols } => SourceEvent::Symbols {
                    source: source.clone(),
                    parent: parent.clone(),
                    symbols: symbols.clone(),
                },
                SourceEvent::Connected { source } => SourceEvent::Connected {
                    source: source.clone(),
                },
                SourceEvent::Disconnected { source, reason } => SourceEvent::Disconnected {
                    source: source.clone(),
                    reason: *reason,
                },
                _ => return true,
            };
            listener.send(copy).is_ok()
        });
    }

    fn sink_for(&self, request: &RequestHandle) -> Option<SinkRef> {
        self.requests
            .iter()
            .find(|(held, _)| Arc::ptr_eq(held, request))
            .map(|(_, sink)| sink.clone())
    }

    fn find(&self, name: &str) -> Option<&dyn DataSource> {
        self.sources
            .iter()
            .find(|source| source.name() == name)
            .map(AsRef::as_ref)
    }

    fn find_mut(&mut self, name: &str) -> Option<&mut Box<dyn DataSource>> {
        self.sources.iter_mut().find(|source| source.name() == name)
    }

    fn allocate_op(&mut self) -> OpId {
        self.next_op += 1;
        self.next_op
    }
}

impl Default for Manager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::request::request_handle;
    use super::sink::sink_ref;
    use super::*;
    use std::cell::RefCell;

    /// Minimal in-memory source for manager-contract tests.
    struct TestSource {
        name: String,
        connected: bool,
        events: SourceEventSender,
        queued: Vec<RequestHandle>,
        active: Vec<RequestHandle>,
    }

    impl TestSource {
        fn new(name: &str, events: SourceEventSender) -> Self {
            Self {
                name: name.to_string(),
                connected: false,
                events,
                queued: Vec::new(),
                active: Vec::new(),
            }
        }
    }

    impl DataSource for TestSource {
        fn name(&self) -> &str {
            &self.name
        }

        fn connect(&mut self) {
            if !self.connected {
                let _ = self.events.send(SourceEvent::Connecting {
                    source: self.name.clone(),
                });
                self.connected = true;
                let _ = self.events.send(SourceEvent::Connected {
                    source: self.name.clone(),
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
            for request in self.queued.drain(..) {
                let mut desc = RecordDesc::new("stn", "tbl");
                desc.values.push(ValueDesc::scalar("v", ValueType::Float8));
                let mut record = Record::new(desc, Stamp::from_nanos(10), 1);
                record.values.push(Value::Float8(1.5));
                let _ = self.events.send(SourceEvent::RequestReady {
                    request: request.clone(),
                    record: record.clone(),
                });
                let _ = self.events.send(SourceEvent::Records {
                    requests: vec![request.clone()],
                    records: vec![record],
                });
                self.active.push(request);
            }
        }

        fn remove_request(&mut self, request: &RequestHandle) {
            self.active.retain(|held| !Arc::ptr_eq(held, request));
            self.queued.retain(|held| !Arc::ptr_eq(held, request));
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        ready: Vec<String>,
        batches: usize,
        failures: Vec<SinkFailure>,
    }

    impl SinkBase for RecordingSink {
        fn on_sink_ready(&mut self, _manager: &mut Manager, request: &RequestHandle, _record: &Record) {
            self.ready.push(request.lock().unwrap().uri().as_str().to_string());
        }

        fn on_sink_failure(&mut self, _manager: &mut Manager, _request: &RequestHandle, failure: SinkFailure) {
            self.failures.push(failure);
        }

        fn on_sink_records(&mut self, _manager: &mut Manager, requests: &[RequestHandle], records: &[Record]) {
            assert!(!requests.is_empty());
            assert!(!records.is_empty());
            self.batches += 1;
        }
    }

    fn manager_with_source() -> Manager {
        let mut manager = Manager::new();
        let source = TestSource::new("src", manager.event_sender());
        manager.add_source(Box::new(source));
        manager.connect_source("src");
        manager.pump();
        manager
    }

    #[test]
    fn request_lifecycle_reaches_the_sink() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let request = request_handle(Request::new(SourceUri::new("src:stn.tbl.v")));
        manager.add_request(sink.clone(), request.clone(), false);
        manager.pump();
        assert_eq!(sink.borrow().ready, vec!["src:stn.tbl.v"]);
        assert_eq!(sink.borrow().batches, 1);
        assert_eq!(request.lock().unwrap().state(), RequestState::ReceivedAdvise);
    }

    #[test]
    fn unknown_source_fails_immediately() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let request = request_handle(Request::new(SourceUri::new("nosuch:stn.tbl.v")));
        manager.add_request(sink.clone(), request, false);
        assert_eq!(sink.borrow().failures, vec![SinkFailure::InvalidSource]);
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn removed_request_gets_no_further_callbacks() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let request = request_handle(Request::new(SourceUri::new("src:stn.tbl.v")));
        manager.add_request(sink.clone(), request.clone(), true);
        manager.remove_request(&request);
        // Activate after removal: the source has already dropped it.
        manager.add_request(
            sink_ref(RecordingSink::default()),
            request_handle(Request::new(SourceUri::new("src:stn.tbl.other"))),
            false,
        );
        manager.pump();
        assert!(sink.borrow().ready.is_empty());
        assert_eq!(request.lock().unwrap().state(), RequestState::Removed);
    }

    #[test]
    fn more_to_follow_defers_activation() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let first = request_handle(Request::new(SourceUri::new("src:stn.tbl.a")));
        let second = request_handle(Request::new(SourceUri::new("src:stn.tbl.b")));
        manager.add_request(sink.clone(), first, true);
        manager.pump();
        assert_eq!(sink.borrow().ready.len(), 0, "batch not flushed yet");
        manager.add_request(sink.clone(), second, false);
        manager.pump();
        assert_eq!(sink.borrow().ready.len(), 2);
    }

    #[test]
    fn failed_request_is_auto_removed() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let request = request_handle(Request::new(SourceUri::new("src:stn.tbl.v")));
        manager.add_request(sink.clone(), request.clone(), true);
        let events = manager.event_sender();
        events
            .send(SourceEvent::RequestFailed {
                request: request.clone(),
                failure: SinkFailure::InvalidTable,
            })
            .unwrap();
        manager.pump();
        assert_eq!(sink.borrow().failures, vec![SinkFailure::InvalidTable]);
        assert_eq!(manager.request_count(), 0);
    }

    #[test]
    fn disconnect_holds_requests_for_reconnection() {
        let mut manager = manager_with_source();
        let sink = Rc::new(RefCell::new(RecordingSink::default()));
        let request = request_handle(Request::new(SourceUri::new("src:stn.tbl.v")));
        manager.add_request(sink.clone(), request.clone(), false);
        manager.pump();
        manager.disconnect_source("src");
        manager.pump();
        // The request is still registered and back to pending; the
        // sink saw no failure.
        assert_eq!(manager.request_count(), 1);
        assert_eq!(request.lock().unwrap().state(), RequestState::Pending);
        assert!(sink.borrow().failures.is_empty());
    }

    #[test]
    fn breakdown_is_total() {
        let manager = Manager::new();
        assert!(manager.breakdown_uri("garbage::").is_empty());
        assert_eq!(manager.breakdown_uri("s:a.b.c").len(), 4);
    }
}

//! Sinks: the application objects that receive records and operation
//! outcomes.
//!
//! Sink callbacks run on the manager's thread and may re-enter the
//! manager: adding or removing requests from inside
//! [`SinkBase::on_sink_records`] is allowed. A callback delivered after
//! the sink's requests were removed is a no-op by construction; the
//! manager drops the association before anything else happens.

use super::record::Record;
use super::request::{RequestHandle, SinkFailure};
use super::uri::SourceUri;
use super::Manager;
use crate::stamp::Stamp;
use std::cell::RefCell;
use std::rc::Rc;

/// Identifies one started operation (set value, file transfer, clock
/// check) through to its single outcome callback.
pub type OpId = u64;

/// Outcome of a setup-style operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The URI did not resolve to anything the source knows.
    InvalidUri,
    /// The source cannot perform this operation at all.
    Unsupported,
    /// The transport failed mid-operation.
    CommFailed,
    /// The peer refused the credentials or the security code.
    PermissionDenied,
    /// An unclassified failure with detail for the log.
    Failed(String),
}

/// File listing entry returned by a list-files operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
    pub modified: Option<Stamp>,
}

/// The application interface for record delivery and operation
/// outcomes. Every method has a default empty body so sinks implement
/// only what they consume.
pub trait SinkBase {
    /// The schema for a request is known; no data has been delivered
    /// yet.
    fn on_sink_ready(&mut self, manager: &mut Manager, request: &RequestHandle, record: &Record) {
        let _ = (manager, request, record);
    }

    /// The request failed terminally and has been removed.
    fn on_sink_failure(
        &mut self,
        manager: &mut Manager,
        request: &RequestHandle,
        failure: SinkFailure,
    ) {
        let _ = (manager, request, failure);
    }

    /// A batch of records shared by any number of co-scheduled
    /// requests.
    fn on_sink_records(
        &mut self,
        manager: &mut Manager,
        requests: &[RequestHandle],
        records: &[Record],
    ) {
        let _ = (manager, requests, records);
    }

    /// A set-value operation finished.
    fn on_set_complete(&mut self, manager: &mut Manager, uri: &SourceUri, outcome: Outcome) {
        let _ = (manager, uri, outcome);
    }

    /// A file operation (send, get-newest, control) finished.
    fn on_file_complete(&mut self, manager: &mut Manager, op: OpId, outcome: Outcome) {
        let _ = (manager, op, outcome);
    }

    /// A file listing finished.
    fn on_list_files_complete(
        &mut self,
        manager: &mut Manager,
        op: OpId,
        outcome: Outcome,
        files: &[FileInfo],
    ) {
        let _ = (manager, op, outcome, files);
    }

    /// A clock check or set finished; `logger_time` is the time read
    /// from the device on success.
    fn on_clock_complete(
        &mut self,
        manager: &mut Manager,
        op: OpId,
        outcome: Outcome,
        logger_time: Option<Stamp>,
    ) {
        let _ = (manager, op, outcome, logger_time);
    }

    /// Bytes arrived on a terminal stream.
    fn on_terminal_data(&mut self, manager: &mut Manager, token: i64, bytes: &[u8]) {
        let _ = (manager, token, bytes);
    }

    /// A terminal stream closed.
    fn on_terminal_closed(&mut self, manager: &mut Manager, token: i64) {
        let _ = (manager, token);
    }
}

/// Shared sink handle.
pub type SinkRef = Rc<RefCell<dyn SinkBase>>;

/// Wraps a sink in a shared handle.
pub fn sink_ref<S: SinkBase + 'static>(sink: S) -> SinkRef {
    Rc::new(RefCell::new(sink))
}

/// Manager-level client: observes source lifecycle rather than data.
pub trait ManagerClient {
    fn on_source_added(&mut self, manager: &mut Manager, source: &str) {
        let _ = (manager, source);
    }

    fn on_source_removed(&mut self, manager: &mut Manager, source: &str) {
        let _ = (manager, source);
    }

    fn on_source_connecting(&mut self, manager: &mut Manager, source: &str) {
        let _ = (manager, source);
    }

    fn on_source_connect(&mut self, manager: &mut Manager, source: &str) {
        let _ = (manager, source);
    }

    fn on_source_disconnect(&mut self, manager: &mut Manager, source: &str, reason: DisconnectReason) {
        let _ = (manager, source, reason);
    }

    /// A source's logger clock was checked, for clients that track
    /// skew across the network.
    fn on_source_time(&mut self, manager: &mut Manager, source: &str, time: Stamp) {
        let _ = (manager, source, time);
    }
}

/// Shared manager-client handle.
pub type ManagerClientRef = Rc<RefCell<dyn ManagerClient>>;

/// Why a source disconnected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The application asked for it.
    ByApplication,
    /// The transport failed or timed out.
    ConnectionFailed,
    /// The peer refused the logon.
    LogonFailed,
    /// The source kind cannot connect with its current properties.
    BadProperties,
}

/// The supervisor hook: invoked once when a request is added and once
/// per record batch, before sinks see anything. The supervisor may
/// mutate an unfrozen request, for example forcing a date-range query.
pub trait ManagerSupervisor {
    fn on_request_added(&mut self, request: &RequestHandle) {
        let _ = request;
    }

    fn on_records(&mut self, requests: &[RequestHandle], records: &[Record]) {
        let _ = (requests, records);
    }
}

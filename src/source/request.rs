//! Data requests: what a sink asked a source for, and where that ask
//! stands.

use super::record::Record;
use super::uri::SourceUri;
use crate::stamp::Stamp;
use std::sync::{Arc, Mutex};

/// Where a query starts in the table's history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StartOption {
    /// At a specific file mark and record number.
    AtRecord,
    /// At the first record stamped at or after a time.
    AtTime,
    /// At the newest record.
    #[default]
    AtNewest,
    /// Only records that arrive after the newest.
    AfterNewest,
    /// At the newest record time minus a backfill interval.
    RelativeToNewest,
    /// A record-count offset back from the newest.
    AtOffsetFromNewest,
    /// A closed time range.
    DateRange,
}

/// What order records are delivered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(i64)]
pub enum OrderOption {
    /// In collection order, as the source gathers them.
    Collected = 1,
    /// In logged order; gaps are delivered when filled.
    LoggedWithHoles = 2,
    /// In logged order, never revisiting a gap.
    LoggedWithoutHoles = 3,
    /// Newest data only, as it appears.
    #[default]
    RealTime = 4,
}

impl OrderOption {
    /// Decodes the numeric form used by expression order constants.
    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::Collected),
            2 => Some(Self::LoggedWithHoles),
            3 => Some(Self::LoggedWithoutHoles),
            4 => Some(Self::RealTime),
            _ => None,
        }
    }
}

/// Lifecycle of a request inside its source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RequestState {
    /// Queued, waiting for the source to start it.
    #[default]
    Pending,
    /// The source has begun whatever traffic satisfies it.
    Started,
    /// At least one record batch has been delivered.
    ReceivedAdvise,
    /// A bounded query produced everything it will produce.
    Satisfied,
    /// Terminally failed; the sink has been told.
    Failed,
    /// Removed by the application.
    Removed,
}

/// Why a request failed, as reported to the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkFailure {
    /// The URI named no source.
    InvalidSource,
    /// The station does not exist.
    InvalidStation,
    /// The table does not exist.
    InvalidTable,
    /// The column does not exist.
    InvalidColumn,
    /// The source is not connected.
    ConnectionFailed,
    /// The source rejected the credentials.
    InvalidLogon,
    /// The operation is not supported by this source kind.
    Unsupported,
    /// Something the source could not classify.
    Unknown,
}

/// A request, immutable once frozen.
#[derive(Debug, Clone)]
pub struct Request {
    uri: SourceUri,
    start_option: StartOption,
    order_option: OrderOption,
    file_mark_no: u32,
    record_no: u32,
    start_time: Stamp,
    end_time: Stamp,
    backfill_interval: i64,
    start_record_offset: u32,
    report_offset: i64,
    frozen: bool,
    state: RequestState,
    /// Half-open value-slot window this request projects out of a
    /// record; empty means the whole record.
    begin_index: usize,
    end_index: usize,
    /// The description attached when the source learned the schema.
    desc: Option<Record>,
}

impl Request {
    #[must_use]
    pub fn new(uri: SourceUri) -> Self {
        Self {
            uri,
            start_option: StartOption::default(),
            order_option: OrderOption::default(),
            file_mark_no: 0,
            record_no: 0,
            start_time: Stamp::from_nanos(0),
            end_time: Stamp::from_nanos(0),
            backfill_interval: 0,
            start_record_offset: 0,
            report_offset: 0,
            frozen: false,
            state: RequestState::default(),
            begin_index: 0,
            end_index: 0,
            desc: None,
        }
    }

    #[must_use]
    pub fn uri(&self) -> &SourceUri {
        &self.uri
    }

    #[must_use]
    pub fn start_option(&self) -> StartOption {
        self.start_option
    }

    #[must_use]
    pub fn order_option(&self) -> OrderOption {
        self.order_option
    }

    #[must_use]
    pub fn state(&self) -> RequestState {
        self.state
    }

    #[must_use]
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    #[must_use]
    pub fn start_time(&self) -> Stamp {
        self.start_time
    }

    #[must_use]
    pub fn end_time(&self) -> Stamp {
        self.end_time
    }

    #[must_use]
    pub fn file_mark_no(&self) -> u32 {
        self.file_mark_no
    }

    #[must_use]
    pub fn record_no(&self) -> u32 {
        self.record_no
    }

    #[must_use]
    pub fn backfill_interval(&self) -> i64 {
        self.backfill_interval
    }

    #[must_use]
    pub fn start_record_offset(&self) -> u32 {
        self.start_record_offset
    }

    #[must_use]
    pub fn report_offset(&self) -> i64 {
        self.report_offset
    }

    /// Freezes the request; configuration setters become no-ops.
    pub fn freeze(&mut self) {
        self.frozen = true;
    }

    pub fn set_order_option(&mut self, order: OrderOption) {
        if !self.frozen {
            self.order_option = order;
        }
    }

    pub fn set_start_at_record(&mut self, file_mark_no: u32, record_no: u32) {
        if !self.frozen {
            self.start_option = StartOption::AtRecord;
            self.file_mark_no = file_mark_no;
            self.record_no = record_no;
        }
    }

    pub fn set_start_at_time(&mut self, time: Stamp) {
        if !self.frozen {
            self.start_option = StartOption::AtTime;
            self.start_time = time;
        }
    }

    pub fn set_start_at_newest(&mut self) {
        if !self.frozen {
            self.start_option = StartOption::AtNewest;
        }
    }

    pub fn set_start_after_newest(&mut self) {
        if !self.frozen {
            self.start_option = StartOption::AfterNewest;
        }
    }

    /// Start a positive interval back from the newest stamp.
    pub fn set_start_relative_to_newest(&mut self, backfill_interval: i64) {
        if !self.frozen {
            self.start_option = StartOption::RelativeToNewest;
            self.backfill_interval = backfill_interval.abs();
        }
    }

    pub fn set_start_at_offset_from_newest(&mut self, offset: u32) {
        if !self.frozen {
            self.start_option = StartOption::AtOffsetFromNewest;
            self.start_record_offset = offset;
        }
    }

    pub fn set_query_times(&mut self, begin: Stamp, end: Stamp) {
        if !self.frozen {
            self.start_option = StartOption::DateRange;
            self.start_time = begin;
            self.end_time = end;
        }
    }

    pub fn set_report_offset(&mut self, offset: i64) {
        if !self.frozen {
            self.report_offset = offset;
        }
    }

    /// Source-side state transition.
    pub fn set_state(&mut self, state: RequestState) {
        self.state = state;
    }

    /// Attaches the schema record and the value window the URI's
    /// column selects.
    pub fn set_description(&mut self, record: Record) {
        if let Some(column) = self.uri.column() {
            if let Some(index) = record.desc.find_value(&column) {
                self.begin_index = index;
                self.end_index = index + 1;
            }
        } else {
            self.begin_index = 0;
            self.end_index = record.desc.values.len();
        }
        self.desc = Some(record);
    }

    #[must_use]
    pub fn description(&self) -> Option<&Record> {
        self.desc.as_ref()
    }

    /// The value-slot window into delivered records.
    #[must_use]
    pub fn value_indices(&self) -> (usize, usize) {
        (self.begin_index, self.end_index)
    }
}

/// Shared handle to a request. The manager, its source, and any
/// expression variable bound to the request all hold the same handle.
pub type RequestHandle = Arc<Mutex<Request>>;

/// Builds a shared request handle.
#[must_use]
pub fn request_handle(request: Request) -> RequestHandle {
    Arc::new(Mutex::new(request))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::record::{RecordDesc, Value, ValueDesc, ValueType};

    #[test]
    fn freeze_blocks_reconfiguration() {
        let mut request = Request::new(SourceUri::new("src:stn.tbl.v"));
        request.set_start_relative_to_newest(1_000);
        request.freeze();
        request.set_start_at_newest();
        assert_eq!(request.start_option(), StartOption::RelativeToNewest);
        assert_eq!(request.backfill_interval(), 1_000);
    }

    #[test]
    fn backfill_interval_is_stored_positive() {
        let mut request = Request::new(SourceUri::new("src:stn.tbl.v"));
        request.set_start_relative_to_newest(-500);
        assert_eq!(request.backfill_interval(), 500);
    }

    #[test]
    fn description_selects_the_column_window() {
        let mut desc = RecordDesc::new("stn", "tbl");
        desc.values.push(ValueDesc::scalar("a", ValueType::Float8));
        desc.values.push(ValueDesc::scalar("b", ValueType::Float8));
        let mut record = Record::new(desc, Stamp::from_nanos(0), 0);
        record.values.push(Value::Float8(0.0));
        record.values.push(Value::Float8(0.0));
        let mut request = Request::new(SourceUri::new("src:stn.tbl.b"));
        request.set_description(record);
        assert_eq!(request.value_indices(), (1, 2));
    }

    #[test]
    fn order_codes_round_trip() {
        for order in [
            OrderOption::Collected,
            OrderOption::LoggedWithHoles,
            OrderOption::LoggedWithoutHoles,
            OrderOption::RealTime,
        ] {
            assert_eq!(OrderOption::from_code(order as i64), Some(order));
        }
    }
}

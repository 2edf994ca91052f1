//! # Fieldlink — client runtime for datalogger telemetry networks
//!
//! Fieldlink speaks the wire protocols of a datalogger ecosystem — a
//! session-multiplexed message bus with an encrypted relay tunnel, the
//! PakBus serial packet link, HTTP with websocket upgrades, and ALERT2
//! IND streams — and unifies them behind one URI-addressed data source
//! manager that applications drive with requests, expressions and
//! schedules.
//!
//! ## Layout
//!
//! - [`messaging`]: length-prefixed frames, the session router, server
//!   stubs and the proxy tunnel.
//! - [`pakbus`]: the quoted serial packet codec and per-peer link
//!   state machine.
//! - [`http`]: a pipelined HTTP/1.1 client with chunked decode and
//!   RFC 6455 websockets.
//! - [`alert2`]: the IND stream parser and MANT PDU decoders.
//! - [`source`]: the data source manager, requests, records, symbols
//!   and the concrete source kinds.
//! - [`expression`]: the tokenizer, infix-to-postfix compiler,
//!   evaluator and request binder.
//! - [`alarm`]: expression-driven condition detection.
//! - [`timer`], [`schedule`]: one-shot timers and periodic schedules.
//! - [`bytelog`]: the baled byte log transports write their I/O to.

pub mod alarm;
pub mod alert2;
pub mod bytelog;
pub mod expression;
pub mod http;
pub mod messaging;
pub mod pakbus;
pub mod schedule;
pub mod sig;
pub mod source;
pub mod stamp;
pub mod timer;

pub use alarm::{AlarmAction, AlarmEvent, AlarmManager, AlarmState};
pub use bytelog::{BaleRule, ByteLog};
pub use expression::{ExpressionHandler, TokenFactory};
pub use schedule::{ScheduleEvent, Scheduler};
pub use source::{
    DataSource, Manager, OrderOption, Record, Request, RequestHandle, SinkBase, SourceUri,
    StartOption,
};
pub use stamp::Stamp;
pub use timer::OneShot;

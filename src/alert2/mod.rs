//! ALERT2 IND stream parsing.
//!
//! The IND interface is a newline-framed ASCII stream of comma
//! separated records. The first field selects the envelope: `N` wraps a
//! MANT PDU, `P` an AirLink envelope, `C`/`A` a concentration envelope
//! and `S` a freeform status message. Standard-conforming lines carry
//! an `ALERT2A` prologue that field deployments omit; the prologue is
//! stripped and the line reparsed as the non-conforming subset.

pub mod mant;

pub use mant::{
    MantMessage, MantPdu, Protocol, SensorReport, SensorValue, SensorValueType, ServicePort,
};

use crate::stamp::Stamp;
use thiserror::Error;
use tracing::warn;

/// Decode failures for one IND line. The stream itself survives; the
/// offending line is reported with the error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Alert2Error {
    #[error("IND line has too few fields")]
    ShortRecord,
    #[error("invalid field {field}: {reason}")]
    BadField { field: usize, reason: &'static str },
    #[error("unsupported protocol code")]
    BadProtocol,
    #[error("unsupported service port")]
    BadServicePort,
    #[error("messages with an added header are not supported")]
    AddedHeader,
    #[error("unsupported MANT PDU version")]
    BadVersion,
    #[error("malformed MANT PDU")]
    MalformedPdu,
    #[error("malformed sensor report")]
    MalformedReport,
}

/// A parsed IND message.
#[derive(Debug, Clone, PartialEq)]
pub enum IndMessage {
    Mant(MantMessage),
    /// AirLink envelopes pass through unparsed.
    Airlink(Vec<String>),
    /// Concentration envelopes pass through unparsed.
    Concentration(Vec<String>),
    /// Status messages are freeform name/value parameters.
    Status(Vec<(String, String)>),
}

/// What the stream produced for a chunk of input.
#[derive(Debug, PartialEq)]
pub enum IndEvent {
    /// The raw line, delivered before parsing for logging clients.
    Content(String),
    Message(IndMessage),
    /// The line failed to parse; the stream continues.
    Error { error: Alert2Error, line: String },
}

/// Newline-framed IND stream decoder.
pub struct IndStream {
    buffer: Vec<u8>,
}

impl IndStream {
    #[must_use]
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Discards any buffered partial line.
    pub fn clear(&mut self) {
        self.buffer.clear();
    }

    /// Feeds received bytes, producing one batch of events per
    /// complete line.
    pub fn on_data(&mut self, bytes: &[u8]) -> Vec<IndEvent> {
        self.buffer.extend_from_slice(bytes);
        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|&byte| byte == b'\n') {
            let line_bytes: Vec<u8> = self.buffer.drain(..=end).collect();
            let line = String::from_utf8_lossy(&line_bytes).trim_end().to_string();
            if line.is_empty() {
                continue;
            }
            events.push(IndEvent::Content(line.clone()));
            match parse_line(&line) {
                Ok(Some(message)) => events.push(IndEvent::Message(message)),
                Ok(None) => {}
                Err(error) => {
                    warn!(%error, line, "IND line rejected");
                    events.push(IndEvent::Error { error, line });
                }
            }
        }
        events
    }
}

impl Default for IndStream {
    fn default() -> Self {
        Self::new()
    }
}

/// Parses one complete IND line. Unknown envelopes yield `Ok(None)`.
pub fn parse_line(line: &str) -> Result<Option<IndMessage>, Alert2Error> {
    let mut fields: Vec<String> = line.split(',').map(|field| field.trim().to_string()).collect();
    if fields.is_empty() {
        return Ok(None);
    }
    // Standard lines open with the five-field ALERT2A prologue; the
    // non-conforming subset we speak omits it, and `N` messages also
    // omit the time-quality flag that follows.
    if fields[0] == "ALERT2A" {
        if fields.len() < 6 {
            return Err(Alert2Error::ShortRecord);
        }
        fields.drain(..5);
        if fields[0] == "N" && fields.len() > 1 {
            fields.remove(1);
        }
    }
    match fields[0].as_str() {
        "N" => Ok(Some(IndMessage::Mant(mant::parse_mant(&fields)?))),
        "P" => Ok(Some(IndMessage::Airlink(fields))),
        "C" | "A" => Ok(Some(IndMessage::Concentration(fields))),
        "S" => {
            let parameters = fields[1..]
                .iter()
                .map(|field| match field.split_once('=') {
                    Some((name, value)) => (name.trim().to_string(), value.trim().to_string()),
                    None => (field.clone(), String::new()),
                })
                .collect();
            Ok(Some(IndMessage::Status(parameters)))
        }
        _ => Ok(None),
    }
}

/// Builds the receive stamp from the split calendar fields of the IND
/// header.
pub(crate) fn received_time_from_fields(
    year: &str,
    month: &str,
    day: &str,
    hour: &str,
    minute: &str,
    seconds: &str,
) -> Result<Stamp, Alert2Error> {
    let bad = |field| Alert2Error::BadField {
        field,
        reason: "not a number",
    };
    let year: i32 = year.parse().map_err(|_| bad(1))?;
    let month: u32 = month.parse().map_err(|_| bad(2))?;
    let day: u32 = day.parse().map_err(|_| bad(3))?;
    let hour: u32 = hour.parse().map_err(|_| bad(4))?;
    let minute: u32 = minute.parse().map_err(|_| bad(5))?;
    let seconds: f64 = seconds.parse().map_err(|_| bad(6))?;
    let whole = seconds.floor();
    let stamp = Stamp::from_ymd_hms(year, month, day, hour, minute, whole as u32).ok_or(
        Alert2Error::BadField {
            field: 1,
            reason: "invalid calendar date",
        },
    )?;
    Ok(stamp.with_seconds_fraction(seconds - whole))
}

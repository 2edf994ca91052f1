//! MANT PDU and sensor report decoding.
//!
//! A MANT IND line carries the medium-access header as CSV fields and
//! the application PDU as hex bytes. The PDU holds a control byte, an
//! optional half-day time stamp, and a sequence of sensor reports; each
//! report yields zero or more sensor values whose time offsets are
//! nanoseconds relative to the PDU time.

use super::{received_time_from_fields, Alert2Error};
use crate::stamp::{Stamp, NSEC_PER_DAY, NSEC_PER_HOUR, NSEC_PER_MIN, NSEC_PER_SEC};

/// Sensor report type codes.
pub mod report_types {
    pub const CONCENTRATION: u8 = 0;
    pub const GENERAL: u8 = 1;
    pub const RAIN_GAUGE: u8 = 2;
    pub const MULTI_ENGLISH: u8 = 3;
    pub const MULTI_METRIC: u8 = 4;
    pub const MEASUREMENT_SUITE: u8 = 5;
    pub const TIME_SERIES: u8 = 7;
}

/// Canonical sensor identifiers used by the multi-sensor reports.
pub mod standard_sensors {
    pub const RAIN: u16 = 0;
    pub const AIR_TEMP: u16 = 1;
    pub const RH: u16 = 2;
    pub const BP: u16 = 3;
    pub const WIND_SPEED: u16 = 4;
    pub const WIND_DIR: u16 = 5;
    pub const WIND_PEAK: u16 = 6;
    pub const STAGE: u16 = 7;
    pub const BATTERY: u16 = 8;
}

/// Value type nibble of the F/L byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SensorValueType {
    UInt = 1,
    Int = 2,
    Float = 3,
    TransmissionOffset = 13,
    DayOffset = 14,
    Timestamp = 15,
}

impl SensorValueType {
    fn from_nibble(nibble: u8) -> Option<Self> {
        match nibble {
            1 => Some(Self::UInt),
            2 => Some(Self::Int),
            3 => Some(Self::Float),
            13 => Some(Self::TransmissionOffset),
            14 => Some(Self::DayOffset),
            15 => Some(Self::Timestamp),
            _ => None,
        }
    }
}

/// The magnitude a sensor value carries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Magnitude {
    UInt(u32),
    Int(i32),
    Float(f64),
}

/// One decoded sensor value.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorValue {
    pub sensor_id: u16,
    pub value_type: SensorValueType,
    pub magnitude: Magnitude,
    /// Nanoseconds before the PDU time at which this value was taken.
    pub time_offset: i64,
}

impl SensorValue {
    fn new(sensor_id: u16, value_type: SensorValueType, magnitude: Magnitude) -> Self {
        Self {
            sensor_id,
            value_type,
            magnitude,
            time_offset: 0,
        }
    }

    /// The magnitude widened to an integer; floats truncate.
    #[must_use]
    pub fn magnitude_int(&self) -> i64 {
        match self.magnitude {
            Magnitude::UInt(value) => i64::from(value),
            Magnitude::Int(value) => i64::from(value),
            Magnitude::Float(value) => value as i64,
        }
    }

    /// The magnitude as a float.
    #[must_use]
    pub fn magnitude_float(&self) -> f64 {
        match self.magnitude {
            Magnitude::UInt(value) => f64::from(value),
            Magnitude::Int(value) => f64::from(value),
            Magnitude::Float(value) => value,
        }
    }

    /// The wall time this value was taken, given the PDU time.
    #[must_use]
    pub fn time_stamp(&self, pdu_time: Stamp) -> Stamp {
        pdu_time - self.time_offset
    }
}

/// F/L byte: value type in the high nibble, byte count in the low.
struct FormatLen {
    value_type: SensorValueType,
    value_len: usize,
}

impl FormatLen {
    fn parse(fl: u8) -> Result<Self, Alert2Error> {
        let value_type =
            SensorValueType::from_nibble(fl >> 4).ok_or(Alert2Error::MalformedReport)?;
        Ok(Self {
            value_type,
            value_len: usize::from(fl & 0x0F),
        })
    }

    fn decode(&self, sensor_id: u16, buf: &[u8]) -> Result<SensorValue, Alert2Error> {
        if buf.len() < self.value_len {
            return Err(Alert2Error::MalformedReport);
        }
        let magnitude = match (self.value_type, self.value_len) {
            (SensorValueType::UInt | SensorValueType::TransmissionOffset, 1) => {
                Magnitude::UInt(u32::from(buf[0]))
            }
            (SensorValueType::UInt | SensorValueType::DayOffset, 2) => {
                Magnitude::UInt(u32::from(u16::from_be_bytes([buf[0], buf[1]])))
            }
            (SensorValueType::UInt | SensorValueType::Timestamp, 4) => {
                Magnitude::UInt(u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            (SensorValueType::Int, 1) => Magnitude::Int(i32::from(buf[0])),
            (SensorValueType::Int, 2) => {
                Magnitude::Int(i32::from(i16::from_be_bytes([buf[0], buf[1]])))
            }
            (SensorValueType::Int, 4) => {
                Magnitude::Int(i32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]))
            }
            (SensorValueType::Float, 4) => Magnitude::Float(f64::from(f32::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3],
            ]))),
            (SensorValueType::Float, 8) => Magnitude::Float(f64::from_be_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ])),
            _ => return Err(Alert2Error::MalformedReport),
        };
        Ok(SensorValue::new(sensor_id, self.value_type, magnitude))
    }
}

/// One sensor report within a PDU.
#[derive(Debug, Clone, PartialEq)]
pub struct SensorReport {
    pub report_type: u8,
    pub values: Vec<SensorValue>,
}

/// The decoded application PDU of a MANT message.
#[derive(Debug, Clone, PartialEq)]
pub struct MantPdu {
    pub has_time_stamp: bool,
    pub from_test: bool,
    pub apdu_id: u8,
    /// Seconds past the latest noon or midnight, when present.
    pub time_stamp: u16,
    pub reports: Vec<SensorReport>,
}

impl MantPdu {
    /// The effective PDU time: the received time snapped back to the
    /// nearest half-day boundary plus the time stamp, pulled back
    /// twelve hours if that lands in the future.
    #[must_use]
    pub fn pdu_time(&self, received: Stamp) -> Stamp {
        if !self.has_time_stamp {
            return received;
        }
        let mut time = received.latest_half_day() + i64::from(self.time_stamp) * NSEC_PER_SEC;
        if time > received {
            time = time - 12 * NSEC_PER_HOUR;
        }
        time
    }
}

/// MANT link protocol variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Broadcast,
    EndToEnd,
}

/// Service ports whose payloads this crate decodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServicePort {
    SelfReporting,
    Concentration,
}

/// A parsed MANT IND message.
#[derive(Debug, Clone, PartialEq)]
pub struct MantMessage {
    pub received_time: Stamp,
    pub protocol: Protocol,
    pub add_path_service: bool,
    pub service_port: ServicePort,
    pub hop_limit: u32,
    pub source_address: u16,
    pub destination_address: Option<u16>,
    pub mant_pdu_id: Option<u32>,
    pub repeaters: Vec<u16>,
    pub pdu: Option<MantPdu>,
}

impl MantMessage {
    /// Every sensor value across every report.
    pub fn values(&self) -> impl Iterator<Item = &SensorValue> + '_ {
        self.pdu
            .iter()
            .flat_map(|pdu| pdu.reports.iter())
            .flat_map(|report| report.values.iter())
    }

    /// Sorted, de-duplicated sensor identifiers present in the PDU.
    #[must_use]
    pub fn sensor_identifiers(&self) -> Vec<u16> {
        let mut ids: Vec<u16> = self.values().map(|value| value.sensor_id).collect();
        ids.sort_unstable();
        ids.dedup();
        ids
    }
}

fn address_field(fields: &[String], index: usize) -> Result<u16, Alert2Error> {
    let value: u32 = fields
        .get(index)
        .ok_or(Alert2Error::ShortRecord)?
        .parse()
        .map_err(|_| Alert2Error::BadField {
            field: index,
            reason: "not a number",
        })?;
    u16::try_from(value).map_err(|_| Alert2Error::BadField {
        field: index,
        reason: "address out of range",
    })
}

/// Parses the fixed and optional fields of a non-conforming `N` line.
pub(crate) fn parse_mant(fields: &[String]) -> Result<MantMessage, Alert2Error> {
    const PROTOCOL: usize = 8;
    const ADD_PATH: usize = 10;
    const DEST_PRESENT: usize = 11;
    const SERVICE_PORT: usize = 12;
    const ACK: usize = 14;
    const ADDED_HEADER: usize = 15;
    const HOP_LIMIT: usize = 16;
    const PAYLOAD_LEN: usize = 17;
    const SOURCE: usize = 18;

    if fields.len() <= SOURCE {
        return Err(Alert2Error::ShortRecord);
    }
    let received_time = received_time_from_fields(
        &fields[1], &fields[2], &fields[3], &fields[4], &fields[5], &fields[6],
    )?;
    let protocol = match fields[PROTOCOL].as_str() {
        "0" => Protocol::Broadcast,
        "1" => Protocol::EndToEnd,
        _ => return Err(Alert2Error::BadProtocol),
    };
    let add_path_service = fields[ADD_PATH] == "1";
    let has_destination = fields[DEST_PRESENT] == "1";
    let service_port = match fields[SERVICE_PORT].as_str() {
        "0" => ServicePort::SelfReporting,
        "1" => ServicePort::Concentration,
        _ => return Err(Alert2Error::BadServicePort),
    };
    let has_mant_pdu_id = fields[ACK] == "1";
    if fields[ADDED_HEADER] == "1" {
        // The standard leaves the added header unspecified, so any
        // message carrying one is undecodable.
        return Err(Alert2Error::AddedHeader);
    }
    let hop_limit = fields[HOP_LIMIT]
        .parse()
        .map_err(|_| Alert2Error::BadField {
            field: HOP_LIMIT,
            reason: "not a number",
        })?;
    let payload_len: usize = fields[PAYLOAD_LEN]
        .parse()
        .map_err(|_| Alert2Error::BadField {
            field: PAYLOAD_LEN,
            reason: "not a number",
        })?;
    let source_address = address_field(fields, SOURCE)?;

    // Optional fields follow the source address in a fixed order.
    let mut cursor = SOURCE + 1;
    let destination_address = if has_destination {
        let address = address_field(fields, cursor)?;
        cursor += 1;
        Some(address)
    } else {
        None
    };
    let mant_pdu_id = if has_mant_pdu_id {
        let id = fields
            .get(cursor)
            .ok_or(Alert2Error::ShortRecord)?
            .parse()
            .map_err(|_| Alert2Error::BadField {
                field: cursor,
                reason: "not a number",
            })?;
        cursor += 1;
        Some(id)
    } else {
        None
    };
    let mut repeaters = Vec::new();
    if add_path_service {
        let count: usize = fields
            .get(cursor)
            .ok_or(Alert2Error::ShortRecord)?
            .parse()
            .map_err(|_| Alert2Error::BadField {
                field: cursor,
                reason: "not a number",
            })?;
        cursor += 1;
        for _ in 0..count {
            repeaters.push(address_field(fields, cursor)?);
            cursor += 1;
        }
    }

    // The payload is hex bytes, either space-separated inside one
    // field or spread across the remaining fields.
    let mut payload = Vec::with_capacity(payload_len);
    for field in &fields[cursor..] {
        for token in field.split_whitespace() {
            let value = u8::from_str_radix(token, 16).map_err(|_| Alert2Error::BadField {
                field: cursor,
                reason: "bad payload hex",
            })?;
            payload.push(value);
        }
    }
    if payload.len() < payload_len {
        return Err(Alert2Error::ShortRecord);
    }
    payload.truncate(payload_len);

    let pdu = Some(match service_port {
        ServicePort::SelfReporting => parse_self_report_pdu(&payload)?,
        ServicePort::Concentration => parse_concentration_pdu(&payload)?,
    });

    Ok(MantMessage {
        received_time,
        protocol,
        add_path_service,
        service_port,
        hop_limit,
        source_address,
        destination_address,
        mant_pdu_id,
        repeaters,
        pdu,
    })
}

struct PduHeader {
    has_time_stamp: bool,
    from_test: bool,
    apdu_id: u8,
    time_stamp: u16,
    report_pos: usize,
}

fn parse_pdu_header(buf: &[u8]) -> Result<PduHeader, Alert2Error> {
    let control = *buf.first().ok_or(Alert2Error::MalformedPdu)?;
    if control & 0x03 != 0 {
        return Err(Alert2Error::BadVersion);
    }
    let has_time_stamp = control & 0x04 != 0;
    let from_test = control & 0x08 != 0;
    let apdu_id = (control & 0x70) >> 4;
    let mut time_pos = 1;
    let mut report_pos = 3;
    if control & 0x80 != 0 {
        // Extended: one further control byte we do not interpret.
        time_pos += 1;
        report_pos += 1;
    }
    if !has_time_stamp {
        report_pos -= 2;
    }
    if time_pos >= buf.len() || report_pos > buf.len() {
        return Err(Alert2Error::MalformedPdu);
    }
    let time_stamp = if has_time_stamp {
        if time_pos + 2 > buf.len() {
            return Err(Alert2Error::MalformedPdu);
        }
        u16::from_be_bytes([buf[time_pos], buf[time_pos + 1]])
    } else {
        0
    };
    Ok(PduHeader {
        has_time_stamp,
        from_test,
        apdu_id,
        time_stamp,
        report_pos,
    })
}

/// Decodes a self-reporting PDU: control, optional time stamp, then a
/// `{type, len, body}` report sequence where a length high bit extends
/// the length to sixteen bits.
pub fn parse_self_report_pdu(buf: &[u8]) -> Result<MantPdu, Alert2Error> {
    let header = parse_pdu_header(buf)?;
    let mut reports = Vec::new();
    let mut report_pos = header.report_pos;
    while report_pos + 2 <= buf.len() {
        let report_type = buf[report_pos];
        let mut report_len = usize::from(buf[report_pos + 1]);
        let mut body_start = 2;
        if report_len & 0x80 != 0 {
            if report_pos + 2 >= buf.len() {
                return Err(Alert2Error::MalformedPdu);
            }
            body_start += 1;
            report_len = ((report_len & 0x7F) << 8) | usize::from(buf[report_pos + 2]);
        }
        if report_pos + body_start + report_len > buf.len() {
            return Err(Alert2Error::MalformedPdu);
        }
        let body = &buf[report_pos + body_start..report_pos + body_start + report_len];
        match report_type {
            report_types::GENERAL => reports.push(parse_general(body)?),
            report_types::RAIN_GAUGE => reports.push(parse_rain_gauge(body)?),
            report_types::MULTI_ENGLISH => reports.push(parse_multi_english(body)?),
            report_types::MULTI_METRIC => reports.push(parse_multi_metric(body)?),
            report_types::TIME_SERIES => reports.push(parse_time_series(body)?),
            _ => {}
        }
        report_pos += body_start + report_len;
    }
    Ok(MantPdu {
        has_time_stamp: header.has_time_stamp,
        from_test: header.from_test,
        apdu_id: header.apdu_id,
        time_stamp: header.time_stamp,
        reports,
    })
}

/// Decodes a concentration PDU: the whole payload after the control
/// header is one concentration report.
pub fn parse_concentration_pdu(buf: &[u8]) -> Result<MantPdu, Alert2Error> {
    let header = parse_pdu_header(buf)?;
    let report = parse_concentration(&buf[header.report_pos..])?;
    Ok(MantPdu {
        has_time_stamp: header.has_time_stamp,
        from_test: header.from_test,
        apdu_id: header.apdu_id,
        time_stamp: header.time_stamp,
        reports: vec![report],
    })
}

/// General report: repeated `{sensor_id, F/L, value}`.
pub fn parse_general(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 2 <= body.len() {
        let sensor_id = u16::from(body[pos]);
        let fl = FormatLen::parse(body[pos + 1])?;
        values.push(fl.decode(sensor_id, &body[pos + 2..])?);
        pos += fl.value_len + 2;
    }
    Ok(SensorReport {
        report_type: report_types::GENERAL,
        values,
    })
}

/// Rain gauge report: an accumulator plus one byte per tip giving the
/// seconds offset of that tip, newest first. Each tip is emitted as a
/// running count up to the accumulator.
pub fn parse_rain_gauge(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    if body.len() < 2 {
        return Err(Alert2Error::MalformedReport);
    }
    let sensor_id = u16::from(body[0]);
    let fl = FormatLen::parse(body[1])?;
    let accumulator = fl.decode(sensor_id, &body[2..])?;
    let mut values = Vec::new();
    if matches!(fl.value_type, SensorValueType::UInt | SensorValueType::Int) {
        let accum = accumulator.magnitude_int();
        let offsets = &body[2 + fl.value_len..];
        let tips = offsets.len() as i64;
        if accum > 0 && tips > 0 {
            for (index, &offset) in offsets.iter().rev().enumerate() {
                let count = accum - tips + 1 + index as i64;
                if count <= 0 {
                    continue;
                }
                let mut value =
                    SensorValue::new(sensor_id, SensorValueType::Int, Magnitude::Int(count as i32));
                value.time_offset = i64::from(offset) * NSEC_PER_SEC;
                values.push(value);
            }
        }
    }
    if values.is_empty() {
        values.push(accumulator);
    }
    Ok(SensorReport {
        report_type: report_types::RAIN_GAUGE,
        values,
    })
}

struct MultiCursor<'a> {
    body: &'a [u8],
    pos: usize,
}

impl<'a> MultiCursor<'a> {
    fn u8(&mut self) -> Result<u8, Alert2Error> {
        let value = *self.body.get(self.pos).ok_or(Alert2Error::MalformedReport)?;
        self.pos += 1;
        Ok(value)
    }

    fn u16(&mut self) -> Result<u16, Alert2Error> {
        if self.pos + 2 > self.body.len() {
            return Err(Alert2Error::MalformedReport);
        }
        let value = u16::from_be_bytes([self.body[self.pos], self.body[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    fn i16(&mut self) -> Result<i16, Alert2Error> {
        Ok(self.u16()? as i16)
    }

    fn u24(&mut self) -> Result<i32, Alert2Error> {
        if self.pos + 3 > self.body.len() {
            return Err(Alert2Error::MalformedReport);
        }
        let value = (i32::from(self.body[self.pos]) << 16)
            | (i32::from(self.body[self.pos + 1]) << 8)
            | i32::from(self.body[self.pos + 2]);
        self.pos += 3;
        Ok(value)
    }
}

/// Multi-sensor english report: a flag byte selects which of the eight
/// canonical sensors are present.
pub fn parse_multi_english(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    let mut cursor = MultiCursor { body, pos: 0 };
    let flags = cursor.u8()?;
    let mut values = Vec::new();
    if flags & 0x01 != 0 {
        let temp = cursor.i16()?;
        values.push(SensorValue::new(
            standard_sensors::AIR_TEMP,
            SensorValueType::Int,
            Magnitude::Int(i32::from(temp)),
        ));
    }
    if flags & 0x02 != 0 {
        let rh = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::RH,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(rh)),
        ));
    }
    if flags & 0x04 != 0 {
        let bp = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::BP,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(bp)),
        ));
    }
    if flags & 0x08 != 0 {
        let ws = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_SPEED,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(ws)),
        ));
    }
    if flags & 0x10 != 0 {
        let wd = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_DIR,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(wd)),
        ));
    }
    if flags & 0x20 != 0 {
        let wp = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_PEAK,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(wp)),
        ));
    }
    if flags & 0x40 != 0 {
        let stage = cursor.i16()?;
        values.push(SensorValue::new(
            standard_sensors::STAGE,
            SensorValueType::Int,
            Magnitude::Int(i32::from(stage)),
        ));
    }
    if flags & 0x80 != 0 {
        let battery = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::BATTERY,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(battery)),
        ));
    }
    Ok(SensorReport {
        report_type: report_types::MULTI_ENGLISH,
        values,
    })
}

/// Multi-sensor metric report: same flags, wider fields.
pub fn parse_multi_metric(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    let mut cursor = MultiCursor { body, pos: 0 };
    let flags = cursor.u8()?;
    let mut values = Vec::new();
    if flags & 0x01 != 0 {
        let temp = cursor.i16()?;
        values.push(SensorValue::new(
            standard_sensors::AIR_TEMP,
            SensorValueType::Int,
            Magnitude::Int(i32::from(temp)),
        ));
    }
    if flags & 0x02 != 0 {
        let rh = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::RH,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(rh)),
        ));
    }
    if flags & 0x04 != 0 {
        let bp = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::BP,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(bp)),
        ));
    }
    if flags & 0x08 != 0 {
        let ws = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_SPEED,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(ws)),
        ));
    }
    if flags & 0x10 != 0 {
        let wd = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_DIR,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(wd)),
        ));
    }
    if flags & 0x20 != 0 {
        let wp = cursor.u16()?;
        values.push(SensorValue::new(
            standard_sensors::WIND_PEAK,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(wp)),
        ));
    }
    if flags & 0x40 != 0 {
        let stage = cursor.u24()?;
        values.push(SensorValue::new(
            standard_sensors::STAGE,
            SensorValueType::Int,
            Magnitude::Int(stage),
        ));
    }
    if flags & 0x80 != 0 {
        let battery = cursor.u8()?;
        values.push(SensorValue::new(
            standard_sensors::BATTERY,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(battery)),
        ));
    }
    Ok(SensorReport {
        report_type: report_types::MULTI_METRIC,
        values,
    })
}

/// Time series report: optional posix time stamp prologue, sensor id,
/// interval byte, F/L, then packed values oldest first.
pub fn parse_time_series(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    let value_offset: i64 = 0;
    let mut sensor_start = 0;
    if body.first() == Some(&0xFF) {
        // The prologue anchors the series at an absolute posix time;
        // offsets here stay relative to the PDU time and the caller
        // owns any re-anchoring, so the four stamp bytes are only
        // validated and skipped.
        if body.len() < 6 || body[1] != 0xF4 {
            return Err(Alert2Error::MalformedReport);
        }
        sensor_start = 6;
    }
    if sensor_start + 3 > body.len() {
        return Err(Alert2Error::MalformedReport);
    }
    let sensor_id = u16::from(body[sensor_start]);
    let interval_code = body[sensor_start + 1];
    let interval = decode_interval(interval_code);
    let fl = FormatLen::parse(body[sensor_start + 2])?;
    if fl.value_len == 0 {
        return Err(Alert2Error::MalformedReport);
    }
    let data_start = sensor_start + 3;
    let data = &body[data_start..];
    let records = data.len() / fl.value_len;
    let mut values = Vec::with_capacity(records);
    for index in 0..records {
        let start = index * fl.value_len;
        let mut value = fl.decode(sensor_id, &data[start..])?;
        // Values arrive oldest first while the report time refers to
        // the newest, so earlier entries sit further back in time.
        value.time_offset = value_offset + (records - index) as i64 * interval;
        values.push(value);
    }
    Ok(SensorReport {
        report_type: report_types::TIME_SERIES,
        values,
    })
}

/// Concentration report: packed four-byte entries of sensor id, value
/// and a one-second-granularity offset.
pub fn parse_concentration(body: &[u8]) -> Result<SensorReport, Alert2Error> {
    let mut values = Vec::new();
    let mut pos = 0;
    while pos + 4 <= body.len() {
        let b1 = u16::from(body[pos]);
        let b2 = u16::from(body[pos + 1]);
        let b3 = u16::from(body[pos + 2]);
        let sensor_id = b1 | ((b2 & 0x1F) << 8);
        let magnitude = ((b2 & 0xE0) << 3) | b3;
        let mut value = SensorValue::new(
            sensor_id,
            SensorValueType::UInt,
            Magnitude::UInt(u32::from(magnitude)),
        );
        value.time_offset = i64::from(body[pos + 3]) * NSEC_PER_SEC;
        values.push(value);
        pos += 4;
    }
    Ok(SensorReport {
        report_type: report_types::CONCENTRATION,
        values,
    })
}

/// Interval byte: two-bit unit, six-bit value. Unit zero values past
/// 59 select sub-second intervals.
fn decode_interval(code: u8) -> i64 {
    let unit = (code & 0b1100_0000) >> 6;
    let value = i64::from(code & 0b0011_1111);
    match unit {
        0 => match value {
            1..=59 => value * NSEC_PER_SEC,
            60 => NSEC_PER_SEC / 10,
            61 => NSEC_PER_SEC / 100,
            62 => NSEC_PER_SEC / 1000,
            63 => NSEC_PER_SEC / 10_000,
            _ => NSEC_PER_SEC,
        },
        1 => value * NSEC_PER_MIN,
        2 => value * NSEC_PER_HOUR,
        _ => value * NSEC_PER_DAY,
    }
}

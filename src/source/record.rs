//! Records and typed values delivered to sinks.

use crate::stamp::Stamp;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// Storage type codes carried by value descriptors. A subset of the
/// datalogger type space: what the sources in this crate can actually
/// produce.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueType {
    Bool,
    Int4,
    UInt4,
    Int8,
    Float4,
    Float8,
    /// Nanosecond wall time.
    Stamp,
    Ascii,
}

/// One typed value slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    Bool(bool),
    Int4(i32),
    UInt4(u32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Stamp(i64),
    Ascii(String),
}

impl Value {
    /// The storage type of this value.
    #[must_use]
    pub fn value_type(&self) -> ValueType {
        match self {
            Self::Bool(_) => ValueType::Bool,
            Self::Int4(_) => ValueType::Int4,
            Self::UInt4(_) => ValueType::UInt4,
            Self::Int8(_) => ValueType::Int8,
            Self::Float4(_) => ValueType::Float4,
            Self::Float8(_) => ValueType::Float8,
            Self::Stamp(_) => ValueType::Stamp,
            Self::Ascii(_) => ValueType::Ascii,
        }
    }

    /// Widens to a float where a numeric reading makes sense.
    #[must_use]
    pub fn to_float(&self) -> Option<f64> {
        match self {
            Self::Bool(value) => Some(if *value { -1.0 } else { 0.0 }),
            Self::Int4(value) => Some(f64::from(*value)),
            Self::UInt4(value) => Some(f64::from(*value)),
            Self::Int8(value) => Some(*value as f64),
            Self::Float4(value) => Some(f64::from(*value)),
            Self::Float8(value) => Some(*value),
            Self::Stamp(value) => Some(*value as f64),
            Self::Ascii(text) => text.trim().parse().ok(),
        }
    }

    /// Compares numerically when both sides read as numbers, falling
    /// back to text comparison.
    #[must_use]
    pub fn compare(&self, other: &Self) -> Option<Ordering> {
        match (self.to_float(), other.to_float()) {
            (Some(left), Some(right)) => left.partial_cmp(&right),
            _ => Some(self.format().cmp(&other.format())),
        }
    }

    /// Formats the way records print in diagnostics and CSV output.
    #[must_use]
    pub fn format(&self) -> String {
        match self {
            Self::Bool(value) => if *value { "-1" } else { "0" }.to_string(),
            Self::Int4(value) => value.to_string(),
            Self::UInt4(value) => value.to_string(),
            Self::Int8(value) => value.to_string(),
            Self::Float4(value) => format_float(f64::from(*value)),
            Self::Float8(value) => format_float(*value),
            Self::Stamp(value) => Stamp::from_nanos(*value).to_string(),
            Self::Ascii(text) => text.clone(),
        }
    }
}

fn format_float(value: f64) -> String {
    if value.is_nan() {
        "NAN".to_string()
    } else if value.is_infinite() {
        if value > 0.0 { "INF" } else { "-INF" }.to_string()
    } else {
        let mut text = format!("{value}");
        if !text.contains('.') && !text.contains('e') {
            text.push_str(".0");
        }
        text
    }
}

impl fmt::Display for Value {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        out.write_str(&self.format())
    }
}

/// Describes one value slot of a record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueDesc {
    pub name: String,
    pub value_type: ValueType,
    /// Array subscripts for expanded array columns; empty for scalars.
    pub subscripts: Vec<u32>,
}

impl ValueDesc {
    #[must_use]
    pub fn scalar(name: &str, value_type: ValueType) -> Self {
        Self {
            name: name.to_string(),
            value_type,
            subscripts: Vec::new(),
        }
    }

    /// The column name with its subscript suffix, the way URIs write
    /// it.
    #[must_use]
    pub fn full_name(&self) -> String {
        if self.subscripts.is_empty() {
            self.name.clone()
        } else {
            let subscripts: Vec<String> =
                self.subscripts.iter().map(ToString::to_string).collect();
            format!("{}({})", self.name, subscripts.join(","))
        }
    }
}

/// Describes the shape of a table's records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordDesc {
    pub station: String,
    pub table: String,
    pub values: Vec<ValueDesc>,
}

impl RecordDesc {
    #[must_use]
    pub fn new(station: &str, table: &str) -> Self {
        Self {
            station: station.to_string(),
            table: table.to_string(),
            values: Vec::new(),
        }
    }

    /// Index of a value slot by column name, matching either the bare
    /// name or the subscripted form.
    #[must_use]
    pub fn find_value(&self, column: &str) -> Option<usize> {
        self.values
            .iter()
            .position(|value| value.name == column || value.full_name() == column)
    }
}

/// One record: description, stamp, position markers and value slots.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub desc: RecordDesc,
    pub stamp: Stamp,
    pub file_mark_no: u32,
    pub record_no: u32,
    pub values: Vec<Value>,
}

impl Record {
    #[must_use]
    pub fn new(desc: RecordDesc, stamp: Stamp, record_no: u32) -> Self {
        let values = Vec::with_capacity(desc.values.len());
        Self {
            desc,
            stamp,
            file_mark_no: 0,
            record_no,
            values,
        }
    }

    /// The value slot for a column name.
    #[must_use]
    pub fn value_by_name(&self, column: &str) -> Option<&Value> {
        self.desc
            .find_value(column)
            .and_then(|index| self.values.get(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_values_widen_to_float() {
        assert_eq!(Value::Int4(-3).to_float(), Some(-3.0));
        assert_eq!(Value::Ascii("2.5".to_string()).to_float(), Some(2.5));
        assert_eq!(Value::Bool(true).to_float(), Some(-1.0));
        assert_eq!(Value::Ascii("n/a".to_string()).to_float(), None);
    }

    #[test]
    fn comparison_is_numeric_when_possible() {
        assert_eq!(
            Value::Int4(2).compare(&Value::Float8(10.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Ascii("b".to_string()).compare(&Value::Ascii("a".to_string())),
            Some(Ordering::Greater)
        );
    }

    #[test]
    fn float_format_keeps_a_decimal_point() {
        assert_eq!(Value::Float8(3.0).format(), "3.0");
        assert_eq!(Value::Float8(f64::NAN).format(), "NAN");
    }

    #[test]
    fn subscripted_descriptor_names() {
        let desc = ValueDesc {
            name: "values".to_string(),
            value_type: ValueType::Float4,
            subscripts: vec![2, 3],
        };
        assert_eq!(desc.full_name(), "values(2,3)");
    }

    #[test]
    fn record_lookup_by_column() {
        let mut desc = RecordDesc::new("stn", "tbl");
        desc.values.push(ValueDesc::scalar("temp", ValueType::Float8));
        let mut record = Record::new(desc, Stamp::from_nanos(0), 1);
        record.values.push(Value::Float8(21.5));
        assert_eq!(record.value_by_name("temp"), Some(&Value::Float8(21.5)));
        assert_eq!(record.value_by_name("missing"), None);
    }
}

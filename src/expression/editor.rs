//! Function catalogue for expression editors.
//!
//! Hosting applications present a palette of functions with insertion
//! templates; this module describes what the engine supports without
//! the UI having to know the evaluator.

use super::functions::OpKind;

/// Palette grouping for one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditorCategory {
    Operators,
    Logic,
    Math,
    Strings,
    Time,
    Aggregates,
    StartConditions,
    Constants,
}

/// One palette entry.
#[derive(Debug, Clone)]
pub struct EditorEntry {
    pub name: &'static str,
    pub category: EditorCategory,
    /// Text inserted into the expression being edited.
    pub template: &'static str,
}

fn template_for(kind: OpKind) -> &'static str {
    match kind {
        OpKind::Iif => "IIF(condition, true_value, false_value)",
        OpKind::SelectSwitch => "SelectSwitch(condition1, value1, default)",
        OpKind::Mid => "Mid(text, start, length)",
        OpKind::Replace => "Replace(text, find, replacement)",
        OpKind::FormatFloat => "FormatFloat(value, decimals)",
        OpKind::FormatTime => "FormatTime(time, \"%Y-%m-%d %H:%M:%S\")",
        OpKind::AvgRun => "AvgRun(value, count)",
        OpKind::AvgRunOverTime => "AvgRunOverTime(value, nsecPerHour)",
        OpKind::AvgRunOverTimeWithReset => "AvgRunOverTimeWithReset(value, RESET_DAILY)",
        OpKind::MaxRunOverTimeWithReset => "MaxRunOverTimeWithReset(value, RESET_DAILY)",
        OpKind::MinRunOverTimeWithReset => "MinRunOverTimeWithReset(value, RESET_DAILY)",
        OpKind::TotalOverTimeWithReset => "TotalOverTimeWithReset(value, RESET_DAILY)",
        OpKind::StdDevOverTimeWithReset => "StdDevOverTimeWithReset(value, RESET_DAILY)",
        OpKind::ValueAtTime => "ValueAtTime(value, age, tolerance, default)",
        OpKind::StartAtRecord => "StartAtRecord(file_mark, record_no)",
        OpKind::StartAtTime => "StartAtTime(time)",
        OpKind::StartRelativeToNewest => "StartRelativeToNewest(nsecPerDay, OrderCollected)",
        OpKind::StartAtOffsetFromNewest => "StartAtOffsetFromNewest(offset)",
        OpKind::ReportOffset => "ReportOffset(offset)",
        _ => kind.name(),
    }
}

fn category_for(kind: OpKind) -> EditorCategory {
    use OpKind::*;
    match kind {
        Add | Sub | Mul | Div | Pow | Neg | Mod | Eq | Ne | Gt | Lt | Ge | Le => {
            EditorCategory::Operators
        }
        And | Or | Xor | Eqv | Imp | Not | Iif | SelectSwitch | IsFinite => EditorCategory::Logic,
        InStr | InStrRev | Left | Len | LTrim | Mid | Replace | Right | RTrim | Space | StrComp
        | StrReverse | Trim | Hex | HexToDec | FormatFloat | FormatFloatL => EditorCategory::Strings,
        FormatTime | SystemTime | SystemTimeGmt | Timestamp | SetTimestamp | LocalToGmt
        | GmtToLocal | ToDate | ToFloat | ToInt => EditorCategory::Time,
        Alias | AvgRun | AvgRunOverTime | AvgRunOverTimeWithReset | AvgSpa | Last | MaxRun
        | MaxRunOverTime | MaxRunOverTimeWithReset | MaxSpa | MedianRun | MedianRunOverTime
        | MinRun | MinRunOverTime | MinRunOverTimeWithReset | MinSpa | ValueAtTime | ValueSynch
        | Total | TotalOverTime | TotalOverTimeWithReset | StdDev | StdDevOverTime
        | StdDevOverTimeWithReset => EditorCategory::Aggregates,
        StartAtRecord | StartAtTime | StartAtNewest | StartAfterNewest | StartRelativeToNewest
        | StartAtOffsetFromNewest | ReportOffset => EditorCategory::StartConditions,
        _ => EditorCategory::Math,
    }
}

const CATALOGUE_OPS: &[OpKind] = &[
    OpKind::Abs,
    OpKind::Acos,
    OpKind::Asin,
    OpKind::Atn,
    OpKind::Atn2,
    OpKind::Cos,
    OpKind::Cosh,
    OpKind::Exp,
    OpKind::Fix,
    OpKind::Frac,
    OpKind::Iif,
    OpKind::Int,
    OpKind::Ln,
    OpKind::Log10,
    OpKind::Pwr,
    OpKind::Rnd,
    OpKind::Sgn,
    OpKind::Sin,
    OpKind::Sqr,
    OpKind::Tan,
    OpKind::SelectSwitch,
    OpKind::FormatFloat,
    OpKind::IsFinite,
    OpKind::Ceiling,
    OpKind::Floor,
    OpKind::Round,
    OpKind::InStr,
    OpKind::InStrRev,
    OpKind::Left,
    OpKind::Len,
    OpKind::Mid,
    OpKind::Replace,
    OpKind::Right,
    OpKind::Trim,
    OpKind::Hex,
    OpKind::HexToDec,
    OpKind::FormatTime,
    OpKind::SystemTime,
    OpKind::Timestamp,
    OpKind::SetTimestamp,
    OpKind::ToDate,
    OpKind::ToFloat,
    OpKind::ToInt,
    OpKind::AvgRun,
    OpKind::AvgRunOverTime,
    OpKind::AvgRunOverTimeWithReset,
    OpKind::AvgSpa,
    OpKind::Last,
    OpKind::MaxRun,
    OpKind::MaxRunOverTime,
    OpKind::MaxRunOverTimeWithReset,
    OpKind::MaxSpa,
    OpKind::MedianRun,
    OpKind::MinRun,
    OpKind::MinRunOverTime,
    OpKind::MinRunOverTimeWithReset,
    OpKind::MinSpa,
    OpKind::ValueAtTime,
    OpKind::Total,
    OpKind::TotalOverTime,
    OpKind::TotalOverTimeWithReset,
    OpKind::StdDev,
    OpKind::StdDevOverTime,
    OpKind::StartAtRecord,
    OpKind::StartAtTime,
    OpKind::StartAtNewest,
    OpKind::StartAfterNewest,
    OpKind::StartRelativeToNewest,
    OpKind::StartAtOffsetFromNewest,
    OpKind::ReportOffset,
];

const CONSTANT_NAMES: &[&str] = &[
    "TRUE",
    "FALSE",
    "PI",
    "e",
    "NOPLOT",
    "nsecPerSec",
    "nsecPerMin",
    "nsecPerHour",
    "nsecPerDay",
    "nsecPerWeek",
    "RESET_HOURLY",
    "RESET_DAILY",
    "RESET_WEEKLY",
    "RESET_MONTHLY",
    "RESET_YEARLY",
    "OrderCollected",
    "OrderLoggedWithHoles",
    "OrderLoggedWithoutHoles",
    "OrderRealTime",
];

/// The full palette, grouped for presentation.
#[must_use]
pub fn catalogue() -> Vec<EditorEntry> {
    let mut entries: Vec<EditorEntry> = CATALOGUE_OPS
        .iter()
        .map(|&kind| EditorEntry {
            name: kind.name(),
            category: category_for(kind),
            template: template_for(kind),
        })
        .collect();
    entries.extend(CONSTANT_NAMES.iter().map(|&name| EditorEntry {
        name,
        category: EditorCategory::Constants,
        template: name,
    }));
    entries
}

/// Entries for one palette group.
#[must_use]
pub fn catalogue_for(category: EditorCategory) -> Vec<EditorEntry> {
    catalogue()
        .into_iter()
        .filter(|entry| entry.category == category)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalogue_covers_start_conditions() {
        let starts = catalogue_for(EditorCategory::StartConditions);
        assert!(starts.iter().any(|entry| entry.name == "StartRelativeToNewest"));
        assert!(starts.iter().all(|entry| !entry.template.is_empty()));
    }

    #[test]
    fn templates_carry_argument_hints() {
        let entry = catalogue()
            .into_iter()
            .find(|entry| entry.name == "IIF")
            .unwrap();
        assert!(entry.template.contains("condition"));
    }
}

//! Operator and function evaluation.
//!
//! Every operator the factory can hand out is a variant of [`OpKind`];
//! evaluation pops the operator's operands off the stack and pushes
//! one result. Setup functions instead drain the stack into the
//! surrounding request configuration and stop the pass.

use super::token::{Category, FnState, Operand, Operator, Value};
use crate::source::request::OrderOption;
use crate::stamp::{Stamp, NSEC_PER_SEC};
use chrono::{Local, Offset, TimeZone};
use thiserror::Error;

/// Operators at or above this priority bind right to left.
pub const PREC_MAX_OPERATOR: u8 = 8;

/// Evaluation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EvalError {
    #[error("{0} ran out of operands")]
    StackUnderflow(&'static str),
    #[error("variable {0} has no value yet")]
    UnboundVariable(String),
    #[error("{function}: {reason}")]
    BadArgument {
        function: &'static str,
        reason: &'static str,
    },
    #[error("the expression left {0} operands on the stack")]
    UnbalancedResult(usize),
    #[error("the expression is empty")]
    Empty,
}

/// Request configuration accumulated by setup functions.
#[derive(Debug, Clone, Default)]
pub struct SetupConfig {
    pub start_option_set: bool,
    pub start_option: Option<SetupStart>,
    pub order_option: Option<OrderOption>,
    pub report_offset: i64,
}

/// The start options a setup function can choose.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SetupStart {
    AtRecord { file_mark_no: u32, record_no: u32 },
    AtTime(Stamp),
    AtNewest,
    AfterNewest,
    RelativeToNewest(i64),
    AtOffsetFromNewest(u32),
}

/// Reset rule codes used by the `*WithReset` aggregates.
pub mod reset_codes {
    pub const HOURLY: i64 = 1;
    pub const DAILY: i64 = 2;
    pub const MONTHLY: i64 = 3;
    pub const YEARLY: i64 = 4;
    pub const WEEKLY: i64 = 5;
    pub const CUSTOM: i64 = 6;
}

/// Every operator and function the engine evaluates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    // Infix arithmetic.
    Add,
    Sub,
    Mul,
    Div,
    Pow,
    Neg,
    // Infix comparison.
    Eq,
    Ne,
    Gt,
    Lt,
    Ge,
    Le,
    // Word operators.
    And,
    Or,
    Xor,
    Eqv,
    Imp,
    Not,
    Mod,
    // Math functions.
    Abs,
    Acos,
    Asin,
    Atn,
    Atn2,
    Cos,
    Cosh,
    Csgn,
    Exp,
    Fix,
    Frac,
    Iif,
    Int,
    Ln,
    Log10,
    Pwr,
    Rnd,
    Sgn,
    Sin,
    Sinh,
    Sqr,
    Tan,
    Tanh,
    SelectSwitch,
    FormatFloat,
    FormatFloatL,
    IsFinite,
    Ceiling,
    Floor,
    Round,
    // String functions.
    InStr,
    InStrRev,
    Left,
    Len,
    LTrim,
    Mid,
    Replace,
    Right,
    RTrim,
    Space,
    StrComp,
    StrReverse,
    Trim,
    Hex,
    HexToDec,
    // Time functions.
    FormatTime,
    SystemTime,
    SystemTimeGmt,
    Timestamp,
    SetTimestamp,
    LocalToGmt,
    GmtToLocal,
    ToDate,
    ToFloat,
    ToInt,
    // Stateful aggregates.
    Alias,
    AvgRun,
    AvgRunOverTime,
    AvgRunOverTimeWithReset,
    AvgSpa,
    Last,
    MaxRun,
    MaxRunOverTime,
    MaxRunOverTimeWithReset,
    MaxSpa,
    MedianRun,
    MedianRunOverTime,
    MinRun,
    MinRunOverTime,
    MinRunOverTimeWithReset,
    MinSpa,
    ValueAtTime,
    ValueSynch,
    Total,
    TotalOverTime,
    TotalOverTimeWithReset,
    StdDev,
    StdDevOverTime,
    StdDevOverTimeWithReset,
    // Setup functions.
    StartAtRecord,
    StartAtTime,
    StartAtNewest,
    StartAfterNewest,
    StartRelativeToNewest,
    StartAtOffsetFromNewest,
    ReportOffset,
}

impl OpKind {
    /// Display name, matching the factory registration.
    #[must_use]
    pub fn name(self) -> &'static str {
        match self {
            Self::Add => "+",
            Self::Sub => "-",
            Self::Mul => "*",
            Self::Div => "/",
            Self::Pow => "^",
            Self::Neg => "(-)",
            Self::Eq => "=",
            Self::Ne => "<>",
            Self::Gt => ">",
            Self::Lt => "<",
            Self::Ge => ">=",
            Self::Le => "<=",
            Self::And => "AND",
            Self::Or => "OR",
            Self::Xor => "XOR",
            Self::Eqv => "EQV",
            Self::Imp => "IMP",
            Self::Not => "NOT",
            Self::Mod => "MOD",
            Self::Abs => "ABS",
            Self::Acos => "ACOS",
            Self::Asin => "ASIN",
            Self::Atn => "ATN",
            Self::Atn2 => "ATN2",
            Self::Cos => "COS",
            Self::Cosh => "COSH",
            Self::Csgn => "CSGN",
            Self::Exp => "EXP",
            Self::Fix => "FIX",
            Self::Frac => "FRAC",
            Self::Iif => "IIF",
            Self::Int => "INT",
            Self::Ln => "LN",
            Self::Log10 => "LOG10",
            Self::Pwr => "PWR",
            Self::Rnd => "RND",
            Self::Sgn => "SGN",
            Self::Sin => "SIN",
            Self::Sinh => "SINH",
            Self::Sqr => "SQR",
            Self::Tan => "TAN",
            Self::Tanh => "TANH",
            Self::SelectSwitch => "SelectSwitch",
            Self::FormatFloat => "FormatFloat",
            Self::FormatFloatL => "FormatFloatL",
            Self::IsFinite => "IsFinite",
            Self::Ceiling => "Ceiling",
            Self::Floor => "Floor",
            Self::Round => "Round",
            Self::InStr => "InStr",
            Self::InStrRev => "InStrRev",
            Self::Left => "Left",
            Self::Len => "Len",
            Self::LTrim => "LTrim",
            Self::Mid => "Mid",
            Self::Replace => "Replace",
            Self::Right => "Right",
            Self::RTrim => "RTrim",
            Self::Space => "Space",
            Self::StrComp => "StrComp",
            Self::StrReverse => "StrReverse",
            Self::Trim => "Trim",
            Self::Hex => "Hex",
            Self::HexToDec => "HexToDec",
            Self::FormatTime => "FormatTime",
            Self::SystemTime => "SystemTime",
            Self::SystemTimeGmt => "SystemTimeGmt",
            Self::Timestamp => "Timestamp",
            Self::SetTimestamp => "SetTimestamp",
            Self::LocalToGmt => "LocalToGmt",
            Self::GmtToLocal => "GmtToLocal",
            Self::ToDate => "ToDate",
            Self::ToFloat => "ToFloat",
            Self::ToInt => "ToInt",
            Self::Alias => "Alias",
            Self::AvgRun => "AvgRun",
            Self::AvgRunOverTime => "AvgRunOverTime",
            Self::AvgRunOverTimeWithReset => "AvgRunOverTimeWithReset",
            Self::AvgSpa => "AvgSpa",
            Self::Last => "Last",
            Self::MaxRun => "MaxRun",
            Self::MaxRunOverTime => "MaxRunOverTime",
            Self::MaxRunOverTimeWithReset => "MaxRunOverTimeWithReset",
            Self::MaxSpa => "MaxSpa",
            Self::MedianRun => "MedianRun",
            Self::MedianRunOverTime => "MedianRunOverTime",
            Self::MinRun => "MinRun",
            Self::MinRunOverTime => "MinRunOverTime",
            Self::MinRunOverTimeWithReset => "MinRunOverTimeWithReset",
            Self::MinSpa => "MinSpa",
            Self::ValueAtTime => "ValueAtTime",
            Self::ValueSynch => "ValueSynch",
            Self::Total => "Total",
            Self::TotalOverTime => "TotalOverTime",
            Self::TotalOverTimeWithReset => "TotalOverTimeWithReset",
            Self::StdDev => "StdDev",
            Self::StdDevOverTime => "StdDevOverTime",
            Self::StdDevOverTimeWithReset => "StdDevOverTimeWithReset",
            Self::StartAtRecord => "StartAtRecord",
            Self::StartAtTime => "StartAtTime",
            Self::StartAtNewest => "StartAtNewest",
            Self::StartAfterNewest => "StartAfterNewest",
            Self::StartRelativeToNewest => "StartRelativeToNewest",
            Self::StartAtOffsetFromNewest => "StartAtOffsetFromNewest",
            Self::ReportOffset => "ReportOffset",
        }
    }

    /// Binding priority used by the infix conversion.
    #[must_use]
    pub fn priority(self) -> u8 {
        match self {
            Self::Or | Self::Xor | Self::Eqv | Self::Imp => 2,
            Self::And => 3,
            Self::Not => 4,
            Self::Eq | Self::Ne | Self::Gt | Self::Lt | Self::Ge | Self::Le => 5,
            Self::Add | Self::Sub => 6,
            Self::Mul | Self::Div | Self::Mod => 7,
            Self::Neg => 8,
            Self::Pow => 9,
            _ => 10,
        }
    }

    /// True for operators invoked as `Name(args)` rather than infix.
    #[must_use]
    pub fn is_function(self) -> bool {
        self.priority() == 10
    }

    /// True for operators that keep per-instance state and must be
    /// cloned fresh for every occurrence.
    #[must_use]
    pub fn has_state(self) -> bool {
        matches!(
            self,
            Self::Alias
                | Self::AvgRun
                | Self::AvgRunOverTime
                | Self::AvgRunOverTimeWithReset
                | Self::AvgSpa
                | Self::Last
                | Self::MaxRun
                | Self::MaxRunOverTime
                | Self::MaxRunOverTimeWithReset
                | Self::MaxSpa
                | Self::MedianRun
                | Self::MedianRunOverTime
                | Self::MinRun
                | Self::MinRunOverTime
                | Self::MinRunOverTimeWithReset
                | Self::MinSpa
                | Self::ValueAtTime
                | Self::ValueSynch
                | Self::Total
                | Self::TotalOverTime
                | Self::TotalOverTimeWithReset
                | Self::StdDev
                | Self::StdDevOverTime
                | Self::StdDevOverTimeWithReset
        )
    }

    /// True for the setup functions that configure requests and abort
    /// the evaluation pass.
    #[must_use]
    pub fn aborts_after_eval(self) -> bool {
        matches!(
            self,
            Self::StartAtRecord
                | Self::StartAtTime
                | Self::StartAtNewest
                | Self::StartAfterNewest
                | Self::StartRelativeToNewest
                | Self::StartAtOffsetFromNewest
                | Self::ReportOffset
        )
    }

    /// Fixed operand count, or `None` for functions whose count comes
    /// from comma counting.
    #[must_use]
    fn fixed_arity(self) -> Option<usize> {
        match self {
            Self::Neg | Self::Not => Some(1),
            Self::Add
            | Self::Sub
            | Self::Mul
            | Self::Div
            | Self::Pow
            | Self::Mod
            | Self::Eq
            | Self::Ne
            | Self::Gt
            | Self::Lt
            | Self::Ge
            | Self::Le
            | Self::And
            | Self::Or
            | Self::Xor
            | Self::Eqv
            | Self::Imp => Some(2),
            Self::Abs
            | Self::Acos
            | Self::Asin
            | Self::Atn
            | Self::Cos
            | Self::Cosh
            | Self::Csgn
            | Self::Exp
            | Self::Fix
            | Self::Frac
            | Self::Int
            | Self::Ln
            | Self::Log10
            | Self::Sgn
            | Self::Sin
            | Self::Sinh
            | Self::Sqr
            | Self::Tan
            | Self::Tanh
            | Self::IsFinite
            | Self::Ceiling
            | Self::Floor
            | Self::Len
            | Self::LTrim
            | Self::RTrim
            | Self::Trim
            | Self::Space
            | Self::StrReverse
            | Self::Hex
            | Self::HexToDec
            | Self::Timestamp
            | Self::LocalToGmt
            | Self::GmtToLocal
            | Self::ToDate
            | Self::ToFloat
            | Self::ToInt
            | Self::Last
            | Self::MaxRun
            | Self::MinRun
            | Self::Total
            | Self::ValueSynch => Some(1),
            Self::Atn2
            | Self::Pwr
            | Self::InStr
            | Self::InStrRev
            | Self::Left
            | Self::Right
            | Self::StrComp
            | Self::SetTimestamp
            | Self::FormatTime
            | Self::AvgRun
            | Self::AvgRunOverTime
            | Self::MedianRun
            | Self::MedianRunOverTime
            | Self::MaxRunOverTime
            | Self::MinRunOverTime
            | Self::TotalOverTime
            | Self::StdDev
            | Self::StdDevOverTime => Some(2),
            Self::Iif | Self::Replace => Some(3),
            Self::Rnd | Self::SystemTime | Self::SystemTimeGmt => Some(0),
            _ => None,
        }
    }
}

fn pop_args(
    stack: &mut Vec<Operand>,
    count: usize,
    name: &'static str,
) -> Result<Vec<Operand>, EvalError> {
    if stack.len() < count {
        return Err(EvalError::StackUnderflow(name));
    }
    let split = stack.len() - count;
    Ok(stack.split_off(split))
}

fn newest_stamp(args: &[Operand]) -> Stamp {
    args.iter().map(|arg| arg.stamp).max().unwrap_or_default()
}

fn push_float(stack: &mut Vec<Operand>, value: f64, stamp: Stamp) {
    stack.push(Operand::with_stamp(Value::Float(value), stamp));
}

/// The period start for a reset code, used to detect boundary
/// crossings.
fn reset_boundary(stamp: Stamp, code: i64, custom_interval: i64) -> i64 {
    match code {
        reset_codes::HOURLY => stamp.start_of_hour().nanos(),
        reset_codes::DAILY => stamp.start_of_day().nanos(),
        reset_codes::MONTHLY => stamp.start_of_month().nanos(),
        reset_codes::YEARLY => stamp.start_of_year().nanos(),
        reset_codes::WEEKLY => stamp.start_of_week().nanos(),
        reset_codes::CUSTOM if custom_interval > 0 => {
            stamp.nanos() - stamp.nanos().rem_euclid(custom_interval)
        }
        _ => 0,
    }
}

fn maybe_reset(state: &mut FnState, stamp: Stamp, code: i64, custom_interval: i64) {
    let boundary = reset_boundary(stamp, code, custom_interval);
    if let Some(last) = state.last_reset {
        if boundary != last.nanos() {
            state.samples.clear();
            state.accum = 0.0;
            state.count = 0;
        }
    }
    state.last_reset = Some(Stamp::from_nanos(boundary));
}

fn trim_count_window(state: &mut FnState, max: usize) {
    while state.samples.len() > max.max(1) {
        state.samples.pop_front();
    }
}

fn trim_time_window(state: &mut FnState, window: i64) {
    let Some(&(newest, _)) = state.samples.back() else {
        return;
    };
    while let Some(&(stamp, _)) = state.samples.front() {
        if newest - stamp > window {
            state.samples.pop_front();
        } else {
            break;
        }
    }
}

fn samples_mean(state: &FnState) -> f64 {
    if state.samples.is_empty() {
        f64::NAN
    } else {
        state.samples.iter().map(|(_, value)| value).sum::<f64>() / state.samples.len() as f64
    }
}

fn samples_total(state: &FnState) -> f64 {
    state.samples.iter().map(|(_, value)| value).sum()
}

fn samples_extreme(state: &FnState, max: bool) -> f64 {
    let mut iter = state.samples.iter().map(|(_, value)| *value);
    let Some(first) = iter.next() else {
        return f64::NAN;
    };
    iter.fold(first, |acc, value| if max { acc.max(value) } else { acc.min(value) })
}

fn samples_median(state: &FnState) -> f64 {
    if state.samples.is_empty() {
        return f64::NAN;
    }
    let mut sorted: Vec<f64> = state.samples.iter().map(|(_, value)| *value).collect();
    sorted.sort_by(|left, right| left.partial_cmp(right).unwrap_or(std::cmp::Ordering::Equal));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 1 {
        sorted[mid]
    } else {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    }
}

fn samples_std_dev(state: &FnState) -> f64 {
    let count = state.samples.len();
    if count < 2 {
        return f64::NAN;
    }
    let mean = samples_mean(state);
    let variance = state
        .samples
        .iter()
        .map(|(_, value)| (value - mean) * (value - mean))
        .sum::<f64>()
        / (count as f64 - 1.0);
    variance.sqrt()
}

/// Evaluates one operator against the stack. Setup functions write
/// `config` instead of producing a result.
pub fn eval_operator(
    op: &mut Operator,
    stack: &mut Vec<Operand>,
    config: &mut SetupConfig,
) -> Result<(), EvalError> {
    let kind = op.kind;
    let name = kind.name();
    if kind.aborts_after_eval() {
        let args = std::mem::take(stack);
        return eval_setup(kind, &args, config);
    }
    let count = kind
        .fixed_arity()
        .unwrap_or_else(|| op.args_count.max(1) as usize);
    let args = pop_args(stack, count, name)?;
    let stamp = newest_stamp(&args);

    match kind {
        // --- arithmetic -------------------------------------------
        OpKind::Add => push_float(stack, args[0].value.to_float() + args[1].value.to_float(), stamp),
        OpKind::Sub => push_float(stack, args[0].value.to_float() - args[1].value.to_float(), stamp),
        OpKind::Mul => push_float(stack, args[0].value.to_float() * args[1].value.to_float(), stamp),
        OpKind::Div => push_float(stack, args[0].value.to_float() / args[1].value.to_float(), stamp),
        OpKind::Pow | OpKind::Pwr => {
            push_float(stack, args[0].value.to_float().powf(args[1].value.to_float()), stamp);
        }
        OpKind::Neg => push_float(stack, -args[0].value.to_float(), stamp),
        OpKind::Mod => {
            let right = args[1].value.to_float();
            push_float(stack, args[0].value.to_float() % right, stamp);
        }

        // --- comparison -------------------------------------------
        OpKind::Eq => compare(stack, &args, stamp, |ord| ord == std::cmp::Ordering::Equal),
        OpKind::Ne => compare(stack, &args, stamp, |ord| ord != std::cmp::Ordering::Equal),
        OpKind::Gt => compare(stack, &args, stamp, |ord| ord == std::cmp::Ordering::Greater),
        OpKind::Lt => compare(stack, &args, stamp, |ord| ord == std::cmp::Ordering::Less),
        OpKind::Ge => compare(stack, &args, stamp, |ord| ord != std::cmp::Ordering::Less),
        OpKind::Le => compare(stack, &args, stamp, |ord| ord != std::cmp::Ordering::Greater),

        // --- logic ------------------------------------------------
        OpKind::And => {
            let result = args[0].value.to_bool() && args[1].value.to_bool();
            stack.push(Operand::with_stamp(Value::from_bool(result), stamp));
        }
        OpKind::Or => {
            let result = args[0].value.to_bool() || args[1].value.to_bool();
            stack.push(Operand::with_stamp(Value::from_bool(result), stamp));
        }
        OpKind::Xor => {
            let result = args[0].value.to_bool() != args[1].value.to_bool();
            stack.push(Operand::with_stamp(Value::from_bool(result), stamp));
        }
        OpKind::Eqv => {
            let result = args[0].value.to_bool() == args[1].value.to_bool();
            stack.push(Operand::with_stamp(Value::from_bool(result), stamp));
        }
        OpKind::Imp => {
            let result = !args[0].value.to_bool() || args[1].value.to_bool();
            stack.push(Operand::with_stamp(Value::from_bool(result), stamp));
        }
        OpKind::Not => {
            stack.push(Operand::with_stamp(Value::from_bool(!args[0].value.to_bool()), stamp));
        }

        // --- math -------------------------------------------------
        OpKind::Abs => push_float(stack, args[0].value.to_float().abs(), stamp),
        OpKind::Acos => push_float(stack, args[0].value.to_float().acos(), stamp),
        OpKind::Asin => push_float(stack, args[0].value.to_float().asin(), stamp),
        OpKind::Atn => push_float(stack, args[0].value.to_float().atan(), stamp),
        OpKind::Atn2 => {
            push_float(stack, args[0].value.to_float().atan2(args[1].value.to_float()), stamp);
        }
        OpKind::Cos => push_float(stack, args[0].value.to_float().cos(), stamp),
        OpKind::Cosh => push_float(stack, args[0].value.to_float().cosh(), stamp),
        OpKind::Csgn => push_float(stack, -args[0].value.to_float(), stamp),
        OpKind::Exp => push_float(stack, args[0].value.to_float().exp(), stamp),
        OpKind::Fix => push_float(stack, args[0].value.to_float().trunc(), stamp),
        OpKind::Frac => push_float(stack, args[0].value.to_float().fract(), stamp),
        OpKind::Int | OpKind::Floor => push_float(stack, args[0].value.to_float().floor(), stamp),
        OpKind::Ceiling => push_float(stack, args[0].value.to_float().ceil(), stamp),
        OpKind::Round => push_float(stack, args[0].value.to_float().round(), stamp),
        OpKind::Ln => push_float(stack, args[0].value.to_float().ln(), stamp),
        OpKind::Log10 => push_float(stack, args[0].value.to_float().log10(), stamp),
        OpKind::Sgn => push_float(stack, args[0].value.to_float().signum(), stamp),
        OpKind::Sin => push_float(stack, args[0].value.to_float().sin(), stamp),
        OpKind::Sinh => push_float(stack, args[0].value.to_float().sinh(), stamp),
        OpKind::Sqr => push_float(stack, args[0].value.to_float().sqrt(), stamp),
        OpKind::Tan => push_float(stack, args[0].value.to_float().tan(), stamp),
        OpKind::Tanh => push_float(stack, args[0].value.to_float().tanh(), stamp),
        OpKind::Rnd => push_float(stack, rand::random::<f64>(), stamp),
        OpKind::IsFinite => {
            stack.push(Operand::with_stamp(
                Value::from_bool(args[0].value.to_float().is_finite()),
                stamp,
            ));
        }
        OpKind::Iif => {
            let chosen = if args[0].value.to_bool() { &args[1] } else { &args[2] };
            stack.push(Operand::with_stamp(chosen.value.clone(), stamp));
        }
        OpKind::SelectSwitch => {
            // Condition/value pairs; an odd trailing argument is the
            // default.
            let mut result = None;
            let mut pairs = args.chunks_exact(2);
            for pair in &mut pairs {
                if pair[0].value.to_bool() {
                    result = Some(pair[1].value.clone());
                    break;
                }
            }
            if result.is_none() {
                result = pairs.remainder().first().map(|default| default.value.clone());
            }
            stack.push(Operand::with_stamp(result.unwrap_or(Value::Float(f64::NAN)), stamp));
        }
        OpKind::FormatFloat | OpKind::FormatFloatL => {
            let value = args[0].value.to_float();
            let decimals = args.get(1).map_or(2, |arg| arg.value.to_int().clamp(0, 17)) as usize;
            stack.push(Operand::with_stamp(
                Value::Str(format!("{value:.decimals$}")),
                stamp,
            ));
        }

        // --- strings ----------------------------------------------
        OpKind::Len => push_float(stack, args[0].value.to_text().chars().count() as f64, stamp),
        OpKind::Left => {
            let text = args[0].value.to_text();
            let count = args[1].value.to_int().max(0) as usize;
            let taken: String = text.chars().take(count).collect();
            stack.push(Operand::with_stamp(Value::Str(taken), stamp));
        }
        OpKind::Right => {
            let text = args[0].value.to_text();
            let count = args[1].value.to_int().max(0) as usize;
            let chars: Vec<char> = text.chars().collect();
            let start = chars.len().saturating_sub(count);
            stack.push(Operand::with_stamp(Value::Str(chars[start..].iter().collect()), stamp));
        }
        OpKind::Mid => {
            if args.len() < 2 {
                return Err(EvalError::BadArgument {
                    function: "Mid",
                    reason: "needs a string and a start position",
                });
            }
            let text: Vec<char> = args[0].value.to_text().chars().collect();
            let start = (args[1].value.to_int().max(1) - 1) as usize;
            let len = args
                .get(2)
                .map_or(usize::MAX, |arg| arg.value.to_int().max(0) as usize);
            let taken: String = text.iter().skip(start).take(len).collect();
            stack.push(Operand::with_stamp(Value::Str(taken), stamp));
        }
        OpKind::InStr => {
            let haystack = args[0].value.to_text();
            let needle = args[1].value.to_text();
            let position = haystack.find(&needle).map_or(0, |index| index + 1);
            push_float(stack, position as f64, stamp);
        }
        OpKind::InStrRev => {
            let haystack = args[0].value.to_text();
            let needle = args[1].value.to_text();
            let position = haystack.rfind(&needle).map_or(0, |index| index + 1);
            push_float(stack, position as f64, stamp);
        }
        OpKind::LTrim => {
            stack.push(Operand::with_stamp(
                Value::Str(args[0].value.to_text().trim_start().to_string()),
                stamp,
            ));
        }
        OpKind::RTrim => {
            stack.push(Operand::with_stamp(
                Value::Str(args[0].value.to_text().trim_end().to_string()),
                stamp,
            ));
        }
        OpKind::Trim => {
            stack.push(Operand::with_stamp(
                Value::Str(args[0].value.to_text().trim().to_string()),
                stamp,
            ));
        }
        OpKind::Replace => {
            let text = args[0].value.to_text();
            let find = args[1].value.to_text();
            let replacement = args[2].value.to_text();
            stack.push(Operand::with_stamp(Value::Str(text.replace(&find, &replacement)), stamp));
        }
        OpKind::Space => {
            let count = args[0].value.to_int().max(0) as usize;
            stack.push(Operand::with_stamp(Value::Str(" ".repeat(count)), stamp));
        }
        OpKind::StrComp => {
            let ordering = args[0].value.to_text().cmp(&args[1].value.to_text());
            push_float(
                stack,
                match ordering {
                    std::cmp::Ordering::Less => -1.0,
                    std::cmp::Ordering::Equal => 0.0,
                    std::cmp::Ordering::Greater => 1.0,
                },
                stamp,
            );
        }
        OpKind::StrReverse => {
            stack.push(Operand::with_stamp(
                Value::Str(args[0].value.to_text().chars().rev().collect()),
                stamp,
            ));
        }
        OpKind::Hex => {
            stack.push(Operand::with_stamp(
                Value::Str(format!("{:X}", args[0].value.to_int())),
                stamp,
            ));
        }
        OpKind::HexToDec => {
            let text = args[0].value.to_text();
            let parsed = i64::from_str_radix(text.trim(), 16).unwrap_or(0);
            push_float(stack, parsed as f64, stamp);
        }

        // --- time -------------------------------------------------
        OpKind::SystemTime | OpKind::SystemTimeGmt => {
            let now = Stamp::now();
            stack.push(Operand::with_stamp(Value::Date(now.nanos()), now));
        }
        OpKind::Timestamp => {
            stack.push(Operand::with_stamp(Value::Date(args[0].stamp.nanos()), args[0].stamp));
        }
        OpKind::SetTimestamp => {
            let new_stamp = Stamp::from_nanos(args[1].value.to_int());
            stack.push(Operand::with_stamp(args[0].value.clone(), new_stamp));
        }
        OpKind::FormatTime => {
            let time = Stamp::from_nanos(args[0].value.to_int());
            let pattern = args[1].value.to_text();
            stack.push(Operand::with_stamp(
                Value::Str(time.to_utc().format(&pattern).to_string()),
                stamp,
            ));
        }
        OpKind::LocalToGmt => {
            let offset = local_offset_nanos();
            stack.push(Operand::with_stamp(Value::Date(args[0].value.to_int() - offset), stamp));
        }
        OpKind::GmtToLocal => {
            let offset = local_offset_nanos();
            stack.push(Operand::with_stamp(Value::Date(args[0].value.to_int() + offset), stamp));
        }
        OpKind::ToDate => {
            stack.push(Operand::with_stamp(Value::Date(args[0].value.to_int()), stamp));
        }
        OpKind::ToFloat => push_float(stack, args[0].value.to_float(), stamp),
        OpKind::ToInt => {
            stack.push(Operand::with_stamp(Value::Int(args[0].value.to_int()), stamp));
        }

        // --- stateful aggregates ----------------------------------
        OpKind::Alias => {
            stack.push(args[0].clone());
        }
        OpKind::Last => {
            let previous = op.state.prev.take();
            op.state.prev = Some(args[0].value.clone());
            let value = previous.unwrap_or(Value::Float(f64::NAN));
            stack.push(Operand::with_stamp(value, stamp));
        }
        OpKind::AvgRun => {
            let window = args[1].value.to_int().max(1) as usize;
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_count_window(&mut op.state, window);
            push_float(stack, samples_mean(&op.state), stamp);
        }
        OpKind::AvgRunOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_mean(&op.state), stamp);
        }
        OpKind::AvgRunOverTimeWithReset => {
            stateful_with_reset(op, &args, stamp, samples_mean, stack);
        }
        OpKind::AvgSpa => {
            let total: f64 = args.iter().map(|arg| arg.value.to_float()).sum();
            push_float(stack, total / args.len().max(1) as f64, stamp);
        }
        OpKind::MaxSpa => {
            let result = args
                .iter()
                .map(|arg| arg.value.to_float())
                .fold(f64::NEG_INFINITY, f64::max);
            push_float(stack, result, stamp);
        }
        OpKind::MinSpa => {
            let result = args
                .iter()
                .map(|arg| arg.value.to_float())
                .fold(f64::INFINITY, f64::min);
            push_float(stack, result, stamp);
        }
        OpKind::MaxRun => {
            let value = args[0].value.to_float();
            op.state.accum = if op.state.count == 0 { value } else { op.state.accum.max(value) };
            op.state.count += 1;
            push_float(stack, op.state.accum, stamp);
        }
        OpKind::MinRun => {
            let value = args[0].value.to_float();
            op.state.accum = if op.state.count == 0 { value } else { op.state.accum.min(value) };
            op.state.count += 1;
            push_float(stack, op.state.accum, stamp);
        }
        OpKind::MaxRunOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_extreme(&op.state, true), stamp);
        }
        OpKind::MinRunOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_extreme(&op.state, false), stamp);
        }
        OpKind::MaxRunOverTimeWithReset => {
            stateful_with_reset(op, &args, stamp, |state| samples_extreme(state, true), stack);
        }
        OpKind::MinRunOverTimeWithReset => {
            stateful_with_reset(op, &args, stamp, |state| samples_extreme(state, false), stack);
        }
        OpKind::MedianRun => {
            let window = args[1].value.to_int().max(1) as usize;
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_count_window(&mut op.state, window);
            push_float(stack, samples_median(&op.state), stamp);
        }
        OpKind::MedianRunOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_median(&op.state), stamp);
        }
        OpKind::Total => {
            op.state.accum += args[0].value.to_float();
            push_float(stack, op.state.accum, stamp);
        }
        OpKind::TotalOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_total(&op.state), stamp);
        }
        OpKind::TotalOverTimeWithReset => {
            stateful_with_reset(op, &args, stamp, samples_total, stack);
        }
        OpKind::StdDev => {
            let window = args[1].value.to_int().max(1) as usize;
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_count_window(&mut op.state, window);
            push_float(stack, samples_std_dev(&op.state), stamp);
        }
        OpKind::StdDevOverTime => {
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            trim_time_window(&mut op.state, args[1].value.to_int());
            push_float(stack, samples_std_dev(&op.state), stamp);
        }
        OpKind::StdDevOverTimeWithReset => {
            stateful_with_reset(op, &args, stamp, samples_std_dev, stack);
        }
        OpKind::ValueAtTime => {
            if args.len() < 3 {
                return Err(EvalError::BadArgument {
                    function: "ValueAtTime",
                    reason: "needs value, age and tolerance",
                });
            }
            let age = args[1].value.to_int();
            let tolerance = args[2].value.to_int().max(0);
            let default = args
                .get(3)
                .map_or(f64::NAN, |operand| operand.value.to_float());
            op.state.samples.push_back((stamp, args[0].value.to_float()));
            // Keep twice the requested age so late samples still hit.
            trim_time_window(&mut op.state, age.saturating_mul(2).max(age + tolerance));
            let target = stamp.nanos() - age;
            let hit = op
                .state
                .samples
                .iter()
                .filter(|(sample_stamp, _)| (sample_stamp.nanos() - target).abs() <= tolerance)
                .min_by_key(|(sample_stamp, _)| (sample_stamp.nanos() - target).abs())
                .map(|(_, value)| *value);
            push_float(stack, hit.unwrap_or(default), stamp);
        }
        OpKind::ValueSynch => {
            // Sample and hold: remembers the newest value and returns
            // it stamped with the time it was taken.
            let sample_stamp = args[0].stamp;
            op.state.prev = Some(args[0].value.clone());
            op.state.last_reset = Some(sample_stamp);
            let value = op.state.prev.clone().unwrap_or(Value::Float(f64::NAN));
            stack.push(Operand::with_stamp(value, sample_stamp));
        }

        // Setup functions were handled before the argument pop.
        OpKind::StartAtRecord
        | OpKind::StartAtTime
        | OpKind::StartAtNewest
        | OpKind::StartAfterNewest
        | OpKind::StartRelativeToNewest
        | OpKind::StartAtOffsetFromNewest
        | OpKind::ReportOffset => unreachable!("setup functions abort before this point"),
    }
    Ok(())
}

fn compare(
    stack: &mut Vec<Operand>,
    args: &[Operand],
    stamp: Stamp,
    test: impl Fn(std::cmp::Ordering) -> bool,
) {
    let ordering = match (&args[0].value, &args[1].value) {
        (Value::Str(left), Value::Str(right)) => left.cmp(right),
        (left, right) => left
            .to_float()
            .partial_cmp(&right.to_float())
            .unwrap_or(std::cmp::Ordering::Equal),
    };
    stack.push(Operand::with_stamp(Value::from_bool(test(ordering)), stamp));
}

/// Common driver for the `*OverTimeWithReset` aggregates:
/// `(value, reset_code [, custom_interval])`.
fn stateful_with_reset(
    op: &mut Operator,
    args: &[Operand],
    stamp: Stamp,
    reduce: impl Fn(&FnState) -> f64,
    stack: &mut Vec<Operand>,
) {
    let code = args.get(1).map_or(reset_codes::DAILY, |arg| arg.value.to_int());
    let custom = args.get(2).map_or(0, |arg| arg.value.to_int());
    maybe_reset(&mut op.state, stamp, code, custom);
    op.state.samples.push_back((stamp, args[0].value.to_float()));
    push_float(stack, reduce(&op.state), stamp);
}

fn local_offset_nanos() -> i64 {
    let offset = Local
        .timestamp_opt(0, 0)
        .single()
        .map(|time| time.offset().fix().local_minus_utc())
        .unwrap_or(0);
    i64::from(offset) * NSEC_PER_SEC
}

/// Applies a setup function's drained operands to the configuration.
fn eval_setup(kind: OpKind, args: &[Operand], config: &mut SetupConfig) -> Result<(), EvalError> {
    // Order constants may ride along with any setup function.
    for arg in args {
        if arg.category == Category::OrderConstant {
            if let Some(order) = OrderOption::from_code(arg.value.to_int()) {
                config.order_option = Some(order);
            }
        }
    }
    let mut positional = args
        .iter()
        .filter(|arg| arg.category != Category::OrderConstant);
    let mut next_int = || positional.next().map(|arg| arg.value.to_int());
    match kind {
        OpKind::StartAtRecord => {
            let file_mark_no = next_int().ok_or(EvalError::BadArgument {
                function: "StartAtRecord",
                reason: "needs a file mark number",
            })? as u32;
            let record_no = next_int().ok_or(EvalError::BadArgument {
                function: "StartAtRecord",
                reason: "needs a record number",
            })? as u32;
            config.start_option = Some(SetupStart::AtRecord {
                file_mark_no,
                record_no,
            });
        }
        OpKind::StartAtTime => {
            let time = next_int().ok_or(EvalError::BadArgument {
                function: "StartAtTime",
                reason: "needs a time",
            })?;
            config.start_option = Some(SetupStart::AtTime(Stamp::from_nanos(time)));
        }
        OpKind::StartAtNewest => config.start_option = Some(SetupStart::AtNewest),
        OpKind::StartAfterNewest => config.start_option = Some(SetupStart::AfterNewest),
        OpKind::StartRelativeToNewest => {
            let interval = next_int().ok_or(EvalError::BadArgument {
                function: "StartRelativeToNewest",
                reason: "needs a backfill interval",
            })?;
            config.start_option = Some(SetupStart::RelativeToNewest(interval));
        }
        OpKind::StartAtOffsetFromNewest => {
            let offset = next_int().ok_or(EvalError::BadArgument {
                function: "StartAtOffsetFromNewest",
                reason: "needs a record offset",
            })? as u32;
            config.start_option = Some(SetupStart::AtOffsetFromNewest(offset));
        }
        OpKind::ReportOffset => {
            let offset = next_int().ok_or(EvalError::BadArgument {
                function: "ReportOffset",
                reason: "needs an offset",
            })?;
            config.report_offset = offset;
        }
        _ => unreachable!("only setup functions reach eval_setup"),
    }
    config.start_option_set = true;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn eval_one(kind: OpKind, operands: Vec<Operand>) -> Operand {
        let mut op = Operator::new(kind);
        op.args_count = operands.len() as u32;
        let mut stack = operands;
        let mut config = SetupConfig::default();
        eval_operator(&mut op, &mut stack, &mut config).unwrap();
        assert_eq!(stack.len(), 1);
        stack.pop().unwrap()
    }

    fn float(value: f64) -> Operand {
        Operand::new(Value::Float(value))
    }

    #[test]
    fn arithmetic_and_comparison() {
        assert_eq!(eval_one(OpKind::Add, vec![float(3.0), float(4.0)]).value.to_float(), 7.0);
        assert_eq!(eval_one(OpKind::Pow, vec![float(2.0), float(10.0)]).value.to_float(), 1024.0);
        assert_eq!(eval_one(OpKind::Gt, vec![float(3.0), float(4.0)]).value, Value::from_bool(false));
        assert_eq!(eval_one(OpKind::Le, vec![float(3.0), float(3.0)]).value, Value::from_bool(true));
    }

    #[test]
    fn iif_selects_branch() {
        let result = eval_one(OpKind::Iif, vec![float(-1.0), float(10.0), float(20.0)]);
        assert_eq!(result.value.to_float(), 10.0);
    }

    #[test]
    fn string_functions() {
        let text = |value: &str| Operand::new(Value::Str(value.to_string()));
        assert_eq!(eval_one(OpKind::Len, vec![text("hello")]).value.to_float(), 5.0);
        assert_eq!(
            eval_one(OpKind::Mid, vec![text("datalogger"), float(5.0), float(3.0)]).value,
            Value::Str("log".to_string())
        );
        assert_eq!(eval_one(OpKind::InStr, vec![text("abcdef"), text("cd")]).value.to_float(), 3.0);
        assert_eq!(
            eval_one(OpKind::Replace, vec![text("a-b"), text("-"), text("+")]).value,
            Value::Str("a+b".to_string())
        );
    }

    #[test]
    fn avg_run_keeps_a_count_window() {
        let mut op = Operator::new(OpKind::AvgRun);
        let mut config = SetupConfig::default();
        let mut results = Vec::new();
        for value in [1.0, 2.0, 3.0, 4.0] {
            let mut stack = vec![float(value), float(2.0)];
            eval_operator(&mut op, &mut stack, &mut config).unwrap();
            results.push(stack.pop().unwrap().value.to_float());
        }
        assert_relative_eq!(results[0], 1.0);
        assert_relative_eq!(results[1], 1.5);
        assert_relative_eq!(results[2], 2.5);
        assert_relative_eq!(results[3], 3.5);
    }

    #[test]
    fn max_run_over_time_drops_old_samples() {
        let mut op = Operator::new(OpKind::MaxRunOverTime);
        let mut config = SetupConfig::default();
        let window = 10 * NSEC_PER_SEC;
        let mut eval_at = |seconds: i64, value: f64| {
            let stamp = Stamp::from_nanos(seconds * NSEC_PER_SEC);
            let mut stack = vec![
                Operand::with_stamp(Value::Float(value), stamp),
                Operand::with_stamp(Value::Int(window), stamp),
            ];
            eval_operator(&mut op, &mut stack, &mut config).unwrap();
            stack.pop().unwrap().value.to_float()
        };
        assert_relative_eq!(eval_at(0, 9.0), 9.0);
        assert_relative_eq!(eval_at(5, 3.0), 9.0);
        // The 9.0 sample ages out of the window.
        assert_relative_eq!(eval_at(20, 1.0), 1.0);
    }

    #[test]
    fn with_reset_clears_on_boundary() {
        let mut op = Operator::new(OpKind::TotalOverTimeWithReset);
        let mut config = SetupConfig::default();
        let mut eval_at = |stamp: Stamp, value: f64| {
            let mut stack = vec![
                Operand::with_stamp(Value::Float(value), stamp),
                Operand::with_stamp(Value::Int(reset_codes::HOURLY), stamp),
            ];
            op.args_count = 2;
            eval_operator(&mut op, &mut stack, &mut config).unwrap();
            stack.pop().unwrap().value.to_float()
        };
        let base = Stamp::from_ymd_hms(2022, 5, 1, 10, 50, 0).unwrap();
        assert_relative_eq!(eval_at(base, 2.0), 2.0);
        assert_relative_eq!(eval_at(base + 60 * NSEC_PER_SEC, 3.0), 5.0);
        // Crossing into the 11:00 hour resets the total.
        assert_relative_eq!(eval_at(base + 700 * NSEC_PER_SEC, 4.0), 4.0);
    }

    #[test]
    fn last_returns_previous_sample() {
        let mut op = Operator::new(OpKind::Last);
        let mut config = SetupConfig::default();
        let mut stack = vec![float(1.0)];
        eval_operator(&mut op, &mut stack, &mut config).unwrap();
        assert!(stack.pop().unwrap().value.to_float().is_nan());
        let mut stack = vec![float(2.0)];
        eval_operator(&mut op, &mut stack, &mut config).unwrap();
        assert_relative_eq!(stack.pop().unwrap().value.to_float(), 1.0);
    }

    #[test]
    fn setup_function_drains_stack_and_configures() {
        let mut op = Operator::new(OpKind::StartRelativeToNewest);
        let mut config = SetupConfig::default();
        let mut stack = vec![
            Operand::new(Value::Int(7 * 86_400 * NSEC_PER_SEC)),
            Operand {
                value: Value::Int(OrderOption::Collected as i64),
                stamp: Stamp::from_nanos(0),
                category: Category::OrderConstant,
            },
        ];
        eval_operator(&mut op, &mut stack, &mut config).unwrap();
        assert!(stack.is_empty());
        assert!(config.start_option_set);
        assert_eq!(
            config.start_option,
            Some(SetupStart::RelativeToNewest(7 * 86_400 * NSEC_PER_SEC))
        );
        assert_eq!(config.order_option, Some(OrderOption::Collected));
    }

    #[test]
    fn select_switch_picks_first_true_pair() {
        let result = eval_one(
            OpKind::SelectSwitch,
            vec![float(0.0), float(1.0), float(-1.0), float(2.0), float(9.0)],
        );
        assert_eq!(result.value.to_float(), 2.0);
        let fallback = eval_one(
            OpKind::SelectSwitch,
            vec![float(0.0), float(1.0), float(0.0), float(2.0), float(9.0)],
        );
        assert_eq!(fallback.value.to_float(), 9.0);
    }

    #[test]
    fn operators_propagate_the_newest_stamp() {
        let old = Operand::with_stamp(Value::Float(1.0), Stamp::from_nanos(100));
        let new = Operand::with_stamp(Value::Float(2.0), Stamp::from_nanos(500));
        let result = eval_one(OpKind::Add, vec![old, new]);
        assert_eq!(result.stamp, Stamp::from_nanos(500));
    }
}

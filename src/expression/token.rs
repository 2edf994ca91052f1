//! Token and value representation for the expression engine.
//!
//! Tokens are shared between the postfix stack and the variables map,
//! so the same variable instance seen twice in an expression is bound
//! once. Stateful function tokens carry per-instance window state.

use super::functions::OpKind;
use crate::source::request::RequestHandle;
use crate::stamp::Stamp;
use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt;
use std::rc::Rc;

/// A computed value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Int(i64),
    Float(f64),
    /// Nanosecond wall time.
    Date(i64),
    Str(String),
}

impl Value {
    /// Numeric reading; strings parse when they look like numbers.
    #[must_use]
    pub fn to_float(&self) -> f64 {
        match self {
            Self::Int(value) => *value as f64,
            Self::Float(value) => *value,
            Self::Date(value) => *value as f64,
            Self::Str(text) => text.trim().parse().unwrap_or(f64::NAN),
        }
    }

    /// Integer reading, truncating floats.
    #[must_use]
    pub fn to_int(&self) -> i64 {
        match self {
            Self::Int(value) => *value,
            Self::Float(value) => *value as i64,
            Self::Date(value) => *value,
            Self::Str(text) => text.trim().parse().unwrap_or(0),
        }
    }

    /// Truth reading: anything non-zero is true.
    #[must_use]
    pub fn to_bool(&self) -> bool {
        match self {
            Self::Str(text) => !text.is_empty(),
            other => other.to_float() != 0.0,
        }
    }

    /// Text reading.
    #[must_use]
    pub fn to_text(&self) -> String {
        match self {
            Self::Str(text) => text.clone(),
            Self::Int(value) => value.to_string(),
            Self::Date(value) => Stamp::from_nanos(*value).to_string(),
            Self::Float(value) => value.to_string(),
        }
    }

    /// The canonical boolean values: true is -1, false is 0.
    #[must_use]
    pub fn from_bool(value: bool) -> Self {
        Self::Float(if value { -1.0 } else { 0.0 })
    }
}

/// Where a constant came from; setup functions read categories to
/// tell order codes from plain numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Category {
    #[default]
    General,
    MathConstant,
    TimeConstant,
    ResetConstant,
    OrderConstant,
}

/// One entry on the evaluation stack.
#[derive(Debug, Clone, PartialEq)]
pub struct Operand {
    pub value: Value,
    pub stamp: Stamp,
    pub category: Category,
}

impl Operand {
    #[must_use]
    pub fn new(value: Value) -> Self {
        Self {
            value,
            stamp: Stamp::from_nanos(0),
            category: Category::General,
        }
    }

    #[must_use]
    pub fn with_stamp(value: Value, stamp: Stamp) -> Self {
        Self {
            value,
            stamp,
            category: Category::General,
        }
    }
}

/// A named variable, late-bound to record values.
#[derive(Debug, Clone)]
pub struct Variable {
    pub name: String,
    pub value: Option<Value>,
    pub stamp: Stamp,
    /// The data request feeding this variable, once compiled.
    pub request: Option<RequestHandle>,
    /// Evaluates to the owning source's current server time instead of
    /// a record value.
    pub is_source_time: bool,
}

impl Variable {
    #[must_use]
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: None,
            stamp: Stamp::from_nanos(0),
            request: None,
            is_source_time: false,
        }
    }

    pub fn set_value(&mut self, value: Value, stamp: Stamp) {
        self.value = Some(value);
        self.stamp = stamp;
    }
}

/// Per-instance state for stateful functions: sample windows, running
/// accumulators and the reset clock.
#[derive(Debug, Clone, Default)]
pub struct FnState {
    pub samples: VecDeque<(Stamp, f64)>,
    pub prev: Option<Value>,
    pub accum: f64,
    pub count: u64,
    pub last_reset: Option<Stamp>,
}

/// An operator or function occurrence.
#[derive(Debug, Clone)]
pub struct Operator {
    pub kind: OpKind,
    /// Argument count established by comma counting during the infix
    /// conversion; meaningful only for function tokens.
    pub args_count: u32,
    pub state: FnState,
}

impl Operator {
    #[must_use]
    pub fn new(kind: OpKind) -> Self {
        Self {
            kind,
            args_count: 1,
            state: FnState::default(),
        }
    }
}

/// The token sum type.
#[derive(Debug, Clone)]
pub enum Token {
    Constant {
        value: Value,
        name: Option<String>,
        category: Category,
    },
    Variable(Variable),
    Operator(Operator),
    LParen,
    RParen,
    Comma,
    SemiColon,
}

impl Token {
    #[must_use]
    pub fn constant(value: Value) -> Self {
        Self::Constant {
            value,
            name: None,
            category: Category::General,
        }
    }

    #[must_use]
    pub fn named_constant(value: Value, name: &str, category: Category) -> Self {
        Self::Constant {
            value,
            name: Some(name.to_string()),
            category,
        }
    }

    #[must_use]
    pub fn is_operand(&self) -> bool {
        matches!(self, Self::Constant { .. } | Self::Variable(_))
    }

    #[must_use]
    pub fn is_variable(&self) -> bool {
        matches!(self, Self::Variable(_))
    }

    #[must_use]
    pub fn is_operator(&self) -> bool {
        matches!(self, Self::Operator(_))
    }

    /// True for operators invoked with parenthesised argument lists.
    #[must_use]
    pub fn is_function(&self) -> bool {
        match self {
            Self::Operator(op) => op.kind.is_function(),
            _ => false,
        }
    }

    #[must_use]
    pub fn is_lparen(&self) -> bool {
        matches!(self, Self::LParen)
    }

    #[must_use]
    pub fn is_rparen(&self) -> bool {
        matches!(self, Self::RParen)
    }

    #[must_use]
    pub fn is_comma(&self) -> bool {
        matches!(self, Self::Comma)
    }

    #[must_use]
    pub fn is_semicolon(&self) -> bool {
        matches!(self, Self::SemiColon)
    }

    /// Evaluation priority; operands have none. Commas outrank every
    /// operator so a comma flushes the whole pending argument.
    #[must_use]
    pub fn priority(&self) -> u8 {
        match self {
            Self::Operator(op) => op.kind.priority(),
            Self::Comma => 11,
            _ => 0,
        }
    }

    /// True when evaluating this token configures the surrounding
    /// requests and stops the pass.
    #[must_use]
    pub fn aborts_after_eval(&self) -> bool {
        match self {
            Self::Operator(op) => op.kind.aborts_after_eval(),
            _ => false,
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, out: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Constant { value, name, .. } => match name {
                Some(name) => write!(out, "{name}"),
                None => write!(out, "{}", value.to_text()),
            },
            Self::Variable(variable) => write!(out, "{}", variable.name),
            Self::Operator(op) => write!(out, "{}", op.kind.name()),
            Self::LParen => write!(out, "("),
            Self::RParen => write!(out, ")"),
            Self::Comma => write!(out, ","),
            Self::SemiColon => write!(out, ";"),
        }
    }
}

/// Shared token handle: the variables map and the postfix stack refer
/// to the same instances.
pub type TokenRef = Rc<RefCell<Token>>;

/// Wraps a token in a shared handle.
#[must_use]
pub fn token_ref(token: Token) -> TokenRef {
    Rc::new(RefCell::new(token))
}

//! The token factory: names to tokens, plus the request binder that
//! turns a compiled expression into live data requests.

use super::functions::OpKind;
use super::handler::ExpressionHandler;
use super::lexer::ParseError;
use super::token::{token_ref, Category, Operator, Token, TokenRef, Value, Variable};
use crate::source::request::{request_handle, OrderOption, Request, RequestHandle};
use crate::source::uri::SourceUri;
use crate::stamp::{
    NSEC_PER_DAY, NSEC_PER_HOUR, NSEC_PER_MIN, NSEC_PER_MSEC, NSEC_PER_SEC, NSEC_PER_USEC,
    NSEC_PER_WEEK,
};
use std::collections::HashMap;

enum Template {
    Op(OpKind),
    Constant(Value, Category),
    LParen,
    RParen,
    Comma,
    SemiColon,
}

/// Builds tokens from lexemes. Names in the function table yield their
/// registered operator or constant; numbers yield constants; anything
/// else becomes a variable.
pub struct TokenFactory {
    functions: HashMap<&'static str, Template>,
    /// When set, variables are written quoted (`"name"`) and `$"…"`
    /// spells a string constant; otherwise bare names are variables
    /// and `"…"` is a string constant.
    variables_quoted: bool,
}

impl TokenFactory {
    #[must_use]
    pub fn new() -> Self {
        Self::with_quoted_variables(false)
    }

    #[must_use]
    pub fn with_quoted_variables(variables_quoted: bool) -> Self {
        let mut functions: HashMap<&'static str, Template> = HashMap::new();

        functions.insert("(", Template::LParen);
        functions.insert(")", Template::RParen);
        functions.insert(",", Template::Comma);
        functions.insert(";", Template::SemiColon);

        // Constants.
        let constant = |value: Value, category: Category| Template::Constant(value, category);
        functions.insert("NOPLOT", constant(Value::Float(f64::NAN), Category::MathConstant));
        functions.insert("NAN", constant(Value::Float(f64::NAN), Category::MathConstant));
        functions.insert("INF", constant(Value::Float(f64::INFINITY), Category::MathConstant));
        functions.insert("TRUE", constant(Value::Float(-1.0), Category::MathConstant));
        functions.insert("FALSE", constant(Value::Float(0.0), Category::MathConstant));
        functions.insert("PI", constant(Value::Float(std::f64::consts::PI), Category::MathConstant));
        functions.insert("e", constant(Value::Float(std::f64::consts::E), Category::MathConstant));
        functions.insert("nsecPerUSec", constant(Value::Int(NSEC_PER_USEC), Category::TimeConstant));
        functions.insert("nsecPerMSec", constant(Value::Int(NSEC_PER_MSEC), Category::TimeConstant));
        functions.insert("nsecPerSec", constant(Value::Int(NSEC_PER_SEC), Category::TimeConstant));
        functions.insert("nsecPerMin", constant(Value::Int(NSEC_PER_MIN), Category::TimeConstant));
        functions.insert("nsecPerHour", constant(Value::Int(NSEC_PER_HOUR), Category::TimeConstant));
        functions.insert("nsecPerDay", constant(Value::Int(NSEC_PER_DAY), Category::TimeConstant));
        functions.insert("nsecPerWeek", constant(Value::Int(NSEC_PER_WEEK), Category::TimeConstant));
        functions.insert("RESET_HOURLY", constant(Value::Int(1), Category::ResetConstant));
        functions.insert("RESET_DAILY", constant(Value::Int(2), Category::ResetConstant));
        functions.insert("RESET_MONTHLY", constant(Value::Int(3), Category::ResetConstant));
        functions.insert("RESET_YEARLY", constant(Value::Int(4), Category::ResetConstant));
        functions.insert("RESET_WEEKLY", constant(Value::Int(5), Category::ResetConstant));
        functions.insert("RESET_CUSTOM", constant(Value::Int(6), Category::ResetConstant));
        functions.insert(
            "OrderCollected",
            constant(Value::Int(OrderOption::Collected as i64), Category::OrderConstant),
        );
        functions.insert(
            "OrderLoggedWithHoles",
            constant(Value::Int(OrderOption::LoggedWithHoles as i64), Category::OrderConstant),
        );
        functions.insert(
            "OrderLoggedWithoutHoles",
            constant(Value::Int(OrderOption::LoggedWithoutHoles as i64), Category::OrderConstant),
        );
        functions.insert(
            "OrderRealTime",
            constant(Value::Int(OrderOption::RealTime as i64), Category::OrderConstant),
        );

        // Operators and functions.
        for kind in ALL_OPS {
            functions.insert(kind.name(), Template::Op(*kind));
        }

        Self {
            functions,
            variables_quoted,
        }
    }

    /// Builds the token for a lexeme, or `None` for a unary plus.
    /// `prev` drives the unary-minus rules.
    pub fn make_token(
        &self,
        prev: Option<&TokenRef>,
        lexeme: &str,
        begin_pos: usize,
    ) -> Result<Option<TokenRef>, ParseError> {
        // Unary context: the start of input, after a non-function
        // operator, after a left paren or after a semicolon.
        let unary_context = match prev {
            None => true,
            Some(prev) => {
                let prev = prev.borrow();
                (prev.is_operator() && !prev.is_function())
                    || prev.is_lparen()
                    || prev.is_semicolon()
            }
        };
        if unary_context && lexeme == "+" {
            return Ok(None);
        }
        let token = if unary_context && lexeme == "-" {
            Token::Operator(Operator::new(OpKind::Neg))
        } else if let Some(template) = self.functions.get(lexeme) {
            match template {
                Template::Op(kind) => Token::Operator(Operator::new(*kind)),
                Template::Constant(value, category) => {
                    Token::named_constant(value.clone(), lexeme, *category)
                }
                Template::LParen => Token::LParen,
                Template::RParen => Token::RParen,
                Template::Comma => Token::Comma,
                Template::SemiColon => Token::SemiColon,
            }
        } else if is_number(lexeme) {
            Token::constant(parse_number(lexeme, begin_pos)?)
        } else if lexeme.starts_with('&') {
            Token::constant(parse_number(lexeme, begin_pos)?)
        } else if self.variables_quoted && lexeme.starts_with('$') {
            let text = lexeme
                .strip_prefix('$')
                .and_then(|rest| rest.strip_prefix('"'))
                .and_then(|rest| rest.strip_suffix('"'))
                .ok_or_else(|| ParseError::new(begin_pos, "malformed string constant"))?;
            Token::constant(Value::Str(text.to_string()))
        } else if !self.variables_quoted && lexeme.starts_with('"') && lexeme.ends_with('"') && lexeme.len() >= 2
        {
            Token::constant(Value::Str(lexeme[1..lexeme.len() - 1].to_string()))
        } else {
            Token::Variable(Variable::new(trim_variable_name(lexeme)))
        };

        // Two operands in a row can never be valid infix.
        if let Some(prev) = prev {
            if prev.borrow().is_operand() && token.is_operand() {
                return Err(ParseError::new(
                    begin_pos,
                    "syntax error: operand followed by an operand",
                ));
            }
        }
        Ok(Some(token_ref(token)))
    }

    /// Compiles an expression against a default source and binds one
    /// request per data variable.
    ///
    /// Bare variable names pick up `default_source`; a variable that
    /// names only a source becomes a source-time variable with no
    /// request. Setup functions are drained into the configuration
    /// every request is frozen with.
    pub fn make_expression(
        &self,
        expression: &str,
        default_source: Option<&str>,
        default_order: OrderOption,
    ) -> Result<(ExpressionHandler, Vec<RequestHandle>), ParseError> {
        let mut handler = ExpressionHandler::new();
        handler.tokenise(self, expression)?;

        // Work out each variable's URI and spot source-only names.
        let names: Vec<String> = handler.variables().keys().cloned().collect();
        let mut bindings: Vec<(String, SourceUri)> = Vec::new();
        for name in names {
            let bare = trim_variable_name(&name).to_string();
            let uri_text = if bare.contains(':') {
                bare.clone()
            } else if let Some(source) = default_source {
                format!("{source}:{bare}")
            } else {
                bare.clone()
            };
            if !uri_text.contains(':') {
                // A source-only reference: the variable evaluates to
                // the source's current server time.
                if let Some(token) = handler.variables().get(&name) {
                    if let Token::Variable(variable) = &mut *token.borrow_mut() {
                        variable.is_source_time = true;
                    }
                }
                continue;
            }
            bindings.push((name, SourceUri::new(&uri_text)));
        }

        // Evaluate away the setup functions before any request is
        // configured.
        while handler.has_aborting_tokens() {
            handler
                .eval()
                .map_err(|error| ParseError::new(0, &error.to_string()))?;
        }

        let mut requests = Vec::new();
        for (name, uri) in bindings {
            let mut request = Request::new(uri);
            request.set_order_option(default_order);
            handler.configure_request(&mut request);
            let handle = request_handle(request);
            if let Some(token) = handler.variables().get(&name) {
                if let Token::Variable(variable) = &mut *token.borrow_mut() {
                    variable.request = Some(handle.clone());
                }
            }
            requests.push(handle);
        }
        Ok((handler, requests))
    }
}

impl Default for TokenFactory {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_variable_name(lexeme: &str) -> &str {
    let trimmed = lexeme.strip_prefix('$').unwrap_or(lexeme);
    let trimmed = trimmed.strip_prefix('"').unwrap_or(trimmed);
    trimmed.strip_suffix('"').unwrap_or(trimmed)
}

/// True when the lexeme reads as a decimal number.
#[must_use]
pub fn is_number(lexeme: &str) -> bool {
    let mut found_decimal = false;
    let mut found_exp = false;
    let mut found_sign = false;
    let mut chars = lexeme.chars().peekable();
    let Some(first) = chars.next() else {
        return false;
    };
    if first != '.' && !first.is_ascii_digit() {
        return false;
    }
    if first == '.' {
        found_decimal = true;
    }
    let mut prev = first;
    for ch in chars {
        match ch {
            '.' => {
                if found_decimal || found_exp {
                    return false;
                }
                found_decimal = true;
            }
            'e' | 'E' => {
                if found_exp {
                    return false;
                }
                found_exp = true;
            }
            '+' | '-' => {
                if found_sign || !found_exp || !matches!(prev, 'e' | 'E') {
                    return false;
                }
                found_sign = true;
            }
            digit if digit.is_ascii_digit() => {}
            _ => return false,
        }
        prev = ch;
    }
    true
}

fn parse_number(lexeme: &str, begin_pos: usize) -> Result<Value, ParseError> {
    let bad = || ParseError::new(begin_pos, "unreadable number constant");
    if let Some(hex) = lexeme.strip_prefix("&h").or_else(|| lexeme.strip_prefix("&H")) {
        return i64::from_str_radix(hex, 16).map(Value::Int).map_err(|_| bad());
    }
    if let Some(bin) = lexeme.strip_prefix("&b").or_else(|| lexeme.strip_prefix("&B")) {
        return i64::from_str_radix(bin, 2).map(Value::Int).map_err(|_| bad());
    }
    if !lexeme.contains('.') && !lexeme.contains('e') && !lexeme.contains('E') {
        if let Ok(value) = lexeme.parse::<i64>() {
            return Ok(Value::Int(value));
        }
    }
    lexeme.parse::<f64>().map(Value::Float).map_err(|_| bad())
}

const ALL_OPS: &[OpKind] = &[
    OpKind::Add,
    OpKind::Sub,
    OpKind::Mul,
    OpKind::Div,
    OpKind::Pow,
    OpKind::Eq,
    OpKind::Ne,
    OpKind::Gt,
    OpKind::Lt,
    OpKind::Ge,
    OpKind::Le,
    OpKind::And,
    OpKind::Or,
    OpKind::Xor,
    OpKind::Eqv,
    OpKind::Imp,
    OpKind::Not,
    OpKind::Mod,
    OpKind::Abs,
    OpKind::Acos,
    OpKind::Asin,
    OpKind::Atn,
    OpKind::Atn2,
    OpKind::Cos,
    OpKind::Cosh,
    OpKind::Csgn,
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
    OpKind::Sinh,
    OpKind::Sqr,
    OpKind::Tan,
    OpKind::Tanh,
    OpKind::SelectSwitch,
    OpKind::FormatFloat,
    OpKind::FormatFloatL,
    OpKind::IsFinite,
    OpKind::Ceiling,
    OpKind::Floor,
    OpKind::Round,
    OpKind::InStr,
    OpKind::InStrRev,
    OpKind::Left,
    OpKind::Len,
    OpKind::LTrim,
    OpKind::Mid,
    OpKind::Replace,
    OpKind::Right,
    OpKind::RTrim,
    OpKind::Space,
    OpKind::StrComp,
    OpKind::StrReverse,
    OpKind::Trim,
    OpKind::Hex,
    OpKind::HexToDec,
    OpKind::FormatTime,
    OpKind::SystemTime,
    OpKind::SystemTimeGmt,
    OpKind::Timestamp,
    OpKind::SetTimestamp,
    OpKind::LocalToGmt,
    OpKind::GmtToLocal,
    OpKind::ToDate,
    OpKind::ToFloat,
    OpKind::ToInt,
    OpKind::Alias,
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
    OpKind::MedianRunOverTime,
    OpKind::MinRun,
    OpKind::MinRunOverTime,
    OpKind::MinRunOverTimeWithReset,
    OpKind::MinSpa,
    OpKind::ValueAtTime,
    OpKind::ValueSynch,
    OpKind::Total,
    OpKind::TotalOverTime,
    OpKind::TotalOverTimeWithReset,
    OpKind::StdDev,
    OpKind::StdDevOverTime,
    OpKind::StdDevOverTimeWithReset,
    OpKind::StartAtRecord,
    OpKind::StartAtTime,
    OpKind::StartAtNewest,
    OpKind::StartAfterNewest,
    OpKind::StartRelativeToNewest,
    OpKind::StartAtOffsetFromNewest,
    OpKind::ReportOffset,
];

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::request::StartOption;
    use crate::stamp::Stamp;
    use approx::assert_relative_eq;

    #[test]
    fn number_recognition() {
        assert!(is_number("42"));
        assert!(is_number("4.2"));
        assert!(is_number(".5"));
        assert!(is_number("1e5"));
        assert!(is_number("1.5e-3"));
        assert!(!is_number("x1"));
        assert!(!is_number("1.2.3"));
        assert!(!is_number("1e4e5"));
        assert!(!is_number("1-2"));
    }

    #[test]
    fn radix_constants_parse() {
        assert_eq!(parse_number("&hFF", 0).unwrap(), Value::Int(255));
        assert_eq!(parse_number("&b101", 0).unwrap(), Value::Int(5));
    }

    #[test]
    fn unknown_names_become_variables() {
        let factory = TokenFactory::new();
        let token = factory.make_token(None, "src:stn.tbl.v", 0).unwrap().unwrap();
        assert!(token.borrow().is_variable());
    }

    #[test]
    fn operand_after_operand_is_rejected() {
        let factory = TokenFactory::new();
        let one = factory.make_token(None, "1", 0).unwrap().unwrap();
        let error = factory.make_token(Some(&one), "2", 2).unwrap_err();
        assert!(error.reason.contains("operand"));
    }

    #[test]
    fn string_constants_depend_on_mode() {
        let default_mode = TokenFactory::new();
        let token = default_mode.make_token(None, "\"text\"", 0).unwrap().unwrap();
        assert!(matches!(
            &*token.borrow(),
            Token::Constant {
                value: Value::Str(text),
                ..
            } if text == "text"
        ));

        let quoted_mode = TokenFactory::with_quoted_variables(true);
        let variable = quoted_mode.make_token(None, "\"stn.tbl.v\"", 0).unwrap().unwrap();
        assert!(variable.borrow().is_variable());
        let constant = quoted_mode.make_token(None, "$\"text\"", 0).unwrap().unwrap();
        assert!(matches!(&*constant.borrow(), Token::Constant { .. }));
    }

    #[test]
    fn make_expression_binds_requests() {
        let factory = TokenFactory::new();
        let (mut handler, requests) = factory
            .make_expression(
                "StartRelativeToNewest(nsecPerWeek, OrderCollected); src:stn.tbl.v1 + src:stn.tbl.v2",
                None,
                OrderOption::RealTime,
            )
            .unwrap();
        assert_eq!(requests.len(), 2);
        for request in &requests {
            let request = request.lock().unwrap();
            assert!(request.is_frozen());
            assert_eq!(request.start_option(), StartOption::RelativeToNewest);
            assert_eq!(request.backfill_interval(), NSEC_PER_WEEK);
            assert_eq!(request.order_option(), OrderOption::Collected);
        }
        handler.assign_variable("src:stn.tbl.v1", Value::Float(3.0), Stamp::from_nanos(0));
        handler.assign_variable("src:stn.tbl.v2", Value::Float(4.0), Stamp::from_nanos(0));
        assert_relative_eq!(handler.evaluate().unwrap(), 7.0);
    }

    #[test]
    fn default_source_prefixes_bare_names() {
        let factory = TokenFactory::new();
        let (_, requests) = factory
            .make_expression("stn.tbl.v1 * 2", Some("src"), OrderOption::RealTime)
            .unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].lock().unwrap().uri().as_str(), "src:stn.tbl.v1");
    }

    #[test]
    fn source_only_variable_becomes_source_time() {
        let factory = TokenFactory::new();
        let (handler, requests) = factory
            .make_expression("src", None, OrderOption::RealTime)
            .unwrap();
        assert!(requests.is_empty());
        let token = handler.variables().get("src").unwrap();
        match &*token.borrow() {
            Token::Variable(variable) => assert!(variable.is_source_time),
            other => panic!("unexpected {other:?}"),
        };
    }

    #[test]
    fn every_request_gets_a_variable_and_vice_versa() {
        let factory = TokenFactory::new();
        let (handler, requests) = factory
            .make_expression("a.b.c + a.b.c", Some("s"), OrderOption::RealTime)
            .unwrap();
        // One shared variable, exactly one request.
        assert_eq!(handler.variables().len(), 1);
        assert_eq!(requests.len(), 1);
        let token = handler.variables().get("a.b.c").unwrap();
        match &*token.borrow() {
            Token::Variable(variable) => assert!(variable.request.is_some()),
            other => panic!("unexpected {other:?}"),
        };
    }
}

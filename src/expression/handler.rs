//! Expression compilation and evaluation.
//!
//! The handler turns a token list into postfix form with the shunting
//! yard, evaluates the postfix stack, and accumulates the request
//! configuration produced by setup functions. Setup functions abort
//! the pass that evaluates them; the compile driver keeps evaluating
//! until none remain.

use super::factory::TokenFactory;
use super::functions::{eval_operator, EvalError, SetupConfig, SetupStart, PREC_MAX_OPERATOR};
use super::lexer::{make_string_tokens, ParseError};
use super::token::{Operand, Token, TokenRef, Value};
use crate::source::request::Request;
use crate::stamp::Stamp;
use std::collections::BTreeMap;
use thiserror::Error;

/// Failures evaluating a compiled expression.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExpressionError {
    #[error(transparent)]
    Eval(#[from] EvalError),
    #[error("the expression has not been tokenised")]
    InvalidState,
}

struct ParsedToken {
    token: TokenRef,
    begin_pos: usize,
}

/// A compiled expression with its variables and request configuration.
#[derive(Debug)]
pub struct ExpressionHandler {
    postfix: Vec<TokenRef>,
    variables: BTreeMap<String, TokenRef>,
    config: SetupConfig,
}

impl ExpressionHandler {
    #[must_use]
    pub fn new() -> Self {
        Self {
            postfix: Vec::new(),
            variables: BTreeMap::new(),
            config: SetupConfig::default(),
        }
    }

    /// Parses an expression into the postfix stack.
    pub fn tokenise(&mut self, factory: &TokenFactory, expression: &str) -> Result<(), ParseError> {
        let string_tokens = make_string_tokens(expression)?;
        let mut parsed = Vec::new();
        let mut prev: Option<TokenRef> = None;
        self.variables.clear();
        for (lexeme, begin_pos) in string_tokens {
            // The same variable name always maps to the same token
            // instance so a later assignment reaches every use.
            if let Some(existing) = self.variables.get(&lexeme) {
                let token = existing.clone();
                prev = Some(token.clone());
                parsed.push(ParsedToken { token, begin_pos });
                continue;
            }
            let Some(token) = factory.make_token(prev.as_ref(), &lexeme, begin_pos)? else {
                // Unary plus vanishes.
                continue;
            };
            if token.borrow().is_variable() {
                self.variables.insert(lexeme.clone(), token.clone());
            }
            prev = Some(token.clone());
            parsed.push(ParsedToken { token, begin_pos });
        }
        self.infix_to_postfix(parsed)
    }

    /// The compiled postfix stack.
    #[must_use]
    pub fn postfix(&self) -> &[TokenRef] {
        &self.postfix
    }

    /// Formats the postfix stack for diagnostics.
    #[must_use]
    pub fn format_postfix(&self) -> String {
        let parts: Vec<String> = self
            .postfix
            .iter()
            .map(|token| token.borrow().to_string())
            .collect();
        parts.join(" ")
    }

    /// The variables keyed by their source lexeme, in name order.
    #[must_use]
    pub fn variables(&self) -> &BTreeMap<String, TokenRef> {
        &self.variables
    }

    /// Replaces a variable token (used when a source-only name becomes
    /// a source-time variable).
    pub fn replace_variable(&mut self, name: &str, replacement: TokenRef) {
        if let Some(existing) = self.variables.get_mut(name) {
            let old = existing.clone();
            *existing = replacement.clone();
            for slot in &mut self.postfix {
                if std::rc::Rc::ptr_eq(slot, &old) {
                    *slot = replacement.clone();
                }
            }
        }
    }

    /// Assigns a variable's value for the next evaluation.
    pub fn assign_variable(&mut self, name: &str, value: Value, stamp: Stamp) {
        if let Some(token) = self.variables.get(name) {
            if let Token::Variable(variable) = &mut *token.borrow_mut() {
                variable.set_value(value, stamp);
            }
        }
    }

    /// True while the postfix stack still holds setup functions.
    #[must_use]
    pub fn has_aborting_tokens(&self) -> bool {
        self.postfix
            .iter()
            .any(|token| token.borrow().aborts_after_eval())
    }

    /// The request configuration accumulated so far.
    #[must_use]
    pub fn config(&self) -> &SetupConfig {
        &self.config
    }

    /// Evaluates the postfix stack. A setup function consumes its
    /// prefix and returns nothing; the next call resumes after it.
    pub fn eval(&mut self) -> Result<Option<Operand>, ExpressionError> {
        if self.postfix.is_empty() {
            return Err(ExpressionError::InvalidState);
        }
        let mut stack: Vec<Operand> = Vec::new();
        let mut aborted_at = None;
        for (index, token) in self.postfix.iter().enumerate() {
            let mut token = token.borrow_mut();
            match &mut *token {
                Token::Constant { value, category, .. } => {
                    let mut operand = Operand::new(value.clone());
                    operand.category = *category;
                    stack.push(operand);
                }
                Token::Variable(variable) => {
                    // An unbound variable reads as the no-plot value so
                    // partial bindings degrade instead of failing.
                    let value = variable.value.clone().unwrap_or(Value::Float(f64::NAN));
                    stack.push(Operand::with_stamp(value, variable.stamp));
                }
                Token::Operator(op) => {
                    let aborts = op.kind.aborts_after_eval();
                    eval_operator(op, &mut stack, &mut self.config)?;
                    if aborts {
                        if !stack.is_empty() {
                            return Err(ExpressionError::Eval(EvalError::UnbalancedResult(
                                stack.len(),
                            )));
                        }
                        aborted_at = Some(index);
                        break;
                    }
                }
                Token::LParen | Token::RParen | Token::Comma | Token::SemiColon => {}
            }
        }
        if let Some(index) = aborted_at {
            self.postfix.drain(..=index);
            return Ok(None);
        }
        match stack.len() {
            1 => Ok(Some(stack.pop().expect("length checked"))),
            0 => Err(ExpressionError::Eval(EvalError::Empty)),
            extra => Err(ExpressionError::Eval(EvalError::UnbalancedResult(extra))),
        }
    }

    /// Evaluates to a float, for callers that just want the number.
    pub fn evaluate(&mut self) -> Result<f64, ExpressionError> {
        match self.eval()? {
            Some(operand) => Ok(operand.value.to_float()),
            None => Err(ExpressionError::InvalidState),
        }
    }

    /// Applies the accumulated setup configuration to a request and
    /// freezes it. Does nothing when no setup function ran or the
    /// request is already frozen.
    pub fn configure_request(&self, request: &mut Request) {
        if !self.config.start_option_set || request.is_frozen() {
            return;
        }
        match self.config.start_option {
            Some(SetupStart::AtRecord {
                file_mark_no,
                record_no,
            }) => request.set_start_at_record(file_mark_no, record_no),
            Some(SetupStart::AtTime(time)) => request.set_start_at_time(time),
            Some(SetupStart::AtNewest) => request.set_start_at_newest(),
            Some(SetupStart::AfterNewest) => request.set_start_after_newest(),
            Some(SetupStart::RelativeToNewest(interval)) => {
                request.set_start_relative_to_newest(interval);
            }
            Some(SetupStart::AtOffsetFromNewest(offset)) => {
                request.set_start_at_offset_from_newest(offset);
            }
            None => {}
        }
        request.set_report_offset(self.config.report_offset);
        if let Some(order) = self.config.order_option {
            request.set_order_option(order);
        }
        request.freeze();
    }

    fn infix_to_postfix(&mut self, tokens: Vec<ParsedToken>) -> Result<(), ParseError> {
        let mut op_stack: Vec<ParsedToken> = Vec::new();
        self.postfix.clear();
        for current in tokens {
            let class = current.token.borrow().clone();
            if class.is_comma() {
                // Pop lower-priority work, then bump the argument count
                // of the function in front of the matching paren.
                while let Some(top) = op_stack.last() {
                    let top_token = top.token.borrow();
                    if top_token.is_lparen() || top_token.priority() >= class.priority() {
                        break;
                    }
                    drop(top_token);
                    let popped = op_stack.pop().expect("checked non-empty");
                    self.postfix.push(popped.token);
                }
                let Some(paren) = op_stack.pop() else {
                    return Err(ParseError::new(
                        current.begin_pos,
                        "commas must appear within parentheses",
                    ));
                };
                if !paren.token.borrow().is_lparen() {
                    return Err(ParseError::new(
                        current.begin_pos,
                        "commas must appear within parentheses",
                    ));
                }
                if let Some(beneath) = op_stack.last() {
                    if let Token::Operator(op) = &mut *beneath.token.borrow_mut() {
                        op.args_count += 1;
                    }
                }
                op_stack.push(paren);
            } else if class.is_rparen() {
                loop {
                    let Some(popped) = op_stack.pop() else {
                        return Err(ParseError::new(current.begin_pos, "mismatched parenthesis"));
                    };
                    if popped.token.borrow().is_lparen() {
                        break;
                    }
                    self.postfix.push(popped.token);
                }
            } else if class.is_lparen() {
                // A fresh argument list: reset the count of the token
                // beneath the paren.
                if let Some(beneath) = op_stack.last() {
                    if let Token::Operator(op) = &mut *beneath.token.borrow_mut() {
                        op.args_count = 1;
                    }
                }
                op_stack.push(current);
            } else if class.is_operator() {
                let priority = class.priority();
                while let Some(top) = op_stack.last() {
                    let top_token = top.token.borrow();
                    if top_token.is_lparen() || top_token.priority() < priority {
                        break;
                    }
                    if top_token.priority() == priority && priority >= PREC_MAX_OPERATOR {
                        break;
                    }
                    drop(top_token);
                    let popped = op_stack.pop().expect("checked non-empty");
                    self.postfix.push(popped.token);
                }
                op_stack.push(current);
            } else if class.is_semicolon() {
                // Flush everything pending so the segments stay in
                // evaluation order.
                while let Some(popped) = op_stack.pop() {
                    if !popped.token.borrow().is_lparen() {
                        self.postfix.push(popped.token);
                    }
                }
            } else {
                self.postfix.push(current.token);
            }
        }
        while let Some(popped) = op_stack.pop() {
            let token = popped.token.borrow();
            if token.is_lparen() || token.is_rparen() {
                return Err(ParseError::new(popped.begin_pos, "mismatched parenthesis"));
            }
            drop(token);
            self.postfix.push(popped.token);
        }
        Ok(())
    }
}

impl Default for ExpressionHandler {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn compiled(expression: &str) -> ExpressionHandler {
        let factory = TokenFactory::new();
        let mut handler = ExpressionHandler::new();
        handler.tokenise(&factory, expression).unwrap();
        handler
    }

    #[test]
    fn constant_arithmetic_evaluates() {
        assert_relative_eq!(compiled("1 + 2 * 3").evaluate().unwrap(), 7.0);
        assert_relative_eq!(compiled("(1 + 2) * 3").evaluate().unwrap(), 9.0);
        assert_relative_eq!(compiled("2 ^ 3 ^ 2").evaluate().unwrap(), 512.0);
        assert_relative_eq!(compiled("-2 ^ 2").evaluate().unwrap(), -4.0);
        assert_relative_eq!(compiled("10 / 4").evaluate().unwrap(), 2.5);
    }

    #[test]
    fn unary_minus_after_operators() {
        assert_relative_eq!(compiled("3 * -2").evaluate().unwrap(), -6.0);
        assert_relative_eq!(compiled("-(1 + 2)").evaluate().unwrap(), -3.0);
        assert_relative_eq!(compiled("+5").evaluate().unwrap(), 5.0);
    }

    #[test]
    fn functions_with_arguments() {
        assert_relative_eq!(compiled("ABS(0 - 4)").evaluate().unwrap(), 4.0);
        assert_relative_eq!(compiled("IIF(TRUE, 1, 2)").evaluate().unwrap(), 1.0);
        assert_relative_eq!(compiled("PWR(2, 8)").evaluate().unwrap(), 256.0);
        assert_relative_eq!(compiled("AvgSpa(1, 2, 3, 6)").evaluate().unwrap(), 3.0);
    }

    #[test]
    fn comparisons_and_logic() {
        assert_relative_eq!(compiled("3 > 2 AND 1 < 2").evaluate().unwrap(), -1.0);
        assert_relative_eq!(compiled("1 = 2 OR 2 <> 3").evaluate().unwrap(), -1.0);
        assert_relative_eq!(compiled("NOT FALSE").evaluate().unwrap(), -1.0);
    }

    #[test]
    fn variables_bind_late() {
        let mut handler = compiled("x + y");
        assert_eq!(handler.variables().len(), 2);
        handler.assign_variable("x", Value::Float(3.0), Stamp::from_nanos(0));
        handler.assign_variable("y", Value::Float(4.0), Stamp::from_nanos(0));
        assert_relative_eq!(handler.evaluate().unwrap(), 7.0);
    }

    #[test]
    fn repeated_variable_shares_one_token() {
        let mut handler = compiled("x * x");
        assert_eq!(handler.variables().len(), 1);
        handler.assign_variable("x", Value::Float(5.0), Stamp::from_nanos(0));
        assert_relative_eq!(handler.evaluate().unwrap(), 25.0);
    }

    #[test]
    fn unbound_variable_reads_as_nan() {
        let mut handler = compiled("x + 1");
        assert!(handler.evaluate().unwrap().is_nan());
    }

    #[test]
    fn mismatched_parens_error() {
        let factory = TokenFactory::new();
        let mut handler = ExpressionHandler::new();
        assert!(handler.tokenise(&factory, "(1 + 2").is_err());
        assert!(handler.tokenise(&factory, "1 + 2)").is_err());
    }

    #[test]
    fn comma_outside_parens_errors() {
        let factory = TokenFactory::new();
        let mut handler = ExpressionHandler::new();
        assert!(handler.tokenise(&factory, "1, 2").is_err());
    }

    #[test]
    fn setup_function_aborts_then_rest_evaluates() {
        let mut handler = compiled("StartAtNewest(OrderCollected); 3 + 4");
        assert!(handler.has_aborting_tokens());
        assert_eq!(handler.eval().unwrap(), None);
        assert!(!handler.has_aborting_tokens());
        assert!(handler.config().start_option_set);
        assert_relative_eq!(handler.evaluate().unwrap(), 7.0);
    }

    #[test]
    fn stateful_function_persists_across_evaluations() {
        let mut handler = compiled("Total(x)");
        for (value, expected) in [(1.0, 1.0), (2.0, 3.0), (4.0, 7.0)] {
            handler.assign_variable("x", Value::Float(value), Stamp::from_nanos(0));
            assert_relative_eq!(handler.evaluate().unwrap(), expected);
        }
    }

    #[test]
    fn time_constants_resolve() {
        assert_relative_eq!(
            compiled("nsecPerWeek").evaluate().unwrap(),
            7.0 * 86_400.0 * 1.0e9
        );
    }

    #[test]
    fn semicolon_separates_segments() {
        // Only the value of the final segment remains on the stack
        // when earlier segments were setup calls.
        let mut handler = compiled("ReportOffset(5); 2 * 3");
        assert_eq!(handler.eval().unwrap(), None);
        assert_eq!(handler.config().report_offset, 5);
        assert_relative_eq!(handler.evaluate().unwrap(), 6.0);
    }
}

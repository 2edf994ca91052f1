//! The expression engine.
//!
//! User expressions compile through a [`factory::TokenFactory`] into a
//! postfix [`handler::ExpressionHandler`]. Compiling with
//! [`factory::TokenFactory::make_expression`] also produces the exact
//! set of data requests the expression needs; record arrivals then
//! rebind the variables and re-evaluate.

pub mod editor;
pub mod factory;
pub mod functions;
pub mod handler;
pub mod lexer;
pub mod token;

pub use factory::TokenFactory;
pub use functions::{EvalError, OpKind, SetupConfig};
pub use handler::{ExpressionHandler, ExpressionError};
pub use lexer::ParseError;
pub use token::{Operand, Token, TokenRef, Value as ExprValue, Variable};

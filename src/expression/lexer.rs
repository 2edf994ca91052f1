//! Expression lexing.
//!
//! A character-class state machine splits the source into lexemes with
//! their byte offsets: numbers (integer, decimal, exponent, `&h`/`&b`
//! radix forms), names, quoted strings (`"…"` or `$"…"`), and operator
//! runs including the two-character comparisons.

use thiserror::Error;

/// A lexing or parsing failure, carrying the source offset where it
/// was detected.
#[derive(Debug, Error, PartialEq, Eq, Clone)]
#[error("parse error at offset {offset}: {reason}")]
pub struct ParseError {
    pub offset: usize,
    pub reason: String,
}

impl ParseError {
    #[must_use]
    pub fn new(offset: usize, reason: &str) -> Self {
        Self {
            offset,
            reason: reason.to_string(),
        }
    }
}

/// A lexeme and the offset where it starts.
pub type StringToken = (String, usize);

const OPERATORS: &str = "+-*/()^,=<>;";

#[derive(Clone, Copy, PartialEq, Eq)]
enum State {
    BetweenTokens,
    InName,
    Quoted,
    AfterNumber,
    AfterDecimal,
    AfterExp,
    AfterExpSign,
    AfterAmp,
    AfterAmpHex,
    AfterAmpBin,
    AfterLt,
    AfterGt,
    AfterDollar,
    InString,
}

/// Splits an expression into string tokens.
pub fn make_string_tokens(expression: &str) -> Result<Vec<StringToken>, ParseError> {
    let mut tokens = Vec::new();
    let mut state = State::BetweenTokens;
    let mut word = String::new();
    let chars: Vec<char> = expression.chars().collect();
    let mut index = 0;
    while index < chars.len() {
        let ch = chars[index];
        let is_operator = OPERATORS.contains(ch);
        match state {
            State::BetweenTokens => {
                if ch.is_ascii_digit() {
                    word.push(ch);
                    state = State::AfterNumber;
                } else if ch == '.' {
                    word.push(ch);
                    state = State::AfterDecimal;
                } else if ch == '&' {
                    word.push(ch);
                    state = State::AfterAmp;
                } else if ch == '>' {
                    word.push(ch);
                    state = State::AfterGt;
                } else if ch == '<' {
                    word.push(ch);
                    state = State::AfterLt;
                } else if is_operator {
                    flush(&mut tokens, &mut word, index);
                    tokens.push((ch.to_string(), index));
                } else if ch == '"' {
                    word.push(ch);
                    state = State::Quoted;
                } else if ch == '$' {
                    flush(&mut tokens, &mut word, index);
                    word.push(ch);
                    state = State::AfterDollar;
                } else if !ch.is_whitespace() {
                    word.push(ch);
                    state = State::InName;
                }
            }
            State::InName => {
                if ch.is_whitespace() || is_operator {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else if ch == '"' {
                    word.push(ch);
                    state = State::Quoted;
                } else {
                    word.push(ch);
                }
            }
            State::Quoted => {
                word.push(ch);
                if ch == '"' {
                    state = State::InName;
                }
            }
            State::AfterNumber => {
                if ch.is_ascii_digit() {
                    word.push(ch);
                } else if ch == '.' {
                    word.push(ch);
                    state = State::AfterDecimal;
                } else if ch == 'e' || ch == 'E' {
                    word.push(ch);
                    state = State::AfterExp;
                } else if is_operator || ch.is_whitespace() {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else {
                    return Err(ParseError::new(index, "unexpected character in number constant"));
                }
            }
            State::AfterDecimal => {
                if ch.is_ascii_digit() {
                    word.push(ch);
                } else if ch == 'e' || ch == 'E' {
                    word.push(ch);
                    state = State::AfterExp;
                } else if is_operator || ch.is_whitespace() {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else {
                    return Err(ParseError::new(index, "unexpected character in number constant"));
                }
            }
            State::AfterExp => {
                if ch == '+' || ch == '-' || ch.is_ascii_digit() {
                    word.push(ch);
                    state = State::AfterExpSign;
                } else {
                    return Err(ParseError::new(index, "unexpected character in number constant"));
                }
            }
            State::AfterExpSign => {
                if ch.is_ascii_digit() {
                    word.push(ch);
                } else if is_operator || ch.is_whitespace() {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else {
                    return Err(ParseError::new(index, "unexpected character in number constant"));
                }
            }
            State::AfterAmp => {
                if ch == 'h' || ch == 'H' {
                    word.push(ch);
                    state = State::AfterAmpHex;
                } else if ch == 'b' || ch == 'B' {
                    word.push(ch);
                    state = State::AfterAmpBin;
                } else {
                    return Err(ParseError::new(index, "invalid ampersand expression"));
                }
            }
            State::AfterAmpHex => {
                if ch.is_ascii_hexdigit() {
                    word.push(ch);
                } else if is_operator || ch.is_whitespace() {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else {
                    return Err(ParseError::new(index, "invalid hexadecimal sequence"));
                }
            }
            State::AfterAmpBin => {
                if ch == '0' || ch == '1' {
                    word.push(ch);
                } else if is_operator || ch.is_whitespace() {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    if !ch.is_whitespace() {
                        continue;
                    }
                } else {
                    return Err(ParseError::new(index, "invalid binary sequence"));
                }
            }
            State::AfterLt => {
                if ch == '>' || ch == '=' {
                    word.push(ch);
                    flush(&mut tokens, &mut word, index + 1);
                } else {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    continue;
                }
                state = State::BetweenTokens;
            }
            State::AfterGt => {
                if ch == '=' {
                    word.push(ch);
                    flush(&mut tokens, &mut word, index + 1);
                } else {
                    flush(&mut tokens, &mut word, index);
                    state = State::BetweenTokens;
                    continue;
                }
                state = State::BetweenTokens;
            }
            State::AfterDollar => {
                if ch == '"' {
                    word.push(ch);
                    state = State::InString;
                } else {
                    return Err(ParseError::new(
                        index,
                        "double quotes expected after an unquoted dollar sign",
                    ));
                }
            }
            State::InString => {
                word.push(ch);
                if ch == '"' {
                    flush(&mut tokens, &mut word, index + 1);
                    state = State::BetweenTokens;
                }
            }
        }
        index += 1;
    }
    match state {
        State::Quoted | State::InString | State::AfterDollar => {
            return Err(ParseError::new(chars.len(), "unbalanced quotes in expression"));
        }
        _ => flush(&mut tokens, &mut word, chars.len()),
    }
    Ok(tokens)
}

fn flush(tokens: &mut Vec<StringToken>, word: &mut String, end: usize) {
    if !word.is_empty() {
        let len = word.chars().count();
        tokens.push((std::mem::take(word), end - len));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lex(expression: &str) -> Vec<String> {
        make_string_tokens(expression)
            .unwrap()
            .into_iter()
            .map(|(token, _)| token)
            .collect()
    }

    #[test]
    fn arithmetic_expression_splits() {
        assert_eq!(lex("a + b*2"), vec!["a", "+", "b", "*", "2"]);
    }

    #[test]
    fn numbers_with_decimals_and_exponents() {
        assert_eq!(lex("1.5e-3 + 2E6"), vec!["1.5e-3", "+", "2E6"]);
        assert_eq!(lex(".25*4"), vec![".25", "*", "4"]);
    }

    #[test]
    fn radix_literals() {
        assert_eq!(lex("&hFF + &b101"), vec!["&hFF", "+", "&b101"]);
    }

    #[test]
    fn two_character_comparisons() {
        assert_eq!(lex("a <> b"), vec!["a", "<>", "b"]);
        assert_eq!(lex("a<=b"), vec!["a", "<=", "b"]);
        assert_eq!(lex("a >= b"), vec!["a", ">=", "b"]);
        assert_eq!(lex("a < b"), vec!["a", "<", "b"]);
    }

    #[test]
    fn dollar_quoted_variables() {
        assert_eq!(lex("$\"src:stn.tbl.v\" + 1"), vec!["$\"src:stn.tbl.v\"", "+", "1"]);
    }

    #[test]
    fn uri_names_lex_as_one_token() {
        assert_eq!(
            lex("src:stn.tbl.v1 + src:stn.tbl.v2"),
            vec!["src:stn.tbl.v1", "+", "src:stn.tbl.v2"]
        );
    }

    #[test]
    fn function_calls_with_commas_and_semicolons() {
        assert_eq!(
            lex("StartRelativeToNewest(nsecPerWeek, OrderCollected);x"),
            vec!["StartRelativeToNewest", "(", "nsecPerWeek", ",", "OrderCollected", ")", ";", "x"]
        );
    }

    #[test]
    fn unterminated_quote_errors_with_offset() {
        let error = make_string_tokens("$\"oops").unwrap_err();
        assert_eq!(error.offset, 6);
        let error = make_string_tokens("name\"tail").unwrap_err();
        assert_eq!(error.offset, 9);
    }

    #[test]
    fn offsets_point_at_token_starts() {
        let tokens = make_string_tokens("ab + cd").unwrap();
        assert_eq!(tokens[0], ("ab".to_string(), 0));
        assert_eq!(tokens[1], ("+".to_string(), 3));
        assert_eq!(tokens[2], ("cd".to_string(), 5));
    }
}

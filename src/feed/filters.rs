// Copyright 2021 The BDN Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Boolean filter expressions evaluated per subscriber against a normalized
//! view of each published transaction.
//!
//! The grammar is comparisons over a fixed field vocabulary combined with
//! `AND` / `OR` and parentheses, e.g.
//! `value > 1000000000 AND (to == 0xabc… OR from == 0xdef…)`. A field whose
//! normalized value is null fails every comparison.

use thiserror::Error;

use std::{collections::HashMap, fmt};

/// Normalized value of a single filterable field.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterValue {
    /// Missing or malformed source data; fails every comparison.
    Null,
    Num(u128),
    Text(String),
}

/// Normalized record a filter expression is evaluated against.
pub type FilterState = HashMap<&'static str, FilterValue>;

/// Filter expression rejected at parse or validation time.
#[derive(Debug, Error, PartialEq)]
pub enum FilterError {
    #[error("unexpected character `{0}` in filter expression")]
    UnexpectedCharacter(char),
    #[error("unexpected token `{0}` in filter expression")]
    UnexpectedToken(String),
    #[error("filter expression ends unexpectedly")]
    UnexpectedEnd,
    #[error("trailing input after filter expression: `{0}`")]
    TrailingInput(String),
    #[error("unrecognized filter field `{0}`")]
    UnknownField(String),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CmpOp {
    Eq,
    Ne,
    Gt,
    Ge,
    Lt,
    Le,
}

impl fmt::Display for CmpOp {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        let op = match self {
            Self::Eq => "==",
            Self::Ne => "!=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Lt => "<",
            Self::Le => "<=",
        };
        formatter.write_str(op)
    }
}

/// Literal of a comparison. Keeps both the textual and, where it parses, the
/// numeric reading so the comparison can follow the field's type.
#[derive(Debug, Clone, PartialEq)]
pub struct Literal {
    text: String,
    num: Option<u128>,
}

impl Literal {
    fn new(text: String) -> Self {
        let num = if let Some(hex) = text.strip_prefix("0x") {
            u128::from_str_radix(hex, 16).ok()
        } else {
            text.parse().ok()
        };
        Self {
            text: text.to_ascii_lowercase(),
            num,
        }
    }
}

/// Parsed filter expression.
#[derive(Debug, Clone, PartialEq)]
pub enum FilterExpr {
    And(Vec<FilterExpr>),
    Or(Vec<FilterExpr>),
    Compare {
        field: String,
        op: CmpOp,
        literal: Literal,
    },
}

impl FilterExpr {
    /// Parses a filter expression.
    pub fn parse(input: &str) -> Result<Self, FilterError> {
        let tokens = tokenize(input)?;
        let mut parser = Parser { tokens, position: 0 };
        let expr = parser.parse_or()?;
        if parser.position != parser.tokens.len() {
            return Err(FilterError::TrailingInput(
                parser.tokens[parser.position..]
                    .iter()
                    .map(Token::describe)
                    .collect::<Vec<_>>()
                    .join(" "),
            ));
        }
        Ok(expr)
    }

    /// Rejects the expression when it references a field outside `allowed`.
    pub fn validate_fields(&self, allowed: &[&str]) -> Result<(), FilterError> {
        match self {
            Self::And(terms) | Self::Or(terms) => {
                for term in terms {
                    term.validate_fields(allowed)?;
                }
                Ok(())
            }
            Self::Compare { field, .. } => {
                if allowed.contains(&field.as_str()) {
                    Ok(())
                } else {
                    Err(FilterError::UnknownField(field.clone()))
                }
            }
        }
    }

    /// Evaluates the expression. Comparisons against null field values are
    /// false, including equality.
    pub fn evaluate(&self, state: &FilterState) -> bool {
        match self {
            Self::And(terms) => terms.iter().all(|term| term.evaluate(state)),
            Self::Or(terms) => terms.iter().any(|term| term.evaluate(state)),
            Self::Compare { field, op, literal } => {
                match state.get(field.as_str()).unwrap_or(&FilterValue::Null) {
                    FilterValue::Null => false,
                    FilterValue::Num(value) => match literal.num {
                        Some(rhs) => match op {
                            CmpOp::Eq => *value == rhs,
                            CmpOp::Ne => *value != rhs,
                            CmpOp::Gt => *value > rhs,
                            CmpOp::Ge => *value >= rhs,
                            CmpOp::Lt => *value < rhs,
                            CmpOp::Le => *value <= rhs,
                        },
                        None => false,
                    },
                    FilterValue::Text(value) => match op {
                        CmpOp::Eq => *value == literal.text,
                        CmpOp::Ne => *value != literal.text,
                        // Ordering comparisons are undefined for text fields.
                        _ => false,
                    },
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Op(CmpOp),
    And,
    Or,
    LeftParen,
    RightParen,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(text) | Self::Literal(text) => text.clone(),
            Self::Op(op) => op.to_string(),
            Self::And => "AND".to_owned(),
            Self::Or => "OR".to_owned(),
            Self::LeftParen => "(".to_owned(),
            Self::RightParen => ")".to_owned(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, FilterError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();
    while let Some(&next) = chars.peek() {
        match next {
            c if c.is_whitespace() => {
                chars.next();
            }
            '(' => {
                chars.next();
                tokens.push(Token::LeftParen);
            }
            ')' => {
                chars.next();
                tokens.push(Token::RightParen);
            }
            '=' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Eq));
                    }
                    _ => return Err(FilterError::UnexpectedCharacter('=')),
                }
            }
            '!' => {
                chars.next();
                match chars.peek() {
                    Some('=') => {
                        chars.next();
                        tokens.push(Token::Op(CmpOp::Ne));
                    }
                    _ => return Err(FilterError::UnexpectedCharacter('!')),
                }
            }
            '>' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Ge));
                } else {
                    tokens.push(Token::Op(CmpOp::Gt));
                }
            }
            '<' => {
                chars.next();
                if chars.peek() == Some(&'=') {
                    chars.next();
                    tokens.push(Token::Op(CmpOp::Le));
                } else {
                    tokens.push(Token::Op(CmpOp::Lt));
                }
            }
            '\'' | '"' => {
                let quote = next;
                chars.next();
                let mut text = String::new();
                loop {
                    match chars.next() {
                        Some(c) if c == quote => break,
                        Some(c) => text.push(c),
                        None => return Err(FilterError::UnexpectedEnd),
                    }
                }
                tokens.push(Token::Literal(text));
            }
            c if c.is_ascii_alphanumeric() || c == '_' => {
                let mut text = String::new();
                while let Some(&c) = chars.peek() {
                    if c.is_ascii_alphanumeric() || c == '_' {
                        text.push(c);
                        chars.next();
                    } else {
                        break;
                    }
                }
                match text.to_ascii_uppercase().as_str() {
                    "AND" => tokens.push(Token::And),
                    "OR" => tokens.push(Token::Or),
                    _ if text.chars().next().unwrap().is_ascii_digit() => {
                        tokens.push(Token::Literal(text));
                    }
                    _ => tokens.push(Token::Ident(text)),
                }
            }
            other => return Err(FilterError::UnexpectedCharacter(other)),
        }
    }
    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    position: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.position)
    }

    fn next(&mut self) -> Result<Token, FilterError> {
        let token = self
            .tokens
            .get(self.position)
            .cloned()
            .ok_or(FilterError::UnexpectedEnd)?;
        self.position += 1;
        Ok(token)
    }

    fn parse_or(&mut self) -> Result<FilterExpr, FilterError> {
        let mut terms = vec![self.parse_and()?];
        while self.peek() == Some(&Token::Or) {
            self.position += 1;
            terms.push(self.parse_and()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(FilterExpr::Or(terms))
        }
    }

    fn parse_and(&mut self) -> Result<FilterExpr, FilterError> {
        let mut terms = vec![self.parse_comparison()?];
        while self.peek() == Some(&Token::And) {
            self.position += 1;
            terms.push(self.parse_comparison()?);
        }
        if terms.len() == 1 {
            Ok(terms.pop().unwrap())
        } else {
            Ok(FilterExpr::And(terms))
        }
    }

    fn parse_comparison(&mut self) -> Result<FilterExpr, FilterError> {
        match self.next()? {
            Token::LeftParen => {
                let expr = self.parse_or()?;
                match self.next()? {
                    Token::RightParen => Ok(expr),
                    other => Err(FilterError::UnexpectedToken(other.describe())),
                }
            }
            Token::Ident(field) => {
                let op = match self.next()? {
                    Token::Op(op) => op,
                    other => return Err(FilterError::UnexpectedToken(other.describe())),
                };
                let literal = match self.next()? {
                    Token::Literal(text) | Token::Ident(text) => Literal::new(text),
                    other => return Err(FilterError::UnexpectedToken(other.describe())),
                };
                Ok(FilterExpr::Compare { field, op, literal })
            }
            other => Err(FilterError::UnexpectedToken(other.describe())),
        }
    }
}

//! Expressions over JSON step responses.
//!
//! The bundled [`JsonPathEvaluator`] understands paths rooted at `$` or at a
//! top-level name (`$.items[0].id`, `response.body.id`), string, number,
//! boolean and null literals, the comparisons `== != < <= > >=`, `!`,
//! `&&`, `||` and parentheses.

use crate::errors::{NodeStateError, Result};
use serde_json::Value;
use std::cmp::Ordering;

/// Evaluates an expression against a JSON environment.
pub trait ExpressionEvaluator: Send + Sync {
    /// Returns the value of `expression`.
    fn eval(&self, expression: &str, env: &Value) -> Result<Value>;

    /// Evaluates a condition; non-boolean results are errors.
    fn eval_bool(&self, expression: &str, env: &Value) -> Result<bool> {
        match self.eval(expression, env)? {
            Value::Bool(b) => Ok(b),
            other => Err(NodeStateError::validation(format!(
                "expression '{expression}' evaluated to {other}, not a boolean"
            ))),
        }
    }
}

/// Renders a scalar for an output parameter: strings verbatim, anything else
/// as JSON.
#[must_use]
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Path-and-comparison evaluator.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPathEvaluator;

impl JsonPathEvaluator {
    /// Creates an evaluator.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl ExpressionEvaluator for JsonPathEvaluator {
    fn eval(&self, expression: &str, env: &Value) -> Result<Value> {
        let tokens = tokenize(expression)?;
        let mut parser = Parser {
            expression,
            tokens,
            pos: 0,
            env,
        };
        let value = parser.or()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.error("unexpected trailing input"));
        }
        Ok(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Root,
    Ident(String),
    Dot,
    LBracket,
    RBracket,
    LParen,
    RParen,
    Number(serde_json::Number),
    Str(String),
    Not,
    And,
    Or,
    Cmp(CmpOp),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

fn tokenize(expression: &str) -> Result<Vec<Token>> {
    let invalid = |msg: String| NodeStateError::validation(format!("invalid expression '{expression}': {msg}"));
    let chars: Vec<char> = expression.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '$' => {
                tokens.push(Token::Root);
                i += 1;
            }
            '.' => {
                tokens.push(Token::Dot);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '=' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '!' if next == Some('=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '<' | '>' => {
                let or_equal = next == Some('=');
                let op = match (c, or_equal) {
                    ('<', false) => CmpOp::Lt,
                    ('<', true) => CmpOp::Le,
                    ('>', false) => CmpOp::Gt,
                    _ => CmpOp::Ge,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '"' | '\'' => {
                let quote = c;
                let mut text = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err(invalid("unterminated string".into())),
                        Some('\\') => {
                            if let Some(escaped) = chars.get(i + 1) {
                                text.push(*escaped);
                            }
                            i += 2;
                        }
                        Some(ch) if *ch == quote => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            text.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(text));
            }
            c if c.is_ascii_digit() || (c == '-' && next.is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while chars.get(i).is_some_and(|ch| ch.is_ascii_digit() || *ch == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let number = if let Ok(n) = text.parse::<i64>() {
                    serde_json::Number::from(n)
                } else {
                    text.parse::<f64>()
                        .ok()
                        .and_then(serde_json::Number::from_f64)
                        .ok_or_else(|| invalid(format!("bad number '{text}'")))?
                };
                tokens.push(Token::Number(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while chars
                    .get(i)
                    .is_some_and(|ch| ch.is_alphanumeric() || *ch == '_' || *ch == '-')
                {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(invalid(format!("unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    expression: &'a str,
    tokens: Vec<Token>,
    pos: usize,
    env: &'a Value,
}

impl Parser<'_> {
    fn error(&self, message: &str) -> NodeStateError {
        NodeStateError::validation(format!("invalid expression '{}': {message}", self.expression))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn bump(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat(&mut self, token: &Token) -> Result<()> {
        if self.peek() == Some(token) {
            self.pos += 1;
            Ok(())
        } else {
            Err(self.error(&format!("expected {token:?}")))
        }
    }

    fn or(&mut self) -> Result<Value> {
        let mut left = self.and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            let right = self.and()?;
            left = Value::Bool(self.truthy(&left)? || self.truthy(&right)?);
        }
        Ok(left)
    }

    fn and(&mut self) -> Result<Value> {
        let mut left = self.comparison()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            let right = self.comparison()?;
            left = Value::Bool(self.truthy(&left)? && self.truthy(&right)?);
        }
        Ok(left)
    }

    fn comparison(&mut self) -> Result<Value> {
        let left = self.unary()?;
        let Some(Token::Cmp(op)) = self.peek().cloned() else {
            return Ok(left);
        };
        self.pos += 1;
        let right = self.unary()?;
        let result = match op {
            CmpOp::Eq => loosely_equal(&left, &right),
            CmpOp::Ne => !loosely_equal(&left, &right),
            ordered => {
                let ordering = order(&left, &right)
                    .ok_or_else(|| self.error(&format!("cannot order {left} and {right}")))?;
                match ordered {
                    CmpOp::Lt => ordering == Ordering::Less,
                    CmpOp::Le => ordering != Ordering::Greater,
                    CmpOp::Gt => ordering == Ordering::Greater,
                    _ => ordering != Ordering::Less,
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn unary(&mut self) -> Result<Value> {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            let value = self.unary()?;
            return Ok(Value::Bool(!self.truthy(&value)?));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<Value> {
        match self.bump() {
            Some(Token::LParen) => {
                let value = self.or()?;
                self.eat(&Token::RParen)?;
                Ok(value)
            }
            Some(Token::Number(n)) => Ok(Value::Number(n)),
            Some(Token::Str(s)) => Ok(Value::String(s)),
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                "null" => Ok(Value::Null),
                _ => {
                    let start = self
                        .env
                        .get(&name)
                        .ok_or_else(|| self.error(&format!("'{name}' is not defined")))?;
                    self.path(start, name)
                }
            },
            Some(Token::Root) => self.path(self.env, "$".to_string()),
            _ => Err(self.error("expected a value")),
        }
    }

    fn path(&mut self, start: &Value, mut walked: String) -> Result<Value> {
        let mut current = start;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    let Some(Token::Ident(field)) = self.bump() else {
                        return Err(self.error("expected a field name after '.'"));
                    };
                    walked = format!("{walked}.{field}");
                    current = current
                        .get(&field)
                        .ok_or_else(|| self.error(&format!("'{walked}' not found")))?;
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    current = match self.bump() {
                        Some(Token::Number(n)) => {
                            walked = format!("{walked}[{n}]");
                            let index = n
                                .as_u64()
                                .and_then(|i| usize::try_from(i).ok())
                                .ok_or_else(|| self.error("array index must be a non-negative integer"))?;
                            current.get(index)
                        }
                        Some(Token::Str(field)) => {
                            walked = format!("{walked}[{field:?}]");
                            current.get(&field)
                        }
                        _ => return Err(self.error("expected an index or quoted field")),
                    }
                    .ok_or_else(|| self.error(&format!("'{walked}' not found")))?;
                    self.eat(&Token::RBracket)?;
                }
                _ => return Ok(current.clone()),
            }
        }
    }

    fn truthy(&self, value: &Value) -> Result<bool> {
        value
            .as_bool()
            .ok_or_else(|| self.error(&format!("{value} is not a boolean")))
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        _ => left == right,
    }
}

fn order(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64()?.partial_cmp(&b.as_f64()?),
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

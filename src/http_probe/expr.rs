//! A small boolean expression language over JSON documents.
//!
//! ```text
//! foo == "hi" && bar == 3
//! $.items[0].state != "failed" || !($.degraded)
//! $["content-type"] =~ "^application/json" && len > 2 * 10
//! "admin" in $.roles
//! ```
//!
//! Bare identifiers and `$`-rooted paths both address the decoded body.
//! `[*]` and `.*` fan out over arrays and objects, producing an array.

use std::fmt;

use regex::Regex;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExprError {
    #[error("syntax error at offset {offset}: {message}")]
    Syntax { offset: usize, message: String },
    #[error("invalid regular expression {pattern:?}: {message}")]
    Regex { pattern: String, message: String },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum EvalError {
    #[error("unknown parameter {0}")]
    UnknownPath(String),
    #[error("type mismatch: cannot apply {op} to {left} and {right}")]
    TypeMismatch {
        op: &'static str,
        left: &'static str,
        right: &'static str,
    },
    #[error("division by zero")]
    DivisionByZero,
    #[error("invalid regular expression {0:?}")]
    Regex(String),
    #[error("expression did not evaluate to a boolean but to {0}")]
    NotBoolean(&'static str),
}

/// A parsed expression, ready to be evaluated against many documents.
#[derive(Debug, Clone)]
pub struct Expression {
    source: String,
    root: Expr,
}

impl Expression {
    pub fn parse(source: &str) -> Result<Self, ExprError> {
        let tokens = tokenize(source)?;
        let mut parser = Parser { tokens, pos: 0 };
        let root = parser.expression(0)?;
        if let Some(token) = parser.peek() {
            return Err(ExprError::Syntax {
                offset: token.offset,
                message: format!("unexpected {}", token.kind),
            });
        }
        Ok(Expression {
            source: source.to_string(),
            root,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn evaluate(&self, document: &Value) -> Result<Value, EvalError> {
        self.root.eval(document)
    }

    pub fn evaluate_bool(&self, document: &Value) -> Result<bool, EvalError> {
        match self.evaluate(document)? {
            Value::Bool(b) => Ok(b),
            other => Err(EvalError::NotBoolean(type_name(&other))),
        }
    }
}

impl fmt::Display for Expression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Number(f64),
    Str(String),
    Ident(String),
    Dollar,
    Dot,
    Comma,
    Star,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Op(&'static str),
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::Number(n) => write!(f, "number {n}"),
            TokenKind::Str(s) => write!(f, "string {s:?}"),
            TokenKind::Ident(i) => write!(f, "identifier {i}"),
            TokenKind::Dollar => f.write_str("'$'"),
            TokenKind::Dot => f.write_str("'.'"),
            TokenKind::Comma => f.write_str("','"),
            TokenKind::Star => f.write_str("'*'"),
            TokenKind::LParen => f.write_str("'('"),
            TokenKind::RParen => f.write_str("')'"),
            TokenKind::LBracket => f.write_str("'['"),
            TokenKind::RBracket => f.write_str("']'"),
            TokenKind::Op(op) => write!(f, "'{op}'"),
        }
    }
}

#[derive(Debug, Clone)]
struct Token {
    kind: TokenKind,
    offset: usize,
}

fn syntax(offset: usize, message: impl Into<String>) -> ExprError {
    ExprError::Syntax {
        offset,
        message: message.into(),
    }
}

fn tokenize(source: &str) -> Result<Vec<Token>, ExprError> {
    const OPERATORS: [&str; 14] = [
        "&&", "||", "==", "!=", "<=", ">=", "=~", "<", ">", "!", "+", "-", "/", "%",
    ];

    let chars: Vec<(usize, char)> = source.char_indices().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let (offset, c) = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        let simple = match c {
            '$' => Some(TokenKind::Dollar),
            '.' if !chars.get(i + 1).is_some_and(|(_, n)| n.is_ascii_digit()) => {
                Some(TokenKind::Dot)
            }
            ',' => Some(TokenKind::Comma),
            '*' => Some(TokenKind::Star),
            '(' => Some(TokenKind::LParen),
            ')' => Some(TokenKind::RParen),
            '[' => Some(TokenKind::LBracket),
            ']' => Some(TokenKind::RBracket),
            _ => None,
        };
        if let Some(kind) = simple {
            tokens.push(Token { kind, offset });
            i += 1;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            i += 1;
            loop {
                let Some(&(_, ch)) = chars.get(i) else {
                    return Err(syntax(offset, "unterminated string"));
                };
                i += 1;
                match ch {
                    '\\' => {
                        let Some(&(_, escaped)) = chars.get(i) else {
                            return Err(syntax(offset, "unterminated string"));
                        };
                        i += 1;
                        value.push(match escaped {
                            'n' => '\n',
                            't' => '\t',
                            'r' => '\r',
                            other => other,
                        });
                    }
                    ch if ch == quote => break,
                    ch => value.push(ch),
                }
            }
            tokens.push(Token {
                kind: TokenKind::Str(value),
                offset,
            });
            continue;
        }

        if c.is_ascii_digit() || c == '.' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_ascii_digit() || chars[i].1 == '.') {
                i += 1;
            }
            if i < chars.len() && matches!(chars[i].1, 'e' | 'E') {
                i += 1;
                if i < chars.len() && matches!(chars[i].1, '+' | '-') {
                    i += 1;
                }
                while i < chars.len() && chars[i].1.is_ascii_digit() {
                    i += 1;
                }
            }
            let text: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            let number = text
                .parse::<f64>()
                .map_err(|_| syntax(offset, format!("invalid number {text}")))?;
            tokens.push(Token {
                kind: TokenKind::Number(number),
                offset,
            });
            continue;
        }

        if c.is_alphabetic() || c == '_' {
            let start = i;
            while i < chars.len() && (chars[i].1.is_alphanumeric() || chars[i].1 == '_') {
                i += 1;
            }
            let ident: String = chars[start..i].iter().map(|(_, ch)| *ch).collect();
            tokens.push(Token {
                kind: TokenKind::Ident(ident),
                offset,
            });
            continue;
        }

        let rest = &source[offset..];
        match OPERATORS.iter().find(|op| rest.starts_with(**op)) {
            Some(op) => {
                tokens.push(Token {
                    kind: TokenKind::Op(op),
                    offset,
                });
                i += op.chars().count();
            }
            None => return Err(syntax(offset, format!("unexpected character {c:?}"))),
        }
    }

    Ok(tokens)
}

#[derive(Debug, Clone)]
enum Segment {
    Key(String),
    Index(i64),
    Wildcard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BinOp {
    Or,
    And,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    In,
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

impl BinOp {
    fn from_token(kind: &TokenKind) -> Option<(BinOp, u8)> {
        let op = match kind {
            TokenKind::Op("||") => (BinOp::Or, 1),
            TokenKind::Op("&&") => (BinOp::And, 2),
            TokenKind::Op("==") => (BinOp::Eq, 3),
            TokenKind::Op("!=") => (BinOp::Ne, 3),
            TokenKind::Ident(i) if i == "in" => (BinOp::In, 3),
            TokenKind::Op("<") => (BinOp::Lt, 4),
            TokenKind::Op("<=") => (BinOp::Le, 4),
            TokenKind::Op(">") => (BinOp::Gt, 4),
            TokenKind::Op(">=") => (BinOp::Ge, 4),
            TokenKind::Op("+") => (BinOp::Add, 5),
            TokenKind::Op("-") => (BinOp::Sub, 5),
            TokenKind::Star => (BinOp::Mul, 6),
            TokenKind::Op("/") => (BinOp::Div, 6),
            TokenKind::Op("%") => (BinOp::Rem, 6),
            _ => return None,
        };
        Some(op)
    }

    fn symbol(&self) -> &'static str {
        match self {
            BinOp::Or => "||",
            BinOp::And => "&&",
            BinOp::Eq => "==",
            BinOp::Ne => "!=",
            BinOp::Lt => "<",
            BinOp::Le => "<=",
            BinOp::Gt => ">",
            BinOp::Ge => ">=",
            BinOp::In => "in",
            BinOp::Add => "+",
            BinOp::Sub => "-",
            BinOp::Mul => "*",
            BinOp::Div => "/",
            BinOp::Rem => "%",
        }
    }
}

const MATCH_PRECEDENCE: u8 = 3;
const PREFIX_PRECEDENCE: u8 = 7;

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Path { display: String, segments: Vec<Segment> },
    Array(Vec<Expr>),
    Not(Box<Expr>),
    Neg(Box<Expr>),
    Binary(BinOp, Box<Expr>, Box<Expr>),
    /// `=~` with a literal pattern, compiled once.
    MatchLiteral(Box<Expr>, Regex),
    Match(Box<Expr>, Box<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn end_offset(&self) -> usize {
        self.tokens.last().map(|t| t.offset + 1).unwrap_or(0)
    }

    fn expect(&mut self, kind: TokenKind) -> Result<(), ExprError> {
        match self.next() {
            Some(token) if token.kind == kind => Ok(()),
            Some(token) => Err(syntax(
                token.offset,
                format!("expected {kind}, found {}", token.kind),
            )),
            None => Err(syntax(self.end_offset(), format!("expected {kind}"))),
        }
    }

    fn expression(&mut self, min_precedence: u8) -> Result<Expr, ExprError> {
        let mut left = self.prefix()?;

        loop {
            let Some(token) = self.peek() else { break };
            if token.kind == TokenKind::Op("=~") {
                if MATCH_PRECEDENCE < min_precedence {
                    break;
                }
                self.pos += 1;
                let right = self.expression(MATCH_PRECEDENCE + 1)?;
                left = match right {
                    Expr::Literal(Value::String(pattern)) => {
                        let regex = Regex::new(&pattern).map_err(|e| ExprError::Regex {
                            pattern: pattern.clone(),
                            message: e.to_string(),
                        })?;
                        Expr::MatchLiteral(Box::new(left), regex)
                    }
                    other => Expr::Match(Box::new(left), Box::new(other)),
                };
                continue;
            }

            let Some((op, precedence)) = BinOp::from_token(&token.kind) else {
                break;
            };
            if precedence < min_precedence {
                break;
            }
            self.pos += 1;
            let right = self.expression(precedence + 1)?;
            left = Expr::Binary(op, Box::new(left), Box::new(right));
        }

        Ok(left)
    }

    fn prefix(&mut self) -> Result<Expr, ExprError> {
        let end = self.end_offset();
        let token = self
            .next()
            .ok_or_else(|| syntax(end, "unexpected end of expression"))?;

        match token.kind {
            TokenKind::Number(n) => Ok(Expr::Literal(number(n))),
            TokenKind::Str(s) => Ok(Expr::Literal(Value::String(s))),
            TokenKind::Op("!") => Ok(Expr::Not(Box::new(self.expression(PREFIX_PRECEDENCE)?))),
            TokenKind::Op("-") => Ok(Expr::Neg(Box::new(self.expression(PREFIX_PRECEDENCE)?))),
            TokenKind::LParen => {
                let inner = self.expression(0)?;
                self.expect(TokenKind::RParen)?;
                Ok(inner)
            }
            TokenKind::LBracket => {
                let mut items = Vec::new();
                if self.peek().map(|t| &t.kind) == Some(&TokenKind::RBracket) {
                    self.pos += 1;
                    return Ok(Expr::Array(items));
                }
                loop {
                    items.push(self.expression(0)?);
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::Comma,
                            ..
                        }) => continue,
                        Some(Token {
                            kind: TokenKind::RBracket,
                            ..
                        }) => break,
                        Some(other) => {
                            return Err(syntax(
                                other.offset,
                                format!("expected ',' or ']', found {}", other.kind),
                            ));
                        }
                        None => return Err(syntax(self.end_offset(), "unterminated array")),
                    }
                }
                Ok(Expr::Array(items))
            }
            TokenKind::Ident(ident) => {
                let literal = match ident.as_str() {
                    "true" => Some(Value::Bool(true)),
                    "false" => Some(Value::Bool(false)),
                    "null" | "nil" => Some(Value::Null),
                    _ => None,
                };
                match literal {
                    Some(value) => Ok(Expr::Literal(value)),
                    None => self.path(ident.clone(), vec![Segment::Key(ident)]),
                }
            }
            TokenKind::Dollar => self.path("$".to_string(), Vec::new()),
            other => Err(syntax(token.offset, format!("unexpected {other}"))),
        }
    }

    fn path(&mut self, mut display: String, mut segments: Vec<Segment>) -> Result<Expr, ExprError> {
        loop {
            match self.peek().map(|t| t.kind.clone()) {
                Some(TokenKind::Dot) => {
                    self.pos += 1;
                    match self.next() {
                        Some(Token {
                            kind: TokenKind::Ident(key),
                            ..
                        }) => {
                            display.push('.');
                            display.push_str(&key);
                            segments.push(Segment::Key(key));
                        }
                        Some(Token {
                            kind: TokenKind::Star,
                            ..
                        }) => {
                            display.push_str(".*");
                            segments.push(Segment::Wildcard);
                        }
                        Some(other) => {
                            return Err(syntax(
                                other.offset,
                                format!("expected field name, found {}", other.kind),
                            ));
                        }
                        None => return Err(syntax(self.end_offset(), "expected field name")),
                    }
                }
                Some(TokenKind::LBracket) => {
                    self.pos += 1;
                    let end = self.end_offset();
                    let token = self.next().ok_or_else(|| syntax(end, "unterminated index"))?;
                    let segment = match token.kind {
                        TokenKind::Str(key) => {
                            display.push_str(&format!("[{key:?}]"));
                            Segment::Key(key)
                        }
                        TokenKind::Number(n) if n.fract() == 0.0 => {
                            display.push_str(&format!("[{n}]"));
                            Segment::Index(n as i64)
                        }
                        TokenKind::Op("-") => match self.next() {
                            Some(Token {
                                kind: TokenKind::Number(n),
                                ..
                            }) if n.fract() == 0.0 => {
                                display.push_str(&format!("[-{n}]"));
                                Segment::Index(-(n as i64))
                            }
                            _ => return Err(syntax(token.offset, "invalid index")),
                        },
                        TokenKind::Star => {
                            display.push_str("[*]");
                            Segment::Wildcard
                        }
                        other => {
                            return Err(syntax(token.offset, format!("invalid index {other}")));
                        }
                    };
                    self.expect(TokenKind::RBracket)?;
                    segments.push(segment);
                }
                _ => break,
            }
        }
        Ok(Expr::Path { display, segments })
    }
}

fn number(n: f64) -> Value {
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn lookup(value: &Value, segments: &[Segment]) -> Option<Value> {
    let Some((first, rest)) = segments.split_first() else {
        return Some(value.clone());
    };
    match first {
        Segment::Key(key) => lookup(value.as_object()?.get(key)?, rest),
        Segment::Index(index) => {
            let items = value.as_array()?;
            let position = if *index < 0 {
                items.len().checked_sub(index.unsigned_abs() as usize)?
            } else {
                *index as usize
            };
            lookup(items.get(position)?, rest)
        }
        Segment::Wildcard => {
            let children: Vec<&Value> = match value {
                Value::Array(items) => items.iter().collect(),
                Value::Object(map) => map.values().collect(),
                _ => return None,
            };
            Some(Value::Array(
                children
                    .into_iter()
                    .filter_map(|child| lookup(child, rest))
                    .collect(),
            ))
        }
    }
}

/// Structural equality with numbers compared by value.
pub fn json_eq(left: &Value, right: &Value) -> bool {
    match (left, right) {
        (Value::Number(a), Value::Number(b)) => a.as_f64() == b.as_f64(),
        (Value::Array(a), Value::Array(b)) => {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| json_eq(x, y))
        }
        (Value::Object(a), Value::Object(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(key, x)| b.get(key).is_some_and(|y| json_eq(x, y)))
        }
        _ => left == right,
    }
}

impl Expr {
    fn eval(&self, document: &Value) -> Result<Value, EvalError> {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Path { display, segments } => {
                lookup(document, segments).ok_or_else(|| EvalError::UnknownPath(display.clone()))
            }
            Expr::Array(items) => Ok(Value::Array(
                items
                    .iter()
                    .map(|item| item.eval(document))
                    .collect::<Result<_, _>>()?,
            )),
            Expr::Not(inner) => match inner.eval(document)? {
                Value::Bool(b) => Ok(Value::Bool(!b)),
                other => Err(EvalError::TypeMismatch {
                    op: "!",
                    left: type_name(&other),
                    right: "nothing",
                }),
            },
            Expr::Neg(inner) => match inner.eval(document)? {
                Value::Number(n) => Ok(number(-n.as_f64().unwrap_or(0.0))),
                other => Err(EvalError::TypeMismatch {
                    op: "-",
                    left: type_name(&other),
                    right: "nothing",
                }),
            },
            Expr::MatchLiteral(subject, regex) => {
                let subject = subject.eval(document)?;
                match subject {
                    Value::String(s) => Ok(Value::Bool(regex.is_match(&s))),
                    other => Err(EvalError::TypeMismatch {
                        op: "=~",
                        left: type_name(&other),
                        right: "string",
                    }),
                }
            }
            Expr::Match(subject, pattern) => {
                match (subject.eval(document)?, pattern.eval(document)?) {
                    (Value::String(s), Value::String(p)) => {
                        let regex = Regex::new(&p).map_err(|_| EvalError::Regex(p.clone()))?;
                        Ok(Value::Bool(regex.is_match(&s)))
                    }
                    (left, right) => Err(EvalError::TypeMismatch {
                        op: "=~",
                        left: type_name(&left),
                        right: type_name(&right),
                    }),
                }
            }
            Expr::Binary(op, left, right) => eval_binary(*op, left, right, document),
        }
    }
}

fn eval_binary(op: BinOp, left: &Expr, right: &Expr, document: &Value) -> Result<Value, EvalError> {
    let mismatch = |l: &Value, r: &Value| EvalError::TypeMismatch {
        op: op.symbol(),
        left: type_name(l),
        right: type_name(r),
    };

    if matches!(op, BinOp::And | BinOp::Or) {
        let l = left.eval(document)?;
        let Value::Bool(lb) = l else {
            return Err(mismatch(&l, &Value::Bool(false)));
        };
        if (op == BinOp::And && !lb) || (op == BinOp::Or && lb) {
            return Ok(Value::Bool(lb));
        }
        let r = right.eval(document)?;
        return match r {
            Value::Bool(rb) => Ok(Value::Bool(rb)),
            other => Err(mismatch(&Value::Bool(lb), &other)),
        };
    }

    let l = left.eval(document)?;
    let r = right.eval(document)?;
    match op {
        BinOp::Eq => Ok(Value::Bool(json_eq(&l, &r))),
        BinOp::Ne => Ok(Value::Bool(!json_eq(&l, &r))),
        BinOp::In => match &r {
            Value::Array(items) => Ok(Value::Bool(items.iter().any(|item| json_eq(&l, item)))),
            Value::Object(map) => match &l {
                Value::String(key) => Ok(Value::Bool(map.contains_key(key))),
                _ => Err(mismatch(&l, &r)),
            },
            Value::String(haystack) => match &l {
                Value::String(needle) => Ok(Value::Bool(haystack.contains(needle.as_str()))),
                _ => Err(mismatch(&l, &r)),
            },
            _ => Err(mismatch(&l, &r)),
        },
        BinOp::Lt | BinOp::Le | BinOp::Gt | BinOp::Ge => {
            let ordering = match (&l, &r) {
                (Value::Number(a), Value::Number(b)) => a
                    .as_f64()
                    .partial_cmp(&b.as_f64())
                    .ok_or_else(|| mismatch(&l, &r))?,
                (Value::String(a), Value::String(b)) => a.cmp(b),
                _ => return Err(mismatch(&l, &r)),
            };
            let result = match op {
                BinOp::Lt => ordering.is_lt(),
                BinOp::Le => ordering.is_le(),
                BinOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            Ok(Value::Bool(result))
        }
        BinOp::Add => match (&l, &r) {
            (Value::String(a), Value::String(b)) => Ok(Value::String(format!("{a}{b}"))),
            (Value::Number(a), Value::Number(b)) => {
                Ok(number(a.as_f64().unwrap_or(0.0) + b.as_f64().unwrap_or(0.0)))
            }
            _ => Err(mismatch(&l, &r)),
        },
        BinOp::Sub | BinOp::Mul | BinOp::Div | BinOp::Rem => {
            let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
                return Err(mismatch(&l, &r));
            };
            let value = match op {
                BinOp::Sub => a - b,
                BinOp::Mul => a * b,
                _ if b == 0.0 => return Err(EvalError::DivisionByZero),
                BinOp::Div => a / b,
                _ => a % b,
            };
            Ok(number(value))
        }
        BinOp::And | BinOp::Or => unreachable!("handled above"),
    }
}

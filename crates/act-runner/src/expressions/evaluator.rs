// DefaultEvaluator: a small expression language evaluated over a JSON view
// of the run contexts (`github`, `env`, `job`, `steps`, `matrix`, `secrets`).
//
// Grammar, loosest binding first:
//   or      := and ( "||" and )*
//   and     := cmp ( "&&" cmp )*
//   cmp     := unary ( ( "==" | "!=" | "<" | "<=" | ">" | ">=" ) unary )*
//   unary   := "!" unary | postfix
//   postfix := primary ( "." ident | "[" or "]" )*
//   primary := literal | ident "(" args ")" | ident | "(" or ")"
//
// String comparison ignores case; mixed types compare as numbers.

use anyhow::Result;
use serde_json::{Map, Number, Value};
use std::cmp::Ordering;
use std::sync::Arc;

use super::{EvaluatorFactory, ExpressionEvaluator, ExpressionSnapshot};
use crate::error::RunnerError;

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    LBracket,
    RBracket,
    Dot,
    Comma,
    Not,
    And,
    Or,
    Cmp(CmpOp),
    Str(String),
    Num(f64),
    Ident(String),
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

fn tokenize(src: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    let next_is = |i: usize, c: char| chars.get(i + 1) == Some(&c);

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
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
            '.' if tokens.last().is_some_and(is_value_end) => {
                tokens.push(Token::Dot);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '!' if next_is(i, '=') => {
                tokens.push(Token::Cmp(CmpOp::Ne));
                i += 2;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '=' if next_is(i, '=') => {
                tokens.push(Token::Cmp(CmpOp::Eq));
                i += 2;
            }
            '<' | '>' => {
                let or_equal = next_is(i, '=');
                let op = match (c, or_equal) {
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    (_, true) => CmpOp::Ge,
                    (_, false) => CmpOp::Gt,
                };
                tokens.push(Token::Cmp(op));
                i += if or_equal { 2 } else { 1 };
            }
            '&' if next_is(i, '&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next_is(i, '|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '\'' => {
                let mut value = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => return Err("Unterminated string literal".to_string()),
                        Some('\'') if next_is(i, '\'') => {
                            value.push('\'');
                            i += 2;
                        }
                        Some('\'') => {
                            i += 1;
                            break;
                        }
                        Some(ch) => {
                            value.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Str(value));
            }
            // Property names after a dot may start with a digit (`steps.0`).
            c if is_ident_char(c) && tokens.last() == Some(&Token::Dot) => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            c if c.is_ascii_digit() || ((c == '-' || c == '.') && chars.get(i + 1).is_some_and(|n| n.is_ascii_digit())) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let number = parse_number(&literal).ok_or_else(|| format!("Invalid number '{literal}'"))?;
                tokens.push(Token::Num(number));
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && is_ident_char(chars[i]) {
                    i += 1;
                }
                tokens.push(Token::Ident(chars[start..i].iter().collect()));
            }
            other => return Err(format!("Unexpected symbol '{other}'")),
        }
    }
    Ok(tokens)
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '_' || c == '-'
}

fn is_value_end(token: &Token) -> bool {
    matches!(token, Token::Ident(_) | Token::RParen | Token::RBracket)
}

fn parse_number(literal: &str) -> Option<f64> {
    if let Some(hex) = literal.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok().map(|n| n as f64);
    }
    literal.parse::<f64>().ok()
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Expr {
    Literal(Value),
    Named(String),
    Property(Box<Expr>, String),
    Index(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Compare(CmpOp, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

type ParseResult = std::result::Result<Expr, String>;

impl Parser {
    fn parse(src: &str) -> ParseResult {
        let mut parser = Parser {
            tokens: tokenize(src)?,
            pos: 0,
        };
        if parser.tokens.is_empty() {
            return Err("Empty expression".to_string());
        }
        let expr = parser.parse_or()?;
        match parser.peek() {
            None => Ok(expr),
            Some(token) => Err(format!("Unexpected token {token:?}")),
        }
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn expect(&mut self, expected: Token) -> std::result::Result<(), String> {
        match self.advance() {
            Some(token) if token == expected => Ok(()),
            Some(token) => Err(format!("Expected {expected:?}, found {token:?}")),
            None => Err(format!("Expected {expected:?}, found end of expression")),
        }
    }

    fn parse_or(&mut self) -> ParseResult {
        let mut left = self.parse_and()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            left = Expr::Or(Box::new(left), Box::new(self.parse_and()?));
        }
        Ok(left)
    }

    fn parse_and(&mut self) -> ParseResult {
        let mut left = self.parse_cmp()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            left = Expr::And(Box::new(left), Box::new(self.parse_cmp()?));
        }
        Ok(left)
    }

    fn parse_cmp(&mut self) -> ParseResult {
        let mut left = self.parse_unary()?;
        while let Some(Token::Cmp(op)) = self.peek().cloned() {
            self.pos += 1;
            left = Expr::Compare(op, Box::new(left), Box::new(self.parse_unary()?));
        }
        Ok(left)
    }

    fn parse_unary(&mut self) -> ParseResult {
        if self.peek() == Some(&Token::Not) {
            self.pos += 1;
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_postfix()
    }

    fn parse_postfix(&mut self) -> ParseResult {
        let mut expr = self.parse_primary()?;
        loop {
            match self.peek() {
                Some(Token::Dot) => {
                    self.pos += 1;
                    match self.advance() {
                        Some(Token::Ident(name)) => expr = Expr::Property(Box::new(expr), name),
                        other => return Err(format!("Expected property name, found {other:?}")),
                    }
                }
                Some(Token::LBracket) => {
                    self.pos += 1;
                    let index = self.parse_or()?;
                    self.expect(Token::RBracket)?;
                    expr = Expr::Index(Box::new(expr), Box::new(index));
                }
                _ => return Ok(expr),
            }
        }
    }

    fn parse_primary(&mut self) -> ParseResult {
        match self.advance() {
            Some(Token::Str(s)) => Ok(Expr::Literal(Value::String(s))),
            Some(Token::Num(n)) => Ok(Expr::Literal(number(n))),
            Some(Token::LParen) => {
                let expr = self.parse_or()?;
                self.expect(Token::RParen)?;
                Ok(expr)
            }
            Some(Token::Ident(name)) => match name.as_str() {
                "true" => Ok(Expr::Literal(Value::Bool(true))),
                "false" => Ok(Expr::Literal(Value::Bool(false))),
                "null" => Ok(Expr::Literal(Value::Null)),
                _ if self.peek() == Some(&Token::LParen) => {
                    self.pos += 1;
                    let mut args = Vec::new();
                    if self.peek() != Some(&Token::RParen) {
                        loop {
                            args.push(self.parse_or()?);
                            if self.peek() == Some(&Token::Comma) {
                                self.pos += 1;
                            } else {
                                break;
                            }
                        }
                    }
                    self.expect(Token::RParen)?;
                    Ok(Expr::Call(name, args))
                }
                _ => Ok(Expr::Named(name)),
            },
            Some(token) => Err(format!("Unexpected token {token:?}")),
            None => Err("Unexpected end of expression".to_string()),
        }
    }
}

// ---------------------------------------------------------------------------
// Values
// ---------------------------------------------------------------------------

fn number(n: f64) -> Value {
    Number::from_f64(n).map(Value::Number).unwrap_or(Value::Null)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn to_number(value: &Value) -> f64 {
    match value {
        Value::Null => 0.0,
        Value::Bool(b) => f64::from(u8::from(*b)),
        Value::Number(n) => n.as_f64().unwrap_or(f64::NAN),
        Value::String(s) if s.trim().is_empty() => 0.0,
        Value::String(s) => parse_number(s.trim()).unwrap_or(f64::NAN),
        Value::Array(_) | Value::Object(_) => f64::NAN,
    }
}

/// Render a value the way it appears after interpolation.
fn to_output_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => match n.as_f64() {
            Some(f) if f.fract() == 0.0 && f.abs() < 1e15 => format!("{}", f as i64),
            _ => n.to_string(),
        },
        Value::String(s) => s.clone(),
        Value::Array(_) | Value::Object(_) => serde_json::to_string_pretty(value).unwrap_or_default(),
    }
}

fn loose_eq(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Null, Value::Null) => true,
        (Value::Bool(x), Value::Bool(y)) => x == y,
        (Value::String(x), Value::String(y)) => x.to_lowercase() == y.to_lowercase(),
        (Value::Array(_) | Value::Object(_), _) | (_, Value::Array(_) | Value::Object(_)) => a == b,
        _ => to_number(a) == to_number(b),
    }
}

fn compare(op: CmpOp, a: &Value, b: &Value) -> bool {
    let ordering = match (a, b) {
        (Value::String(x), Value::String(y)) => Some(x.to_lowercase().cmp(&y.to_lowercase())),
        _ => to_number(a).partial_cmp(&to_number(b)),
    };
    match op {
        CmpOp::Eq => loose_eq(a, b),
        CmpOp::Ne => !loose_eq(a, b),
        CmpOp::Lt => ordering == Some(Ordering::Less),
        CmpOp::Le => matches!(ordering, Some(Ordering::Less | Ordering::Equal)),
        CmpOp::Gt => ordering == Some(Ordering::Greater),
        CmpOp::Ge => matches!(ordering, Some(Ordering::Greater | Ordering::Equal)),
    }
}

fn get_ignore_case<'a>(map: &'a Map<String, Value>, key: &str) -> Option<&'a Value> {
    map.get(key)
        .or_else(|| map.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)).map(|(_, v)| v))
}

// ---------------------------------------------------------------------------
// Evaluator
// ---------------------------------------------------------------------------

/// Evaluator over a fixed JSON context object.
#[derive(Debug, Clone)]
pub struct DefaultEvaluator {
    context: Value,
}

type EvalResult = std::result::Result<Value, String>;

impl DefaultEvaluator {
    pub fn new(context: Value) -> Self {
        Self { context }
    }

    pub fn from_snapshot(snapshot: &ExpressionSnapshot) -> Self {
        let context = serde_json::to_value(snapshot).unwrap_or_else(|e| {
            tracing::warn!(target: "step", "Unable to serialize expression contexts: {}", e);
            Value::Object(Map::new())
        });
        Self::new(context)
    }

    fn eval(&self, expr: &Expr) -> EvalResult {
        match expr {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Named(name) => self
                .context
                .as_object()
                .and_then(|ctx| get_ignore_case(ctx, name))
                .cloned()
                .ok_or_else(|| format!("Unrecognized named-value: '{name}'")),
            Expr::Property(base, name) => {
                let base = self.eval(base)?;
                Ok(base
                    .as_object()
                    .and_then(|obj| get_ignore_case(obj, name))
                    .cloned()
                    .unwrap_or(Value::Null))
            }
            Expr::Index(base, index) => {
                let base = self.eval(base)?;
                let index = self.eval(index)?;
                let value = match (&base, &index) {
                    (Value::Object(obj), Value::String(key)) => get_ignore_case(obj, key).cloned(),
                    (Value::Array(items), Value::Number(n)) => n
                        .as_f64()
                        .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                        .and_then(|f| items.get(f as usize))
                        .cloned(),
                    _ => None,
                };
                Ok(value.unwrap_or(Value::Null))
            }
            Expr::Not(inner) => Ok(Value::Bool(!truthy(&self.eval(inner)?))),
            Expr::And(left, right) => {
                let left = self.eval(left)?;
                if !truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Or(left, right) => {
                let left = self.eval(left)?;
                if truthy(&left) {
                    return Ok(left);
                }
                self.eval(right)
            }
            Expr::Compare(op, left, right) => {
                let left = self.eval(left)?;
                let right = self.eval(right)?;
                Ok(Value::Bool(compare(*op, &left, &right)))
            }
            Expr::Call(name, args) => {
                let args = args.iter().map(|a| self.eval(a)).collect::<std::result::Result<Vec<_>, _>>()?;
                self.call(name, &args)
            }
        }
    }

    fn job_failed(&self) -> bool {
        self.context
            .pointer("/job/status")
            .and_then(Value::as_str)
            .is_some_and(|status| status == "failure")
    }

    fn call(&self, name: &str, args: &[Value]) -> EvalResult {
        let lower = name.to_lowercase();
        let arity = |min: usize, max: usize| {
            if args.len() < min || args.len() > max {
                Err(format!("Function '{name}' expects {min}..={max} arguments, got {}", args.len()))
            } else {
                Ok(())
            }
        };
        let text = |i: usize| to_output_string(&args[i]).to_lowercase();

        match lower.as_str() {
            "boolean" => {
                arity(1, 1)?;
                Ok(Value::Bool(truthy(&args[0])))
            }
            "contains" => {
                arity(2, 2)?;
                Ok(Value::Bool(match &args[0] {
                    Value::Array(items) => items.iter().any(|item| loose_eq(item, &args[1])),
                    _ => text(0).contains(&text(1)),
                }))
            }
            "startswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(text(0).starts_with(&text(1))))
            }
            "endswith" => {
                arity(2, 2)?;
                Ok(Value::Bool(text(0).ends_with(&text(1))))
            }
            "format" => {
                arity(1, usize::MAX)?;
                format_string(&to_output_string(&args[0]), &args[1..]).map(Value::String)
            }
            "join" => {
                arity(1, 2)?;
                let separator = args.get(1).map(to_output_string).unwrap_or_else(|| ",".to_string());
                Ok(Value::String(match &args[0] {
                    Value::Array(items) => items.iter().map(to_output_string).collect::<Vec<_>>().join(&separator),
                    other => to_output_string(other),
                }))
            }
            "tojson" => {
                arity(1, 1)?;
                serde_json::to_string_pretty(&args[0])
                    .map(Value::String)
                    .map_err(|e| e.to_string())
            }
            "fromjson" => {
                arity(1, 1)?;
                serde_json::from_str(&to_output_string(&args[0])).map_err(|e| format!("Invalid JSON: {e}"))
            }
            "success" => {
                arity(0, 0)?;
                Ok(Value::Bool(!self.job_failed()))
            }
            "failure" => {
                arity(0, 0)?;
                Ok(Value::Bool(self.job_failed()))
            }
            "always" => {
                arity(0, 0)?;
                Ok(Value::Bool(true))
            }
            "cancelled" => {
                arity(0, 0)?;
                Ok(Value::Bool(false))
            }
            _ => Err(format!("Unknown function '{name}'")),
        }
    }
}

/// `format('{0} and {1}', a, b)`; `{{` and `}}` are literal braces.
fn format_string(template: &str, args: &[Value]) -> std::result::Result<String, String> {
    let mut out = String::new();
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '{' if chars.peek() == Some(&'{') => {
                chars.next();
                out.push('{');
            }
            '}' if chars.peek() == Some(&'}') => {
                chars.next();
                out.push('}');
            }
            '{' => {
                let mut index = String::new();
                loop {
                    match chars.next() {
                        Some('}') => break,
                        Some(d) if d.is_ascii_digit() => index.push(d),
                        _ => return Err(format!("Invalid format string '{template}'")),
                    }
                }
                let arg = index
                    .parse::<usize>()
                    .ok()
                    .and_then(|i| args.get(i))
                    .ok_or_else(|| format!("Format index {{{index}}} out of range"))?;
                out.push_str(&to_output_string(arg));
            }
            '}' => return Err(format!("Invalid format string '{template}'")),
            other => out.push(other),
        }
    }
    Ok(out)
}

/// Offset of the `}}` closing an embedded expression, skipping quoted text.
fn find_expression_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => in_string = !in_string,
            b'}' if !in_string && bytes.get(i + 1) == Some(&b'}') => return Some(i),
            _ => {}
        }
        i += 1;
    }
    None
}

impl ExpressionEvaluator for DefaultEvaluator {
    fn evaluate(&self, expression: &str) -> Result<String> {
        let parsed = Parser::parse(expression).map_err(|reason| RunnerError::expression(expression, reason))?;
        let value = self
            .eval(&parsed)
            .map_err(|reason| RunnerError::expression(expression, reason))?;
        Ok(to_output_string(&value))
    }

    fn interpolate(&self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        let mut rest = text;
        while let Some(start) = rest.find("${{") {
            out.push_str(&rest[..start]);
            let inner = &rest[start + 3..];
            let end = find_expression_end(inner)
                .ok_or_else(|| RunnerError::expression(text, "Unclosed '${{'"))?;
            out.push_str(&self.evaluate(inner[..end].trim())?);
            rest = &inner[end + 2..];
        }
        out.push_str(rest);
        Ok(out)
    }
}

/// Builds a `DefaultEvaluator` per snapshot.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultEvaluatorFactory;

impl EvaluatorFactory for DefaultEvaluatorFactory {
    fn new_evaluator(&self, snapshot: ExpressionSnapshot) -> Arc<dyn ExpressionEvaluator> {
        Arc::new(DefaultEvaluator::from_snapshot(&snapshot))
    }
}

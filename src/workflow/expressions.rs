//! Parsing and evaluation of CI `${{ … }}` expressions.
//!
//! Expressions whose leaves are all known at build time collapse to literal
//! strings. Anything touching a runtime value (`job.status`, `steps.*`,
//! `env.*`, …) is emitted as a shell invocation of the embedded
//! `eval_expression` helper, which receives the token stream and evaluates
//! it when the script runs.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};

use super::context::RootContext;
use crate::error::{ReproduceError, Result};

const FUNCTIONS: &[&str] = &[
    "contains",
    "startswith",
    "endswith",
    "format",
    "join",
    "tojson",
    "fromjson",
    "hashfiles",
    "success",
    "always",
    "cancelled",
    "failure",
];

/// Functions whose value depends on the run, not the workflow text.
const DYNAMIC_FUNCTIONS: &[&str] = &["hashfiles", "success", "always", "cancelled", "failure"];

static EXPR_REGION: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{\{([^}']|'(''|[^'])*')*\}\}").unwrap());

#[derive(Debug, Clone, PartialEq)]
pub enum Token {
    Literal(Value),
    Number(f64),
    Str(String),
    Context(String),
    Function(String),
    Op(String),
    Paren(char),
}

impl Token {
    /// Resolve the token into interpolatable text plus a dynamic flag; a
    /// dynamic value must not be shell-quoted.
    fn stringify(&self, root_context: &RootContext) -> (String, bool) {
        match self {
            Token::Context(path) => {
                let (value, dynamic) = root_context.get(path);
                (value_to_string(&value), dynamic)
            }
            Token::Literal(value) => (value_to_string(value), false),
            Token::Number(n) => (format_number(*n), false),
            Token::Str(s) => (s.clone(), false),
            Token::Function(name) => (name.clone(), false),
            Token::Op(op) => (op.clone(), false),
            Token::Paren(p) => (p.to_string(), false),
        }
    }

    /// Render the typed `kind:value` argument the eval helper expects.
    fn to_eval_argument(&self, root_context: &RootContext) -> String {
        let prefix = match self {
            Token::Context(path) => {
                let (value, _) = root_context.get(path);
                if value.is_string() {
                    's'
                } else {
                    'l'
                }
            }
            Token::Str(_) => 's',
            Token::Number(_) => 'n',
            Token::Literal(_) => 'l',
            Token::Function(_) => 'f',
            Token::Op(_) => 'o',
            Token::Paren(_) => 'p',
        };
        let (value, dynamic) = self.stringify(root_context);
        let value = if dynamic { value } else { shell_quote(&value) };
        format!("{prefix}:{value}")
    }
}

#[derive(Debug, Clone)]
enum Expr {
    Atom(Token),
    Unary(String, Box<Expr>),
    Binary(String, Box<Expr>, Box<Expr>),
    Call(String, Vec<Expr>),
}

// ---------------------------------------------------------------------------
// Lexer
// ---------------------------------------------------------------------------

struct Lexer<'a> {
    chars: Vec<char>,
    pos: usize,
    src: &'a str,
}

impl<'a> Lexer<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            chars: src.chars().collect(),
            pos: 0,
            src,
        }
    }

    fn error(&self, message: &str) -> ReproduceError {
        ReproduceError::ExpressionParse(format!("{message} in expression: {}", self.src))
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn tokenize(&mut self) -> Result<Vec<Token>> {
        let mut tokens = Vec::new();
        while let Some(c) = self.peek() {
            if c.is_whitespace() {
                self.pos += 1;
                continue;
            }
            match c {
                '\'' => tokens.push(self.string_literal()?),
                '(' | ')' => {
                    tokens.push(Token::Paren(c));
                    self.pos += 1;
                }
                ',' => {
                    tokens.push(Token::Op(",".to_string()));
                    self.pos += 1;
                }
                '!' | '<' | '>' | '=' | '&' | '|' => tokens.push(self.operator()?),
                c if c.is_ascii_digit() || c == '-' || c == '+' || c == '.' => {
                    tokens.push(self.number()?)
                }
                c if c.is_alphabetic() || c == '_' => tokens.push(self.identifier()),
                _ => return Err(self.error(&format!("unexpected character '{c}'"))),
            }
        }
        Ok(tokens)
    }

    fn string_literal(&mut self) -> Result<Token> {
        // Single-quoted, with '' as the escape for a literal quote.
        self.pos += 1;
        let mut value = String::new();
        loop {
            match self.peek() {
                Some('\'') => {
                    if self.chars.get(self.pos + 1) == Some(&'\'') {
                        value.push('\'');
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                        return Ok(Token::Str(value));
                    }
                }
                Some(c) => {
                    value.push(c);
                    self.pos += 1;
                }
                None => return Err(self.error("unterminated string literal")),
            }
        }
    }

    fn operator(&mut self) -> Result<Token> {
        let two: String = self.chars[self.pos..self.chars.len().min(self.pos + 2)]
            .iter()
            .collect();
        for op in ["<=", ">=", "==", "!=", "&&", "||"] {
            if two.starts_with(op) {
                self.pos += 2;
                return Ok(Token::Op(op.to_string()));
            }
        }
        let c = self.chars[self.pos];
        match c {
            '!' | '<' | '>' => {
                self.pos += 1;
                Ok(Token::Op(c.to_string()))
            }
            _ => Err(self.error(&format!("unexpected character '{c}'"))),
        }
    }

    fn number(&mut self) -> Result<Token> {
        let start = self.pos;
        if matches!(self.peek(), Some('-') | Some('+')) {
            self.pos += 1;
        }
        // Hex literals.
        if self.peek() == Some('0') && matches!(self.chars.get(self.pos + 1), Some('x') | Some('X'))
        {
            self.pos += 2;
            let digits_start = self.pos;
            while self
                .peek()
                .is_some_and(|c| c.is_ascii_hexdigit())
            {
                self.pos += 1;
            }
            let digits: String = self.chars[digits_start..self.pos].iter().collect();
            let sign = if self.chars[start] == '-' { -1.0 } else { 1.0 };
            let parsed = i64::from_str_radix(&digits, 16)
                .map_err(|_| self.error("invalid hex literal"))?;
            return Ok(Token::Number(sign * parsed as f64));
        }
        while self
            .peek()
            .is_some_and(|c| c.is_ascii_digit() || c == '.' || c == 'e' || c == 'E')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        text.parse::<f64>()
            .map(Token::Number)
            .map_err(|_| self.error(&format!("invalid number literal '{text}'")))
    }

    fn identifier(&mut self) -> Token {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| c.is_alphanumeric() || c == '_' || c == '-' || c == '.')
        {
            self.pos += 1;
        }
        let text: String = self.chars[start..self.pos].iter().collect();
        match text.as_str() {
            "true" => Token::Literal(json!(true)),
            "false" => Token::Literal(json!(false)),
            "null" => Token::Literal(Value::Null),
            _ if FUNCTIONS.contains(&text.to_lowercase().as_str())
                && self.peek_past_whitespace() == Some('(') =>
            {
                Token::Function(text)
            }
            _ => Token::Context(text),
        }
    }

    fn peek_past_whitespace(&self) -> Option<char> {
        let mut pos = self.pos;
        while self.chars.get(pos).is_some_and(|c| c.is_whitespace()) {
            pos += 1;
        }
        self.chars.get(pos).copied()
    }
}

// ---------------------------------------------------------------------------
// Parser (precedence climbing: ! binds tightest, then comparisons, &&, ||)
// ---------------------------------------------------------------------------

struct Parser<'a> {
    tokens: Vec<Token>,
    pos: usize,
    src: &'a str,
}

fn precedence(op: &str) -> Option<u8> {
    match op {
        "||" => Some(1),
        "&&" => Some(2),
        "<" | ">" | "<=" | ">=" | "==" | "!=" => Some(3),
        _ => None,
    }
}

impl<'a> Parser<'a> {
    fn error(&self, message: &str) -> ReproduceError {
        ReproduceError::ExpressionParse(format!("{message} in expression: {}", self.src))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        if token.is_some() {
            self.pos += 1;
        }
        token
    }

    fn parse_expression(&mut self, min_precedence: u8) -> Result<Expr> {
        let mut lhs = self.parse_unary()?;
        while let Some(Token::Op(op)) = self.peek() {
            let Some(op_precedence) = precedence(op) else {
                break;
            };
            if op_precedence < min_precedence {
                break;
            }
            let op = op.clone();
            self.pos += 1;
            let rhs = self.parse_expression(op_precedence + 1)?;
            lhs = Expr::Binary(op, Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr> {
        if let Some(Token::Op(op)) = self.peek() {
            if op == "!" {
                self.pos += 1;
                let operand = self.parse_unary()?;
                return Ok(Expr::Unary("!".to_string(), Box::new(operand)));
            }
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Paren('(')) => {
                let inner = self.parse_expression(1)?;
                match self.next() {
                    Some(Token::Paren(')')) => Ok(inner),
                    _ => Err(self.error("expected ')'")),
                }
            }
            Some(Token::Function(name)) => {
                match self.next() {
                    Some(Token::Paren('(')) => {}
                    _ => return Err(self.error("expected '(' after function name")),
                }
                let mut args = Vec::new();
                if self.peek() != Some(&Token::Paren(')')) {
                    loop {
                        args.push(self.parse_expression(1)?);
                        match self.peek() {
                            Some(Token::Op(op)) if op == "," => {
                                self.pos += 1;
                            }
                            _ => break,
                        }
                    }
                }
                match self.next() {
                    Some(Token::Paren(')')) => Ok(Expr::Call(name.to_lowercase(), args)),
                    _ => Err(self.error("expected ')' to close argument list")),
                }
            }
            Some(token @ (Token::Literal(_) | Token::Number(_) | Token::Str(_))) => {
                Ok(Expr::Atom(token))
            }
            Some(Token::Context(path)) => Ok(Expr::Atom(Token::Context(path))),
            other => Err(self.error(&format!("unexpected token {other:?}"))),
        }
    }
}

fn parse(expression: &str) -> Result<Expr> {
    let inner = expression
        .trim()
        .strip_prefix("${{")
        .and_then(|s| s.strip_suffix("}}"))
        .unwrap_or(expression)
        .trim();
    let tokens = Lexer::new(inner).tokenize()?;
    if tokens.is_empty() {
        return Err(ReproduceError::ExpressionParse(format!(
            "empty expression: {expression}"
        )));
    }
    let mut parser = Parser {
        tokens,
        pos: 0,
        src: inner,
    };
    let expr = parser.parse_expression(1)?;
    if parser.pos != parser.tokens.len() {
        return Err(parser.error("trailing tokens"));
    }
    Ok(expr)
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// True when any leaf of the expression resolves to a runtime-only value.
fn is_dynamic(expr: &Expr, root_context: &RootContext) -> bool {
    match expr {
        Expr::Atom(Token::Context(path)) => root_context.get(path).1,
        Expr::Atom(_) => false,
        Expr::Unary(_, operand) => is_dynamic(operand, root_context),
        Expr::Binary(_, lhs, rhs) => {
            is_dynamic(lhs, root_context) || is_dynamic(rhs, root_context)
        }
        Expr::Call(name, args) => {
            DYNAMIC_FUNCTIONS.contains(&name.as_str())
                || args.iter().any(|a| is_dynamic(a, root_context))
        }
    }
}

/// Provider truthiness: false, null, '', and 0 are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|v| v != 0.0),
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Loose equality: numbers compare numerically, strings case-insensitively.
fn loose_eq(a: &Value, b: &Value) -> bool {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x == y;
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return x.to_lowercase() == y.to_lowercase();
    }
    a == b
}

fn compare(a: &Value, b: &Value) -> Option<std::cmp::Ordering> {
    if let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) {
        return x.partial_cmp(&y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Some(x.to_lowercase().cmp(&y.to_lowercase()));
    }
    None
}

fn eval_static(expr: &Expr, root_context: &RootContext) -> Result<Value> {
    match expr {
        Expr::Atom(Token::Literal(value)) => Ok(value.clone()),
        Expr::Atom(Token::Number(n)) => Ok(json!(n)),
        Expr::Atom(Token::Str(s)) => Ok(json!(s)),
        Expr::Atom(Token::Context(path)) => Ok(root_context.get(path).0),
        Expr::Atom(other) => Err(ReproduceError::ExpressionParse(format!(
            "unexpected atom {other:?}"
        ))),
        Expr::Unary(_, operand) => {
            let value = eval_static(operand, root_context)?;
            Ok(json!(!truthy(&value)))
        }
        Expr::Binary(op, lhs, rhs) => {
            let left = eval_static(lhs, root_context)?;
            // Short-circuiting operators return an operand, not a bool.
            match op.as_str() {
                "&&" => {
                    return if truthy(&left) {
                        eval_static(rhs, root_context)
                    } else {
                        Ok(left)
                    };
                }
                "||" => {
                    return if truthy(&left) {
                        Ok(left)
                    } else {
                        eval_static(rhs, root_context)
                    };
                }
                _ => {}
            }
            let right = eval_static(rhs, root_context)?;
            let result = match op.as_str() {
                "==" => loose_eq(&left, &right),
                "!=" => !loose_eq(&left, &right),
                "<" => compare(&left, &right) == Some(std::cmp::Ordering::Less),
                ">" => compare(&left, &right) == Some(std::cmp::Ordering::Greater),
                "<=" => matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Less) | Some(std::cmp::Ordering::Equal)
                ),
                ">=" => matches!(
                    compare(&left, &right),
                    Some(std::cmp::Ordering::Greater) | Some(std::cmp::Ordering::Equal)
                ),
                other => {
                    return Err(ReproduceError::ExpressionParse(format!(
                        "unsupported operator {other}"
                    )))
                }
            };
            Ok(json!(result))
        }
        Expr::Call(name, args) => {
            let values: Result<Vec<Value>> = args
                .iter()
                .map(|a| eval_static(a, root_context))
                .collect();
            let values = values?;
            eval_function(name, &values)
        }
    }
}

fn eval_function(name: &str, args: &[Value]) -> Result<Value> {
    let arg = |i: usize| args.get(i).cloned().unwrap_or(Value::Null);
    match name {
        "contains" => {
            let haystack = arg(0);
            let needle = value_to_string(&arg(1)).to_lowercase();
            let result = match haystack {
                Value::Array(items) => items
                    .iter()
                    .any(|item| value_to_string(item).to_lowercase() == needle),
                other => value_to_string(&other).to_lowercase().contains(&needle),
            };
            Ok(json!(result))
        }
        "startswith" => Ok(json!(value_to_string(&arg(0))
            .to_lowercase()
            .starts_with(&value_to_string(&arg(1)).to_lowercase()))),
        "endswith" => Ok(json!(value_to_string(&arg(0))
            .to_lowercase()
            .ends_with(&value_to_string(&arg(1)).to_lowercase()))),
        "format" => {
            let template = value_to_string(&arg(0));
            let mut result = String::new();
            let mut chars = template.chars().peekable();
            while let Some(c) = chars.next() {
                if c == '{' {
                    if chars.peek() == Some(&'{') {
                        chars.next();
                        result.push('{');
                        continue;
                    }
                    let mut digits = String::new();
                    while chars.peek().is_some_and(|d| d.is_ascii_digit()) {
                        digits.push(chars.next().unwrap());
                    }
                    if chars.peek() == Some(&'}') {
                        chars.next();
                        let index: usize = digits.parse().unwrap_or(0);
                        result.push_str(&value_to_string(&arg(index + 1)));
                    }
                } else if c == '}' && chars.peek() == Some(&'}') {
                    chars.next();
                    result.push('}');
                } else {
                    result.push(c);
                }
            }
            Ok(json!(result))
        }
        "join" => {
            let separator = args
                .get(1)
                .map(value_to_string)
                .unwrap_or_else(|| ",".to_string());
            let joined = match arg(0) {
                Value::Array(items) => items
                    .iter()
                    .map(value_to_string)
                    .collect::<Vec<_>>()
                    .join(&separator),
                other => value_to_string(&other),
            };
            Ok(json!(joined))
        }
        "tojson" => Ok(json!(serde_json::to_string(&arg(0))?)),
        "fromjson" => {
            let text = value_to_string(&arg(0));
            serde_json::from_str(&text).map_err(ReproduceError::from)
        }
        other => Err(ReproduceError::ExpressionParse(format!(
            "function {other} cannot be evaluated statically"
        ))),
    }
}

// ---------------------------------------------------------------------------
// Flattening for the deferred helper
// ---------------------------------------------------------------------------

fn flatten(expr: &Expr, out: &mut Vec<Token>) {
    match expr {
        Expr::Atom(token) => out.push(token.clone()),
        Expr::Unary(op, operand) => {
            out.push(Token::Op(op.clone()));
            flatten_child(operand, out);
        }
        Expr::Binary(op, lhs, rhs) => {
            flatten_child(lhs, out);
            out.push(Token::Op(op.clone()));
            flatten_child(rhs, out);
        }
        Expr::Call(name, args) => {
            out.push(Token::Function(name.clone()));
            out.push(Token::Paren('('));
            for arg in args {
                flatten(arg, out);
            }
            out.push(Token::Paren(')'));
        }
    }
}

fn flatten_child(expr: &Expr, out: &mut Vec<Token>) {
    match expr {
        Expr::Atom(_) | Expr::Call(..) => flatten(expr, out),
        _ => {
            out.push(Token::Paren('('));
            flatten(expr, out);
            out.push(Token::Paren(')'));
        }
    }
}

// ---------------------------------------------------------------------------
// Public surface
// ---------------------------------------------------------------------------

/// Resolve an expression to interpolatable text.
///
/// Returns `(resolved, is_dynamic)`: a static result is plain text the
/// caller must quote, a dynamic one is a shell fragment to splice verbatim.
pub fn parse_expression(
    expression: &str,
    job_id: &str,
    root_context: &RootContext,
    quote_result: bool,
) -> Result<(String, bool)> {
    let expr = parse(expression)?;

    if !is_dynamic(&expr, root_context) {
        let value = eval_static(&expr, root_context)?;
        let text = value_to_string(&value);
        if quote_result {
            return Ok((shell_quote(&text), true));
        }
        return Ok((text, false));
    }

    // A lone dynamic context reference interpolates directly without the
    // helper.
    if let Expr::Atom(token @ Token::Context(_)) = &expr {
        let (value, dynamic) = token.stringify(root_context);
        return Ok((value, dynamic));
    }

    let eval_script = format!("/home/github/{job_id}/helpers/eval_expression");
    let mut tokens = Vec::new();
    flatten(&expr, &mut tokens);
    let args: Vec<String> = tokens
        .iter()
        .map(|t| t.to_eval_argument(root_context))
        .collect();
    Ok((format!("\"$({} {})\"", eval_script, args.join(" ")), true))
}

/// Replace every `${{ … }}` region in `s`, shell-quoting the static parts so
/// the result is safe to splice into bash.
pub fn substitute_expressions(s: &str, job_id: &str, root_context: &RootContext) -> Result<String> {
    let mut parts: Vec<String> = vec![String::new()];
    let mut idx = 0;

    for found in EXPR_REGION.find_iter(s) {
        parts.last_mut().unwrap().push_str(&s[idx..found.start()]);
        idx = found.end();
        let (resolved, dynamic) = parse_expression(found.as_str(), job_id, root_context, false)?;

        if dynamic {
            // Quote the static prefix, then splice the dynamic part raw.
            let last = parts.last_mut().unwrap();
            if !last.is_empty() {
                *last = shell_quote(last);
            }
            parts.push(resolved);
            parts.push(String::new());
        } else {
            parts.last_mut().unwrap().push_str(&resolved);
        }
    }

    parts.last_mut().unwrap().push_str(&s[idx..]);
    if let Some(last) = parts.last_mut() {
        if !last.is_empty() {
            *last = shell_quote(last);
        }
    }

    Ok(parts.concat())
}

/// Provider stringification: null is empty, strings pass through, anything
/// else serializes as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Number(n) => {
            if let Some(f) = n.as_f64() {
                format_number(f)
            } else {
                n.to_string()
            }
        }
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

fn format_number(n: f64) -> String {
    if n.fract() == 0.0 && n.abs() < 1e15 {
        format!("{}", n as i64)
    } else {
        format!("{n}")
    }
}

/// POSIX shell quoting, same contract as Python's `shlex.quote`.
pub fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        return "''".to_string();
    }
    let safe = s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "_@%+=:,./-".contains(c));
    if safe {
        return s.to_string();
    }
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workflow::context::JobFacts;

    fn context() -> RootContext {
        let facts = JobFacts {
            repo: "owner/project".into(),
            sha: "abc123".into(),
            job_id: "987".into(),
            build_id: "555".into(),
            branch: "main".into(),
            workflow_job_id: "build".into(),
        };
        RootContext::new(&facts, json!({"os": "ubuntu-20.04", "node": 14}), 1)
    }

    #[test]
    fn test_static_context_reference() {
        let ctx = context();
        let (resolved, dynamic) =
            parse_expression("${{ matrix.node }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "14");
        assert!(!dynamic);
    }

    #[test]
    fn test_static_string_literal_with_escape() {
        let ctx = context();
        let (resolved, dynamic) =
            parse_expression("${{ 'it''s fine' }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "it's fine");
        assert!(!dynamic);
    }

    #[test]
    fn test_static_boolean_expression() {
        let ctx = context();
        let (resolved, _) =
            parse_expression("${{ matrix.node == 14 }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "true");
        let (resolved, _) =
            parse_expression("${{ matrix.node > 20 }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "false");
    }

    #[test]
    fn test_string_equality_is_case_insensitive() {
        let ctx = context();
        let (resolved, _) =
            parse_expression("${{ matrix.os == 'UBUNTU-20.04' }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "true");
    }

    #[test]
    fn test_operator_precedence() {
        let ctx = context();
        // ! binds tighter than ==; && tighter than ||.
        let (resolved, _) =
            parse_expression("${{ false && true || true }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "true");
        let (resolved, _) =
            parse_expression("${{ !false && true }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "true");
    }

    #[test]
    fn test_static_functions() {
        let ctx = context();
        let cases = [
            ("${{ contains('hello world', 'WORLD') }}", "true"),
            ("${{ startsWith(matrix.os, 'ubuntu') }}", "true"),
            ("${{ endsWith(matrix.os, '22.04') }}", "false"),
            ("${{ format('node-{0}-on-{1}', matrix.node, matrix.os) }}", "node-14-on-ubuntu-20.04"),
            ("${{ join(fromJSON('[\"a\",\"b\"]'), '-') }}", "a-b"),
        ];
        for (expression, expected) in cases {
            let (resolved, dynamic) = parse_expression(expression, "987", &ctx, false).unwrap();
            assert_eq!(resolved, expected, "{expression}");
            assert!(!dynamic);
        }
    }

    #[test]
    fn test_dynamic_leaf_defers_to_helper() {
        let ctx = context();
        let (resolved, dynamic) =
            parse_expression("${{ job.status == 'success' }}", "987", &ctx, false).unwrap();
        assert!(dynamic);
        assert!(resolved.starts_with("\"$(/home/github/987/helpers/eval_expression "));
        assert!(resolved.contains("o:=="));
        assert!(resolved.contains("s:success"));
        assert!(resolved.ends_with(")\""));
    }

    #[test]
    fn test_dynamic_status_function_defers() {
        let ctx = context();
        let (resolved, dynamic) = parse_expression("${{ success() }}", "987", &ctx, false).unwrap();
        assert!(dynamic);
        assert!(resolved.contains("f:success"));
        assert!(resolved.contains("p:'('"));
        assert!(resolved.contains("p:')'"));
    }

    #[test]
    fn test_lone_dynamic_context_interpolates_directly() {
        let ctx = context();
        let (resolved, dynamic) =
            parse_expression("${{ github.workspace }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "${GITHUB_WORKSPACE}");
        assert!(dynamic);
    }

    #[test]
    fn test_substitute_expressions_mixed() {
        let ctx = context();
        let result =
            substitute_expressions("echo node ${{ matrix.node }} here", "987", &ctx).unwrap();
        assert_eq!(result, shell_quote("echo node 14 here"));
    }

    #[test]
    fn test_substitute_expressions_with_dynamic_part() {
        let ctx = context();
        let result = substitute_expressions("cd ${{ github.workspace }}/sub", "987", &ctx).unwrap();
        assert_eq!(result, "'cd '${GITHUB_WORKSPACE}/sub");
    }

    #[test]
    fn test_substitute_no_expressions_quotes_whole() {
        let ctx = context();
        let result = substitute_expressions("plain text here", "987", &ctx).unwrap();
        assert_eq!(result, shell_quote("plain text here"));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("simple-word.txt"), "simple-word.txt");
        assert_eq!(shell_quote("has space"), "'has space'");
        assert_eq!(shell_quote("don't"), "'don'\"'\"'t'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn test_parse_error_on_garbage() {
        let ctx = context();
        assert!(parse_expression("${{ == && }}", "987", &ctx, false).is_err());
    }

    #[test]
    fn test_hex_literal() {
        let ctx = context();
        let (resolved, _) = parse_expression("${{ 0xff }}", "987", &ctx, false).unwrap();
        assert_eq!(resolved, "255");
    }
}

//! Guard expression language: tokenizer, parser and evaluator.
//!
//! Grammar:
//! ```text
//! Guard     ::= '' | 'true' | 'false' | Clause ( ('AND' | '&&') Clause )*
//! Clause    ::= Operand UnaryOp | Operand BinaryOp Operand
//! Operand   ::= '{{' Path '}}' | QuotedString | Number | 'true' | 'false' | 'null' | BareWord
//! UnaryOp   ::= 'exists' | 'not_exists' | 'empty' | 'not_empty'
//! BinaryOp  ::= 'equals' | 'not_equals' | 'contains' | 'greater_than' | 'less_than'
//!             | 'greater_or_equal' | 'less_or_equal'
//!             | '==' | '=' | '!=' | '>' | '<' | '>=' | '<='
//! ```
//!
//! A bare word on the left of an operator names a scope path; on the right it
//! is a string literal. There is no OR and no grouping.

use std::fmt;

use serde_json::Value;

use parley_types::{stringify, FlowError, Scope};

// ---------------------------------------------------------------------------
// AST
// ---------------------------------------------------------------------------

/// A parsed guard.
#[derive(Debug, Clone, PartialEq)]
pub enum Guard {
    /// Constant guard: `true`, `false`, or an empty expression (true).
    Constant(bool),
    /// Clauses joined by AND, evaluated left to right.
    All(Vec<Clause>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Clause {
    pub left: Operand,
    pub operator: Operator,
    pub right: Option<Operand>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Path(String),
    Literal(Value),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Equals,
    NotEquals,
    /// The path is bound, even to `null`. Use `not_empty` to reject nulls.
    Exists,
    NotExists,
    Empty,
    NotEmpty,
    Contains,
    GreaterThan,
    LessThan,
    GreaterOrEqual,
    LessOrEqual,
}

impl Operator {
    fn from_word(word: &str) -> Option<Self> {
        let op = match word.to_ascii_lowercase().as_str() {
            "equals" | "==" | "=" => Operator::Equals,
            "not_equals" | "!=" => Operator::NotEquals,
            "exists" => Operator::Exists,
            "not_exists" => Operator::NotExists,
            "empty" => Operator::Empty,
            "not_empty" => Operator::NotEmpty,
            "contains" => Operator::Contains,
            "greater_than" | ">" => Operator::GreaterThan,
            "less_than" | "<" => Operator::LessThan,
            "greater_or_equal" | ">=" => Operator::GreaterOrEqual,
            "less_or_equal" | "<=" => Operator::LessOrEqual,
            _ => return None,
        };
        Some(op)
    }

    pub fn is_unary(self) -> bool {
        matches!(
            self,
            Operator::Exists | Operator::NotExists | Operator::Empty | Operator::NotEmpty
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operator::Equals => "equals",
            Operator::NotEquals => "not_equals",
            Operator::Exists => "exists",
            Operator::NotExists => "not_exists",
            Operator::Empty => "empty",
            Operator::NotEmpty => "not_empty",
            Operator::Contains => "contains",
            Operator::GreaterThan => "greater_than",
            Operator::LessThan => "less_than",
            Operator::GreaterOrEqual => "greater_or_equal",
            Operator::LessOrEqual => "less_or_equal",
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Tokenizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ref(String),
    Quoted(String),
    Word(String),
    Symbol(&'static str),
    And,
}

fn tokenize(input: &str) -> Result<Vec<Token>, FlowError> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        if c.is_whitespace() {
            i += 1;
            continue;
        }

        // {{ path }}
        if c == '{' && chars.get(i + 1) == Some(&'{') {
            let start = i + 2;
            let mut j = start;
            while j + 1 < chars.len() && !(chars[j] == '}' && chars[j + 1] == '}') {
                j += 1;
            }
            if j + 1 >= chars.len() {
                return Err(make_error(&format!("unclosed reference in '{input}'")));
            }
            let path: String = chars[start..j].iter().collect::<String>().trim().to_string();
            if path.is_empty() {
                return Err(make_error("empty reference '{{}}'"));
            }
            tokens.push(Token::Ref(path));
            i = j + 2;
            continue;
        }

        if c == '"' || c == '\'' {
            let quote = c;
            let mut value = String::new();
            let mut j = i + 1;
            let mut closed = false;
            while j < chars.len() {
                match chars[j] {
                    '\\' if j + 1 < chars.len() => {
                        value.push(chars[j + 1]);
                        j += 2;
                    }
                    ch if ch == quote => {
                        closed = true;
                        j += 1;
                        break;
                    }
                    ch => {
                        value.push(ch);
                        j += 1;
                    }
                }
            }
            if !closed {
                return Err(make_error(&format!("unterminated string in '{input}'")));
            }
            tokens.push(Token::Quoted(value));
            i = j;
            continue;
        }

        let two: String = chars[i..(i + 2).min(chars.len())].iter().collect();
        let symbol = match two.as_str() {
            "&&" => Some(("&&", 2)),
            "==" => Some(("==", 2)),
            "!=" => Some(("!=", 2)),
            ">=" => Some((">=", 2)),
            "<=" => Some(("<=", 2)),
            _ => match c {
                '=' => Some(("=", 1)),
                '>' => Some((">", 1)),
                '<' => Some(("<", 1)),
                _ => None,
            },
        };
        if let Some((sym, len)) = symbol {
            tokens.push(if sym == "&&" {
                Token::And
            } else {
                Token::Symbol(sym)
            });
            i += len;
            continue;
        }

        let start = i;
        while i < chars.len() && !is_word_break(chars[i], chars.get(i + 1).copied()) {
            i += 1;
        }
        if i == start {
            return Err(make_error(&format!("unexpected character '{c}' in '{input}'")));
        }
        let word: String = chars[start..i].iter().collect();
        if word.eq_ignore_ascii_case("and") {
            tokens.push(Token::And);
        } else {
            tokens.push(Token::Word(word));
        }
    }
    Ok(tokens)
}

fn is_word_break(c: char, next: Option<char>) -> bool {
    c.is_whitespace()
        || matches!(c, '=' | '>' | '<' | '"' | '\'')
        || (c == '!' && next == Some('='))
        || (c == '&' && next == Some('&'))
        || (c == '{' && next == Some('{'))
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

/// Parse a guard expression.
///
/// An empty or whitespace-only input is the constant `true`.
pub fn parse_guard(input: &str) -> Result<Guard, FlowError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Ok(Guard::Constant(true));
    }
    let tokens = tokenize(trimmed)?;
    if let [Token::Word(w)] = tokens.as_slice() {
        if w.eq_ignore_ascii_case("true") {
            return Ok(Guard::Constant(true));
        }
        if w.eq_ignore_ascii_case("false") {
            return Ok(Guard::Constant(false));
        }
    }

    let mut clauses = Vec::new();
    for part in tokens.split(|t| *t == Token::And) {
        clauses.push(parse_clause(part, trimmed)?);
    }
    Ok(Guard::All(clauses))
}

fn parse_clause(tokens: &[Token], input: &str) -> Result<Clause, FlowError> {
    let (left, rest) = match tokens.split_first() {
        Some(split) => split,
        None => return Err(make_error(&format!("empty clause in '{input}'"))),
    };
    let left = operand(left, true)?;

    let (op_token, rest) = match rest.split_first() {
        Some(split) => split,
        None => return Err(make_error(&format!("missing operator in '{input}'"))),
    };
    let operator = match op_token {
        Token::Word(w) => Operator::from_word(w),
        Token::Symbol(s) => Operator::from_word(s),
        _ => None,
    }
    .ok_or_else(|| make_error(&format!("unknown operator {op_token:?} in '{input}'")))?;

    if operator.is_unary() {
        if !rest.is_empty() {
            return Err(make_error(&format!(
                "operator '{operator}' takes no right operand in '{input}'"
            )));
        }
        return Ok(Clause {
            left,
            operator,
            right: None,
        });
    }

    match rest {
        [right] => Ok(Clause {
            left,
            operator,
            right: Some(operand(right, false)?),
        }),
        [] => Err(make_error(&format!(
            "operator '{operator}' needs a right operand in '{input}'"
        ))),
        _ => Err(make_error(&format!("unexpected tokens after clause in '{input}'"))),
    }
}

fn operand(token: &Token, left_side: bool) -> Result<Operand, FlowError> {
    match token {
        Token::Ref(path) => Ok(Operand::Path(path.clone())),
        Token::Quoted(s) => Ok(Operand::Literal(Value::String(s.clone()))),
        Token::Word(w) => {
            if let Some(literal) = keyword_literal(w) {
                return Ok(Operand::Literal(literal));
            }
            if let Some(n) = number_literal(w) {
                return Ok(Operand::Literal(n));
            }
            if left_side {
                Ok(Operand::Path(w.clone()))
            } else {
                Ok(Operand::Literal(Value::String(w.clone())))
            }
        }
        other => Err(make_error(&format!("expected operand, found {other:?}"))),
    }
}

fn keyword_literal(word: &str) -> Option<Value> {
    match word.to_ascii_lowercase().as_str() {
        "true" => Some(Value::Bool(true)),
        "false" => Some(Value::Bool(false)),
        "null" => Some(Value::Null),
        _ => None,
    }
}

fn number_literal(word: &str) -> Option<Value> {
    if let Ok(i) = word.parse::<i64>() {
        return Some(Value::from(i));
    }
    let f = word.parse::<f64>().ok()?;
    serde_json::Number::from_f64(f).map(Value::Number)
}

fn make_error(msg: &str) -> FlowError {
    FlowError::Configuration(format!("guard parse error: {msg}"))
}

// ---------------------------------------------------------------------------
// Evaluation
// ---------------------------------------------------------------------------

/// Evaluate a parsed guard against the current scope.
pub fn evaluate_guard(guard: &Guard, scope: &Scope) -> bool {
    match guard {
        Guard::Constant(b) => *b,
        Guard::All(clauses) => clauses.iter().all(|c| evaluate_clause(c, scope)),
    }
}

/// Parse and evaluate in one call.
pub fn evaluate(input: &str, scope: &Scope) -> Result<bool, FlowError> {
    Ok(evaluate_guard(&parse_guard(input)?, scope))
}

fn resolve<'a>(operand: &'a Operand, scope: &'a Scope) -> Option<&'a Value> {
    match operand {
        Operand::Path(path) => scope.lookup(path),
        Operand::Literal(v) => Some(v),
    }
}

fn evaluate_clause(clause: &Clause, scope: &Scope) -> bool {
    let left = resolve(&clause.left, scope);
    let right = clause.right.as_ref().and_then(|r| resolve(r, scope));

    match clause.operator {
        Operator::Exists => left.is_some(),
        Operator::NotExists => left.is_none(),
        Operator::Empty => is_empty(left),
        Operator::NotEmpty => !is_empty(left),
        Operator::Equals => match (left, right) {
            (Some(l), Some(r)) => loosely_equal(l, r),
            _ => false,
        },
        Operator::NotEquals => match (left, right) {
            (Some(l), Some(r)) => !loosely_equal(l, r),
            _ => true,
        },
        Operator::Contains => match (left, right) {
            (Some(l), Some(r)) => contains(l, r),
            _ => false,
        },
        Operator::GreaterThan => compare(left, right, |a, b| a > b),
        Operator::LessThan => compare(left, right, |a, b| a < b),
        Operator::GreaterOrEqual => compare(left, right, |a, b| a >= b),
        Operator::LessOrEqual => compare(left, right, |a, b| a <= b),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(Value::Array(a)) => a.is_empty(),
        Some(Value::Object(o)) => o.is_empty(),
        Some(_) => false,
    }
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

fn loosely_equal(left: &Value, right: &Value) -> bool {
    if let (Some(a), Some(b)) = (as_number(left), as_number(right)) {
        return a == b;
    }
    stringify(left) == stringify(right)
}

fn contains(haystack: &Value, needle: &Value) -> bool {
    match haystack {
        Value::Array(items) => items.iter().any(|item| loosely_equal(item, needle)),
        Value::Object(map) => map.contains_key(&stringify(needle)),
        other => stringify(other)
            .to_lowercase()
            .contains(&stringify(needle).to_lowercase()),
    }
}

fn compare(left: Option<&Value>, right: Option<&Value>, cmp: fn(f64, f64) -> bool) -> bool {
    match (left.and_then(as_number), right.and_then(as_number)) {
        (Some(a), Some(b)) => cmp(a, b),
        _ => false,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

//! Tesira Text Protocol value grammar.
//!
//! Every payload on the wire -- command arguments, reply bodies and
//! subscription feedback -- is one of three shapes:
//!
//! ```text
//! Scalar:   true  false  null  -6  -6.5  LEVEL_DB  "quoted string"
//! List:     [v1 v2 ...]
//! Record:   {"key1":v1 "key2":v2 ...}
//! ```
//!
//! [`Value::parse`] is a single-cursor recursive-descent parser: the first
//! significant character selects the variant and nested containers recurse
//! through the same entry point. [`Value::serialize`] is its inverse, so
//! `Value::parse(&v.serialize())` is structurally equal to `v`.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};

use avlib_core::error::{Error, Result};

/// Characters that force a string to be quoted on the wire.
const RESERVED: &[char] = &['[', ']', '{', '}', '"', '\\', ':'];

/// Characters that end a bare token.
const TOKEN_TERMINATORS: &[char] = &['[', ']', '{', '}', '"'];

/// Deepest container nesting the parser accepts.
pub const MAX_DEPTH: usize = 64;

/// A leaf value.
#[derive(Debug, Clone)]
pub enum Scalar {
    Null,
    Bool(bool),
    Integer(i64),
    Float(f64),
    String(String),
}

/// A protocol value.
///
/// Equality is structural: records compare by key set and values regardless
/// of insertion order, lists compare element-wise in order, and numeric
/// scalars compare by numeric value (`Integer(-6) == Float(-6.0)`), because
/// an integral float is written without a fractional part and reads back as
/// an integer.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Scalar(Scalar),
    List(Vec<Value>),
    Record(BTreeMap<String, Value>),
}

impl PartialEq for Scalar {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Scalar::Null, Scalar::Null) => true,
            (Scalar::Bool(a), Scalar::Bool(b)) => a == b,
            (Scalar::Integer(a), Scalar::Integer(b)) => a == b,
            (Scalar::Float(a), Scalar::Float(b)) => a == b,
            (Scalar::Integer(a), Scalar::Float(b)) | (Scalar::Float(b), Scalar::Integer(a)) => {
                *a as f64 == *b
            }
            (Scalar::String(a), Scalar::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Scalar {
    /// Protocol name of this scalar kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Scalar::Null => "null",
            Scalar::Bool(_) => "boolean",
            Scalar::Integer(_) => "integer",
            Scalar::Float(_) => "float",
            Scalar::String(_) => "string",
        }
    }
}

impl fmt::Display for Scalar {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Scalar::Null => f.write_str("null"),
            Scalar::Bool(b) => write!(f, "{b}"),
            Scalar::Integer(i) => write!(f, "{i}"),
            // The grammar has no literal for NaN or infinities. Values built
            // with `Value::try_from(f64)` never hold one.
            Scalar::Float(x) if !x.is_finite() => f.write_str("null"),
            Scalar::Float(x) => write!(f, "{x}"),
            Scalar::String(s) => write_string(f, s),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Scalar(s) => fmt::Display::fmt(s, f),
            Value::List(items) => {
                f.write_char('[')?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    fmt::Display::fmt(item, f)?;
                }
                f.write_char(']')
            }
            Value::Record(entries) => {
                f.write_char('{')?;
                for (i, (key, value)) in entries.iter().enumerate() {
                    if i > 0 {
                        f.write_char(' ')?;
                    }
                    write_quoted(f, key)?;
                    f.write_char(':')?;
                    fmt::Display::fmt(value, f)?;
                }
                f.write_char('}')
            }
        }
    }
}

/// Whether `s` must be quoted to survive a serialize/parse round trip.
///
/// A string is quoted iff it is empty, contains whitespace or a reserved
/// character, or would otherwise read back as a boolean, `null` or a number.
pub fn needs_quotes(s: &str) -> bool {
    s.is_empty()
        || s.chars().any(|c| c.is_whitespace() || RESERVED.contains(&c))
        || matches!(s, "true" | "false" | "null")
        || s.starts_with(looks_numeric)
}

fn looks_numeric(c: char) -> bool {
    c.is_ascii_digit() || matches!(c, '+' | '-' | '.')
}

/// Write `s` bare if it can be, otherwise quoted.
pub(crate) fn write_string(out: &mut impl fmt::Write, s: &str) -> fmt::Result {
    if needs_quotes(s) {
        write_quoted(out, s)
    } else {
        out.write_str(s)
    }
}

fn write_quoted(out: &mut impl fmt::Write, s: &str) -> fmt::Result {
    out.write_char('"')?;
    for c in s.chars() {
        if c == '"' || c == '\\' {
            out.write_char('\\')?;
        }
        out.write_char(c)?;
    }
    out.write_char('"')
}

// ---------------------------------------------------------------------------
// Constructors and extraction
// ---------------------------------------------------------------------------

impl Value {
    /// The `null` scalar.
    pub fn null() -> Self {
        Value::Scalar(Scalar::Null)
    }

    /// A record from `(key, value)` pairs. Later duplicates replace earlier ones.
    pub fn record<K: Into<String>>(entries: impl IntoIterator<Item = (K, Value)>) -> Self {
        Value::Record(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// A list from its elements.
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Value::List(items.into_iter().collect())
    }

    /// Protocol name of this value's kind, used in error messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Value::Scalar(s) => s.kind(),
            Value::List(_) => "list",
            Value::Record(_) => "record",
        }
    }

    fn mismatch(&self, expected: &'static str) -> Error {
        Error::TypeMismatch {
            expected,
            found: self.kind(),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Scalar(Scalar::Null))
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Value::Scalar(Scalar::Bool(b)) => Ok(*b),
            other => Err(other.mismatch("boolean")),
        }
    }

    /// Integer value. Integral floats are accepted.
    pub fn as_i64(&self) -> Result<i64> {
        match self {
            Value::Scalar(Scalar::Integer(i)) => Ok(*i),
            Value::Scalar(Scalar::Float(x))
                if x.fract() == 0.0 && *x >= i64::MIN as f64 && *x <= i64::MAX as f64 =>
            {
                Ok(*x as i64)
            }
            other => Err(other.mismatch("integer")),
        }
    }

    /// Numeric value of an integer or float scalar.
    pub fn as_f64(&self) -> Result<f64> {
        match self {
            Value::Scalar(Scalar::Integer(i)) => Ok(*i as f64),
            Value::Scalar(Scalar::Float(x)) => Ok(*x),
            other => Err(other.mismatch("number")),
        }
    }

    pub fn as_str(&self) -> Result<&str> {
        match self {
            Value::Scalar(Scalar::String(s)) => Ok(s),
            other => Err(other.mismatch("string")),
        }
    }

    pub fn as_list(&self) -> Result<&[Value]> {
        match self {
            Value::List(items) => Ok(items),
            other => Err(other.mismatch("list")),
        }
    }

    pub fn as_record(&self) -> Result<&BTreeMap<String, Value>> {
        match self {
            Value::Record(entries) => Ok(entries),
            other => Err(other.mismatch("record")),
        }
    }

    /// Look up `key` in a record.
    ///
    /// Fails with [`Error::TypeMismatch`] if this is not a record and with
    /// [`Error::Protocol`] if the key is absent.
    pub fn get(&self, key: &str) -> Result<&Value> {
        self.as_record()?
            .get(key)
            .ok_or_else(|| Error::Protocol(format!("missing key `{key}` in record")))
    }

    /// Render this value in wire form.
    pub fn serialize(&self) -> String {
        self.to_string()
    }

    /// Parse one complete value. Surrounding whitespace is ignored.
    pub fn parse(text: &str) -> Result<Value> {
        let mut parser = Parser::new(text);
        parser.skip_ws();
        let value = parser.parse_value()?;
        parser.skip_ws();
        if parser.pos < text.len() {
            return Err(parser.error("unexpected trailing characters"));
        }
        Ok(value)
    }

    /// Parse the inside of a record without its braces.
    ///
    /// Reply and feedback lines carry their payload as bare
    /// `"key":value` pairs, e.g. `"publishToken":"x" "value":-6`.
    pub fn parse_record_body(text: &str) -> Result<Value> {
        let mut parser = Parser::new(text);
        let entries = parser.parse_entries(None)?;
        Ok(Value::Record(entries))
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Scalar(Scalar::Bool(b))
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Value::Scalar(Scalar::Integer(i))
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Value::Scalar(Scalar::Integer(i.into()))
    }
}

impl From<u32> for Value {
    fn from(i: u32) -> Self {
        Value::Scalar(Scalar::Integer(i.into()))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Scalar(Scalar::Float(x))
    }
}

impl Value {
    /// A float scalar, rejecting NaN and infinities, which have no wire form.
    pub fn try_from_f64(x: f64) -> Result<Self> {
        if x.is_finite() {
            Ok(Value::Scalar(Scalar::Float(x)))
        } else {
            Err(Error::InvalidParameter(format!(
                "{x} cannot be sent to the device"
            )))
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Scalar(Scalar::String(s.to_string()))
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::Scalar(Scalar::String(s))
    }
}

impl From<Scalar> for Value {
    fn from(s: Scalar) -> Self {
        Value::Scalar(s)
    }
}

impl std::str::FromStr for Value {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Value::parse(s)
    }
}

// ---------------------------------------------------------------------------
// Parser
// ---------------------------------------------------------------------------

struct Parser<'a> {
    src: &'a str,
    pos: usize,
    depth: usize,
}

impl<'a> Parser<'a> {
    fn new(src: &'a str) -> Self {
        Self {
            src,
            pos: 0,
            depth: 0,
        }
    }

    fn enter(&mut self) -> Result<()> {
        if self.depth >= MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.depth += 1;
        Ok(())
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.bump();
        }
    }

    fn error(&self, reason: impl Into<String>) -> Error {
        self.error_at(self.pos, reason)
    }

    fn error_at(&self, position: usize, reason: impl Into<String>) -> Error {
        Error::MalformedValue {
            position,
            reason: reason.into(),
        }
    }

    fn parse_value(&mut self) -> Result<Value> {
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('{') => {
                self.enter()?;
                let open = self.pos;
                self.bump();
                let entries = self.parse_entries(Some(open))?;
                self.depth -= 1;
                Ok(Value::Record(entries))
            }
            Some('[') => {
                self.enter()?;
                let list = self.parse_list()?;
                self.depth -= 1;
                Ok(list)
            }
            Some('"') => Ok(Value::Scalar(Scalar::String(self.parse_quoted()?))),
            Some(c @ (']' | '}' | ':')) => Err(self.error(format!("unexpected `{c}`"))),
            Some(_) => self.parse_bare(),
        }
    }

    fn parse_list(&mut self) -> Result<Value> {
        let open = self.pos;
        self.bump();
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    return Err(self.error(format!("unterminated list opened at byte {open}")));
                }
                Some(']') => {
                    self.bump();
                    return Ok(Value::List(items));
                }
                Some(_) => items.push(self.parse_value()?),
            }
        }
    }

    /// Parse `"key":value` pairs up to the closing brace, or to the end of
    /// input when `open` is `None` (a brace-less record body).
    fn parse_entries(&mut self, open: Option<usize>) -> Result<BTreeMap<String, Value>> {
        let mut entries = BTreeMap::new();
        loop {
            self.skip_ws();
            match (self.peek(), open) {
                (None, None) => return Ok(entries),
                (None, Some(open)) => {
                    return Err(self.error(format!("unterminated record opened at byte {open}")));
                }
                (Some('}'), Some(_)) => {
                    self.bump();
                    return Ok(entries);
                }
                (Some('"'), _) => {
                    let key_pos = self.pos;
                    let key = self.parse_quoted()?;
                    self.skip_ws();
                    if self.peek() != Some(':') {
                        return Err(self.error(format!("expected `:` after key `{key}`")));
                    }
                    self.bump();
                    self.skip_ws();
                    let value = self.parse_value()?;
                    if entries.insert(key, value).is_some() {
                        return Err(self.error_at(key_pos, "duplicate record key"));
                    }
                }
                (Some(c), _) => {
                    return Err(self.error(format!("expected quoted record key, found `{c}`")));
                }
            }
        }
    }

    fn parse_quoted(&mut self) -> Result<String> {
        let open = self.pos;
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => {
                    return Err(self.error_at(open, "unterminated string"));
                }
                Some('"') => return Ok(out),
                Some('\\') => match self.bump() {
                    Some(c) => out.push(c),
                    None => return Err(self.error_at(open, "unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn parse_bare(&mut self) -> Result<Value> {
        let start = self.pos;
        while self
            .peek()
            .is_some_and(|c| !c.is_whitespace() && !TOKEN_TERMINATORS.contains(&c))
        {
            self.bump();
        }
        classify_token(&self.src[start..self.pos], start)
    }
}

/// Classify a bare token: boolean, null, integer, float, then raw string.
fn classify_token(token: &str, position: usize) -> Result<Value> {
    let scalar = match token {
        "true" => Scalar::Bool(true),
        "false" => Scalar::Bool(false),
        "null" => Scalar::Null,
        _ if token.starts_with(looks_numeric) => {
            if let Ok(i) = token.parse::<i64>() {
                Scalar::Integer(i)
            } else if is_float_literal(token) {
                match token.parse::<f64>() {
                    Ok(x) => Scalar::Float(x),
                    Err(_) => return Err(ambiguous(token, position)),
                }
            } else {
                return Err(ambiguous(token, position));
            }
        }
        _ => Scalar::String(token.to_string()),
    };
    Ok(Value::Scalar(scalar))
}

fn is_float_literal(token: &str) -> bool {
    token.chars().any(|c| c.is_ascii_digit())
        && token
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | '-' | '.' | 'e' | 'E'))
}

fn ambiguous(token: &str, position: usize) -> Error {
    Error::MalformedValue {
        position,
        reason: format!("token `{token}` is neither a number nor a boolean"),
    }
}

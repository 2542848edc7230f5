//! Group-key derivation.
//!
//! Every ingested record is assigned a group key, the string that
//! distinguishes one statistical bucket from another within a scope. Keys
//! come from one of two mutually exclusive modes: an ordered field list
//! joined with a delimiter, or a `${...}` template evaluated against a closed
//! variable set. Either way the raw key then passes through the ordered
//! rewrite patterns.
//!
//! The template language is deliberately tiny. Placeholders may reference any
//! record field by name plus the reserved variables `tag`, `tags` (the tag
//! split on `.`), `time` and `hostname`, and may apply `.split('sep')`,
//! integer indexing `[i]` (negative counts from the end) and character
//! slicing `[a..b]`. Templates are parsed once at configuration time; only
//! evaluation, which depends on record contents, can fail afterwards. A
//! record whose key cannot be computed is dropped from aggregation and the
//! condition logged, never raised to the caller.

use chrono::{DateTime, Utc};
use regex::Regex;

use crate::engine::Record;

/// Upper bound on configured rewrite patterns.
pub const PATTERN_MAX_NUM: usize = 20;

/// Errors raised while compiling group-key configuration. Fatal at startup.
#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    /// A `${` placeholder was never closed.
    #[error("unterminated ${{...}} placeholder in template")]
    UnterminatedPlaceholder,
    /// An expression did not match the template grammar.
    #[error("expected {what} at byte {at} of expression {expr:?}")]
    Expression {
        /// What the parser was looking for.
        what: &'static str,
        /// Byte offset of the failure.
        at: usize,
        /// The offending expression.
        expr: String,
    },
    /// A rewrite pattern entry did not contain two parts.
    #[error("rewrite pattern {entry:?} does not contain replacement and regex")]
    MissingRegex {
        /// The offending entry.
        entry: String,
    },
    /// More rewrite patterns than the engine supports.
    #[error("{count} rewrite patterns configured, maximum is {PATTERN_MAX_NUM}")]
    TooManyPatterns {
        /// Configured count.
        count: usize,
    },
    /// A rewrite regular expression failed to compile.
    #[error("invalid rewrite regex: {0}")]
    Regex(#[from] regex::Error),
}

/// Errors raised while evaluating a template against one record. Recoverable:
/// the record is dropped, the batch continues.
#[derive(thiserror::Error, Debug)]
pub enum EvalError {
    /// The record has no such field.
    #[error("record has no field {field:?}")]
    MissingField {
        /// Referenced field name.
        field: String,
    },
    /// An index fell outside its subject.
    #[error("index {index} out of range for length {len}")]
    IndexOutOfRange {
        /// Requested index.
        index: i64,
        /// Subject length.
        len: usize,
    },
    /// A slice started past the end of its subject.
    #[error("slice start {start} out of range for length {len}")]
    SliceOutOfRange {
        /// Requested start.
        start: usize,
        /// Subject length.
        len: usize,
    },
    /// An operation was applied to the wrong kind of value.
    #[error("cannot {op} a {kind}")]
    TypeMismatch {
        /// The operation attempted.
        op: &'static str,
        /// The value kind it was applied to.
        kind: &'static str,
    },
    /// The record timestamp does not map to a calendar time.
    #[error("timestamp {value} is not a valid calendar time")]
    Timestamp {
        /// The offending timestamp.
        value: u64,
    },
}

#[derive(Debug)]
enum Mode {
    /// Ordered field names joined with the delimiter; missing fields become
    /// the literal `undef`.
    Fields(Vec<String>),
    /// Compiled `${...}` template.
    Template(Template),
    /// No grouping configured: every record keys to the empty string.
    Unkeyed,
}

#[derive(Debug)]
struct Rewrite {
    replacement: String,
    regex: Regex,
}

impl Rewrite {
    /// Parse one `"REPLACEMENT REGEX"` entry. The first run of spaces
    /// separates the two parts.
    fn parse(entry: &str) -> Result<Self, ParseError> {
        let (replacement, pattern) = entry.split_once(' ').ok_or_else(|| {
            ParseError::MissingRegex {
                entry: entry.to_owned(),
            }
        })?;
        let pattern = pattern.trim_start_matches(' ');
        if replacement.is_empty() || pattern.is_empty() {
            return Err(ParseError::MissingRegex {
                entry: entry.to_owned(),
            });
        }
        Ok(Self {
            replacement: replacement.to_owned(),
            regex: Regex::new(pattern)?,
        })
    }
}

/// Derives a group key from `(tag, timestamp, record)`.
#[derive(Debug)]
pub struct GroupKeyResolver {
    mode: Mode,
    delimiter: String,
    hostname: String,
    rewrites: Vec<Rewrite>,
}

impl GroupKeyResolver {
    /// Compile a resolver from configuration values.
    ///
    /// `group_by_keys` and `group_by_expression` are mutually exclusive;
    /// enforcing that is the caller's job. Passing both here prefers the
    /// expression.
    ///
    /// # Errors
    ///
    /// Returns an error if the template or any rewrite pattern fails to
    /// parse, or if more than [`PATTERN_MAX_NUM`] patterns are configured.
    pub fn new(
        group_by_keys: Option<Vec<String>>,
        group_by_expression: Option<&str>,
        delimiter: &str,
        patterns: &[String],
        hostname: String,
    ) -> Result<Self, ParseError> {
        let mode = if let Some(template) = group_by_expression {
            Mode::Template(Template::parse(template)?)
        } else if let Some(fields) = group_by_keys {
            Mode::Fields(fields)
        } else {
            Mode::Unkeyed
        };

        if patterns.len() > PATTERN_MAX_NUM {
            return Err(ParseError::TooManyPatterns {
                count: patterns.len(),
            });
        }
        let rewrites = patterns
            .iter()
            .map(|entry| Rewrite::parse(entry))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            mode,
            delimiter: delimiter.to_owned(),
            hostname,
            rewrites,
        })
    }

    /// Derive the group key for one record.
    ///
    /// # Errors
    ///
    /// Returns an error if template evaluation fails for this record. The
    /// field-list and unkeyed modes never fail.
    pub fn resolve(&self, tag: &str, time: u64, record: &Record) -> Result<String, EvalError> {
        let raw = match &self.mode {
            Mode::Unkeyed => return Ok(String::new()),
            Mode::Fields(fields) => {
                let parts: Vec<String> = fields
                    .iter()
                    .map(|field| {
                        record
                            .get(field)
                            .map_or_else(|| String::from("undef"), value_to_string)
                    })
                    .collect();
                parts.join(&self.delimiter)
            }
            Mode::Template(template) => template.eval(&EvalContext {
                tag,
                time,
                record,
                hostname: &self.hostname,
            })?,
        };
        Ok(self.rewrite(raw))
    }

    /// Walk the patterns in order, apply the first whose regex matches
    /// anywhere in the key (all occurrences of that one pattern), then stop.
    /// Later patterns are not tried even if they would also match.
    fn rewrite(&self, key: String) -> String {
        for rewrite in &self.rewrites {
            if rewrite.regex.is_match(&key) {
                return rewrite
                    .regex
                    .replace_all(&key, rewrite.replacement.as_str())
                    .into_owned();
            }
        }
        key
    }
}

/// Render a record value the way it would appear interpolated into a string:
/// bare strings keep their content, everything else uses its JSON rendering.
fn value_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

struct EvalContext<'a> {
    tag: &'a str,
    time: u64,
    record: &'a Record,
    hostname: &'a str,
}

#[derive(Debug)]
struct Template {
    segments: Vec<Segment>,
}

#[derive(Debug)]
enum Segment {
    Literal(String),
    Placeholder(Expr),
}

impl Template {
    fn parse(src: &str) -> Result<Self, ParseError> {
        let mut segments = Vec::new();
        let mut rest = src;
        while let Some(start) = rest.find("${") {
            if start > 0 {
                segments.push(Segment::Literal(rest[..start].to_owned()));
            }
            let after = &rest[start + 2..];
            let end = after
                .find('}')
                .ok_or(ParseError::UnterminatedPlaceholder)?;
            segments.push(Segment::Placeholder(Expr::parse(&after[..end])?));
            rest = &after[end + 1..];
        }
        if !rest.is_empty() {
            segments.push(Segment::Literal(rest.to_owned()));
        }
        Ok(Self { segments })
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Result<String, EvalError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(lit) => out.push_str(lit),
                Segment::Placeholder(expr) => out.push_str(&expr.eval(ctx)?.render()),
            }
        }
        Ok(out)
    }
}

#[derive(Debug)]
struct Expr {
    root: Var,
    ops: Vec<Op>,
}

#[derive(Debug)]
enum Var {
    /// A record field looked up by name.
    Field(String),
    Tag,
    Tags,
    Time,
    Hostname,
}

#[derive(Debug)]
enum Op {
    Index(i64),
    Slice(usize, usize),
    Split(String),
}

/// Intermediate value during expression evaluation.
enum Value {
    Str(String),
    List(Vec<String>),
}

impl Value {
    fn render(self) -> String {
        match self {
            Value::Str(s) => s,
            Value::List(items) => items.join(","),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Value::Str(_) => "string",
            Value::List(_) => "list",
        }
    }
}

impl Expr {
    fn parse(src: &str) -> Result<Self, ParseError> {
        let mut parser = Parser { src, pos: 0 };
        let root = parser.ident().map(|name| match name {
            "tag" => Var::Tag,
            "tags" => Var::Tags,
            "time" => Var::Time,
            "hostname" => Var::Hostname,
            field => Var::Field(field.to_owned()),
        })?;
        let mut ops = Vec::new();
        while !parser.done() {
            ops.push(parser.postfix()?);
        }
        Ok(Self { root, ops })
    }

    fn eval(&self, ctx: &EvalContext<'_>) -> Result<Value, EvalError> {
        let mut value = match &self.root {
            Var::Field(field) => {
                let raw = ctx
                    .record
                    .get(field)
                    .ok_or_else(|| EvalError::MissingField {
                        field: field.clone(),
                    })?;
                Value::Str(value_to_string(raw))
            }
            Var::Tag => Value::Str(ctx.tag.to_owned()),
            Var::Tags => Value::List(ctx.tag.split('.').map(str::to_owned).collect()),
            Var::Time => Value::Str(calendar_time(ctx.time)?),
            Var::Hostname => Value::Str(ctx.hostname.to_owned()),
        };
        for op in &self.ops {
            value = apply(op, value)?;
        }
        Ok(value)
    }
}

fn calendar_time(time: u64) -> Result<String, EvalError> {
    let secs = i64::try_from(time).map_err(|_| EvalError::Timestamp { value: time })?;
    let datetime: DateTime<Utc> =
        DateTime::from_timestamp(secs, 0).ok_or(EvalError::Timestamp { value: time })?;
    Ok(datetime.format("%Y-%m-%d %H:%M:%S %z").to_string())
}

fn apply(op: &Op, value: Value) -> Result<Value, EvalError> {
    match op {
        Op::Index(index) => match value {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                let at = absolute_index(*index, chars.len())?;
                Ok(Value::Str(chars[at].to_string()))
            }
            Value::List(items) => {
                let at = absolute_index(*index, items.len())?;
                Ok(Value::Str(items[at].clone()))
            }
        },
        Op::Slice(start, end) => match value {
            Value::Str(s) => {
                let chars: Vec<char> = s.chars().collect();
                if *start > chars.len() {
                    return Err(EvalError::SliceOutOfRange {
                        start: *start,
                        len: chars.len(),
                    });
                }
                let end = (*end).min(chars.len());
                Ok(Value::Str(chars[*start..end.max(*start)].iter().collect()))
            }
            other => Err(EvalError::TypeMismatch {
                op: "slice",
                kind: other.kind(),
            }),
        },
        Op::Split(sep) => match value {
            Value::Str(s) => Ok(Value::List(s.split(sep.as_str()).map(str::to_owned).collect())),
            other => Err(EvalError::TypeMismatch {
                op: "split",
                kind: other.kind(),
            }),
        },
    }
}

fn absolute_index(index: i64, len: usize) -> Result<usize, EvalError> {
    let signed_len = i64::try_from(len).unwrap_or(i64::MAX);
    let absolute = if index < 0 { signed_len + index } else { index };
    usize::try_from(absolute)
        .ok()
        .filter(|at| *at < len)
        .ok_or(EvalError::IndexOutOfRange { index, len })
}

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn done(&self) -> bool {
        self.pos >= self.src.len()
    }

    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn expect(&mut self, want: char, what: &'static str) -> Result<(), ParseError> {
        if self.peek() == Some(want) {
            self.bump();
            Ok(())
        } else {
            Err(self.fail(what))
        }
    }

    fn fail(&self, what: &'static str) -> ParseError {
        ParseError::Expression {
            what,
            at: self.pos,
            expr: self.src.to_owned(),
        }
    }

    fn ident(&mut self) -> Result<&'a str, ParseError> {
        let start = self.pos;
        match self.peek() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {
                self.bump();
            }
            _ => return Err(self.fail("identifier")),
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == '_' {
                self.bump();
            } else {
                break;
            }
        }
        Ok(&self.src[start..self.pos])
    }

    fn integer(&mut self) -> Result<i64, ParseError> {
        let start = self.pos;
        if self.peek() == Some('-') {
            self.bump();
        }
        while let Some(c) = self.peek() {
            if c.is_ascii_digit() {
                self.bump();
            } else {
                break;
            }
        }
        self.src[start..self.pos]
            .parse()
            .map_err(|_| self.fail("integer"))
    }

    fn quoted(&mut self) -> Result<String, ParseError> {
        self.expect('\'', "opening quote")?;
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '\'' {
                let content = self.src[start..self.pos].to_owned();
                self.bump();
                return Ok(content);
            }
            self.bump();
        }
        Err(self.fail("closing quote"))
    }

    fn postfix(&mut self) -> Result<Op, ParseError> {
        match self.peek() {
            Some('[') => {
                self.bump();
                let first = self.integer()?;
                if self.src[self.pos..].starts_with("..") {
                    self.pos += 2;
                    let second = self.integer()?;
                    self.expect(']', "closing bracket")?;
                    let start = usize::try_from(first).map_err(|_| self.fail("slice bound"))?;
                    let end = usize::try_from(second).map_err(|_| self.fail("slice bound"))?;
                    Ok(Op::Slice(start, end))
                } else {
                    self.expect(']', "closing bracket")?;
                    Ok(Op::Index(first))
                }
            }
            Some('.') => {
                self.bump();
                let method = self.ident()?;
                if method != "split" {
                    return Err(self.fail("split"));
                }
                self.expect('(', "opening paren")?;
                let sep = self.quoted()?;
                self.expect(')', "closing paren")?;
                Ok(Op::Split(sep))
            }
            _ => Err(self.fail("postfix operation")),
        }
    }
}

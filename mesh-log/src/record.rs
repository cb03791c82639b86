//! Log records and their attribute tree

use crate::Level;
use crate::traced::TracedError;
use chrono::{DateTime, Utc};
use mesh_telemetry::report::StackFrame;
use serde_json::{Map, Value};
use std::error::Error;

/// Deepest error source chain kept for a captured error.
pub const MAX_ERROR_DEPTH: usize = 10;

/// One link of an error's source chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorCause {
    pub type_name: String,
    pub message: String,
}

/// An error captured as an attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorAttr {
    /// The logged error itself
    pub error: ErrorCause,
    /// Its sources, outermost first, at most `MAX_ERROR_DEPTH - 1` of them
    pub sources: Vec<ErrorCause>,
    /// Creation stack, caller first, when the error was a [`TracedError`]
    pub frames: Vec<StackFrame>,
}

impl ErrorAttr {
    /// Capture `err` and its source chain.
    pub fn capture(err: &(dyn Error + 'static)) -> Self {
        let (error, frames) = match err.downcast_ref::<TracedError>() {
            Some(traced) => (
                ErrorCause {
                    type_name: traced.type_name().to_string(),
                    message: traced.to_string(),
                },
                traced.frames().to_vec(),
            ),
            None => (cause_of(err), Vec::new()),
        };

        let mut sources = Vec::new();
        let mut next = err.source();
        while let Some(source) = next {
            if sources.len() + 1 >= MAX_ERROR_DEPTH {
                break;
            }
            sources.push(cause_of(source));
            next = source.source();
        }

        Self {
            error,
            sources,
            frames,
        }
    }
}

fn cause_of(err: &(dyn Error + 'static)) -> ErrorCause {
    ErrorCause {
        type_name: type_name_of(err),
        message: err.to_string(),
    }
}

/// Best-effort type name of a type-erased error, read from the leading
/// identifier of its `Debug` output.
fn type_name_of(err: &(dyn Error + 'static)) -> String {
    if let Some(traced) = err.downcast_ref::<TracedError>() {
        return traced.type_name().to_string();
    }

    let debug = format!("{err:?}");
    let ident: String = debug
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
        .collect();

    match ident.chars().next() {
        Some(c) if c.is_uppercase() => ident,
        _ => "Error".to_string(),
    }
}

/// Attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    I64(i64),
    U64(u64),
    F64(f64),
    Bool(bool),
    Error(Box<ErrorAttr>),
    Group(Vec<Attr>),
}

impl AttrValue {
    /// JSON rendering. Errors render as their message.
    pub fn to_json(&self) -> Value {
        match self {
            AttrValue::Str(s) => Value::String(s.clone()),
            AttrValue::I64(n) => Value::from(*n),
            AttrValue::U64(n) => Value::from(*n),
            AttrValue::F64(n) => Value::from(*n),
            AttrValue::Bool(b) => Value::Bool(*b),
            AttrValue::Error(e) => Value::String(e.error.message.clone()),
            AttrValue::Group(attrs) => Value::Object(attrs_to_json(attrs)),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}

impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::I64(v)
    }
}

impl From<i32> for AttrValue {
    fn from(v: i32) -> Self {
        AttrValue::I64(v.into())
    }
}

impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::U64(v)
    }
}

impl From<u32> for AttrValue {
    fn from(v: u32) -> Self {
        AttrValue::U64(v.into())
    }
}

impl From<f64> for AttrValue {
    fn from(v: f64) -> Self {
        AttrValue::F64(v)
    }
}

impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// Key/value attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct Attr {
    pub key: String,
    pub value: AttrValue,
}

impl Attr {
    pub fn new(key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    /// Named group of attributes
    pub fn group(key: impl Into<String>, attrs: Vec<Attr>) -> Self {
        Self {
            key: key.into(),
            value: AttrValue::Group(attrs),
        }
    }

    /// Captured error
    pub fn error(key: impl Into<String>, err: &(dyn Error + 'static)) -> Self {
        Self {
            key: key.into(),
            value: AttrValue::Error(Box::new(ErrorAttr::capture(err))),
        }
    }

    /// The last error found in this attribute, searching groups depth first.
    pub fn find_error(&self) -> Option<&ErrorAttr> {
        match &self.value {
            AttrValue::Error(e) => Some(e),
            AttrValue::Group(attrs) => attrs.iter().filter_map(Attr::find_error).last(),
            _ => None,
        }
    }
}

/// Render attributes as a JSON object; groups become nested objects and
/// groups sharing a key are merged.
pub fn attrs_to_json(attrs: &[Attr]) -> Map<String, Value> {
    let mut map = Map::new();
    for attr in attrs {
        merge_value(&mut map, attr.key.clone(), attr.value.to_json());
    }
    map
}

pub(crate) fn merge_value(map: &mut Map<String, Value>, key: String, value: Value) {
    match (map.get_mut(&key), value) {
        (Some(Value::Object(existing)), Value::Object(incoming)) => {
            for (k, v) in incoming {
                merge_value(existing, k, v);
            }
        }
        (_, value) => {
            map.insert(key, value);
        }
    }
}

/// Wrap `attrs` in the nested groups named by `groups`, outermost first.
pub fn nest_in_groups(groups: &[String], attrs: Vec<Attr>) -> Vec<Attr> {
    groups
        .iter()
        .rev()
        .fold(attrs, |inner, group| vec![Attr::group(group.clone(), inner)])
}

/// A single log record.
#[derive(Debug, Clone)]
pub struct LogRecord {
    pub level: Level,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    /// Emitting module, empty when unknown
    pub target: String,
    pub attrs: Vec<Attr>,
}

impl LogRecord {
    pub fn new(level: Level, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
            timestamp: Utc::now(),
            target: String::new(),
            attrs: Vec::new(),
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_attr(mut self, attr: Attr) -> Self {
        self.attrs.push(attr);
        self
    }

    pub fn add_attr(&mut self, key: impl Into<String>, value: impl Into<AttrValue>) {
        self.attrs.push(Attr::new(key, value));
    }
}

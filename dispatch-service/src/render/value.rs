//! Context values and scope lookup.
//!
//! A render context is a mapping of names to [`Value`]s. Values arrive as JSON
//! from the send request and are converted once, so the renderer matches on an
//! explicit tagged union instead of probing JSON shapes at every lookup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A render context: variable name to value.
pub type Context = BTreeMap<String, Value>;

/// A single context value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "serde_json::Value", into = "serde_json::Value")]
pub enum Value {
    Null,
    Bool(bool),
    Number(serde_json::Number),
    String(String),
    /// Already-rendered markup. Never HTML-escaped on substitution.
    Html(String),
    List(Vec<Value>),
    Map(Context),
}

impl Value {
    /// Truthiness used by sections: null, false, empty strings and empty lists are falsey.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::Bool(b) => *b,
            Value::Number(_) => true,
            Value::String(s) | Value::Html(s) => !s.is_empty(),
            Value::List(items) => !items.is_empty(),
            Value::Map(_) => true,
        }
    }

    /// Text used when the value is interpolated.
    pub fn to_text(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) | Value::Html(s) => s.clone(),
            // Lists and mappings interpolate as their JSON form
            Value::List(_) | Value::Map(_) => serde_json::Value::from(self.clone()).to_string(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Html(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_map(&self) -> Option<&Context> {
        match self {
            Value::Map(map) => Some(map),
            _ => None,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => Value::List(items.into_iter().map(Value::from).collect()),
            serde_json::Value::Object(map) => {
                Value::Map(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Value> for serde_json::Value {
    fn from(value: Value) -> Self {
        match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) | Value::Html(s) => serde_json::Value::String(s),
            Value::List(items) => {
                serde_json::Value::Array(items.into_iter().map(serde_json::Value::from).collect())
            }
            Value::Map(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, serde_json::Value::from(v)))
                    .collect(),
            ),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

/// A stack of lookup frames; the innermost frame is searched first.
#[derive(Debug, Clone, Default)]
pub struct Scope<'a> {
    frames: Vec<&'a Value>,
}

impl<'a> Scope<'a> {
    pub fn new(root: &'a Value) -> Self {
        Self { frames: vec![root] }
    }

    /// A new scope with `frame` pushed on top of this one.
    pub fn push(&self, frame: &'a Value) -> Self {
        let mut frames = self.frames.clone();
        frames.push(frame);
        Self { frames }
    }

    /// Resolve a (possibly dotted) name.
    ///
    /// `.` refers to the innermost frame. For `a.b.c` the first segment is
    /// searched through every frame, innermost first; the remaining segments
    /// descend from that match only.
    pub fn lookup(&self, name: &str) -> Option<&'a Value> {
        if name == "." {
            return self.frames.last().copied();
        }

        let mut segments = name.split('.');
        let head = segments.next()?;

        let mut current = self
            .frames
            .iter()
            .rev()
            .find_map(|frame| frame.as_map().and_then(|map| map.get(head)))?;

        for segment in segments {
            current = current.as_map()?.get(segment)?;
        }

        Some(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn value(json: serde_json::Value) -> Value {
        Value::from(json)
    }

    #[test]
    fn test_lookup_dotted() {
        let root = value(json!({"user": {"name": {"first": "Ann"}}}));
        let scope = Scope::new(&root);

        assert_eq!(scope.lookup("user.name.first"), Some(&Value::from("Ann")));
        assert_eq!(scope.lookup("user.name.last"), None);
        assert_eq!(scope.lookup("missing"), None);
    }

    #[test]
    fn test_lookup_prefers_inner_frame() {
        let root = value(json!({"name": "outer", "shared": "root"}));
        let item = value(json!({"name": "inner"}));
        let scope = Scope::new(&root);
        let inner = scope.push(&item);

        assert_eq!(inner.lookup("name"), Some(&Value::from("inner")));
        assert_eq!(inner.lookup("shared"), Some(&Value::from("root")));
        assert_eq!(inner.lookup("."), Some(&item));
    }

    #[test]
    fn test_truthiness() {
        assert!(!Value::Null.is_truthy());
        assert!(!Value::Bool(false).is_truthy());
        assert!(!Value::from("").is_truthy());
        assert!(!Value::List(vec![]).is_truthy());
        assert!(Value::from("x").is_truthy());
        assert!(value(json!(0)).is_truthy());
    }

    #[test]
    fn test_context_deserializes_from_json() {
        let ctx: Context =
            serde_json::from_value(json!({"a": "A", "n": 3, "items": [{"x": 1}]})).unwrap();

        assert_eq!(ctx["a"], Value::from("A"));
        assert_eq!(ctx["n"].to_text(), "3");
        assert!(matches!(&ctx["items"], Value::List(items) if items.len() == 1));
    }
}

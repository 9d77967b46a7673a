use std::any::Any;
use std::cmp::Ordering;
use std::fmt;
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;

use crate::error::{Result, WorkflowError};

/// Payload carried by opaque port values such as open datasets or file-backed
/// resources. `close` releases any external resources and defaults to a no-op.
pub trait OpaquePayload: Any + Send {
    fn type_name(&self) -> &str;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_any(&self) -> &dyn Any;
}

struct OpaqueInner {
    payload: Box<dyn OpaquePayload>,
    closed: bool,
}

/// Shared handle to an opaque domain value. Clones share the payload; closing
/// through any clone runs the payload's `close` exactly once.
#[derive(Clone)]
pub struct OpaqueHandle {
    inner: Arc<Mutex<OpaqueInner>>,
}

impl OpaqueHandle {
    pub fn new(payload: Box<dyn OpaquePayload>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(OpaqueInner {
                payload,
                closed: false,
            })),
        }
    }

    pub fn type_name(&self) -> String {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.payload.type_name().to_string()
    }

    pub fn is_closed(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.closed
    }

    /// Close the payload. Subsequent calls are no-ops.
    pub fn close(&self) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if inner.closed {
            return Ok(());
        }
        inner.closed = true;
        inner.payload.close()
    }

    /// Borrow the payload for inspection, typically to downcast it.
    pub fn with_payload<R>(&self, f: impl FnOnce(&dyn OpaquePayload) -> R) -> R {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        f(inner.payload.as_ref())
    }
}

impl fmt::Debug for OpaqueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpaqueHandle({})", self.type_name())
    }
}

impl PartialEq for OpaqueHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

/// Values that flow between node ports.
///
/// `Undefined` is the sentinel for "no value assigned" and is distinct from an
/// explicit `Null`; it never appears in serialized form.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Undefined,
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    List(Vec<Value>),
    Object(IndexMap<String, Value>),
    Opaque(OpaqueHandle),
}

impl Value {
    pub fn is_undefined(&self) -> bool {
        matches!(self, Value::Undefined)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Undefined or null, i.e. absent for validation purposes.
    pub fn is_missing(&self) -> bool {
        matches!(self, Value::Undefined | Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Float(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(v) => Some(v.as_str()),
            _ => None,
        }
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Value::Undefined => "undefined",
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "int",
            Value::Float(_) => "float",
            Value::Str(_) => "str",
            Value::List(_) => "list",
            Value::Object(_) => "object",
            Value::Opaque(_) => "opaque",
        }
    }

    pub fn from_json(json: &serde_json::Value) -> Value {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(v) => Value::Bool(*v),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    Value::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            serde_json::Value::String(s) => Value::Str(s.clone()),
            serde_json::Value::Array(items) => {
                Value::List(items.iter().map(Value::from_json).collect())
            }
            serde_json::Value::Object(entries) => Value::Object(
                entries
                    .iter()
                    .map(|(k, v)| (k.clone(), Value::from_json(v)))
                    .collect(),
            ),
        }
    }

    pub fn to_json(&self) -> Result<serde_json::Value> {
        match self {
            Value::Undefined => Err(WorkflowError::InvalidEncoding(
                "undefined value has no JSON representation".to_string(),
            )),
            Value::Null => Ok(serde_json::Value::Null),
            Value::Bool(v) => Ok(serde_json::Value::Bool(*v)),
            Value::Int(v) => Ok(serde_json::Value::from(*v)),
            Value::Float(v) => serde_json::Number::from_f64(*v)
                .map(serde_json::Value::Number)
                .ok_or_else(|| {
                    WorkflowError::InvalidEncoding(format!(
                        "float value {v} has no JSON representation"
                    ))
                }),
            Value::Str(v) => Ok(serde_json::Value::String(v.clone())),
            Value::List(items) => Ok(serde_json::Value::Array(
                items
                    .iter()
                    .map(Value::to_json)
                    .collect::<Result<Vec<_>>>()?,
            )),
            Value::Object(entries) => {
                let mut map = serde_json::Map::new();
                for (key, value) in entries {
                    map.insert(key.clone(), value.to_json()?);
                }
                Ok(serde_json::Value::Object(map))
            }
            Value::Opaque(handle) => Err(WorkflowError::InvalidEncoding(format!(
                "opaque value of type '{}' has no JSON representation",
                handle.type_name()
            ))),
        }
    }

    /// Render the value as command-line text: strings bare, everything else
    /// as its JSON text.
    pub fn to_text(&self) -> String {
        match self {
            Value::Undefined => String::new(),
            Value::Str(s) => s.clone(),
            Value::Opaque(handle) => format!("<{}>", handle.type_name()),
            other => other.to_json().map(|j| j.to_string()).unwrap_or_default(),
        }
    }

    /// Close the value if it holds a closable resource.
    pub fn close(&self) -> anyhow::Result<()> {
        match self {
            Value::Opaque(handle) => handle.close(),
            _ => Ok(()),
        }
    }

    /// Numeric or lexicographic ordering used for `value_range` checks.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Str(a), Value::Str(b)) => Some(a.cmp(b)),
            _ => {
                let a = self.as_f64()?;
                let b = other.as_f64()?;
                a.partial_cmp(&b)
            }
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Undefined, Value::Undefined) => true,
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Int(a), Value::Int(b)) => a == b,
            (Value::Float(a), Value::Float(b)) => a == b,
            (Value::Int(a), Value::Float(b)) | (Value::Float(b), Value::Int(a)) => *a as f64 == *b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::List(a), Value::List(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Opaque(a), Value::Opaque(b)) => a == b,
            _ => false,
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

/// Declared data type of a port, encoded in JSON as its qualified name text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Int,
    Float,
    Str,
    List,
    Object,
    Named(String),
}

impl DataType {
    pub fn parse(name: &str) -> DataType {
        match name {
            "bool" => DataType::Bool,
            "int" => DataType::Int,
            "float" => DataType::Float,
            "str" => DataType::Str,
            "list" => DataType::List,
            "object" => DataType::Object,
            other => DataType::Named(other.to_string()),
        }
    }

    pub fn qualified_name(&self) -> &str {
        match self {
            DataType::Bool => "bool",
            DataType::Int => "int",
            DataType::Float => "float",
            DataType::Str => "str",
            DataType::List => "list",
            DataType::Object => "object",
            DataType::Named(name) => name.as_str(),
        }
    }

    /// Whether `value` is acceptable for this declared type. An `Int` is
    /// acceptable where a `Float` is declared.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (DataType::Bool, Value::Bool(_)) => true,
            (DataType::Int, Value::Int(_)) => true,
            (DataType::Float, Value::Float(_) | Value::Int(_)) => true,
            (DataType::Str, Value::Str(_)) => true,
            (DataType::List, Value::List(_)) => true,
            (DataType::Object, Value::Object(_)) => true,
            (DataType::Named(name), Value::Opaque(handle)) => handle.type_name() == *name,
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.qualified_name())
    }
}

impl serde::Serialize for DataType {
    fn serialize<S: serde::Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(self.qualified_name())
    }
}

impl<'de> serde::Deserialize<'de> for DataType {
    fn deserialize<D: serde::Deserializer<'de>>(
        deserializer: D,
    ) -> std::result::Result<Self, D::Error> {
        let name = <String as serde::Deserialize>::deserialize(deserializer)?;
        Ok(DataType::parse(&name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};

    struct Dataset {
        closes: Arc<AtomicUsize>,
    }

    impl OpaquePayload for Dataset {
        fn type_name(&self) -> &str {
            "dataset"
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.closes.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }

        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    fn dataset_value() -> (Value, Arc<AtomicUsize>) {
        let closes = Arc::new(AtomicUsize::new(0));
        let value = Value::Opaque(OpaqueHandle::new(Box::new(Dataset {
            closes: closes.clone(),
        })));
        (value, closes)
    }

    #[test]
    fn test_json_round_trip() {
        let json = serde_json::json!({
            "flag": true,
            "count": 3,
            "ratio": 0.5,
            "name": "x",
            "items": [1, null, "two"],
        });

        let value = Value::from_json(&json);
        assert_eq!(value.to_json().expect("value should serialize"), json);
    }

    #[test]
    fn test_undefined_and_opaque_do_not_serialize() {
        assert!(Value::Undefined.to_json().is_err());
        let (value, _) = dataset_value();
        assert!(value.to_json().is_err());
    }

    #[test]
    fn test_numeric_cross_equality() {
        assert_eq!(Value::Int(1), Value::Float(1.0));
        assert_eq!(Value::Float(2.0), Value::Int(2));
        assert_ne!(Value::Int(1), Value::Float(1.5));
        assert_ne!(Value::Int(1), Value::Str("1".to_string()));
    }

    #[test]
    fn test_opaque_close_runs_once() {
        let (value, closes) = dataset_value();
        let clone = value.clone();

        value.close().expect("close should succeed");
        clone.close().expect("second close should be a no-op");

        assert_eq!(closes.load(AtomicOrdering::SeqCst), 1);
        match &clone {
            Value::Opaque(handle) => assert!(handle.is_closed()),
            _ => panic!("expected opaque value"),
        }
    }

    #[test]
    fn test_data_type_accepts() {
        assert!(DataType::Float.accepts(&Value::Int(1)));
        assert!(!DataType::Int.accepts(&Value::Float(1.0)));
        assert!(DataType::Str.accepts(&Value::Str("x".to_string())));

        let (value, _) = dataset_value();
        assert!(DataType::Named("dataset".to_string()).accepts(&value));
        assert!(!DataType::Named("grid".to_string()).accepts(&value));
    }

    #[test]
    fn test_data_type_qualified_name_round_trip() {
        for name in ["bool", "int", "float", "str", "list", "object", "geo.Polygon"] {
            assert_eq!(DataType::parse(name).qualified_name(), name);
        }
    }

    #[test]
    fn test_value_compare() {
        assert_eq!(
            Value::Int(1).compare(&Value::Float(2.0)),
            Some(Ordering::Less)
        );
        assert_eq!(
            Value::Str("a".to_string()).compare(&Value::Str("b".to_string())),
            Some(Ordering::Less)
        );
        assert_eq!(Value::Int(1).compare(&Value::Str("b".to_string())), None);
    }
}

//! Ordered, string-keyed attribute containers.
//!
//! Every scope (request, flash, view, flow, conversation) and every event
//! payload is an [`AttributeMap`]. Values are either plain data (a
//! [`serde_json::Value`]) or a live object reference that can never be
//! serialized.

use std::{any::Any, fmt, ops::Deref, sync::Arc};

use indexmap::IndexMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de::DeserializeOwned, ser::Error as _};
use serde_json::Value;
use tracing::warn;

use crate::{ConvoflowError, Result};

/// A live, non-serializable object placed in a scope.
#[derive(Clone)]
pub struct ObjectRef {
    value: Arc<dyn Any + Send + Sync>,
    type_name: &'static str,
}

impl ObjectRef {
    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self {
            value: Arc::new(value),
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Wraps an already shared object without copying it.
    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>) -> Self {
        Self {
            value,
            type_name: std::any::type_name::<T>(),
        }
    }

    /// Type name of the wrapped object, used in diagnostics.
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.value.clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for ObjectRef {
    fn fmt(
        &self,
        f: &mut fmt::Formatter<'_>,
    ) -> fmt::Result {
        write!(f, "Object({})", self.type_name)
    }
}

/// A single attribute value.
#[derive(Debug, Clone)]
pub enum AttributeValue {
    /// Serializable data.
    Data(Value),
    /// Live object reference; rejected when a persisted scope is snapshotted.
    Object(ObjectRef),
}

impl AttributeValue {
    pub fn object<T: Any + Send + Sync>(value: T) -> Self {
        AttributeValue::Object(ObjectRef::new(value))
    }

    pub fn as_value(&self) -> Option<&Value> {
        match self {
            AttributeValue::Data(v) => Some(v),
            AttributeValue::Object(_) => None,
        }
    }

    pub fn is_serializable(&self) -> bool {
        matches!(self, AttributeValue::Data(_))
    }
}

impl PartialEq for AttributeValue {
    fn eq(
        &self,
        other: &Self,
    ) -> bool {
        match (self, other) {
            (AttributeValue::Data(a), AttributeValue::Data(b)) => a == b,
            (AttributeValue::Object(a), AttributeValue::Object(b)) => Arc::ptr_eq(&a.value, &b.value),
            _ => false,
        }
    }
}

impl From<Value> for AttributeValue {
    fn from(value: Value) -> Self {
        AttributeValue::Data(value)
    }
}

impl Serialize for AttributeValue {
    fn serialize<S: Serializer>(
        &self,
        serializer: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match self {
            AttributeValue::Data(v) => v.serialize(serializer),
            AttributeValue::Object(o) => Err(S::Error::custom(format!("object of type '{}' is not serializable", o.type_name))),
        }
    }
}

impl<'de> Deserialize<'de> for AttributeValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        Value::deserialize(deserializer).map(AttributeValue::Data)
    }
}

/// Mutable, insertion-ordered attribute map.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AttributeMap {
    entries: IndexMap<String, AttributeValue>,
}

impl AttributeMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert of plain data. Blank keys are ignored.
    pub fn with(
        mut self,
        key: &str,
        value: impl Into<Value>,
    ) -> Self {
        if let Err(e) = self.put_value(key, AttributeValue::Data(value.into())) {
            warn!("attribute ignored: {}", e);
        }
        self
    }

    /// Builds a map from a JSON object.
    pub fn from_json(value: Value) -> Result<Self> {
        match value {
            Value::Object(obj) => {
                let mut map = Self::new();
                for (k, v) in obj {
                    map.put_value(&k, AttributeValue::Data(v))?;
                }
                Ok(map)
            }
            Value::Null => Ok(Self::new()),
            other => Err(ConvoflowError::Attribute(format!("expected a JSON object, found '{}'", other))),
        }
    }

    /// Converts the map into a JSON object; fails on live objects.
    pub fn to_json(&self) -> Result<Value> {
        serde_json::to_value(self).map_err(|e| ConvoflowError::Attribute(e.to_string()))
    }

    /// Read-only view of this map.
    pub fn as_view(&self) -> AttributeMapView<'_> {
        AttributeMapView {
            inner: self,
        }
    }

    /// Serializes `value` and stores it under `key`, returning the previous value.
    pub fn put<T: Serialize>(
        &mut self,
        key: &str,
        value: T,
    ) -> Result<Option<AttributeValue>> {
        let value = serde_json::to_value(value).map_err(|e| ConvoflowError::Attribute(format!("attribute '{}' could not be converted: {}", key, e)))?;
        self.put_value(key, AttributeValue::Data(value))
    }

    pub fn put_value(
        &mut self,
        key: &str,
        value: AttributeValue,
    ) -> Result<Option<AttributeValue>> {
        if key.trim().is_empty() {
            return Err(ConvoflowError::Attribute("attribute keys must not be blank".to_string()));
        }
        Ok(self.entries.insert(key.to_string(), value))
    }

    /// Stores a live object reference under `key`.
    pub fn put_object<T: Any + Send + Sync>(
        &mut self,
        key: &str,
        value: T,
    ) -> Result<Option<AttributeValue>> {
        self.put_value(key, AttributeValue::object(value))
    }

    pub fn remove(
        &mut self,
        key: &str,
    ) -> Option<AttributeValue> {
        self.entries.shift_remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Copies every entry of `other` into this map, overwriting existing keys.
    pub fn extend(
        &mut self,
        other: &AttributeMap,
    ) {
        for (k, v) in other.entries.iter() {
            self.entries.insert(k.clone(), v.clone());
        }
    }

    pub fn get(
        &self,
        key: &str,
    ) -> Option<&AttributeValue> {
        self.entries.get(key)
    }

    /// Returns the data value under `key`, `None` for missing keys and live objects.
    pub fn get_value(
        &self,
        key: &str,
    ) -> Option<&Value> {
        self.entries.get(key).and_then(AttributeValue::as_value)
    }

    pub fn contains_key(
        &self,
        key: &str,
    ) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &AttributeValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Deserializes the value under `key` into `T`.
    pub fn get_as<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<Option<T>> {
        match self.data(key)? {
            Some(v) => serde_json::from_value(v.clone())
                .map(Some)
                .map_err(|e| ConvoflowError::Attribute(format!("attribute '{}' could not be converted: {}", key, e))),
            None => Ok(None),
        }
    }

    pub fn get_required_as<T: DeserializeOwned>(
        &self,
        key: &str,
    ) -> Result<T> {
        self.get_as(key)?.ok_or_else(|| missing(key))
    }

    /// String accessor; numbers and booleans are rendered as text.
    pub fn get_string(
        &self,
        key: &str,
    ) -> Result<Option<String>> {
        Ok(match self.data(key)? {
            None | Some(Value::Null) => None,
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Number(n)) => Some(n.to_string()),
            Some(Value::Bool(b)) => Some(b.to_string()),
            Some(other) => return Err(conversion(key, other, "string")),
        })
    }

    pub fn get_required_string(
        &self,
        key: &str,
    ) -> Result<String> {
        self.get_string(key)?.ok_or_else(|| missing(key))
    }

    /// Boolean accessor; accepts `true`/`false` strings.
    pub fn get_bool(
        &self,
        key: &str,
    ) -> Result<Option<bool>> {
        Ok(match self.data(key)? {
            None | Some(Value::Null) => None,
            Some(Value::Bool(b)) => Some(*b),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("true") => Some(true),
            Some(Value::String(s)) if s.eq_ignore_ascii_case("false") => Some(false),
            Some(other) => return Err(conversion(key, other, "boolean")),
        })
    }

    /// Integer accessor; accepts numeric strings.
    pub fn get_i64(
        &self,
        key: &str,
    ) -> Result<Option<i64>> {
        Ok(match self.data(key)? {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) if n.is_i64() => n.as_i64(),
            Some(Value::String(s)) => Some(s.trim().parse::<i64>().map_err(|_| conversion(key, &Value::String(s.clone()), "integer"))?),
            Some(other) => return Err(conversion(key, other, "integer")),
        })
    }

    pub fn get_f64(
        &self,
        key: &str,
    ) -> Result<Option<f64>> {
        Ok(match self.data(key)? {
            None | Some(Value::Null) => None,
            Some(Value::Number(n)) => n.as_f64(),
            Some(Value::String(s)) => Some(s.trim().parse::<f64>().map_err(|_| conversion(key, &Value::String(s.clone()), "number"))?),
            Some(other) => return Err(conversion(key, other, "number")),
        })
    }

    /// Returns the live object under `key` if it has type `T`.
    pub fn get_object<T: Any + Send + Sync>(
        &self,
        key: &str,
    ) -> Option<Arc<T>> {
        match self.entries.get(key) {
            Some(AttributeValue::Object(o)) => o.downcast::<T>(),
            _ => None,
        }
    }

    /// First entry holding a live object, as `(key, type name)`.
    pub fn first_non_serializable(&self) -> Option<(&str, &'static str)> {
        self.entries.iter().find_map(|(k, v)| match v {
            AttributeValue::Object(o) => Some((k.as_str(), o.type_name())),
            AttributeValue::Data(_) => None,
        })
    }

    fn data(
        &self,
        key: &str,
    ) -> Result<Option<&Value>> {
        match self.entries.get(key) {
            None => Ok(None),
            Some(AttributeValue::Data(v)) => Ok(Some(v)),
            Some(AttributeValue::Object(o)) => Err(ConvoflowError::Attribute(format!("attribute '{}' holds a live object of type '{}', not data", key, o.type_name()))),
        }
    }
}

fn missing(key: &str) -> ConvoflowError {
    ConvoflowError::Attribute(format!("required attribute '{}' is not present", key))
}

fn conversion(
    key: &str,
    value: &Value,
    target: &str,
) -> ConvoflowError {
    ConvoflowError::Attribute(format!("attribute '{}' with value '{}' cannot be converted to {}", key, value, target))
}

/// Immutable view over an [`AttributeMap`].
#[derive(Debug, Clone, Copy)]
pub struct AttributeMapView<'a> {
    inner: &'a AttributeMap,
}

impl Deref for AttributeMapView<'_> {
    type Target = AttributeMap;

    fn deref(&self) -> &Self::Target {
        self.inner
    }
}

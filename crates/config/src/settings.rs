use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Untyped `key → value` settings attached to a
/// [`StorageDescriptor`](crate::StorageDescriptor).
///
/// Values are read through the typed helpers, which treat a missing key and
/// a value of the wrong type the same way: as absent.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings(BTreeMap<String, Value>);
impl Settings {
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// String value for `key`, if present and a string.
    pub fn string(&self, key: &str) -> Option<&str> {
        self.0.get(key).and_then(Value::as_str)
    }

    /// Integer value for `key`. Floats are accepted and truncated towards
    /// zero, since loosely-typed sources (JSON, env) don't distinguish them.
    pub fn integer(&self, key: &str) -> Option<i64> {
        match self.0.get(key)? {
            Value::Number(number) => number.as_i64().or_else(|| number.as_f64().map(|float| float as i64)),
            _ => None,
        }
    }

    /// First string found among `keys`, or `default`.
    pub fn string_or(&self, keys: &[&str], default: &str) -> String {
        keys.iter()
            .find_map(|key| self.string(key))
            .unwrap_or(default)
            .to_string()
    }

    /// First integer found among `keys`, or `default`.
    pub fn integer_or(&self, keys: &[&str], default: i64) -> i64 {
        keys.iter().find_map(|key| self.integer(key)).unwrap_or(default)
    }
}
impl FromIterator<(String, Value)> for Settings {
    fn from_iter<T: IntoIterator<Item = (String, Value)>>(iter: T) -> Self {
        Self(iter.into_iter().collect())
    }
}

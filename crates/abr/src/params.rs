//! Typed option dictionary used to configure the player components.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::time::{TimeFraction, TimeValue};

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub enum VariantValue {
    #[default]
    Empty,
    String(String),
    Double(f64),
    Int64(i64),
    Bool(bool),
    TimeValue(TimeValue),
    TimeFraction(TimeFraction),
    #[serde(skip)]
    Bytes(Bytes),
}

impl VariantValue {
    pub fn is_empty(&self) -> bool {
        matches!(self, VariantValue::Empty)
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            VariantValue::Int64(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            VariantValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            VariantValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            VariantValue::String(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_time_value(&self) -> Option<TimeValue> {
        match self {
            VariantValue::TimeValue(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_time_fraction(&self) -> Option<TimeFraction> {
        match self {
            VariantValue::TimeFraction(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            VariantValue::Bytes(v) => Some(v),
            _ => None,
        }
    }
}

macro_rules! impl_from_variant {
    ($($ty:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$ty> for VariantValue {
                fn from(value: $ty) -> Self {
                    VariantValue::$variant(value.into())
                }
            }
        )*
    };
}

impl_from_variant! {
    String => String,
    &str => String,
    f64 => Double,
    i64 => Int64,
    bool => Bool,
    TimeValue => TimeValue,
    TimeFraction => TimeFraction,
    Bytes => Bytes,
}

/// A string keyed map of [`VariantValue`]s.
///
/// Getters never fail: a missing key or a value of another type yields the supplied default.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ParamDict {
    entries: HashMap<String, VariantValue>,
}

impl ParamDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<VariantValue>) -> &mut Self {
        self.entries.insert(key.into(), value.into());
        self
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<VariantValue>) -> Self {
        self.set(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&VariantValue> {
        self.entries.get(key)
    }

    pub fn have_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<VariantValue> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Copies every entry of `other` into this dictionary, replacing existing keys.
    pub fn copy_from(&mut self, other: &ParamDict) {
        for (key, value) in &other.entries {
            self.entries.insert(key.clone(), value.clone());
        }
    }

    pub fn keys_with_prefix<'a>(&'a self, prefix: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.entries
            .keys()
            .filter(move |key| key.starts_with(prefix))
            .map(String::as_str)
    }

    pub fn get_i64_or(&self, key: &str, default: i64) -> i64 {
        self.get(key).and_then(VariantValue::as_i64).unwrap_or(default)
    }

    pub fn get_f64_or(&self, key: &str, default: f64) -> f64 {
        self.get(key).and_then(VariantValue::as_f64).unwrap_or(default)
    }

    pub fn get_bool_or(&self, key: &str, default: bool) -> bool {
        self.get(key)
            .and_then(VariantValue::as_bool)
            .unwrap_or(default)
    }

    pub fn get_string_or(&self, key: &str, default: &str) -> String {
        self.get(key)
            .and_then(VariantValue::as_str)
            .unwrap_or(default)
            .to_string()
    }

    pub fn get_time_value_or(&self, key: &str, default: TimeValue) -> TimeValue {
        self.get(key)
            .and_then(VariantValue::as_time_value)
            .unwrap_or(default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_typed_getters() {
        let mut options = ParamDict::new();
        options
            .set("abr.low_watermark", TimeValue::from_seconds(3.0))
            .set("http.connect_timeout_ms", 4000i64)
            .set("abr.enabled", true)
            .set("cdn", "edge-1");

        assert_eq!(options.get_i64_or("http.connect_timeout_ms", 0), 4000);
        assert!(options.get_bool_or("abr.enabled", false));
        assert_eq!(options.get_string_or("cdn", ""), "edge-1");
        assert_eq!(
            options.get_time_value_or("abr.low_watermark", TimeValue::zero()),
            TimeValue::from_seconds(3.0)
        );
    }

    #[test]
    fn test_type_mismatch_returns_default() {
        let options = ParamDict::new().with("value", "not a number");
        assert_eq!(options.get_i64_or("value", 7), 7);
        assert_eq!(options.get_f64_or("missing", 1.5), 1.5);
    }

    #[test]
    fn test_copy_and_prefix() {
        let base = ParamDict::new().with("abr.a", 1i64).with("http.b", 2i64);
        let mut other = ParamDict::new().with("abr.a", 5i64);
        other.copy_from(&base);
        assert_eq!(other.get_i64_or("abr.a", 0), 1);

        let mut keys: Vec<_> = other.keys_with_prefix("abr.").collect();
        keys.sort();
        assert_eq!(keys, vec!["abr.a"]);
        assert!(other.remove("http.b").is_some());
        assert!(!other.have_key("http.b"));
    }
}

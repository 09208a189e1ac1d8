//! Response envelopes used by downstream backends.
//!
//! Backends disagree on how a result comes back: a bare array,
//! `{"items": [...], "total": n}`, `{"data": [...], "remaining_count": n}`,
//! `{"data": {...}}`, or just an object. The shape is decided once here and
//! consumers match on the variant.

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum Collection {
    Bare { items: Vec<Value> },
    Items { items: Vec<Value>, total: Option<u64> },
    Data { data: Vec<Value>, remaining: Option<u64> },
    Single { value: Value },
}

impl Collection {
    pub fn from_value(value: Value) -> Self {
        match value {
            Value::Array(items) => Collection::Bare { items },
            Value::Object(mut obj) => {
                if matches!(obj.get("items"), Some(Value::Array(_))) {
                    let total = obj.get("total").and_then(Value::as_u64);
                    let items = take_array(&mut obj, "items");
                    return Collection::Items { items, total };
                }
                match obj.remove("data") {
                    Some(Value::Array(data)) => Collection::Data {
                        remaining: obj.get("remaining_count").and_then(Value::as_u64),
                        data,
                    },
                    Some(inner @ Value::Object(_)) => Collection::Single { value: inner },
                    Some(other) => {
                        obj.insert("data".to_string(), other);
                        Collection::Single {
                            value: Value::Object(obj),
                        }
                    }
                    None => Collection::Single {
                        value: Value::Object(obj),
                    },
                }
            }
            other => Collection::Single { value: other },
        }
    }

    /// The records carried, whatever the envelope.
    pub fn items(&self) -> &[Value] {
        match self {
            Collection::Bare { items } | Collection::Items { items, .. } => items,
            Collection::Data { data, .. } => data,
            Collection::Single { value } => std::slice::from_ref(value),
        }
    }

    pub fn into_items(self) -> Vec<Value> {
        match self {
            Collection::Bare { items } | Collection::Items { items, .. } => items,
            Collection::Data { data, .. } => data,
            Collection::Single { value } => vec![value],
        }
    }

    /// Total record count: the backend's own figure where it reports one,
    /// otherwise what is on this page plus anything it says remains.
    pub fn total(&self) -> u64 {
        match self {
            Collection::Items {
                items,
                total: Some(total),
            } => (*total).max(items.len() as u64),
            Collection::Items { items, total: None } | Collection::Bare { items } => {
                items.len() as u64
            }
            Collection::Data { data, remaining } => data.len() as u64 + remaining.unwrap_or(0),
            Collection::Single { .. } => 1,
        }
    }
}

fn take_array(obj: &mut serde_json::Map<String, Value>, key: &str) -> Vec<Value> {
    match obj.remove(key) {
        Some(Value::Array(items)) => items,
        _ => Vec::new(),
    }
}

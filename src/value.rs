//! The sync-visible value domain (spec §3 "Value"): the closed set of types
//! that can flow over the wire as query results, mutation/action args and
//! results, and optimistic-update data.
//!
//! `Array`/`Object` use [`imbl`]'s structural-sharing persistent collections
//! rather than `Vec`/`BTreeMap`: the optimistic engine clones a server value
//! once per [`crate::optimistic::OptimisticEngine::get_optimistic_data`] call
//! and folds every pending update's transform over it, and the change
//! detector holds on to "old" and "new" snapshots side by side. Both want
//! cheap clones that share structure with their parent instead of a deep
//! copy.

use std::fmt;

use imbl::{
    OrdMap,
    Vector,
};

/// Milliseconds since the Unix epoch.
pub type Timestamp = i64;

/// A reference to a document in a specific table: `{table, id}` (spec §3,
/// §4.1 `$id` envelope).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DomainId {
    pub table: String,
    pub id: String,
}

impl DomainId {
    pub fn new(table: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for DomainId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.table, self.id)
    }
}

/// The sync-visible value domain. `undefined` is deliberately absent: the
/// codec treats encoding it as an error rather than representing it (spec
/// §3).
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    /// A finite IEEE-754 double. NaN and infinities are representable here
    /// (application data may legitimately contain them transiently) but are
    /// rejected by [`crate::codec::encode`] (spec §3, §9 open question).
    Number(f64),
    String(String),
    /// An integer outside JS's safe-integer range, carried losslessly as a
    /// 64-bit integer rather than a float.
    BigInt(i64),
    Bytes(bytes::Bytes),
    Timestamp(Timestamp),
    Id(DomainId),
    Array(Vector<Value>),
    Object(OrdMap<String, Value>),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_object(&self) -> Option<&OrdMap<String, Value>> {
        match self {
            Value::Object(m) => Some(m),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vector<Value>> {
        match self {
            Value::Array(a) => Some(a),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    /// Type discriminant name, used in change-detection's "type change ⇒
    /// Modified" rule (spec §4.2).
    pub fn type_tag(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::BigInt(_) => "bigint",
            Value::Bytes(_) => "bytes",
            Value::Timestamp(_) => "timestamp",
            Value::Id(_) => "id",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    pub fn object(pairs: impl IntoIterator<Item = (String, Value)>) -> Self {
        Value::Object(pairs.into_iter().collect())
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(items.into_iter().collect())
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Number(n)
    }
}

impl From<i32> for Value {
    fn from(n: i32) -> Self {
        Value::Number(n as f64)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_tag_distinguishes_number_and_bigint() {
        assert_eq!(Value::Number(1.0).type_tag(), "number");
        assert_eq!(Value::BigInt(1).type_tag(), "bigint");
        assert_ne!(Value::Number(1.0).type_tag(), Value::BigInt(1).type_tag());
    }

    #[test]
    fn object_and_array_constructors() {
        let v = Value::object([("a".to_string(), Value::from(1.0))]);
        assert_eq!(v.as_object().unwrap().get("a"), Some(&Value::Number(1.0)));
        let v = Value::array([Value::from(1.0), Value::from(2.0)]);
        assert_eq!(v.as_array().unwrap().len(), 2);
    }
}

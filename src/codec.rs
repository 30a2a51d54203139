//! Value encoding/decoding and message shape validation (spec §4.1).
//!
//! `encode`/`decode` convert between [`Value`] and a JSON-compatible
//! [`serde_json::Value`] tree, using sentinel-tagged envelopes for the four
//! domain types JSON cannot represent natively. `validate` checks a raw
//! parsed message against the closed-set schema in spec §6 before it is
//! deserialized into a typed [`ClientMessage`]/[`ServerMessage`].

use std::fmt;

use imbl::{
    OrdMap,
    Vector,
};
use serde_json::{
    Map,
    Value as JsonValue,
};
use syncline_sync_types::message::MessageType;

use crate::{
    error::CodecError,
    value::{
        DomainId,
        Value,
    },
};

const INT64_TAG: &str = "$int64";
const BYTES_TAG: &str = "$bytes";
const DATE_TAG: &str = "$date";
const ID_TAG: &str = "$id";

/// A path from the root of the value tree to the leaf that failed to
/// encode, rendered like `root.tags[1]` (spec §4.1 "Errors include the field
/// path").
#[derive(Debug, Clone, Default)]
struct EncodePath(Vec<PathSegment>);

#[derive(Debug, Clone)]
enum PathSegment {
    Key(String),
    Index(usize),
}

impl EncodePath {
    fn push_key(&self, key: &str) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Key(key.to_string()));
        Self(segments)
    }

    fn push_index(&self, index: usize) -> Self {
        let mut segments = self.0.clone();
        segments.push(PathSegment::Index(index));
        Self(segments)
    }
}

impl fmt::Display for EncodePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return write!(f, "root");
        }
        write!(f, "root")?;
        for segment in &self.0 {
            match segment {
                PathSegment::Key(k) => write!(f, ".{k}")?,
                PathSegment::Index(i) => write!(f, "[{i}]")?,
            }
        }
        Ok(())
    }
}

/// Encode a [`Value`] tree into its wire representation.
///
/// Reference cycles are not checked: a [`Value`] owns its children
/// directly (no `Rc`/`Arc`), so a cycle cannot be constructed in the first
/// place — the arena-of-ids pattern spec §9 recommends for
/// `OptimisticUpdate` dependencies is, here, the type system itself.
pub fn encode(value: &Value) -> Result<JsonValue, CodecError> {
    encode_at(value, &EncodePath::default())
}

fn encode_at(value: &Value, path: &EncodePath) -> Result<JsonValue, CodecError> {
    match value {
        Value::Null => Ok(JsonValue::Null),
        Value::Bool(b) => Ok(JsonValue::Bool(*b)),
        Value::Number(n) => {
            if n.is_nan() || n.is_infinite() {
                return Err(CodecError::SerializeError {
                    path: path.to_string(),
                    reason: "NaN and infinities cannot be encoded".to_string(),
                });
            }
            Ok(serde_json::json!(n))
        },
        Value::String(s) => Ok(JsonValue::String(s.clone())),
        Value::BigInt(i) => Ok(serde_json::json!({ INT64_TAG: i.to_string() })),
        Value::Bytes(b) => Ok(serde_json::json!({ BYTES_TAG: base64_encode(b) })),
        Value::Timestamp(ts) => Ok(serde_json::json!({ DATE_TAG: ts })),
        Value::Id(DomainId { table, id }) => {
            Ok(serde_json::json!({ ID_TAG: { "table": table, "id": id } }))
        },
        Value::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for (i, item) in items.iter().enumerate() {
                out.push(encode_at(item, &path.push_index(i))?);
            }
            Ok(JsonValue::Array(out))
        },
        Value::Object(fields) => {
            let mut out = Map::with_capacity(fields.len());
            for (key, item) in fields.iter() {
                out.insert(key.clone(), encode_at(item, &path.push_key(key))?);
            }
            Ok(JsonValue::Object(out))
        },
    }
}

fn base64_encode(bytes: &bytes::Bytes) -> String {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

fn base64_decode(s: &str) -> Option<bytes::Bytes> {
    use base64::Engine;
    base64::engine::general_purpose::STANDARD
        .decode(s)
        .ok()
        .map(bytes::Bytes::from)
}

/// Decode a wire JSON tree back into a [`Value`]. Decoding is total: any
/// shape that isn't a recognized envelope just becomes the corresponding
/// plain `Value` variant (spec §4.1, "preserves forward compatibility").
pub fn decode(json: &JsonValue) -> Value {
    match json {
        JsonValue::Null => Value::Null,
        JsonValue::Bool(b) => Value::Bool(*b),
        JsonValue::Number(n) => Value::Number(n.as_f64().unwrap_or(f64::NAN)),
        JsonValue::String(s) => Value::String(s.clone()),
        JsonValue::Array(items) => Value::Array(items.iter().map(decode).collect::<Vector<_>>()),
        JsonValue::Object(fields) => decode_object(fields),
    }
}

fn decode_object(fields: &Map<String, JsonValue>) -> Value {
    if fields.len() == 1 {
        if let Some(envelope) = decode_envelope(fields) {
            return envelope;
        }
    }
    Value::Object(
        fields
            .iter()
            .map(|(k, v)| (k.clone(), decode(v)))
            .collect::<OrdMap<_, _>>(),
    )
}

fn decode_envelope(fields: &Map<String, JsonValue>) -> Option<Value> {
    let (key, value) = fields.iter().next()?;
    match key.as_str() {
        INT64_TAG => value.as_str()?.parse::<i64>().ok().map(Value::BigInt),
        BYTES_TAG => base64_decode(value.as_str()?).map(Value::Bytes),
        DATE_TAG => value.as_i64().map(Value::Timestamp),
        ID_TAG => {
            let obj = value.as_object()?;
            let table = obj.get("table")?.as_str()?.to_string();
            let id = obj.get("id")?.as_str()?.to_string();
            Some(Value::Id(DomainId { table, id }))
        },
        _ => None,
    }
}

/// A required or optional field name paired with the JSON type it must have.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Bool,
    Object,
    Array,
    /// Accepts any JSON shape (used for already-encoded `Value` payloads
    /// like `args`/`value`, which may legitimately be any JSON type).
    Any,
}

impl FieldType {
    fn matches(self, value: &JsonValue) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Any => true,
        }
    }
}

struct MessageSchema {
    required: &'static [(&'static str, FieldType)],
    optional: &'static [(&'static str, FieldType)],
}

fn schema_for(message_type: MessageType) -> MessageSchema {
    use FieldType::*;
    use MessageType::*;
    match message_type {
        Subscribe => MessageSchema {
            required: &[
                ("requestId", Number),
                ("queryId", Number),
                ("query", String),
                ("args", Any),
            ],
            optional: &[("journal", Object)],
        },
        Unsubscribe => MessageSchema {
            required: &[("queryId", Number)],
            optional: &[],
        },
        Mutation => MessageSchema {
            required: &[("requestId", Number), ("mutation", String), ("args", Any)],
            optional: &[],
        },
        Action => MessageSchema {
            required: &[("requestId", Number), ("action", String), ("args", Any)],
            optional: &[],
        },
        QueryResult => MessageSchema {
            required: &[("queryId", Number), ("value", Any), ("logLines", Array)],
            optional: &[("journal", Object)],
        },
        MutationResult => MessageSchema {
            required: &[
                ("requestId", Number),
                ("success", Bool),
                ("value", Any),
                ("logLines", Array),
            ],
            optional: &[("error", String), ("errorData", Any)],
        },
        ActionResult => MessageSchema {
            required: &[
                ("requestId", Number),
                ("success", Bool),
                ("value", Any),
                ("logLines", Array),
            ],
            optional: &[("error", String), ("errorData", Any)],
        },
        Error => MessageSchema {
            required: &[("error", String), ("errorCode", String)],
            optional: &[("requestId", Number), ("errorData", Any)],
        },
        Ping | Pong => MessageSchema {
            required: &[],
            optional: &[],
        },
        Authenticate => MessageSchema {
            required: &[("token", String)],
            optional: &[("baseVersion", Number)],
        },
        Authenticated => MessageSchema {
            required: &[],
            optional: &[("identity", Object)],
        },
        ModifyQuerySet => MessageSchema {
            required: &[
                ("baseVersion", Number),
                ("newVersion", Number),
                ("modifications", Array),
            ],
            optional: &[],
        },
        Transition => MessageSchema {
            required: &[
                ("startVersion", Number),
                ("endVersion", Number),
                ("modifications", Array),
            ],
            optional: &[],
        },
    }
}

/// Validate a raw parsed message against spec §6's closed-set schema. When
/// `strict` is set, unknown fields (beyond `type` and the type's declared
/// required/optional set) are also rejected.
pub fn validate(raw: &JsonValue, strict: bool) -> Result<MessageType, CodecError> {
    let Some(obj) = raw.as_object() else {
        return Err(CodecError::ParseError {
            raw: raw.to_string(),
        });
    };
    let Some(type_str) = obj.get("type").and_then(JsonValue::as_str) else {
        return Err(CodecError::InvalidMessage {
            message_type: "unknown".to_string(),
            field: "type".to_string(),
        });
    };
    let message_type: MessageType = type_str.parse().map_err(|_| CodecError::InvalidMessage {
        message_type: type_str.to_string(),
        field: "type".to_string(),
    })?;
    let schema = schema_for(message_type);

    for (field, field_type) in schema.required {
        match obj.get(*field) {
            Some(v) if field_type.matches(v) => {},
            _ => {
                return Err(CodecError::InvalidMessage {
                    message_type: type_str.to_string(),
                    field: (*field).to_string(),
                })
            },
        }
    }
    for (field, field_type) in schema.optional {
        if let Some(v) = obj.get(*field) {
            if !field_type.matches(v) {
                return Err(CodecError::InvalidMessage {
                    message_type: type_str.to_string(),
                    field: (*field).to_string(),
                });
            }
        }
    }
    if strict {
        let known: std::collections::HashSet<&str> = schema
            .required
            .iter()
            .chain(schema.optional.iter())
            .map(|(f, _)| *f)
            .chain(std::iter::once("type"))
            .collect();
        for key in obj.keys() {
            if !known.contains(key.as_str()) {
                return Err(CodecError::InvalidMessage {
                    message_type: type_str.to_string(),
                    field: key.clone(),
                });
            }
        }
    }
    Ok(message_type)
}

//! The closed set of wire message envelopes (spec §6). Every message carries
//! a `type` discriminator; `serde`'s internally-tagged representation gives
//! us that for free and keeps the Rust enum variant names 1:1 with the wire
//! tag.
//!
//! `args`/`value` fields carry an already-codec-encoded [`serde_json::Value`]
//! tree (see `syncline::codec`); this crate only knows about the envelope
//! shape, not the `Value` domain type, so it has no dependency on the rest of
//! `syncline` and can be shared with anything that just needs to speak the
//! protocol.

use serde::{
    Deserialize,
    Serialize,
};
use serde_json::Value as JsonValue;

use strum::{
    Display,
    EnumString,
};

use crate::{
    ids::{
        QueryId,
        RequestId,
        Version,
    },
    path::QueryPath,
};

/// The closed set of `type` discriminator tags from spec §6, used by
/// `syncline::codec::validate` to look up each message's required-field
/// table without hand-writing a match arm per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum MessageType {
    Subscribe,
    Unsubscribe,
    Mutation,
    Action,
    QueryResult,
    MutationResult,
    ActionResult,
    Error,
    Ping,
    Pong,
    Authenticate,
    Authenticated,
    ModifyQuerySet,
    Transition,
}

/// Opaque per-subscription versioning hint attached to a `subscribe` message,
/// letting the server resume a query from a prior journal instead of
/// recomputing it from scratch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeJournal {
    pub base: Option<JsonValue>,
    pub mutations: Vec<JsonValue>,
}

/// Opaque per-result versioning hint attached to a `queryResult` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultJournal {
    pub version: i64,
    pub timestamp: i64,
}

/// Lines captured from `console.log`-equivalent calls made while evaluating
/// the query/mutation/action, carried alongside every result message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLines(pub Vec<String>);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub subject: String,
    pub issuer: String,
}

/// A single addition/removal within a `modifyQuerySet` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum QuerySetModification {
    Add {
        query_id: QueryId,
        query: QueryPath,
        args: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        journal: Option<SubscribeJournal>,
    },
    Remove {
        query_id: QueryId,
    },
}

/// A single query's new value within a `transition` batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum StateModification {
    QueryUpdated {
        query_id: QueryId,
        value: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        journal: Option<ResultJournal>,
        #[serde(default)]
        log_lines: LogLines,
    },
    QueryFailed {
        query_id: QueryId,
        error_message: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error_data: Option<JsonValue>,
        #[serde(default)]
        log_lines: LogLines,
    },
}

impl StateModification {
    pub fn query_id(&self) -> QueryId {
        match self {
            StateModification::QueryUpdated { query_id, .. }
            | StateModification::QueryFailed { query_id, .. } => *query_id,
        }
    }
}

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ClientMessage {
    Subscribe {
        request_id: RequestId,
        query_id: QueryId,
        query: QueryPath,
        args: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        journal: Option<SubscribeJournal>,
    },
    Unsubscribe {
        query_id: QueryId,
    },
    Mutation {
        request_id: RequestId,
        mutation: QueryPath,
        args: JsonValue,
    },
    Action {
        request_id: RequestId,
        action: QueryPath,
        args: JsonValue,
    },
    Ping,
    Pong,
    Authenticate {
        token: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        base_version: Option<Version>,
    },
    /// Atomically re-establish a whole tracked query set as one message;
    /// used by the connection manager to replay subscriptions after a
    /// reconnect (spec §4.6, subscription restoration).
    ModifyQuerySet {
        base_version: Version,
        new_version: Version,
        modifications: Vec<QuerySetModification>,
    },
}

impl ClientMessage {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ClientMessage::Subscribe { request_id, .. }
            | ClientMessage::Mutation { request_id, .. }
            | ClientMessage::Action { request_id, .. } => Some(*request_id),
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ClientMessage::Subscribe { .. } => MessageType::Subscribe,
            ClientMessage::Unsubscribe { .. } => MessageType::Unsubscribe,
            ClientMessage::Mutation { .. } => MessageType::Mutation,
            ClientMessage::Action { .. } => MessageType::Action,
            ClientMessage::Ping => MessageType::Ping,
            ClientMessage::Pong => MessageType::Pong,
            ClientMessage::Authenticate { .. } => MessageType::Authenticate,
            ClientMessage::ModifyQuerySet { .. } => MessageType::ModifyQuerySet,
        }
    }
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerMessage {
    QueryResult {
        query_id: QueryId,
        value: JsonValue,
        #[serde(default)]
        log_lines: LogLines,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        journal: Option<ResultJournal>,
    },
    MutationResult {
        request_id: RequestId,
        success: bool,
        value: JsonValue,
        #[serde(default)]
        log_lines: LogLines,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error_data: Option<JsonValue>,
    },
    ActionResult {
        request_id: RequestId,
        success: bool,
        value: JsonValue,
        #[serde(default)]
        log_lines: LogLines,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error_data: Option<JsonValue>,
    },
    Error {
        error: String,
        error_code: String,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        request_id: Option<RequestId>,
        #[serde(skip_serializing_if = "Option::is_none", default)]
        error_data: Option<JsonValue>,
    },
    Ping,
    Pong,
    Authenticated {
        #[serde(skip_serializing_if = "Option::is_none", default)]
        identity: Option<UserIdentity>,
    },
    /// A consistent batch advancing client state from `start_version` to
    /// `end_version` across every query touched.
    Transition {
        start_version: Version,
        end_version: Version,
        modifications: Vec<StateModification>,
    },
}

impl ServerMessage {
    pub fn request_id(&self) -> Option<RequestId> {
        match self {
            ServerMessage::MutationResult { request_id, .. }
            | ServerMessage::ActionResult { request_id, .. } => Some(*request_id),
            ServerMessage::Error { request_id, .. } => *request_id,
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ServerMessage::QueryResult { .. } => MessageType::QueryResult,
            ServerMessage::MutationResult { .. } => MessageType::MutationResult,
            ServerMessage::ActionResult { .. } => MessageType::ActionResult,
            ServerMessage::Error { .. } => MessageType::Error,
            ServerMessage::Ping => MessageType::Ping,
            ServerMessage::Pong => MessageType::Pong,
            ServerMessage::Authenticated { .. } => MessageType::Authenticated,
            ServerMessage::Transition { .. } => MessageType::Transition,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;
    use proptest::prelude::*;
    use serde_json::json;

    use super::*;

    /// Small recursive JSON generator for `args`/`value` payloads. Kept local
    /// (rather than reused from `crate::testing`, which sits behind the
    /// `testing` feature) so these tests build under a plain `cargo test`.
    fn arb_json() -> impl Strategy<Value = JsonValue> {
        let leaf = prop_oneof![
            Just(JsonValue::Null),
            any::<bool>().prop_map(JsonValue::Bool),
            any::<i64>().prop_map(|v| JsonValue::Number(v.into())),
            ".*".prop_map(JsonValue::String),
        ];
        leaf.prop_recursive(4, 64, 8, |inner| {
            prop::collection::vec(inner, 0..6).prop_map(JsonValue::Array)
        })
    }

    fn arb_query_path() -> impl Strategy<Value = QueryPath> {
        "[a-zA-Z][a-zA-Z0-9_]{0,8}:[a-zA-Z][a-zA-Z0-9_]{0,8}"
            .prop_map(|s| QueryPath::from_str(&s).unwrap())
    }

    fn arb_journal() -> impl Strategy<Value = Option<ResultJournal>> {
        prop_oneof![
            Just(None),
            (any::<i64>(), any::<i64>())
                .prop_map(|(version, timestamp)| Some(ResultJournal { version, timestamp })),
        ]
    }

    fn arb_log_lines() -> impl Strategy<Value = LogLines> {
        prop::collection::vec(".*", 0..3).prop_map(LogLines)
    }

    /// Covers every `ClientMessage` variant (spec §8 Invariant 2).
    fn arb_client_message() -> impl Strategy<Value = ClientMessage> {
        prop_oneof![
            (any::<u32>(), any::<u32>(), arb_query_path(), arb_json()).prop_map(
                |(request_id, query_id, query, args)| ClientMessage::Subscribe {
                    request_id: RequestId(request_id),
                    query_id: QueryId(query_id),
                    query,
                    args,
                    journal: None,
                }
            ),
            any::<u32>().prop_map(|id| ClientMessage::Unsubscribe { query_id: QueryId(id) }),
            (any::<u32>(), arb_query_path(), arb_json()).prop_map(|(request_id, mutation, args)| {
                ClientMessage::Mutation { request_id: RequestId(request_id), mutation, args }
            }),
            (any::<u32>(), arb_query_path(), arb_json()).prop_map(|(request_id, action, args)| {
                ClientMessage::Action { request_id: RequestId(request_id), action, args }
            }),
            Just(ClientMessage::Ping),
            Just(ClientMessage::Pong),
            (".*", proptest::option::of(any::<u64>())).prop_map(|(token, base_version)| {
                ClientMessage::Authenticate { token, base_version }
            }),
            (any::<u64>(), any::<u64>()).prop_map(|(base_version, new_version)| {
                ClientMessage::ModifyQuerySet { base_version, new_version, modifications: vec![] }
            }),
        ]
    }

    /// Covers every `ServerMessage` variant (spec §8 Invariant 2).
    fn arb_server_message() -> impl Strategy<Value = ServerMessage> {
        prop_oneof![
            (any::<u32>(), arb_json(), arb_log_lines(), arb_journal()).prop_map(
                |(query_id, value, log_lines, journal)| ServerMessage::QueryResult {
                    query_id: QueryId(query_id),
                    value,
                    log_lines,
                    journal,
                }
            ),
            (any::<u32>(), any::<bool>(), arb_json()).prop_map(|(request_id, success, value)| {
                ServerMessage::MutationResult {
                    request_id: RequestId(request_id),
                    success,
                    value,
                    log_lines: LogLines::default(),
                    error: None,
                    error_data: None,
                }
            }),
            (any::<u32>(), any::<bool>(), arb_json()).prop_map(|(request_id, success, value)| {
                ServerMessage::ActionResult {
                    request_id: RequestId(request_id),
                    success,
                    value,
                    log_lines: LogLines::default(),
                    error: None,
                    error_data: None,
                }
            }),
            (".*", ".*", proptest::option::of(any::<u32>())).prop_map(
                |(error, error_code, request_id)| ServerMessage::Error {
                    error,
                    error_code,
                    request_id: request_id.map(RequestId),
                    error_data: None,
                }
            ),
            Just(ServerMessage::Ping),
            Just(ServerMessage::Pong),
            Just(ServerMessage::Authenticated { identity: None }),
            (any::<u64>(), any::<u64>()).prop_map(|(start_version, end_version)| {
                ServerMessage::Transition { start_version, end_version, modifications: vec![] }
            }),
        ]
    }

    proptest! {
        #[test]
        fn client_message_round_trips_for_every_variant(msg in arb_client_message()) {
            let encoded = serde_json::to_value(&msg).unwrap();
            let decoded: ClientMessage = serde_json::from_value(encoded).unwrap();
            prop_assert_eq!(decoded, msg);
        }

        #[test]
        fn server_message_round_trips_for_every_variant(msg in arb_server_message()) {
            let encoded = serde_json::to_value(&msg).unwrap();
            let decoded: ServerMessage = serde_json::from_value(encoded).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }

    #[test]
    fn client_message_round_trips_through_json() {
        let msg = ClientMessage::Subscribe {
            request_id: RequestId(1),
            query_id: QueryId(2),
            query: QueryPath::from_str("messages:list").unwrap(),
            args: json!({"channel": "general"}),
            journal: None,
        };
        let encoded = serde_json::to_value(&msg).unwrap();
        assert_eq!(encoded["type"], json!("subscribe"));
        let decoded: ClientMessage = serde_json::from_value(encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn server_message_transition_round_trips() {
        let msg = ServerMessage::Transition {
            start_version: 0,
            end_version: 1,
            modifications: vec![StateModification::QueryUpdated {
                query_id: QueryId(0),
                value: json!(10),
                journal: None,
                log_lines: LogLines::default(),
            }],
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn error_message_request_id_is_optional() {
        let raw = json!({"type": "error", "error": "boom", "errorCode": "INTERNAL"});
        let decoded: ServerMessage = serde_json::from_value(raw).unwrap();
        assert_eq!(decoded.request_id(), None);
    }
}

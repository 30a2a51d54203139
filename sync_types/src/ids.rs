//! Correlation identifiers used on the wire (spec §6: `requestId`, `queryId`)
//! plus the monotonic version counters carried by `modifyQuerySet`/
//! `transition`.

use std::fmt;

use derive_more::{
    Display,
    From,
};
use serde::{
    Deserialize,
    Serialize,
};
use uuid::Uuid;

/// Monotonic integer used for `baseVersion`/`newVersion`/`startVersion`/
/// `endVersion`.
pub type Version = u64;

macro_rules! wire_id {
    ($name:ident) => {
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, From, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u32);

        impl $name {
            pub fn new(value: u32) -> Self {
                Self(value)
            }
        }
    };
}

wire_id!(QueryId);
wire_id!(RequestId);

/// A per-connection session identifier, generated once per transport open and
/// echoed back by the server so it can correlate reconnects to the same
/// logical client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn nil() -> Self {
        Self(Uuid::nil())
    }

    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A monotonically increasing per-instance counter for generating
/// `requestId`/`queryId` values without any process-wide mutable state
/// (spec §9, "Global mutable request counter").
#[derive(Debug, Default)]
pub struct IdGenerator {
    next_request_id: u32,
    next_query_id: u32,
}

impl IdGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_request_id(&mut self) -> RequestId {
        let id = RequestId(self.next_request_id);
        self.next_request_id += 1;
        id
    }

    pub fn next_query_id(&mut self) -> QueryId {
        let id = QueryId(self.next_query_id);
        self.next_query_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_generator_increments_independently() {
        let mut gen = IdGenerator::new();
        assert_eq!(gen.next_request_id(), RequestId(0));
        assert_eq!(gen.next_query_id(), QueryId(0));
        assert_eq!(gen.next_request_id(), RequestId(1));
        assert_eq!(gen.next_query_id(), QueryId(1));
        assert_eq!(gen.next_request_id(), RequestId(2));
    }
}

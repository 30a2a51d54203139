//! Wire types for the syncline real-time sync protocol.
//!
//! This crate is deliberately thin: message envelopes, correlation ids, path
//! validation, and a standalone exponential-backoff primitive. The reconnect
//! submachine in the client crate implements its own delay formula rather
//! than drawing on this one; `backoff::Backoff` is kept here as a
//! runtime-free building block for anything else that speaks this protocol
//! without wanting to pull in the client crate's retry policy. It has no
//! opinion about transports, clocks, or async runtimes beyond what `serde`
//! needs, so it can be reused by anything that just needs to speak the
//! protocol (a server, a test harness, a different client implementation).

pub mod backoff;
pub mod identifier;
pub mod ids;
pub mod message;
pub mod path;
#[cfg(feature = "testing")]
pub mod testing;

pub use ids::{
    IdGenerator,
    QueryId,
    RequestId,
    SessionId,
    Version,
};
pub use message::{
    ClientMessage,
    LogLines,
    QuerySetModification,
    ResultJournal,
    ServerMessage,
    StateModification,
    SubscribeJournal,
    UserIdentity,
};
pub use path::QueryPath;

//! `syncline`: a client-side engine for a real-time database sync protocol.
//!
//! The crate is organized as one module per subsystem from the protocol's
//! design: wire [`codec`], [`change_detector`], [`conflict`] resolution,
//! [`subscription`] registry, [`optimistic`] update engine, and
//! [`connection`] management, composed by the top-level [`client`] into a
//! single cloneable handle backed by one worker task (see `client::worker`
//! for why one task owns all of the above exclusively).
//!
//! Wire envelope types ([`syncline_sync_types`]) live in a separate crate
//! with no async runtime dependency, so anything that just needs to speak
//! the protocol (codegen, test fixtures, a non-tokio client) can depend on
//! them without pulling in tokio.

pub mod change_detector;
pub mod codec;
pub mod conflict;
pub mod connection;
pub mod error;
mod guard;
pub mod optimistic;
pub mod subscription;
pub mod value;

pub mod client;

pub use syncline_sync_types as sync_types;

pub use crate::{
    client::{
        FunctionResult,
        SyncClient,
    },
    error::{
        CodecError,
        ConflictError,
        ReconnectConfigError,
        SubscriptionError,
        TransportError,
    },
    value::{
        DomainId,
        Timestamp,
        Value,
    },
};

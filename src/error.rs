//! The typed error taxonomy from spec §7. Errors arising from the core's own
//! contracts (bad strategy, disposed manager, invalid config, malformed wire
//! input) are returned here as typed values. Errors arising from *user*
//! callbacks never reach this taxonomy — they are caught by [`guard`] and
//! reported on the relevant `on_error` hook instead (spec §7, "Propagation
//! policy").

use thiserror::Error;

/// Encoding/decoding/validation failures (spec §4.1, §7 "Encoding").
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("cannot encode value at {path}: {reason}")]
    SerializeError { path: String, reason: String },

    #[error("malformed message bytes: {raw}")]
    ParseError { raw: String },

    #[error("invalid {message_type} message: missing or mistyped field `{field}`")]
    InvalidMessage { message_type: String, field: String },

    #[error("schema validation failed at {field}: expected {expected}, got {received}")]
    SchemaValidation {
        field: String,
        expected: String,
        received: String,
    },
}

/// Transport-contract failures (spec §4.6, §7 "Transport").
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportError {
    #[error("connection attempt timed out")]
    ConnectTimeout,
    #[error("not connected")]
    NotConnected,
    #[error("already connected or connecting")]
    AlreadyConnected,
    #[error("connection manager has been disposed")]
    Disposed,
    #[error("invalid transport url: {0}")]
    InvalidUrl(String),
    #[error("transport io error: {0}")]
    Io(String),
}

/// Subscription-registry failures (spec §4.4, §7 "Subscription").
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionError {
    #[error("subscription manager has been disposed")]
    ManagerDisposed,
    #[error("subscription limit of {max} reached")]
    TooManySubscriptions { max: usize },
}

/// Conflict-resolver failures (spec §4.3, §7 "Conflict").
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConflictError {
    #[error("strategy `{0}` is not a valid conflict resolution strategy")]
    InvalidStrategy(String),
    #[error("manual strategy configured without a resolution handler")]
    ManualWithoutHandler,
    #[error("manual strategy handler is asynchronous; call resolve_async instead")]
    AsyncHandlerRequiresResolveAsync,
    #[error("custom resolver returned an invalid resolution shape")]
    InvalidResolverShape,
    #[error("custom resolver failed: {0}")]
    ResolverFailed(String),
}

/// Reconnect submachine configuration failures, raised at construction
/// (spec §4.6, §7 "Reconnection").
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectConfigError {
    #[error("delays must be non-negative")]
    NegativeDelay,
    #[error("max_delay must be >= initial_delay")]
    MaxLessThanInitial,
    #[error("backoff_multiplier must be >= 1")]
    BadMultiplier,
    #[error("jitter must be in [0, 1]")]
    BadJitter,
}

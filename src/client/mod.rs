//! The public handle applications hold: [`SyncClient`]. Owns nothing itself
//! beyond a few channel endpoints — every mutable piece (the connection, the
//! subscription registry, in-flight requests) lives exclusively inside the
//! [`worker`] task, in the same relationship the teacher's `ConvexClient` has
//! to `BaseConvexClient`/`worker()`.

pub mod subscription;
mod worker;

use std::{
    convert::Infallible,
    sync::Arc,
};

use tokio::{
    sync::{
        broadcast,
        mpsc,
        oneshot,
    },
    task::JoinHandle,
};
use tokio_stream::wrappers::BroadcastStream;

pub use self::subscription::{
    FunctionResult,
    QuerySetSubscription,
    QuerySetUpdate,
    QuerySubscription,
};
use self::worker::{
    worker,
    ClientRequest,
    OptimisticUpdateRequest,
};
use crate::{
    change_detector::ChangeDetectorConfig,
    conflict::ConflictConfig,
    connection::{
        transport::{
            validate_transport_url,
            Transport,
            WebSocketTransport,
        },
        ConnectionConfig,
        ReconnectConfig,
    },
    optimistic::{
        ApplyOptions,
        OptimisticConfig,
        OptimisticTransform,
    },
    subscription::SubscriptionConfig,
    sync_types::path::QueryPath,
    value::Value,
};

const VERSION: Option<&str> = option_env!("CARGO_PKG_VERSION");

/// Every subsystem's construction-time knobs, bundled so one value fully
/// describes a [`SyncClient`] (spec §6 "Configuration surface"). Not `Clone`
/// or `Debug`: `ConflictConfig`'s optional `version_generator` closure isn't
/// either.
#[derive(Default)]
pub struct SyncClientConfig {
    pub connection: ConnectionConfig,
    pub reconnect: ReconnectConfig,
    pub subscription: SubscriptionConfig,
    pub optimistic: OptimisticConfig,
    pub conflict: ConflictConfig,
    pub change_detector: ChangeDetectorConfig,
}

/// An asynchronous client that subscribes to queries, runs mutations and
/// actions, and manages its own connection and reconnection over a
/// bidirectional transport (spec §2, §4).
///
/// The client internally holds a [`tokio`] background task that owns the
/// connection. It is advised to create one and **reuse** it — clone it to
/// share the connection and outstanding subscriptions with other parts of
/// an application.
pub struct SyncClient {
    worker_handle: Option<Arc<JoinHandle<Infallible>>>,
    request_sender: mpsc::UnboundedSender<ClientRequest>,
    watch_receiver: broadcast::Receiver<QuerySetUpdate>,
}

impl Clone for SyncClient {
    fn clone(&self) -> Self {
        Self {
            worker_handle: self.worker_handle.clone(),
            request_sender: self.request_sender.clone(),
            watch_receiver: self.watch_receiver.resubscribe(),
        }
    }
}

/// Drops the connection once the last clone of a [`SyncClient`] goes away.
impl Drop for SyncClient {
    fn drop(&mut self) {
        let Some(handle) = self.worker_handle.take() else {
            return;
        };
        if let Ok(handle) = Arc::try_unwrap(handle) {
            handle.abort();
        }
    }
}

impl SyncClient {
    /// Connects to `url` (a `ws://` or `wss://` endpoint) with default
    /// connection and reconnect behavior.
    pub async fn new(url: &str) -> anyhow::Result<Self> {
        Self::new_with_config(url, ConnectionConfig::default(), ReconnectConfig::default()).await
    }

    /// Connects to `url` with caller-supplied connection/reconnect
    /// configuration (spec §4.6's tunables — backoff schedule, queue
    /// behavior, connection timeout). Every other subsystem keeps its
    /// defaults; use [`Self::new_with_full_config`] to override those too.
    pub async fn new_with_config(
        url: &str,
        connection_config: ConnectionConfig,
        reconnect_config: ReconnectConfig,
    ) -> anyhow::Result<Self> {
        Self::new_with_full_config(
            url,
            SyncClientConfig {
                connection: connection_config,
                reconnect: reconnect_config,
                ..Default::default()
            },
        )
        .await
    }

    /// Connects to `url` with a fully-specified [`SyncClientConfig`],
    /// covering every subsystem's tunables.
    pub async fn new_with_full_config(url: &str, config: SyncClientConfig) -> anyhow::Result<Self> {
        Self::spawn::<WebSocketTransport>(url, config).await
    }

    async fn spawn<T: Transport + 'static>(url: &str, config: SyncClientConfig) -> anyhow::Result<Self> {
        let parsed_url = validate_transport_url(url)?;

        let (request_sender, request_receiver) = mpsc::unbounded_channel();
        let (internal_sender, internal_receiver) = mpsc::unbounded_channel();
        let (watch_sender, watch_receiver) = broadcast::channel(16);

        let worker_handle = tokio::spawn(worker::<T>(
            parsed_url,
            config,
            request_receiver,
            internal_receiver,
            internal_sender,
            watch_sender,
        ));

        Ok(Self {
            worker_handle: Some(Arc::new(worker_handle)),
            request_sender,
            watch_receiver,
        })
    }

    /// Subscribes to the results of query `name` called with `args`.
    ///
    /// Returns a [`QuerySubscription`] implementing `Stream<Item =
    /// FunctionResult>`. A new value appears each time the query's result
    /// changes; the subscription is unsubscribed automatically on drop.
    pub async fn subscribe(&self, name: &str, args: Value) -> anyhow::Result<QuerySubscription> {
        let query: QueryPath = name.parse()?;
        let (tx, rx) = oneshot::channel();
        self.request_sender.send(ClientRequest::Subscribe { query, args, tx })?;
        Ok(rx.await?)
    }

    /// Makes a one-shot request for query `name`'s current result. Sugar for
    /// `subscribe(name, args).await?.next().await`.
    pub async fn query(&self, name: &str, args: Value) -> anyhow::Result<FunctionResult> {
        use futures::StreamExt;

        let mut subscription = self.subscribe(name, args).await?;
        subscription
            .next()
            .await
            .ok_or_else(|| anyhow::anyhow!("connection closed before query produced a result"))
    }

    /// Runs mutation `name` with `args` and resolves once the server
    /// confirms or rejects it.
    pub async fn mutation(&self, name: &str, args: Value) -> anyhow::Result<FunctionResult> {
        let mutation: QueryPath = name.parse()?;
        let (tx, rx) = oneshot::channel();
        self.request_sender.send(ClientRequest::Mutation {
            mutation,
            args,
            optimistic_update: None,
            tx,
        })?;
        Ok(rx.await?)
    }

    /// Runs mutation `name` with `args`, applying `transform` to `local_query`
    /// immediately so subscribers of it see the expected outcome before the
    /// round trip completes. `transform` folds the query's current value and
    /// this mutation's `args` into the optimistic next value; it is dropped
    /// once the mutation is confirmed or reverted (spec §4.5).
    pub async fn mutation_with_optimistic_update(
        &self,
        name: &str,
        args: Value,
        local_query: &str,
        transform: impl Fn(&Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
        options: ApplyOptions,
    ) -> anyhow::Result<FunctionResult> {
        let mutation: QueryPath = name.parse()?;
        let query: QueryPath = local_query.parse()?;
        let (tx, rx) = oneshot::channel();
        self.request_sender.send(ClientRequest::Mutation {
            mutation,
            args,
            optimistic_update: Some(OptimisticUpdateRequest {
                query,
                transform: Box::new(transform) as OptimisticTransform,
                options,
            }),
            tx,
        })?;
        Ok(rx.await?)
    }

    /// Runs action `name` with `args` and resolves once the server
    /// confirms or rejects it.
    pub async fn action(&self, name: &str, args: Value) -> anyhow::Result<FunctionResult> {
        let action: QueryPath = name.parse()?;
        let (tx, rx) = oneshot::channel();
        self.request_sender.send(ClientRequest::Action { action, args, tx })?;
        Ok(rx.await?)
    }

    /// A consistent view across every query currently tracked by this
    /// client, updated in lockstep with the server's batched `transition`
    /// messages (spec §4.4, §6).
    pub fn watch_all(&self) -> QuerySetSubscription {
        QuerySetSubscription::new(BroadcastStream::new(self.watch_receiver.resubscribe()))
    }

    /// Sets (or, with `None`, clears) the auth token used for subsequent
    /// function calls (spec §6 `authenticate`).
    pub fn set_auth(&self, token: Option<String>) -> anyhow::Result<()> {
        let Some(token) = token else {
            return Ok(());
        };
        self.request_sender.send(ClientRequest::Authenticate { token })?;
        Ok(())
    }

    /// Closes the connection and stops the background worker. Any clones of
    /// this client become unusable once every clone has called `close` or
    /// been dropped.
    pub fn close(&self) -> anyhow::Result<()> {
        self.request_sender.send(ClientRequest::Close)?;
        Ok(())
    }
}

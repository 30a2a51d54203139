//! The single task that owns the connection, the subscription registry, and
//! every in-flight request. Exactly one task ever touches these — the same
//! shape as the teacher's `worker()` owning `BaseConvexClient` — so none of
//! them need internal locking.

use std::{
    collections::HashMap,
    convert::Infallible,
};

use tokio::sync::{
    broadcast,
    mpsc,
    oneshot,
    watch,
};
use tokio_stream::wrappers::WatchStream;
use tracing::{
    debug,
    error,
    warn,
};

use crate::{
    change_detector::ChangeDetector,
    client::{
        subscription::{
            FunctionResult,
            QuerySetUpdate,
            QuerySubscription,
            WorkerCommand,
        },
        SyncClientConfig,
    },
    conflict::{
        ConflictResolver,
        DocumentState,
    },
    connection::{
        transport::{
            Transport,
            TransportEvent,
            WireMessage,
        },
        ConnectionManager,
        TrackedSubscription,
    },
    optimistic::{
        ApplyOptions,
        OptimisticEngine,
        OptimisticTransform,
        OptimisticUpdateId,
    },
    subscription::{
        SubscribeOptions,
        SubscriptionId,
        SubscriptionRegistry,
    },
    sync_types::{
        ids::{
            IdGenerator,
            QueryId,
            RequestId,
        },
        message::{
            ClientMessage,
            ServerMessage,
            StateModification,
        },
        path::QueryPath,
    },
    value::Value,
};

/// A caller-supplied optimistic update to apply immediately on `subscribe`
/// to `query` while the paired mutation is in flight, confirmed or reverted
/// once the mutation resolves (spec §2 "Data flow", §4.5).
pub(crate) struct OptimisticUpdateRequest {
    pub query: QueryPath,
    pub transform: OptimisticTransform,
    pub options: ApplyOptions,
}

pub(crate) enum ClientRequest {
    Subscribe {
        query: QueryPath,
        args: Value,
        tx: oneshot::Sender<QuerySubscription>,
    },
    Mutation {
        mutation: QueryPath,
        args: Value,
        optimistic_update: Option<OptimisticUpdateRequest>,
        tx: oneshot::Sender<FunctionResult>,
    },
    Action {
        action: QueryPath,
        args: Value,
        tx: oneshot::Sender<FunctionResult>,
    },
    Authenticate {
        token: String,
    },
    Close,
}

struct QueryState {
    query_id: QueryId,
    query: QueryPath,
    sender: watch::Sender<FunctionResult>,
}

/// Runs until the command channel and the transport both close, or a
/// `Close` command is received. Reconnection is driven entirely by
/// [`ConnectionManager::on_close`]/[`crate::connection::reconnect::ReconnectManager`];
/// this loop just reacts to whatever they decide.
pub(crate) async fn worker<T: Transport>(
    url: url::Url,
    config: SyncClientConfig,
    mut command_receiver: mpsc::UnboundedReceiver<ClientRequest>,
    mut internal_receiver: mpsc::UnboundedReceiver<WorkerCommand>,
    internal_sender: mpsc::UnboundedSender<WorkerCommand>,
    watch_sender: broadcast::Sender<QuerySetUpdate>,
) -> Infallible {
    let SyncClientConfig {
        connection: connection_config,
        reconnect: reconnect_config,
        subscription: subscription_config,
        optimistic: optimistic_config,
        conflict: conflict_config,
        change_detector: change_detector_config,
    } = config;
    let protocols = connection_config.protocols.clone();
    let mut connection = ConnectionManager::new(connection_config, reconnect_config);
    let mut ids = IdGenerator::new();
    let mut transport: Option<T> = None;
    let mut queries: HashMap<SubscriptionId, QueryState> = HashMap::new();
    let mut subscription_registry = SubscriptionRegistry::with_config(subscription_config);
    let mut pending_requests: HashMap<RequestId, oneshot::Sender<FunctionResult>> = HashMap::new();
    let mut auth_token: Option<String> = None;
    let mut optimistic = OptimisticEngine::with_config(optimistic_config);
    let mut pending_optimistic: HashMap<RequestId, (OptimisticUpdateId, QueryPath)> = HashMap::new();
    let change_detector = ChangeDetector::new(change_detector_config);
    let conflict_resolver = ConflictResolver::with_config(conflict_config);

    let (event_sender, mut event_receiver) = mpsc::channel::<TransportEvent>(64);

    connection.connect(now()).expect("fresh connection manager always accepts the first connect");
    match T::open(&url, event_sender.clone(), &protocols).await {
        Ok(t) => transport = Some(t),
        Err(e) => {
            error!(error = %e, "initial transport open failed");
        },
    }

    loop {
        tokio::select! {
            Some(event) = event_receiver.recv() => {
                handle_transport_event(
                    event,
                    &mut connection,
                    &mut ids,
                    &mut queries,
                    &mut subscription_registry,
                    &mut pending_requests,
                    &mut optimistic,
                    &mut pending_optimistic,
                    &change_detector,
                    &conflict_resolver,
                    &watch_sender,
                    &mut transport,
                ).await;
            }
            Some(command) = command_receiver.recv() => {
                if matches!(command, ClientRequest::Close) {
                    connection.dispose();
                    if let Some(t) = transport.as_mut() {
                        t.close(crate::connection::CLOSE_NORMAL, None).await;
                    }
                    std::future::pending::<()>().await;
                }
                handle_client_request(
                    command,
                    &mut connection,
                    &mut ids,
                    &mut queries,
                    &mut subscription_registry,
                    &mut pending_requests,
                    &mut auth_token,
                    &mut optimistic,
                    &mut pending_optimistic,
                    transport.as_mut(),
                    &event_sender,
                    &internal_sender,
                ).await;
            }
            Some(internal) = internal_receiver.recv() => {
                match internal {
                    WorkerCommand::Unsubscribe { id } => {
                        if let Some(state) = queries.remove(&id) {
                            subscription_registry.unsubscribe(id);
                            connection.reconnect().untrack(id);
                            send_if_connected(
                                &mut connection,
                                transport.as_mut(),
                                ClientMessage::Unsubscribe { query_id: state.query_id },
                            ).await;
                        }
                    },
                }
            }
            else => {
                std::future::pending::<()>().await;
            }
        }
    }
}

fn now() -> i64 {
    // The worker only needs relative ordering between its own calls
    // (connect/close/reconnect scheduling), never wall-clock time, so a
    // monotonically increasing logical clock is enough and keeps this
    // testable without mocking `SystemTime`.
    use std::sync::atomic::{
        AtomicI64,
        Ordering,
    };
    static CLOCK: AtomicI64 = AtomicI64::new(0);
    CLOCK.fetch_add(1, Ordering::Relaxed)
}

async fn send_if_connected<T: Transport>(connection: &mut ConnectionManager, transport: Option<&mut T>, message: ClientMessage) {
    let encoded = match serde_json::to_string(&message) {
        Ok(s) => s,
        Err(e) => {
            warn!(error = %e, "failed to encode outgoing message");
            return;
        },
    };
    match connection.send(WireMessage::Text(encoded.clone())) {
        Ok(crate::connection::SendOutcome::Send(wire_message)) => {
            if let Some(transport) = transport {
                if let Err(e) = transport.send(wire_message.clone()).await {
                    warn!(error = %e, "send failed, re-queueing");
                    connection.requeue_front(wire_message);
                }
            }
        },
        Ok(crate::connection::SendOutcome::Queued) => {},
        Err(e) => warn!(error = %e, "dropped outgoing message"),
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_client_request<T: Transport>(
    command: ClientRequest,
    connection: &mut ConnectionManager,
    ids: &mut IdGenerator,
    queries: &mut HashMap<SubscriptionId, QueryState>,
    subscription_registry: &mut SubscriptionRegistry,
    pending_requests: &mut HashMap<RequestId, oneshot::Sender<FunctionResult>>,
    auth_token: &mut Option<String>,
    optimistic: &mut OptimisticEngine,
    pending_optimistic: &mut HashMap<RequestId, (OptimisticUpdateId, QueryPath)>,
    transport: Option<&mut T>,
    event_sender: &mpsc::Sender<TransportEvent>,
    internal_sender: &mpsc::UnboundedSender<WorkerCommand>,
) {
    let _ = event_sender;
    match command {
        ClientRequest::Close => {},
        ClientRequest::Subscribe { query, args, tx } => {
            let query_id = ids.next_query_id();
            let (watch_tx, watch_rx) = watch::channel(FunctionResult::Value(Value::Null));
            let encoded_args = crate::codec::encode(&args).unwrap_or(serde_json::Value::Null);
            let request_id = ids.next_request_id();
            let tracked_args = args.clone();

            let Ok(subscription_id) = subscription_registry.subscribe(
                query.as_ref().to_string(),
                args,
                |_value| {},
                SubscribeOptions::default(),
                now(),
            ) else {
                return;
            };
            queries.insert(
                subscription_id,
                QueryState {
                    query_id,
                    query: query.clone(),
                    sender: watch_tx,
                },
            );
            // Tracked so a later reconnect can replay this subscribe
            // without the caller having to resubscribe by hand (spec §4.6
            // "subscription restoration").
            connection.reconnect().track(TrackedSubscription {
                id: subscription_id,
                query_path: query.as_str().to_string(),
                args: tracked_args,
            });

            send_if_connected(
                connection,
                transport,
                ClientMessage::Subscribe {
                    request_id,
                    query_id,
                    query,
                    args: encoded_args,
                    journal: None,
                },
            )
            .await;

            let subscription = QuerySubscription::new(subscription_id, WatchStream::new(watch_rx), internal_sender.clone());
            let _ = tx.send(subscription);
        },
        ClientRequest::Mutation {
            mutation,
            args,
            optimistic_update,
            tx,
        } => {
            let request_id = ids.next_request_id();
            let encoded_args = crate::codec::encode(&args).unwrap_or(serde_json::Value::Null);

            if let Some(update) = optimistic_update {
                let id = optimistic.apply(mutation.as_str().to_string(), args.clone(), update.transform, update.options, now());
                pending_optimistic.insert(request_id, (id, update.query.clone()));
                notify_optimistic_view(optimistic, queries, subscription_registry, &update.query);
            }

            pending_requests.insert(request_id, tx);
            send_if_connected(
                connection,
                transport,
                ClientMessage::Mutation {
                    request_id,
                    mutation,
                    args: encoded_args,
                },
            )
            .await;
        },
        ClientRequest::Action { action, args, tx } => {
            let request_id = ids.next_request_id();
            let encoded_args = crate::codec::encode(&args).unwrap_or(serde_json::Value::Null);
            pending_requests.insert(request_id, tx);
            send_if_connected(
                connection,
                transport,
                ClientMessage::Action {
                    request_id,
                    action,
                    args: encoded_args,
                },
            )
            .await;
        },
        ClientRequest::Authenticate { token } => {
            *auth_token = Some(token.clone());
            send_if_connected(
                connection,
                transport,
                ClientMessage::Authenticate {
                    token,
                    base_version: None,
                },
            )
            .await;
        },
    }
}

/// Folds `optimistic`'s pending updates over every subscription matching
/// `query`'s last known server value and pushes the result immediately,
/// without waiting for the server to confirm the mutation (spec §2 "Data
/// flow": optimistic intents are visible before the round trip completes).
fn notify_optimistic_view(
    optimistic: &mut OptimisticEngine,
    queries: &HashMap<SubscriptionId, QueryState>,
    subscription_registry: &SubscriptionRegistry,
    query: &QueryPath,
) {
    for id in subscription_registry.ids_by_query(query.as_str()) {
        let Some(state) = queries.get(&id) else {
            continue;
        };
        let server_value = subscription_registry.data(id).cloned().unwrap_or(Value::Null);
        let folded = optimistic.get_optimistic_data(&server_value, false).unwrap_or(server_value);
        let _ = state.sender.send(FunctionResult::Value(folded));
    }
}

#[allow(clippy::too_many_arguments)]
async fn handle_transport_event<T: Transport>(
    event: TransportEvent,
    connection: &mut ConnectionManager,
    ids: &mut IdGenerator,
    queries: &mut HashMap<SubscriptionId, QueryState>,
    subscription_registry: &mut SubscriptionRegistry,
    pending_requests: &mut HashMap<RequestId, oneshot::Sender<FunctionResult>>,
    optimistic: &mut OptimisticEngine,
    pending_optimistic: &mut HashMap<RequestId, (OptimisticUpdateId, QueryPath)>,
    change_detector: &ChangeDetector,
    conflict_resolver: &ConflictResolver,
    watch_sender: &broadcast::Sender<QuerySetUpdate>,
    transport: &mut Option<T>,
) {
    match event {
        TransportEvent::Open => {
            let (flushed, restore) = connection.on_open(now());
            if let Some(t) = transport.as_mut() {
                for message in flushed {
                    let _ = t.send(message).await;
                }
            }
            if let Some(tracked) = restore {
                // Subscription restoration: re-issue subscribe for every
                // query tracked by the reconnect submachine, reusing each
                // query's existing queryId so the server's results land
                // back on the same local subscription (spec §4.6).
                for sub in tracked {
                    let Some(state) = queries.get(&sub.id) else {
                        continue;
                    };
                    let request_id = ids.next_request_id();
                    let encoded_args = crate::codec::encode(&sub.args).unwrap_or(serde_json::Value::Null);
                    send_if_connected(
                        connection,
                        transport.as_mut(),
                        ClientMessage::Subscribe {
                            request_id,
                            query_id: state.query_id,
                            query: state.query.clone(),
                            args: encoded_args,
                            journal: None,
                        },
                    )
                    .await;
                }
            }
        },
        TransportEvent::Message(message) => {
            let parsed = connection.on_message(&message);
            let crate::connection::ParsedMessage::Json(json) = parsed else {
                return;
            };
            let Ok(server_message) = serde_json::from_value::<ServerMessage>(json) else {
                return;
            };
            dispatch_server_message(
                server_message,
                queries,
                subscription_registry,
                pending_requests,
                optimistic,
                pending_optimistic,
                change_detector,
                conflict_resolver,
                watch_sender,
            );
        },
        TransportEvent::Error(message) => {
            warn!(error = %message, "transport error");
        },
        TransportEvent::Close { code, reason } => {
            if let Some(delay_ms) = connection.on_close(code, reason, now()) {
                warn!(delay_ms, "scheduling reconnect");
            }
        },
    }
}

#[allow(clippy::too_many_arguments)]
fn dispatch_server_message(
    message: ServerMessage,
    queries: &mut HashMap<SubscriptionId, QueryState>,
    subscription_registry: &mut SubscriptionRegistry,
    pending_requests: &mut HashMap<RequestId, oneshot::Sender<FunctionResult>>,
    optimistic: &mut OptimisticEngine,
    pending_optimistic: &mut HashMap<RequestId, (OptimisticUpdateId, QueryPath)>,
    change_detector: &ChangeDetector,
    conflict_resolver: &ConflictResolver,
    watch_sender: &broadcast::Sender<QuerySetUpdate>,
) {
    match message {
        ServerMessage::QueryResult { query_id, value, .. } => {
            deliver_query_result(
                queries,
                subscription_registry,
                optimistic,
                change_detector,
                query_id,
                FunctionResult::Value(crate::codec::decode(&value)),
            );
        },
        ServerMessage::MutationResult {
            request_id,
            success,
            value,
            error,
            error_data,
            ..
        } => {
            settle_optimistic(
                optimistic,
                pending_optimistic,
                queries,
                subscription_registry,
                conflict_resolver,
                request_id,
                success,
                &error,
            );
            resolve_pending(pending_requests, request_id, success, value, error, error_data);
        },
        ServerMessage::ActionResult { request_id, success, value, error, error_data, .. } => {
            resolve_pending(pending_requests, request_id, success, value, error, error_data);
        },
        ServerMessage::Error { request_id, error, error_data, .. } => {
            if let Some(request_id) = request_id {
                settle_optimistic(
                    optimistic,
                    pending_optimistic,
                    queries,
                    subscription_registry,
                    conflict_resolver,
                    request_id,
                    false,
                    &Some(error.clone()),
                );
                if let Some(tx) = pending_requests.remove(&request_id) {
                    let _ = tx.send(FunctionResult::Error {
                        message: error,
                        data: error_data.map(|d| crate::codec::decode(&d)),
                    });
                }
            } else {
                warn!(error = %error, "server error with no request id");
            }
        },
        ServerMessage::Ping | ServerMessage::Pong | ServerMessage::Authenticated { .. } => {},
        ServerMessage::Transition { modifications, .. } => {
            let mut snapshot: QuerySetUpdate = imbl::OrdMap::new();
            for modification in modifications {
                let query_id = modification.query_id();
                match modification {
                    StateModification::QueryUpdated { value, .. } => {
                        deliver_query_result(
                            queries,
                            subscription_registry,
                            optimistic,
                            change_detector,
                            query_id,
                            FunctionResult::Value(crate::codec::decode(&value)),
                        );
                    },
                    StateModification::QueryFailed { error_message, error_data, .. } => {
                        deliver_query_result(
                            queries,
                            subscription_registry,
                            optimistic,
                            change_detector,
                            query_id,
                            FunctionResult::Error {
                                message: error_message,
                                data: error_data.map(|d| crate::codec::decode(&d)),
                            },
                        );
                    },
                }
            }
            for (id, state) in queries.iter() {
                if let Some(result) = subscription_registry.data(*id) {
                    snapshot.insert(*id, FunctionResult::Value(result.clone()));
                }
                let _ = state;
            }
            let _ = watch_sender.send(snapshot);
        },
    }
}

/// Confirms or reverts the optimistic update (if any) paired with
/// `request_id`, then refreshes every subscriber of its target query so the
/// optimistic layer removal is visible immediately rather than waiting for
/// the next server push (spec §4.5 "confirm"/"revert"). A failed mutation is
/// also the signal a conflict may exist between what the optimistic layer
/// showed the caller and the server's last known state for the same query,
/// so it is run through [`ConflictResolver`] before reverting (spec §2 "Data
/// flow": conflict signals pass through the conflict resolver).
fn settle_optimistic(
    optimistic: &mut OptimisticEngine,
    pending_optimistic: &mut HashMap<RequestId, (OptimisticUpdateId, QueryPath)>,
    queries: &HashMap<SubscriptionId, QueryState>,
    subscription_registry: &SubscriptionRegistry,
    conflict_resolver: &ConflictResolver,
    request_id: RequestId,
    success: bool,
    error: &Option<String>,
) {
    let Some((id, query)) = pending_optimistic.remove(&request_id) else {
        return;
    };
    if success {
        optimistic.confirm(id);
    } else {
        for subscription_id in subscription_registry.ids_by_query(query.as_str()) {
            let server_value = subscription_registry.data(subscription_id).cloned().unwrap_or(Value::Null);
            let local_value = optimistic
                .get_optimistic_data(&server_value, false)
                .unwrap_or_else(|_| server_value.clone());
            let local_state = document_state_from_value(&local_value);
            let server_state = document_state_from_value(&server_value);
            if let Some(conflict) = conflict_resolver.detect(query.as_str(), subscription_id.to_string(), local_state, server_state) {
                match conflict_resolver.resolve(&conflict) {
                    Ok(resolution) => {
                        debug!(
                            query = query.as_str(),
                            subscription_id,
                            strategy = ?resolution.strategy,
                            "resolved conflict surfaced by a failed mutation"
                        );
                    },
                    Err(e) => {
                        warn!(query = query.as_str(), subscription_id, error = %e, "conflict resolution failed");
                    },
                }
            }
        }
        optimistic.revert(id, error.clone());
    }
    notify_optimistic_view(optimistic, queries, subscription_registry, &query);
}

/// Converts a query result into the shape [`ConflictResolver`] compares:
/// `null` is an absent/deleted document, anything else is a present document
/// whose fields are compared directly (spec §4.3's documents are field maps;
/// this sync layer's query results are arbitrary JSON, so a numeric
/// `_version` field is read when present and treated as `0` otherwise).
fn document_state_from_value(value: &Value) -> DocumentState {
    if value.is_null() {
        return DocumentState::Deleted;
    }
    let fields = value.as_object().cloned().unwrap_or_else(imbl::OrdMap::new);
    let version = fields.get("_version").and_then(Value::as_f64).map(|v| v as i64).unwrap_or(0);
    DocumentState::Present {
        fields,
        version,
        timestamp: None,
    }
}

fn deliver_query_result(
    queries: &mut HashMap<SubscriptionId, QueryState>,
    subscription_registry: &mut SubscriptionRegistry,
    optimistic: &mut OptimisticEngine,
    change_detector: &ChangeDetector,
    query_id: QueryId,
    result: FunctionResult,
) {
    let Some((id, state)) = queries.iter().find(|(_, s)| s.query_id == query_id) else {
        return;
    };
    let id = *id;
    match &result {
        FunctionResult::Value(value) => {
            let previous = subscription_registry.data(id).cloned();
            let changed = previous.as_ref().map_or(true, |old| change_detector.has_changes(old, value));
            subscription_registry.update_subscription(id, value.clone(), false, now());
            if !changed {
                return;
            }
            let folded = optimistic.get_optimistic_data(value, false).unwrap_or_else(|_| value.clone());
            let _ = state.sender.send(FunctionResult::Value(folded));
        },
        FunctionResult::Error { message, .. } => {
            subscription_registry.set_subscription_error(id, message.clone());
            let _ = state.sender.send(result);
        },
    }
}

fn resolve_pending(
    pending_requests: &mut HashMap<RequestId, oneshot::Sender<FunctionResult>>,
    request_id: RequestId,
    success: bool,
    value: serde_json::Value,
    error: Option<String>,
    error_data: Option<serde_json::Value>,
) {
    let Some(tx) = pending_requests.remove(&request_id) else {
        return;
    };
    let result = if success {
        FunctionResult::Value(crate::codec::decode(&value))
    } else {
        FunctionResult::Error {
            message: error.unwrap_or_else(|| "mutation failed".to_string()),
            data: error_data.map(|d| crate::codec::decode(&d)),
        }
    };
    let _ = tx.send(result);
}

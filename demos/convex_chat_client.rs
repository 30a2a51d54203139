//! Walks through a chat-room session against an in-memory mock transport:
//! subscribing to a message list, sending a message with an optimistic
//! update visible before the round trip completes, and riding out a dropped
//! connection until the reconnect submachine schedules a retry.
//!
//! This drives the engine pieces ([`ConnectionManager`], [`OptimisticEngine`],
//! [`SubscriptionRegistry`]) directly rather than through `SyncClient`, the
//! same level `syncline::connection`'s own unit tests operate at, since
//! there's no bundled server to subscribe against.
//!
//! cargo run --example convex_chat_client --features testing

use colored::Colorize;
use maplit::btreemap;
use syncline::{
    codec,
    connection::{
        ConnectionConfig,
        ConnectionManager,
        FakeTransport,
        ReconnectConfig,
        SendOutcome,
        Transport,
        TransportEvent,
        WireMessage,
    },
    optimistic::{
        ApplyOptions,
        OptimisticEngine,
    },
    subscription::{
        SubscribeOptions,
        SubscriptionRegistry,
    },
    sync_types::{
        ClientMessage,
        IdGenerator,
    },
    Value,
};
use tokio::sync::mpsc;
use url::Url;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let mut ids = IdGenerator::new();
    let mut connection = ConnectionManager::new(
        ConnectionConfig {
            reconnect: true,
            ..ConnectionConfig::default()
        },
        ReconnectConfig::default(),
    );
    let mut registry = SubscriptionRegistry::new();
    let mut optimistic = OptimisticEngine::new();

    registry.on_subscribe(|id| println!("{}", format!("subscribed #{id}").blue()));

    let messages_query = "messages:list";
    let now = 0i64;
    let subscription_id = registry.subscribe(
        messages_query,
        Value::object(vec![]),
        |value| println!("{}", format!("messages:list -> {value:?}").yellow()),
        SubscribeOptions::default(),
        now,
    )?;

    let (events_tx, mut events_rx) = mpsc::channel(16);
    let url = Url::parse("wss://chat.example.test/sync")?;
    let mut transport = FakeTransport::open(&url, events_tx, &[]).await?;

    connection.connect(now)?;
    let Some(TransportEvent::Open) = events_rx.recv().await else {
        anyhow::bail!("transport did not open");
    };
    let (flushed, _restore) = connection.on_open(now);
    debug_assert!(flushed.is_empty());
    println!("{}", "connected".green().bold());

    send(
        &mut connection,
        &mut transport,
        &ClientMessage::Subscribe {
            request_id: ids.next_request_id(),
            query_id: ids.next_query_id(),
            query: messages_query.parse()?,
            args: codec::encode(&Value::object(vec![]))?,
            journal: None,
        },
    )
    .await?;

    // Optimistic send: the UI sees the new message immediately, before the
    // server has acknowledged the mutation.
    let author = "Ali".to_string();
    let body = "hi from the mock transport".to_string();
    let mutation_args = Value::object(btreemap! {
        "author".to_string() => Value::from(author.clone()),
        "body".to_string() => Value::from(body.clone()),
    });
    let optimistic_id = optimistic.apply(
        "messages:send",
        mutation_args.clone(),
        move |current, _args| {
            let mut history = current.as_array().cloned().unwrap_or_default();
            history.push_back(Value::object(vec![
                ("author".to_string(), Value::from(author.clone())),
                ("body".to_string(), Value::from(body.clone())),
            ]));
            Ok(Value::Array(history))
        },
        ApplyOptions::default(),
        now,
    );
    let optimistic_view = optimistic
        .get_optimistic_data(&Value::array(vec![]), false)
        .unwrap_or_else(|_| Value::array(vec![]));
    registry.update_subscription(subscription_id, optimistic_view, false, now);

    send(
        &mut connection,
        &mut transport,
        &ClientMessage::Mutation {
            request_id: ids.next_request_id(),
            mutation: "messages:send".parse()?,
            args: codec::encode(&mutation_args)?,
        },
    )
    .await?;
    println!("{}", "mutation sent, confirming locally".cyan());
    optimistic.confirm(optimistic_id);

    // Now the connection drops abnormally; the reconnect submachine takes
    // over rather than the worker retrying ad hoc.
    let disconnected_at = now + 50;
    transport.close(1006, Some("connection reset".to_string())).await;
    let Some(TransportEvent::Close { code, reason }) = events_rx.recv().await else {
        anyhow::bail!("expected a close event");
    };
    match connection.on_close(code, reason, disconnected_at) {
        Some(delay_ms) => {
            let status = connection.reconnect().status(disconnected_at);
            println!(
                "{}",
                format!("disconnected; reconnecting in {delay_ms}ms (attempt {})", status.attempt)
                    .red()
                    .bold()
            );
        },
        None => println!("{}", "disconnected; reconnect not scheduled".red()),
    }

    Ok(())
}

async fn send(
    connection: &mut ConnectionManager,
    transport: &mut FakeTransport,
    message: &ClientMessage,
) -> anyhow::Result<()> {
    let encoded = serde_json::to_string(message)?;
    match connection.send(WireMessage::Text(encoded))? {
        SendOutcome::Send(wire) => {
            transport.send(wire).await?;
        },
        SendOutcome::Queued => {
            println!("{}", "not connected yet, message queued".yellow());
        },
    }
    Ok(())
}

//! Stream wrappers handed back to callers: one per live query
//! ([`QuerySubscription`]) and one over the whole consistent query set
//! ([`QuerySetSubscription`]), in the same relationship the teacher's
//! `QuerySubscription`/`QuerySetSubscription` have to its `watch_sender`
//! broadcast channel.

use std::{
    pin::Pin,
    task::{
        Context,
        Poll,
    },
};

use futures::Stream;
use imbl::OrdMap;
use tokio::sync::mpsc;
use tokio_stream::wrappers::{
    BroadcastStream,
    WatchStream,
};

use crate::{
    subscription::SubscriptionId,
    value::Value,
};

/// The outcome of a query or mutation/action call: either its return value
/// or a typed failure with optional structured error data (spec §6
/// `queryResult`/`mutationResult`/`actionResult`/`error`).
#[derive(Debug, Clone, PartialEq)]
pub enum FunctionResult {
    Value(Value),
    Error { message: String, data: Option<Value> },
}

/// A consistent snapshot of every tracked query's latest result, keyed by
/// subscription id. Copy-on-write via `imbl::OrdMap`, matching the
/// teacher's `QueryResults` mapping.
pub type QuerySetUpdate = OrdMap<SubscriptionId, FunctionResult>;

pub(crate) enum WorkerCommand {
    Unsubscribe { id: SubscriptionId },
}

/// A single live query. Yields a new [`FunctionResult`] each time the query
/// produces a new result; unsubscribes automatically on drop.
pub struct QuerySubscription {
    id: SubscriptionId,
    stream: WatchStream<FunctionResult>,
    command_sender: mpsc::UnboundedSender<WorkerCommand>,
}

impl QuerySubscription {
    pub(crate) fn new(
        id: SubscriptionId,
        stream: WatchStream<FunctionResult>,
        command_sender: mpsc::UnboundedSender<WorkerCommand>,
    ) -> Self {
        Self {
            id,
            stream,
            command_sender,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }
}

impl Stream for QuerySubscription {
    type Item = FunctionResult;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_next(cx)
    }
}

impl Drop for QuerySubscription {
    fn drop(&mut self) {
        let _ = self.command_sender.send(WorkerCommand::Unsubscribe { id: self.id });
    }
}

/// A view over every tracked query at once; each item is a consistent
/// snapshot across all of them (spec §4.4, connection manager's batched
/// `transition` messages).
pub struct QuerySetSubscription {
    stream: BroadcastStream<QuerySetUpdate>,
}

impl QuerySetSubscription {
    pub(crate) fn new(stream: BroadcastStream<QuerySetUpdate>) -> Self {
        Self { stream }
    }
}

impl Stream for QuerySetSubscription {
    type Item = Result<QuerySetUpdate, tokio_stream::wrappers::errors::BroadcastStreamRecvError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        Pin::new(&mut this.stream).poll_next(cx)
    }
}

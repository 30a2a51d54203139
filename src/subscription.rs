//! Tracks the lifecycle of every live query subscription, deduplicates
//! identical `(query, args)` pairs, and fans data/error updates out to
//! per-subscription callbacks (spec §4.4).

use std::collections::{
    HashMap,
    HashSet,
};

use crate::{
    error::SubscriptionError,
    guard::guard,
    value::{
        Timestamp,
        Value,
    },
};

pub type SubscriptionId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SubscriptionState {
    Pending,
    Active,
    Error,
    Closed,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SubscribeOptions {
    /// Skip the callback invocation exactly once, for the first
    /// `update_subscription(.., is_initial: true)` call.
    pub skip_initial_callback: bool,
    /// Retain every value seen by `update_subscription` in `history()`.
    pub track_history: bool,
}

/// Registry-wide knobs (spec §6 "Configuration surface", `maxSubscriptions`/
/// `deduplicateSubscriptions").
#[derive(Debug, Clone, Copy)]
pub struct SubscriptionConfig {
    /// `None` means uncapped.
    pub max_subscriptions: Option<usize>,
    /// When false, every `subscribe` call gets its own dedup bucket of one,
    /// so `query_ref_count`/`has_active_query`/`update_by_query` no longer
    /// fan out across calls sharing the same `(query, args)`.
    pub deduplicate: bool,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            max_subscriptions: None,
            deduplicate: true,
        }
    }
}

type DataCallback = Box<dyn Fn(&Value) + Send + Sync>;
type ErrorCallback = Box<dyn Fn(&str) + Send + Sync>;
type IdHook = Box<dyn Fn(SubscriptionId) + Send + Sync>;

struct Subscription {
    query: String,
    args: Value,
    /// `None` when deduplication is disabled for this registry, in which
    /// case this subscription never joins a `dedup_buckets` entry.
    bucket_key: Option<String>,
    state: SubscriptionState,
    data: Option<Value>,
    last_error: Option<String>,
    created_at: Timestamp,
    updated_at: Timestamp,
    history: Option<Vec<Value>>,
    skip_initial_callback: bool,
    skip_pending: bool,
    callback: DataCallback,
    error_callback: Option<ErrorCallback>,
}

/// A digest of `(query, args)` used to dedup identical subscriptions (spec
/// §4.4 "Identity hash"). Canonical-JSON equality rather than a
/// cryptographic hash: collisions are impossible as long as the encoder is
/// deterministic, and we already have a deterministic encoder in `codec`.
pub fn identity_key(query: &str, args: &Value) -> String {
    let encoded = crate::codec::encode(args).unwrap_or(serde_json::Value::Null);
    format!("{query}\u{0}{encoded}")
}

/// Registers and tracks query subscriptions. See module docs (spec §4.4).
#[derive(Default)]
pub struct SubscriptionRegistry {
    config: SubscriptionConfig,
    subscriptions: HashMap<SubscriptionId, Subscription>,
    dedup_buckets: HashMap<String, HashSet<SubscriptionId>>,
    next_id: SubscriptionId,
    disposed: bool,
    on_subscribe: Vec<IdHook>,
    on_unsubscribe: Vec<IdHook>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: SubscriptionConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn on_subscribe(&mut self, hook: impl Fn(SubscriptionId) + Send + Sync + 'static) {
        self.on_subscribe.push(Box::new(hook));
    }

    pub fn on_unsubscribe(&mut self, hook: impl Fn(SubscriptionId) + Send + Sync + 'static) {
        self.on_unsubscribe.push(Box::new(hook));
    }

    pub fn subscribe(
        &mut self,
        query: impl Into<String>,
        args: Value,
        callback: impl Fn(&Value) + Send + Sync + 'static,
        options: SubscribeOptions,
        now: Timestamp,
    ) -> Result<SubscriptionId, SubscriptionError> {
        if self.disposed {
            return Err(SubscriptionError::ManagerDisposed);
        }
        if let Some(max) = self.config.max_subscriptions {
            if self.subscriptions.len() >= max {
                return Err(SubscriptionError::TooManySubscriptions { max });
            }
        }
        let query = query.into();
        let bucket_key = self.config.deduplicate.then(|| identity_key(&query, &args));
        let id = self.next_id;
        self.next_id += 1;

        self.subscriptions.insert(
            id,
            Subscription {
                query,
                args,
                bucket_key: bucket_key.clone(),
                state: SubscriptionState::Pending,
                data: None,
                last_error: None,
                created_at: now,
                updated_at: now,
                history: options.track_history.then(Vec::new),
                skip_initial_callback: options.skip_initial_callback,
                skip_pending: options.skip_initial_callback,
                callback: Box::new(callback),
                error_callback: None,
            },
        );
        if let Some(key) = bucket_key {
            self.dedup_buckets.entry(key).or_default().insert(id);
        }

        for hook in &self.on_subscribe {
            guard(|| hook(id));
        }
        Ok(id)
    }

    pub fn set_error_callback(&mut self, id: SubscriptionId, callback: impl Fn(&str) + Send + Sync + 'static) {
        if let Some(sub) = self.subscriptions.get_mut(&id) {
            sub.error_callback = Some(Box::new(callback));
        }
    }

    /// Idempotent: a second call on an already-closed id returns `false`.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        if sub.state == SubscriptionState::Closed {
            return false;
        }
        sub.state = SubscriptionState::Closed;
        if let Some(key) = &sub.bucket_key {
            if let Some(bucket) = self.dedup_buckets.get_mut(key) {
                bucket.remove(&id);
                if bucket.is_empty() {
                    self.dedup_buckets.remove(key);
                }
            }
        }
        for hook in &self.on_unsubscribe {
            guard(|| hook(id));
        }
        true
    }

    pub fn unsubscribe_all(&mut self) -> usize {
        let ids: Vec<_> = self.subscriptions.keys().copied().collect();
        ids.into_iter().filter(|id| self.unsubscribe(*id)).count()
    }

    pub fn unsubscribe_by_query(&mut self, query: &str) -> usize {
        let ids: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, s)| s.query == query)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter(|id| self.unsubscribe(*id)).count()
    }

    /// No-op on a closed subscription. Consumes `skip_initial_callback`
    /// exactly once: the stored data is updated but the callback is
    /// skipped only the first time `is_initial` holds.
    pub fn update_subscription(&mut self, id: SubscriptionId, data: Value, is_initial: bool, timestamp: Timestamp) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        if sub.state == SubscriptionState::Closed {
            return false;
        }
        sub.data = Some(data.clone());
        sub.updated_at = timestamp;
        sub.state = SubscriptionState::Active;
        sub.last_error = None;
        if let Some(history) = &mut sub.history {
            history.push(data.clone());
        }

        let skip = is_initial && sub.skip_initial_callback && sub.skip_pending;
        if skip {
            sub.skip_pending = false;
            return true;
        }
        guard(|| (sub.callback)(&data));
        true
    }

    pub fn set_subscription_error(&mut self, id: SubscriptionId, error: impl Into<String>) -> bool {
        let Some(sub) = self.subscriptions.get_mut(&id) else {
            return false;
        };
        if sub.state == SubscriptionState::Closed {
            return false;
        }
        let error = error.into();
        sub.last_error = Some(error.clone());
        sub.state = SubscriptionState::Error;
        if let Some(callback) = &sub.error_callback {
            guard(|| callback(&error));
        }
        true
    }

    pub fn state(&self, id: SubscriptionId) -> Option<SubscriptionState> {
        self.subscriptions.get(&id).map(|s| s.state)
    }

    pub fn data(&self, id: SubscriptionId) -> Option<&Value> {
        self.subscriptions.get(&id).and_then(|s| s.data.as_ref())
    }

    pub fn last_error(&self, id: SubscriptionId) -> Option<&str> {
        self.subscriptions.get(&id).and_then(|s| s.last_error.as_deref())
    }

    pub fn created_at(&self, id: SubscriptionId) -> Option<Timestamp> {
        self.subscriptions.get(&id).map(|s| s.created_at)
    }

    pub fn updated_at(&self, id: SubscriptionId) -> Option<Timestamp> {
        self.subscriptions.get(&id).map(|s| s.updated_at)
    }

    pub fn history(&self, id: SubscriptionId) -> Option<&[Value]> {
        self.subscriptions.get(&id).and_then(|s| s.history.as_deref())
    }

    pub fn ids_by_query(&self, query: &str) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.query == query)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn ids_by_state(&self, state: SubscriptionState) -> Vec<SubscriptionId> {
        self.subscriptions
            .iter()
            .filter(|(_, s)| s.state == state)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn count(&self) -> usize {
        self.subscriptions.len()
    }

    pub fn count_by_state(&self, state: SubscriptionState) -> usize {
        self.subscriptions.values().filter(|s| s.state == state).count()
    }

    /// `getQueryRefCount`: the number of subscriptions sharing `(query,
    /// args)`'s identity digest (spec §4.4, invariant 5).
    pub fn query_ref_count(&self, query: &str, args: &Value) -> usize {
        self.dedup_buckets
            .get(&identity_key(query, args))
            .map_or(0, |bucket| bucket.len())
    }

    pub fn has_active_query(&self, query: &str, args: &Value) -> bool {
        self.dedup_buckets
            .get(&identity_key(query, args))
            .is_some_and(|bucket| {
                bucket
                    .iter()
                    .any(|id| self.state(*id) == Some(SubscriptionState::Active))
            })
    }

    /// Pushes `data` to every non-closed subscription sharing `(query,
    /// args)`'s identity digest.
    pub fn update_by_query(&mut self, query: &str, args: &Value, data: Value, timestamp: Timestamp) -> usize {
        let key = identity_key(query, args);
        let Some(ids) = self.dedup_buckets.get(&key).cloned() else {
            return 0;
        };
        ids.into_iter()
            .filter(|id| self.update_subscription(*id, data.clone(), false, timestamp))
            .count()
    }

    /// Idempotent: closes every live subscription, firing `on_unsubscribe`
    /// for each, then rejects subsequent `subscribe` calls.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }
        self.unsubscribe_all();
        self.subscriptions.clear();
        self.dedup_buckets.clear();
        self.disposed = true;
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{
            AtomicUsize,
            Ordering,
        },
        Arc,
    };

    use super::*;

    fn noop(_: &Value) {}

    #[test]
    fn invariant_4_states_are_mutually_exclusive_and_closed_absorbs() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry
            .subscribe("messages:list", Value::Null, noop, SubscribeOptions::default(), 0)
            .unwrap();
        assert_eq!(registry.state(id), Some(SubscriptionState::Pending));
        registry.update_subscription(id, Value::from(1.0), true, 0);
        assert_eq!(registry.state(id), Some(SubscriptionState::Active));
        registry.unsubscribe(id);
        assert_eq!(registry.state(id), Some(SubscriptionState::Closed));
        assert!(!registry.update_subscription(id, Value::from(2.0), false, 1));
        assert_eq!(registry.state(id), Some(SubscriptionState::Closed));
    }

    #[test]
    fn invariant_5_dedup_ref_count_matches_bucket_size() {
        let mut registry = SubscriptionRegistry::new();
        let q = "messages:list";
        let a = Value::from(1.0);
        let id1 = registry.subscribe(q, a.clone(), noop, SubscribeOptions::default(), 0).unwrap();
        let id2 = registry.subscribe(q, a.clone(), noop, SubscribeOptions::default(), 0).unwrap();
        assert_eq!(registry.query_ref_count(q, &a), 2);
        registry.unsubscribe(id1);
        assert_eq!(registry.query_ref_count(q, &a), 1);
        registry.unsubscribe(id2);
        assert_eq!(registry.query_ref_count(q, &a), 0);
    }

    #[test]
    fn invariant_9_closed_subscription_receives_no_further_callbacks() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut registry = SubscriptionRegistry::new();
        let id = registry
            .subscribe(
                "q",
                Value::Null,
                move |_| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                },
                SubscribeOptions::default(),
                0,
            )
            .unwrap();
        registry.update_subscription(id, Value::from(1.0), true, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        registry.unsubscribe(id);
        registry.update_subscription(id, Value::from(2.0), false, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn skip_initial_callback_consumed_exactly_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let mut registry = SubscriptionRegistry::new();
        let id = registry
            .subscribe(
                "q",
                Value::Null,
                move |_| {
                    calls2.fetch_add(1, Ordering::SeqCst);
                },
                SubscribeOptions {
                    skip_initial_callback: true,
                    track_history: false,
                },
                0,
            )
            .unwrap();
        registry.update_subscription(id, Value::from(1.0), true, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(registry.data(id), Some(&Value::from(1.0)));
        registry.update_subscription(id, Value::from(2.0), true, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscribe_after_dispose_fails() {
        let mut registry = SubscriptionRegistry::new();
        registry.dispose();
        assert_eq!(
            registry.subscribe("q", Value::Null, noop, SubscribeOptions::default(), 0),
            Err(SubscriptionError::ManagerDisposed)
        );
    }

    #[test]
    fn dispose_closes_every_subscription() {
        let mut registry = SubscriptionRegistry::new();
        registry.subscribe("q", Value::Null, noop, SubscribeOptions::default(), 0).unwrap();
        registry.subscribe("q2", Value::Null, noop, SubscribeOptions::default(), 0).unwrap();
        registry.dispose();
        assert_eq!(registry.count(), 0);
        registry.dispose(); // idempotent
    }

    #[test]
    fn update_by_query_fans_out_to_dedup_bucket() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        let calls3 = calls.clone();
        let mut registry = SubscriptionRegistry::new();
        let q = "q";
        let a = Value::Null;
        registry
            .subscribe(q, a.clone(), move |_| { calls2.fetch_add(1, Ordering::SeqCst); }, SubscribeOptions::default(), 0)
            .unwrap();
        registry
            .subscribe(q, a.clone(), move |_| { calls3.fetch_add(1, Ordering::SeqCst); }, SubscribeOptions::default(), 0)
            .unwrap();
        let updated = registry.update_by_query(q, &a, Value::from(1.0), 0);
        assert_eq!(updated, 2);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn set_subscription_error_transitions_to_error_state() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe("q", Value::Null, noop, SubscribeOptions::default(), 0).unwrap();
        assert!(registry.set_subscription_error(id, "boom"));
        assert_eq!(registry.state(id), Some(SubscriptionState::Error));
        assert_eq!(registry.last_error(id), Some("boom"));
    }

    #[test]
    fn created_at_is_stamped_at_subscribe_time_and_survives_updates() {
        let mut registry = SubscriptionRegistry::new();
        let id = registry.subscribe("q", Value::Null, noop, SubscribeOptions::default(), 5).unwrap();
        assert_eq!(registry.created_at(id), Some(5));
        registry.update_subscription(id, Value::from(1.0), true, 9);
        assert_eq!(registry.created_at(id), Some(5));
        assert_eq!(registry.updated_at(id), Some(9));
    }

    #[test]
    fn max_subscriptions_rejects_once_the_cap_is_reached() {
        let mut registry = SubscriptionRegistry::with_config(SubscriptionConfig {
            max_subscriptions: Some(1),
            deduplicate: true,
        });
        registry.subscribe("q", Value::Null, noop, SubscribeOptions::default(), 0).unwrap();
        assert_eq!(
            registry.subscribe("q2", Value::Null, noop, SubscribeOptions::default(), 0),
            Err(SubscriptionError::TooManySubscriptions { max: 1 })
        );
    }

    #[test]
    fn deduplicate_false_gives_every_subscription_its_own_ref_count() {
        let mut registry = SubscriptionRegistry::with_config(SubscriptionConfig {
            max_subscriptions: None,
            deduplicate: false,
        });
        let q = "q";
        let a = Value::Null;
        registry.subscribe(q, a.clone(), noop, SubscribeOptions::default(), 0).unwrap();
        registry.subscribe(q, a.clone(), noop, SubscribeOptions::default(), 0).unwrap();
        assert_eq!(registry.query_ref_count(q, &a), 0);
        assert_eq!(registry.update_by_query(q, &a, Value::from(1.0), 0), 0);
    }
}

//! Maintains the ordered list of locally-applied-but-not-yet-confirmed
//! mutations and folds them over a server snapshot to produce the
//! optimistic view the UI actually renders (spec §4.5).

use std::collections::{
    HashMap,
    HashSet,
};

use tracing::debug;

use crate::{
    guard::guard_with_default,
    value::{
        Timestamp,
        Value,
    },
};

pub type OptimisticUpdateId = u64;

/// Engine-wide knobs (spec §6 "Configuration surface", `maxPendingUpdates`/
/// `enableLogging").
#[derive(Debug, Clone, Copy)]
pub struct OptimisticConfig {
    /// `None` means uncapped; otherwise the oldest pending update is
    /// reverted to make room for a new `apply`.
    pub max_pending_updates: Option<usize>,
    pub enable_logging: bool,
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_pending_updates: None,
            enable_logging: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OptimisticStatus {
    Pending,
    InFlight,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// Identifies the transform function across a serialize/deserialize
    /// round trip (spec §4.5 "Transformation functions are not
    /// serializable").
    pub key: Option<String>,
    pub depends_on: Option<OptimisticUpdateId>,
    pub revert_on_error: bool,
}

pub enum OptimisticEvent {
    Applied(OptimisticUpdateId),
    Confirmed(OptimisticUpdateId),
    Reverted {
        id: OptimisticUpdateId,
        error: Option<String>,
    },
    Error {
        id: OptimisticUpdateId,
        message: String,
    },
}

/// A pending update's fold step: `(current_value, mutation_args) ->
/// next_value`, or an error message if it can't apply (spec §4.5).
pub type OptimisticTransform = Box<dyn Fn(&Value, &Value) -> Result<Value, String> + Send + Sync>;
type Transform = OptimisticTransform;
type Listener = Box<dyn Fn(&OptimisticEvent) + Send + Sync>;

struct Update {
    mutation: String,
    args: Value,
    transform: Transform,
    status: OptimisticStatus,
    order: u64,
    applied_at: Timestamp,
    key: Option<String>,
    depends_on: Option<OptimisticUpdateId>,
    revert_on_error: bool,
    errored: bool,
}

/// A transform-free snapshot of one pending update, used by
/// [`OptimisticEngine::serialize`]/[`OptimisticEngine::deserialize`].
/// Transform functions can't round-trip; a caller rebuilding from this must
/// supply one via `key`, or accept the identity default.
#[derive(Debug, Clone, PartialEq)]
pub struct SerializedUpdate {
    pub id: OptimisticUpdateId,
    pub mutation: String,
    pub args: Value,
    pub status: OptimisticStatus,
    pub order: u64,
    pub applied_at: Timestamp,
    pub key: Option<String>,
    pub depends_on: Option<OptimisticUpdateId>,
    pub revert_on_error: bool,
}

/// Tracks pending optimistic mutations and folds them over server data
/// (spec §4.5).
#[derive(Default)]
pub struct OptimisticEngine {
    config: OptimisticConfig,
    updates: HashMap<OptimisticUpdateId, Update>,
    /// Insertion order by id, kept separately from `updates` so eviction
    /// (confirm/revert) doesn't need a full re-sort to preserve ordering.
    order: Vec<OptimisticUpdateId>,
    next_id: OptimisticUpdateId,
    counter: u64,
    listeners: Vec<Listener>,
}

impl OptimisticEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: OptimisticConfig) -> Self {
        Self {
            config,
            ..Self::default()
        }
    }

    pub fn on_event(&mut self, listener: impl Fn(&OptimisticEvent) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    fn emit(&self, event: OptimisticEvent) {
        for listener in &self.listeners {
            guard_with_default((), || listener(&event));
        }
    }

    pub fn apply(
        &mut self,
        mutation: impl Into<String>,
        args: Value,
        transform: impl Fn(&Value, &Value) -> Result<Value, String> + Send + Sync + 'static,
        options: ApplyOptions,
        now: Timestamp,
    ) -> OptimisticUpdateId {
        let mutation = mutation.into();

        if let Some(max) = self.config.max_pending_updates {
            if self.updates.len() >= max {
                if let Some(oldest) = self.pending_ids().first().copied() {
                    if self.config.enable_logging {
                        debug!(id = oldest, max, "evicting oldest pending update to honor max_pending_updates");
                    }
                    self.revert(oldest, Some("evicted: max_pending_updates reached".to_string()));
                }
            }
        }

        let id = self.next_id;
        self.next_id += 1;
        let order = self.counter;
        self.counter += 1;

        if self.config.enable_logging {
            debug!(id, mutation = %mutation, "applying optimistic update");
        }

        self.updates.insert(
            id,
            Update {
                mutation,
                args,
                transform: Box::new(transform),
                status: OptimisticStatus::Pending,
                order,
                applied_at: now,
                key: options.key,
                depends_on: options.depends_on,
                revert_on_error: options.revert_on_error,
                errored: false,
            },
        );
        self.order.push(id);
        self.emit(OptimisticEvent::Applied(id));
        id
    }

    /// Pending → InFlight only; no other transition is supported.
    pub fn mark_in_flight(&mut self, id: OptimisticUpdateId) -> bool {
        match self.updates.get_mut(&id) {
            Some(update) if update.status == OptimisticStatus::Pending => {
                update.status = OptimisticStatus::InFlight;
                true
            },
            _ => false,
        }
    }

    pub fn confirm(&mut self, id: OptimisticUpdateId) -> bool {
        if self.updates.remove(&id).is_none() {
            return false;
        }
        self.order.retain(|existing| *existing != id);
        if self.config.enable_logging {
            debug!(id, "confirming optimistic update");
        }
        self.emit(OptimisticEvent::Confirmed(id));
        true
    }

    /// Reverts `id` and every update (transitively) depending on it, in
    /// reverse accumulation order so children are removed before parents.
    pub fn revert(&mut self, id: OptimisticUpdateId, error: Option<String>) -> bool {
        if !self.updates.contains_key(&id) {
            return false;
        }
        let mut visited = HashSet::new();
        let mut stack = vec![id];
        let mut accumulated = Vec::new();
        while let Some(current) = stack.pop() {
            if !visited.insert(current) {
                continue;
            }
            accumulated.push(current);
            for (other_id, update) in &self.updates {
                if update.depends_on == Some(current) {
                    stack.push(*other_id);
                }
            }
        }
        for revert_id in accumulated.into_iter().rev() {
            self.updates.remove(&revert_id);
            self.order.retain(|existing| *existing != revert_id);
            if self.config.enable_logging {
                debug!(id = revert_id, error = ?error, "reverting optimistic update");
            }
            self.emit(OptimisticEvent::Reverted {
                id: revert_id,
                error: error.clone(),
            });
        }
        true
    }

    pub fn revert_all(&mut self) -> usize {
        let ids: Vec<_> = self.order.clone();
        let count = ids.len();
        for id in ids {
            if self.updates.contains_key(&id) {
                self.revert(id, None);
            }
        }
        count
    }

    /// Folds every non-errored pending update over `server_data` in
    /// ascending `order`. A throwing transform marks its update errored
    /// (skipped by future calls), emits an error event, and either aborts
    /// (if `revert_on_error` is false and `throw_on_error` is set) or is
    /// skipped and folding continues.
    pub fn get_optimistic_data(&mut self, server_data: &Value, throw_on_error: bool) -> Result<Value, String> {
        let mut ordered_ids = self.order.clone();
        ordered_ids.sort_by_key(|id| self.updates.get(id).map(|u| u.order).unwrap_or(u64::MAX));

        let mut data = server_data.clone();
        for id in ordered_ids {
            let Some(update) = self.updates.get(&id) else {
                continue;
            };
            if update.errored {
                continue;
            }
            match (update.transform)(&data, &update.args) {
                Ok(next) => data = next,
                Err(message) => {
                    let revert_on_error = update.revert_on_error;
                    if let Some(update) = self.updates.get_mut(&id) {
                        update.errored = true;
                    }
                    self.emit(OptimisticEvent::Error {
                        id,
                        message: message.clone(),
                    });
                    if !revert_on_error && throw_on_error {
                        return Err(message);
                    }
                },
            }
        }
        Ok(data)
    }

    pub fn pending_ids(&self) -> Vec<OptimisticUpdateId> {
        let mut ids = self.order.clone();
        ids.sort_by_key(|id| self.updates.get(id).map(|u| u.order).unwrap_or(u64::MAX));
        ids
    }

    pub fn status(&self, id: OptimisticUpdateId) -> Option<OptimisticStatus> {
        self.updates.get(&id).map(|u| u.status)
    }

    pub fn serialize(&self) -> Vec<SerializedUpdate> {
        let mut ids = self.order.clone();
        ids.sort_by_key(|id| self.updates.get(id).map(|u| u.order).unwrap_or(u64::MAX));
        ids.into_iter()
            .filter_map(|id| {
                let update = self.updates.get(&id)?;
                Some(SerializedUpdate {
                    id,
                    mutation: update.mutation.clone(),
                    args: update.args.clone(),
                    status: update.status,
                    order: update.order,
                    applied_at: update.applied_at,
                    key: update.key.clone(),
                    depends_on: update.depends_on,
                    revert_on_error: update.revert_on_error,
                })
            })
            .collect()
    }

    /// Rebuilds from [`Self::serialize`]'s output. `fn_map` supplies
    /// transform functions keyed by the update's `key`; an update with no
    /// matching entry (or no key at all) gets the identity transform. The
    /// monotonic order counter is seeded to `max(order) + 1` so freshly
    /// `apply`d updates sort after every restored one.
    pub fn deserialize(
        entries: Vec<SerializedUpdate>,
        mut fn_map: HashMap<String, Transform>,
    ) -> Self {
        let mut engine = Self::new();
        let mut max_order = 0;
        let mut max_id = 0;
        for entry in entries {
            max_order = max_order.max(entry.order + 1);
            max_id = max_id.max(entry.id + 1);
            let transform = entry
                .key
                .as_ref()
                .and_then(|k| fn_map.remove(k))
                .unwrap_or_else(|| Box::new(|current: &Value, _args: &Value| Ok(current.clone())));
            engine.updates.insert(
                entry.id,
                Update {
                    mutation: entry.mutation,
                    args: entry.args,
                    transform,
                    status: entry.status,
                    order: entry.order,
                    applied_at: entry.applied_at,
                    key: entry.key,
                    depends_on: entry.depends_on,
                    revert_on_error: entry.revert_on_error,
                    errored: false,
                },
            );
            engine.order.push(entry.id);
        }
        engine.counter = max_order;
        engine.next_id = max_id;
        engine
    }
}

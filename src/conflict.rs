//! Detects and resolves conflicts between a pending local change and the
//! server's authoritative state for the same document (spec §4.3).

use std::{
    future::Future,
    pin::Pin,
};

use imbl::OrdMap;

use crate::{
    error::ConflictError,
    guard::{
        guard,
        guard_with_default,
    },
    value::Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConflictType {
    FieldConflict,
    DeleteUpdate,
    UpdateDelete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Strategy {
    ServerWins,
    ClientWins,
    Merge,
    Manual,
}

impl Strategy {
    pub fn parse(s: &str) -> Result<Self, ConflictError> {
        match s {
            "server-wins" => Ok(Strategy::ServerWins),
            "client-wins" => Ok(Strategy::ClientWins),
            "merge" => Ok(Strategy::Merge),
            "manual" => Ok(Strategy::Manual),
            other => Err(ConflictError::InvalidStrategy(other.to_string())),
        }
    }
}

/// A document's side of a conflict: either it was deleted locally/by the
/// server, or it carries a field map at a given version and timestamp.
#[derive(Debug, Clone, PartialEq)]
pub enum DocumentState {
    Deleted,
    Present {
        fields: OrdMap<String, Value>,
        version: i64,
        /// When this side of the document was last written, if known (spec
        /// §3 Conflict "both timestamps").
        timestamp: Option<crate::value::Timestamp>,
    },
}

impl DocumentState {
    pub fn version(&self) -> i64 {
        match self {
            DocumentState::Deleted => 0,
            DocumentState::Present { version, .. } => *version,
        }
    }

    pub fn timestamp(&self) -> Option<crate::value::Timestamp> {
        match self {
            DocumentState::Deleted => None,
            DocumentState::Present { timestamp, .. } => *timestamp,
        }
    }

    fn fields(&self) -> Option<&OrdMap<String, Value>> {
        match self {
            DocumentState::Deleted => None,
            DocumentState::Present { fields, .. } => Some(fields),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub table: String,
    pub document_id: String,
    pub conflict_type: ConflictType,
    /// server.version − local.version.
    pub version_diff: i64,
    /// True iff `version_diff > 1`: the local copy is more than one version
    /// behind, i.e. it missed at least one intervening server write.
    pub is_local_stale: bool,
    /// Field names present on both sides whose values diverge — empty for
    /// `DeleteUpdate`/`UpdateDelete` conflicts, where there's no field map
    /// to compare (spec §3 Conflict "field conflicts").
    pub conflicting_fields: Vec<String>,
    pub local: DocumentState,
    pub server: DocumentState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// `None` only when the resolved outcome is a delete.
    pub fields: Option<OrdMap<String, Value>>,
    pub version: i64,
    pub strategy: Strategy,
    /// Field names taken verbatim from one side during a merge (present on
    /// only one of local/server).
    pub merged_fields: Vec<String>,
}

type BumpFn = Box<dyn Fn(i64) -> i64 + Send + Sync>;
type ConflictListener = Box<dyn Fn(&Conflict) + Send + Sync>;
type CustomResolver =
    Box<dyn Fn(&DocumentState, &DocumentState) -> Result<Resolution, ConflictError> + Send + Sync>;
type ManualHandler = Box<dyn Fn(&Conflict) -> Resolution + Send + Sync>;
type AsyncManualHandler =
    Box<dyn Fn(&Conflict) -> Pin<Box<dyn Future<Output = Resolution> + Send>> + Send + Sync>;

enum ManualMode {
    Sync(ManualHandler),
    Async(AsyncManualHandler),
}

/// A version bump function, applied to the server's version when a
/// resolution supersedes it (spec §6 "Configuration surface",
/// `versionGenerator`). Same shape as [`ConflictResolver::set_bump`]; exists
/// as a config-object field so a resolver can be fully described by one
/// `ConflictConfig` value instead of a constructor plus a setter call.
pub type VersionGenerator = Box<dyn Fn(i64) -> i64 + Send + Sync>;

/// Construction-time knobs for [`ConflictResolver`] (spec §6 "Configuration
/// surface", `defaultStrategy`/`versionGenerator`).
pub struct ConflictConfig {
    pub default_strategy: Strategy,
    /// `None` keeps the resolver's built-in `|v| v + 1` bump.
    pub version_generator: Option<VersionGenerator>,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::ServerWins,
            version_generator: None,
        }
    }
}

/// Detects conflicts between local and server document state and resolves
/// them according to a default strategy, an optional custom resolver, and a
/// per-`(table, field)` override table (spec §4.3).
pub struct ConflictResolver {
    default_strategy: Strategy,
    bump: BumpFn,
    custom_resolver: Option<CustomResolver>,
    manual_handler: Option<ManualMode>,
    field_strategies: OrdMap<String, OrdMap<String, Strategy>>,
    listeners: Vec<ConflictListener>,
}

impl Default for ConflictResolver {
    fn default() -> Self {
        Self {
            default_strategy: Strategy::ServerWins,
            bump: Box::new(|v| v + 1),
            custom_resolver: None,
            manual_handler: None,
            field_strategies: OrdMap::new(),
            listeners: Vec::new(),
        }
    }
}

impl ConflictResolver {
    pub fn new(default_strategy: Strategy) -> Self {
        Self {
            default_strategy,
            ..Self::default()
        }
    }

    pub fn with_config(config: ConflictConfig) -> Self {
        Self {
            default_strategy: config.default_strategy,
            bump: config.version_generator.unwrap_or_else(|| Box::new(|v| v + 1)),
            ..Self::default()
        }
    }

    pub fn set_bump(&mut self, bump: impl Fn(i64) -> i64 + Send + Sync + 'static) {
        self.bump = Box::new(bump);
    }

    pub fn set_custom_resolver(
        &mut self,
        resolver: impl Fn(&DocumentState, &DocumentState) -> Result<Resolution, ConflictError>
            + Send
            + Sync
            + 'static,
    ) {
        self.custom_resolver = Some(Box::new(resolver));
    }

    pub fn set_manual_handler(&mut self, handler: impl Fn(&Conflict) -> Resolution + Send + Sync + 'static) {
        self.manual_handler = Some(ManualMode::Sync(Box::new(handler)));
    }

    pub fn set_manual_handler_async<F>(&mut self, handler: impl Fn(&Conflict) -> F + Send + Sync + 'static)
    where
        F: Future<Output = Resolution> + Send + 'static,
    {
        self.manual_handler = Some(ManualMode::Async(Box::new(move |conflict| Box::pin(handler(conflict)))));
    }

    pub fn on_conflict(&mut self, listener: impl Fn(&Conflict) + Send + Sync + 'static) {
        self.listeners.push(Box::new(listener));
    }

    pub fn set_field_strategy(&mut self, table: impl Into<String>, field: impl Into<String>, strategy: Strategy) {
        self.field_strategies
            .entry(table.into())
            .or_insert_with(OrdMap::new)
            .insert(field.into(), strategy);
    }

    pub fn clear_field_strategy(&mut self, table: &str, field: &str) {
        if let Some(fields) = self.field_strategies.get_mut(table) {
            fields.remove(field);
        }
    }

    pub fn clear_all_field_strategies(&mut self) {
        self.field_strategies.clear();
    }

    /// Falls back to the resolver's default strategy when no per-field
    /// override is set (spec §4.3 "Per-field strategy store").
    pub fn field_strategy(&self, table: &str, field: &str) -> Strategy {
        self.field_strategies
            .get(table)
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or(self.default_strategy)
    }

    /// Detects a conflict between `local` and `server`, notifying listeners
    /// iff one is found. Returns `None` for a Delete/Delete pair or a field
    /// set with no divergent keys.
    pub fn detect(
        &self,
        table: impl Into<String>,
        document_id: impl Into<String>,
        local: DocumentState,
        server: DocumentState,
    ) -> Option<Conflict> {
        let (conflict_type, conflicting_fields) = match (&local, &server) {
            (DocumentState::Deleted, DocumentState::Deleted) => return None,
            (DocumentState::Deleted, DocumentState::Present { .. }) => (ConflictType::DeleteUpdate, Vec::new()),
            (DocumentState::Present { .. }, DocumentState::Deleted) => (ConflictType::UpdateDelete, Vec::new()),
            (DocumentState::Present { fields: lf, .. }, DocumentState::Present { fields: sf, .. }) => {
                let conflicting: Vec<String> = lf
                    .keys()
                    .filter(|k| sf.get(*k).is_some_and(|sv| lf.get(*k) != Some(sv)))
                    .cloned()
                    .collect();
                if conflicting.is_empty() {
                    return None;
                }
                (ConflictType::FieldConflict, conflicting)
            },
        };

        let version_diff = server.version() - local.version();
        let conflict = Conflict {
            table: table.into(),
            document_id: document_id.into(),
            conflict_type,
            version_diff,
            is_local_stale: version_diff > 1,
            conflicting_fields,
            local,
            server,
        };
        for listener in &self.listeners {
            guard(|| listener(&conflict));
        }
        Some(conflict)
    }

    /// Resolves a conflict using the resolver's default strategy, its
    /// custom resolver if one is configured, or the per-field overrides
    /// when the strategy is `merge`.
    pub fn resolve(&self, conflict: &Conflict) -> Result<Resolution, ConflictError> {
        if let Some(custom) = &self.custom_resolver {
            let resolution = guard_with_default(
                Err(ConflictError::ResolverFailed("custom resolver panicked".to_string())),
                || custom(&conflict.local, &conflict.server),
            )?;
            if conflict.conflict_type == ConflictType::FieldConflict && resolution.fields.is_none() {
                return Err(ConflictError::InvalidResolverShape);
            }
            return Ok(resolution);
        }
        self.resolve_with_strategy(conflict, self.default_strategy)
    }

    pub fn resolve_with_strategy(
        &self,
        conflict: &Conflict,
        strategy: Strategy,
    ) -> Result<Resolution, ConflictError> {
        use ConflictType::*;
        match (conflict.conflict_type, strategy) {
            (DeleteUpdate | UpdateDelete, Strategy::ClientWins) => Ok(Resolution {
                fields: conflict.local.fields().cloned(),
                version: (self.bump)(conflict.server.version()),
                strategy,
                merged_fields: Vec::new(),
            }),
            (DeleteUpdate | UpdateDelete, _) => Ok(Resolution {
                fields: conflict.server.fields().cloned(),
                version: conflict.server.version(),
                strategy,
                merged_fields: Vec::new(),
            }),
            (FieldConflict, Strategy::ServerWins) => Ok(Resolution {
                fields: conflict.server.fields().cloned(),
                version: conflict.server.version(),
                strategy,
                merged_fields: Vec::new(),
            }),
            (FieldConflict, Strategy::ClientWins) => Ok(Resolution {
                fields: conflict.local.fields().cloned(),
                version: (self.bump)(conflict.server.version()),
                strategy,
                merged_fields: Vec::new(),
            }),
            (FieldConflict, Strategy::Merge) => Ok(self.merge(conflict)),
            (_, Strategy::Manual) => self.resolve_manual(conflict),
        }
    }

    fn merge(&self, conflict: &Conflict) -> Resolution {
        let local_fields = conflict.local.fields().cloned().unwrap_or_default();
        let server_fields = conflict.server.fields().cloned().unwrap_or_default();
        let mut merged = OrdMap::new();
        let mut merged_fields = Vec::new();

        for (key, local_value) in local_fields.iter() {
            match server_fields.get(key) {
                Some(server_value) if local_value == server_value => {
                    merged.insert(key.clone(), local_value.clone());
                },
                Some(server_value) => {
                    let winner = match self.field_strategy(&conflict.table, key) {
                        Strategy::ClientWins => local_value.clone(),
                        _ => server_value.clone(),
                    };
                    merged.insert(key.clone(), winner);
                },
                None => {
                    merged.insert(key.clone(), local_value.clone());
                    merged_fields.push(key.clone());
                },
            }
        }
        for (key, server_value) in server_fields.iter() {
            if !local_fields.contains_key(key) {
                merged.insert(key.clone(), server_value.clone());
                merged_fields.push(key.clone());
            }
        }

        Resolution {
            fields: Some(merged),
            version: (self.bump)(conflict.server.version()),
            strategy: Strategy::Merge,
            merged_fields,
        }
    }

    fn resolve_manual(&self, conflict: &Conflict) -> Result<Resolution, ConflictError> {
        match &self.manual_handler {
            None => Err(ConflictError::ManualWithoutHandler),
            Some(ManualMode::Async(_)) => Err(ConflictError::AsyncHandlerRequiresResolveAsync),
            Some(ManualMode::Sync(handler)) => Ok(handler(conflict)),
        }
    }

    /// As [`Self::resolve`], but awaits an async manual handler when one is
    /// configured; falls back to [`Self::resolve`] for every other strategy.
    pub async fn resolve_async(&self, conflict: &Conflict) -> Result<Resolution, ConflictError> {
        if self.default_strategy == Strategy::Manual && self.custom_resolver.is_none() {
            return match &self.manual_handler {
                None => Err(ConflictError::ManualWithoutHandler),
                Some(ManualMode::Sync(handler)) => Ok(handler(conflict)),
                Some(ManualMode::Async(handler)) => Ok(handler(conflict).await),
            };
        }
        self.resolve(conflict)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn present(pairs: impl IntoIterator<Item = (&'static str, Value)>, version: i64) -> DocumentState {
        DocumentState::Present {
            fields: pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
            version,
            timestamp: None,
        }
    }

    #[test]
    fn s4_merge_with_per_field_client_wins_override() {
        let mut resolver = ConflictResolver::default();
        resolver.set_field_strategy("users", "name", Strategy::ClientWins);

        let local = present([("name", Value::from("AL")), ("email", Value::from("l@x"))], 1);
        let server = present([("name", Value::from("AS")), ("email", Value::from("s@x"))], 2);

        let conflict = resolver
            .detect("users", "doc1", local, server)
            .expect("field conflict expected");
        assert_eq!(conflict.conflict_type, ConflictType::FieldConflict);
        assert_eq!(conflict.version_diff, 1);
        assert!(!conflict.is_local_stale);
        assert_eq!(conflict.conflicting_fields, vec!["name".to_string()]);

        let resolution = resolver.resolve_with_strategy(&conflict, Strategy::Merge).unwrap();
        let fields = resolution.fields.unwrap();
        assert_eq!(fields.get("name"), Some(&Value::from("AL")));
        assert_eq!(fields.get("email"), Some(&Value::from("s@x")));
        assert_eq!(resolution.version, 3);
        assert_eq!(resolution.strategy, Strategy::Merge);
        assert!(resolution.merged_fields.is_empty());
    }

    #[test]
    fn delete_delete_is_not_a_conflict() {
        let resolver = ConflictResolver::default();
        assert!(resolver
            .detect("t", "d", DocumentState::Deleted, DocumentState::Deleted)
            .is_none());
    }

    #[test]
    fn identical_field_maps_are_not_a_conflict() {
        let resolver = ConflictResolver::default();
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(1.0))], 2);
        assert!(resolver.detect("t", "d", local, server).is_none());
    }

    #[test]
    fn is_local_stale_when_version_diff_exceeds_one() {
        let resolver = ConflictResolver::default();
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 5);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(conflict.version_diff, 4);
        assert!(conflict.is_local_stale);
    }

    #[test]
    fn delete_update_client_wins_preserves_local_delete() {
        let resolver = ConflictResolver::new(Strategy::ClientWins);
        let local = DocumentState::Deleted;
        let server = present([("a", Value::from(1.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(conflict.conflict_type, ConflictType::DeleteUpdate);
        assert!(conflict.conflicting_fields.is_empty());
        let resolution = resolver.resolve(&conflict).unwrap();
        assert!(resolution.fields.is_none());
        assert_eq!(resolution.version, 3);
    }

    #[test]
    fn document_state_timestamp_accessor() {
        let deleted = DocumentState::Deleted;
        assert_eq!(deleted.timestamp(), None);
        let present = DocumentState::Present {
            fields: OrdMap::new(),
            version: 1,
            timestamp: Some(1_700_000_000_000),
        };
        assert_eq!(present.timestamp(), Some(1_700_000_000_000));
    }

    #[test]
    fn manual_without_handler_errors() {
        let resolver = ConflictResolver::new(Strategy::Manual);
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(resolver.resolve(&conflict), Err(ConflictError::ManualWithoutHandler));
    }

    #[test]
    fn async_manual_handler_requires_resolve_async() {
        let mut resolver = ConflictResolver::new(Strategy::Manual);
        resolver.set_manual_handler_async(|_conflict| async { unreachable!() });
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(
            resolver.resolve(&conflict),
            Err(ConflictError::AsyncHandlerRequiresResolveAsync)
        );
    }

    #[test]
    fn per_field_strategy_falls_back_to_default() {
        let resolver = ConflictResolver::new(Strategy::ServerWins);
        assert_eq!(resolver.field_strategy("users", "name"), Strategy::ServerWins);
    }

    #[test]
    fn with_config_applies_default_strategy_and_version_generator() {
        let resolver = ConflictResolver::with_config(ConflictConfig {
            default_strategy: Strategy::ClientWins,
            version_generator: Some(Box::new(|v| v + 100)),
        });
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        let resolution = resolver.resolve(&conflict).unwrap();
        assert_eq!(resolution.strategy, Strategy::ClientWins);
        assert_eq!(resolution.version, 102);
    }

    #[test]
    fn custom_resolver_panic_is_caught_and_reported_as_resolver_failed() {
        let mut resolver = ConflictResolver::default();
        resolver.set_custom_resolver(|_local, _server| panic!("boom"));
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(
            resolver.resolve(&conflict),
            Err(ConflictError::ResolverFailed("custom resolver panicked".to_string()))
        );
    }

    #[test]
    fn custom_resolver_omitting_fields_on_a_field_conflict_is_invalid_shape() {
        let mut resolver = ConflictResolver::default();
        resolver.set_custom_resolver(|_local, _server| {
            Ok(Resolution {
                fields: None,
                version: 1,
                strategy: Strategy::Manual,
                merged_fields: Vec::new(),
            })
        });
        let local = present([("a", Value::from(1.0))], 1);
        let server = present([("a", Value::from(2.0))], 2);
        let conflict = resolver.detect("t", "d", local, server).unwrap();
        assert_eq!(resolver.resolve(&conflict), Err(ConflictError::InvalidResolverShape));
    }
}

//! Structural diffing between old/new value snapshots, and the
//! dependency-driven mapping from a change set to the query ids it should
//! invalidate (spec §4.2).

use std::{
    collections::HashSet,
    fmt,
};

use imbl::{
    OrdMap,
    Vector,
};

use crate::{
    guard::guard,
    value::Value,
};

/// One segment of a [`ChangePath`]: either an object key or a sequence
/// index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathSegment {
    Key(String),
    Index(usize),
}

impl fmt::Display for PathSegment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathSegment::Key(k) => write!(f, "{k}"),
            PathSegment::Index(i) => write!(f, "[{i}]"),
        }
    }
}

pub type ChangePath = Vec<PathSegment>;

fn path_to_key(path: &ChangePath) -> String {
    let mut out = String::new();
    for (i, segment) in path.iter().enumerate() {
        match segment {
            PathSegment::Key(k) => {
                if i > 0 {
                    out.push('.');
                }
                out.push_str(k);
            },
            PathSegment::Index(idx) => {
                out.push('[');
                out.push_str(&idx.to_string());
                out.push(']');
            },
        }
    }
    out
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChangeRecord {
    Added { path: ChangePath, value: Value },
    Removed { path: ChangePath, value: Value },
    Modified {
        path: ChangePath,
        old: Value,
        new: Value,
    },
}

impl ChangeRecord {
    pub fn path(&self) -> &ChangePath {
        match self {
            ChangeRecord::Added { path, .. }
            | ChangeRecord::Removed { path, .. }
            | ChangeRecord::Modified { path, .. } => path,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    pub added: Vec<ChangeRecord>,
    pub removed: Vec<ChangeRecord>,
    pub modified: Vec<ChangeRecord>,
    pub timestamp: crate::value::Timestamp,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    /// `getDiff`-style rendering: one entry per modification, keyed by the
    /// dotted/bracketed path, valued by `{old, new}` (spec S2).
    pub fn diff_map(&self) -> OrdMap<String, (Value, Value)> {
        self.modified
            .iter()
            .filter_map(|c| match c {
                ChangeRecord::Modified { path, old, new } => {
                    Some((path_to_key(path), (old.clone(), new.clone())))
                },
                _ => None,
            })
            .collect()
    }
}

/// A registered `(queryId, tables, fields)` triple used to map a change set
/// to the query ids it invalidates (spec §4.2 "Affected-query lookup").
#[derive(Debug, Clone)]
pub struct QueryDependency {
    pub query_id: String,
    pub table: String,
    /// Exact field names, dot-prefixes, or a trailing `prefix.*` wildcard.
    /// Empty means "any field under this table".
    pub fields: Vec<String>,
}

impl QueryDependency {
    fn matches_field(&self, field_path: &str) -> bool {
        if self.fields.is_empty() {
            return true;
        }
        self.fields.iter().any(|f| {
            if let Some(prefix) = f.strip_suffix(".*") {
                field_path == prefix || field_path.starts_with(&format!("{prefix}."))
            } else {
                field_path == f || field_path.starts_with(&format!("{f}."))
            }
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ChangeDetectorConfig {
    /// Field used to identify array elements for identity-based diffing.
    pub identity_field: &'static str,
    /// When false, sequence equality in [`has_changes`] is order-insensitive.
    pub track_array_order: bool,
}

impl Default for ChangeDetectorConfig {
    fn default() -> Self {
        Self {
            identity_field: "_id",
            track_array_order: true,
        }
    }
}

type ChangeListener = Box<dyn Fn(&ChangeSet) + Send + Sync>;

/// Diffs value trees and notifies listeners when `change`/`add`/`remove`/
/// `modify` events fire (spec §4.2: "emits events ... iff the corresponding
/// change list is non-empty").
pub struct ChangeDetector {
    config: ChangeDetectorConfig,
    dependencies: Vec<QueryDependency>,
    on_change: Vec<ChangeListener>,
    on_add: Vec<ChangeListener>,
    on_remove: Vec<ChangeListener>,
    on_modify: Vec<ChangeListener>,
}

impl Default for ChangeDetector {
    fn default() -> Self {
        Self::new(ChangeDetectorConfig::default())
    }
}

impl ChangeDetector {
    pub fn new(config: ChangeDetectorConfig) -> Self {
        Self {
            config,
            dependencies: Vec::new(),
            on_change: Vec::new(),
            on_add: Vec::new(),
            on_remove: Vec::new(),
            on_modify: Vec::new(),
        }
    }

    pub fn register_dependency(&mut self, dependency: QueryDependency) {
        self.dependencies.push(dependency);
    }

    pub fn clear_dependencies(&mut self) {
        self.dependencies.clear();
    }

    pub fn on_change(&mut self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) {
        self.on_change.push(Box::new(listener));
    }

    pub fn on_add(&mut self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) {
        self.on_add.push(Box::new(listener));
    }

    pub fn on_remove(&mut self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) {
        self.on_remove.push(Box::new(listener));
    }

    pub fn on_modify(&mut self, listener: impl Fn(&ChangeSet) + Send + Sync + 'static) {
        self.on_modify.push(Box::new(listener));
    }

    /// A cheap short-circuiting equality check, used internally before
    /// paying for a full [`Self::diff`] (spec §4.2, invariant 3).
    pub fn has_changes(&self, old: &Value, new: &Value) -> bool {
        !self.values_equal(old, new, &mut HashSet::new())
    }

    pub fn diff(&mut self, old: &Value, new: &Value, timestamp: crate::value::Timestamp) -> ChangeSet {
        let mut changes = ChangeSet {
            timestamp,
            ..Default::default()
        };
        let mut seen = HashSet::new();
        self.diff_at(old, new, &mut Vec::new(), &mut changes, &mut seen, true);
        self.fire_events(&changes);
        changes
    }

    fn fire_events(&self, changes: &ChangeSet) {
        if !changes.is_empty() {
            for listener in &self.on_change {
                guard(|| listener(changes));
            }
        }
        if !changes.added.is_empty() {
            for listener in &self.on_add {
                guard(|| listener(changes));
            }
        }
        if !changes.removed.is_empty() {
            for listener in &self.on_remove {
                guard(|| listener(changes));
            }
        }
        if !changes.modified.is_empty() {
            for listener in &self.on_modify {
                guard(|| listener(changes));
            }
        }
    }

    fn diff_at(
        &self,
        old: &Value,
        new: &Value,
        path: &mut ChangePath,
        changes: &mut ChangeSet,
        seen: &mut HashSet<(usize, usize)>,
        is_root: bool,
    ) {
        // Root-level null/undefined transitions expand to per-field
        // Added/Removed for object roots; nested ones are a single Modified.
        if is_root && old.is_null() != new.is_null() {
            if let Some(fields) = new.as_object().filter(|_| old.is_null()) {
                for (k, v) in fields.iter() {
                    changes.added.push(ChangeRecord::Added {
                        path: vec![PathSegment::Key(k.clone())],
                        value: v.clone(),
                    });
                }
                return;
            }
            if let Some(fields) = old.as_object().filter(|_| new.is_null()) {
                for (k, v) in fields.iter() {
                    changes.removed.push(ChangeRecord::Removed {
                        path: vec![PathSegment::Key(k.clone())],
                        value: v.clone(),
                    });
                }
                return;
            }
        }

        if self.values_equal_ordered(old, new, &mut HashSet::new()) {
            return;
        }

        if old.type_tag() != new.type_tag() || old.is_null() || new.is_null() {
            changes.modified.push(ChangeRecord::Modified {
                path: path.clone(),
                old: old.clone(),
                new: new.clone(),
            });
            return;
        }

        match (old, new) {
            (Value::Object(old_fields), Value::Object(new_fields)) => {
                self.diff_objects(old_fields, new_fields, path, changes, seen);
            },
            (Value::Array(old_items), Value::Array(new_items)) => {
                self.diff_arrays(old_items, new_items, path, changes, seen);
            },
            _ => {
                changes.modified.push(ChangeRecord::Modified {
                    path: path.clone(),
                    old: old.clone(),
                    new: new.clone(),
                });
            },
        }
    }

    fn diff_objects(
        &self,
        old: &OrdMap<String, Value>,
        new: &OrdMap<String, Value>,
        path: &mut ChangePath,
        changes: &mut ChangeSet,
        seen: &mut HashSet<(usize, usize)>,
    ) {
        for (key, old_value) in old.iter() {
            path.push(PathSegment::Key(key.clone()));
            match new.get(key) {
                Some(new_value) => self.diff_at(old_value, new_value, path, changes, seen, false),
                None => changes.removed.push(ChangeRecord::Removed {
                    path: path.clone(),
                    value: old_value.clone(),
                }),
            }
            path.pop();
        }
        for (key, new_value) in new.iter() {
            if !old.contains_key(key) {
                path.push(PathSegment::Key(key.clone()));
                changes.added.push(ChangeRecord::Added {
                    path: path.clone(),
                    value: new_value.clone(),
                });
                path.pop();
            }
        }
    }

    fn diff_arrays(
        &self,
        old: &Vector<Value>,
        new: &Vector<Value>,
        path: &mut ChangePath,
        changes: &mut ChangeSet,
        seen: &mut HashSet<(usize, usize)>,
    ) {
        let identity_field = self.config.identity_field;
        let old_has_identity = old.iter().all(|v| has_identity(v, identity_field));
        let new_has_identity = new.iter().all(|v| has_identity(v, identity_field));

        if old_has_identity && new_has_identity {
            self.diff_by_identity(old, new, identity_field, path, changes, seen);
            return;
        }
        self.diff_by_index(old, new, path, changes, seen);
    }

    fn diff_by_identity(
        &self,
        old: &Vector<Value>,
        new: &Vector<Value>,
        identity_field: &str,
        path: &mut ChangePath,
        changes: &mut ChangeSet,
        seen: &mut HashSet<(usize, usize)>,
    ) {
        let old_by_id: OrdMap<String, &Value> = old
            .iter()
            .filter_map(|v| identity_of(v, identity_field).map(|id| (id, v)))
            .collect();
        let new_by_id: OrdMap<String, &Value> = new
            .iter()
            .filter_map(|v| identity_of(v, identity_field).map(|id| (id, v)))
            .collect();

        for (id, old_value) in old_by_id.iter() {
            match new_by_id.get(id) {
                Some(new_value) => self.diff_at(old_value, new_value, path, changes, seen, false),
                None => changes.removed.push(ChangeRecord::Removed {
                    path: path.clone(),
                    value: (*old_value).clone(),
                }),
            }
        }
        for (id, new_value) in new_by_id.iter() {
            if !old_by_id.contains_key(id) {
                changes.added.push(ChangeRecord::Added {
                    path: path.clone(),
                    value: (*new_value).clone(),
                });
            }
        }
    }

    fn diff_by_index(
        &self,
        old: &Vector<Value>,
        new: &Vector<Value>,
        path: &mut ChangePath,
        changes: &mut ChangeSet,
        seen: &mut HashSet<(usize, usize)>,
    ) {
        let max_len = old.len().max(new.len());
        for i in 0..max_len {
            match (old.get(i), new.get(i)) {
                (Some(o), Some(n)) => {
                    path.push(PathSegment::Index(i));
                    self.diff_at(o, n, path, changes, seen, false);
                    path.pop();
                },
                (Some(o), None) => changes.removed.push(ChangeRecord::Removed {
                    path: {
                        let mut p = path.clone();
                        p.push(PathSegment::Index(i));
                        p
                    },
                    value: o.clone(),
                }),
                (None, Some(n)) => changes.added.push(ChangeRecord::Added {
                    path: {
                        let mut p = path.clone();
                        p.push(PathSegment::Index(i));
                        p
                    },
                    value: n.clone(),
                }),
                (None, None) => unreachable!(),
            }
        }
    }

    /// Value equality used by [`Self::has_changes`]: NaN compares equal to
    /// NaN, timestamps compare by instant, and (with `track_array_order`
    /// off) sequences compare order-insensitively.
    fn values_equal(&self, a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
        self.values_equal_impl(a, b, seen, self.config.track_array_order)
    }

    /// Value equality used by [`Self::diff_at`]'s short-circuit. Unlike
    /// [`Self::values_equal`], arrays always compare order-sensitively here
    /// regardless of `track_array_order`: that flag scopes the
    /// order-insensitive comparison to the fast `has_changes` check only
    /// (spec §4.2), so a pair that differs solely by element order must
    /// still fall through to `diff_arrays` and be reported.
    fn values_equal_ordered(&self, a: &Value, b: &Value, seen: &mut HashSet<(usize, usize)>) -> bool {
        self.values_equal_impl(a, b, seen, true)
    }

    fn values_equal_impl(
        &self,
        a: &Value,
        b: &Value,
        seen: &mut HashSet<(usize, usize)>,
        order_sensitive: bool,
    ) -> bool {
        match (a, b) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(x), Value::Bool(y)) => x == y,
            (Value::Number(x), Value::Number(y)) => x == y || (x.is_nan() && y.is_nan()),
            (Value::String(x), Value::String(y)) => x == y,
            (Value::BigInt(x), Value::BigInt(y)) => x == y,
            (Value::Bytes(x), Value::Bytes(y)) => x == y,
            (Value::Timestamp(x), Value::Timestamp(y)) => x == y,
            (Value::Id(x), Value::Id(y)) => x == y,
            (Value::Array(x), Value::Array(y)) => {
                let key = (as_ptr(x), as_ptr(y));
                if !seen.insert(key) {
                    return true;
                }
                if order_sensitive {
                    x.len() == y.len()
                        && x.iter()
                            .zip(y.iter())
                            .all(|(a, b)| self.values_equal_impl(a, b, seen, order_sensitive))
                } else {
                    x.len() == y.len()
                        && x.iter().all(|a| {
                            y.iter().any(|b| self.values_equal_impl(a, b, seen, order_sensitive))
                        })
                }
            },
            (Value::Object(x), Value::Object(y)) => {
                x.len() == y.len()
                    && x.iter().all(|(k, v)| {
                        y.get(k).is_some_and(|bv| self.values_equal_impl(v, bv, seen, order_sensitive))
                    })
            },
            _ => false,
        }
    }

    /// Map a diff's changed paths to the ids of queries that depend on them
    /// (spec §4.2 "Affected-query lookup").
    pub fn affected_queries(&self, changes: &ChangeSet) -> Vec<String> {
        let mut seen_ids = HashSet::new();
        let mut out = Vec::new();
        let all = changes
            .added
            .iter()
            .chain(changes.removed.iter())
            .chain(changes.modified.iter());
        for record in all {
            let path = record.path();
            let Some(PathSegment::Key(table)) = path.first() else {
                continue;
            };
            let field_path = path_to_key(&path[1..].to_vec());
            for dep in &self.dependencies {
                if &dep.table == table && dep.matches_field(&field_path) && seen_ids.insert(dep.query_id.clone())
                {
                    out.push(dep.query_id.clone());
                }
            }
        }
        out
    }
}

fn has_identity(v: &Value, field: &str) -> bool {
    v.as_object()
        .is_some_and(|o| o.get(field).is_some())
}

fn identity_of(v: &Value, field: &str) -> Option<String> {
    let obj = v.as_object()?;
    match obj.get(field)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::BigInt(n) => Some(n.to_string()),
        _ => None,
    }
}

fn as_ptr<T>(v: &Vector<T>) -> usize
where
    T: Clone,
{
    // Identity-ish key for cycle short-circuiting: structural-sharing
    // `imbl::Vector` clones are cheap but keep pointing at the same backing
    // chunks, so two equal-identity trees (the only way a "cycle" can occur
    // in an owned value tree) share this address.
    v.focus().get(0).map(|_| v as *const _ as usize).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn obj(pairs: impl IntoIterator<Item = (&'static str, Value)>) -> Value {
        Value::Object(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    #[test]
    fn s1_identity_diff_detects_addition() {
        let mut detector = ChangeDetector::default();
        let old = Value::Array(
            [obj([("_id", Value::from("1")), ("name", Value::from("Alice"))])]
                .into_iter()
                .collect(),
        );
        let new = Value::Array(
            [
                obj([("_id", Value::from("1")), ("name", Value::from("Alice"))]),
                obj([("_id", Value::from("2")), ("name", Value::from("Bob"))]),
            ]
            .into_iter()
            .collect(),
        );
        let changes = detector.diff(&old, &new, 0);
        assert_eq!(changes.added.len(), 1);
        assert!(changes.removed.is_empty());
        assert!(changes.modified.is_empty());
        match &changes.added[0] {
            ChangeRecord::Added { path, value } => {
                assert!(path.is_empty());
                assert_eq!(value, &obj([("_id", Value::from("2")), ("name", Value::from("Bob"))]));
            },
            other => panic!("{other:?}"),
        }
    }

    #[test]
    fn diff_reports_reordered_arrays_even_with_track_array_order_off() {
        let mut detector = ChangeDetector::new(ChangeDetectorConfig {
            track_array_order: false,
            ..Default::default()
        });
        let old = Value::array([Value::from("a"), Value::from("b")]);
        let new = Value::array([Value::from("b"), Value::from("a")]);

        assert!(
            !detector.has_changes(&old, &new),
            "has_changes is order-insensitive when track_array_order is off"
        );

        let changes = detector.diff(&old, &new, 0);
        assert!(
            !changes.modified.is_empty(),
            "diff must stay order-sensitive regardless of track_array_order"
        );
    }

    #[test]
    fn s2_diff_map_key_format() {
        let mut detector = ChangeDetector::default();
        let old = obj([(
            "tags",
            Value::array([Value::from("a"), Value::from("b"), Value::from("c")]),
        )]);
        let new = obj([(
            "tags",
            Value::array([Value::from("a"), Value::from("B"), Value::from("c")]),
        )]);
        let changes = detector.diff(&old, &new, 0);
        let diff_map = changes.diff_map();
        assert_eq!(
            diff_map.get("tags[1]"),
            Some(&(Value::from("b"), Value::from("B")))
        );
    }

    #[test]
    fn root_null_to_object_expands_to_per_field_added() {
        let mut detector = ChangeDetector::default();
        let new = obj([("a", Value::from(1.0)), ("b", Value::from(2.0))]);
        let changes = detector.diff(&Value::Null, &new, 0);
        assert_eq!(changes.added.len(), 2);
        assert!(changes.modified.is_empty());
    }

    #[test]
    fn nested_null_transition_is_single_modified() {
        let mut detector = ChangeDetector::default();
        let old = obj([("a", Value::Null)]);
        let new = obj([("a", Value::from(1.0))]);
        let changes = detector.diff(&old, &new, 0);
        assert_eq!(changes.modified.len(), 1);
    }

    #[test]
    fn nan_to_nan_is_equal() {
        let detector = ChangeDetector::default();
        assert!(!detector.has_changes(&Value::Number(f64::NAN), &Value::Number(f64::NAN)));
    }

    #[test]
    fn invariant_3_no_changes_iff_empty_lists() {
        let mut detector = ChangeDetector::default();
        let a = obj([("x", Value::from(1.0))]);
        let b = a.clone();
        assert!(!detector.has_changes(&a, &b));
        let changes = detector.diff(&a, &b, 0);
        assert!(changes.is_empty());
    }

    #[test]
    fn affected_queries_matches_table_and_field_prefix() {
        let mut detector = ChangeDetector::default();
        detector.register_dependency(QueryDependency {
            query_id: "q1".to_string(),
            table: "messages".to_string(),
            fields: vec!["author.*".to_string()],
        });
        detector.register_dependency(QueryDependency {
            query_id: "q2".to_string(),
            table: "messages".to_string(),
            fields: vec!["body".to_string()],
        });
        let old = obj([("messages", obj([("author", obj([("name", Value::from("a"))]))]))]);
        let new = obj([("messages", obj([("author", obj([("name", Value::from("b"))]))]))]);
        let changes = detector.diff(&old, &new, 0);
        let affected = detector.affected_queries(&changes);
        assert_eq!(affected, vec!["q1".to_string()]);
    }

    #[test]
    fn events_fire_only_when_lists_non_empty() {
        use std::sync::{
            atomic::{
                AtomicUsize,
                Ordering,
            },
            Arc,
        };
        let mut detector = ChangeDetector::default();
        let add_calls = Arc::new(AtomicUsize::new(0));
        let add_calls2 = add_calls.clone();
        detector.on_add(move |_| {
            add_calls2.fetch_add(1, Ordering::SeqCst);
        });
        let a = obj([("x", Value::from(1.0))]);
        detector.diff(&a, &a.clone(), 0);
        assert_eq!(add_calls.load(Ordering::SeqCst), 0);
        let b = obj([("x", Value::from(1.0)), ("y", Value::from(2.0))]);
        detector.diff(&a, &b, 0);
        assert_eq!(add_calls.load(Ordering::SeqCst), 1);
    }
}

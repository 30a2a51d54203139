//! Callback isolation (spec §4.4 "Callback isolation", and the same
//! requirement repeated for change-detector/optimistic-engine/connection
//! listeners): a panic inside a user-supplied closure must not unwind into
//! core state and must not stop later listeners in the same dispatch from
//! running.

use std::panic::{
    catch_unwind,
    AssertUnwindSafe,
};

use tracing::warn;

/// Runs `f`, catching any panic and logging it instead of propagating.
///
/// User callbacks (subscription listeners, change-detector hooks, custom
/// conflict resolvers) are the only place in this crate where caller code
/// runs on our call stack; everything else is internal and expected to use
/// `Result`. A caller's bug there must degrade to a dropped notification,
/// not a crashed worker task.
pub fn guard<F: FnOnce()>(f: F) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        warn!(panic = %message, "callback panicked; isolating and continuing");
    }
}

/// As [`guard`], but for callbacks that return a value; the default is
/// returned in place of a panicking callback's result.
pub fn guard_with_default<T, F: FnOnce() -> T>(default: T, f: F) -> T {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            warn!(panic = %message, "callback panicked; using default and continuing");
            default
        },
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

    #[test]
    fn guard_absorbs_panic() {
        guard(|| panic!("boom"));
    }

    #[test]
    fn guard_does_not_block_subsequent_calls() {
        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = calls.clone();
        guard(|| panic!("boom"));
        guard(move || {
            calls2.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn guard_with_default_returns_default_on_panic() {
        let value = guard_with_default(42, || -> i32 { panic!("boom") });
        assert_eq!(value, 42);
    }
}

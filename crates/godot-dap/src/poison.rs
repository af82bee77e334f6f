use std::sync::{Mutex, MutexGuard};

/// Locks a sync mutex, recovering the guard if a previous holder panicked.
/// The tables guarded this way (pending requests, session state) stay usable
/// after a poisoned write; the error is logged once and the session keeps
/// going.
pub(crate) fn lock<'a, T>(mutex: &'a Mutex<T>, context: &'static str) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|err| {
        tracing::error!(target: "godot.dap", context, "mutex poisoned; recovering the guard");
        err.into_inner()
    })
}

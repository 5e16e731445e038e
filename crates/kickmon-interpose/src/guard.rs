//! Per-thread re-entrancy flag.
//!
//! While a thread is inside a hook, every intercepted call it makes (trace
//! writes, log output, publishing) goes straight to the real function
//! without accounting. Threads spawned from inside a hook keep the flag set
//! for their whole life.

use std::cell::Cell;

thread_local! {
    static IN_HOOK: Cell<bool> = const { Cell::new(false) };
}

/// Marks the current thread as inside a hook until dropped.
#[derive(Debug)]
pub(crate) struct HookGuard {
    _private: (),
}

impl HookGuard {
    /// `None` when the thread is already inside a hook, or its thread-local
    /// storage is gone (thread teardown).
    pub(crate) fn enter() -> Option<Self> {
        IN_HOOK
            .try_with(|flag| {
                if flag.replace(true) {
                    None
                } else {
                    Some(Self { _private: () })
                }
            })
            .ok()
            .flatten()
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOK.try_with(|flag| flag.set(false));
    }
}

pub(crate) fn in_hook() -> bool {
    IN_HOOK.try_with(Cell::get).unwrap_or(true)
}

/// Marks the calling thread internal for the rest of its life.
pub(crate) fn mark_internal() {
    let _ = IN_HOOK.try_with(|flag| flag.set(true));
}

/// Saves `errno` on creation and restores it on drop, so bookkeeping never
/// changes what the application observes.
pub(crate) struct ErrnoGuard(libc::c_int);

impl ErrnoGuard {
    pub(crate) fn save() -> Self {
        // SAFETY: __errno_location always returns this thread's errno slot.
        Self(unsafe { *libc::__errno_location() })
    }
}

impl Drop for ErrnoGuard {
    fn drop(&mut self) {
        // SAFETY: see save().
        unsafe { *libc::__errno_location() = self.0 };
    }
}

//! Thread-scoped execution context that drives combiners to completion.

use std::cell::Cell;
use std::ptr;

use crate::combiner::{continue_exec_ctx, CombinerInner};

thread_local! {
    static CURRENT: Cell<*const ExecCtx> = const { Cell::new(ptr::null()) };
}

/// Per-thread driver for combiner work.
///
/// An execution context exists for the extent of an [`ExecCtx::scope`] call
/// and owns the list of combiners that picked up work on this thread. Every
/// boundary that may submit combiner work (I/O completion, timer fire, API
/// entry point) brackets itself in a scope; the scope flushes pending
/// combiners before it returns.
///
/// Exactly one context exists per thread at a time; scopes do not nest.
#[derive(Debug)]
pub struct ExecCtx {
    /// Head of the singly-linked active-combiner list.
    active_combiner: Cell<*mut CombinerInner>,
    /// Tail of the active-combiner list.
    last_combiner: Cell<*mut CombinerInner>,
    /// Set when this thread wants to wind down; combiners consult it to
    /// decide whether to offload their remaining work.
    ready_to_finish: Cell<bool>,
}

struct ScopeReset;

impl Drop for ScopeReset {
    fn drop(&mut self) {
        CURRENT.with(|current| current.set(ptr::null()));
    }
}

impl ExecCtx {
    fn new() -> ExecCtx {
        ExecCtx {
            active_combiner: Cell::new(ptr::null_mut()),
            last_combiner: Cell::new(ptr::null_mut()),
            ready_to_finish: Cell::new(false),
        }
    }

    /// Run `f` with an execution context installed on this thread.
    ///
    /// Combiners that enroll on this thread during `f` are flushed before
    /// `scope` returns, so leaving the scope always observes an empty active
    /// list.
    ///
    /// # Panics
    ///
    /// Panics if a scope is already active on this thread.
    pub fn scope<F, R>(f: F) -> R
    where
        F: FnOnce(&ExecCtx) -> R,
    {
        CURRENT.with(|current| {
            assert!(
                current.get().is_null(),
                "execution context scopes do not nest"
            );
        });
        let ctx = ExecCtx::new();
        let _reset = ScopeReset;
        CURRENT.with(|current| current.set(&ctx as *const ExecCtx));
        let result = f(&ctx);
        let _ = ctx.flush();
        debug_assert!(ctx.active_combiner.get().is_null());
        result
    }

    /// Run `f` against the current thread's context.
    ///
    /// # Panics
    ///
    /// Panics if no scope is active on this thread.
    pub(crate) fn with<F, R>(f: F) -> R
    where
        F: FnOnce(&ExecCtx) -> R,
    {
        CURRENT.with(|current| {
            let ctx = current.get();
            assert!(
                !ctx.is_null(),
                "no execution context has been entered on this thread"
            );
            // SAFETY: the pointer targets the stack frame of the enclosing
            // `scope` call, which outlives `f`; `ScopeReset` clears it before
            // that frame dies.
            f(unsafe { &*ctx })
        })
    }

    /// Drive enrolled combiners until the active list empties. Returns
    /// whether any work was performed.
    pub fn flush(&self) -> bool {
        let mut did_work = false;
        while continue_exec_ctx(self) {
            did_work = true;
        }
        did_work
    }

    /// Ask combiners draining on this thread to offload remaining work at
    /// the next opportunity.
    pub fn set_ready_to_finish(&self) {
        self.ready_to_finish.set(true);
    }

    pub(crate) fn is_ready_to_finish(&self) -> bool {
        self.ready_to_finish.get()
    }

    /// Stable address used as the combiner contention heuristic's identity.
    pub(crate) fn addr(&self) -> usize {
        self as *const ExecCtx as usize
    }

    pub(crate) fn active_combiner(&self) -> *mut CombinerInner {
        self.active_combiner.get()
    }

    /// Append at the tail: fair ordering for combiners enrolling fresh.
    pub(crate) fn push_last(&self, lock: *mut CombinerInner) {
        // SAFETY: the link slot is owner-only and this thread holds the
        // enrollment (or drain) position for `lock`.
        unsafe { (*lock).set_next_on_exec_ctx(ptr::null_mut()) };
        if self.active_combiner.get().is_null() {
            self.active_combiner.set(lock);
            self.last_combiner.set(lock);
        } else {
            unsafe { (*self.last_combiner.get()).set_next_on_exec_ctx(lock) };
            self.last_combiner.set(lock);
        }
    }

    /// Re-insert at the head: the combiner just ran and keeps priority.
    pub(crate) fn push_first(&self, lock: *mut CombinerInner) {
        // SAFETY: as in `push_last`.
        unsafe { (*lock).set_next_on_exec_ctx(self.active_combiner.get()) };
        self.active_combiner.set(lock);
        if unsafe { (*lock).next_on_exec_ctx() }.is_null() {
            self.last_combiner.set(lock);
        }
    }

    /// Advance the head past the current combiner.
    pub(crate) fn move_next(&self) {
        let head = self.active_combiner.get();
        debug_assert!(!head.is_null());
        // SAFETY: `head` is enrolled on this context and this thread drains it.
        let next = unsafe { (*head).next_on_exec_ctx() };
        self.active_combiner.set(next);
        if next.is_null() {
            self.last_combiner.set(ptr::null_mut());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_flush_does_no_work() {
        ExecCtx::scope(|ctx| {
            assert!(!ctx.flush());
            assert!(!ctx.is_ready_to_finish());
            ctx.set_ready_to_finish();
            assert!(ctx.is_ready_to_finish());
        });
    }

    #[test]
    fn scope_is_reentrant_after_exit() {
        ExecCtx::scope(|_| ());
        ExecCtx::scope(|_| ());
    }

    #[test]
    #[should_panic(expected = "do not nest")]
    fn nested_scopes_are_rejected() {
        ExecCtx::scope(|_| ExecCtx::scope(|_| ()));
    }

    #[test]
    #[should_panic(expected = "no execution context")]
    fn with_outside_scope_is_rejected() {
        ExecCtx::with(|_| ());
    }
}

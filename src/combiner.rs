//! Serializing executor: closures submitted from any thread run one at a
//! time, in submission order, without blocking the submitter.
//!
//! A combiner keeps its bookkeeping in one atomic state word. Bit 0
//! (`UNORPHANED`) is set while at least one [`Combiner`] handle is alive;
//! the remaining bits count queued elements in units of 2. A single
//! `fetch_add` therefore both publishes "there is work" and tells the
//! submitter whether it is the one that must enroll the combiner on its
//! thread's [`ExecCtx`]; a single `fetch_sub` both retires work and detects
//! the orphaned-and-idle point at which the combiner destroys itself.

use std::cell::{Cell, UnsafeCell};
use std::fmt;
use std::ptr::{self, NonNull};
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_utils::CachePadded;
use etrace::some_or;

use crate::closure::{Closure, ClosureList, Status};
use crate::exec_ctx::ExecCtx;
use crate::mpscq::{MpscQueue, Pop};
use crate::pool::WorkerPool;
use crate::trace::{self, TraceEvent};

const STATE_UNORPHANED: usize = 1;
const STATE_ELEM_COUNT_LOW_BIT: usize = 2;

/// `initiating_exec_ctx` value meaning "contended": submissions were seen
/// from more than one execution context.
const INITIATOR_NULL: usize = 0;
/// Placeholder stored on offload so the rescheduled continuation does not
/// immediately look contended and offload again.
const INITIATOR_COVER: usize = 1;

/// Composes a pre-transition state word, mirroring how the drain dispatch
/// reads one: orphan bit plus element count in units of 2.
const fn state_was(orphaned: bool, elem_count: usize) -> usize {
    (if orphaned { 0 } else { STATE_UNORPHANED }) + elem_count * STATE_ELEM_COUNT_LOW_BIT
}

pub(crate) struct CombinerInner {
    state: CachePadded<AtomicUsize>,
    /// Handle count, separate from the orphan bit: the last handle to drop
    /// clears `UNORPHANED`.
    refs: AtomicUsize,
    queue: MpscQueue,
    /// Touched only by the thread currently draining this combiner.
    final_list: UnsafeCell<ClosureList>,
    /// Owner-only: latched when the final list is the next thing to run.
    time_to_execute_final_list: Cell<bool>,
    /// Address of the [`ExecCtx`] that most recently enrolled the combiner,
    /// [`INITIATOR_NULL`] once a second context was seen, or
    /// [`INITIATOR_COVER`] right after an offload. Purely a contention
    /// heuristic; races here delay an offload by an action or two.
    initiating_exec_ctx: AtomicUsize,
    /// Owner-only link for the ExecCtx active-combiner list.
    next_combiner: Cell<*mut CombinerInner>,
    pool: Arc<dyn WorkerPool>,
}

// SAFETY: shared fields (`state`, `refs`, `initiating_exec_ctx`, the queue's
// push end) are atomic; the remaining fields are confined to the single
// thread holding the drain position, which the state-word protocol makes
// unique.
unsafe impl Send for CombinerInner {}
unsafe impl Sync for CombinerInner {}

impl CombinerInner {
    pub(crate) fn set_next_on_exec_ctx(&self, next: *mut CombinerInner) {
        self.next_combiner.set(next);
    }

    pub(crate) fn next_on_exec_ctx(&self) -> *mut CombinerInner {
        self.next_combiner.get()
    }
}

/// Moves a combiner pointer into a `Send` task or closure. Kept alive across
/// the move by the element count units the work it represents still holds.
struct CombinerPtr(NonNull<CombinerInner>);

// SAFETY: see `CombinerInner`'s `Send` rationale; the pointee is heap
// allocated and outlives the carrier by the state-word protocol.
unsafe impl Send for CombinerPtr {}

/// Handle to a serializing executor.
///
/// Cloning takes a reference; dropping releases one. When the last handle
/// drops, the combiner finishes whatever work is still queued and then frees
/// itself. Submissions require a live handle, so work can never be submitted
/// to an orphaned combiner.
///
/// All operations require the calling thread to be inside an
/// [`ExecCtx::scope`].
pub struct Combiner {
    inner: NonNull<CombinerInner>,
}

// SAFETY: every shared field of the pointee is atomic; serialized execution
// is the whole point of the type.
unsafe impl Send for Combiner {}
unsafe impl Sync for Combiner {}

impl Combiner {
    /// Create an idle combiner that offloads onto `pool` when it must leave
    /// the submitting thread.
    pub fn new(pool: Arc<dyn WorkerPool>) -> Combiner {
        let inner = NonNull::from(Box::leak(Box::new(CombinerInner {
            state: CachePadded::new(AtomicUsize::new(STATE_UNORPHANED)),
            refs: AtomicUsize::new(1),
            queue: MpscQueue::new(),
            final_list: UnsafeCell::new(ClosureList::new()),
            time_to_execute_final_list: Cell::new(false),
            initiating_exec_ctx: AtomicUsize::new(INITIATOR_NULL),
            next_combiner: Cell::new(ptr::null_mut()),
            pool,
        })));
        log::trace!("C:{:?} create", inner);
        trace::emit(|| TraceEvent::CombinerCreate {
            combiner: inner.as_ptr() as usize,
        });
        Combiner { inner }
    }

    /// Address identifying this combiner in trace events.
    pub fn id(&self) -> usize {
        self.inner.as_ptr() as usize
    }

    /// Schedule `closure` for serialized execution with `error` as its
    /// status.
    ///
    /// Never blocks. Closures submitted from one thread run in submission
    /// order; across threads, in the order the submission queue linearizes
    /// them.
    pub fn run(&self, closure: Box<Closure>, error: Status) {
        combiner_exec(self.inner, closure, error);
    }

    /// Schedule `closure` to run after all work currently queued on this
    /// combiner has completed, within the same flush pass.
    pub fn finally_run(&self, closure: Box<Closure>, error: Status) {
        combiner_finally_exec(self.inner, closure, error);
    }

    /// Hint that the next drain step should hand remaining work to the
    /// worker pool.
    pub fn force_offload(&self) {
        // SAFETY: the handle keeps the combiner alive.
        let inner = unsafe { self.inner.as_ref() };
        inner
            .initiating_exec_ctx
            .store(INITIATOR_NULL, Ordering::Relaxed);
        ExecCtx::with(|ctx| ctx.set_ready_to_finish());
    }
}

impl Clone for Combiner {
    fn clone(&self) -> Combiner {
        // SAFETY: the cloned handle keeps the combiner alive.
        let inner = unsafe { self.inner.as_ref() };
        let refs = inner.refs.fetch_add(1, Ordering::Relaxed);
        trace::emit(|| TraceEvent::RefCountDelta {
            combiner: self.inner.as_ptr() as usize,
            delta: 1,
            refs: refs + 1,
        });
        Combiner { inner: self.inner }
    }
}

impl Drop for Combiner {
    fn drop(&mut self) {
        // SAFETY: this handle is still accounted in `refs`.
        let inner = unsafe { self.inner.as_ref() };
        let refs = inner.refs.fetch_sub(1, Ordering::Release);
        trace::emit(|| TraceEvent::RefCountDelta {
            combiner: self.inner.as_ptr() as usize,
            delta: -1,
            refs: refs - 1,
        });
        if refs == 1 {
            fence(Ordering::Acquire);
            start_destroy(self.inner);
        }
    }
}

impl fmt::Debug for Combiner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // SAFETY: the handle keeps the combiner alive.
        let inner = unsafe { self.inner.as_ref() };
        f.debug_struct("Combiner")
            .field("state", &inner.state.load(Ordering::Relaxed))
            .field("refs", &inner.refs.load(Ordering::Relaxed))
            .finish()
    }
}

fn combiner_exec(lock: NonNull<CombinerInner>, mut closure: Box<Closure>, error: Status) {
    // SAFETY: callers hold either a handle or an element count unit.
    let inner = unsafe { lock.as_ref() };
    let last = inner
        .state
        .fetch_add(STATE_ELEM_COUNT_LOW_BIT, Ordering::AcqRel);
    log::trace!("C:{:?} run last={}", lock, last);
    trace::emit(|| TraceEvent::Submit {
        combiner: lock.as_ptr() as usize,
    });
    if last == STATE_UNORPHANED {
        // First element: this submission enrolls the combiner on the current
        // thread's execution context.
        ExecCtx::with(|ctx| {
            inner.initiating_exec_ctx.store(ctx.addr(), Ordering::Relaxed);
            ctx.push_last(lock.as_ptr());
        });
    } else {
        // A second context marks the combiner contended. Racing stores here
        // at worst delay an offload by an action or two.
        let initiator = inner.initiating_exec_ctx.load(Ordering::Relaxed);
        if initiator != INITIATOR_NULL && initiator != ExecCtx::with(|ctx| ctx.addr()) {
            inner
                .initiating_exec_ctx
                .store(INITIATOR_NULL, Ordering::Relaxed);
        }
    }
    assert!(
        last & STATE_UNORPHANED != 0,
        "closure submitted to an orphaned combiner"
    );
    closure.set_error(error);
    inner.queue.push(closure);
}

fn combiner_finally_exec(lock: NonNull<CombinerInner>, closure: Box<Closure>, error: Status) {
    let active = ExecCtx::with(|ctx| ctx.active_combiner());
    log::trace!("C:{:?} finally_run active={:?}", lock, active);
    if active != lock.as_ptr() {
        // Not executing inside this combiner: bounce through the regular
        // queue so the final-list append below always happens with the
        // drain position held.
        let target = CombinerPtr(lock);
        let trampoline = Closure::new(move |error| {
            let target = target;
            combiner_finally_exec(target.0, closure, error);
        });
        combiner_exec(lock, trampoline, error);
        return;
    }

    // SAFETY: this combiner is the active head of the current context, so
    // this thread holds the drain position and owns the final list.
    let inner = unsafe { lock.as_ref() };
    let final_list = unsafe { &mut *inner.final_list.get() };
    if final_list.is_empty() {
        // The final list collectively accounts for one element.
        let _ = inner
            .state
            .fetch_add(STATE_ELEM_COUNT_LOW_BIT, Ordering::AcqRel);
    }
    let mut closure = closure;
    closure.set_error(error);
    final_list.append(closure);
}

/// Hand the combiner's remaining work to its worker pool. The pool task
/// enters a fresh execution context, enrolls the combiner there, and
/// flushes.
fn queue_offload(lock: NonNull<CombinerInner>, ctx: &ExecCtx) {
    ctx.move_next();
    // SAFETY: the element count units of the remaining work keep the
    // combiner alive until the pool task drains them.
    let inner = unsafe { lock.as_ref() };
    inner
        .initiating_exec_ctx
        .store(INITIATOR_COVER, Ordering::Relaxed);
    log::trace!("C:{:?} queue_offload", lock);
    trace::emit(|| TraceEvent::Offload {
        combiner: lock.as_ptr() as usize,
    });
    let task = CombinerPtr(lock);
    inner.pool.submit(Box::new(move || {
        let task = task;
        let lock = task.0;
        ExecCtx::scope(|ctx| ctx.push_last(lock.as_ptr()));
    }));
}

/// One drain step for the combiner at the head of `ctx`'s active list.
/// Returns whether any progress was made (false only when the list is
/// empty). Called in a loop by [`ExecCtx::flush`].
pub(crate) fn continue_exec_ctx(ctx: &ExecCtx) -> bool {
    let lock = some_or!(NonNull::new(ctx.active_combiner()), return false);
    // SAFETY: an enrolled combiner holds at least one element count unit.
    let inner = unsafe { lock.as_ref() };

    let contended = inner.initiating_exec_ctx.load(Ordering::Relaxed) == INITIATOR_NULL;
    log::trace!(
        "C:{:?} continue contended={} ready_to_finish={} final={}",
        lock,
        contended,
        ctx.is_ready_to_finish(),
        inner.time_to_execute_final_list.get()
    );

    // Offload only if the combiner is contended and this context wants to
    // wind down; otherwise keep draining here.
    if contended && ctx.is_ready_to_finish() {
        queue_offload(lock, ctx);
        return true;
    }

    if !inner.time_to_execute_final_list.get()
        // Peek: anything beyond the final-list unit executes with priority.
        || (inner.state.load(Ordering::Acquire) >> 1) > 1
    {
        // SAFETY: head of this context's active list makes this thread the
        // single consumer.
        match unsafe { inner.queue.pop() } {
            Pop::Node(node) => {
                trace::emit(|| TraceEvent::Pop {
                    combiner: lock.as_ptr() as usize,
                });
                node.invoke();
            }
            Pop::Empty | Pop::Inconsistent => {
                // A producer claimed an element but has not yet published
                // it. Take the cue to go do something else for a while; the
                // pool task will find the element once it lands.
                queue_offload(lock, ctx);
                return true;
            }
        }
    } else {
        trace::emit(|| TraceEvent::FinalPhaseStart {
            combiner: lock.as_ptr() as usize,
        });
        // SAFETY: single drain owner; detaching first lets the finalizers
        // schedule new final work for a later round.
        let mut list = unsafe { &mut *inner.final_list.get() }.take();
        while let Some(node) = list.pop_front() {
            node.invoke();
        }
    }

    ctx.move_next();
    inner.time_to_execute_final_list.set(false);
    let old_state = inner
        .state
        .fetch_sub(STATE_ELEM_COUNT_LOW_BIT, Ordering::AcqRel);
    log::trace!("C:{:?} finish old_state={}", lock, old_state);

    match old_state {
        s if s == state_was(false, 2) || s == state_was(true, 2) => {
            // Down to one queued element: if it is the final list, latch it.
            // SAFETY: the remaining unit keeps this thread the drain owner.
            if !unsafe { &*inner.final_list.get() }.is_empty() {
                inner.time_to_execute_final_list.set(true);
            }
        }
        s if s == state_was(false, 1) => {
            // Nothing pending, handles still out: back to idle.
            return true;
        }
        s if s == state_was(true, 1) => {
            // Nothing pending and orphaned: this was the last drain.
            // SAFETY: `refs == 0` and the element count just reached zero,
            // so no other thread can reach the combiner.
            unsafe { really_destroy(lock) };
            return true;
        }
        s if s <= STATE_UNORPHANED => {
            unreachable!("combiner drain observed an impossible state word: {}", s)
        }
        _ => {
            // Multiple elements still queued: keep going.
        }
    }
    ctx.push_first(lock.as_ptr());
    true
}

fn start_destroy(lock: NonNull<CombinerInner>) {
    // SAFETY: called with the last handle's reference still folded into the
    // state word's orphan bit.
    let inner = unsafe { lock.as_ref() };
    let old_state = inner.state.fetch_sub(STATE_UNORPHANED, Ordering::AcqRel);
    log::trace!("C:{:?} start_destroy old_state={}", lock, old_state);
    if old_state == STATE_UNORPHANED {
        // SAFETY: zero handles and zero queued elements.
        unsafe { really_destroy(lock) };
    }
    // Otherwise the in-flight elements carry the combiner; the drain that
    // retires the last one destroys it.
}

/// # Safety
///
/// Must be called exactly once, after both the handle count and the element
/// count have reached zero.
unsafe fn really_destroy(lock: NonNull<CombinerInner>) {
    let id = lock.as_ptr() as usize;
    log::trace!("C:{:?} really_destroy", lock);
    assert_eq!(
        lock.as_ref().state.load(Ordering::Relaxed),
        0,
        "combiner destroyed with owners or work outstanding"
    );
    trace::emit(|| TraceEvent::CombinerDestroy { combiner: id });
    drop(Box::from_raw(lock.as_ptr()));
}

//! Deferred units of work and the error values they carry.

use std::fmt;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering};

/// Detailed description of a failed operation.
///
/// Boxed inside [`Status`] so that the common `Ok` case stays a single word.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorDetail {
    /// Numeric error code, interpreted by the layers above the combiner.
    pub code: u32,
    /// Human-readable description.
    pub message: String,
}

/// Result value delivered to a closure's callback.
///
/// The combiner treats the status as opaque data: whoever submits a closure
/// installs a status, and the executor hands that exact value to the callback.
/// Extraction uses move semantics (`mem::take`), so the value is consumed
/// exactly once.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub enum Status {
    /// The operation the closure continues from succeeded.
    #[default]
    Ok,
    /// The operation failed; details are heap-boxed.
    Error(Box<ErrorDetail>),
}

impl Status {
    /// Build an error status from a code and message.
    pub fn error(code: u32, message: impl Into<String>) -> Status {
        Status::Error(Box::new(ErrorDetail {
            code,
            message: message.into(),
        }))
    }

    /// Whether this status is [`Status::Ok`].
    pub fn is_ok(&self) -> bool {
        matches!(self, Status::Ok)
    }
}

type Callback = Box<dyn FnOnce(Status) + Send>;

/// A deferred unit of work.
///
/// A closure bundles a callback with the status slot the executor fills in
/// and a link used while the closure sits in a queue. The closure is linked
/// in at most one container at a time: the submission queue owns it between
/// `run` and pop, the final list owns it between `finally_run` and the final
/// phase. That exclusivity is enforced by ownership, not by convention: the
/// `Box<Closure>` is moved into a container on submit and moved back out
/// before the callback runs.
pub struct Closure {
    cb: Option<Callback>,
    error: Status,
    next: AtomicPtr<Closure>,
}

impl Closure {
    /// Wrap `f` into a closure. The callback runs exactly once, consuming
    /// whatever state it captured.
    pub fn new<F>(f: F) -> Box<Closure>
    where
        F: FnOnce(Status) + Send + 'static,
    {
        Box::new(Closure {
            cb: Some(Box::new(f)),
            error: Status::Ok,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    /// Callback-less node used as the submission queue's stub. Never executed.
    pub(crate) fn stub() -> Box<Closure> {
        Box::new(Closure {
            cb: None,
            error: Status::Ok,
            next: AtomicPtr::new(ptr::null_mut()),
        })
    }

    pub(crate) fn set_error(&mut self, error: Status) {
        self.error = error;
    }

    pub(crate) fn next(&self) -> &AtomicPtr<Closure> {
        &self.next
    }

    /// Extract the installed status and run the callback with it.
    pub(crate) fn invoke(mut self: Box<Self>) {
        let error = mem::take(&mut self.error);
        match self.cb.take() {
            Some(cb) => cb(error),
            None => unreachable!("stub closure executed"),
        }
    }
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("armed", &self.cb.is_some())
            .field("error", &self.error)
            .finish()
    }
}

/// Owner-only FIFO list of closures, linked through each closure's `next`
/// slot. Backs the combiner's final list.
#[derive(Debug)]
pub(crate) struct ClosureList {
    head: *mut Closure,
    tail: *mut Closure,
}

impl ClosureList {
    pub(crate) fn new() -> ClosureList {
        ClosureList {
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    pub(crate) fn append(&mut self, node: Box<Closure>) {
        let node = Box::into_raw(node);
        // The list is touched by one thread at a time, so plain ordering on
        // the shared link slot is enough.
        unsafe { (*node).next.store(ptr::null_mut(), Ordering::Relaxed) };
        if self.head.is_null() {
            self.head = node;
        } else {
            unsafe { (*self.tail).next.store(node, Ordering::Relaxed) };
        }
        self.tail = node;
    }

    /// Detach the whole list, leaving `self` empty.
    pub(crate) fn take(&mut self) -> ClosureList {
        mem::replace(self, ClosureList::new())
    }

    pub(crate) fn pop_front(&mut self) -> Option<Box<Closure>> {
        let head = self.head;
        if head.is_null() {
            return None;
        }
        // SAFETY: every node in the list came from `Box::into_raw` in
        // `append` and is owned by the list until popped here.
        let next = unsafe { (*head).next.load(Ordering::Relaxed) };
        self.head = next;
        if next.is_null() {
            self.tail = ptr::null_mut();
        }
        Some(unsafe { Box::from_raw(head) })
    }
}

impl Drop for ClosureList {
    fn drop(&mut self) {
        while let Some(node) = self.pop_front() {
            drop(node);
        }
    }
}

// SAFETY: the list owns its nodes; `Closure` itself is `Send`.
unsafe impl Send for ClosureList {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn status_error_roundtrip() {
        let status = Status::error(4, "deadline exceeded");
        assert!(!status.is_ok());
        match status {
            Status::Error(detail) => {
                assert_eq!(detail.code, 4);
                assert_eq!(detail.message, "deadline exceeded");
            }
            Status::Ok => panic!("expected an error status"),
        }
        assert!(Status::default().is_ok());
    }

    #[test]
    fn invoke_consumes_installed_error() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen2 = Arc::clone(&seen);
        let mut cl = Closure::new(move |status| {
            assert_eq!(status, Status::error(1, "cancelled"));
            let _ = seen2.fetch_add(1, Ordering::SeqCst);
        });
        cl.set_error(Status::error(1, "cancelled"));
        cl.invoke();
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn closure_list_is_fifo() {
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut list = ClosureList::new();
        assert!(list.is_empty());
        for i in 0..4 {
            let order = Arc::clone(&order);
            list.append(Closure::new(move |_| {
                order.lock().unwrap().push(i);
            }));
        }
        assert!(!list.is_empty());
        let mut detached = list.take();
        assert!(list.is_empty());
        while let Some(node) = detached.pop_front() {
            node.invoke();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3]);
    }
}

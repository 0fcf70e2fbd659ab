//! Serialized execution of closures without blocking submitters.
//!
//! The central type is the [`Combiner`]: closures submitted against one
//! combiner, from any number of threads, run one at a time and in
//! submission order, yet no submitter ever takes a blocking lock. The first
//! submission to an idle combiner enrolls it on the submitting thread's
//! [`ExecCtx`]; flushing that context drains the combiner cooperatively,
//! one closure per visit. A combiner that is contended while its host
//! thread wants to wind down hands its remaining work to a [`WorkerPool`].
//!
//! ```
//! use std::sync::Arc;
//! use combiner::{Closure, Combiner, ExecCtx, Status, ThreadPool};
//!
//! let pool = Arc::new(ThreadPool::new(2));
//! let combiner = Combiner::new(pool);
//! ExecCtx::scope(|_| {
//!     combiner.run(Closure::new(|status| assert!(status.is_ok())), Status::Ok);
//! });
//! ```

// # Tries to deny all lints (`rustc -W help`).
#![deny(absolute_paths_not_starting_with_crate)]
#![deny(anonymous_parameters)]
#![deny(deprecated_in_future)]
#![deny(explicit_outlives_requirements)]
#![deny(keyword_idents)]
#![deny(macro_use_extern_crate)]
#![deny(missing_debug_implementations)]
#![deny(non_ascii_idents)]
#![deny(rust_2018_idioms)]
#![deny(trivial_numeric_casts)]
#![deny(unused_extern_crates)]
#![deny(unused_import_braces)]
#![deny(unused_results)]
#![deny(missing_docs)]
#![deny(rustdoc::invalid_html_tags)]
#![deny(unreachable_pub)]
#![deny(unused_lifetimes)]

// Units of work and their status values
pub mod closure;

// Serializing executor
pub mod combiner;

// Per-thread driver
pub mod exec_ctx;

// Submission queue underneath the combiner
mod mpscq;

// Offload target
pub mod pool;

// Observation hook
pub mod trace;

// Utility
pub mod test_utils;

pub use closure::{Closure, ErrorDetail, Status};
pub use combiner::Combiner;
pub use exec_ctx::ExecCtx;
pub use pool::{Task, ThreadPool, WorkerPool};
pub use trace::{clear_trace_sink, register_trace_sink, TraceEvent, TraceSink};

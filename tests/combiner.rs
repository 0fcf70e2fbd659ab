//! End-to-end combiner scenarios: serialization, ordering, finalizers,
//! offload, and the orphan lifecycle.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use combiner::test_utils::{wait_until, Recorder};
use combiner::{
    clear_trace_sink, Closure, Combiner, ExecCtx, Status, ThreadPool, TraceEvent,
};
use crossbeam_channel::{unbounded, Sender};
use itertools::Itertools;
use rusty_fork::rusty_fork_test;
use serial_test::serial;

const RECV_TIMEOUT: Duration = Duration::from_secs(30);

fn tagger(order: &Arc<Mutex<Vec<&'static str>>>, tag: &'static str) -> Box<Closure> {
    let order = Arc::clone(order);
    Closure::new(move |_| order.lock().unwrap().push(tag))
}

#[test]
#[serial]
fn single_submission_runs_inline_without_offload() {
    let recorder = Recorder::install();
    let pool = Arc::new(ThreadPool::new(1));
    let c = Combiner::new(pool.clone());
    let id = c.id();

    let hits = Arc::new(AtomicUsize::new(0));
    let hits_cb = Arc::clone(&hits);
    ExecCtx::scope(|ctx| {
        c.run(
            Closure::new(move |status| {
                assert_eq!(status, Status::error(2, "unavailable"));
                let _ = hits_cb.fetch_add(1, Ordering::SeqCst);
            }),
            Status::error(2, "unavailable"),
        );
        assert!(ctx.flush());
    });

    assert_eq!(hits.load(Ordering::SeqCst), 1);
    assert_eq!(
        recorder.count(id, |e| matches!(e, TraceEvent::Offload { .. })),
        0
    );
    assert_eq!(recorder.count(id, |e| matches!(e, TraceEvent::Pop { .. })), 1);

    drop(c);
    assert_eq!(
        recorder.count(id, |e| matches!(e, TraceEvent::CombinerDestroy { .. })),
        1
    );
    clear_trace_sink();
}

#[test]
fn two_producers_interleave_without_overlap() {
    const PER_PRODUCER: usize = if cfg!(feature = "stress") { 20_000 } else { 1_000 };

    let pool = Arc::new(ThreadPool::new(4));
    let c = Combiner::new(pool.clone());
    let (done_tx, done_rx) = unbounded();
    let running = Arc::new(AtomicBool::new(false));

    crossbeam_utils::thread::scope(|s| {
        for producer in 0..2usize {
            let c = c.clone();
            let done_tx = done_tx.clone();
            let running = Arc::clone(&running);
            let _ = s.spawn(move |_| {
                ExecCtx::scope(|_| {
                    for seq in 0..PER_PRODUCER {
                        let done_tx = done_tx.clone();
                        let running = Arc::clone(&running);
                        c.run(
                            Closure::new(move |_| {
                                assert!(
                                    !running.swap(true, Ordering::SeqCst),
                                    "closures overlapped"
                                );
                                done_tx.send((producer, seq)).unwrap();
                                running.store(false, Ordering::SeqCst);
                            }),
                            Status::Ok,
                        );
                    }
                });
            });
        }
    })
    .unwrap();

    // The channel receives in execution order; collecting it reconstructs
    // the serialized schedule even if part of it ran on pool workers.
    let mut executed = Vec::with_capacity(2 * PER_PRODUCER);
    for _ in 0..2 * PER_PRODUCER {
        executed.push(done_rx.recv_timeout(RECV_TIMEOUT).unwrap());
    }
    assert!(matches!(
        done_rx.recv_timeout(Duration::from_millis(50)),
        Err(_)
    ));
    for producer in 0..2usize {
        assert!(
            executed
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .tuple_windows()
                .all(|(a, b)| a < b),
            "producer {} saw out-of-order execution",
            producer
        );
    }
}

#[test]
fn finalizers_run_after_pending_work() {
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    ExecCtx::scope(|_| {
        c.run(tagger(&order, "a"), Status::Ok);
        c.finally_run(tagger(&order, "f"), Status::Ok);
        c.run(tagger(&order, "b"), Status::Ok);
    });

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "f"]);
}

#[test]
fn finalizer_scheduled_inside_runs_in_same_pass() {
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    ExecCtx::scope(|_| {
        let c_inside = c.clone();
        let order_a = Arc::clone(&order);
        let order_f = Arc::clone(&order);
        c.run(
            Closure::new(move |_| {
                order_a.lock().unwrap().push("a");
                // Executing inside the combiner: the finalizer takes the
                // direct path onto the final list.
                c_inside.finally_run(
                    Closure::new(move |status| {
                        assert_eq!(status, Status::error(5, "shutting down"));
                        order_f.lock().unwrap().push("f");
                    }),
                    Status::error(5, "shutting down"),
                );
            }),
            Status::Ok,
        );
        c.run(tagger(&order, "b"), Status::Ok);
    });

    assert_eq!(*order.lock().unwrap(), vec!["a", "b", "f"]);
}

#[test]
fn finalizer_on_idle_combiner_still_runs() {
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let order = Arc::new(Mutex::new(Vec::new()));

    ExecCtx::scope(|_| {
        c.finally_run(tagger(&order, "f"), Status::Ok);
    });

    assert_eq!(*order.lock().unwrap(), vec!["f"]);
}

#[test]
fn finalizer_from_another_combiner_redirects() {
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let d = Combiner::new(pool.clone());
    let (done_tx, done_rx) = unbounded();

    ExecCtx::scope(|_| {
        let d_inside = d.clone();
        let done_tx = done_tx.clone();
        c.run(
            Closure::new(move |_| {
                // Active combiner is `c`, so this bounces through `d`'s
                // regular queue before landing on its final list.
                d_inside.finally_run(
                    Closure::new(move |status| {
                        assert!(status.is_ok());
                        done_tx.send(()).unwrap();
                    }),
                    Status::Ok,
                );
            }),
            Status::Ok,
        );
    });

    done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
}

fn countdown(c: &Combiner, n: usize, done: Sender<()>) {
    let c_next = c.clone();
    c.run(
        Closure::new(move |_| {
            if n == 0 {
                done.send(()).unwrap();
            } else {
                countdown(&c_next, n - 1, done);
            }
        }),
        Status::Ok,
    );
}

#[test]
fn callbacks_may_resubmit_to_the_same_combiner() {
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let (done_tx, done_rx) = unbounded();

    ExecCtx::scope(|_| countdown(&c, 100, done_tx));

    done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
}

#[test]
#[serial]
fn contended_combiner_offloads_when_ready_to_finish() {
    const SUBMISSIONS: usize = 100;

    let recorder = Recorder::install();
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let id = c.id();

    let flusher = thread::current().id();
    let on_flusher = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = unbounded();
    let (contend_tx, contend_rx) = unbounded::<()>();
    let (ack_tx, ack_rx) = unbounded::<()>();

    crossbeam_utils::thread::scope(|s| {
        {
            let c = c.clone();
            let done_tx = done_tx.clone();
            let on_flusher = Arc::clone(&on_flusher);
            let _ = s.spawn(move |_| {
                contend_rx.recv().unwrap();
                // Submitting from a second execution context marks the
                // combiner contended.
                ExecCtx::scope(|_| {
                    let on_flusher = Arc::clone(&on_flusher);
                    let done_tx = done_tx.clone();
                    c.run(
                        Closure::new(move |_| {
                            if thread::current().id() == flusher {
                                let _ = on_flusher.fetch_add(1, Ordering::SeqCst);
                            }
                            done_tx.send(()).unwrap();
                        }),
                        Status::Ok,
                    );
                });
                ack_tx.send(()).unwrap();
            });
        }

        ExecCtx::scope(|ctx| {
            for _ in 0..SUBMISSIONS {
                let done_tx = done_tx.clone();
                let on_flusher = Arc::clone(&on_flusher);
                c.run(
                    Closure::new(move |_| {
                        if thread::current().id() == flusher {
                            let _ = on_flusher.fetch_add(1, Ordering::SeqCst);
                        }
                        done_tx.send(()).unwrap();
                    }),
                    Status::Ok,
                );
            }
            contend_tx.send(()).unwrap();
            ack_rx.recv().unwrap();
            ctx.set_ready_to_finish();
        });

        for _ in 0..SUBMISSIONS + 1 {
            done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
        }
    })
    .unwrap();

    assert!(recorder.count(id, |e| matches!(e, TraceEvent::Offload { .. })) >= 1);
    assert_eq!(on_flusher.load(Ordering::SeqCst), 0);
    clear_trace_sink();
}

#[test]
#[serial]
fn force_offload_hands_work_to_the_pool() {
    const SUBMISSIONS: usize = 10;

    let recorder = Recorder::install();
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let id = c.id();

    let flusher = thread::current().id();
    let on_flusher = Arc::new(AtomicUsize::new(0));
    let (done_tx, done_rx) = unbounded();

    ExecCtx::scope(|_| {
        for _ in 0..SUBMISSIONS {
            let done_tx = done_tx.clone();
            let on_flusher = Arc::clone(&on_flusher);
            c.run(
                Closure::new(move |_| {
                    if thread::current().id() == flusher {
                        let _ = on_flusher.fetch_add(1, Ordering::SeqCst);
                    }
                    done_tx.send(()).unwrap();
                }),
                Status::Ok,
            );
        }
        c.force_offload();
    });

    for _ in 0..SUBMISSIONS {
        done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }
    assert!(recorder.count(id, |e| matches!(e, TraceEvent::Offload { .. })) >= 1);
    assert_eq!(on_flusher.load(Ordering::SeqCst), 0);
    clear_trace_sink();
}

#[test]
#[serial]
fn orphan_mid_drain_runs_everything_and_destroys_once() {
    const SUBMISSIONS: usize = 10;

    let recorder = Recorder::install();
    let pool = Arc::new(ThreadPool::new(2));
    let c = Combiner::new(pool.clone());
    let id = c.id();

    let (started_tx, started_rx) = unbounded::<()>();
    let (done_tx, done_rx) = unbounded::<()>();

    crossbeam_utils::thread::scope(|s| {
        {
            let c = c.clone();
            let _ = s.spawn(move |_| {
                started_rx.recv().unwrap();
                // Last external reference goes away while the flush below is
                // mid-drain.
                drop(c);
            });
        }

        let _ = s.spawn(move |_| {
            ExecCtx::scope(|_| {
                for i in 0..SUBMISSIONS {
                    let started_tx = started_tx.clone();
                    let done_tx = done_tx.clone();
                    c.run(
                        Closure::new(move |_| {
                            if i == 0 {
                                started_tx.send(()).unwrap();
                            }
                            thread::sleep(Duration::from_millis(1));
                            done_tx.send(()).unwrap();
                        }),
                        Status::Ok,
                    );
                }
                drop(c);
            });
        });
    })
    .unwrap();

    for _ in 0..SUBMISSIONS {
        done_rx.recv_timeout(RECV_TIMEOUT).unwrap();
    }
    wait_until(|| recorder.count(id, |e| matches!(e, TraceEvent::CombinerDestroy { .. })) == 1);
    assert_eq!(
        recorder.count(id, |e| matches!(e, TraceEvent::Pop { .. })),
        SUBMISSIONS
    );
    clear_trace_sink();
}

rusty_fork_test! {
    #[test]
    fn run_without_exec_ctx_is_fatal() {
        let pool = Arc::new(ThreadPool::new(1));
        let c = Combiner::new(pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            c.run(Closure::new(|_| {}), Status::Ok);
        }));
        assert!(result.is_err());
    }

    #[test]
    fn force_offload_without_exec_ctx_is_fatal() {
        let pool = Arc::new(ThreadPool::new(1));
        let c = Combiner::new(pool);
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            c.force_offload();
        }));
        assert!(result.is_err());
    }
}

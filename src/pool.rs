//! Off-thread execution of combiner work.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{unbounded, Receiver, Sender};

/// A fire-and-forget unit of work for a worker thread.
pub type Task = Box<dyn FnOnce() + Send>;

/// Runs tasks on some worker thread.
///
/// The combiner uses this to offload its remaining work so the current
/// thread can wind down. Implementations promise execution on a worker
/// thread but no ordering across submissions.
pub trait WorkerPool: Send + Sync {
    /// Schedule `task` to run on a worker thread.
    fn submit(&self, task: Task);
}

/// Fixed-size worker pool backed by an unbounded channel.
///
/// Workers run until the pool drops; dropping joins them, so a pool must be
/// kept alive until the combiners using it are quiescent.
#[derive(Debug)]
pub struct ThreadPool {
    tx: Option<Sender<Task>>,
    workers: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    /// Spawn `n_threads` worker threads.
    pub fn new(n_threads: usize) -> ThreadPool {
        assert!(n_threads > 0, "a worker pool needs at least one thread");
        let (tx, rx) = unbounded::<Task>();
        let workers = (0..n_threads)
            .map(|i| {
                let rx: Receiver<Task> = rx.clone();
                match thread::Builder::new()
                    .name(format!("combiner-worker-{}", i))
                    .spawn(move || {
                        while let Ok(task) = rx.recv() {
                            task();
                        }
                    }) {
                    Ok(handle) => handle,
                    Err(e) => panic!("failed to spawn worker thread: {}", e),
                }
            })
            .collect();
        ThreadPool {
            tx: Some(tx),
            workers,
        }
    }
}

impl WorkerPool for ThreadPool {
    fn submit(&self, task: Task) {
        let sent = match &self.tx {
            Some(tx) => tx.send(task).is_ok(),
            None => false,
        };
        if !sent {
            log::error!("task submitted to a worker pool that has shut down; dropping it");
        }
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        drop(self.tx.take());
        let current = thread::current().id();
        for worker in self.workers.drain(..) {
            // A worker dropping the last pool handle cannot join itself.
            if worker.thread().id() == current {
                continue;
            }
            if worker.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn submitted_tasks_run_on_workers() {
        let ran = Arc::new(AtomicUsize::new(0));
        let (done_tx, done_rx) = unbounded();
        let pool = ThreadPool::new(2);
        for _ in 0..16 {
            let ran = Arc::clone(&ran);
            let done_tx = done_tx.clone();
            pool.submit(Box::new(move || {
                let on_worker = thread::current()
                    .name()
                    .map_or(false, |name| name.starts_with("combiner-worker-"));
                assert!(on_worker, "task ran off the pool");
                let _ = ran.fetch_add(1, Ordering::SeqCst);
                done_tx.send(()).unwrap();
            }));
        }
        for _ in 0..16 {
            done_rx
                .recv_timeout(std::time::Duration::from_secs(5))
                .unwrap();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 16);
        drop(pool);
    }
}

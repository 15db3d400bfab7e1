//! Serial task executor backing all GPU-side pipeline work.
//!
//! Every component that touches GPU state funnels its work through one
//! [`TaskExecutor`], which owns a single worker thread. Tasks therefore
//! run strictly one at a time, which is what makes the rest of the
//! pipeline safe to write without per-resource locking on the GPU side.

use std::collections::VecDeque;
use std::sync::{Arc, OnceLock};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, Sender};
use frame::PipelineError;
use parking_lot::Mutex;
use tracing::{debug, warn};

/// A unit of work for the executor. Errors are routed to the executor's
/// error listener, not back to the submitter.
pub type Task = Box<dyn FnOnce() -> Result<(), PipelineError> + Send>;

type ErrorListener = Box<dyn Fn(PipelineError) + Send + Sync>;

enum Message {
    /// Ordinary FIFO task, skipped while the executor is cancelling.
    Task(Task),
    /// Runs even while cancelling; used by `flush` to fence the queue.
    Barrier(Task),
    /// Final task; the worker exits after running it.
    Shutdown(Task),
}

struct Inner {
    tx: Sender<Message>,
    /// Drained ahead of the next ordinary task.
    high_priority: Mutex<VecDeque<Task>>,
    /// While set, ordinary and high-priority tasks are discarded instead
    /// of run. Set on error and on flush; cleared by the flush barrier.
    cancelling: Mutex<bool>,
    /// Latches after the first reported error so the listener fires once.
    errored: Mutex<bool>,
    listener: ErrorListener,
    worker_id: OnceLock<ThreadId>,
    join: Mutex<Option<JoinHandle<()>>>,
}

impl Inner {
    fn run(&self, task: Task) {
        if let Err(e) = task() {
            self.handle_error(e);
        }
    }

    fn handle_error(&self, error: PipelineError) {
        {
            *self.cancelling.lock() = true;
            self.high_priority.lock().clear();
        }
        let first = {
            let mut errored = self.errored.lock();
            !std::mem::replace(&mut *errored, true)
        };
        if first {
            warn!(%error, "task failed; cancelling pending work");
            (self.listener)(error);
        } else {
            debug!(%error, "task failed after earlier error; dropped");
        }
    }
}

/// Single-threaded executor with a FIFO queue, a high-priority queue that
/// jumps ahead of pending ordinary tasks, and flush/release barriers.
#[derive(Clone)]
pub struct TaskExecutor {
    inner: Arc<Inner>,
}

impl TaskExecutor {
    /// Spawns the worker thread. `listener` receives the first task error
    /// (later errors while cancelling are dropped) and any release timeout.
    pub fn new(
        thread_name: &str,
        listener: impl Fn(PipelineError) + Send + Sync + 'static,
    ) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            tx,
            high_priority: Mutex::new(VecDeque::new()),
            cancelling: Mutex::new(false),
            errored: Mutex::new(false),
            listener: Box::new(listener),
            worker_id: OnceLock::new(),
            join: Mutex::new(None),
        });
        let worker_inner = Arc::clone(&inner);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || run_worker(worker_inner, rx))
            .unwrap_or_else(|e| panic!("failed to spawn executor thread: {e}"));
        *inner.join.lock() = Some(handle);
        Self { inner }
    }

    /// Appends a task to the FIFO queue.
    pub fn submit(&self, task: impl FnOnce() -> Result<(), PipelineError> + Send + 'static) {
        let _ = self.inner.tx.send(Message::Task(Box::new(task)));
    }

    /// Queues a task to run before any not-yet-started ordinary task.
    /// High-priority tasks run in FIFO order among themselves.
    pub fn submit_high_priority(
        &self,
        task: impl FnOnce() -> Result<(), PipelineError> + Send + 'static,
    ) {
        // While cancelling, the task is dropped like an ordinary one
        // instead of lingering in the deque.
        if *self.inner.cancelling.lock() {
            return;
        }
        self.inner.high_priority.lock().push_back(Box::new(task));
        // Wake the worker in case its queue is empty; the no-op task also
        // triggers the high-priority drain.
        self.submit(|| Ok(()));
    }

    /// Discards all pending tasks and blocks until the worker has passed
    /// the discard point. Also clears an earlier error latch, so the
    /// executor accepts work again afterwards.
    pub fn flush(&self) {
        {
            *self.inner.cancelling.lock() = true;
            self.inner.high_priority.lock().clear();
        }
        let (done_tx, done_rx) = bounded(1);
        let inner = Arc::clone(&self.inner);
        let barrier: Task = Box::new(move || {
            *inner.cancelling.lock() = false;
            *inner.errored.lock() = false;
            let _ = done_tx.send(());
            Ok(())
        });
        if self.inner.tx.send(Message::Barrier(barrier)).is_err() {
            return;
        }
        debug!("flushing task executor");
        let _ = done_rx.recv();
    }

    /// Cancels pending tasks, runs `cleanup` as the final task, and waits
    /// up to `timeout` for it. On timeout the worker is left to finish on
    /// its own and the error listener is notified; release still returns.
    pub fn release(
        &self,
        cleanup: impl FnOnce() -> Result<(), PipelineError> + Send + 'static,
        timeout: Duration,
    ) {
        {
            *self.inner.cancelling.lock() = true;
            self.inner.high_priority.lock().clear();
        }
        let (done_tx, done_rx) = bounded(1);
        let task: Task = Box::new(move || {
            let result = cleanup();
            let _ = done_tx.send(());
            result
        });
        if self.inner.tx.send(Message::Shutdown(task)).is_err() {
            return;
        }
        match done_rx.recv_timeout(timeout) {
            Ok(()) => {
                if let Some(handle) = self.inner.join.lock().take() {
                    let _ = handle.join();
                }
            }
            Err(_) => {
                warn!(?timeout, "executor release timed out");
                (self.inner.listener)(PipelineError::Timeout {
                    operation: "task executor release",
                    timeout,
                });
            }
        }
    }

    /// Whether the calling thread is the executor's worker thread.
    pub fn is_on_worker_thread(&self) -> bool {
        self.inner
            .worker_id
            .get()
            .is_some_and(|id| *id == thread::current().id())
    }
}

fn run_worker(inner: Arc<Inner>, rx: Receiver<Message>) {
    let _ = inner.worker_id.set(thread::current().id());
    while let Ok(message) = rx.recv() {
        match message {
            Message::Task(task) => {
                if *inner.cancelling.lock() {
                    continue;
                }
                loop {
                    let next = inner.high_priority.lock().pop_front();
                    match next {
                        Some(task) => inner.run(task),
                        None => break,
                    }
                }
                // A high-priority task may have errored in the meantime.
                if *inner.cancelling.lock() {
                    continue;
                }
                inner.run(task);
            }
            Message::Barrier(task) => {
                let _ = task();
            }
            Message::Shutdown(task) => {
                inner.run(task);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, TaskExecutor) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let executor = TaskExecutor::new("test-executor", |_| {});
        (log, executor)
    }

    fn record(log: &Arc<Mutex<Vec<&'static str>>>, entry: &'static str) -> Task {
        let log = Arc::clone(log);
        Box::new(move || {
            log.lock().push(entry);
            Ok(())
        })
    }

    /// Blocks until the worker has run every ordinary task submitted so
    /// far, so a following `release` cannot cancel them.
    fn rendezvous(executor: &TaskExecutor) {
        let (tx, rx) = bounded(1);
        executor.submit(move || {
            let _ = tx.send(());
            Ok(())
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
    }

    #[test]
    fn ordinary_tasks_run_in_submission_order() {
        let (log, executor) = recorder();
        for entry in ["a", "b", "c"] {
            let task = record(&log, entry);
            executor.submit(task);
        }
        rendezvous(&executor);
        executor.release(|| Ok(()), Duration::from_secs(5));
        assert_eq!(*log.lock(), vec!["a", "b", "c"]);
    }

    #[test]
    fn high_priority_tasks_jump_the_queue() {
        let (log, executor) = recorder();
        let (gate_tx, gate_rx) = bounded::<()>(0);

        // Hold the worker inside a task so later submissions pile up.
        executor.submit(move || {
            let _ = gate_rx.recv();
            Ok(())
        });
        let d1 = record(&log, "ordinary");
        executor.submit(d1);
        let h1 = record(&log, "priority-1");
        executor.submit_high_priority(h1);
        let h2 = record(&log, "priority-2");
        executor.submit_high_priority(h2);

        gate_tx.send(()).unwrap();
        executor.release(|| Ok(()), Duration::from_secs(5));
        assert_eq!(*log.lock(), vec!["priority-1", "priority-2", "ordinary"]);
    }

    #[test]
    fn flush_discards_pending_tasks() {
        let (log, executor) = recorder();
        let (gate_tx, gate_rx) = bounded::<()>(0);

        executor.submit(move || {
            let _ = gate_rx.recv();
            Ok(())
        });
        let pending = record(&log, "should-not-run");
        executor.submit(pending);

        let unblock = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            let _ = gate_tx.send(());
        });
        executor.flush();
        unblock.join().unwrap();

        let after = record(&log, "after-flush");
        executor.submit(after);
        rendezvous(&executor);
        executor.release(|| Ok(()), Duration::from_secs(5));
        assert_eq!(*log.lock(), vec!["after-flush"]);
    }

    #[test]
    fn first_error_reaches_listener_and_cancels_later_work() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let ran = Arc::new(AtomicUsize::new(0));
        let e = Arc::clone(&errors);
        let (err_tx, err_rx) = bounded(1);
        let executor = TaskExecutor::new("test-executor", move |err| {
            e.lock().push(err.to_string());
            let _ = err_tx.send(());
        });

        executor.submit(|| Err(PipelineError::Gpu("lost context".into())));
        executor.submit(|| Err(PipelineError::Gpu("second".into())));
        let r = Arc::clone(&ran);
        executor.submit(move || {
            r.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        err_rx.recv_timeout(Duration::from_secs(5)).unwrap();
        executor.release(|| Ok(()), Duration::from_secs(5));

        assert_eq!(errors.lock().len(), 1);
        assert!(errors.lock()[0].contains("lost context"));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn high_priority_submitted_while_cancelling_is_dropped() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (err_tx, err_rx) = bounded(1);
        let executor = TaskExecutor::new("test-executor", move |_| {
            let _ = err_tx.send(());
        });

        executor.submit(|| Err(PipelineError::Gpu("lost context".into())));
        err_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The executor is cancelling; the task must be dropped at the
        // submission point, not parked in the deque.
        let payload = Arc::new(());
        let held = Arc::clone(&payload);
        let late = record(&log, "late-priority");
        executor.submit_high_priority(move || {
            let _ = &held;
            late()
        });
        assert_eq!(Arc::strong_count(&payload), 1);

        // Even after a flush clears the cancelling latch it never runs.
        executor.flush();
        let after = record(&log, "after-flush");
        executor.submit(after);
        rendezvous(&executor);
        executor.release(|| Ok(()), Duration::from_secs(5));
        assert_eq!(*log.lock(), vec!["after-flush"]);
    }

    #[test]
    fn release_runs_cleanup_last() {
        let (log, executor) = recorder();
        let t = record(&log, "work");
        executor.submit(t);
        rendezvous(&executor);
        let cleanup_log = Arc::clone(&log);
        executor.release(
            move || {
                cleanup_log.lock().push("cleanup");
                Ok(())
            },
            Duration::from_secs(5),
        );
        assert_eq!(*log.lock(), vec!["work", "cleanup"]);
    }

    #[test]
    fn release_timeout_is_reported_not_fatal() {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let e = Arc::clone(&errors);
        let executor = TaskExecutor::new("test-executor", move |err| {
            e.lock().push(err.to_string());
        });
        executor.release(
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
            Duration::from_millis(10),
        );
        let errors = errors.lock();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("timed out"), "got: {}", errors[0]);
    }

    #[test]
    fn worker_thread_identity() {
        let executor = TaskExecutor::new("test-executor", |_| {});
        assert!(!executor.is_on_worker_thread());
        let (tx, rx) = bounded(1);
        let handle = executor.clone();
        executor.submit(move || {
            let _ = tx.send(handle.is_on_worker_thread());
            Ok(())
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        executor.release(|| Ok(()), Duration::from_secs(5));
    }
}

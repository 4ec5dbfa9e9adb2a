//! A fixed pool of worker threads with per-task futures.
//!
//! Tasks are `FnOnce` closures pushed onto an unbounded FIFO guarded by a
//! mutex and condvar. Every scheduled task runs exactly once unless the
//! pool is stopped with `cancel`, in which case queued tasks complete as
//! `Canceled` without running.

use std::{
    collections::VecDeque,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex},
    thread,
};

use axon_timing::Timespan;
use tracing::{debug, warn};

/// Lifecycle of one scheduled task.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum FutureState {
    Waiting,
    Running,
    Finished,
    Failed,
    Canceled,
}

impl FutureState {
    pub fn is_terminal(self) -> bool {
        matches!(self, FutureState::Finished | FutureState::Failed | FutureState::Canceled)
    }
}

struct FutureShared {
    state: Mutex<FutureState>,
    cond: Condvar,
}

impl FutureShared {
    fn set(&self, state: FutureState) {
        *self.state.lock().unwrap() = state;
        self.cond.notify_all();
    }
}

/// Completion handle of one scheduled task.
#[derive(Clone)]
pub struct Future {
    shared: Arc<FutureShared>,
}

impl Future {
    fn new() -> Self {
        Future {
            shared: Arc::new(FutureShared {
                state: Mutex::new(FutureState::Waiting),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn state(&self) -> FutureState {
        *self.shared.state.lock().unwrap()
    }

    /// Blocks until the task reaches a terminal state or the timeout
    /// expires; returns the state seen last.
    pub fn wait(&self, timeout: Option<Timespan>) -> FutureState {
        let mut state = self.shared.state.lock().unwrap();
        match timeout {
            None => {
                while !state.is_terminal() {
                    state = self.shared.cond.wait(state).unwrap();
                }
            }
            Some(t) => {
                let deadline = std::time::Instant::now() + t.to_std();
                while !state.is_terminal() {
                    let left = deadline.saturating_duration_since(std::time::Instant::now());
                    if left.is_zero() {
                        break;
                    }
                    let (guard, _timeout) = self.shared.cond.wait_timeout(state, left).unwrap();
                    state = guard;
                }
            }
        }
        *state
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

struct PoolShared {
    queue: Mutex<QueueInner>,
    cond: Condvar,
}

struct QueueInner {
    tasks: VecDeque<(Task, Arc<FutureShared>)>,
    /// Workers drain remaining tasks, then exit.
    stopping: bool,
}

impl PoolShared {
    fn worker_loop(&self) {
        loop {
            let entry = {
                let mut queue = self.queue.lock().unwrap();
                loop {
                    if let Some(entry) = queue.tasks.pop_front() {
                        break Some(entry);
                    }
                    if queue.stopping {
                        break None;
                    }
                    queue = self.cond.wait(queue).unwrap();
                }
            };
            let Some((task, future)) = entry else { return };

            future.set(FutureState::Running);
            match catch_unwind(AssertUnwindSafe(task)) {
                Ok(()) => future.set(FutureState::Finished),
                Err(_) => {
                    warn!("worker task panicked");
                    future.set(FutureState::Failed);
                }
            }
        }
    }
}

/// A fixed pool of worker threads.
pub struct ThreadPool {
    shared: Arc<PoolShared>,
    workers: Vec<thread::JoinHandle<()>>,
    size: usize,
    state: PoolState,
}

impl ThreadPool {
    /// A stopped pool of `size` workers; call [`start`](Self::start).
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        ThreadPool {
            shared: Arc::new(PoolShared {
                queue: Mutex::new(QueueInner { tasks: VecDeque::new(), stopping: false }),
                cond: Condvar::new(),
            }),
            workers: Vec::with_capacity(size),
            size,
            state: PoolState::Stopped,
        }
    }

    /// A pool that is already running.
    pub fn running(size: usize) -> Self {
        let mut pool = Self::new(size);
        pool.start();
        pool
    }

    pub fn state(&self) -> PoolState {
        self.state
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Spawns the workers. Tasks scheduled while stopped are queued and
    /// picked up here.
    pub fn start(&mut self) {
        if self.state == PoolState::Running {
            return;
        }
        self.state = PoolState::Starting;
        self.shared.queue.lock().unwrap().stopping = false;
        for n in self.workers.len()..self.size {
            let shared = Arc::clone(&self.shared);
            let handle = thread::Builder::new()
                .name(format!("pool-worker-{n}"))
                .spawn(move || shared.worker_loop())
                .expect("spawn worker");
            self.workers.push(handle);
        }
        self.state = PoolState::Running;
        debug!(workers = self.workers.len(), "pool running");
    }

    /// Queues a task and returns its future.
    pub fn schedule(&self, task: impl FnOnce() + Send + 'static) -> Future {
        let future = Future::new();
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.tasks.push_back((Box::new(task), Arc::clone(&future.shared)));
        }
        self.shared.cond.notify_one();
        future
    }

    /// Stops the pool. With `cancel` false the queue drains first; with
    /// `cancel` true queued tasks are discarded and their futures become
    /// `Canceled`. Blocks until every worker has exited.
    pub fn stop(&mut self, cancel: bool) {
        if self.state == PoolState::Stopped {
            return;
        }
        self.state = PoolState::Stopping;
        {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.stopping = true;
            if cancel {
                for (_, future) in queue.tasks.drain(..) {
                    future.set(FutureState::Canceled);
                }
            }
        }
        self.shared.cond.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
        self.state = PoolState::Stopped;
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        self.stop(false);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn every_task_runs_exactly_once() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut pool = ThreadPool::running(4);

        let futures: Vec<Future> = (0..100)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.schedule(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        pool.stop(false);
        assert_eq!(counter.load(Ordering::Relaxed), 100);
        for future in futures {
            assert_eq!(future.state(), FutureState::Finished);
        }
    }

    #[test]
    fn future_wait_blocks_until_done() {
        let mut pool = ThreadPool::running(1);
        let future = pool.schedule(|| thread::sleep(std::time::Duration::from_millis(20)));
        assert_eq!(future.wait(None), FutureState::Finished);
        pool.stop(false);
    }

    #[test]
    fn wait_timeout_returns_nonterminal() {
        let mut pool = ThreadPool::running(1);
        let blocker = pool.schedule(|| thread::sleep(std::time::Duration::from_millis(200)));
        let state = blocker.wait(Some(Timespan::from_millis(20)));
        assert!(!state.is_terminal());
        assert_eq!(blocker.wait(None), FutureState::Finished);
        pool.stop(false);
    }

    #[test]
    fn panicking_task_fails_its_future() {
        let mut pool = ThreadPool::running(1);
        let bad = pool.schedule(|| panic!("boom"));
        assert_eq!(bad.wait(None), FutureState::Failed);
        // the worker survives
        let good = pool.schedule(|| {});
        assert_eq!(good.wait(None), FutureState::Finished);
        pool.stop(false);
    }

    #[test]
    fn stop_with_cancel_discards_queued_tasks() {
        let counter = Arc::new(AtomicU32::new(0));
        let mut pool = ThreadPool::running(1);

        // the first task blocks the single worker while we queue more
        let gate = Arc::new(Mutex::new(()));
        let held = gate.lock().unwrap();
        {
            let gate = Arc::clone(&gate);
            pool.schedule(move || {
                drop(gate.lock().unwrap());
            });
        }
        thread::sleep(std::time::Duration::from_millis(20));

        let queued: Vec<Future> = (0..5)
            .map(|_| {
                let counter = Arc::clone(&counter);
                pool.schedule(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
            })
            .collect();

        drop(held);
        pool.stop(true);

        // the in-flight task may have run, the queued ones must not all
        // have
        for future in &queued {
            assert!(matches!(future.state(), FutureState::Canceled | FutureState::Finished));
        }
        assert!(counter.load(Ordering::Relaxed) < 5 || queued.iter().all(|f| f.state() == FutureState::Finished));
        pool.stop(false);
    }

    #[test]
    fn lifecycle_states() {
        let mut pool = ThreadPool::new(2);
        assert_eq!(pool.state(), PoolState::Stopped);
        pool.start();
        assert_eq!(pool.state(), PoolState::Running);
        pool.stop(false);
        assert_eq!(pool.state(), PoolState::Stopped);
    }
}

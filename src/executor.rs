// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::replay::ReplayPosition;
use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    thread::JoinHandle,
};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct PoolInner {
    queue: Mutex<PoolQueue>,
    not_empty: Condvar,
    not_full: Condvar,
    capacity: usize,
}

struct PoolQueue {
    jobs: VecDeque<Job>,
    shutdown: bool,
}

/// Fixed-size worker pool with a bounded queue
///
/// Submission blocks once the queue is full, which is how writers are
/// admission-throttled when flushes fall behind.
pub struct ThreadPool {
    inner: Arc<PoolInner>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadPool {
    #[must_use]
    pub fn new(name: &str, workers: usize, queue_capacity: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: Mutex::new(PoolQueue {
                jobs: VecDeque::new(),
                shutdown: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            capacity: queue_capacity.max(1),
        });

        let threads = (0..workers.max(1))
            .map(|idx| {
                let inner = inner.clone();

                #[allow(clippy::expect_used)]
                std::thread::Builder::new()
                    .name(format!("{name}-{idx}"))
                    .spawn(move || worker_loop(&inner))
                    .expect("should spawn thread")
            })
            .collect();

        Self { inner, threads }
    }

    /// Submits a job, blocking while the queue is at capacity.
    pub fn execute<F: FnOnce() + Send + 'static>(&self, job: F) {
        #[allow(clippy::expect_used)]
        let mut queue = self.inner.queue.lock().expect("lock is poisoned");

        while queue.jobs.len() >= self.inner.capacity && !queue.shutdown {
            #[allow(clippy::expect_used)]
            {
                queue = self
                    .inner
                    .not_full
                    .wait(queue)
                    .expect("lock is poisoned");
            }
        }

        if queue.shutdown {
            return;
        }

        queue.jobs.push_back(Box::new(job));
        drop(queue);

        self.inner.not_empty.notify_one();
    }
}

fn worker_loop(inner: &PoolInner) {
    loop {
        let job = {
            #[allow(clippy::expect_used)]
            let mut queue = inner.queue.lock().expect("lock is poisoned");

            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    inner.not_full.notify_one();
                    break job;
                }

                if queue.shutdown {
                    return;
                }

                #[allow(clippy::expect_used)]
                {
                    queue = inner.not_empty.wait(queue).expect("lock is poisoned");
                }
            }
        };

        job();
    }
}

impl Drop for ThreadPool {
    fn drop(&mut self) {
        {
            #[allow(clippy::expect_used)]
            let mut queue = self.inner.queue.lock().expect("lock is poisoned");
            queue.shutdown = true;
        }

        self.inner.not_empty.notify_all();
        self.inner.not_full.notify_all();

        let current = std::thread::current().id();

        for handle in self.threads.drain(..) {
            // A worker can end up dropping the pool itself (a background
            // task may hold the last reference to the owning context);
            // it cannot join itself, so it is detached instead
            if handle.thread().id() == current {
                continue;
            }

            if handle.join().is_err() {
                log::error!("worker thread panicked");
            }
        }
    }
}

/// One-shot completion handle for a submitted task
pub struct TaskFuture<T> {
    state: Arc<(Mutex<Option<T>>, Condvar)>,
}

/// Producer side of a [`TaskFuture`]
pub struct Promise<T> {
    state: Arc<(Mutex<Option<T>>, Condvar)>,
}

/// Creates a connected promise/future pair.
#[must_use]
pub fn promise<T>() -> (Promise<T>, TaskFuture<T>) {
    let state = Arc::new((Mutex::new(None), Condvar::new()));

    (
        Promise {
            state: state.clone(),
        },
        TaskFuture { state },
    )
}

impl<T> Promise<T> {
    pub fn complete(self, value: T) {
        #[allow(clippy::expect_used)]
        let mut slot = self.state.0.lock().expect("lock is poisoned");
        *slot = Some(value);
        drop(slot);

        self.state.1.notify_all();
    }
}

impl<T> TaskFuture<T> {
    /// Blocks until the task completes.
    #[must_use]
    pub fn wait(self) -> T {
        #[allow(clippy::expect_used)]
        let mut slot = self.state.0.lock().expect("lock is poisoned");

        loop {
            if let Some(value) = slot.take() {
                return value;
            }

            #[allow(clippy::expect_used)]
            {
                slot = self.state.1.wait(slot).expect("lock is poisoned");
            }
        }
    }
}

struct SignalEntry {
    ticket: u64,
    position: ReplayPosition,
    callback: Option<Box<dyn FnOnce(ReplayPosition) + Send + 'static>>,
    done: bool,
}

/// Orders flush-completion callbacks by commit-log position
///
/// Flushes are registered under the store's switch lock, so registration
/// order equals position order; completions may arrive in any order, but
/// callbacks only fire once every earlier registration has completed.
/// Firing happens under the stage lock, so callbacks are serialized like
/// a dedicated signal thread would.
#[derive(Default)]
pub struct FlushSignal {
    inner: Mutex<FlushSignalInner>,
}

#[derive(Default)]
struct FlushSignalInner {
    entries: VecDeque<SignalEntry>,
    next_ticket: u64,
}

impl FlushSignal {
    /// Registers a flush at the given position; returns its ticket.
    pub fn register<F: FnOnce(ReplayPosition) + Send + 'static>(
        &self,
        position: ReplayPosition,
        callback: F,
    ) -> u64 {
        #[allow(clippy::expect_used)]
        let mut inner = self.inner.lock().expect("lock is poisoned");

        debug_assert!(
            inner.entries.back().is_none_or(|e| e.position <= position),
            "flush registration out of position order",
        );

        let ticket = inner.next_ticket;
        inner.next_ticket += 1;

        inner.entries.push_back(SignalEntry {
            ticket,
            position,
            callback: Some(Box::new(callback)),
            done: false,
        });

        ticket
    }

    /// Marks a flush complete and fires every callback that is now
    /// unblocked, in registration (= position) order.
    pub fn complete(&self, ticket: u64) {
        let ready = {
            #[allow(clippy::expect_used)]
            let mut inner = self.inner.lock().expect("lock is poisoned");

            if let Some(entry) = inner.entries.iter_mut().find(|e| e.ticket == ticket) {
                entry.done = true;
            }

            let mut ready = vec![];

            while inner.entries.front().is_some_and(|e| e.done) {
                #[allow(clippy::expect_used)]
                let entry = inner.entries.pop_front().expect("just checked");
                ready.push(entry);
            }

            ready
        };

        for entry in ready {
            if let Some(callback) = entry.callback {
                callback(entry.position);
            }
        }
    }
}

/// The process-wide task pools of one storage context
pub struct Executor {
    pub flush_pool: ThreadPool,
    pub compaction_pool: ThreadPool,
    pub meter_pool: ThreadPool,
    pub flush_signal: FlushSignal,
}

impl Executor {
    #[must_use]
    pub fn new(flush_writers: usize, flush_queue_size: usize, compaction_threads: usize) -> Self {
        Self {
            flush_pool: ThreadPool::new("flush", flush_writers, flush_queue_size),
            compaction_pool: ThreadPool::new("compaction", compaction_threads, 64),
            meter_pool: ThreadPool::new("meter", 1, 8),
            flush_signal: FlushSignal::default(),
        }
    }
}

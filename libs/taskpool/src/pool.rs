// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, Waker};
use std::thread;

use static_assertions::assert_impl_all;

/// A fixed set of worker threads consuming a FIFO queue of pending
/// resumptions.
///
/// Tasks move themselves onto the pool by awaiting [`Pool::schedule`]; the
/// await resumes on whichever worker dequeues the continuation. Handles are
/// cheap to clone so tasks can capture the pool they run on; the workers shut
/// down when the last handle is dropped.
///
/// Shutdown is deliberately not graceful towards stragglers: continuations
/// still queued when the last handle drops are released without ever being
/// resumed. Callers are expected to have synced on all outstanding work (via
/// [`sync_wait`][crate::sync_wait] or by awaiting their tasks) before letting
/// the pool go.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<Inner>,
}

assert_impl_all!(Pool: Send, Sync);

struct Inner {
    shared: Arc<Shared>,
    workers: Vec<thread::JoinHandle<()>>,
}

struct Shared {
    queue: Mutex<Queue>,
    cvar: Condvar,
}

struct Queue {
    pending: VecDeque<Waker>,
    running: bool,
}

// === impl Pool ===

impl Pool {
    /// Start a pool with `workers` worker threads, named `worker-0` through
    /// `worker-{n-1}`.
    ///
    /// # Panics
    ///
    /// Panics if `workers` is zero or if spawning a worker thread fails;
    /// a pool that cannot run anything has no sensible degraded mode.
    pub fn new(workers: usize) -> Self {
        assert!(workers > 0, "a pool needs at least one worker");

        let shared = Arc::new(Shared {
            queue: Mutex::new(Queue {
                pending: VecDeque::new(),
                running: true,
            }),
            cvar: Condvar::new(),
        });

        let workers = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("worker-{id}"))
                    .spawn(move || worker_loop(&shared, id))
                    .unwrap_or_else(|err| panic!("failed to spawn worker thread: {err}"))
            })
            .collect();

        Self {
            inner: Arc::new(Inner { shared, workers }),
        }
    }

    /// An awaitable that unconditionally suspends the current task and moves
    /// its continuation to the back of the pool's queue. The await returns on
    /// one of the pool's worker threads.
    pub fn schedule(&self) -> Schedule {
        Schedule {
            shared: Arc::clone(&self.inner.shared),
            enqueued: false,
        }
    }

    /// The number of worker threads.
    pub fn worker_count(&self) -> usize {
        self.inner.workers.len()
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("workers", &self.inner.workers.len())
            .field("handles", &Arc::strong_count(&self.inner))
            .finish()
    }
}

// === impl Inner ===

impl Drop for Inner {
    fn drop(&mut self) {
        let abandoned = {
            let mut queue = self.shared.queue.lock().unwrap();
            queue.running = false;
            queue.pending.len()
        };
        if abandoned > 0 {
            tracing::debug!(abandoned, "shutting down with unresumed continuations");
        } else {
            tracing::debug!("shutting down");
        }
        self.shared.cvar.notify_all();

        // A task holding the last handle can finish on a worker, putting this
        // drop *on* that worker; joining would deadlock on ourselves, so the
        // threads are detached instead and exit on their own.
        let current = thread::current().id();
        if self.workers.iter().any(|w| w.thread().id() == current) {
            tracing::error!("last pool handle dropped on a worker thread, detaching workers");
            self.workers.clear();
            return;
        }

        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                tracing::error!("worker thread panicked");
            }
        }
    }
}

// === impl Shared ===

impl Shared {
    /// Block until a continuation is available or the pool shuts down.
    ///
    /// The shutdown check comes first: continuations still queued at shutdown
    /// are dropped, not drained.
    fn next(&self) -> Option<Waker> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if !queue.running {
                return None;
            }
            if let Some(waker) = queue.pending.pop_front() {
                return Some(waker);
            }
            queue = self.cvar.wait(queue).unwrap();
        }
    }

    fn enqueue(&self, waker: Waker) {
        let mut queue = self.queue.lock().unwrap();
        queue.pending.push_back(waker);
        drop(queue);
        self.cvar.notify_one();
    }
}

fn worker_loop(shared: &Shared, id: usize) {
    tracing::trace!(worker = id, "worker up");
    while let Some(waker) = shared.next() {
        // Resume outside the queue lock. The continuation runs arbitrary task
        // code here and may enqueue more work, on this pool or another.
        waker.wake();
    }
    tracing::trace!(worker = id, "worker down");
}

// === impl Schedule ===

/// Future returned by [`Pool::schedule`].
#[must_use = "futures do nothing unless awaited"]
pub struct Schedule {
    shared: Arc<Shared>,
    enqueued: bool,
}

impl Future for Schedule {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.enqueued {
            return Poll::Ready(());
        }

        self.enqueued = true;
        tracing::trace!("moving continuation onto the pool");
        self.shared.enqueue(cx.waker().clone());
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::join::{join_all, sync_wait};
    use crate::task::Task;
    use std::collections::{BTreeSet, HashSet};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::thread::ThreadId;
    use tracing_subscriber::EnvFilter;
    use tracing_subscriber::util::SubscriberInitExt;

    #[test]
    fn schedule_resumes_on_a_worker_thread() {
        let pool = Pool::new(2);
        let caller = thread::current().id();

        let task = Task::spawn({
            let pool = pool.clone();
            async move {
                pool.schedule().await;
                thread::current().id()
            }
        });

        let resumed_on = sync_wait(task);
        assert_ne!(resumed_on, caller);
    }

    #[test]
    fn fan_out_runs_every_task() {
        let _trace = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_thread_names(true)
            .set_default();

        let pool = Pool::new(12);

        let tasks: Vec<Task<usize>> = (0..100)
            .map(|i| {
                let pool = pool.clone();
                Task::spawn(async move {
                    pool.schedule().await;
                    i
                })
            })
            .collect();

        let values = sync_wait(Task::spawn(join_all(tasks)));
        assert_eq!(values.len(), 100);
        assert_eq!(
            values.iter().copied().collect::<BTreeSet<_>>(),
            (0..100).collect::<BTreeSet<_>>()
        );
    }

    #[test]
    fn distinct_workers_run_concurrently() {
        let pool = Pool::new(4);

        // Each task refuses to finish until it has seen the other one start,
        // which can only happen if two workers run them at the same time.
        let mine = Arc::new(AtomicBool::new(false));
        let theirs = Arc::new(AtomicBool::new(false));

        let rendezvous = |set: Arc<AtomicBool>, wait: Arc<AtomicBool>| {
            let pool = pool.clone();
            Task::spawn(async move {
                pool.schedule().await;
                set.store(true, Ordering::Release);
                while !wait.load(Ordering::Acquire) {
                    std::hint::spin_loop();
                }
                thread::current().id()
            })
        };

        let a = rendezvous(Arc::clone(&mine), Arc::clone(&theirs));
        let b = rendezvous(theirs, mine);

        let ids: HashSet<ThreadId> = [sync_wait(a), sync_wait(b)].into_iter().collect();
        assert_eq!(ids.len(), 2);
    }

    #[test]
    fn dropping_the_last_handle_joins_the_workers() {
        let pool = Pool::new(3);
        let task = Task::spawn({
            let pool = pool.clone();
            async move {
                pool.schedule().await;
                1_u8
            }
        });
        assert_eq!(sync_wait(task), 1);

        // All work is synced; this drop must not hang.
        drop(pool);
    }
}

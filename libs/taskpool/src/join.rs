// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::future::Future;
use std::pin::pin;
use std::sync::{Arc, Condvar, Mutex};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use crate::task::Task;

/// Block the calling OS thread until `future` completes, returning its
/// output.
///
/// This is the bridge from synchronous code into the task world: the common
/// use is handing it a [`Task`] clone. The calling thread does not run any
/// task code while blocked; it polls, and while the future is pending it
/// sleeps on a single-shot join cell that completion wakes.
pub fn sync_wait<F: Future>(future: F) -> F::Output {
    let cell = JoinCell::new();
    let waker = Arc::clone(&cell).into_waker();
    let mut cx = Context::from_waker(&waker);

    let mut future = pin!(future);
    loop {
        match future.as_mut().poll(&mut cx) {
            Poll::Ready(output) => return output,
            Poll::Pending => cell.wait(),
        }
    }
}

/// Await every task in `tasks`, in input order, collecting the values.
///
/// Completes as soon as the last input completes; an empty input completes
/// immediately with an empty `Vec`. The awaits are sequential, which costs no
/// wall-clock time: the inputs are already running (on the pool or wherever
/// they were spawned) independently of being awaited.
pub async fn join_all<T, I>(tasks: I) -> Vec<T>
where
    I: IntoIterator<Item = Task<T>>,
    T: Clone,
{
    let mut values = Vec::new();
    for task in tasks {
        values.push(task.await);
    }
    values
}

/// Await a fixed list of tasks with distinct result types, yielding the
/// positional tuple of their values.
///
/// ```
/// # use taskpool::{Task, join};
/// # taskpool::sync_wait(Task::spawn(async {
/// let (a, b) = join!(Task::spawn(async { true }), Task::spawn(async { 42 }));
/// assert!(a);
/// assert_eq!(b, 42);
/// # }));
/// ```
///
/// Like [`join_all`], the awaits are sequential; the inputs should be
/// already-running tasks, not lazy futures.
#[macro_export]
macro_rules! join {
    ($($task:expr),+ $(,)?) => {
        ($($task.await,)+)
    };
}

/// A single-shot flag that parks an OS thread until a task completion path
/// signals it.
///
/// The cell is installed (as the waker) before the future is first polled, so
/// a completion racing with [`JoinCell::wait`] is never lost: the notify
/// flips the flag under the lock and the wait re-checks it.
struct JoinCell {
    signalled: Mutex<bool>,
    cvar: Condvar,
}

// === impl JoinCell ===

impl JoinCell {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            signalled: Mutex::new(false),
            cvar: Condvar::new(),
        })
    }

    fn notify(&self) {
        *self.signalled.lock().unwrap() = true;
        self.cvar.notify_one();
    }

    fn wait(&self) {
        let mut signalled = self.signalled.lock().unwrap();
        while !*signalled {
            signalled = self.cvar.wait(signalled).unwrap();
        }
        // Reset so the next pending poll can park again.
        *signalled = false;
    }

    const WAKER_VTABLE: RawWakerVTable = RawWakerVTable::new(
        Self::waker_clone,
        Self::waker_wake,
        Self::waker_wake_by_ref,
        Self::waker_drop,
    );

    fn into_waker(self: Arc<Self>) -> Waker {
        // Safety: the vtable functions below maintain the Arc's reference
        // count through the raw pointer and never alias a &mut.
        unsafe { Waker::from_raw(Self::into_raw_waker(self)) }
    }

    fn into_raw(this: Arc<Self>) -> *const () {
        Arc::into_raw(this).cast::<()>()
    }

    unsafe fn from_raw(ptr: *const ()) -> Arc<Self> {
        // Safety: ensured by caller
        unsafe { Arc::from_raw(ptr.cast::<Self>()) }
    }

    // Kept out of line so clones keep the same vtable address and
    // `Waker::will_wake` keeps recognising this waker; see the task core.
    #[inline(never)]
    fn into_raw_waker(this: Arc<Self>) -> RawWaker {
        RawWaker::new(Self::into_raw(this), &Self::WAKER_VTABLE)
    }

    unsafe fn waker_clone(raw: *const ()) -> RawWaker {
        // Safety: ensured by VTable
        unsafe {
            Arc::increment_strong_count(raw.cast::<Self>());
            Self::into_raw_waker(Self::from_raw(raw))
        }
    }

    unsafe fn waker_wake(raw: *const ()) {
        // Safety: ensured by VTable
        let cell = unsafe { Self::from_raw(raw) };
        cell.notify();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        let cell = raw.cast::<Self>();
        // Safety: ensured by VTable
        unsafe { (*cell).notify() }
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: ensured by VTable
        unsafe { drop(Self::from_raw(raw)) }
    }
}

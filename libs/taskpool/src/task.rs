// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::any::Any;
use std::fmt;
use std::future::Future;
use std::mem::{self, ManuallyDrop};
use std::panic::{self, AssertUnwindSafe};
use std::pin::Pin;
use std::process;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll, RawWaker, RawWakerVTable, Waker};

use static_assertions::assert_impl_all;

/// A shared handle to an asynchronous computation that will produce at most
/// one value.
///
/// The computation starts running *immediately* on the thread that calls
/// [`Task::spawn`] and keeps going until it either completes or suspends at an
/// await point. Where it resumes after that is decided by whatever it awaited:
/// continuations parked on a [`Pool`][crate::Pool] resume on a worker thread,
/// continuations parked on another `Task` resume on whichever thread completes
/// it.
///
/// Handles are cheap to clone; the underlying state is reference-counted and
/// freed once the last handle, awaiter, and the resumption machinery are gone.
/// Any number of awaiters may await the same task (clone the handle per
/// awaiter) and every one of them observes the same value, which is why
/// awaiting requires `T: Clone`. For large or non-`Clone` results, make the
/// task return an `Arc<T>`.
pub struct Task<T> {
    state: Arc<State<T>>,
}

assert_impl_all!(Task<()>: Send, Sync, Unpin);

/// The shared completion cell.
///
/// Everything lives under one mutex: the ready check an awaiter performs and
/// the registration of its continuation happen under a single lock
/// acquisition, so a task completing concurrently on another thread can never
/// slip between the two (the lost-wakeup race an atomic flag alone would
/// have).
struct State<T> {
    cell: Mutex<Cell<T>>,
}

struct Cell<T> {
    complete: bool,
    value: Option<T>,
    continuations: Vec<Waker>,
}

/// Owns the suspended future and drives it.
///
/// A task's [`Waker`] is a reference-counted pointer to its `Core`; waking
/// resumes the task *inline on the waking thread*, the direct analogue of
/// resuming a continuation handle.
struct Core<T> {
    state: Arc<State<T>>,
    /// `None` once the future has run to completion. The mutex doubles as the
    /// poll lock: at most one thread resumes the task at a time, and a late
    /// or duplicate wake of a completed task finds the slot empty and becomes
    /// a no-op.
    future: Mutex<Option<Pin<Box<dyn Future<Output = T> + Send>>>>,
}

// === impl Task ===

impl<T> Task<T> {
    /// Start `future` as a new task.
    ///
    /// The future is polled once before this function returns, on the calling
    /// thread. A task that never suspends therefore completes synchronously
    /// and the returned handle is immediately ready.
    pub fn spawn<F>(future: F) -> Task<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let state = Arc::new(State {
            cell: Mutex::new(Cell {
                complete: false,
                value: None,
                continuations: Vec::new(),
            }),
        });

        let core = Arc::new(Core {
            state: Arc::clone(&state),
            future: Mutex::new(Some(Box::pin(future))),
        });
        core.resume();

        Task { state }
    }

    /// Returns `true` once the task has run to completion.
    pub fn is_complete(&self) -> bool {
        self.state.lock().complete
    }
}

impl<T> Clone for Task<T> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
        }
    }
}

impl<T> fmt::Debug for Task<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Task")
            .field("complete", &self.is_complete())
            .field("handles", &Arc::strong_count(&self.state))
            .finish()
    }
}

/// Awaiting a task yields a clone of its value once it completes.
///
/// If the task is already complete the awaiter continues synchronously,
/// without suspending. Otherwise its continuation is appended to the task's
/// continuation list and resumed, in registration order, by whichever thread
/// completes the task.
impl<T: Clone> Future for Task<T> {
    type Output = T;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut cell = self.state.lock();

        if cell.complete {
            let value = cell
                .value
                .as_ref()
                .expect("completed task is missing its value");
            return Poll::Ready(value.clone());
        }

        // Re-polls with a waker we already hold must not register it twice,
        // or the continuation would be resumed more than once.
        if !cell.continuations.iter().any(|w| w.will_wake(cx.waker())) {
            cell.continuations.push(cx.waker().clone());
        }

        Poll::Pending
    }
}

// === impl State ===

impl<T> State<T> {
    fn lock(&self) -> MutexGuard<'_, Cell<T>> {
        // Poisoning cannot be observed here: a panic inside a task body is
        // caught at the poll boundary and terminates the process.
        self.cell.lock().unwrap()
    }

    /// Completion protocol: publish the value and detach the continuation
    /// list under the lock, then wake outside it. Waking runs arbitrary user
    /// code inline, and that code may well take this same lock again.
    fn complete(&self, value: T) {
        let continuations = {
            let mut cell = self.lock();
            debug_assert!(!cell.complete, "task completed twice");
            cell.complete = true;
            cell.value = Some(value);
            mem::take(&mut cell.continuations)
        };

        tracing::trace!(
            continuations = continuations.len(),
            "task complete, resuming awaiters"
        );
        for waker in continuations {
            waker.wake();
        }
    }
}

// === impl Core ===

impl<T: Send + 'static> Core<T> {
    /// Poll the task's future once, completing the state if it finishes.
    ///
    /// A panic escaping the future is fatal: there is no error channel across
    /// the await boundary, so it is logged and the process exits.
    fn resume(self: &Arc<Self>) {
        let mut slot = self.future.lock().unwrap();
        let Some(future) = slot.as_mut() else {
            // A stale waker fired after completion.
            return;
        };

        let waker = self.clone().into_waker();
        let mut cx = Context::from_waker(&waker);

        match panic::catch_unwind(AssertUnwindSafe(|| future.as_mut().poll(&mut cx))) {
            Ok(Poll::Ready(value)) => {
                *slot = None;
                // The slot lock must not be held while completing: waking an
                // awaiter runs user code that may wake *us* again, and that
                // wake takes the slot lock.
                drop(slot);
                self.state.complete(value);
            }
            Ok(Poll::Pending) => {}
            Err(payload) => {
                tracing::error!("unhandled panic in task: {}", panic_message(&*payload));
                process::exit(1);
            }
        }
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

    // `Waker::will_wake` is what keeps an awaiter from registering the same
    // continuation twice, and it compares vtable addresses. Keeping this out
    // of line keeps the vtable address stable across clones.
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
        let core = unsafe { Self::from_raw(raw) };
        core.resume();
    }

    unsafe fn waker_wake_by_ref(raw: *const ()) {
        // Safety: ensured by VTable; ManuallyDrop keeps the reference count
        // untouched.
        let core = unsafe { ManuallyDrop::new(Self::from_raw(raw)) };
        core.resume();
    }

    unsafe fn waker_drop(raw: *const ()) {
        // Safety: ensured by VTable
        unsafe { drop(Self::from_raw(raw)) }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("Box<dyn Any>")
}

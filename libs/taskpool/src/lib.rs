// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An embeddable asynchronous task runtime: spawn [`Task`]s, hop them onto a
//! fixed [`Pool`] of worker threads with `pool.schedule().await`, and collect
//! results with [`sync_wait`], [`join_all`] or [`join!`].
//!
//! Tasks start eagerly on the spawning thread and only move once they suspend;
//! there is no cancellation, no timeouts and no fairness beyond FIFO order on
//! the pool queue. A panic escaping a task terminates the process.

mod join;
pub mod pool;
pub mod task;

pub use join::{join_all, sync_wait};
pub use pool::Pool;
pub use task::Task;

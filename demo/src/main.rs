// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Example driver for the task runtime: loads a record file into a
//! [`SpillVec`] on a pool worker, optionally filters it, prints the head of
//! the surviving records, and runs a wide fan-out plus a heterogeneous join
//! for good measure.

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::{fs, thread};

use anyhow::{Context, Result};
use clap::Parser;
use spill_vec::SpillVec;
use taskpool::{Pool, Task, join, join_all, sync_wait};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Parser)]
#[command(about = "Load, filter and print a record file on a worker pool")]
struct Demo {
    /// Input file: three floats per line, separated by whitespace. The record
    /// id is the 0-based line number.
    input: PathBuf,

    /// Number of pool workers. Defaults to the available parallelism.
    #[clap(short, long)]
    threads: Option<NonZeroUsize>,

    /// Drop records with even ids after loading.
    #[clap(long)]
    drop_even: bool,

    /// How many leading records to print.
    #[clap(long, default_value_t = 10)]
    head: usize,

    /// Configures logging.
    #[clap(short, long, env = "RUST_LOG", default_value = "demo=info,warn")]
    log: tracing_subscriber::filter::Targets,
}

/// One input record. The layout is fixed so a spilled container can
/// reinterpret its mapped bytes as records.
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct Particle {
    id: u64,
    x: f64,
    y: f64,
    z: f64,
}

fn main() -> Result<()> {
    let demo = Demo::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_thread_names(true))
        .with(demo.log.clone())
        .init();

    let text = fs::read_to_string(&demo.input)
        .with_context(|| format!("failed to read {}", demo.input.display()))?;

    let threads = demo
        .threads
        .or_else(|| thread::available_parallelism().ok())
        .map_or(4, NonZeroUsize::get);
    let pool = Pool::new(threads);
    tracing::info!(workers = pool.worker_count(), "pool up");

    let survivors = sync_wait(Task::spawn(process(
        pool.clone(),
        text,
        demo.drop_even,
        demo.head,
    )));
    tracing::info!(survivors, "input processed");

    let (scheduled, ok) = sync_wait(Task::spawn(demonstrate(pool.clone())));
    tracing::info!(scheduled, ok, "fan-out demonstration complete");

    Ok(())
}

/// Parse `text` into a record container on a pool worker, filter, and print
/// the head. Returns the number of surviving records.
async fn process(pool: Pool, text: String, drop_even: bool, head: usize) -> usize {
    // Everything below this point runs on the pool.
    pool.schedule().await;

    let mut records: SpillVec<Particle> = SpillVec::new(0);
    for (line_no, line) in text.lines().enumerate() {
        let id = u64::try_from(line_no).expect("line number overflows u64");
        match parse_line(id, line) {
            Some(particle) => records.push(particle),
            None => tracing::warn!(line = line_no + 1, "skipping malformed line"),
        }
    }
    tracing::info!(
        records = records.len(),
        spilled = records.spilled(),
        "loaded input"
    );

    if drop_even {
        records.retain(|r| r.id % 2 == 1);
        tracing::info!(records = records.len(), "dropped even ids");
    }

    for record in records.iter().take(head) {
        tracing::info!(
            "record {}: ({}, {}, {})",
            record.id,
            record.x,
            record.y,
            record.z
        );
    }

    records.len()
}

/// Fan a hundred no-op tasks out over the pool, then join two tasks of
/// different result types.
async fn demonstrate(pool: Pool) -> (usize, bool) {
    let tasks: Vec<Task<usize>> = (0..100)
        .map(|i| {
            let pool = pool.clone();
            Task::spawn(async move {
                pool.schedule().await;
                i
            })
        })
        .collect();
    let values = join_all(tasks).await;

    let sum = {
        let pool = pool.clone();
        Task::spawn(async move {
            pool.schedule().await;
            values.len()
        })
    };
    let probe = {
        let pool = pool.clone();
        Task::spawn(async move {
            pool.schedule().await;
            true
        })
    };

    join!(sum, probe)
}

fn parse_line(id: u64, line: &str) -> Option<Particle> {
    let mut fields = line.split_whitespace();
    let x = fields.next()?.parse().ok()?;
    let y = fields.next()?.parse().ok()?;
    let z = fields.next()?.parse().ok()?;
    Some(Particle { id, x, y, z })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_lines() {
        let particle = parse_line(7, "1.5  -2.0 3").unwrap();
        assert_eq!(particle.id, 7);
        assert_eq!(particle.x, 1.5);
        assert_eq!(particle.y, -2.0);
        assert_eq!(particle.z, 3.0);
    }

    #[test]
    fn rejects_short_lines() {
        assert!(parse_line(0, "1.0 2.0").is_none());
        assert!(parse_line(0, "").is_none());
        assert!(parse_line(0, "a b c").is_none());
    }
}

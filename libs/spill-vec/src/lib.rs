// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! An append-only sequence of fixed-size records that lives on the heap until
//! it outgrows [`SPILL_THRESHOLD`], then migrates to a memory-mapped backing
//! file and keeps growing there. The migration is observationally
//! transparent; a container that never crosses the threshold never touches
//! the filesystem.

use std::fs::{self, File, OpenOptions};
use std::mem;
use std::ops::{Index, IndexMut};
use std::path::{Path, PathBuf};
use std::{fmt, slice};

use memmap2::{MmapMut, MmapOptions};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Number of records a container may hold before it spills to its backing
/// file.
pub const SPILL_THRESHOLD: usize = 1024;

/// Marker for types that may be stored in a [`SpillVec`].
///
/// The zerocopy bounds are what make the mapped byte region directly
/// reinterpretable as a record slice; any `#[repr(C)]` aggregate of plain
/// scalars qualifies via the zerocopy derives.
pub trait Record: FromBytes + IntoBytes + KnownLayout + Immutable + Copy {}

impl<T> Record for T where T: FromBytes + IntoBytes + KnownLayout + Immutable + Copy {}

/// An elastic record container.
///
/// Capacity starts at one record and doubles on demand. The doubling that
/// first crosses [`SPILL_THRESHOLD`] migrates the contents into a
/// memory-mapped file (created only at that moment); the file is unlinked
/// again when the container is dropped.
///
/// Growth may move every record, so references obtained through indexing or
/// [`SpillVec::as_slice`] must be re-acquired after any `push` — which the
/// borrow checker enforces anyway.
///
/// Not thread-safe; a container belongs to one task at a time.
pub struct SpillVec<T: Record> {
    storage: Storage<T>,
    len: usize,
    capacity: usize,
    path: PathBuf,
}

enum Storage<T> {
    Heap(Vec<T>),
    Mapped { file: File, map: MmapMut },
}

// === impl SpillVec ===

impl<T: Record> SpillVec<T> {
    /// An empty container whose backing file, should it ever spill, will be
    /// `"<id>.bin"` in the current directory. The file is not created here.
    pub fn new(id: u64) -> Self {
        Self::with_path(format!("{id}.bin"))
    }

    /// Like [`SpillVec::new`] with an explicit backing path.
    ///
    /// # Panics
    ///
    /// Panics for zero-sized record types, which have no meaningful byte
    /// representation to map.
    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        assert!(size_of::<T>() > 0, "record type must have a size");
        Self {
            storage: Storage::Heap(Vec::with_capacity(1)),
            len: 0,
            capacity: 1,
            path: path.into(),
        }
    }

    /// Number of records stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current record capacity. Grows by doubling; never shrinks.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// `true` once the contents have migrated to the backing file.
    pub fn spilled(&self) -> bool {
        matches!(self.storage, Storage::Mapped { .. })
    }

    /// The backing file path (which exists only once [`SpillVec::spilled`]
    /// returns `true`).
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.records().get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        let len = self.len;
        self.records_mut()[..len].get_mut(index)
    }

    pub fn as_slice(&self) -> &[T] {
        self.records()
    }

    pub fn as_mut_slice(&mut self) -> &mut [T] {
        let len = self.len;
        &mut self.records_mut()[..len]
    }

    pub fn iter(&self) -> slice::Iter<'_, T> {
        self.records().iter()
    }

    /// Append one record, growing (and possibly migrating) first when the
    /// container is at capacity.
    ///
    /// # Panics
    ///
    /// Panics when the backing file cannot be created, resized or mapped;
    /// there is no sensible way to recover the container at that point.
    pub fn push(&mut self, record: T) {
        if self.len == self.capacity {
            self.grow();
        }

        match &mut self.storage {
            Storage::Heap(records) => records.push(record),
            Storage::Mapped { map, .. } => Self::mapped_records(map)[self.len] = record,
        }
        self.len += 1;
    }

    /// Keep only the records for which `pred` returns `true`, compacting in
    /// place. Preserves the order of survivors and adjusts the length, but
    /// not the capacity.
    pub fn retain(&mut self, mut pred: impl FnMut(&T) -> bool) {
        let len = self.len;
        let records = &mut self.records_mut()[..len];
        let mut kept = 0;
        for i in 0..records.len() {
            if pred(&records[i]) {
                records[kept] = records[i];
                kept += 1;
            }
        }

        self.len = kept;
        if let Storage::Heap(records) = &mut self.storage {
            records.truncate(kept);
        }
    }

    fn records(&self) -> &[T] {
        match &self.storage {
            Storage::Heap(records) => records,
            Storage::Mapped { map, .. } => {
                let all = <[T]>::ref_from_bytes(&map[..])
                    .expect("mapping is sized and aligned for the record type");
                &all[..self.len]
            }
        }
    }

    /// The mutable view spans the whole heap length resp. mapped capacity;
    /// callers slice it down to `self.len` themselves where that matters.
    fn records_mut(&mut self) -> &mut [T] {
        match &mut self.storage {
            Storage::Heap(records) => records,
            Storage::Mapped { map, .. } => Self::mapped_records(map),
        }
    }

    fn mapped_records(map: &mut MmapMut) -> &mut [T] {
        <[T]>::mut_from_bytes(&mut map[..])
            .expect("mapping is sized and aligned for the record type")
    }

    fn grow(&mut self) {
        let new_capacity = self.capacity * 2;

        if self.capacity <= SPILL_THRESHOLD && new_capacity > SPILL_THRESHOLD {
            // This doubling crosses the threshold: switch from the heap
            // buffer to file-backed storage.
            let Storage::Heap(records) = mem::replace(&mut self.storage, Storage::Heap(Vec::new()))
            else {
                unreachable!("a mapped container is always past the spill threshold");
            };
            self.storage = self.migrate(&records, new_capacity);
        } else {
            match &mut self.storage {
                Storage::Heap(records) => records.reserve_exact(new_capacity - records.len()),
                Storage::Mapped { file, map } => {
                    let byte_len = Self::byte_len(new_capacity);
                    tracing::debug!(
                        path = %self.path.display(),
                        new_capacity,
                        "growing backing file"
                    );
                    file.set_len(byte_len)
                        .unwrap_or_else(|err| die(&self.path, "resize backing file", &err));
                    *map = map_exactly(file, byte_len, &self.path);
                }
            }
        }

        self.capacity = new_capacity;
    }

    /// Create (or reopen) the backing file at the target capacity, map it,
    /// and copy the heap records in.
    fn migrate(&self, records: &[T], new_capacity: usize) -> Storage<T> {
        let byte_len = Self::byte_len(new_capacity);
        tracing::debug!(
            path = %self.path.display(),
            records = records.len(),
            new_capacity,
            "spilling to backing file"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .unwrap_or_else(|err| die(&self.path, "create backing file", &err));

        let file_len = file
            .metadata()
            .unwrap_or_else(|err| die(&self.path, "stat backing file", &err))
            .len();
        if file_len < byte_len {
            // Freshly created files are empty; a non-empty short file is a
            // leftover from an aborted earlier run that we simply reuse.
            if file_len > 0 {
                tracing::debug!(file_len, byte_len, "resizing leftover backing file");
            }
            file.set_len(byte_len)
                .unwrap_or_else(|err| die(&self.path, "resize backing file", &err));
        }

        let mut map = map_exactly(&file, byte_len, &self.path);
        map[..records.as_bytes().len()].copy_from_slice(records.as_bytes());

        Storage::Mapped { file, map }
    }

    fn byte_len(capacity: usize) -> u64 {
        let bytes = capacity
            .checked_mul(size_of::<T>())
            .expect("capacity in bytes overflows usize");
        u64::try_from(bytes).expect("capacity in bytes overflows u64")
    }
}

fn map_exactly(file: &File, byte_len: u64, path: &Path) -> MmapMut {
    let len = usize::try_from(byte_len).expect("mapping length overflows usize");
    // Safety: the file is created, owned and unlinked by this container; no
    // other process is expected to truncate it underneath the mapping.
    unsafe { MmapOptions::new().len(len).map_mut(file) }
        .unwrap_or_else(|err| die(path, "map backing file", &err))
}

fn die(path: &Path, what: &str, err: &dyn fmt::Display) -> ! {
    tracing::error!(path = %path.display(), "failed to {what}: {err}");
    panic!("failed to {what} {}: {err}", path.display())
}

impl<T: Record> Drop for SpillVec<T> {
    fn drop(&mut self) {
        if self.spilled() {
            // Unmap and close before unlinking.
            self.storage = Storage::Heap(Vec::new());
            if let Err(err) = fs::remove_file(&self.path) {
                // The file may already be gone, e.g. removed by a cleanup of
                // a previous aborted run. Not fatal either way.
                tracing::warn!(
                    path = %self.path.display(),
                    "failed to remove backing file: {err}"
                );
            }
        }
    }
}

impl<T: Record> Index<usize> for SpillVec<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.records()[index]
    }
}

impl<T: Record> IndexMut<usize> for SpillVec<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.as_mut_slice()[index]
    }
}

impl<'a, T: Record> IntoIterator for &'a SpillVec<T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<'a, T: Record> IntoIterator for &'a mut SpillVec<T> {
    type Item = &'a mut T;
    type IntoIter = slice::IterMut<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.as_mut_slice().iter_mut()
    }
}

impl<T: Record> fmt::Debug for SpillVec<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpillVec")
            .field("len", &self.len)
            .field("capacity", &self.capacity)
            .field("spilled", &self.spilled())
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use static_assertions::const_assert_eq;
    use tempfile::TempDir;

    #[derive(Debug, Clone, Copy, PartialEq, FromBytes, IntoBytes, KnownLayout, Immutable)]
    #[repr(C)]
    struct Sample {
        id: u64,
        x: f64,
        y: f64,
        z: f64,
    }

    const_assert_eq!(size_of::<Sample>(), 32);
    const_assert_eq!(align_of::<Sample>(), 8);

    fn sample(id: u64) -> Sample {
        #[expect(clippy::cast_precision_loss, reason = "test ids stay small")]
        let v = id as f64;
        Sample { id, x: v, y: v, z: v }
    }

    fn scratch(dir: &TempDir) -> PathBuf {
        dir.path().join("1.bin")
    }

    #[test]
    fn push_then_read_across_the_migration_boundary() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));

        for id in 0..2048 {
            records.push(sample(id));
        }

        assert_eq!(records.len(), 2048);
        assert!(records.spilled());
        assert!(records.path().exists());
        assert_eq!(records[1000].x, 1000.0);
        assert_eq!(records[2047].x, 2047.0);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id, i as u64);
        }

        let path = records.path().to_path_buf();
        drop(records);
        assert!(!path.exists());
    }

    #[test]
    fn small_containers_never_touch_the_filesystem() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));

        for id in 0..SPILL_THRESHOLD as u64 {
            records.push(sample(id));
        }

        assert!(!records.spilled());
        assert_eq!(records.capacity(), SPILL_THRESHOLD);
        assert!(!records.path().exists());
    }

    #[test]
    fn migration_happens_exactly_at_the_threshold_crossing() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));

        for id in 0..=SPILL_THRESHOLD as u64 {
            records.push(sample(id));
        }

        assert!(records.spilled());
        assert_eq!(records.capacity(), SPILL_THRESHOLD * 2);
        assert_eq!(records.len(), SPILL_THRESHOLD + 1);
    }

    #[test]
    fn retain_keeps_survivors_in_order() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));

        for id in 0..2048 {
            records.push(sample(id));
        }
        records.retain(|r| r.id % 2 == 1);

        assert_eq!(records.len(), 1024);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.id, 2 * i as u64 + 1);
        }
        // Capacity is untouched, and the container can keep growing.
        assert_eq!(records.capacity(), 2048);
        records.push(sample(9999));
        assert_eq!(records[1024].id, 9999);
    }

    #[test]
    fn reuses_and_grows_a_leftover_backing_file() {
        let dir = TempDir::new().unwrap();
        let path = scratch(&dir);
        fs::write(&path, [0_u8; 64]).unwrap();

        let mut records = SpillVec::with_path(&path);
        for id in 0..2000 {
            records.push(sample(id));
        }

        assert!(records.spilled());
        assert_eq!(records.len(), 2000);
        assert_eq!(records[1999].id, 1999);
    }

    #[test]
    fn mutation_through_the_slice_view_sticks() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));

        for id in 0..1500 {
            records.push(sample(id));
        }
        for record in &mut records {
            record.x = -1.0;
        }

        assert_eq!(records[0].x, -1.0);
        assert_eq!(records[1499].x, -1.0);
        assert_eq!(records[1499].y, 1499.0);
    }

    #[test]
    #[should_panic(expected = "index out of bounds")]
    fn out_of_range_indexing_panics() {
        let dir = TempDir::new().unwrap();
        let mut records = SpillVec::with_path(scratch(&dir));
        records.push(sample(0));
        let _ = records[1];
    }

    proptest::proptest! {
        /// `retain` behaves exactly like `Vec::retain`, on either side of the
        /// migration boundary.
        #[test]
        fn retain_matches_vec_retain(
            ids in proptest::collection::vec(proptest::prelude::any::<u64>(), 0..1400),
            modulus in 1_u64..8,
        ) {
            let dir = TempDir::new().unwrap();
            let mut records = SpillVec::with_path(scratch(&dir));
            for &id in &ids {
                records.push(sample(id));
            }

            let mut expected: Vec<u64> = ids;
            expected.retain(|id| id % modulus != 0);
            records.retain(|r| r.id % modulus != 0);

            let got: Vec<u64> = records.iter().map(|r| r.id).collect();
            proptest::prop_assert_eq!(got, expected);
        }
    }
}

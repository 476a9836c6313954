// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities: a complete-k-ary-tree geometry, in-memory and
//! access-recording storage heaps, and randomized workloads driving full
//! access cycles.

use crate::addressing::{AddressingStrategy, ExplicitAddressing, PointerAddressing};
use crate::heap::{StorageHeap, VirtualHeap};
use crate::path_manager::TreeOramPathManager;
use crate::{BlockId, BucketIndex, BucketSize, LeafAddress, StoreError, TreeLevel};
use rand::{rngs::StdRng, Rng, SeedableRng};
use simplelog::{Config, WriteLogger};
use std::sync::Once;

static INIT: Once = Once::new();

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

/// A complete k-ary tree stored in level order: level `l` occupies bucket
/// indices `[(k^l - 1) / (k - 1), (k^(l+1) - 1) / (k - 1))`, and leaves
/// are addressed `0..k^(levels-1)` left to right.
#[derive(Debug, Clone)]
pub(crate) struct CompleteKaryHeap {
    k: u32,
    levels: TreeLevel,
    blocks_per_bucket: BucketSize,
}

impl CompleteKaryHeap {
    pub(crate) fn new(k: u32, levels: TreeLevel, blocks_per_bucket: BucketSize) -> Self {
        assert!(k >= 2);
        assert!(levels >= 1);
        assert!(blocks_per_bucket >= 1);
        Self {
            k,
            levels,
            blocks_per_bucket,
        }
    }

    pub(crate) fn leaf_count(&self) -> u64 {
        u64::from(self.k).pow(self.levels - 1)
    }

    fn level_offset(&self, level: TreeLevel) -> u64 {
        (u64::from(self.k).pow(level) - 1) / (u64::from(self.k) - 1)
    }
}

impl VirtualHeap for CompleteKaryHeap {
    fn k(&self) -> u32 {
        self.k
    }

    fn levels(&self) -> TreeLevel {
        self.levels
    }

    fn blocks_per_bucket(&self) -> BucketSize {
        self.blocks_per_bucket
    }

    fn bucket_count(&self) -> u64 {
        self.level_offset(self.levels)
    }

    fn bucket_on_path(&self, leaf: LeafAddress, level: TreeLevel) -> BucketIndex {
        assert!(u64::from(leaf) < self.leaf_count());
        assert!(level < self.levels);
        let ancestor = u64::from(leaf) / u64::from(self.k).pow(self.levels - 1 - level);
        self.level_offset(level) + ancestor
    }

    fn last_common_level(&self, a: LeafAddress, b: LeafAddress) -> TreeLevel {
        assert!(u64::from(a) < self.leaf_count());
        assert!(u64::from(b) < self.leaf_count());
        let (mut a, mut b) = (u64::from(a), u64::from(b));
        let mut level = self.levels - 1;
        while a != b {
            a /= u64::from(self.k);
            b /= u64::from(self.k);
            level -= 1;
        }
        level
    }
}

/// An in-memory storage heap, for tests that do not need a real file.
#[derive(Debug)]
pub(crate) struct MemoryHeapStore<H: VirtualHeap> {
    heap: H,
    block_size: usize,
    buckets: Vec<Vec<u8>>,
}

impl<H: VirtualHeap> MemoryHeapStore<H> {
    pub(crate) fn new(heap: H, block_size: usize) -> Self {
        let bucket_len = heap.blocks_per_bucket() * block_size;
        let buckets = vec![vec![0u8; bucket_len]; heap.bucket_count() as usize];
        Self {
            heap,
            block_size,
            buckets,
        }
    }

    /// Decodes every block in the store and returns the resident ids, in
    /// bucket order. Used by no-loss/no-duplication checks.
    pub(crate) fn all_resident_ids<A: AddressingStrategy>(&self, strategy: &A) -> Vec<BlockId> {
        let mut ids = Vec::new();
        for bucket in &self.buckets {
            for block in bucket.chunks_exact(self.block_size) {
                if let Some(tag) = strategy.decode(block) {
                    ids.push(tag.id);
                }
            }
        }
        ids
    }
}

impl<H: VirtualHeap> StorageHeap for MemoryHeapStore<H> {
    type Geometry = H;

    fn geometry(&self) -> &H {
        &self.heap
    }

    fn read_path(
        &mut self,
        leaf: LeafAddress,
        level_start: TreeLevel,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        Ok((level_start..self.heap.levels())
            .map(|level| self.buckets[self.heap.bucket_on_path(leaf, level) as usize].clone())
            .collect())
    }

    fn write_path(
        &mut self,
        leaf: LeafAddress,
        buckets: Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        assert_eq!(buckets.len(), self.heap.levels() as usize);
        for (level, bucket) in buckets.into_iter().enumerate() {
            assert_eq!(bucket.len(), self.heap.blocks_per_bucket() * self.block_size);
            let index = self.heap.bucket_on_path(leaf, level as TreeLevel) as usize;
            self.buckets[index] = bucket;
        }
        Ok(())
    }
}

/// Wraps a storage heap and records the bucket indices of every physical
/// path read and write, for obliviousness checks.
#[derive(Debug)]
pub(crate) struct RecordingHeapStore<S: StorageHeap> {
    inner: S,
    pub(crate) reads: Vec<BucketIndex>,
    pub(crate) writes: Vec<BucketIndex>,
}

impl<S: StorageHeap> RecordingHeapStore<S> {
    pub(crate) fn new(inner: S) -> Self {
        Self {
            inner,
            reads: Vec::new(),
            writes: Vec::new(),
        }
    }
}

impl<S: StorageHeap> StorageHeap for RecordingHeapStore<S> {
    type Geometry = S::Geometry;

    fn geometry(&self) -> &S::Geometry {
        self.inner.geometry()
    }

    fn read_path(
        &mut self,
        leaf: LeafAddress,
        level_start: TreeLevel,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let touched: Vec<BucketIndex> = (level_start..self.inner.geometry().levels())
            .map(|level| self.inner.geometry().bucket_on_path(leaf, level))
            .collect();
        self.reads.extend(touched);
        self.inner.read_path(leaf, level_start)
    }

    fn write_path(
        &mut self,
        leaf: LeafAddress,
        buckets: Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let touched: Vec<BucketIndex> = (0..self.inner.geometry().levels())
            .map(|level| self.inner.geometry().bucket_on_path(leaf, level))
            .collect();
        self.writes.extend(touched);
        self.inner.write_path(leaf, buckets)
    }
}

pub(crate) fn memory_manager_pointer(
    k: u32,
    levels: TreeLevel,
    z: BucketSize,
    block_size: usize,
) -> TreeOramPathManager<MemoryHeapStore<CompleteKaryHeap>, PointerAddressing> {
    let heap = CompleteKaryHeap::new(k, levels, z);
    let store = MemoryHeapStore::new(heap, block_size);
    TreeOramPathManager::new(store, PointerAddressing)
}

/// One full access cycle: load the block's path, pull the block out of
/// the window or the stash (or start fresh), optionally overwrite its
/// payload, remap it to `new_leaf`, and run the eviction phases.
fn cycle<S: StorageHeap, A: AddressingStrategy>(
    manager: &mut TreeOramPathManager<S, A>,
    id: BlockId,
    leaf: LeafAddress,
    new_leaf: LeafAddress,
    block_size: usize,
    write_fill: Option<u8>,
) -> Vec<u8> {
    manager.load_path(leaf).unwrap();
    let mut block = manager
        .extract_block_from_path(id)
        .or_else(|| manager.stash_mut().remove(id))
        .unwrap_or_else(|| vec![0u8; block_size]);
    let payload = block[A::HEADER_LEN..].to_vec();
    if let Some(fill) = write_fill {
        block[A::HEADER_LEN..].fill(fill);
    }
    manager.stash_block(id, new_leaf, block);
    manager.push_down_path();
    manager.fill_path_from_stash();
    manager.evict_path().unwrap();
    payload
}

/// Asserts that every touched id lives in exactly one of the store and
/// the stash, and untouched ids nowhere.
fn assert_no_loss_no_duplication<H: VirtualHeap, A: AddressingStrategy>(
    manager: &TreeOramPathManager<MemoryHeapStore<H>, A>,
    touched: &[bool],
) {
    let mut counts = vec![0usize; touched.len()];
    for id in manager.store().all_resident_ids(manager.addressing()) {
        counts[id as usize] += 1;
    }
    for id in manager.stash().ids() {
        counts[id as usize] += 1;
    }
    for (id, &count) in counts.iter().enumerate() {
        assert_eq!(
            count,
            usize::from(touched[id]),
            "block {} has the wrong number of copies",
            id
        );
    }
}

/// Random reads and writes against a mirror array, pointer addressing.
pub(crate) fn random_workload_pointer(
    k: u32,
    levels: TreeLevel,
    z: BucketSize,
    block_size: usize,
    operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let heap = CompleteKaryHeap::new(k, levels, z);
    let leaf_count = heap.leaf_count();
    let capacity = leaf_count as usize;
    let store = MemoryHeapStore::new(heap, block_size);
    let mut manager = TreeOramPathManager::new(store, PointerAddressing);

    let payload_len = block_size - PointerAddressing::HEADER_LEN;
    let mut positions: Vec<LeafAddress> = (0..capacity)
        .map(|_| rng.gen_range(0..leaf_count) as LeafAddress)
        .collect();
    let mut mirror = vec![vec![0u8; payload_len]; capacity];
    let mut touched = vec![false; capacity];

    for _ in 0..operations {
        let id = rng.gen_range(0..capacity) as BlockId;
        let new_leaf = rng.gen_range(0..leaf_count) as LeafAddress;
        let write_fill: Option<u8> = if rng.gen::<bool>() {
            Some(rng.gen())
        } else {
            None
        };

        let leaf = positions[id as usize];
        let payload = cycle(&mut manager, id, leaf, new_leaf, block_size, write_fill);
        assert_eq!(payload, mirror[id as usize], "block {}", id);

        if let Some(fill) = write_fill {
            mirror[id as usize].fill(fill);
        }
        positions[id as usize] = new_leaf;
        touched[id as usize] = true;

        assert_no_loss_no_duplication(&manager, &touched);
    }

    // Final pass: every block still reads back its mirror value.
    for id in 0..capacity as BlockId {
        let leaf = positions[id as usize];
        let payload = cycle(&mut manager, id, leaf, leaf, block_size, None);
        assert_eq!(payload, mirror[id as usize], "block {}", id);
    }
}

/// Random reads and writes against a mirror array, explicit addressing
/// with the position map owned by the manager's strategy.
pub(crate) fn random_workload_explicit(
    k: u32,
    levels: TreeLevel,
    z: BucketSize,
    block_size: usize,
    operations: u32,
) {
    init_logger();
    let mut rng = StdRng::seed_from_u64(0);

    let heap = CompleteKaryHeap::new(k, levels, z);
    let leaf_count = heap.leaf_count();
    let capacity = leaf_count as usize;
    let store = MemoryHeapStore::new(heap, block_size);
    let initial_positions: Vec<LeafAddress> = (0..capacity)
        .map(|_| rng.gen_range(0..leaf_count) as LeafAddress)
        .collect();
    let addressing = ExplicitAddressing::new(initial_positions);
    let mut manager = TreeOramPathManager::new(store, addressing);

    type Explicit = ExplicitAddressing<Vec<LeafAddress>>;
    let payload_len = block_size - Explicit::HEADER_LEN;
    let mut mirror = vec![vec![0u8; payload_len]; capacity];
    let mut touched = vec![false; capacity];

    for _ in 0..operations {
        let id = rng.gen_range(0..capacity) as BlockId;
        let new_leaf = rng.gen_range(0..leaf_count) as LeafAddress;
        let write_fill: Option<u8> = if rng.gen::<bool>() {
            Some(rng.gen())
        } else {
            None
        };

        let leaf = manager.addressing().map()[id as usize];
        manager.load_path(leaf).unwrap();
        let mut block = manager
            .extract_block_from_path(id)
            .or_else(|| manager.stash_mut().remove(id))
            .unwrap_or_else(|| vec![0u8; block_size]);
        assert_eq!(&block[Explicit::HEADER_LEN..], &mirror[id as usize][..]);
        if let Some(fill) = write_fill {
            block[Explicit::HEADER_LEN..].fill(fill);
            mirror[id as usize].fill(fill);
        }
        // The map must be updated before eviction so the block's
        // eviction level is computed against its new leaf.
        manager.addressing_mut().map_mut()[id as usize] = new_leaf;
        manager.stash_block(id, new_leaf, block);
        manager.push_down_path();
        manager.fill_path_from_stash();
        manager.evict_path().unwrap();
        touched[id as usize] = true;

        assert_no_loss_no_duplication(&manager, &touched);
    }

    for id in 0..capacity as BlockId {
        let leaf = manager.addressing().map()[id as usize];
        let payload = cycle(&mut manager, id, leaf, leaf, block_size, None);
        assert_eq!(payload, mirror[id as usize], "block {}", id);
    }
}

macro_rules! create_manager_workload_tests {
    ($k:expr, $levels:expr, $z:expr, $block_size:expr, $ops:expr) => {
        paste::paste! {
            #[test]
            fn [<random_workload_pointer_k $k _l $levels _z $z _b $block_size _ $ops>]() {
                random_workload_pointer($k, $levels, $z, $block_size, $ops);
            }

            #[test]
            fn [<random_workload_explicit_k $k _l $levels _z $z _b $block_size _ $ops>]() {
                random_workload_explicit($k, $levels, $z, $block_size, $ops);
            }
        }
    };
}

pub(crate) use create_manager_workload_tests;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn karyheap_binary_geometry() {
        let heap = CompleteKaryHeap::new(2, 4, 2);
        assert_eq!(heap.bucket_count(), 15);
        assert_eq!(heap.leaf_count(), 8);

        // The path to leaf 5 runs root, right child, its left child, leaf.
        assert_eq!(heap.bucket_on_path(5, 0), 0);
        assert_eq!(heap.bucket_on_path(5, 1), 2);
        assert_eq!(heap.bucket_on_path(5, 2), 5);
        assert_eq!(heap.bucket_on_path(5, 3), 12);

        // Leaves 4 and 5 share down to level 2; 5 and 6 only level 1;
        // 0 and 7 only the root; a leaf shares its whole path with itself.
        assert_eq!(heap.last_common_level(4, 5), 2);
        assert_eq!(heap.last_common_level(5, 6), 1);
        assert_eq!(heap.last_common_level(0, 7), 0);
        assert_eq!(heap.last_common_level(5, 5), 3);
    }

    #[test]
    fn karyheap_ternary_geometry() {
        let heap = CompleteKaryHeap::new(3, 3, 2);
        assert_eq!(heap.bucket_count(), 13);
        assert_eq!(heap.leaf_count(), 9);
        assert_eq!(heap.bucket_on_path(8, 0), 0);
        assert_eq!(heap.bucket_on_path(8, 1), 3);
        assert_eq!(heap.bucket_on_path(8, 2), 12);
        assert_eq!(heap.last_common_level(6, 8), 1);
        assert_eq!(heap.last_common_level(0, 1), 1);
        assert_eq!(heap.last_common_level(2, 3), 0);
    }
}

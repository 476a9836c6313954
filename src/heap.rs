// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Geometry and storage contracts consumed by the path manager.
//!
//! The virtual-heap geometry module lives outside this crate; the
//! [`VirtualHeap`] trait is its interface boundary. [`FileHeapStore`] glues
//! any such geometry to a [`BlockDevice`], mapping bucket `b` to the
//! device blocks `[b * Z, (b + 1) * Z)`.

use crate::device::BlockDevice;
use crate::{BucketIndex, BucketSize, LeafAddress, StoreError, TreeLevel};

/// The bucket/level geometry of a storage tree.
///
/// `bucket_on_path` must be deterministic in `(leaf, level)` alone: the
/// set of buckets a path access touches may depend only on the chosen
/// leaves, never on any block's identity.
pub trait VirtualHeap {
    /// The tree arity.
    fn k(&self) -> u32;

    /// The number of levels; the root is level 0, leaves are at
    /// `levels() - 1`.
    fn levels(&self) -> TreeLevel;

    /// The number of blocks per bucket.
    fn blocks_per_bucket(&self) -> BucketSize;

    /// The total number of buckets in the tree.
    fn bucket_count(&self) -> u64;

    /// The bucket the path to `leaf` visits at `level`.
    fn bucket_on_path(&self, leaf: LeafAddress, level: TreeLevel) -> BucketIndex;

    /// The deepest tree level shared by the root-to-leaf paths of the two
    /// leaves. Level 0 (the root) is always shared; two equal leaves share
    /// all `levels()` levels.
    fn last_common_level(&self, a: LeafAddress, b: LeafAddress) -> TreeLevel;
}

/// A device plus its geometry: the storage surface the path manager reads
/// and writes whole paths through.
pub trait StorageHeap {
    /// The geometry type backing this store.
    type Geometry: VirtualHeap;

    /// The geometry.
    fn geometry(&self) -> &Self::Geometry;

    /// Reads the buckets on the path to `leaf` at levels
    /// `[level_start, levels)`, root-most first, one byte-blob per bucket.
    fn read_path(
        &mut self,
        leaf: LeafAddress,
        level_start: TreeLevel,
    ) -> Result<Vec<Vec<u8>>, StoreError>;

    /// Writes the supplied buckets back along the path to `leaf`, starting
    /// at the root. Exactly `buckets.len()` levels are written.
    fn write_path(&mut self, leaf: LeafAddress, buckets: Vec<Vec<u8>>)
        -> Result<(), StoreError>;
}

/// A [`StorageHeap`] over a file-backed [`BlockDevice`].
///
/// Bucket `b` occupies the device blocks `[b * Z, (b + 1) * Z)`, so one
/// device block is one tree block and a bucket is `Z` contiguous device
/// blocks. Constructing the store asserts that the device holds exactly
/// `bucket_count * Z` blocks; a mismatch is a configuration bug and fatal.
#[derive(Debug)]
pub struct FileHeapStore<H: VirtualHeap> {
    heap: H,
    device: BlockDevice,
}

impl<H: VirtualHeap> FileHeapStore<H> {
    /// Combines a geometry with the device backing it.
    pub fn new(heap: H, device: BlockDevice) -> Self {
        let z = heap.blocks_per_bucket() as u64;
        assert!(z > 0, "blocks_per_bucket must be positive");
        assert_eq!(
            u64::from(device.block_count()),
            heap.bucket_count() * z,
            "device holds {} blocks but the geometry needs {} buckets of {} blocks",
            device.block_count(),
            heap.bucket_count(),
            z
        );
        Self { heap, device }
    }

    /// The underlying device.
    pub fn device(&self) -> &BlockDevice {
        &self.device
    }

    /// The underlying device, mutably.
    pub fn device_mut(&mut self) -> &mut BlockDevice {
        &mut self.device
    }

    /// Closes the underlying device.
    pub fn close(&mut self) -> Result<(), StoreError> {
        self.device.close()
    }

    /// The device block indices of the path to `leaf` at levels
    /// `[level_start, levels)`, root-most first.
    fn path_block_indices(&self, leaf: LeafAddress, level_start: TreeLevel) -> Vec<u32> {
        let z = self.heap.blocks_per_bucket() as u64;
        let mut indices = Vec::new();
        for level in level_start..self.heap.levels() {
            let bucket = self.heap.bucket_on_path(leaf, level);
            for j in 0..z {
                indices.push((bucket * z + j) as u32);
            }
        }
        indices
    }
}

impl<H: VirtualHeap> StorageHeap for FileHeapStore<H> {
    type Geometry = H;

    fn geometry(&self) -> &H {
        &self.heap
    }

    fn read_path(
        &mut self,
        leaf: LeafAddress,
        level_start: TreeLevel,
    ) -> Result<Vec<Vec<u8>>, StoreError> {
        let levels = self.heap.levels();
        assert!(
            level_start <= levels,
            "level_start {} exceeds levels {}",
            level_start,
            levels
        );
        log::debug!(
            "path read -- leaf {} levels {}..{}",
            leaf,
            level_start,
            levels
        );

        let z = self.heap.blocks_per_bucket();
        let bucket_len = z * self.device.block_size() as usize;
        let indices = self.path_block_indices(leaf, level_start);

        let mut buckets = Vec::with_capacity((levels - level_start) as usize);
        let mut current = Vec::with_capacity(bucket_len);
        for block in self.device.yield_blocks(indices) {
            current.extend_from_slice(&block?);
            if current.len() == bucket_len {
                buckets.push(std::mem::take(&mut current));
                current.reserve(bucket_len);
            }
        }
        Ok(buckets)
    }

    fn write_path(
        &mut self,
        leaf: LeafAddress,
        buckets: Vec<Vec<u8>>,
    ) -> Result<(), StoreError> {
        let levels = self.heap.levels();
        assert_eq!(
            buckets.len(),
            levels as usize,
            "write_path expects one bucket per level"
        );
        log::debug!("path write -- leaf {} levels 0..{}", leaf, levels);

        let block_size = self.device.block_size() as usize;
        let z = self.heap.blocks_per_bucket();
        let indices = self.path_block_indices(leaf, 0);

        let mut blocks = Vec::with_capacity(indices.len());
        for bucket in buckets {
            assert_eq!(
                bucket.len(),
                z * block_size,
                "bucket blob length does not match the device geometry"
            );
            for chunk in bucket.chunks_exact(block_size) {
                blocks.push(chunk.to_vec());
            }
        }
        // One batch: with an async device this is the single outstanding
        // write for the whole eviction.
        self.device.write_blocks(&indices, blocks, None)
    }
}

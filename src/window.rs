// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The in-memory copy of one loaded root-to-leaf path.
//!
//! A window holds the raw bucket bytes for every level of the path plus
//! per-slot metadata tracking which block sits where and where its bytes
//! will come from at eviction time. Slots are numbered root-first: slot
//! `s` lives at level `s / Z` in bucket position `s % Z`, so higher slot
//! indices are deeper in the tree.

use crate::addressing::AddressingStrategy;
use crate::{BlockId, BucketSize, LeafAddress, TreeLevel};

/// Where a slot's bytes come from when the path is written back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOrigin {
    /// The loaded bytes at this slot are already correct.
    Loaded,
    /// The bytes of the block now in this slot live at another slot of the
    /// loaded window (the block was relocated down the path).
    Moved(usize),
    /// The slot was vacated; it receives the empty tag at eviction.
    Cleared,
    /// The slot receives a block staged from the stash.
    Staged(BlockId),
}

/// Metadata for one block slot of the loaded path.
#[derive(Debug, Clone)]
pub struct Slot {
    /// The id of the block occupying this slot, or `None` if empty.
    pub id: Option<BlockId>,
    /// The deepest level at which this slot's block may legally be placed
    /// on the current path. `None` for empty slots.
    pub eviction_level: Option<TreeLevel>,
    /// Where the slot's bytes come from at eviction.
    pub origin: SlotOrigin,
}

impl Slot {
    fn empty(origin: SlotOrigin) -> Self {
        Self {
            id: None,
            eviction_level: None,
            origin,
        }
    }
}

/// One loaded root-to-leaf path of buckets.
#[derive(Debug)]
pub struct PathWindow {
    stop_leaf: LeafAddress,
    blocks_per_bucket: BucketSize,
    block_size: usize,
    /// Raw bucket bytes, one blob per level, root first.
    buckets: Vec<Vec<u8>>,
    slots: Vec<Slot>,
    /// Stash blocks staged for slots, written out at eviction.
    staged: Vec<(usize, Vec<u8>)>,
}

impl PathWindow {
    /// Builds a window over the given bucket blobs.
    ///
    /// Slot metadata starts out all-empty; the path manager rebuilds it by
    /// decoding every block. Bucket blobs must all have the same length,
    /// an exact multiple of `blocks_per_bucket`.
    pub fn new(
        stop_leaf: LeafAddress,
        blocks_per_bucket: BucketSize,
        buckets: Vec<Vec<u8>>,
    ) -> Self {
        assert!(blocks_per_bucket > 0, "blocks_per_bucket must be positive");
        assert!(!buckets.is_empty(), "a path has at least one bucket");
        let bucket_len = buckets[0].len();
        assert!(
            bucket_len % blocks_per_bucket == 0,
            "bucket length {} is not a multiple of blocks_per_bucket {}",
            bucket_len,
            blocks_per_bucket
        );
        for bucket in &buckets {
            assert_eq!(bucket.len(), bucket_len, "mismatched bucket lengths");
        }

        let slot_count = buckets.len() * blocks_per_bucket;
        Self {
            stop_leaf,
            blocks_per_bucket,
            block_size: bucket_len / blocks_per_bucket,
            buckets,
            slots: vec![Slot::empty(SlotOrigin::Loaded); slot_count],
            staged: Vec::new(),
        }
    }

    /// The leaf this path stops at.
    pub fn stop_leaf(&self) -> LeafAddress {
        self.stop_leaf
    }

    /// The number of levels in the window.
    pub fn levels(&self) -> TreeLevel {
        self.buckets.len() as TreeLevel
    }

    /// The number of block slots in the window.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// The size in bytes of one block.
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// The level slot `s` lives at.
    pub fn level_of_slot(&self, s: usize) -> TreeLevel {
        assert!(s < self.slots.len(), "slot index {} out of range", s);
        (s / self.blocks_per_bucket) as TreeLevel
    }

    /// The index of the first (shallowest-numbered) slot in the bucket
    /// containing slot `s`.
    pub fn first_slot_of_bucket(&self, s: usize) -> usize {
        assert!(s < self.slots.len(), "slot index {} out of range", s);
        s - s % self.blocks_per_bucket
    }

    /// The metadata for slot `s`.
    pub fn slot(&self, s: usize) -> &Slot {
        &self.slots[s]
    }

    /// All slot metadata, root first.
    pub fn slots(&self) -> &[Slot] {
        &self.slots
    }

    /// The loaded bytes of the block at slot `s`.
    pub fn block_bytes(&self, s: usize) -> &[u8] {
        assert!(s < self.slots.len(), "slot index {} out of range", s);
        let level = s / self.blocks_per_bucket;
        let offset = (s % self.blocks_per_bucket) * self.block_size;
        &self.buckets[level][offset..offset + self.block_size]
    }

    /// Replaces the buckets from `level_start` down with freshly fetched
    /// blobs, keeping shallower levels, and resets all slot metadata and
    /// relocation bookkeeping for the new leaf.
    pub fn reload(
        &mut self,
        stop_leaf: LeafAddress,
        level_start: TreeLevel,
        fetched: Vec<Vec<u8>>,
    ) {
        assert_eq!(
            level_start as usize + fetched.len(),
            self.buckets.len(),
            "fetched buckets do not cover levels {}..{}",
            level_start,
            self.buckets.len()
        );
        for (offset, bucket) in fetched.into_iter().enumerate() {
            assert_eq!(
                bucket.len(),
                self.block_size * self.blocks_per_bucket,
                "mismatched bucket length at level {}",
                level_start as usize + offset
            );
            self.buckets[level_start as usize + offset] = bucket;
        }
        self.stop_leaf = stop_leaf;
        self.slots.fill(Slot::empty(SlotOrigin::Loaded));
        self.staged.clear();
    }

    /// Records decoded metadata for slot `s` after a load.
    pub fn set_loaded_slot(
        &mut self,
        s: usize,
        id: Option<BlockId>,
        eviction_level: Option<TreeLevel>,
    ) {
        assert!(s < self.slots.len(), "slot index {} out of range", s);
        assert_eq!(
            id.is_some(),
            eviction_level.is_some(),
            "real slots carry an eviction level, empty slots do not"
        );
        self.slots[s] = Slot {
            id,
            eviction_level,
            origin: SlotOrigin::Loaded,
        };
    }

    /// Vacates slot `s` (the block was extracted), returning a copy of its
    /// loaded bytes.
    pub fn clear_slot(&mut self, s: usize) -> Vec<u8> {
        assert!(self.slots[s].id.is_some(), "slot {} is already empty", s);
        assert_eq!(
            self.slots[s].origin,
            SlotOrigin::Loaded,
            "only freshly loaded blocks can be extracted"
        );
        let bytes = self.block_bytes(s).to_vec();
        self.slots[s] = Slot::empty(SlotOrigin::Cleared);
        bytes
    }

    /// Relocates the block at slot `src` down the path into the empty slot
    /// `dst`, clearing `src`.
    pub fn move_block(&mut self, src: usize, dst: usize) {
        assert!(src < dst, "push-down only relocates blocks deeper");
        assert!(
            self.slots[dst].id.is_none(),
            "destination slot {} is occupied",
            dst
        );
        let source = self.slots[src].clone();
        assert!(source.id.is_some(), "source slot {} holds no block", src);
        // The block's bytes stay at whichever loaded slot they were read
        // from, even across repeated relocation.
        let origin = match source.origin {
            SlotOrigin::Loaded => SlotOrigin::Moved(src),
            SlotOrigin::Moved(data_slot) => SlotOrigin::Moved(data_slot),
            other => panic!("slot {} with origin {:?} cannot donate its block", src, other),
        };
        self.slots[dst] = Slot {
            id: source.id,
            eviction_level: source.eviction_level,
            origin,
        };
        self.slots[src] = Slot::empty(SlotOrigin::Cleared);
    }

    /// Places a stash block into the empty slot `s`, staging its bytes for
    /// eviction.
    pub fn stage_from_stash(
        &mut self,
        s: usize,
        id: BlockId,
        eviction_level: TreeLevel,
        bytes: Vec<u8>,
    ) {
        assert!(self.slots[s].id.is_none(), "slot {} is occupied", s);
        assert_eq!(
            bytes.len(),
            self.block_size,
            "stash block {} has length {}, expected {}",
            id,
            bytes.len(),
            self.block_size
        );
        assert!(
            eviction_level >= self.level_of_slot(s),
            "block {} may not be placed at level {}",
            id,
            self.level_of_slot(s)
        );
        self.slots[s] = Slot {
            id: Some(id),
            eviction_level: Some(eviction_level),
            origin: SlotOrigin::Staged(id),
        };
        self.staged.push((s, bytes));
    }

    /// Serializes the window back into per-level bucket blobs, resolving
    /// every slot's origin: moved blocks are copied from their loaded
    /// position, cleared slots get the empty tag, staged slots get their
    /// stash bytes.
    pub fn assemble<A: AddressingStrategy>(&self, strategy: &A) -> Vec<Vec<u8>> {
        let mut out = self.buckets.clone();
        for (s, slot) in self.slots.iter().enumerate() {
            let level = s / self.blocks_per_bucket;
            let offset = (s % self.blocks_per_bucket) * self.block_size;
            let target = &mut out[level][offset..offset + self.block_size];
            match slot.origin {
                SlotOrigin::Loaded => {}
                SlotOrigin::Moved(data_slot) => {
                    target.copy_from_slice(self.block_bytes(data_slot));
                }
                SlotOrigin::Cleared => {
                    strategy.tag_block_as_empty(target);
                }
                SlotOrigin::Staged(id) => {
                    let (_, bytes) = self
                        .staged
                        .iter()
                        .find(|(staged_slot, _)| *staged_slot == s)
                        .unwrap_or_else(|| panic!("no staged bytes for slot {} (block {})", s, id));
                    target.copy_from_slice(bytes);
                }
            }
        }
        out
    }

    /// Installs the assembled buckets as the window's contents after they
    /// have been written back, so common-ancestor levels kept by the next
    /// load reflect what is on disk.
    pub fn commit(&mut self, assembled: Vec<Vec<u8>>) {
        assert_eq!(assembled.len(), self.buckets.len());
        self.buckets = assembled;
        self.slots.fill(Slot::empty(SlotOrigin::Loaded));
        self.staged.clear();
    }
}

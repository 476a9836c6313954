// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The overflow stash.
//!
//! Blocks that could not be placed back onto the just-accessed path wait
//! here until a later path can legally hold them. The stash is unbounded;
//! growth beyond the expected handful of entries is observable and thus a
//! (mild, bounded) obliviousness leak, exactly as in the reference
//! behavior.

use crate::BlockId;
use std::collections::BTreeMap;

/// An unbounded `block id -> block bytes` overflow map.
///
/// Iteration order is ascending block id. [`fill_path_from_stash`] relies
/// on this as the fixed tie-break between candidates that could equally
/// well fill a slot.
///
/// [`fill_path_from_stash`]: crate::TreeOramPathManager::fill_path_from_stash
#[derive(Debug, Default)]
pub struct Stash {
    blocks: BTreeMap<BlockId, Vec<u8>>,
}

impl Stash {
    /// Returns an empty stash.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a block, returning the previously stashed bytes for the
    /// same id, if any.
    pub fn insert(&mut self, id: BlockId, block: Vec<u8>) -> Option<Vec<u8>> {
        self.blocks.insert(id, block)
    }

    /// Removes and returns the block with the given id.
    pub fn remove(&mut self, id: BlockId) -> Option<Vec<u8>> {
        self.blocks.remove(&id)
    }

    /// The stashed bytes for `id`, if present.
    pub fn get(&self, id: BlockId) -> Option<&[u8]> {
        self.blocks.get(&id).map(Vec::as_slice)
    }

    /// Whether the stash holds a block with the given id.
    pub fn contains(&self, id: BlockId) -> bool {
        self.blocks.contains_key(&id)
    }

    /// The number of stashed blocks.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the stash is empty.
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// The stashed blocks in ascending id order.
    pub fn iter(&self) -> impl Iterator<Item = (BlockId, &[u8])> {
        self.blocks.iter().map(|(&id, block)| (id, block.as_slice()))
    }

    /// The stashed ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = BlockId> + '_ {
        self.blocks.keys().copied()
    }
}

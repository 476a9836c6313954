// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The path-access state machine.
//!
//! One logical access is one cycle through the machine:
//!
//! ```text
//! Idle -> load_path -> PathLoaded -> [extract_block_from_path]
//!      -> push_down_path -> PushedDown
//!      -> fill_path_from_stash -> FilledFromStash
//!      -> evict_path -> Idle
//! ```
//!
//! `load_path` fetches the buckets on the path to the chosen leaf,
//! `push_down_path` relocates already-loaded blocks as deep as their
//! eviction levels allow, `fill_path_from_stash` places stashed blocks
//! into the remaining holes, and `evict_path` rewrites the whole path in
//! a single device write. Calling an operation out of phase is a caller
//! bug and panics.

use crate::addressing::AddressingStrategy;
use crate::heap::{StorageHeap, VirtualHeap};
use crate::stash::Stash;
use crate::window::PathWindow;
use crate::{BlockId, LeafAddress, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    PathLoaded,
    PushedDown,
    FilledFromStash,
}

/// Reads, reshuffles, and rewrites one root-to-leaf path per logical
/// access, so the physical addresses touched depend only on the chosen
/// leaves.
///
/// The manager is synchronous; its only concurrency is whatever write
/// pipeline the underlying store provides.
#[derive(Debug)]
pub struct TreeOramPathManager<S: StorageHeap, A: AddressingStrategy> {
    store: S,
    addressing: A,
    stash: Stash,
    window: Option<PathWindow>,
    previous_leaf: Option<LeafAddress>,
    phase: Phase,
}

impl<S: StorageHeap, A: AddressingStrategy> TreeOramPathManager<S, A> {
    /// Builds a manager over the given store and block-header strategy.
    pub fn new(store: S, addressing: A) -> Self {
        let geometry = store.geometry();
        assert!(geometry.levels() >= 1, "the tree needs at least one level");
        assert!(geometry.k() >= 2, "tree arity must be at least 2");
        assert!(
            geometry.blocks_per_bucket() >= 1,
            "buckets hold at least one block"
        );
        log::info!(
            "TreeOramPathManager::new(levels = {}, k = {}, Z = {})",
            geometry.levels(),
            geometry.k(),
            geometry.blocks_per_bucket()
        );
        Self {
            store,
            addressing,
            stash: Stash::new(),
            window: None,
            previous_leaf: None,
            phase: Phase::Idle,
        }
    }

    /// The overflow stash. Callers consult it when
    /// [`extract_block_from_path`](Self::extract_block_from_path) misses.
    pub fn stash(&self) -> &Stash {
        &self.stash
    }

    /// The overflow stash, mutably.
    pub fn stash_mut(&mut self) -> &mut Stash {
        &mut self.stash
    }

    /// The block-header strategy.
    pub fn addressing(&self) -> &A {
        &self.addressing
    }

    /// The block-header strategy, mutably. Explicit-mode callers update
    /// the position map through this when remapping blocks.
    pub fn addressing_mut(&mut self) -> &mut A {
        &mut self.addressing
    }

    /// The underlying storage heap.
    pub fn store(&self) -> &S {
        &self.store
    }

    /// The currently loaded window, if a cycle is in progress or a
    /// previous window is being retained for common-ancestor reuse.
    pub fn window(&self) -> Option<&PathWindow> {
        self.window.as_ref()
    }

    /// The leaf of the most recently loaded path.
    pub fn previous_leaf(&self) -> Option<LeafAddress> {
        self.previous_leaf
    }

    fn loaded_window(&self) -> &PathWindow {
        match &self.window {
            Some(window) => window,
            None => panic!("no path is loaded"),
        }
    }

    fn loaded_window_mut(&mut self) -> &mut PathWindow {
        match &mut self.window {
            Some(window) => window,
            None => panic!("no path is loaded"),
        }
    }

    /// Loads the path to `leaf` into the window.
    ///
    /// Only buckets at levels `[last_common_level(previous_leaf, leaf),
    /// levels)` are fetched from the device; common-ancestor buckets kept
    /// from the previous window are reused unchanged. Slot metadata is
    /// rebuilt for the entire window and relocation bookkeeping is reset.
    ///
    /// `leaf` outside `[0, bucket_count)` is a caller bug and panics.
    pub fn load_path(&mut self, leaf: LeafAddress) -> Result<(), StoreError> {
        assert_eq!(
            self.phase,
            Phase::Idle,
            "load_path called while an access cycle is in progress"
        );
        let geometry = self.store.geometry();
        assert!(
            u64::from(leaf) < geometry.bucket_count(),
            "leaf {} out of range (bucket_count = {})",
            leaf,
            geometry.bucket_count()
        );

        let read_level_start = match self.previous_leaf {
            Some(previous) => geometry.last_common_level(previous, leaf),
            None => 0,
        };
        let blocks_per_bucket = geometry.blocks_per_bucket();
        let fetched = self.store.read_path(leaf, read_level_start)?;

        match &mut self.window {
            Some(window) => window.reload(leaf, read_level_start, fetched),
            None => {
                assert_eq!(read_level_start, 0);
                self.window = Some(PathWindow::new(leaf, blocks_per_bucket, fetched));
            }
        }

        let window = match &mut self.window {
            Some(window) => window,
            None => unreachable!(),
        };
        assert!(
            window.block_size() > A::HEADER_LEN,
            "block size {} leaves no payload after the {}-byte header",
            window.block_size(),
            A::HEADER_LEN
        );

        let geometry = self.store.geometry();
        for s in 0..window.slot_count() {
            match self.addressing.decode(window.block_bytes(s)) {
                Some(tag) => {
                    let eviction_level = geometry.last_common_level(leaf, tag.address);
                    window.set_loaded_slot(s, Some(tag.id), Some(eviction_level));
                }
                None => window.set_loaded_slot(s, None, None),
            }
        }

        log::debug!(
            "load_path -- leaf {} (read from level {})",
            leaf,
            read_level_start
        );
        self.phase = Phase::PathLoaded;
        Ok(())
    }

    /// Scans the window for `id` and, if found, vacates its slot and
    /// returns a copy of its bytes.
    ///
    /// `None` means the block is not on the loaded path; that is a normal
    /// outcome, and the caller must check the stash next.
    pub fn extract_block_from_path(&mut self, id: BlockId) -> Option<Vec<u8>> {
        assert_eq!(
            self.phase,
            Phase::PathLoaded,
            "extract_block_from_path requires a freshly loaded path"
        );
        let window = self.loaded_window_mut();
        let slot = window.slots().iter().position(|slot| slot.id == Some(id))?;
        log::debug!("extract -- block {} found at slot {}", id, slot);
        Some(window.clear_slot(slot))
    }

    /// Hands a block (back) to the engine: tags its header with `id` (and,
    /// in pointer mode, `address`) and stashes it for placement on a
    /// future eviction.
    ///
    /// The block must not currently sit on the loaded path; stashing a
    /// path-resident id would duplicate it and panics.
    pub fn stash_block(&mut self, id: BlockId, address: LeafAddress, mut block: Vec<u8>) {
        if let Some(window) = &self.window {
            assert!(
                !window.slots().iter().any(|slot| slot.id == Some(id)),
                "block {} is already on the loaded path",
                id
            );
            assert_eq!(
                block.len(),
                window.block_size(),
                "block {} has length {}, expected {}",
                id,
                block.len(),
                window.block_size()
            );
        }
        self.addressing.tag_block_with_id(&mut block, id, address);
        self.stash.insert(id, block);
    }

    /// Relocates already-loaded blocks as deep along the path as their
    /// eviction levels allow.
    ///
    /// Write positions are scanned from the deepest slot upward. For each
    /// empty slot, the nearest real block further up whose eviction level
    /// permits the target level (and that is not already in the target's
    /// bucket) is swapped down. When an empty slot finds no candidate at
    /// all, the scan jumps to the top of that bucket: its remaining slots
    /// are at the same level, and the candidate set above has only shrunk.
    pub fn push_down_path(&mut self) {
        assert_eq!(
            self.phase,
            Phase::PathLoaded,
            "push_down_path requires a loaded path"
        );
        let window = self.loaded_window_mut();

        let mut w = window.slot_count();
        while w > 0 {
            w -= 1;
            if window.slot(w).id.is_some() {
                continue;
            }
            let target_level = window.level_of_slot(w);

            let mut source = None;
            for s in (0..w).rev() {
                let Some(eviction_level) = window.slot(s).eviction_level else {
                    continue;
                };
                if window.level_of_slot(s) == target_level {
                    continue;
                }
                if eviction_level >= target_level {
                    source = Some(s);
                    break;
                }
            }

            match source {
                Some(s) => window.move_block(s, w),
                None => w = window.first_slot_of_bucket(w),
            }
        }
        self.phase = Phase::PushedDown;
    }

    /// Places stashed blocks into the window's remaining empty slots.
    ///
    /// Write positions are scanned from the deepest slot upward; each
    /// still-empty slot takes the lowest-id stash entry whose eviction
    /// level (computed against the current leaf) permits the slot's level.
    /// Placed entries leave the stash and are staged for write-back.
    pub fn fill_path_from_stash(&mut self) {
        assert_eq!(
            self.phase,
            Phase::PushedDown,
            "fill_path_from_stash follows push_down_path"
        );
        let window = match &mut self.window {
            Some(window) => window,
            None => panic!("no path is loaded"),
        };
        let geometry = self.store.geometry();
        let leaf = window.stop_leaf();

        for w in (0..window.slot_count()).rev() {
            if window.slot(w).id.is_some() {
                continue;
            }
            let target_level = window.level_of_slot(w);

            let mut chosen = None;
            for (id, block) in self.stash.iter() {
                let tag = match self.addressing.decode(block) {
                    Some(tag) => tag,
                    None => panic!("stash entry {} does not decode as a real block", id),
                };
                let eviction_level = geometry.last_common_level(leaf, tag.address);
                if eviction_level >= target_level {
                    chosen = Some((id, eviction_level));
                    break;
                }
            }

            if let Some((id, eviction_level)) = chosen {
                let block = match self.stash.remove(id) {
                    Some(block) => block,
                    None => unreachable!(),
                };
                log::debug!("fill -- block {} placed at slot {}", id, w);
                window.stage_from_stash(w, id, eviction_level, block);
            }
        }
        self.phase = Phase::FilledFromStash;
    }

    /// Serializes the window and rewrites the whole path in one device
    /// write, then returns to idle.
    pub fn evict_path(&mut self) -> Result<(), StoreError> {
        assert_eq!(
            self.phase,
            Phase::FilledFromStash,
            "evict_path follows fill_path_from_stash"
        );
        let (leaf, assembled) = {
            let window = self.loaded_window();
            (window.stop_leaf(), window.assemble(&self.addressing))
        };
        self.store.write_path(leaf, assembled.clone())?;
        // Keep the written bytes: the next load reuses common-ancestor
        // buckets from this window.
        self.loaded_window_mut().commit(assembled);
        self.previous_leaf = Some(leaf);
        self.phase = Phase::Idle;
        log::debug!("evict_path -- leaf {}", leaf);
        Ok(())
    }
}

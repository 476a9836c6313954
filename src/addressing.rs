// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The two block-header encodings.
//!
//! Each block's leading bytes carry its status and identity. The
//! [`ExplicitAddressing`] strategy stores `(status, id)` and trusts an
//! externally supplied position map for the block's leaf address; the
//! [`PointerAddressing`] strategy stores `(status, id, address)` and is
//! self-describing. Payload bytes beyond the header are never touched by
//! either strategy.

use crate::{BlockId, LeafAddress};
use std::collections::HashMap;

const STATUS_EMPTY: u8 = 0;
const STATUS_REAL: u8 = 1;

/// The identity decoded from a real block's header: its logical id and the
/// leaf it is mapped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTag {
    /// The block's logical identifier.
    pub id: BlockId,
    /// The leaf the block currently targets.
    pub address: LeafAddress,
}

/// A caller-owned position map: anything that can answer `id -> leaf`.
///
/// Only the explicit addressing strategy consults this; asking for an id
/// the map does not know is a caller bug and panics.
pub trait PositionLookup {
    /// The leaf address block `id` is mapped to.
    fn position_of(&self, id: BlockId) -> LeafAddress;
}

impl PositionLookup for Vec<LeafAddress> {
    fn position_of(&self, id: BlockId) -> LeafAddress {
        self[id as usize]
    }
}

impl PositionLookup for &[LeafAddress] {
    fn position_of(&self, id: BlockId) -> LeafAddress {
        self[id as usize]
    }
}

impl PositionLookup for HashMap<BlockId, LeafAddress> {
    fn position_of(&self, id: BlockId) -> LeafAddress {
        self[&id]
    }
}

/// A block-header encoding.
///
/// Implementations read and write only the first [`HEADER_LEN`] bytes of a
/// block; everything after that is payload.
///
/// [`HEADER_LEN`]: AddressingStrategy::HEADER_LEN
pub trait AddressingStrategy {
    /// The number of leading bytes of each block reserved for the header.
    const HEADER_LEN: usize;

    /// Decodes the block's tag, or `None` if the block is empty.
    fn decode(&self, block: &[u8]) -> Option<BlockTag>;

    /// Marks the block as empty by overwriting the status field, leaving
    /// the rest of the block untouched.
    fn tag_block_as_empty(&self, block: &mut [u8]);

    /// Marks the block as real and writes its identity, leaving the
    /// payload untouched. The explicit strategy ignores `address` (the
    /// position map is authoritative); the pointer strategy records it.
    fn tag_block_with_id(&self, block: &mut [u8], id: BlockId, address: LeafAddress);
}

/// `(status, id)` block headers plus an external position map.
#[derive(Debug)]
pub struct ExplicitAddressing<M: PositionLookup> {
    map: M,
}

impl<M: PositionLookup> ExplicitAddressing<M> {
    /// Wraps the caller-owned position map.
    pub fn new(map: M) -> Self {
        Self { map }
    }

    /// The position map.
    pub fn map(&self) -> &M {
        &self.map
    }

    /// The position map, mutably. The caller updates it when a block is
    /// remapped to a new leaf.
    pub fn map_mut(&mut self) -> &mut M {
        &mut self.map
    }
}

impl<M: PositionLookup> AddressingStrategy for ExplicitAddressing<M> {
    const HEADER_LEN: usize = 5;

    fn decode(&self, block: &[u8]) -> Option<BlockTag> {
        assert!(block.len() >= Self::HEADER_LEN);
        if block[0] != STATUS_REAL {
            return None;
        }
        let id = BlockId::from_le_bytes([block[1], block[2], block[3], block[4]]);
        Some(BlockTag {
            id,
            address: self.map.position_of(id),
        })
    }

    fn tag_block_as_empty(&self, block: &mut [u8]) {
        assert!(block.len() >= Self::HEADER_LEN);
        block[0] = STATUS_EMPTY;
    }

    fn tag_block_with_id(&self, block: &mut [u8], id: BlockId, _address: LeafAddress) {
        assert!(block.len() >= Self::HEADER_LEN);
        block[0] = STATUS_REAL;
        block[1..5].copy_from_slice(&id.to_le_bytes());
    }
}

/// Self-describing `(status, id, address)` block headers; no external map.
#[derive(Debug, Default, Clone, Copy)]
pub struct PointerAddressing;

impl AddressingStrategy for PointerAddressing {
    const HEADER_LEN: usize = 9;

    fn decode(&self, block: &[u8]) -> Option<BlockTag> {
        assert!(block.len() >= Self::HEADER_LEN);
        if block[0] != STATUS_REAL {
            return None;
        }
        Some(BlockTag {
            id: BlockId::from_le_bytes([block[1], block[2], block[3], block[4]]),
            address: LeafAddress::from_le_bytes([block[5], block[6], block[7], block[8]]),
        })
    }

    fn tag_block_as_empty(&self, block: &mut [u8]) {
        assert!(block.len() >= Self::HEADER_LEN);
        block[0] = STATUS_EMPTY;
    }

    fn tag_block_with_id(&self, block: &mut [u8], id: BlockId, address: LeafAddress) {
        assert!(block.len() >= Self::HEADER_LEN);
        block[0] = STATUS_REAL;
        block[1..5].copy_from_slice(&id.to_le_bytes());
        block[5..9].copy_from_slice(&address.to_le_bytes());
    }
}

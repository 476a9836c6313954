// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! An oblivious tree-storage engine.
//!
//! This crate combines a file-backed block device with a Path-ORAM style
//! path-access algorithm. The backing file is addressed as a tree of
//! fixed-size buckets; every logical access reads, reshuffles, and rewrites
//! an entire root-to-leaf path of buckets, so the sequence of physical
//! addresses touched depends only on the chosen leaves, never on which
//! logical block was requested.
//!
//! The main pieces are:
//!
//! - [`BlockDevice`]: the fixed-block-size file store with a header-encoded
//!   advisory lock and a single-slot asynchronous write pipeline.
//! - [`VirtualHeap`] and [`StorageHeap`]: the geometry contracts supplied by
//!   a virtual-heap module, and [`FileHeapStore`] gluing a geometry to a
//!   device.
//! - [`AddressingStrategy`]: the two block-header encodings
//!   ([`ExplicitAddressing`] with a caller-owned position map, and the
//!   self-describing [`PointerAddressing`]).
//! - [`TreeOramPathManager`]: the load / extract / push-down /
//!   fill-from-stash / evict state machine, with its overflow [`Stash`].
//!
//! Block payloads are stored in plaintext: this layer hides the *access
//! pattern*, not the contents.

#![warn(clippy::doc_markdown, rustdoc::all)]

pub mod addressing;
pub mod device;
pub mod heap;
pub mod path_manager;
pub mod stash;
pub mod window;

#[cfg(test)]
pub(crate) mod test_utils;

pub use addressing::{
    AddressingStrategy, BlockTag, ExplicitAddressing, PointerAddressing, PositionLookup,
};
pub use device::{BlockDevice, DeviceConfig, SetupOptions};
pub use heap::{FileHeapStore, StorageHeap, VirtualHeap};
pub use path_manager::TreeOramPathManager;
pub use stash::Stash;
pub use window::{PathWindow, Slot, SlotOrigin};

use std::path::PathBuf;
use thiserror::Error;

/// The logical identifier of a stored block.
pub type BlockId = u32;
/// The leaf a block is mapped to. Every access touches the full path from
/// the root bucket to one leaf bucket.
pub type LeafAddress = u32;
/// A level of the storage tree; the root is level 0.
pub type TreeLevel = u32;
/// The index of a bucket in the backing store.
pub type BucketIndex = u64;
/// The number of blocks per bucket (the parameter "Z" from the Path ORAM
/// literature).
pub type BucketSize = usize;

/// The error type for device and path-manager operations.
///
/// Only recoverable conditions are represented here. A block missing from
/// the loaded path is a normal outcome (an `Option`, not an error), and
/// precondition violations such as out-of-range indices or mismatched
/// block/bucket geometry indicate a caller or configuration bug and panic
/// rather than returning a variant.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The setup target path is already occupied.
    #[error("device file already exists: {0}")]
    AlreadyExists(PathBuf),
    /// A size, length, or option was rejected up front.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The device file is marked locked and `ignore_lock` was not requested.
    #[error("device file is locked: {0}")]
    Locked(PathBuf),
    /// An underlying I/O operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

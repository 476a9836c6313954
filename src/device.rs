// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A file-backed block device with a header-encoded advisory lock and a
//! single-slot asynchronous write pipeline.
//!
//! On-disk layout, little-endian:
//!
//! ```text
//! [block_size: u32][block_count: u32][user_header_len: u32][locked: u8]
//! [user_header_len opaque bytes]
//! [block_count x block_size bytes of blocks]
//! ```

use crate::StoreError;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};
use std::sync::Arc;
use threadpool::ThreadPool;

/// Length in bytes of the fixed header prefix.
pub const FIXED_HEADER_LEN: usize = 13;

/// Byte offset of the lock flag within the fixed header.
const LOCK_FLAG_OFFSET: u64 = 12;

/// Progress callback invoked with each block index as it is written.
pub type ProgressFn = Box<dyn FnMut(u32) + Send>;

/// Configuration passed explicitly to [`BlockDevice::setup`] and
/// [`BlockDevice::open`].
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Number of worker threads for asynchronous writes. Zero means all
    /// writes are performed synchronously on the calling thread.
    pub write_workers: usize,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self { write_workers: 0 }
    }
}

/// Options for [`BlockDevice::setup`].
pub struct SetupOptions {
    /// Opaque caller-owned bytes stored after the fixed header.
    pub header_data: Vec<u8>,
    /// Produces the initial contents of block `i`. Blocks are zero-filled
    /// when absent.
    pub initializer: Option<Box<dyn FnMut(u32) -> Vec<u8>>>,
    /// Overwrite an existing file instead of failing with `AlreadyExists`.
    pub ignore_existing: bool,
    /// Device configuration for the returned handle.
    pub config: DeviceConfig,
}

impl Default for SetupOptions {
    fn default() -> Self {
        Self {
            header_data: Vec::new(),
            initializer: None,
            ignore_existing: false,
            config: DeviceConfig::default(),
        }
    }
}

/// A fixed-block-size file store.
///
/// One handle wraps one OS file descriptor. The handle is not meant to be
/// shared across threads; the only internal concurrency is the optional
/// write pipeline, which keeps **at most one write in flight**: any read,
/// write, or header update first waits for the previously dispatched write
/// batch to complete.
///
/// The `locked` header flag is an advisory, cooperative lock. It is checked
/// only at [`open`](Self::open) time and rewritten at open/close; it does
/// not arbitrate two writers that both pass `ignore_lock`, and a crash
/// while holding the lock leaves the flag set until an operator reopens
/// with `ignore_lock = true`.
pub struct BlockDevice {
    file: File,
    path: PathBuf,
    block_size: u32,
    block_count: u32,
    header_data: Vec<u8>,
    ignore_lock: bool,
    pool: Option<Arc<ThreadPool>>,
    owns_pool: bool,
    /// The single outstanding asynchronous write, if any.
    pending: Option<Receiver<io::Result<()>>>,
    closed: bool,
}

impl std::fmt::Debug for BlockDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockDevice")
            .field("path", &self.path)
            .field("block_size", &self.block_size)
            .field("block_count", &self.block_count)
            .field("header_len", &self.header_data.len())
            .field("ignore_lock", &self.ignore_lock)
            .field("async_writes", &self.pool.is_some())
            .finish()
    }
}

impl BlockDevice {
    /// Creates a new device file at `path` and returns an open handle.
    ///
    /// The file is populated with `block_count` blocks of `block_size`
    /// bytes each, produced by `options.initializer` or zero-filled. If
    /// population fails partway, the partial file is deleted before the
    /// error is returned, so a failed setup leaves nothing on disk.
    ///
    /// # Errors
    ///
    /// - `AlreadyExists` if `path` exists and `ignore_existing` is false.
    /// - `InvalidArgument` if `block_size` or `block_count` is zero, or if
    ///   the initializer returns a buffer of the wrong length.
    /// - `Io` for underlying filesystem failures.
    pub fn setup(
        path: impl AsRef<Path>,
        block_size: u32,
        block_count: u32,
        options: SetupOptions,
    ) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if block_size == 0 {
            return Err(StoreError::InvalidArgument(
                "block_size must be a positive integer".into(),
            ));
        }
        if block_count == 0 {
            return Err(StoreError::InvalidArgument(
                "block_count must be a positive integer".into(),
            ));
        }
        if path.exists() && !options.ignore_existing {
            return Err(StoreError::AlreadyExists(path));
        }

        log::info!(
            "BlockDevice::setup({}, block_size = {}, block_count = {})",
            path.display(),
            block_size,
            block_count
        );

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let SetupOptions {
            header_data,
            mut initializer,
            config,
            ..
        } = options;

        let mut populate = |file: &mut File| -> Result<(), StoreError> {
            file.write_all(&block_size.to_le_bytes())?;
            file.write_all(&block_count.to_le_bytes())?;
            file.write_all(&(header_data.len() as u32).to_le_bytes())?;
            // The returned handle holds the lock.
            file.write_all(&[1u8])?;
            file.write_all(&header_data)?;

            let progress_interval = (block_count / 10).max(1);
            let zeroes = vec![0u8; block_size as usize];
            for i in 0..block_count {
                match initializer.as_mut() {
                    Some(init) => {
                        let block = init(i);
                        if block.len() != block_size as usize {
                            return Err(StoreError::InvalidArgument(format!(
                                "initializer returned {} bytes for block {}, expected {}",
                                block.len(),
                                i,
                                block_size
                            )));
                        }
                        file.write_all(&block)?;
                    }
                    None => file.write_all(&zeroes)?,
                }
                if i % progress_interval == 0 {
                    log::debug!("setup progress -- {}/{} blocks", i, block_count);
                }
            }
            file.flush()?;
            Ok(())
        };

        if let Err(e) = populate(&mut file) {
            drop(file);
            if let Err(cleanup) = std::fs::remove_file(&path) {
                log::warn!(
                    "failed to remove partial device file {}: {}",
                    path.display(),
                    cleanup
                );
            }
            return Err(e);
        }

        Ok(Self {
            file,
            path,
            block_size,
            block_count,
            header_data,
            ignore_lock: false,
            pool: new_pool(&config),
            owns_pool: true,
            pending: None,
            closed: false,
        })
    }

    /// Opens an existing device file.
    ///
    /// Unless `ignore_lock` is set, a locked file is rejected with
    /// `Locked` (and left untouched), and a successful open rewrites the
    /// header with `locked = true`.
    ///
    /// # Errors
    ///
    /// - `Locked` if the file is locked and `ignore_lock` is false.
    /// - `InvalidArgument` if the file is too short to hold its headers.
    /// - `Io` for underlying filesystem failures.
    pub fn open(
        path: impl AsRef<Path>,
        ignore_lock: bool,
        config: DeviceConfig,
    ) -> Result<Self, StoreError> {
        let pool = new_pool(&config);
        Self::open_with_pool(path.as_ref(), ignore_lock, pool, true)
    }

    fn open_with_pool(
        path: &Path,
        ignore_lock: bool,
        pool: Option<Arc<ThreadPool>>,
        owns_pool: bool,
    ) -> Result<Self, StoreError> {
        let path = path.to_path_buf();
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut fixed = [0u8; FIXED_HEADER_LEN];
        file.read_exact(&mut fixed).map_err(|_| {
            StoreError::InvalidArgument(format!(
                "{} is too short to be a device file",
                path.display()
            ))
        })?;

        let block_size = u32::from_le_bytes([fixed[0], fixed[1], fixed[2], fixed[3]]);
        let block_count = u32::from_le_bytes([fixed[4], fixed[5], fixed[6], fixed[7]]);
        let header_len = u32::from_le_bytes([fixed[8], fixed[9], fixed[10], fixed[11]]);
        let locked = fixed[12] != 0;

        if locked && !ignore_lock {
            return Err(StoreError::Locked(path));
        }

        let mut header_data = vec![0u8; header_len as usize];
        file.read_exact(&mut header_data).map_err(|_| {
            StoreError::InvalidArgument(format!(
                "{} is truncated within its user header",
                path.display()
            ))
        })?;

        if !ignore_lock {
            file.seek(SeekFrom::Start(LOCK_FLAG_OFFSET))?;
            file.write_all(&[1u8])?;
            file.flush()?;
        }

        log::info!(
            "BlockDevice::open({}, ignore_lock = {})",
            path.display(),
            ignore_lock
        );

        Ok(Self {
            file,
            path,
            block_size,
            block_count,
            header_data,
            ignore_lock,
            pool,
            owns_pool,
            pending: None,
            closed: false,
        })
    }

    /// Opens a second handle to the same file, bypassing the lock check and
    /// sharing this handle's worker pool. The clone does not own the pool
    /// and will not drain it on close.
    pub fn clone_device(&self) -> Result<Self, StoreError> {
        Self::open_with_pool(&self.path, true, self.pool.clone(), false)
    }

    /// The size in bytes of each block.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// The number of blocks stored by the device.
    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    /// The caller-owned header bytes.
    pub fn header_data(&self) -> &[u8] {
        &self.header_data
    }

    /// The path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn block_offset(&self, index: u32) -> u64 {
        assert!(
            index < self.block_count,
            "block index {} out of range (block_count = {})",
            index,
            self.block_count
        );
        (FIXED_HEADER_LEN + self.header_data.len()) as u64
            + u64::from(index) * u64::from(self.block_size)
    }

    /// Waits for the outstanding asynchronous write, if any, and surfaces
    /// its result.
    fn flush_pending(&mut self) -> Result<(), StoreError> {
        if let Some(rx) = self.pending.take() {
            match rx.recv() {
                Ok(result) => result?,
                Err(_) => {
                    return Err(StoreError::Io(io::Error::new(
                        io::ErrorKind::Other,
                        "background write worker disappeared",
                    )))
                }
            }
        }
        Ok(())
    }

    /// Reads block `index`.
    ///
    /// Any outstanding asynchronous write completes first, so reads always
    /// observe the most recently completed write.
    pub fn read_block(&mut self, index: u32) -> Result<Vec<u8>, StoreError> {
        let offset = self.block_offset(index);
        self.flush_pending()?;
        let mut block = vec![0u8; self.block_size as usize];
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(&mut block)?;
        Ok(block)
    }

    /// Reads the given blocks, in order.
    pub fn read_blocks(&mut self, indices: &[u32]) -> Result<Vec<Vec<u8>>, StoreError> {
        indices.iter().map(|&i| self.read_block(i)).collect()
    }

    /// Returns a lazy, finite sequence over the given blocks. Each block is
    /// read from the file only when the iterator is advanced; the sequence
    /// can be restarted by calling this method again.
    pub fn yield_blocks<'a, I>(
        &'a mut self,
        indices: I,
    ) -> impl Iterator<Item = Result<Vec<u8>, StoreError>> + 'a
    where
        I: IntoIterator<Item = u32>,
        I::IntoIter: 'a,
    {
        let mut indices = indices.into_iter();
        std::iter::from_fn(move || indices.next().map(|i| self.read_block(i)))
    }

    /// Writes `block` at `index`.
    ///
    /// With a worker pool, the write is dispatched asynchronously and this
    /// call returns immediately; the next read or write on this handle
    /// waits for it to complete.
    pub fn write_block(&mut self, index: u32, block: &[u8]) -> Result<(), StoreError> {
        self.write_blocks(&[index], vec![block.to_vec()], None)
    }

    /// Writes `blocks[j]` at `indices[j]` for every `j`, as a single batch.
    ///
    /// `on_block_written` is invoked with each block index after that block
    /// has been written. With a worker pool, the entire batch becomes the
    /// one outstanding write; a second batch started while this one is in
    /// flight waits for it, it is never dropped or reordered.
    pub fn write_blocks(
        &mut self,
        indices: &[u32],
        blocks: Vec<Vec<u8>>,
        on_block_written: Option<ProgressFn>,
    ) -> Result<(), StoreError> {
        assert_eq!(
            indices.len(),
            blocks.len(),
            "write_blocks called with {} indices but {} blocks",
            indices.len(),
            blocks.len()
        );
        let offsets: Vec<u64> = indices.iter().map(|&i| self.block_offset(i)).collect();
        for (j, block) in blocks.iter().enumerate() {
            assert_eq!(
                block.len(),
                self.block_size as usize,
                "block {} has length {}, expected block_size {}",
                indices[j],
                block.len(),
                self.block_size
            );
        }

        self.flush_pending()?;

        match &self.pool {
            Some(pool) => {
                let mut file = self.file.try_clone()?;
                let indices = indices.to_vec();
                let mut on_block_written = on_block_written;
                let (tx, rx) = channel();
                pool.execute(move || {
                    let result = (|| -> io::Result<()> {
                        for ((offset, block), index) in
                            offsets.iter().zip(&blocks).zip(&indices)
                        {
                            file.seek(SeekFrom::Start(*offset))?;
                            file.write_all(block)?;
                            if let Some(callback) = on_block_written.as_mut() {
                                callback(*index);
                            }
                        }
                        file.flush()
                    })();
                    // The receiver may already be gone if the handle was
                    // dropped without another operation; nothing to report
                    // to in that case.
                    let _ = tx.send(result);
                });
                self.pending = Some(rx);
            }
            None => {
                let mut on_block_written = on_block_written;
                for ((offset, block), index) in offsets.iter().zip(&blocks).zip(indices) {
                    self.file.seek(SeekFrom::Start(*offset))?;
                    self.file.write_all(block)?;
                    if let Some(callback) = on_block_written.as_mut() {
                        callback(*index);
                    }
                }
                self.file.flush()?;
            }
        }
        Ok(())
    }

    /// Overwrites the caller-owned header bytes in place.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if `header_data` does not have the same length as
    /// the header written at setup; the stored header is left unchanged.
    pub fn update_header_data(&mut self, header_data: &[u8]) -> Result<(), StoreError> {
        if header_data.len() != self.header_data.len() {
            return Err(StoreError::InvalidArgument(format!(
                "header data must be {} bytes, got {}",
                self.header_data.len(),
                header_data.len()
            )));
        }
        self.flush_pending()?;
        self.file.seek(SeekFrom::Start(FIXED_HEADER_LEN as u64))?;
        self.file.write_all(header_data)?;
        self.file.flush()?;
        self.header_data = header_data.to_vec();
        Ok(())
    }

    /// Flushes any outstanding write and releases the advisory lock
    /// (unless the handle was opened with `ignore_lock`). Idempotent;
    /// called automatically on drop.
    pub fn close(&mut self) -> Result<(), StoreError> {
        if self.closed {
            return Ok(());
        }
        self.flush_pending()?;
        if !self.ignore_lock {
            self.file.seek(SeekFrom::Start(LOCK_FLAG_OFFSET))?;
            self.file.write_all(&[0u8])?;
            self.file.flush()?;
        }
        if self.owns_pool {
            if let Some(pool) = &self.pool {
                pool.join();
            }
        }
        self.closed = true;
        log::info!("BlockDevice::close({})", self.path.display());
        Ok(())
    }
}

impl Drop for BlockDevice {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("error closing device {}: {}", self.path.display(), e);
        }
    }
}

fn new_pool(config: &DeviceConfig) -> Option<Arc<ThreadPool>> {
    if config.write_workers == 0 {
        None
    } else {
        Some(Arc::new(ThreadPool::new(config.write_workers)))
    }
}

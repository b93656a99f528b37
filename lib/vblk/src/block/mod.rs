// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Implements an interface to virtualized block storage.
//!
//! A [BlockDispatcher] is anything which can satisfy block I/O.  Dispatchers
//! compose by ownership: the [VolatileWriteBlockDispatcher] and
//! [QcowBlockDispatcher] decorators each own the dispatcher they wrap, while
//! the [RawBlockDispatcher] and [InMemoryDispatcher] sit at the bottom of such
//! a chain.

use std::io;

pub mod bitmap;

mod guard;
pub use guard::{IoCompletion, IoGuard};

mod in_memory;
pub use in_memory::{InMemoryDispatcher, OpCounts};

mod qcow;
pub use qcow::{QcowBlockDispatcher, QcowHeader};

mod raw;
pub use raw::{FileResource, RawBlockDispatcher, RawOpts, RemoteFile};

mod volatile;
pub use volatile::{OverlayOpts, VolatileWriteBlockDispatcher};

pub type ByteOffset = u64;

/// Size of the sector unit in which virtio-blk addresses requests
pub const SECTOR_SIZE: usize = 512;

/// Default maximum transfer size of a single backend request
pub const MAX_BUF: usize = 8192;

#[usdt::provider(provider = "vblk")]
mod probes {
    fn block_chunk_begin(off: u64, len: u64) {}
    fn block_chunk_done(off: u64, len: u64, result: u8) {}
    fn block_cache_hit(off: u64, len: u64) {}
    fn block_cache_miss(off: u64, len: u64) {}
}

/// Failure of a block operation
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("request {off:#x}+{len:#x} not aligned to {align} bytes")]
    Unaligned { off: ByteOffset, len: usize, align: usize },

    #[error("request {off:#x}+{len:#x} exceeds device size {size:#x}")]
    OutOfRange { off: ByteOffset, len: usize, size: u64 },

    #[error("short transfer: {done} of {expected} bytes")]
    ShortTransfer { expected: usize, done: usize },

    #[error("operation not supported")]
    NotSupported,

    #[error("invalid disk image: {0}")]
    InvalidImage(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

pub type BlockResult<T = ()> = std::result::Result<T, BlockError>;

/// Result of a block request, as reported to the device front end
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Result {
    /// Request succeeded
    Success = 0,
    /// Backend indicated failure for operation
    Failure,
    /// Operation not supported by backend
    Unsupported,
}
impl Result {
    pub const fn is_err(&self) -> bool {
        !matches!(self, Result::Success)
    }
}
impl From<&BlockError> for Result {
    fn from(value: &BlockError) -> Self {
        match value {
            BlockError::NotSupported => Result::Unsupported,
            _ => Result::Failure,
        }
    }
}
impl<T> From<&BlockResult<T>> for Result {
    fn from(value: &BlockResult<T>) -> Self {
        match value {
            Ok(_) => Result::Success,
            Err(e) => Result::from(e),
        }
    }
}

/// Capability to satisfy block I/O.
///
/// Offsets and lengths passed to the concrete implementations in this module
/// must be aligned to their [block size](Self::block_size).
#[async_trait::async_trait]
pub trait BlockDispatcher: Send + Sync + 'static {
    /// Flush any written data to durable storage
    async fn sync(&self) -> BlockResult;

    /// Fill `buf` with data starting at byte offset `off`
    async fn read_at(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult;

    /// Write the contents of `buf` starting at byte offset `off`
    async fn write_at(&self, buf: &[u8], off: ByteOffset) -> BlockResult;

    /// Size (in bytes) of the device
    fn size(&self) -> u64;

    /// Size (in bytes) per block
    fn block_size(&self) -> usize {
        SECTOR_SIZE
    }

    /// Largest request which the dispatcher satisfies in a single transfer
    fn max_transfer(&self) -> usize {
        MAX_BUF
    }
}

/// Dispatchers may be shared, for instance between a decorator and the code
/// which inspects its base.
#[async_trait::async_trait]
impl<T: BlockDispatcher + ?Sized> BlockDispatcher for std::sync::Arc<T> {
    async fn sync(&self) -> BlockResult {
        (**self).sync().await
    }

    async fn read_at(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult {
        (**self).read_at(buf, off).await
    }

    async fn write_at(&self, buf: &[u8], off: ByteOffset) -> BlockResult {
        (**self).write_at(buf, off).await
    }

    fn size(&self) -> u64 {
        (**self).size()
    }

    fn block_size(&self) -> usize {
        (**self).block_size()
    }

    fn max_transfer(&self) -> usize {
        (**self).max_transfer()
    }
}

/// Check that a request is block-aligned and lies within a device.
pub(crate) fn check_request(
    off: ByteOffset,
    len: usize,
    block_size: usize,
    size: u64,
) -> BlockResult {
    if off % block_size as u64 != 0 || len % block_size != 0 {
        return Err(BlockError::Unaligned { off, len, align: block_size });
    }
    match off.checked_add(len as u64) {
        Some(end) if end <= size => Ok(()),
        _ => Err(BlockError::OutOfRange { off, len, size }),
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Copy-on-write overlay holding guest writes in (volatile) host memory.

use std::io;
use std::sync::{Arc, Mutex};

use futures::future::join_all;
use serde::Deserialize;
use slog::{info, Logger};

use super::bitmap::RleBitmap;
use super::probes;
use super::{
    check_request, BlockDispatcher, BlockError, BlockResult, ByteOffset,
    IoGuard, MAX_BUF, SECTOR_SIZE,
};
use crate::vmm::Mapping;

/// Options for a [VolatileWriteBlockDispatcher]
#[derive(Copy, Clone, Debug, Deserialize)]
#[serde(default)]
pub struct OverlayOpts {
    /// Granularity (in bytes) at which the overlay tracks writes
    pub block_size: usize,

    /// Largest read issued in one request to the base dispatcher
    pub max_transfer: usize,
}
impl Default for OverlayOpts {
    fn default() -> Self {
        Self { block_size: SECTOR_SIZE, max_transfer: MAX_BUF }
    }
}

struct Overlay {
    cache: Arc<Mapping>,
    allocated: RleBitmap,
}

/// Dispatcher which absorbs all writes into an anonymous memory region,
/// leaving the base dispatcher untouched.
///
/// Reads of blocks which have been written are served from that region, while
/// the remainder are passed through to the base.
pub struct VolatileWriteBlockDispatcher {
    base: Box<dyn BlockDispatcher>,
    overlay: Mutex<Overlay>,
    block_size: usize,
    max_transfer: usize,
    size: u64,
}

impl VolatileWriteBlockDispatcher {
    pub fn new(
        base: Box<dyn BlockDispatcher>,
        opts: OverlayOpts,
        log: &Logger,
    ) -> io::Result<Self> {
        let block_size = opts.block_size;
        if block_size == 0 || !block_size.is_power_of_two() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid overlay block size {block_size}"),
            ));
        }
        if block_size % base.block_size() != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "overlay block size {} incompatible with base block size {}",
                    block_size,
                    base.block_size()
                ),
            ));
        }
        let size = base.size() - (base.size() % block_size as u64);
        let cache = Mapping::new_anon(size as usize)?;
        // Never ask the base for more than it can take in one request, nor for
        // less than a block.
        let max_transfer = opts
            .max_transfer
            .min(base.max_transfer())
            .max(block_size)
            / block_size
            * block_size;

        info!(log, "volatile overlay created";
            "size" => size,
            "block_size" => block_size,
            "max_transfer" => max_transfer,
        );

        Ok(Self {
            base,
            overlay: Mutex::new(Overlay { cache, allocated: RleBitmap::new() }),
            block_size,
            max_transfer,
            size,
        })
    }

    /// Number of blocks currently held in the overlay
    pub fn allocated_sectors(&self) -> u64 {
        self.overlay.lock().unwrap().allocated.count()
    }

    /// Describe the run of blocks starting at byte offset `off`: whether it is
    /// held in the overlay, and its length in bytes.
    fn run_at(&self, off: ByteOffset, remain: usize) -> (bool, usize) {
        let bs = self.block_size as u64;
        let overlay = self.overlay.lock().unwrap();
        let (cached, run) =
            overlay.allocated.run_at(off / bs, (remain / self.block_size) as u64);
        if cached {
            (true, run as usize * self.block_size)
        } else {
            (false, usize::min(run as usize * self.block_size, self.max_transfer))
        }
    }

    fn read_cached(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult {
        let overlay = self.overlay.lock().unwrap();
        let region = overlay
            .cache
            .as_sub()
            .subregion(off as usize, buf.len())
            .ok_or(BlockError::OutOfRange { off, len: buf.len(), size: self.size })?;
        region.read_bytes(buf)?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl BlockDispatcher for VolatileWriteBlockDispatcher {
    async fn sync(&self) -> BlockResult {
        // Nothing to persist
        Ok(())
    }

    async fn read_at(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult {
        check_request(off, buf.len(), self.block_size, self.size)?;

        let (guard, done) = IoGuard::with_completion();
        let base = &self.base;
        let mut misses = Vec::new();

        let mut pos = off;
        let mut rest: &mut [u8] = buf;
        while !rest.is_empty() {
            let (cached, len) = self.run_at(pos, rest.len());
            let (chunk, tail) = std::mem::take(&mut rest).split_at_mut(len);
            rest = tail;

            if cached {
                probes::block_cache_hit!(|| (pos, len as u64));
                self.read_cached(chunk, pos)?;
            } else {
                probes::block_cache_miss!(|| (pos, len as u64));
                let guard = guard.clone();
                let chunk_off = pos;
                misses.push(async move {
                    guard.record(base.read_at(chunk, chunk_off).await);
                });
            }
            pos += len as u64;
        }
        drop(guard);

        join_all(misses).await;
        done.wait().await
    }

    async fn write_at(&self, buf: &[u8], off: ByteOffset) -> BlockResult {
        check_request(off, buf.len(), self.block_size, self.size)?;
        if buf.is_empty() {
            return Ok(());
        }

        let bs = self.block_size as u64;
        let mut overlay = self.overlay.lock().unwrap();
        let region = overlay
            .cache
            .as_sub()
            .subregion(off as usize, buf.len())
            .ok_or(BlockError::OutOfRange { off, len: buf.len(), size: self.size })?;
        region.write_bytes(buf)?;
        overlay.allocated.set(off / bs, buf.len() as u64 / bs);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn max_transfer(&self) -> usize {
        self.max_transfer
    }
}

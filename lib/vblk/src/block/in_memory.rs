// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::io::{Error, ErrorKind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use super::{check_request, BlockDispatcher, BlockResult, ByteOffset, SECTOR_SIZE};

/// Counts of operations issued to an [InMemoryDispatcher]
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct OpCounts {
    pub reads: u64,
    pub writes: u64,
    pub syncs: u64,
}

/// Dispatcher backed by a byte vector held in host memory.
pub struct InMemoryDispatcher {
    bytes: Mutex<Vec<u8>>,
    size: u64,
    block_size: usize,
    read_only: bool,

    reads: AtomicU64,
    writes: AtomicU64,
    syncs: AtomicU64,
}

impl InMemoryDispatcher {
    pub fn create(
        bytes: Vec<u8>,
        block_size: usize,
        read_only: bool,
    ) -> std::io::Result<Self> {
        let len = bytes.len();
        if len == 0 {
            return Err(Error::new(ErrorKind::Other, "size cannot be 0"));
        } else if block_size == 0 || (len % block_size) != 0 {
            return Err(Error::new(
                ErrorKind::Other,
                format!("size {} not multiple of block size {}!", len, block_size),
            ));
        }

        Ok(Self {
            bytes: Mutex::new(bytes),
            size: len as u64,
            block_size,
            read_only,
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            syncs: AtomicU64::new(0),
        })
    }

    /// A zero-filled, writable device of `size` bytes in 512B blocks
    pub fn zeroed(size: usize) -> std::io::Result<Self> {
        Self::create(vec![0u8; size], SECTOR_SIZE, false)
    }

    pub fn op_counts(&self) -> OpCounts {
        OpCounts {
            reads: self.reads.load(Ordering::Relaxed),
            writes: self.writes.load(Ordering::Relaxed),
            syncs: self.syncs.load(Ordering::Relaxed),
        }
    }
}

#[async_trait::async_trait]
impl BlockDispatcher for InMemoryDispatcher {
    async fn sync(&self) -> BlockResult {
        self.syncs.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn read_at(&self, buf: &mut [u8], off: ByteOffset) -> BlockResult {
        self.reads.fetch_add(1, Ordering::Relaxed);
        check_request(off, buf.len(), self.block_size, self.size())?;

        let bytes = self.bytes.lock().unwrap();
        let start = off as usize;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    async fn write_at(&self, buf: &[u8], off: ByteOffset) -> BlockResult {
        self.writes.fetch_add(1, Ordering::Relaxed);
        if self.read_only {
            return Err(Error::new(
                ErrorKind::PermissionDenied,
                "backend is read-only",
            )
            .into());
        }
        check_request(off, buf.len(), self.block_size, self.size())?;

        let mut bytes = self.bytes.lock().unwrap();
        let start = off as usize;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn block_size(&self) -> usize {
        self.block_size
    }
}

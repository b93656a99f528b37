// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! virtio-blk request framing atop a [VirtQueue].
//!
//! Each request is a descriptor chain holding, in order: a 16-byte header
//! readable by the device, the data buffers (readable for writes, writable
//! for reads), and a single writable status byte.

use std::io;
use std::sync::Arc;
use std::thread::JoinHandle;

use byteorder::{ByteOrder, LittleEndian};
use slog::{o, warn, Logger};
use tokio::runtime::Handle;

use super::probes;
use super::queue::{PollAction, QueueError, Served, VirtQueue};
use crate::block::{self, BlockDispatcher, BlockError, BlockResult, SECTOR_SIZE};
use crate::vmm::SubMapping;
use bits::*;

#[derive(Copy, Clone, Debug, Default)]
struct VbReq {
    rtype: u32,
    sector: u64,
}
impl VbReq {
    const LEN: usize = 16;

    fn parse(buf: &[u8; Self::LEN]) -> Self {
        // bytes 4..8 are reserved
        Self {
            rtype: LittleEndian::read_u32(&buf[0..4]),
            sector: LittleEndian::read_u64(&buf[8..16]),
        }
    }
}

/// Status byte reported to the guest for a completed request
fn status_of(res: &BlockResult) -> u8 {
    match block::Result::from(res) {
        block::Result::Success => VIRTIO_BLK_S_OK,
        block::Result::Failure => VIRTIO_BLK_S_IOERR,
        block::Result::Unsupported => VIRTIO_BLK_S_UNSUPP,
    }
}

impl BlockError {
    /// The virtio-blk status with which this error is reported to the guest
    pub fn status(&self) -> u8 {
        match block::Result::from(self) {
            block::Result::Unsupported => VIRTIO_BLK_S_UNSUPP,
            _ => VIRTIO_BLK_S_IOERR,
        }
    }
}

/// Buffers of a chain which face one direction, treated as one byte stream
#[derive(Default)]
struct Bufs<'a>(Vec<SubMapping<'a>>);
impl Bufs<'_> {
    fn len(&self) -> usize {
        self.0.iter().map(SubMapping::len).fold(0, usize::saturating_add)
    }

    /// Copy out of the stream, starting `off` bytes in.
    fn copy_out(&self, mut off: usize, buf: &mut [u8]) -> bool {
        let mut done = 0;
        for region in self.0.iter() {
            if done == buf.len() {
                break;
            }
            if off >= region.len() {
                off -= region.len();
                continue;
            }
            let n = usize::min(region.len() - off, buf.len() - done);
            match region.subregion(off, n) {
                Some(sub) if sub.read_bytes(&mut buf[done..done + n]).is_ok() => {}
                _ => return false,
            }
            done += n;
            off = 0;
        }
        done == buf.len()
    }

    /// Copy into the stream, starting `off` bytes in.
    fn copy_in(&self, mut off: usize, data: &[u8]) -> bool {
        let mut done = 0;
        for region in self.0.iter() {
            if done == data.len() {
                break;
            }
            if off >= region.len() {
                off -= region.len();
                continue;
            }
            let n = usize::min(region.len() - off, data.len() - done);
            match region.subregion(off, n) {
                Some(sub) if sub.write_bytes(&data[done..done + n]).is_ok() => {}
                _ => return false,
            }
            done += n;
            off = 0;
        }
        done == data.len()
    }
}

/// Services virtio-blk requests from a queue against a [BlockDispatcher].
pub struct BlockQueue {
    disk: Arc<dyn BlockDispatcher>,
    dev_id: [u8; VIRTIO_BLK_ID_BYTES],
    log: Logger,
}

impl BlockQueue {
    /// Create a block queue atop `disk`.  The device identifier reported to
    /// the guest is `serial`, truncated or NUL-padded to 20 bytes.
    pub fn new(
        disk: Arc<dyn BlockDispatcher>,
        serial: &str,
        log: &Logger,
    ) -> Arc<Self> {
        let mut dev_id = [0u8; VIRTIO_BLK_ID_BYTES];
        let len = usize::min(serial.len(), VIRTIO_BLK_ID_BYTES);
        dev_id[..len].copy_from_slice(&serial.as_bytes()[..len]);

        Arc::new(Self { disk, dev_id, log: log.new(o!("dev" => "virtio-block")) })
    }

    pub fn disk(&self) -> &Arc<dyn BlockDispatcher> {
        &self.disk
    }

    /// Capacity of the device, in 512-byte sectors
    pub fn capacity(&self) -> u64 {
        self.disk.size() / SECTOR_SIZE as u64
    }

    /// Process the request chain at `head`, returning the number of bytes
    /// written into its device-writable buffers (status byte included).
    ///
    /// The caller is left to return the chain to the guest.  Errors from the
    /// disk are reported to the guest through the status byte: only a
    /// malformed chain results in an `Err`.
    pub async fn process(
        &self,
        vq: &VirtQueue,
        head: u16,
    ) -> Result<u32, QueueError> {
        let mut readable = Bufs::default();
        let mut writable = Bufs::default();
        for desc in vq.chain(head)? {
            let desc = desc?;
            if desc.writable {
                writable.0.push(desc.buf);
            } else {
                readable.0.push(desc.buf);
            }
        }

        let wlen = writable.len();
        if wlen == 0 {
            warn!(self.log, "request without status byte"; "head" => head);
            return Ok(0);
        }
        let status_off = wlen - 1;

        let mut hdr = [0u8; VbReq::LEN];
        let (mut status, written) = if readable.copy_out(0, &mut hdr) {
            let req = VbReq::parse(&hdr);
            self.dispatch(head, &req, &readable, &writable, status_off).await
        } else {
            warn!(self.log, "request without header"; "head" => head);
            (VIRTIO_BLK_S_UNSUPP, 0)
        };

        let used = match u32::try_from(written + 1) {
            Ok(used) => used,
            Err(_) => {
                status = VIRTIO_BLK_S_IOERR;
                1
            }
        };
        writable.copy_in(status_off, &[status]);
        Ok(used)
    }

    /// Check that a transfer of `sz` bytes at `off` is one we are willing to
    /// buffer: no larger than [VIRTIO_BLK_MAX_REQ] and within the disk.
    ///
    /// Guest descriptors may alias one another, so the length of a chain is
    /// bounded by neither guest memory nor the queue size.
    fn transfer_ok(&self, op: &str, off: u64, sz: usize) -> bool {
        let fits = sz <= VIRTIO_BLK_MAX_REQ
            && off
                .checked_add(sz as u64)
                .is_some_and(|end| end <= self.disk.size());
        if !fits {
            warn!(self.log, "{} request out of bounds", op;
                "off" => off, "len" => sz, "size" => self.disk.size());
        }
        fits
    }

    async fn dispatch(
        &self,
        rid: u16,
        req: &VbReq,
        readable: &Bufs<'_>,
        writable: &Bufs<'_>,
        data_max: usize,
    ) -> (u8, usize) {
        let Some(off) = req.sector.checked_mul(SECTOR_SIZE as u64) else {
            return (VIRTIO_BLK_S_IOERR, 0);
        };

        match req.rtype {
            VIRTIO_BLK_T_IN => {
                // Everything ahead of the status byte, in whole sectors
                let sz = data_max / SECTOR_SIZE * SECTOR_SIZE;
                probes::vioblk_read_enqueue!(|| (rid, off, sz as u64));
                if !self.transfer_ok("read", off, sz) {
                    probes::vioblk_read_complete!(|| (rid, VIRTIO_BLK_S_IOERR));
                    return (VIRTIO_BLK_S_IOERR, 0);
                }

                let mut buf = vec![0u8; sz];
                let res = self.disk.read_at(&mut buf, off).await;
                let status = self.status(&res, "read", off, sz);
                probes::vioblk_read_complete!(|| (rid, status));
                if res.is_ok() && writable.copy_in(0, &buf) {
                    (status, sz)
                } else {
                    (status, 0)
                }
            }
            VIRTIO_BLK_T_OUT => {
                let avail = readable.len() - VbReq::LEN;
                let sz = avail / SECTOR_SIZE * SECTOR_SIZE;
                probes::vioblk_write_enqueue!(|| (rid, off, sz as u64));
                if !self.transfer_ok("write", off, sz) {
                    probes::vioblk_write_complete!(|| (rid, VIRTIO_BLK_S_IOERR));
                    return (VIRTIO_BLK_S_IOERR, 0);
                }

                let mut buf = vec![0u8; sz];
                readable.copy_out(VbReq::LEN, &mut buf);
                let res = self.disk.write_at(&buf, off).await;
                let status = self.status(&res, "write", off, sz);
                probes::vioblk_write_complete!(|| (rid, status));
                (status, 0)
            }
            VIRTIO_BLK_T_FLUSH => {
                probes::vioblk_flush_enqueue!(|| rid);
                let res = self.disk.sync().await;
                let status = self.status(&res, "flush", 0, 0);
                probes::vioblk_flush_complete!(|| (rid, status));
                (status, 0)
            }
            VIRTIO_BLK_T_GET_ID => {
                let n = usize::min(VIRTIO_BLK_ID_BYTES, data_max);
                writable.copy_in(0, &self.dev_id[..n]);
                (VIRTIO_BLK_S_OK, n)
            }
            _ => (VIRTIO_BLK_S_UNSUPP, 0),
        }
    }

    fn status(&self, res: &BlockResult, op: &str, off: u64, sz: usize) -> u8 {
        if let Err(e) = res {
            warn!(self.log, "{} failed", op;
                "off" => off, "len" => sz, "error" => %e);
        }
        status_of(res)
    }

    /// Service `vq` from a dedicated thread, driving disk I/O to completion
    /// on the runtime behind `rt`.
    pub fn poll(
        self: &Arc<Self>,
        vq: &Arc<VirtQueue>,
        rt: Handle,
    ) -> io::Result<JoinHandle<Result<(), QueueError>>> {
        let bq = Arc::clone(self);
        vq.poll("block", &self.log, move |vq, head, used| {
            *used = rt.block_on(bq.process(vq, head))?;
            Ok(PollAction::Continue)
        })
    }

    /// Service `vq` cooperatively, from the calling task.
    pub async fn poll_async(
        self: &Arc<Self>,
        vq: Arc<VirtQueue>,
    ) -> Result<(), QueueError> {
        let bq = Arc::clone(self);
        vq.poll_async("block", &self.log, move |vq, head| {
            let bq = Arc::clone(&bq);
            async move {
                Ok::<_, QueueError>(Served::with_len(bq.process(&vq, head).await?))
            }
        })
        .await
    }
}

mod bits {
    #![allow(unused)]

    pub const VIRTIO_BLK_T_IN: u32 = 0;
    pub const VIRTIO_BLK_T_OUT: u32 = 1;
    pub const VIRTIO_BLK_T_FLUSH: u32 = 4;
    pub const VIRTIO_BLK_T_GET_ID: u32 = 8;

    pub const VIRTIO_BLK_S_OK: u8 = 0;
    pub const VIRTIO_BLK_S_IOERR: u8 = 1;
    pub const VIRTIO_BLK_S_UNSUPP: u8 = 2;

    pub const VIRTIO_BLK_ID_BYTES: usize = 20;

    /// Largest data transfer accepted in a single request
    pub const VIRTIO_BLK_MAX_REQ: usize = 4 * 1024 * 1024;
}
pub use bits::VIRTIO_BLK_MAX_REQ;
pub use bits::{VIRTIO_BLK_S_IOERR, VIRTIO_BLK_S_OK, VIRTIO_BLK_S_UNSUPP};
pub use bits::{
    VIRTIO_BLK_T_FLUSH, VIRTIO_BLK_T_GET_ID, VIRTIO_BLK_T_IN, VIRTIO_BLK_T_OUT,
};

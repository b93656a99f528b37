// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Utilities for constructing virtqueues backed by real guest memory.
//!
//! This module provides [`TestVirtQueue`], a harness that allocates guest
//! memory, lays out virtio ring structures, and provides helpers to enqueue
//! descriptor chains, simulating a guest driver writing to the available ring.

use std::num::Wrapping;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::queue::{
    AvailFlags, DescFlag, QueueOpts, RingLayout, VirtQueue, VqSize, VqdDesc,
    VqdUsed,
};
use super::IntrAction;
use crate::common::{GuestAddr, PAGE_SIZE};
use crate::vmm::MemCtx;

/// Align `val` up to the next multiple of `align` (must be power of 2).
const fn align_up(val: u64, align: u64) -> u64 {
    (val + align - 1) & !(align - 1)
}

/// Interrupt resource which merely counts notifications
#[derive(Default)]
pub struct CountingIntr(AtomicUsize);
impl CountingIntr {
    /// Create a counter and install it as the interrupt for `vq`.
    pub fn attach(vq: &VirtQueue) -> Arc<Self> {
        let intr = Arc::new(Self::default());
        vq.set_intr(intr.clone());
        intr
    }

    pub fn count(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }
}
impl super::VirtioIntr for CountingIntr {
    fn notify(&self, _actions: IntrAction) -> std::io::Result<()> {
        self.0.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

/// A harness wrapping guest memory and virtqueue ring structures.
///
/// Provides methods to build descriptor chains in guest memory and publish
/// them on the available ring, simulating a guest driver. After the device
/// under test processes the chain, [`TestVirtQueue::drain_used`] can inspect
/// the used ring.
pub struct TestVirtQueue {
    mem: Arc<MemCtx>,
    vq: Arc<VirtQueue>,
    layout: RingLayout,
    size: u16,
    /// Next descriptor slot to allocate.
    next_desc: u16,
    /// Start of the data area used for payload buffers.
    data_base: u64,
    /// Next region of the data area to use for payload buffers.
    data_cursor: u64,
    /// End of the data area.
    data_end: u64,
    /// Current avail index we've published.
    avail_idx: Wrapping<u16>,
    /// Used index up to which entries have been consumed.
    used_seen: Wrapping<u16>,
}

impl TestVirtQueue {
    /// Create a new test virtqueue.
    ///
    /// `queue_size` must be a power of 2.
    pub fn new(queue_size: u16) -> Self {
        Self::build(queue_size, PAGE_SIZE as u64 * 4, QueueOpts::default())
    }

    pub fn with_opts(queue_size: u16, opts: QueueOpts) -> Self {
        Self::build(queue_size, PAGE_SIZE as u64 * 4, opts)
    }

    /// Create a test virtqueue with a data area of at least `data_len` bytes.
    pub fn with_data_area(
        queue_size: u16,
        data_len: u64,
        opts: QueueOpts,
    ) -> Self {
        Self::build(queue_size, data_len, opts)
    }

    fn build(queue_size: u16, data_len: u64, opts: QueueOpts) -> Self {
        let size = VqSize::new(queue_size);
        let layout = RingLayout::split(GuestAddr(0), size);

        let data_offset =
            align_up(RingLayout::split_len(size) as u64, PAGE_SIZE as u64);
        let data_len = align_up(data_len.max(1), PAGE_SIZE as u64);
        let total_size = (data_offset + data_len) as usize;

        let mem = MemCtx::new(total_size).expect("allocate guest memory");
        let vq = Arc::new(VirtQueue::with_opts(mem.clone(), opts));
        vq.configure_layout(size, &layout).expect("rings fit in guest memory");

        Self {
            mem,
            vq,
            layout,
            size: queue_size,
            next_desc: 0,
            data_base: data_offset,
            data_cursor: data_offset,
            data_end: data_offset + data_len,
            avail_idx: Wrapping(0),
            used_seen: Wrapping(0),
        }
    }

    /// Get the underlying `VirtQueue`.
    pub fn vq(&self) -> &Arc<VirtQueue> {
        &self.vq
    }

    /// Get guest memory, for directly reading/writing its contents.
    pub fn mem(&self) -> &Arc<MemCtx> {
        &self.mem
    }

    /// Start the guest and device ring indices at `idx` rather than 0.
    #[cfg(test)]
    pub fn start_at(&mut self, idx: u16) {
        self.avail_idx = Wrapping(idx);
        self.used_seen = Wrapping(idx);
        self.mem.write(self.layout.avail + 2, &idx);
        self.mem.write(self.layout.used + 2, &idx);
        self.vq.set_cursors(idx, idx);
    }

    /// Release all descriptors and data buffers for reuse.
    ///
    /// Only sensible once the device has returned every published chain.
    pub fn recycle(&mut self) {
        self.next_desc = 0;
        self.data_cursor = self.data_base;
    }

    /// Allocate a region from the data area and return its GPA.
    fn alloc_data(&mut self, len: u32) -> u64 {
        let addr = self.data_cursor;
        self.data_cursor += u64::from(len);
        assert!(self.data_cursor <= self.data_end, "test data area exhausted");
        addr
    }

    /// Write a raw descriptor into the next free descriptor-table slot.
    ///
    /// Nothing about `addr` or `len` is validated, allowing malformed
    /// descriptors to be constructed.
    pub fn add_desc_raw(
        &mut self,
        addr: u64,
        len: u32,
        flags: u16,
        next: u16,
    ) -> u16 {
        let idx = self.next_desc;
        assert!(idx < self.size, "descriptor table exhausted");
        self.next_desc += 1;

        let desc = VqdDesc { addr, len, flags, next };
        self.mem.write(self.layout.desc.offset::<VqdDesc>(idx as usize), &desc);
        idx
    }

    /// Add a readable descriptor containing `data`.
    ///
    /// Returns the descriptor index.
    pub fn add_readable(&mut self, data: &[u8]) -> u16 {
        let len = data.len() as u32;
        let gpa = self.alloc_data(len);
        self.mem.write_from(GuestAddr(gpa), data, data.len());
        self.add_desc_raw(gpa, len, 0, 0)
    }

    /// Add a writable descriptor of `len` bytes.
    ///
    /// Returns the descriptor index.
    pub fn add_writable(&mut self, len: u32) -> u16 {
        let gpa = self.alloc_data(len);
        self.add_desc_raw(gpa, len, DescFlag::WRITE.bits(), 0)
    }

    /// Link descriptors into a chain by setting NEXT flags.
    ///
    /// `descs` should be in order: `[head, ..., tail]`.
    pub fn chain_descriptors(&self, descs: &[u16]) {
        for pair in descs.windows(2) {
            let addr = self.layout.desc.offset::<VqdDesc>(pair[0] as usize);
            let mut raw: VqdDesc = self.mem.read(addr).unwrap();
            raw.flags |= DescFlag::NEXT.bits();
            raw.next = pair[1];
            self.mem.write(addr, &raw);
        }
    }

    /// Publish a descriptor chain head on the available ring.
    pub fn publish_avail(&mut self, head: u16) {
        let slot = self.avail_idx.0 % self.size;
        let entry = (self.layout.avail + 4).offset::<u16>(slot as usize);
        self.avail_idx += Wrapping(1);

        self.mem.write(entry, &head);
        self.mem.write(self.layout.avail + 2, &self.avail_idx.0);
    }

    /// Overwrite the published avail index, without filling ring entries.
    pub fn set_avail_idx(&mut self, idx: u16) {
        self.avail_idx = Wrapping(idx);
        self.mem.write(self.layout.avail + 2, &idx);
    }

    /// Ring the device doorbell.
    pub fn kick(&self) {
        self.vq.notify().expect("queue is configured");
    }

    pub fn set_avail_flags(&self, flags: AvailFlags) {
        self.mem.write(self.layout.avail, &flags.bits());
    }

    pub fn set_used_event(&self, val: u16) {
        let addr = (self.layout.avail + 4).offset::<u16>(self.size as usize);
        self.mem.write(addr, &val);
    }

    /// The device's requested notification point, under event-index mode.
    pub fn avail_event(&self) -> u16 {
        let addr = (self.layout.used + 4).offset::<VqdUsed>(self.size as usize);
        self.mem.read(addr).unwrap()
    }

    /// Used index as published by the device.
    pub fn used_idx(&self) -> u16 {
        self.mem.read(self.layout.used + 2).unwrap()
    }

    /// Read entries added to the used ring since the last call.
    ///
    /// Returns `(descriptor_id, bytes_written)` pairs.
    pub fn drain_used(&mut self) -> Vec<(u32, u32)> {
        let used_idx = Wrapping(self.used_idx());

        let mut entries = Vec::new();
        while self.used_seen != used_idx {
            let slot = self.used_seen.0 % self.size;
            let addr = (self.layout.used + 4).offset::<VqdUsed>(slot as usize);
            let elem: VqdUsed = self.mem.read(addr).unwrap();
            entries.push((elem.id, elem.len));
            self.used_seen += Wrapping(1);
        }
        entries
    }

    /// Read raw bytes from guest memory at a given GPA.
    pub fn read_guest_mem(&self, addr: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.mem.read_into(GuestAddr(addr), &mut buf, len);
        buf
    }

    /// Get the GPA of a descriptor's buffer.
    pub fn desc_addr(&self, idx: u16) -> u64 {
        let addr = self.layout.desc.offset::<VqdDesc>(idx as usize);
        let raw: VqdDesc = self.mem.read(addr).unwrap();
        raw.addr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smoke_readable() {
        let mut tvq = TestVirtQueue::new(16);

        let data = b"hello virtqueue";
        let d0 = tvq.add_readable(data);
        tvq.publish_avail(d0);

        let head = tvq.vq().next_avail().unwrap().unwrap();
        assert_eq!(head, d0);
        let desc = tvq.vq().read_desc(head).unwrap();
        assert_eq!(desc.len, data.len() as u32);

        let mut buf = [0u8; 15];
        desc.buf.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, data);
    }

    #[test]
    fn smoke_writable() {
        let mut tvq = TestVirtQueue::new(16);

        let d0 = tvq.add_writable(64);
        tvq.publish_avail(d0);

        let head = tvq.vq().next_avail().unwrap().unwrap();
        let desc = tvq.vq().read_desc(head).unwrap();
        assert!(desc.writable);

        let payload = b"written by device";
        desc.buf.write_bytes(payload).unwrap();
        tvq.vq().push_used(head, payload.len() as u32).unwrap();

        let used = tvq.drain_used();
        assert_eq!(used, vec![(d0 as u32, payload.len() as u32)]);

        let addr = tvq.desc_addr(d0);
        assert_eq!(tvq.read_guest_mem(addr, payload.len()), payload);
    }

    #[test]
    fn recycle_reuses_slots() {
        let mut tvq = TestVirtQueue::new(2);
        let d0 = tvq.add_writable(8);
        let _ = tvq.add_writable(8);
        tvq.recycle();
        assert_eq!(tvq.add_writable(8), d0);
    }
}

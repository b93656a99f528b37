// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Split virtqueues, and the virtio-blk request framing built atop them.
//!
//! The guest-trap front end which decodes register writes is not part of this
//! crate: it is expected to call [`VirtQueue::configure`],
//! [`VirtQueue::set_features`] and [`VirtQueue::notify`] on behalf of the
//! guest, and to supply a [`VirtioIntr`] through which the queue signals the
//! guest upon completions.

pub mod block;
pub mod queue;
pub mod testutil;

pub use block::BlockQueue;
pub use queue::{
    Features, HandleStatus, PollAction, QueueError, QueueOpts, RingLayout,
    Served, VirtQueue, VirtioDescriptor, VqSize, VqSizeError,
};

bitflags! {
    /// Reasons reported to the guest when it is signaled.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct IntrAction: u32 {
        /// The used ring has new entries.
        const QUEUE = 1 << 0;
        /// Device configuration has changed.
        const CONFIG = 1 << 1;
    }
}

/// Means by which a virtqueue signals its guest.
pub trait VirtioIntr: Send + Sync + 'static {
    fn notify(&self, actions: IntrAction) -> std::io::Result<()>;
}

impl<F> VirtioIntr for F
where
    F: Fn(IntrAction) -> std::io::Result<()> + Send + Sync + 'static,
{
    fn notify(&self, actions: IntrAction) -> std::io::Result<()> {
        self(actions)
    }
}

#[usdt::provider(provider = "vblk")]
mod probes {
    fn virtio_vq_notify(vq_addr: u64) {}
    fn virtio_vq_pop(vq_addr: u64, desc_idx: u16, avail_idx: u16) {}
    fn virtio_vq_push(vq_addr: u64, used_idx: u16, used_len: u32) {}
    fn virtio_vq_intr(vq_addr: u64, used_idx: u16) {}

    fn vioblk_read_enqueue(id: u16, off: u64, sz: u64) {}
    fn vioblk_read_complete(id: u16, res: u8) {}

    fn vioblk_write_enqueue(id: u16, off: u64, sz: u64) {}
    fn vioblk_write_complete(id: u16, res: u8) {}

    fn vioblk_flush_enqueue(id: u16) {}
    fn vioblk_flush_complete(id: u16, res: u8) {}
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::mem;
use std::num::{NonZeroU16, Wrapping};
use std::sync::atomic::{fence, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;

use slog::{error, info, o, Logger};
use tokio::sync::Notify;
use zerocopy::FromBytes;

use super::probes;
use super::{IntrAction, VirtioIntr};
use crate::common::*;
use crate::vmm::{MemCtx, MemError, SubMapping};

bitflags! {
    /// Features supported by our implementation of virtqueues.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct Features: u64 {
        const RING_EVENT_IDX = 1 << 29;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct DescFlag: u16 {
        const NEXT = 1 << 0;
        const WRITE = 1 << 1;
    }

    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct AvailFlags: u16 {
        const NO_INTERRUPT = 1 << 0;
    }
}

/// Largest queue size permitted by the virtio specification
pub const MAX_QUEUE_SIZE: u16 = 32768;

#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes)]
pub(crate) struct VqdDesc {
    pub(crate) addr: u64,
    pub(crate) len: u32,
    pub(crate) flags: u16,
    pub(crate) next: u16,
}
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, FromBytes)]
pub(crate) struct VqdUsed {
    pub(crate) id: u32,
    pub(crate) len: u32,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct VqSize(NonZeroU16);
impl VqSize {
    pub const fn new(size: u16) -> VqSize {
        let size = match NonZeroU16::new(size) {
            Some(size) => size,
            None => panic!("nonzero queue size"),
        };
        assert!(size.is_power_of_two());
        assert!(size.get() <= MAX_QUEUE_SIZE);
        Self(size)
    }

    pub const fn get(self) -> u16 {
        self.0.get()
    }
}

impl TryFrom<NonZeroU16> for VqSize {
    type Error = VqSizeError;

    fn try_from(value: NonZeroU16) -> Result<Self, Self::Error> {
        if !value.is_power_of_two() {
            Err(VqSizeError::NotPow2)
        } else if value.get() > MAX_QUEUE_SIZE {
            Err(VqSizeError::TooLarge)
        } else {
            Ok(Self(value))
        }
    }
}
impl TryFrom<u16> for VqSize {
    type Error = VqSizeError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        NonZeroU16::try_from(value).or(Err(VqSizeError::IsZero))?.try_into()
    }
}

impl From<VqSize> for u16 {
    fn from(value: VqSize) -> Self {
        value.get()
    }
}

#[derive(Copy, Clone, Debug, thiserror::Error)]
pub enum VqSizeError {
    #[error("virtqueue size must be power of 2")]
    NotPow2,
    #[error("virtqueue size must not be 0")]
    IsZero,
    #[error("virtqueue size must not exceed {MAX_QUEUE_SIZE}")]
    TooLarge,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("virtqueue has not been configured")]
    NotConfigured,

    #[error("invalid virtqueue size")]
    InvalidSize(#[from] VqSizeError),

    #[error("{ring} ring lies outside guest memory")]
    RingOutOfRange {
        ring: &'static str,
        #[source]
        source: MemError,
    },

    #[error("descriptor {index} buffer lies outside guest memory")]
    DescOutOfRange {
        index: u16,
        #[source]
        source: MemError,
    },

    #[error("descriptor index {index} exceeds queue size {size}")]
    DescIndexOutOfRange { index: u16, size: u16 },

    #[error("descriptor chain at {head} exceeds {size} links")]
    ChainTooLong { head: u16, size: u16 },

    #[error("guest published {pending} entries into a queue of size {size}")]
    AvailOverrun { pending: u16, size: u16 },

    #[error("failed to signal guest")]
    Interrupt(#[source] std::io::Error),
}
impl QueueError {
    /// Does this error stem from malformed data published by the guest?
    ///
    /// Such errors are not recoverable for the queue in question.  The VMM is
    /// expected to tear down the offending device (or guest).
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            QueueError::DescOutOfRange { .. }
                | QueueError::DescIndexOutOfRange { .. }
                | QueueError::ChainTooLong { .. }
                | QueueError::AvailOverrun { .. }
        )
    }
}

/// Tunables for a [VirtQueue]
#[derive(Copy, Clone, Debug, serde::Deserialize)]
#[serde(default)]
pub struct QueueOpts {
    /// With event-index notification negotiated, the number of further
    /// available entries the guest may publish before it must notify the
    /// device again.
    pub notify_threshold: u16,
}
impl Default for QueueOpts {
    fn default() -> Self {
        Self { notify_threshold: 1 }
    }
}

/// Guest-physical placement of the three parts of a split virtqueue.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct RingLayout {
    pub desc: GuestAddr,
    pub avail: GuestAddr,
    pub used: GuestAddr,
}
impl RingLayout {
    const LEGACY_QALIGN: usize = PAGE_SIZE;

    /// Size of the descriptor table for a queue of `size` entries
    pub const fn desc_len(size: VqSize) -> usize {
        mem::size_of::<VqdDesc>() * size.get() as usize
    }

    /// Size of the available ring, including the trailing `used_event`
    pub const fn avail_len(size: VqSize) -> usize {
        // flags, idx, ring, used_event
        2 * (3 + size.get() as usize)
    }

    /// Size of the used ring, including the trailing `avail_event`
    pub const fn used_len(size: VqSize) -> usize {
        // flags, idx, ring, avail_event
        2 * 3 + mem::size_of::<VqdUsed>() * size.get() as usize
    }

    /// Lay out a queue in contiguous memory at `base`, in the legacy style: the
    /// used ring begins on the first page boundary following the descriptor
    /// table and available ring.
    pub fn split(base: GuestAddr, size: VqSize) -> Self {
        let desc = base;
        let avail = desc + Self::desc_len(size);
        let used_off = round_up_p2(
            Self::desc_len(size) + Self::avail_len(size),
            Self::LEGACY_QALIGN,
        );
        Self { desc, avail, used: base + used_off }
    }

    /// Total bytes spanned by a queue laid out via [RingLayout::split]
    pub fn split_len(size: VqSize) -> usize {
        let used_off = round_up_p2(
            Self::desc_len(size) + Self::avail_len(size),
            Self::LEGACY_QALIGN,
        );
        used_off + Self::used_len(size)
    }
}

/// Guest addresses of every ring field, as validated by `configure`
#[derive(Copy, Clone, Debug)]
struct Rings {
    size: u16,
    desc: GuestAddr,

    avail_flags: GuestAddr,
    avail_idx: GuestAddr,
    avail_ring: GuestAddr,
    used_event: GuestAddr,

    used_idx: GuestAddr,
    used_ring: GuestAddr,
    avail_event: GuestAddr,
}
impl Rings {
    fn new(size: VqSize, layout: &RingLayout) -> Self {
        let avail = layout.avail;
        let used = layout.used;
        let count = size.get() as usize;
        Self {
            size: size.get(),
            desc: layout.desc,
            // 16-bit flags, followed by 16-bit idx, followed by avail desc
            // ring, followed by the 16-bit used_event
            avail_flags: avail,
            avail_idx: avail + 2,
            avail_ring: avail + 4,
            used_event: (avail + 4).offset::<u16>(count),
            // 16-bit flags, followed by 16-bit idx, followed by used desc
            // ring, followed by the 16-bit avail_event
            used_idx: used + 2,
            used_ring: used + 4,
            avail_event: (used + 4).offset::<VqdUsed>(count),
        }
    }

    fn slot(&self, idx: Wrapping<u16>) -> u16 {
        idx.0 & (self.size - 1)
    }
}

struct Inner {
    rings: Option<Rings>,
    features: Features,
    next_avail: Wrapping<u16>,
    used_idx: Wrapping<u16>,
    interrupt: Option<Arc<dyn VirtioIntr>>,
}

#[derive(Default)]
struct SignalState {
    raised: bool,
    halted: bool,
}

/// Signal indicating that the available ring (may) hold unconsumed entries.
///
/// Offers both a blocking wait, for the thread-per-queue model, and an async
/// wait, for cooperative polling.
#[derive(Default)]
struct AvailSignal {
    state: Mutex<SignalState>,
    cv: Condvar,
    notifier: Notify,
}
impl AvailSignal {
    fn raise(&self) {
        let mut state = self.state.lock().unwrap();
        state.raised = true;
        self.cv.notify_all();
        self.notifier.notify_waiters();
    }

    fn clear(&self) {
        self.state.lock().unwrap().raised = false;
    }

    fn halt(&self) {
        let mut state = self.state.lock().unwrap();
        state.halted = true;
        self.cv.notify_all();
        self.notifier.notify_waiters();
    }

    fn is_halted(&self) -> bool {
        self.state.lock().unwrap().halted
    }

    /// Block until the signal is raised.  Returns `false` if halted.
    fn wait(&self) -> bool {
        let guard = self.state.lock().unwrap();
        let guard = self
            .cv
            .wait_while(guard, |state| !state.raised && !state.halted)
            .unwrap();
        !guard.halted
    }

    /// Wait until the signal is raised.  Returns `false` if halted.
    async fn wait_async(&self) -> bool {
        loop {
            // Register interest before checking state, so a raise which
            // lands in between is not lost.
            let notified = self.notifier.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let state = self.state.lock().unwrap();
                if state.halted {
                    return false;
                }
                if state.raised {
                    return true;
                }
            }
            notified.await;
        }
    }
}

/// Outcome of [VirtQueue::handle_descriptor]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HandleStatus {
    /// The available ring was empty
    NoWork,
    /// One chain was handled and the available ring is now empty
    Done,
    /// One chain was handled and more remain available
    MoreAvailable,
}

/// Returned by polling handlers to indicate whether polling should proceed
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PollAction {
    Continue,
    Stop,
}

/// Result of serving one chain in [VirtQueue::poll_async]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Served {
    pub used_len: u32,
    pub action: PollAction,
}
impl Served {
    pub fn with_len(used_len: u32) -> Self {
        Self { used_len, action: PollAction::Continue }
    }
}

/// Snapshot of queue state, for inspection
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Info {
    pub configured: bool,
    pub size: u16,
    pub features: Features,
    pub next_avail: u16,
    pub used_idx: u16,
}

/// One descriptor-table entry, with its buffer translated into host memory
#[derive(Debug)]
pub struct VirtioDescriptor<'a> {
    pub index: u16,
    pub addr: GuestAddr,
    pub len: u32,
    pub has_next: bool,
    /// Buffer is writable by the device
    pub writable: bool,
    pub next: u16,
    pub buf: SubMapping<'a>,
}

/// Iterator over the descriptors of a chain
pub struct DescChain<'a> {
    vq: &'a VirtQueue,
    head: u16,
    size: u16,
    count: u16,
    next: Option<u16>,
}
impl<'a> Iterator for DescChain<'a> {
    type Item = Result<VirtioDescriptor<'a>, QueueError>;

    fn next(&mut self) -> Option<Self::Item> {
        let idx = self.next.take()?;
        if self.count == self.size {
            return Some(Err(QueueError::ChainTooLong {
                head: self.head,
                size: self.size,
            }));
        }
        self.count += 1;
        let res = self.vq.read_desc(idx);
        if let Ok(desc) = res.as_ref() {
            if desc.has_next {
                self.next = Some(desc.next);
            }
        }
        Some(res)
    }
}

/// A split virtqueue, residing in guest memory
pub struct VirtQueue {
    inner: Mutex<Inner>,
    signal: AvailSignal,
    opts: QueueOpts,
    mem: Arc<MemCtx>,
}

impl VirtQueue {
    pub fn new(mem: Arc<MemCtx>) -> Self {
        Self::with_opts(mem, QueueOpts::default())
    }

    pub fn with_opts(mem: Arc<MemCtx>, opts: QueueOpts) -> Self {
        Self {
            inner: Mutex::new(Inner {
                rings: None,
                features: Features::empty(),
                next_avail: Wrapping(0),
                used_idx: Wrapping(0),
                interrupt: None,
            }),
            signal: AvailSignal::default(),
            opts,
            mem,
        }
    }

    /// Guest memory in which this queue resides
    pub fn mem(&self) -> &MemCtx {
        &self.mem
    }

    /// Establish ring mappings at the specified guest-physical addresses.
    ///
    /// Using the terminology of VirtIO 1.2, these are the "Descriptor Area",
    /// "Driver Area", and "Device Area".  Every ring, including the trailing
    /// event-index fields, must lie within guest memory.  A successful
    /// (re)configuration replaces any prior mapping and resets the ring
    /// cursors.
    pub fn configure(
        &self,
        size: u16,
        desc_addr: u64,
        avail_addr: u64,
        used_addr: u64,
    ) -> Result<(), QueueError> {
        let size = VqSize::try_from(size)?;
        let layout = RingLayout {
            desc: GuestAddr(desc_addr),
            avail: GuestAddr(avail_addr),
            used: GuestAddr(used_addr),
        };
        self.configure_layout(size, &layout)
    }

    pub fn configure_layout(
        &self,
        size: VqSize,
        layout: &RingLayout,
    ) -> Result<(), QueueError> {
        for (ring, addr, len) in [
            ("descriptor", layout.desc, RingLayout::desc_len(size)),
            ("available", layout.avail, RingLayout::avail_len(size)),
            ("used", layout.used, RingLayout::used_len(size)),
        ] {
            self.mem
                .translate(addr, len as u64)
                .map_err(|source| QueueError::RingOutOfRange { ring, source })?;
        }

        let mut inner = self.inner.lock().unwrap();
        inner.rings = Some(Rings::new(size, layout));
        inner.next_avail = Wrapping(0);
        inner.used_idx = Wrapping(0);
        self.signal.clear();
        Ok(())
    }

    /// Record the features negotiated with the guest driver.
    pub fn set_features(&self, features: Features) {
        self.inner.lock().unwrap().features = features;
    }

    /// Set the resource used to signal the guest upon completions
    pub fn set_intr(&self, intr: Arc<dyn VirtioIntr>) {
        self.inner.lock().unwrap().interrupt = Some(intr);
    }

    pub fn state(&self) -> Info {
        let inner = self.inner.lock().unwrap();
        Info {
            configured: inner.rings.is_some(),
            size: inner.rings.map(|r| r.size).unwrap_or(0),
            features: inner.features,
            next_avail: inner.next_avail.0,
            used_idx: inner.used_idx.0,
        }
    }

    fn ring_read<T: Copy + FromBytes>(
        &self,
        ring: &'static str,
        addr: GuestAddr,
    ) -> Result<T, QueueError> {
        let map = self
            .mem
            .translate(addr, mem::size_of::<T>() as u64)
            .map_err(|source| QueueError::RingOutOfRange { ring, source })?;
        // The translated region is exactly the size of T
        Ok(map.read::<T>().expect("region sized for T"))
    }

    fn ring_write<T: Copy>(
        &self,
        ring: &'static str,
        addr: GuestAddr,
        val: &T,
    ) -> Result<(), QueueError> {
        let map = self
            .mem
            .translate(addr, mem::size_of::<T>() as u64)
            .map_err(|source| QueueError::RingOutOfRange { ring, source })?;
        map.write(val).expect("region sized for T");
        Ok(())
    }

    fn pending(&self, inner: &Inner) -> Result<u16, QueueError> {
        let rings = inner.rings.ok_or(QueueError::NotConfigured)?;
        let avail_idx = Wrapping(self.ring_read::<u16>("available", rings.avail_idx)?);
        let pending = (avail_idx - inner.next_avail).0;
        if pending > rings.size {
            return Err(QueueError::AvailOverrun { pending, size: rings.size });
        }
        Ok(pending)
    }

    /// Does the available ring hold unconsumed entries?
    pub fn has_avail(&self) -> Result<bool, QueueError> {
        let inner = self.inner.lock().unwrap();
        Ok(self.pending(&inner)? != 0)
    }

    /// Fetch the head index of the next available descriptor chain, if any.
    ///
    /// `Ok(None)` indicates that the guest has published nothing new.
    pub fn next_avail(&self) -> Result<Option<u16>, QueueError> {
        let mut inner = self.inner.lock().unwrap();
        let rings = inner.rings.ok_or(QueueError::NotConfigured)?;

        let pending = self.pending(&inner)?;
        if pending == 0 {
            self.signal.clear();
            return Ok(None);
        }

        // Ring contents are only valid once the index has been observed
        fence(Ordering::Acquire);
        let slot = rings.slot(inner.next_avail);
        let head = self.ring_read::<u16>(
            "available",
            rings.avail_ring.offset::<u16>(slot as usize),
        )?;
        inner.next_avail += Wrapping(1);

        if inner.features.contains(Features::RING_EVENT_IDX) {
            let threshold = self.opts.notify_threshold.max(1);
            let event = inner.next_avail + Wrapping(threshold - 1);
            self.ring_write("used", rings.avail_event, &event.0)?;
        }
        if pending == 1 {
            self.signal.clear();
        }

        probes::virtio_vq_pop!(|| (self as *const VirtQueue as u64, head, slot));
        Ok(Some(head))
    }

    /// Block the calling thread until a descriptor chain is available.
    ///
    /// Returns `Ok(None)` once the queue has been [halted](Self::halt).
    pub fn wait(&self) -> Result<Option<u16>, QueueError> {
        loop {
            if self.signal.is_halted() {
                return Ok(None);
            }
            if let Some(head) = self.next_avail()? {
                return Ok(Some(head));
            }
            if !self.signal.wait() {
                return Ok(None);
            }
        }
    }

    /// Await the availability of a descriptor chain.
    ///
    /// Resolves to `Ok(None)` once the queue has been [halted](Self::halt).
    pub async fn wait_async(&self) -> Result<Option<u16>, QueueError> {
        loop {
            if self.signal.is_halted() {
                return Ok(None);
            }
            if let Some(head) = self.next_avail()? {
                return Ok(Some(head));
            }
            if !self.signal.wait_async().await {
                return Ok(None);
            }
        }
    }

    /// Doorbell: the guest has (possibly) published new available entries.
    pub fn notify(&self) -> Result<(), QueueError> {
        probes::virtio_vq_notify!(|| self as *const VirtQueue as u64);
        // Raise while holding the queue lock, so a concurrent `next_avail`
        // draining the ring cannot clear the signal out from under us.
        let inner = self.inner.lock().unwrap();
        if self.pending(&inner)? != 0 {
            self.signal.raise();
        }
        Ok(())
    }

    /// Start the ring cursors at arbitrary positions.
    #[cfg(test)]
    pub(crate) fn set_cursors(&self, next_avail: u16, used_idx: u16) {
        let mut inner = self.inner.lock().unwrap();
        inner.next_avail = Wrapping(next_avail);
        inner.used_idx = Wrapping(used_idx);
    }

    /// Cause any blocked or pending waiters on this queue to bail out.
    pub fn halt(&self) {
        self.signal.halt();
    }

    /// Read one descriptor-table entry, translating its buffer into host
    /// memory.
    ///
    /// Fails if the index lies beyond the table, or if the described buffer
    /// overflows or exceeds guest memory.
    pub fn read_desc(&self, index: u16) -> Result<VirtioDescriptor<'_>, QueueError> {
        let rings = self.inner.lock().unwrap().rings.ok_or(QueueError::NotConfigured)?;
        if index >= rings.size {
            return Err(QueueError::DescIndexOutOfRange { index, size: rings.size });
        }
        let raw: VqdDesc = self
            .ring_read("descriptor", rings.desc.offset::<VqdDesc>(index as usize))?;

        let addr = GuestAddr(raw.addr);
        let buf = self
            .mem
            .translate(addr, u64::from(raw.len))
            .map_err(|source| QueueError::DescOutOfRange { index, source })?;
        let flags = DescFlag::from_bits_truncate(raw.flags);
        Ok(VirtioDescriptor {
            index,
            addr,
            len: raw.len,
            has_next: flags.contains(DescFlag::NEXT),
            writable: flags.contains(DescFlag::WRITE),
            next: raw.next,
            buf,
        })
    }

    /// Walk the descriptor chain starting at `head`.
    ///
    /// A chain which does not terminate within `size` links yields
    /// [QueueError::ChainTooLong].
    pub fn chain(&self, head: u16) -> Result<DescChain<'_>, QueueError> {
        let rings = self.inner.lock().unwrap().rings.ok_or(QueueError::NotConfigured)?;
        Ok(DescChain { vq: self, head, size: rings.size, count: 0, next: Some(head) })
    }

    /// Return a chain to the guest through the used ring.
    pub fn push_used(&self, id: u16, len: u32) -> Result<(), QueueError> {
        self.push_used_with(id, len, IntrAction::empty())
    }

    /// Return a chain to the guest, signaling it with `actions` (in addition
    /// to [IntrAction::QUEUE]) if the guest has not suppressed interrupts.
    pub fn push_used_with(
        &self,
        id: u16,
        len: u32,
        actions: IntrAction,
    ) -> Result<(), QueueError> {
        let intr = {
            let mut inner = self.inner.lock().unwrap();
            let rings = inner.rings.ok_or(QueueError::NotConfigured)?;
            if id >= rings.size {
                return Err(QueueError::DescIndexOutOfRange { index: id, size: rings.size });
            }

            let slot = rings.slot(inner.used_idx);
            let used = VqdUsed { id: u32::from(id), len };
            self.ring_write("used", rings.used_ring.offset::<VqdUsed>(slot as usize), &used)?;

            inner.used_idx += Wrapping(1);
            fence(Ordering::Release);
            self.ring_write("used", rings.used_idx, &inner.used_idx.0)?;
            probes::virtio_vq_push!(|| (
                self as *const VirtQueue as u64,
                inner.used_idx.0,
                len
            ));

            // The used index must be visible to the guest before its
            // suppression state is sampled.
            fence(Ordering::SeqCst);
            let signal = if inner.features.contains(Features::RING_EVENT_IDX) {
                let used_event: u16 = self.ring_read("available", rings.used_event)?;
                inner.used_idx.0 == used_event.wrapping_add(1)
            } else {
                let flags: u16 = self.ring_read("available", rings.avail_flags)?;
                !AvailFlags::from_bits_truncate(flags).contains(AvailFlags::NO_INTERRUPT)
            };
            if signal {
                probes::virtio_vq_intr!(|| (
                    self as *const VirtQueue as u64,
                    inner.used_idx.0
                ));
                inner.interrupt.clone()
            } else {
                None
            }
        };

        if let Some(intr) = intr {
            intr.notify(IntrAction::QUEUE | actions).map_err(QueueError::Interrupt)?;
        }
        Ok(())
    }

    /// Fetch the next available chain (if any), pass each of its descriptors
    /// to `handler`, and return it to the guest with the length accumulated
    /// by `handler` in its second argument.
    ///
    /// An error from `handler` is propagated immediately, without returning
    /// the chain.
    pub fn handle_descriptor<F, E>(&self, mut handler: F) -> Result<HandleStatus, E>
    where
        F: FnMut(&VirtioDescriptor<'_>, &mut u32) -> Result<(), E>,
        E: From<QueueError>,
    {
        let Some(head) = self.next_avail()? else {
            return Ok(HandleStatus::NoWork);
        };
        let mut used_len = 0;
        for desc in self.chain(head)? {
            handler(&desc?, &mut used_len)?;
        }
        self.push_used(head, used_len)?;

        Ok(if self.has_avail()? { HandleStatus::MoreAvailable } else { HandleStatus::Done })
    }

    /// Service this queue from a dedicated thread.
    ///
    /// For each available chain, `handler` is called with its head index and
    /// a used-length to fill, after which the chain is returned to the guest.
    /// The thread exits when the queue is halted, when `handler` asks to stop,
    /// or upon any error.
    pub fn poll<F, E>(
        self: &Arc<Self>,
        name: &str,
        log: &Logger,
        mut handler: F,
    ) -> std::io::Result<JoinHandle<Result<(), E>>>
    where
        F: FnMut(&VirtQueue, u16, &mut u32) -> Result<PollAction, E> + Send + 'static,
        E: From<QueueError> + std::fmt::Display + Send + 'static,
    {
        let vq = Arc::clone(self);
        let log = log.new(o!("queue" => name.to_string()));
        std::thread::Builder::new().name(format!("vq-{name}")).spawn(move || loop {
            let head = match vq.wait() {
                Ok(Some(head)) => head,
                Ok(None) => {
                    info!(log, "queue halted");
                    return Ok(());
                }
                Err(e) => {
                    error!(log, "failed to fetch available chain"; "error" => %e);
                    return Err(e.into());
                }
            };

            let mut used_len = 0;
            let res = handler(&*vq, head, &mut used_len);
            if let Err(e) = vq.push_used(head, used_len) {
                error!(log, "failed to return chain"; "head" => head, "error" => %e);
                return Err(e.into());
            }
            match res {
                Ok(PollAction::Continue) => {}
                Ok(PollAction::Stop) => {
                    info!(log, "handler stopped polling");
                    return Ok(());
                }
                Err(e) => {
                    error!(log, "handler failed"; "head" => head, "error" => %e);
                    return Err(e);
                }
            }
        })
    }

    /// Service this queue cooperatively, from the calling task.
    ///
    /// The chain is returned to the guest whether or not `handler` succeeds,
    /// with a used-length of 0 upon failure.  Polling ends when the queue is
    /// halted, when `handler` asks to stop, or upon any error.
    pub async fn poll_async<F, Fut, E>(
        self: Arc<Self>,
        name: &str,
        log: &Logger,
        mut handler: F,
    ) -> Result<(), E>
    where
        F: FnMut(Arc<VirtQueue>, u16) -> Fut,
        Fut: std::future::Future<Output = Result<Served, E>>,
        E: From<QueueError> + std::fmt::Display,
    {
        let log = log.new(o!("queue" => name.to_string()));
        loop {
            let head = match self.wait_async().await {
                Ok(Some(head)) => head,
                Ok(None) => {
                    info!(log, "queue halted");
                    return Ok(());
                }
                Err(e) => {
                    error!(log, "failed to fetch available chain"; "error" => %e);
                    return Err(e.into());
                }
            };

            let res = handler(Arc::clone(&self), head).await;
            let used_len = res.as_ref().map(|s| s.used_len).unwrap_or(0);
            if let Err(e) = self.push_used(head, used_len) {
                error!(log, "failed to return chain"; "head" => head, "error" => %e);
                return Err(e.into());
            }
            match res {
                Ok(Served { action: PollAction::Continue, .. }) => {}
                Ok(Served { action: PollAction::Stop, .. }) => {
                    info!(log, "handler stopped polling");
                    return Ok(());
                }
                Err(e) => {
                    error!(log, "handler failed"; "head" => head, "error" => %e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::{CountingIntr, TestVirtQueue};
    use super::*;

    use proptest::prelude::*;
    use slog::Discard;

    fn test_log() -> Logger {
        Logger::root(Discard, o!())
    }

    #[test]
    fn vq_size_validation() {
        assert!(matches!(VqSize::try_from(0), Err(VqSizeError::IsZero)));
        assert!(matches!(VqSize::try_from(3), Err(VqSizeError::NotPow2)));
        assert!(matches!(VqSize::try_from(65535), Err(VqSizeError::NotPow2)));
        assert_eq!(VqSize::try_from(256).unwrap().get(), 256);
        assert_eq!(VqSize::try_from(MAX_QUEUE_SIZE).unwrap().get(), MAX_QUEUE_SIZE);
    }

    #[test]
    fn split_layout() {
        let size = VqSize::new(4);
        let layout = RingLayout::split(GuestAddr(0x1000), size);
        assert_eq!(layout.desc, GuestAddr(0x1000));
        assert_eq!(layout.avail, GuestAddr(0x1040));
        assert_eq!(layout.used, GuestAddr(0x2000));
        assert_eq!(RingLayout::split_len(size), 0x1000 + 6 + 32);
    }

    #[test]
    fn configure_rejects_bad_rings() {
        let mem = MemCtx::new(0x4000).unwrap();
        let vq = VirtQueue::new(mem);

        assert!(matches!(
            vq.configure(5, 0, 0x1000, 0x2000),
            Err(QueueError::InvalidSize(VqSizeError::NotPow2))
        ));
        // used ring (with its avail_event) spills off the end of memory
        assert!(matches!(
            vq.configure(16, 0, 0x1000, 0x4000 - 0x80),
            Err(QueueError::RingOutOfRange { ring: "used", .. })
        ));
        assert!(matches!(
            vq.configure(16, u64::MAX - 8, 0x1000, 0x2000),
            Err(QueueError::RingOutOfRange { ring: "descriptor", .. })
        ));
        assert!(!vq.state().configured);
        assert!(matches!(vq.next_avail(), Err(QueueError::NotConfigured)));

        vq.configure(16, 0, 0x1000, 0x2000).unwrap();
        assert!(vq.state().configured);
        assert_eq!(vq.state().size, 16);
    }

    #[test]
    fn empty_ring_has_no_work() {
        let tvq = TestVirtQueue::new(4);
        assert_eq!(tvq.vq().next_avail().unwrap(), None);
        assert_eq!(
            tvq.vq().handle_descriptor(|_, _| Ok::<(), QueueError>(())).unwrap(),
            HandleStatus::NoWork
        );
    }

    #[test]
    fn descriptors_in_publish_order() {
        let mut tvq = TestVirtQueue::new(8);
        let d0 = tvq.add_readable(b"first");
        let d1 = tvq.add_readable(b"second");
        tvq.publish_avail(d1);
        tvq.publish_avail(d0);

        let vq = tvq.vq();
        assert_eq!(vq.next_avail().unwrap(), Some(d1));
        assert_eq!(vq.next_avail().unwrap(), Some(d0));
        assert_eq!(vq.next_avail().unwrap(), None);

        let desc = vq.read_desc(d0).unwrap();
        assert_eq!(desc.len, 5);
        assert!(!desc.writable);
        assert!(!desc.has_next);
        let mut buf = [0u8; 5];
        desc.buf.read_bytes(&mut buf).unwrap();
        assert_eq!(&buf, b"first");
    }

    #[test]
    fn read_desc_bounds() {
        let mut tvq = TestVirtQueue::new(8);
        let mem_len = tvq.mem().len() as u64;

        let overflow = tvq.add_desc_raw(u64::MAX - 4, 16, 0, 0);
        let beyond = tvq.add_desc_raw(mem_len - 8, 16, 0, 0);
        let edge = tvq.add_desc_raw(mem_len - 16, 16, 0, 0);

        let vq = tvq.vq();
        let err = vq.read_desc(overflow).unwrap_err();
        assert!(matches!(
            err,
            QueueError::DescOutOfRange { source: MemError::Overflow { .. }, .. }
        ));
        assert!(err.is_guest_fault());
        assert!(matches!(
            vq.read_desc(beyond),
            Err(QueueError::DescOutOfRange { source: MemError::OutOfRange { .. }, .. })
        ));
        assert_eq!(vq.read_desc(edge).unwrap().buf.len(), 16);
        assert!(matches!(
            vq.read_desc(8),
            Err(QueueError::DescIndexOutOfRange { index: 8, size: 8 })
        ));
    }

    #[test]
    fn chain_walk_and_loop_detection() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_readable(&[0xaa; 16]);
        let d1 = tvq.add_writable(64);
        tvq.chain_descriptors(&[d0, d1]);

        let descs: Vec<_> =
            tvq.vq().chain(d0).unwrap().map(|d| d.unwrap().index).collect();
        assert_eq!(descs, vec![d0, d1]);

        // Close the chain into a loop
        tvq.chain_descriptors(&[d1, d0]);
        let res: Result<Vec<_>, _> = tvq.vq().chain(d0).unwrap().collect();
        assert!(matches!(res, Err(QueueError::ChainTooLong { size: 4, .. })));
    }

    #[test]
    fn handle_descriptor_accumulates_length() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_readable(&[1, 2, 3, 4]);
        let d1 = tvq.add_writable(128);
        tvq.chain_descriptors(&[d0, d1]);
        tvq.publish_avail(d0);
        let d2 = tvq.add_writable(8);
        tvq.publish_avail(d2);

        let mut seen = Vec::new();
        let status = tvq
            .vq()
            .handle_descriptor(|desc, used| {
                seen.push(desc.index);
                if desc.writable {
                    desc.buf.write_byte(0xff, 16).unwrap();
                    *used += 16;
                }
                Ok::<(), QueueError>(())
            })
            .unwrap();
        assert_eq!(status, HandleStatus::MoreAvailable);
        assert_eq!(seen, vec![d0, d1]);
        assert_eq!(tvq.drain_used(), vec![(u32::from(d0), 16)]);
        assert_eq!(tvq.read_guest_mem(tvq.desc_addr(d1), 16), vec![0xff; 16]);

        let status =
            tvq.vq().handle_descriptor(|_, _| Ok::<(), QueueError>(())).unwrap();
        assert_eq!(status, HandleStatus::Done);
        assert_eq!(tvq.drain_used(), vec![(u32::from(d2), 0)]);
    }

    #[test]
    fn handle_descriptor_error_keeps_chain() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_writable(32);
        tvq.publish_avail(d0);

        #[derive(Debug)]
        enum TestErr {
            Handler,
            Queue,
        }
        impl From<QueueError> for TestErr {
            fn from(_: QueueError) -> Self {
                TestErr::Queue
            }
        }

        let res = tvq.vq().handle_descriptor(|_, _| Err(TestErr::Handler));
        assert!(matches!(res, Err(TestErr::Handler)));
        assert!(tvq.drain_used().is_empty());
        assert_eq!(tvq.vq().state().used_idx, 0);
    }

    #[test]
    fn avail_overrun_is_guest_fault() {
        let mut tvq = TestVirtQueue::new(4);
        tvq.set_avail_idx(5);
        let err = tvq.vq().next_avail().unwrap_err();
        assert!(matches!(err, QueueError::AvailOverrun { pending: 5, size: 4 }));
        assert!(err.is_guest_fault());
    }

    #[test]
    fn event_idx_updates_avail_event() {
        let mut tvq = TestVirtQueue::with_opts(8, QueueOpts { notify_threshold: 4 });
        tvq.vq().set_features(Features::RING_EVENT_IDX);
        let d0 = tvq.add_writable(8);
        tvq.publish_avail(d0);
        tvq.publish_avail(d0);

        assert_eq!(tvq.vq().next_avail().unwrap(), Some(d0));
        assert_eq!(tvq.avail_event(), 1 + 4 - 1);
        assert_eq!(tvq.vq().next_avail().unwrap(), Some(d0));
        assert_eq!(tvq.avail_event(), 2 + 4 - 1);
    }

    #[test]
    fn interrupt_honors_no_interrupt_flag() {
        let mut tvq = TestVirtQueue::new(4);
        let intr = CountingIntr::attach(tvq.vq());
        let d0 = tvq.add_writable(8);

        tvq.publish_avail(d0);
        let head = tvq.vq().next_avail().unwrap().unwrap();
        tvq.vq().push_used(head, 0).unwrap();
        assert_eq!(intr.count(), 1);

        tvq.set_avail_flags(AvailFlags::NO_INTERRUPT);
        tvq.publish_avail(d0);
        let head = tvq.vq().next_avail().unwrap().unwrap();
        tvq.vq().push_used(head, 0).unwrap();
        assert_eq!(intr.count(), 1);
    }

    #[test]
    fn push_used_rejects_bad_id() {
        let tvq = TestVirtQueue::new(4);
        assert!(matches!(
            tvq.vq().push_used(4, 0),
            Err(QueueError::DescIndexOutOfRange { index: 4, size: 4 })
        ));
    }

    #[test]
    fn interrupt_failure_surfaces() {
        let mut tvq = TestVirtQueue::new(4);
        tvq.vq().set_intr(Arc::new(|_: IntrAction| -> std::io::Result<()> {
            Err(std::io::Error::new(std::io::ErrorKind::Other, "intr gone"))
        }));
        let d0 = tvq.add_writable(8);
        tvq.publish_avail(d0);
        let head = tvq.vq().next_avail().unwrap().unwrap();
        assert!(matches!(tvq.vq().push_used(head, 0), Err(QueueError::Interrupt(_))));
    }

    #[test]
    fn poll_thread_serves_and_halts() {
        let mut tvq = TestVirtQueue::new(8);
        let heads: Vec<u16> = (0..3).map(|_| tvq.add_writable(4)).collect();

        let handle = tvq
            .vq()
            .poll("test", &test_log(), |vq, head, used| {
                let desc = vq.read_desc(head)?;
                desc.buf.write_bytes(&[0x5a; 4]).map_err(|_| QueueError::NotConfigured)?;
                *used = 4;
                Ok::<_, QueueError>(PollAction::Continue)
            })
            .unwrap();

        for head in heads.iter() {
            tvq.publish_avail(*head);
        }
        tvq.kick();

        while tvq.vq().state().used_idx != 3 {
            std::thread::yield_now();
        }
        tvq.vq().halt();
        handle.join().unwrap().unwrap();

        let used = tvq.drain_used();
        let ids: Vec<u32> = used.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, heads.iter().map(|h| u32::from(*h)).collect::<Vec<_>>());
        assert!(used.iter().all(|(_, len)| *len == 4));
        assert_eq!(tvq.read_guest_mem(tvq.desc_addr(heads[2]), 4), vec![0x5a; 4]);
    }

    #[test]
    fn poll_thread_stops_on_request() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_writable(4);
        tvq.publish_avail(d0);
        tvq.kick();

        let handle = tvq
            .vq()
            .poll("stopper", &test_log(), |_, _, used| {
                *used = 1;
                Ok::<_, QueueError>(PollAction::Stop)
            })
            .unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(tvq.drain_used(), vec![(u32::from(d0), 1)]);
    }

    #[tokio::test]
    async fn poll_async_returns_chain_on_error() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_writable(4);
        let d1 = tvq.add_writable(4);
        tvq.publish_avail(d0);
        tvq.publish_avail(d1);
        tvq.kick();

        let res = Arc::clone(tvq.vq())
            .poll_async("async", &test_log(), |_vq, head| async move {
                if head == d0 {
                    Ok(Served::with_len(4))
                } else {
                    Err(QueueError::NotConfigured)
                }
            })
            .await;
        assert!(res.is_err());
        assert_eq!(
            tvq.drain_used(),
            vec![(u32::from(d0), 4), (u32::from(d1), 0)]
        );
    }

    #[tokio::test]
    async fn poll_async_wakes_on_notify() {
        let mut tvq = TestVirtQueue::new(4);
        let d0 = tvq.add_writable(4);
        let vq = Arc::clone(tvq.vq());

        let task = tokio::spawn(async move {
            vq.poll_async("async", &test_log(), |_vq, _head| async move {
                Ok::<_, QueueError>(Served::with_len(2))
            })
            .await
        });

        tokio::task::yield_now().await;
        tvq.publish_avail(d0);
        tvq.kick();
        while tvq.vq().state().used_idx != 1 {
            tokio::task::yield_now().await;
        }
        tvq.vq().halt();
        task.await.unwrap().unwrap();
        assert_eq!(tvq.drain_used(), vec![(u32::from(d0), 2)]);
    }

    proptest! {
        #[test]
        fn ring_wraps_around(shift in 0u32..6, start in any::<u16>()) {
            let size = 1u16 << shift;
            let mut tvq = TestVirtQueue::new(size);
            let d0 = tvq.add_writable(8);
            tvq.start_at(start);

            for _ in 0..size {
                tvq.publish_avail(d0);
            }
            for _ in 0..size {
                let head = tvq.vq().next_avail().unwrap();
                prop_assert_eq!(head, Some(d0));
                tvq.vq().push_used(d0, 8).unwrap();
            }
            prop_assert_eq!(tvq.vq().next_avail().unwrap(), None);

            let state = tvq.vq().state();
            prop_assert_eq!(state.next_avail, start.wrapping_add(size));
            prop_assert_eq!(state.used_idx, start.wrapping_add(size));
            prop_assert_eq!(tvq.used_idx(), start.wrapping_add(size));
            prop_assert_eq!(tvq.drain_used().len(), size as usize);
        }

        #[test]
        fn interrupt_suppression_law(
            event_idx in any::<bool>(),
            steps in proptest::collection::vec((any::<u16>(), any::<bool>()), 1..64),
        ) {
            let mut tvq = TestVirtQueue::new(16);
            let intr = CountingIntr::attach(tvq.vq());
            if event_idx {
                tvq.vq().set_features(Features::RING_EVENT_IDX);
            }
            let d0 = tvq.add_writable(8);

            let mut expected = 0;
            let mut used_idx = 0u16;
            for (i, (used_event, no_intr)) in steps.into_iter().enumerate() {
                // Occasionally target exactly the upcoming used index
                let used_event = if i % 3 == 0 { used_idx } else { used_event };
                tvq.set_used_event(used_event);
                tvq.set_avail_flags(if no_intr {
                    AvailFlags::NO_INTERRUPT
                } else {
                    AvailFlags::empty()
                });

                tvq.publish_avail(d0);
                let head = tvq.vq().next_avail().unwrap().unwrap();
                tvq.vq().push_used(head, 0).unwrap();
                used_idx = used_idx.wrapping_add(1);

                let fire = if event_idx {
                    used_idx == used_event.wrapping_add(1)
                } else {
                    !no_intr
                };
                if fire {
                    expected += 1;
                }
                prop_assert_eq!(intr.count(), expected);
            }
        }
    }
}

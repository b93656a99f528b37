// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Module for managing guest memory mappings.
//!
//! Guest-physical memory is modeled as a single arena: guest address `A` lives
//! at offset `A - base` into an anonymous host mapping.  All access from the
//! rest of the crate goes through [`MemCtx::translate`] (or the typed helpers
//! built upon it), which refuses any region not wholly inside the arena.

use std::io::{Error, ErrorKind, Result};
use std::marker::PhantomData;
use std::mem::{size_of, size_of_val};
use std::ptr::{copy_nonoverlapping, NonNull};
use std::sync::Arc;

use crate::common::GuestAddr;

use zerocopy::FromBytes;

/// Failure to translate a guest-physical region into host memory.
#[derive(Debug, thiserror::Error)]
pub enum MemError {
    #[error("guest region {addr}+{len:#x} overflows the address space")]
    Overflow { addr: GuestAddr, len: u64 },

    #[error("guest region {addr}+{len:#x} lies outside guest memory")]
    OutOfRange { addr: GuestAddr, len: u64 },
}

/// An owned, anonymous region of host memory.
///
/// Backs both the guest-physical arena and the write cache of the volatile
/// overlay dispatcher.  Access to its contents is only offered through
/// [`SubMapping`], which never hands out references to the underlying memory.
#[derive(Debug)]
pub struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}
impl Mapping {
    /// Creates a new private, anonymous, read/write mapping of `size` bytes.
    pub fn new_anon(size: usize) -> Result<Arc<Self>> {
        if size == 0 {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "mapping size cannot be 0",
            ));
        }

        // Safety: With a NULL `addr`, the OS picks a location which does not
        // conflict with other resources.
        let ptr = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(Error::last_os_error());
        }
        let ptr = NonNull::new(ptr as *mut u8)
            .ok_or_else(|| Error::new(ErrorKind::Other, "mmap() was NULL"))?;

        Ok(Arc::new(Self { ptr, len: size }))
    }

    /// Returns the length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Access the whole of the mapping.
    pub fn as_sub(&self) -> SubMapping<'_> {
        SubMapping { _backing: PhantomData, ptr: self.ptr, len: self.len }
    }
}
impl Drop for Mapping {
    fn drop(&mut self) {
        let res = unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.len)
        };
        // The region was mapped successfully at construction, so anything
        // other than success here means our bookkeeping is corrupt.
        assert_eq!(res, 0, "munmap of owned mapping failed: {}", Error::last_os_error());
    }
}

// Safety: `Mapping`'s API does not provide raw access to the underlying
// pointer, nor any mechanism to create references to the underlying data.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// A borrowed region from a `Mapping` object.
///
/// Provides interfaces for acting on memory, but does not own the
/// underlying memory region.
#[derive(Debug)]
pub struct SubMapping<'a> {
    _backing: PhantomData<&'a Mapping>,

    ptr: NonNull<u8>,
    len: usize,
}

impl<'a> SubMapping<'a> {
    /// Acquire a reference to a region of memory within the
    /// current mapping.
    ///
    /// - `offset` is relative to the current mapping.
    /// - `length` is the length of the new subregion.
    ///
    /// Returns `None` if the requested offset/length extends beyond the end of
    /// the mapping.
    pub fn subregion(&self, offset: usize, length: usize) -> Option<SubMapping<'a>> {
        let end = offset.checked_add(length)?;
        if self.len < end {
            return None;
        }

        // Safety:
        // - Starting and resulting pointer must be within bounds or
        // one past the end of the same allocated object.
        // - The computed offset, in bytes, cannot overflow isize.
        let ptr = unsafe { self.ptr.as_ptr().add(offset) };
        Some(SubMapping {
            _backing: PhantomData,
            ptr: NonNull::new(ptr)?,
            len: length,
        })
    }

    /// Reads a `T` object from the mapping.
    pub fn read<T: Copy + FromBytes>(&self) -> Result<T> {
        let typed = self.ptr.as_ptr() as *const T;
        if self.len < size_of::<T>() {
            return Err(Error::new(ErrorKind::InvalidData, "Buffer too small"));
        }

        // Safety:
        // - typed is valid for reads of `size_of::<T>()` as checked above
        // - typed must point to a properly initialized value of T: always true
        //     because we require `T: FromBytes`, which is valid for all bit
        //     patterns.
        Ok(unsafe { typed.read_unaligned() })
    }

    /// Reads a buffer of bytes from the mapping.
    ///
    /// If `buf` is larger than the SubMapping, the read will be truncated to
    /// length of the SubMapping.
    ///
    /// Returns the number of bytes read.
    pub fn read_bytes(&self, buf: &mut [u8]) -> Result<usize> {
        let read_len = usize::min(buf.len(), self.len);

        // Safety
        // - `src` is valid for reads of `read_len` as checked above
        // - `dst` is valid for writes for its entire length, since it is from
        //   a valid mutable reference passed in to us
        // - `dst` cannot be overlapped by `src`, since the former came from a
        //   valid reference, and references to mappings are not handed out
        unsafe {
            copy_nonoverlapping(self.ptr.as_ptr(), buf.as_mut_ptr(), read_len);
        }
        Ok(read_len)
    }

    /// Writes `value` into the mapping.
    pub fn write<T: Copy>(&self, value: &T) -> Result<()> {
        if self.len < size_of::<T>() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Value larger than mapping",
            ));
        }
        let typed = self.ptr.as_ptr() as *mut T;
        unsafe {
            typed.write_unaligned(*value);
        }
        Ok(())
    }

    /// Writes `values` into the mapping.
    pub fn write_many<T: Copy>(&self, values: &[T]) -> Result<()> {
        let copy_len = size_of_val(values);
        if self.len < copy_len {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "Value larger than mapping",
            ));
        }

        // We know that the `values` reference is properly aligned, but that is
        // not guaranteed for the destination pointer.  Cast it down to a u8,
        // which will appease those alignment concerns
        let src = values.as_ptr() as *const u8;
        let dst = self.ptr.as_ptr();

        // Safety
        // - `src` is valid for reads for its entire length, since it is from a
        //   valid reference passed in to us
        // - `dst` is valid for writes for the `copy_len` as checked above
        // - `dst` cannot be overlapped by `src`, since the latter came from a
        //   valid reference, and references to mappings are not handed out
        unsafe {
            copy_nonoverlapping(src, dst, copy_len);
        }
        Ok(())
    }

    /// Writes a buffer of bytes into the mapping.
    ///
    /// If `buf` is larger than the SubMapping, the write will be truncated to
    /// length of the SubMapping.
    ///
    /// Returns the number of bytes written.
    pub fn write_bytes(&self, buf: &[u8]) -> Result<usize> {
        let write_len = usize::min(buf.len(), self.len);
        self.write_many(&buf[..write_len])?;
        Ok(write_len)
    }

    /// Writes a single byte `val` to the mapping, `count` times.
    pub fn write_byte(&self, val: u8, count: usize) -> Result<usize> {
        let to_copy = usize::min(count, self.len);
        unsafe {
            self.ptr.as_ptr().write_bytes(val, to_copy);
        }
        Ok(to_copy)
    }

    /// Returns the length of the mapping.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the mapping is empty.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

// Safety: `SubMapping`'s API does not provide raw access to the underlying
// pointer, nor any mechanism to create references to the underlying data.
unsafe impl Send for SubMapping<'_> {}
unsafe impl Sync for SubMapping<'_> {}

/// Wrapper around the physical address space of a guest.
pub struct MemCtx {
    map: Arc<Mapping>,
    base: GuestAddr,
}
impl MemCtx {
    /// Allocate `size` bytes of guest memory, starting at guest-physical
    /// address 0.
    pub fn new(size: usize) -> Result<Arc<Self>> {
        Self::new_at(GuestAddr(0), size)
    }

    /// Allocate `size` bytes of guest memory, starting at guest-physical
    /// address `base`.
    pub fn new_at(base: GuestAddr, size: usize) -> Result<Arc<Self>> {
        if base.checked_add(size as u64).is_none() {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "guest memory extends beyond address space",
            ));
        }
        let map = Mapping::new_anon(size)?;
        Ok(Arc::new(Self { map, base }))
    }

    /// Size (in bytes) of the guest memory region
    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Lowest guest-physical address backed by this context
    pub fn base(&self) -> GuestAddr {
        self.base
    }

    /// Translate the guest region `addr`..`addr+len` into a host view.
    ///
    /// The region must lie wholly within guest memory: regions which overflow
    /// the 64-bit address space, or which extend beyond the end of memory, are
    /// refused without ever computing a host pointer.
    pub fn translate(
        &self,
        addr: GuestAddr,
        len: u64,
    ) -> std::result::Result<SubMapping<'_>, MemError> {
        let end = addr.checked_add(len).ok_or(MemError::Overflow { addr, len })?;
        let limit = self.base.0 + self.map.len() as u64;
        if addr < self.base || end.0 > limit {
            return Err(MemError::OutOfRange { addr, len });
        }
        let offset = (addr.0 - self.base.0) as usize;
        self.map
            .as_sub()
            .subregion(offset, len as usize)
            .ok_or(MemError::OutOfRange { addr, len })
    }

    /// Reads a generic value from a specified guest address.
    pub fn read<T: Copy + FromBytes>(&self, addr: GuestAddr) -> Option<T> {
        self.translate(addr, size_of::<T>() as u64).ok()?.read::<T>().ok()
    }

    /// Reads bytes into a requested buffer from guest memory.
    ///
    /// Copies up to `buf.len()` or `len` bytes, whichever is smaller.
    pub fn read_into(
        &self,
        addr: GuestAddr,
        buf: &mut [u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        let mapping = self.translate(addr, len as u64).ok()?;
        mapping.read_bytes(&mut buf[..len]).ok()
    }

    /// Writes a value to guest memory.
    pub fn write<T: Copy>(&self, addr: GuestAddr, val: &T) -> bool {
        match self.translate(addr, size_of::<T>() as u64) {
            Ok(mapping) => mapping.write(val).is_ok(),
            Err(_) => false,
        }
    }

    /// Writes bytes from a buffer to guest memory.
    ///
    /// Writes up to `buf.len()` or `len` bytes, whichever is smaller.
    pub fn write_from(
        &self,
        addr: GuestAddr,
        buf: &[u8],
        len: usize,
    ) -> Option<usize> {
        let len = usize::min(buf.len(), len);
        let mapping = self.translate(addr, len as u64).ok()?;
        mapping.write_bytes(&buf[..len]).ok()
    }

    /// Writes a single value to guest memory.
    pub fn write_byte(&self, addr: GuestAddr, val: u8, count: usize) -> bool {
        match self.translate(addr, count as u64) {
            Ok(mapping) => mapping.write_byte(val, count).is_ok(),
            Err(_) => false,
        }
    }
}

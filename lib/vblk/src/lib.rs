// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtio transport and layered block dispatchers for a lightweight VMM.
//!
//! The crate is split along the same lines as the data path:
//!
//! - [`vmm::mem`] offers bounds-checked access to guest-physical memory.
//! - [`hw::virtio`] interprets the split virtqueue rings which a guest driver
//!   publishes in that memory, and frames virtio-blk requests atop them.
//! - [`block`] holds the [`block::BlockDispatcher`] capability and the raw,
//!   volatile-overlay and QCOW2 dispatchers which satisfy those requests.

#![allow(clippy::style)]

pub extern crate usdt;
#[macro_use]
extern crate bitflags;

pub mod block;
pub mod common;
pub mod hw;
pub mod vmm;

pub use vmm::MemCtx;

pub fn version() -> &'static str {
    concat!("v", env!("CARGO_PKG_VERSION"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn print_version() {
        let v = version();
        eprintln!("vblk {v}");
        assert!(v.contains(env!("CARGO_PKG_VERSION")));
    }
}

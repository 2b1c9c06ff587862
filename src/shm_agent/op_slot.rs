// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SHM-op slot: a fixed header carved from a [`crate::buffer::ShmOpRing`],
//! followed by a variable-length payload. `variants_checked` and
//! `replication_type` are the two release/acquire synchronization points
//! between leader and followers (spec §3).

use std::sync::atomic::{AtomicU16, AtomicU8, Ordering};

#[repr(C)]
struct Header {
    in_addr: u64,
    out_addr: u64,
    size: u64,
    value: u64,
    cmp: u64,
    op_type: u8,
    pointer_equivalence: u8,
    _pad: [u8; 2],
    variants_checked: AtomicU16,
    replication_type: AtomicU8,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<Header>();

/// "from shadow": leader's shared-memory access agreed with its shadow.
pub const REPLICATION_FROM_SHADOW: u8 = 1;
/// "buffered": leader's access diverged from shadow; `payload` carries the
/// authoritative bytes.
pub const REPLICATION_FROM_BUFFER: u8 = 2;

/// A view over one carved entry: `ptr` points at the start of the header,
/// `payload_len` bytes of payload immediately follow it.
pub struct ShmOpSlot {
    ptr: *mut u8,
    payload_len: usize,
}

impl ShmOpSlot {
    /// # Safety
    /// `ptr` must point at `HEADER_SIZE + payload_len` live, writable bytes
    /// carved from a ring this process has mapped `MAP_SHARED`.
    pub unsafe fn at(ptr: *mut u8, payload_len: usize) -> Self {
        Self { ptr, payload_len }
    }

    pub fn total_len(payload_len: usize) -> usize {
        HEADER_SIZE + payload_len
    }

    fn header(&self) -> &Header {
        // SAFETY: `ptr` was carved with room for at least `HEADER_SIZE`
        // bytes, cache-line aligned by the ring's carving policy.
        unsafe { &*(self.ptr as *const Header) }
    }

    /// Leader-only: fill the request fields and publish.
    ///
    /// Non-atomic header fields are written before the release-store of
    /// `variants_checked`, which is the fence followers synchronize on —
    /// the same pattern used by [`crate::buffer::slot::SyncRingSlot`].
    pub fn publish_request(
        &self,
        in_addr: u64,
        out_addr: u64,
        size: u64,
        value: u64,
        cmp: u64,
        op_type: u8,
        pointer_equivalence: bool,
    ) {
        // SAFETY: sole writer during phase 1, before any follower has
        // observed `variants_checked != 0`.
        unsafe {
            let h = self.ptr as *mut Header;
            (*h).in_addr = in_addr;
            (*h).out_addr = out_addr;
            (*h).size = size;
            (*h).value = value;
            (*h).cmp = cmp;
            (*h).op_type = op_type;
            (*h).pointer_equivalence = pointer_equivalence as u8;
        }
        self.header().variants_checked.store(1, Ordering::Release);
    }

    pub fn in_addr(&self) -> u64 {
        self.header().in_addr
    }
    pub fn out_addr(&self) -> u64 {
        self.header().out_addr
    }
    pub fn size(&self) -> u64 {
        self.header().size
    }
    pub fn value(&self) -> u64 {
        self.header().value
    }
    pub fn cmp(&self) -> u64 {
        self.header().cmp
    }
    pub fn op_type(&self) -> u8 {
        self.header().op_type
    }
    pub fn pointer_equivalence_enabled(&self) -> bool {
        self.header().pointer_equivalence != 0
    }

    #[inline]
    pub fn variants_checked(&self) -> u16 {
        self.header().variants_checked.load(Ordering::Acquire)
    }

    /// Followers increment this iff the op writes to shared memory (spec
    /// §4.B.1, phase 1).
    pub fn ack_write_capable(&self) {
        self.header()
            .variants_checked
            .fetch_add(1, Ordering::AcqRel);
    }

    #[inline]
    pub fn replication_type(&self) -> u8 {
        self.header().replication_type.load(Ordering::Acquire)
    }

    pub fn publish_from_shadow(&self) {
        self.header()
            .replication_type
            .store(REPLICATION_FROM_SHADOW, Ordering::Release);
    }

    /// Leader marks the slot buffered: `payload` already holds the
    /// authoritative bytes.
    pub fn publish_from_buffer(&self) {
        self.header()
            .replication_type
            .store(REPLICATION_FROM_BUFFER, Ordering::Release);
    }

    #[inline]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    pub fn payload(&self) -> &[u8] {
        if self.payload_len == 0 {
            return &[];
        }
        // SAFETY: carved region reserves `HEADER_SIZE + payload_len` bytes.
        unsafe { std::slice::from_raw_parts(self.ptr.add(HEADER_SIZE), self.payload_len) }
    }

    #[allow(clippy::mut_from_ref)]
    pub fn payload_mut(&self) -> &mut [u8] {
        if self.payload_len == 0 {
            return &mut [];
        }
        // SAFETY: see `payload`; writers are serialized by the protocol
        // phase (leader writes in phase 1/2, followers only read).
        unsafe { std::slice::from_raw_parts_mut(self.ptr.add(HEADER_SIZE), self.payload_len) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publish_then_read_back_header_fields() {
        let mut buf = vec![0u8; ShmOpSlot::total_len(8)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 8) };
        slot.publish_request(0x1000, 0x1000, 8, 0, 0, 0, false);
        assert_eq!(slot.in_addr(), 0x1000);
        assert_eq!(slot.size(), 8);
        assert_eq!(slot.variants_checked(), 1);
    }

    #[test]
    fn payload_roundtrips() {
        let mut buf = vec![0u8; ShmOpSlot::total_len(4)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 4) };
        slot.payload_mut().copy_from_slice(&[1, 2, 3, 4]);
        assert_eq!(slot.payload(), &[1, 2, 3, 4]);
    }

    #[test]
    fn ack_write_capable_accumulates() {
        let mut buf = vec![0u8; ShmOpSlot::total_len(0)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 0) };
        slot.publish_request(0, 0, 0, 0, 0, 0, false);
        slot.ack_write_capable();
        slot.ack_write_capable();
        assert_eq!(slot.variants_checked(), 3);
    }
}

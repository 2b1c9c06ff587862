// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The sync ring: a [`BufferInfo`] header followed by a fixed number of
//! [`SyncRingSlot`]s, all attached from a single [`BufferSegment`] shared
//! by every variant thread in the process.

use super::segment::BufferSegment;
use super::slot::{BufferInfo, SyncRingSlot};
use crate::error::{AgentError, Result};
use std::mem::size_of;

/// Total bytes needed for a sync ring of `slots` slots.
pub const fn sync_ring_bytes(slots: usize) -> usize {
    size_of::<BufferInfo>() + slots * size_of::<SyncRingSlot>()
}

/// An attached sync ring. Shared by every thread in the variant process
/// (all threads see the same `BufferInfo`/slots through the same mapping).
pub struct SyncRing {
    segment: BufferSegment,
    slot_count: usize,
}

impl SyncRing {
    /// Create the backing segment (leader-side allocation path: in this
    /// crate any variant may create it since segment creation itself does
    /// not require cross-variant agreement — the monitor hands out the
    /// same name to all of them via `GET_SHARED_BUFFER`).
    pub fn create(name: &str, slot_count: usize) -> Result<Self> {
        let bytes = sync_ring_bytes(slot_count);
        let segment = BufferSegment::create(name, bytes).map_err(|e| {
            AgentError::Configuration(format!("sync ring segment create failed: {e}"))
        })?;
        let ring = Self {
            segment,
            slot_count,
        };
        // SAFETY: freshly mapped, zero-filled memory sized for exactly one
        // `BufferInfo` followed by `slot_count` slots.
        unsafe {
            std::ptr::write(ring.info_ptr(), BufferInfo::new(slot_count as u32, 0));
            for i in 0..slot_count {
                std::ptr::write(ring.slot_ptr(i), SyncRingSlot::new());
            }
        }
        Ok(ring)
    }

    pub fn attach(name: &str, slot_count: usize) -> Result<Self> {
        let bytes = sync_ring_bytes(slot_count);
        let segment = BufferSegment::open(name, bytes)
            .map_err(|e| AgentError::Configuration(format!("sync ring attach failed: {e}")))?;
        Ok(Self {
            segment,
            slot_count,
        })
    }

    #[inline]
    fn info_ptr(&self) -> *mut BufferInfo {
        self.segment.as_ptr() as *mut BufferInfo
    }

    #[inline]
    fn slot_ptr(&self, index: usize) -> *mut SyncRingSlot {
        debug_assert!(index < self.slot_count);
        // SAFETY: `index < slot_count`, and the segment was sized by
        // `sync_ring_bytes` to hold exactly that many slots after the
        // header.
        unsafe {
            (self.segment.as_ptr().add(size_of::<BufferInfo>()) as *mut SyncRingSlot).add(index)
        }
    }

    #[inline]
    pub fn info(&self) -> &BufferInfo {
        // SAFETY: the header was initialized by `create` before any
        // attach; readers only ever see a fully-initialized header.
        unsafe { &*self.info_ptr() }
    }

    #[inline]
    pub fn slot(&self, index: usize) -> &SyncRingSlot {
        // SAFETY: see `slot_ptr`.
        unsafe { &*self.slot_ptr(index) }
    }

    #[inline]
    pub fn slot_count(&self) -> usize {
        self.slot_count
    }

    pub fn unlink(&self) {
        self.segment.unlink();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_initializes_header_and_slots() {
        let name = "/mvee_agent_test_sync_ring_a";
        let ring = SyncRing::create(name, 8).unwrap();
        assert_eq!(ring.info().size, 8);
        assert_eq!(ring.info().pos(), 0);
        assert!(!ring.slot(0).is_initialized());
        ring.unlink();
    }

    #[test]
    fn attach_sees_leader_writes() {
        let name = "/mvee_agent_test_sync_ring_b";
        let leader = SyncRing::create(name, 4).unwrap();
        leader.slot(0).publish(0x1234, 1, 99);

        let follower = SyncRing::attach(name, 4).unwrap();
        assert!(follower.slot(0).is_initialized());
        assert_eq!(
            follower.slot(0).word_ptr.load(std::sync::atomic::Ordering::Relaxed),
            0x1234
        );
        leader.unlink();
    }
}

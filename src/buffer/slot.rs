// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Cache-line-sized records backing the sync ring: [`SyncRingSlot`] (one
//! per logged atomic op) and [`BufferInfo`] (one per buffer, holding the
//! write lock and position).

use crate::config::{CACHE_LINE, MAX_VARIANTS};
use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

const _: () = assert!(std::mem::size_of::<SyncRingSlot>() == CACHE_LINE);
const _: () = assert!(std::mem::align_of::<SyncRingSlot>() == CACHE_LINE);

/// A single logged atomic operation, one per slot in the sync ring.
///
/// `tags[i]` is set by variant `i` once it has replayed the slot
/// (partial-order mode only; unused in total-order and write-once-counter
/// modes). A slot is uninitialized when `master_thread_id == 0`.
#[repr(C, align(64))]
pub struct SyncRingSlot {
    pub word_ptr: AtomicU64,
    pub master_thread_id: AtomicU32,
    pub operation_type: AtomicU16,
    pub tags: [AtomicU8; MAX_VARIANTS],
    _pad: [u8; CACHE_LINE - 8 - 4 - 2 - MAX_VARIANTS],
}

impl SyncRingSlot {
    pub const fn new() -> Self {
        Self {
            word_ptr: AtomicU64::new(0),
            master_thread_id: AtomicU32::new(0),
            operation_type: AtomicU16::new(0),
            tags: [const { AtomicU8::new(0) }; MAX_VARIANTS],
            _pad: [0; CACHE_LINE - 8 - 4 - 2 - MAX_VARIANTS],
        }
    }

    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.master_thread_id.load(Ordering::Acquire) != 0
    }

    /// Leader-only: publish `{word_ptr, op_type, master_thread_id}` into an
    /// uninitialized slot. Release ordering so a follower that observes
    /// `master_thread_id` also observes `word_ptr`/`operation_type`.
    pub fn publish(&self, word_ptr: u64, op_type: u16, master_thread_id: u32) {
        self.word_ptr.store(word_ptr, Ordering::Relaxed);
        self.operation_type.store(op_type, Ordering::Relaxed);
        for t in &self.tags {
            t.store(0, Ordering::Relaxed);
        }
        self.master_thread_id
            .store(master_thread_id, Ordering::Release);
    }

    #[inline]
    pub fn tag(&self, variant_index: usize) -> bool {
        self.tags[variant_index].load(Ordering::Acquire) != 0
    }

    #[inline]
    pub fn set_tag(&self, variant_index: usize) {
        self.tags[variant_index].store(1, Ordering::Release);
    }

    /// Reset for the next flush generation. Only the flush driver calls
    /// this, under the buffer-wide lock.
    pub fn reset(&self) {
        self.master_thread_id.store(0, Ordering::Release);
    }

    #[inline]
    pub fn is_store(&self) -> bool {
        self.operation_type.load(Ordering::Acquire) & 1 != 0
    }
}

impl Default for SyncRingSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-variant cache line at the head of each shared buffer.
///
/// Invariants: `pos <= write_pos <= size`; the leader holds `lock`
/// (decremented to 0) while writing; `flush_cnt` is the monotonically
/// increasing flush generation.
///
/// `pos` is the shared *consumption* cursor advanced by whichever follower
/// thread replays the slot it points at (see `sync_agent::total_order`);
/// `write_pos` is the leader's own allocation cursor. Splitting these lets
/// the leader write ahead of a slower follower within one flush
/// generation, which a single `pos` field (as named in the minimal data
/// model) cannot express — see `DESIGN.md`.
#[repr(C, align(64))]
pub struct BufferInfo {
    pub lock: AtomicI32,
    pub pos: AtomicU32,
    pub write_pos: AtomicU32,
    pub size: u32,
    pub flush_cnt: AtomicU32,
    pub flushing: AtomicU8,
    pub buffer_kind: u8,
    _pad: [u8; CACHE_LINE - 4 - 4 - 4 - 4 - 4 - 1 - 1],
}

const _: () = assert!(std::mem::size_of::<BufferInfo>() == CACHE_LINE);

impl BufferInfo {
    pub const fn new(size: u32, buffer_kind: u8) -> Self {
        Self {
            lock: AtomicI32::new(1),
            pos: AtomicU32::new(0),
            write_pos: AtomicU32::new(0),
            size,
            flush_cnt: AtomicU32::new(0),
            flushing: AtomicU8::new(0),
            buffer_kind,
            _pad: [0; CACHE_LINE - 4 - 4 - 4 - 4 - 4 - 1 - 1],
        }
    }

    /// Spin-acquire the write lock: only the thread that drives it from 1
    /// to 0 holds it.
    pub fn acquire_lock(&self, spin: crate::config::SpinPolicy) {
        loop {
            if self
                .lock
                .compare_exchange_weak(1, 0, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            crate::config::spin_once(spin);
        }
    }

    pub fn release_lock(&self) {
        self.lock.store(1, Ordering::Release);
    }

    #[inline]
    pub fn pos(&self) -> u32 {
        self.pos.load(Ordering::Acquire)
    }

    #[inline]
    pub fn flush_cnt(&self) -> u32 {
        self.flush_cnt.load(Ordering::Acquire)
    }

    #[inline]
    pub fn write_pos(&self) -> u32 {
        self.write_pos.load(Ordering::Acquire)
    }

    /// Begin a new flush generation: resets both cursors and bumps
    /// `flush_cnt`. Callers must have drained every slot first.
    pub fn start_flush_generation(&self) {
        self.flushing.store(1, Ordering::Release);
        self.pos.store(0, Ordering::Relaxed);
        self.write_pos.store(0, Ordering::Relaxed);
        self.flush_cnt.fetch_add(1, Ordering::Release);
        self.flushing.store(0, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_ring_slot_is_exactly_one_cache_line() {
        assert_eq!(std::mem::size_of::<SyncRingSlot>(), CACHE_LINE);
    }

    #[test]
    fn buffer_info_is_exactly_one_cache_line() {
        assert_eq!(std::mem::size_of::<BufferInfo>(), CACHE_LINE);
    }

    #[test]
    fn slot_starts_uninitialized() {
        let slot = SyncRingSlot::new();
        assert!(!slot.is_initialized());
    }

    #[test]
    fn publish_sets_master_thread_id_last() {
        let slot = SyncRingSlot::new();
        slot.publish(0x1000, 3, 42);
        assert!(slot.is_initialized());
        assert_eq!(slot.master_thread_id.load(Ordering::Relaxed), 42);
        assert_eq!(slot.word_ptr.load(Ordering::Relaxed), 0x1000);
    }

    #[test]
    fn op_type_lsb_marks_store() {
        let slot = SyncRingSlot::new();
        slot.publish(0, 0b1, 1);
        assert!(slot.is_store());
        slot.publish(0, 0b10, 1);
        assert!(!slot.is_store());
    }

    #[test]
    fn lock_is_mutually_exclusive() {
        let info = BufferInfo::new(16, 0);
        info.acquire_lock(crate::config::SpinPolicy::Relax);
        assert_eq!(info.lock.load(Ordering::Relaxed), 0);
        info.release_lock();
        assert_eq!(info.lock.load(Ordering::Relaxed), 1);
    }
}

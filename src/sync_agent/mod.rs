// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Sync Agent: enforces a global order on atomic operations against
//! private, per-variant memory. Three interchangeable [`ReplayStrategy`]
//! implementations exist; exactly one is active per build, selected by a
//! Cargo feature rather than `cfg`-scattered logic throughout the crate.

pub mod partial_order;
pub mod total_order;
pub mod write_once_counter;

use crate::monitor::MonitorClient;
use std::sync::Arc;

/// A prolog/epilog pair wrapping one atomic operation against private
/// memory. `preop` blocks until this operation is the next one the
/// variant is authorized to perform in the agreed order; `postop` is
/// non-blocking bookkeeping run immediately after the real hardware
/// atomic.
pub trait ReplayStrategy: Send + Sync {
    /// Returns an opaque token threaded back through `postop`. Strategies
    /// keep the state needed to resume (slot index, role) in thread-local
    /// storage; the token is only a pairing sanity check.
    fn preop(&self, op_type: u16, word_ptr: u64) -> u8;

    fn postop(&self, token: u8);

    /// Record `value` into the ring as a pseudo-store, for manual
    /// cross-checks of program-level state (`mvee_xcheck`).
    fn xcheck(&self, value: u64);
}

/// Current OS thread id, used to pair a follower thread with the leader
/// thread whose operations it must replay.
#[inline]
pub fn current_tid() -> u32 {
    // SAFETY: gettid() takes no arguments and always succeeds on Linux.
    unsafe { libc::syscall(libc::SYS_gettid) as u32 }
}

/// Facade combining a [`ReplayStrategy`] with the monitor client used for
/// flush/divergence calls that don't belong to any one strategy.
pub struct SyncAgent {
    strategy: Arc<dyn ReplayStrategy>,
    #[allow(dead_code)]
    monitor: Arc<dyn MonitorClient>,
}

impl SyncAgent {
    pub fn new(strategy: Arc<dyn ReplayStrategy>, monitor: Arc<dyn MonitorClient>) -> Self {
        Self { strategy, monitor }
    }

    #[inline]
    pub fn preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        crate::trace_eip!("preop op_type={op_type} word_ptr={word_ptr:#x}");
        self.strategy.preop(op_type, word_ptr)
    }

    #[inline]
    pub fn postop(&self, token: u8) {
        self.strategy.postop(token);
        crate::trace_eip!("postop token={token}");
    }

    #[inline]
    pub fn xcheck(&self, value: u64) {
        self.strategy.xcheck(value);
    }
}

/// Operation-type bit layout shared by every replay discipline: the LSB
/// marks a store (spec §4.A.2, "`op_type`'s LSB encodes whether the op is
/// a store").
#[inline]
pub const fn is_store_op(op_type: u16) -> bool {
    op_type & 1 != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_type_lsb_identifies_stores() {
        assert!(is_store_op(0b001));
        assert!(!is_store_op(0b010));
    }

    #[test]
    fn current_tid_is_nonzero() {
        assert_ne!(current_tid(), 0);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Per-thread producer state, lazily initialized on first use and reset
//! by a fork hook registered with the monitor via `RESET_ATFORK`.

use super::shm_ring::ShmOpRing;
use std::cell::RefCell;

/// Cached state a producer thread needs to avoid re-deriving its buffer
/// attachment and ring position on every call.
pub struct ThreadState {
    pub shm_ring: Option<ShmOpRing>,
    pub prev_pos: u32,
    pub prev_flush_cnt: u32,
    pub master_thread_id: u32,
}

impl ThreadState {
    const fn new() -> Self {
        Self {
            shm_ring: None,
            prev_pos: 0,
            prev_flush_cnt: 0,
            master_thread_id: 0,
        }
    }
}

thread_local! {
    static STATE: RefCell<ThreadState> = RefCell::new(ThreadState::new());
}

/// Run `f` with mutable access to this thread's cached producer state.
pub fn with_state<R>(f: impl FnOnce(&mut ThreadState) -> R) -> R {
    STATE.with(|cell| f(&mut cell.borrow_mut()))
}

/// Invalidate this thread's cached state. Called from the fork hook the
/// monitor installs via `RESET_ATFORK`: the child's copy of a parent
/// thread's shared-buffer attachment is no longer valid (shared memory
/// mappings must be re-established post-fork), and the previous position
/// bookkeeping no longer has meaning.
pub fn reset_atfork() {
    STATE.with(|cell| {
        let mut state = cell.borrow_mut();
        state.shm_ring = None;
        state.prev_pos = 0;
        state.prev_flush_cnt = 0;
        state.master_thread_id = 0;
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_starts_uninitialized() {
        with_state(|s| {
            assert!(s.shm_ring.is_none());
            assert_eq!(s.prev_pos, 0);
        });
    }

    #[test]
    fn reset_atfork_clears_cached_ring_and_positions() {
        with_state(|s| {
            s.prev_pos = 7;
            s.master_thread_id = 42;
        });
        reset_atfork();
        with_state(|s| {
            assert_eq!(s.prev_pos, 0);
            assert_eq!(s.master_thread_id, 0);
        });
    }
}

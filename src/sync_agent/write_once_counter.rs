// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Write-once-counter replay: replaces the ring with a table of `K`
//! per-address-group counters. Each *thread* carries a private queue of
//! `{counter_value << 12 | clock_index}` words, published by the leader
//! and consumed by the paired follower thread strictly in FIFO order —
//! no scanning, no tags, at the cost of a fixed per-thread queue the
//! monitor must flush when full.
//!
//! The queue is genuinely per-OS-thread (`original_source/csu/mvee-woc-agent.c`
//! declares the equivalent state `static __thread`): two application
//! threads racing on one shared queue would interleave each other's
//! leader/follower index assignment and break FIFO pairing. Each thread
//! therefore lazily attaches its own queue on first use, mirroring
//! `crate::shm_agent::protocol::ShmAgent::ensure_ring`.

use super::{current_tid, ReplayStrategy};
use crate::buffer::BufferSegment;
use crate::config::{SpinPolicy, DEFAULT_WOC_QUEUE_LEN, WOC_GROUP_SIZE, WOC_TOTAL_GROUPS};
use crate::error::AgentError;
use crate::monitor::{BufferKind, MonitorClient, VariantIdentity};
use std::cell::RefCell;
use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

/// One counter, CAS-locked by the leader while it is mid-increment.
#[repr(C)]
struct Counter {
    lock: AtomicI32,
    value: AtomicU32,
}

/// `K = 2048` counters partitioned into `WOC_TOTAL_GROUPS` groups of
/// `WOC_GROUP_SIZE`.
struct CounterTable {
    counters: Vec<Counter>,
}

impl CounterTable {
    fn new() -> Self {
        let counters = (0..crate::config::WOC_TOTAL_COUNTERS)
            .map(|_| Counter {
                lock: AtomicI32::new(1),
                value: AtomicU32::new(0),
            })
            .collect();
        Self { counters }
    }

    /// `(word_ptr >> 24) % groups` selects the group; `((word_ptr & 4095)
    /// >> 6) % group_size` selects the slot within it.
    fn index_for(word_ptr: u64) -> usize {
        let group = ((word_ptr >> 24) as usize) % WOC_TOTAL_GROUPS;
        let slot = (((word_ptr & 4095) >> 6) as usize) % WOC_GROUP_SIZE;
        group * WOC_GROUP_SIZE + slot
    }

    fn lock(&self, idx: usize, spin: SpinPolicy) {
        loop {
            if self.counters[idx]
                .lock
                .compare_exchange_weak(1, 0, Ordering::Acquire, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            crate::config::spin_once(spin);
        }
    }

    fn unlock(&self, idx: usize) {
        self.counters[idx].lock.store(1, Ordering::Release);
    }

    fn value(&self, idx: usize) -> u32 {
        self.counters[idx].value.load(Ordering::Acquire)
    }

    fn increment(&self, idx: usize) {
        self.counters[idx].value.fetch_add(1, Ordering::Release);
    }
}

/// `{counter_value << 12 | clock_index}` packed word, per-thread FIFO.
#[repr(transparent)]
struct QueueWord(AtomicU64);

struct ThreadQueue {
    #[allow(dead_code)]
    segment: BufferSegment,
    words: *mut QueueWord,
    capacity: usize,
}

// SAFETY: `words` points into `segment`'s MAP_SHARED region; all access
// goes through the atomics inside `QueueWord`.
unsafe impl Send for ThreadQueue {}
unsafe impl Sync for ThreadQueue {}

impl ThreadQueue {
    fn create(name: &str, capacity: usize) -> crate::error::Result<Self> {
        let bytes = capacity * std::mem::size_of::<QueueWord>();
        let segment = BufferSegment::create(name, bytes)
            .map_err(|e| AgentError::Configuration(format!("woc queue create failed: {e}")))?;
        let words = segment.as_ptr() as *mut QueueWord;
        Ok(Self {
            segment,
            words,
            capacity,
        })
    }

    /// Join a queue a leader thread (or its paired follower, whichever
    /// ran first) already created for this thread pairing.
    fn attach(name: &str, capacity: usize) -> crate::error::Result<Self> {
        let bytes = capacity * std::mem::size_of::<QueueWord>();
        let segment = BufferSegment::open(name, bytes)
            .map_err(|e| AgentError::Configuration(format!("woc queue attach failed: {e}")))?;
        let words = segment.as_ptr() as *mut QueueWord;
        Ok(Self {
            segment,
            words,
            capacity,
        })
    }

    fn slot(&self, idx: usize) -> &QueueWord {
        debug_assert!(idx < self.capacity);
        // SAFETY: idx bounded by capacity, matching the segment's sizing.
        unsafe { &*self.words.add(idx) }
    }
}

/// Biases `counter_value` by one so a packed word is never literally zero
/// (zero is reserved to mean "not yet published" in the queue slot).
fn pack(counter_value: u32, clock_index: usize) -> u64 {
    (((counter_value as u64) + 1) << 12) | (clock_index as u64 & 0xFFF)
}

fn unpack(word: u64) -> (u32, usize) {
    (((word >> 12) - 1) as u32, (word & 0xFFF) as usize)
}

/// Per-thread queue plus this thread's private write/read cursor into it.
struct LocalQueue {
    queue: ThreadQueue,
    pos: u32,
}

thread_local! {
    static LOCAL: RefCell<Option<LocalQueue>> = const { RefCell::new(None) };
    static MASTER_TID: RefCell<Option<u32>> = const { RefCell::new(None) };
}

/// Clear this thread's queue handle and cached master tid. Called after
/// `fork()`, matching the original's `mvee_invalidate_buffer` nulling the
/// thread-local queue pointer for the calling thread.
pub(crate) fn reset_atfork() {
    LOCAL.with(|c| *c.borrow_mut() = None);
    MASTER_TID.with(|c| *c.borrow_mut() = None);
}

pub struct WriteOnceCounterStrategy {
    counters: CounterTable,
    identity: VariantIdentity,
    monitor: Arc<dyn MonitorClient>,
    spin: SpinPolicy,
    local_values: Vec<AtomicU32>,
}

impl WriteOnceCounterStrategy {
    pub fn new(identity: VariantIdentity, monitor: Arc<dyn MonitorClient>) -> Self {
        let local_values = (0..crate::config::WOC_TOTAL_COUNTERS)
            .map(|_| AtomicU32::new(0))
            .collect();
        Self {
            counters: CounterTable::new(),
            identity,
            monitor,
            spin: crate::config::runtime().spin_policy(),
            local_values,
        }
    }

    fn master_tid(&self) -> u32 {
        MASTER_TID.with(|cell| {
            let mut cached = cell.borrow_mut();
            if let Some(tid) = *cached {
                return tid;
            }
            let tid = self.monitor.master_thread_id(current_tid());
            *cached = Some(tid);
            tid
        })
    }

    /// Lazily attach this thread's own queue, keyed by the logical
    /// leader/follower pairing (the leader's tid) rather than by process
    /// id, so the two processes agree on a segment name without a
    /// monitor round trip. Mirrors `ShmAgent::ensure_ring`'s lazy-attach
    /// shape, one level down (per-thread, not per-process).
    fn ensure_queue(&self) {
        let attached = LOCAL.with(|c| c.borrow().is_some());
        if attached {
            return;
        }
        let pairing_tid = if self.identity.is_leader {
            current_tid()
        } else {
            self.master_tid()
        };
        let name = format!("/mvee_woc_queue_{pairing_tid}");
        let result = if self.identity.is_leader {
            ThreadQueue::create(&name, DEFAULT_WOC_QUEUE_LEN)
        } else {
            ThreadQueue::attach(&name, DEFAULT_WOC_QUEUE_LEN)
        };
        let queue = match result {
            Ok(q) => q,
            Err(AgentError::Configuration(_)) => crate::error::fatal_assert(0xC0FF_FFFF),
            Err(AgentError::Divergence { op_type, .. }) => crate::error::fatal_assert(op_type as u64),
        };
        LOCAL.with(|c| *c.borrow_mut() = Some(LocalQueue { queue, pos: 0 }));
    }

    fn leader_preop(&self, word_ptr: u64) -> u8 {
        self.ensure_queue();
        let idx = CounterTable::index_for(word_ptr);
        self.counters.lock(idx, self.spin);
        let value = self.counters.value(idx);

        LOCAL.with(|cell| {
            let mut guard = cell.borrow_mut();
            let local = guard.as_mut().expect("ensure_queue populated this");
            let pos = local.pos as usize;
            if pos >= local.queue.capacity {
                self.monitor.flush_shared_buffer(BufferKind::ShmOpRing);
                local.pos = 1;
                local.queue.slot(0).0.store(pack(value, idx), Ordering::Release);
            } else {
                local.queue.slot(pos).0.store(pack(value, idx), Ordering::Release);
                local.pos += 1;
            }
        });
        idx as u8
    }

    fn leader_postop(&self, idx: u8) {
        self.counters.increment(idx as usize);
        self.counters.unlock(idx as usize);
    }

    fn follower_preop(&self) -> u8 {
        self.ensure_queue();
        let word = LOCAL.with(|cell| {
            let mut guard = cell.borrow_mut();
            let local = guard.as_mut().expect("ensure_queue populated this");
            let pos = local.pos as usize;
            let effective_pos = if pos >= local.queue.capacity { 0 } else { pos };
            local.pos = if pos >= local.queue.capacity { 1 } else { pos as u32 + 1 };

            loop {
                let w = local.queue.slot(effective_pos).0.load(Ordering::Acquire);
                if w != 0 {
                    break w;
                }
                crate::config::spin_once(self.spin);
            }
        });
        let (awaited_value, idx) = unpack(word);

        while self.local_values[idx].load(Ordering::Acquire) != awaited_value {
            crate::config::spin_once(self.spin);
        }
        idx as u8
    }

    fn follower_postop(&self, idx: u8) {
        self.local_values[idx as usize].fetch_add(1, Ordering::Release);
    }
}

impl ReplayStrategy for WriteOnceCounterStrategy {
    fn preop(&self, _op_type: u16, word_ptr: u64) -> u8 {
        if !self.identity.sync_enabled {
            return 0;
        }
        if self.identity.is_leader {
            self.leader_preop(word_ptr)
        } else {
            self.follower_preop()
        }
    }

    fn postop(&self, token: u8) {
        if !self.identity.sync_enabled {
            return;
        }
        if self.identity.is_leader {
            self.leader_postop(token);
        } else {
            self.follower_postop(token);
        }
    }

    fn xcheck(&self, value: u64) {
        if !self.identity.sync_enabled {
            return;
        }
        let token = self.preop(0, value);
        self.postop(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::mock::MockMonitorClient;

    fn identity(is_leader: bool) -> VariantIdentity {
        VariantIdentity {
            sync_enabled: true,
            num_variants: 2,
            variant_index: if is_leader { 0 } else { 1 },
            is_leader,
            infinite_loop_addr: 0,
        }
    }

    #[test]
    fn index_for_is_stable_across_calls() {
        let idx_a = CounterTable::index_for(0xdead_beef);
        let idx_b = CounterTable::index_for(0xdead_beef);
        assert_eq!(idx_a, idx_b);
        assert!(idx_a < crate::config::WOC_TOTAL_COUNTERS);
    }

    #[test]
    fn pack_unpack_roundtrip() {
        let word = pack(7, 42);
        assert_eq!(unpack(word), (7, 42));
    }

    #[test]
    fn leader_increments_counter_after_postop() {
        reset_atfork();
        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let strategy = WriteOnceCounterStrategy::new(identity(true), monitor);
        let idx = CounterTable::index_for(0x4000);
        assert_eq!(strategy.counters.value(idx), 0);
        let token = strategy.preop(0, 0x4000);
        strategy.postop(token);
        assert_eq!(strategy.counters.value(idx), 1);
        reset_atfork();
    }

    #[test]
    fn two_threads_each_attach_their_own_queue() {
        // Two distinct application threads must not collide on a shared
        // queue: each one's leader role gets a segment name keyed by its
        // own tid, so the two never race on one `pos` cursor.
        reset_atfork();
        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let strategy = Arc::new(WriteOnceCounterStrategy::new(identity(true), monitor));

        let s1 = strategy.clone();
        let t1 = std::thread::spawn(move || {
            let tok = s1.preop(0, 0x4000);
            s1.postop(tok);
        });
        let s2 = strategy.clone();
        let t2 = std::thread::spawn(move || {
            let tok = s2.preop(0, 0x8000);
            s2.postop(tok);
        });
        t1.join().unwrap();
        t2.join().unwrap();

        assert_eq!(strategy.counters.value(CounterTable::index_for(0x4000)), 1);
        assert_eq!(strategy.counters.value(CounterTable::index_for(0x8000)), 1);
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Partial-order replay: followers may replay operations out of the
//! leader's wall-clock order as long as the sequence of operations *on
//! each individual address* agrees with the leader. Unrelated addresses
//! commute — a store to `a` never blocks a later-logged load of `b`.

use super::{current_tid, is_store_op, ReplayStrategy};
use crate::buffer::SyncRing;
use crate::config::SpinPolicy;
use crate::monitor::{BufferKind, MonitorClient, VariantIdentity};
use std::cell::RefCell;
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Pending {
    slot_index: u32,
}

thread_local! {
    static PENDING: RefCell<Option<Pending>> = const { RefCell::new(None) };
    static MASTER_TID: RefCell<Option<u32>> = const { RefCell::new(None) };
    // Per-thread consumption cursor: the lowest index not yet known to be
    // fully resolved for this variant. Reset on flush-generation change.
    static PREV_POS: RefCell<u32> = const { RefCell::new(0) };
    static PREV_FLUSH_CNT: RefCell<u32> = const { RefCell::new(0) };
}

pub struct PartialOrderStrategy {
    ring: SyncRing,
    identity: VariantIdentity,
    monitor: Arc<dyn MonitorClient>,
    spin: SpinPolicy,
}

impl PartialOrderStrategy {
    pub fn new(ring: SyncRing, identity: VariantIdentity, monitor: Arc<dyn MonitorClient>) -> Self {
        Self {
            ring,
            identity,
            monitor,
            spin: crate::config::runtime().spin_policy(),
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

    fn leader_preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        let info = self.ring.info();
        info.acquire_lock(self.spin);

        let mut wpos = info.write_pos();
        if wpos >= info.size {
            self.monitor.flush_shared_buffer(BufferKind::SyncRing);
            for i in 0..self.ring.slot_count() {
                self.ring.slot(i).reset();
            }
            info.start_flush_generation();
            PREV_POS.with(|c| *c.borrow_mut() = 0);
            wpos = 0;
        }

        self.ring
            .slot(wpos as usize)
            .publish(word_ptr, op_type, current_tid());
        info.write_pos.fetch_add(1, Ordering::Release);
        info.release_lock();
        wpos as u8
    }

    /// True if slot `i` must be replayed by this variant before a
    /// `word_ptr`-targeting op of kind `is_store` may proceed.
    fn blocks(&self, i: u32, word_ptr: u64, is_store: bool, variant_index: usize) -> bool {
        let slot = self.ring.slot(i as usize);
        if !slot.is_initialized() {
            return false;
        }
        if slot.tag(variant_index) {
            return false;
        }
        let logged_ptr = slot.word_ptr.load(Ordering::Acquire);
        if logged_ptr != word_ptr {
            return false;
        }
        // A store waits on every untagged preceding op (load or store) on
        // the same address; a load waits only on untagged preceding
        // stores.
        is_store || slot.is_store()
    }

    fn follower_preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        let my_master_tid = self.master_tid();
        let variant_index = self.identity.variant_index as usize;
        let is_store = is_store_op(op_type);

        let flush_cnt = self.ring.info().flush_cnt();
        let starting_prev_flush = PREV_FLUSH_CNT.with(|c| *c.borrow());
        if flush_cnt != starting_prev_flush {
            PREV_POS.with(|c| *c.borrow_mut() = 0);
            PREV_FLUSH_CNT.with(|c| *c.borrow_mut() = flush_cnt);
        }

        loop {
            let info = self.ring.info();
            let start = PREV_POS.with(|c| *c.borrow()).max(info.pos());
            let write_pos = info.write_pos();

            let mut target: Option<u32> = None;
            for i in start..write_pos {
                let slot = self.ring.slot(i as usize);
                if slot.tag(variant_index) {
                    continue;
                }
                let logged_tid = slot.master_thread_id.load(Ordering::Acquire);
                if logged_tid == my_master_tid
                    && slot.word_ptr.load(Ordering::Acquire) == word_ptr
                {
                    target = Some(i);
                    break;
                }
            }

            let Some(target_index) = target else {
                crate::config::spin_once(self.spin);
                continue;
            };

            let mut blocked = false;
            for i in start..target_index {
                if self.blocks(i, word_ptr, is_store, variant_index) {
                    blocked = true;
                    break;
                }
            }
            if blocked {
                crate::config::spin_once(self.spin);
                continue;
            }

            return target_index as u8;
        }
    }
}

impl ReplayStrategy for PartialOrderStrategy {
    fn preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        if !self.identity.sync_enabled {
            return 0;
        }
        let slot_index = if self.identity.is_leader {
            self.leader_preop(op_type, word_ptr)
        } else {
            self.follower_preop(op_type, word_ptr)
        };
        PENDING.with(|c| {
            *c.borrow_mut() = Some(Pending {
                slot_index: slot_index as u32,
            })
        });
        slot_index
    }

    fn postop(&self, _token: u8) {
        if !self.identity.sync_enabled || self.identity.is_leader {
            PENDING.with(|c| *c.borrow_mut() = None);
            return;
        }
        let Some(pending) = PENDING.with(|c| c.borrow_mut().take()) else {
            return;
        };
        let variant_index = self.identity.variant_index as usize;
        self.ring.slot(pending.slot_index as usize).set_tag(variant_index);

        // Opportunistic advance of the shared consumption cursor: best
        // effort, must not fight a concurrent flush.
        let info = self.ring.info();
        let cur = info.pos();
        if pending.slot_index == cur {
            let _ = info.pos.compare_exchange(
                cur,
                cur + 1,
                Ordering::Release,
                Ordering::Relaxed,
            );
        }
        PREV_POS.with(|c| {
            let mut p = c.borrow_mut();
            *p = (*p).max(pending.slot_index + 1);
        });
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

    fn identity(variant_index: u16, is_leader: bool) -> VariantIdentity {
        VariantIdentity {
            sync_enabled: true,
            num_variants: 2,
            variant_index,
            is_leader,
            infinite_loop_addr: 0,
        }
    }

    const STORE: u16 = 0b1;

    #[test]
    fn s2_partial_order_commutes_unrelated_addresses() {
        let name = "/mvee_agent_test_partial_order_s2";
        let ring_leader = SyncRing::create(name, 8).unwrap();
        let monitor = Arc::new(MockMonitorClient::new(identity(0, true)));

        let leader = PartialOrderStrategy::new(ring_leader, identity(0, true), monitor.clone());
        let addr_a: u64 = 0x1000;
        let addr_b: u64 = 0x2000;
        let tok = leader.preop(STORE, addr_a);
        leader.postop(tok);
        let tok = leader.preop(STORE, addr_b);
        leader.postop(tok);

        let ring_follower = SyncRing::attach(name, 8).unwrap();
        let follower = PartialOrderStrategy::new(ring_follower, identity(1, false), monitor);

        // Follower replays b first, then a: must not block on either,
        // since the addresses are unrelated.
        let tok_b = follower.preop(STORE, addr_b);
        follower.postop(tok_b);
        let tok_a = follower.preop(STORE, addr_a);
        follower.postop(tok_a);

        assert!(follower.ring.slot(tok_b as usize).tag(1));
        assert!(follower.ring.slot(tok_a as usize).tag(1));

        leader.ring.unlink();
    }
}

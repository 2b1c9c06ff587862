// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Total-order replay: a single global linearization of every atomic op,
//! enforced through one shared ring buffer.
//!
//! `info.write_pos` is the leader's allocation cursor (how many slots it
//! has published so far this flush generation); `info.pos` is the shared
//! consumption cursor, advanced by whichever follower thread replays the
//! slot it currently points at. Splitting these lets the leader publish
//! ahead of a slower follower within one generation — see `DESIGN.md` for
//! why the minimal one-field model in the data spec doesn't support that.

use super::{current_tid, ReplayStrategy};
use crate::buffer::SyncRing;
use crate::config::SpinPolicy;
#[cfg(feature = "check-lock-type")]
use crate::error::DivergenceReason;
use crate::monitor::{BufferKind, MonitorClient, VariantIdentity};
use std::cell::RefCell;
use std::sync::Arc;

struct Pending {
    slot_index: u32,
    is_leader: bool,
}

thread_local! {
    static PENDING: RefCell<Option<Pending>> = const { RefCell::new(None) };
    static MASTER_TID: RefCell<Option<u32>> = const { RefCell::new(None) };
}

pub struct TotalOrderStrategy {
    ring: SyncRing,
    identity: VariantIdentity,
    monitor: Arc<dyn MonitorClient>,
    spin: SpinPolicy,
}

impl TotalOrderStrategy {
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
            // Leader can't get ahead of a flush: wait for the follower to
            // finish draining this generation before starting a new one.
            while info.pos() < info.size {
                crate::config::spin_once(self.spin);
            }
            self.monitor.flush_shared_buffer(BufferKind::SyncRing);
            for i in 0..self.ring.slot_count() {
                self.ring.slot(i).reset();
            }
            info.start_flush_generation();
            wpos = 0;
        }

        self.ring
            .slot(wpos as usize)
            .publish(word_ptr, op_type, current_tid());
        info.write_pos.fetch_add(1, std::sync::atomic::Ordering::Release);
        info.release_lock();

        PENDING.with(|c| {
            *c.borrow_mut() = Some(Pending {
                slot_index: wpos,
                is_leader: true,
            })
        });
        1
    }

    fn follower_preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        let info = self.ring.info();
        let my_master_tid = self.master_tid();
        let slot_index = loop {
            let idx = info.pos();
            if idx >= info.size {
                crate::config::spin_once(self.spin);
                continue;
            }
            let slot = self.ring.slot(idx as usize);
            if slot.is_initialized()
                && slot.master_thread_id.load(std::sync::atomic::Ordering::Acquire) == my_master_tid
            {
                #[cfg(feature = "check-lock-type")]
                {
                    let logged_word_ptr = slot.word_ptr.load(std::sync::atomic::Ordering::Relaxed);
                    let logged_op_type = slot.operation_type.load(std::sync::atomic::Ordering::Relaxed);
                    if logged_word_ptr != word_ptr || logged_op_type != op_type {
                        self.monitor.report_divergence(
                            DivergenceReason::AddressMismatch,
                            op_type,
                            &[logged_word_ptr, word_ptr],
                        );
                    }
                }
                let _ = (op_type, word_ptr);
                break idx;
            }
            crate::config::spin_once(self.spin);
        };

        PENDING.with(|c| {
            *c.borrow_mut() = Some(Pending {
                slot_index,
                is_leader: false,
            })
        });
        1
    }
}

impl ReplayStrategy for TotalOrderStrategy {
    fn preop(&self, op_type: u16, word_ptr: u64) -> u8 {
        if !self.identity.sync_enabled {
            return 0;
        }
        if self.identity.is_leader {
            self.leader_preop(op_type, word_ptr)
        } else {
            self.follower_preop(op_type, word_ptr)
        }
    }

    fn postop(&self, _token: u8) {
        if !self.identity.sync_enabled {
            return;
        }
        let Some(pending) = PENDING.with(|c| c.borrow_mut().take()) else {
            return;
        };
        if pending.is_leader {
            return;
        }

        let info = self.ring.info();
        let new_pos = info.pos.fetch_add(1, std::sync::atomic::Ordering::Release) + 1;
        if new_pos >= info.size {
            self.monitor.flush_shared_buffer(BufferKind::SyncRing);
        }
    }

    fn xcheck(&self, value: u64) {
        if !self.identity.sync_enabled {
            return;
        }
        // A pseudo-store: reuse the leader/follower paths with a
        // reserved op_type (0, not a real store/load, just a value log).
        let token = self.preop(0, value);
        self.postop(token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::mock::MockMonitorClient;

    fn identity(num_variants: u16, variant_index: u16, is_leader: bool) -> VariantIdentity {
        VariantIdentity {
            sync_enabled: true,
            num_variants,
            variant_index,
            is_leader,
            infinite_loop_addr: 0,
        }
    }

    #[test]
    fn s1_total_order_replay_leader_then_follower() {
        let name = "/mvee_agent_test_total_order_s1";
        let ring_leader = SyncRing::create(name, 4).unwrap();
        let monitor = Arc::new(MockMonitorClient::new(identity(2, 0, true)));

        let leader = TotalOrderStrategy::new(ring_leader, identity(2, 0, true), monitor.clone());
        let tok = leader.preop(0b11, 0xAAAA);
        // caller's "actual atomic" happens here
        leader.postop(tok);

        let ring_follower = SyncRing::attach(name, 4).unwrap();
        let follower = TotalOrderStrategy::new(ring_follower, identity(2, 1, false), monitor);

        assert_eq!(follower.ring.info().pos(), 0);
        let ftok = follower.preop(0b11, 0xAAAA);
        let matched = follower.ring.slot(0);
        assert!(matched.is_initialized());
        follower.postop(ftok);
        assert_eq!(follower.ring.info().pos(), 1);

        leader.ring.unlink();
    }
}

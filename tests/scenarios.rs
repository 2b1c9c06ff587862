// SPDX-License-Identifier: Apache-2.0 OR MIT

//! End-to-end scenarios driving [`mvee_agent::shm_agent::ShmAgent`] and
//! [`mvee_agent::sync_agent`] strategies the way a leader/follower pair of
//! variant threads would, without any real monitor process.

use mvee_agent::monitor::mock::MockMonitorClient;
use mvee_agent::monitor::VariantIdentity;
use mvee_agent::shm_agent::{OpCode, ShmAgent};
use std::sync::Arc;

fn identity(is_leader: bool) -> VariantIdentity {
    VariantIdentity {
        sync_enabled: true,
        num_variants: 2,
        variant_index: if is_leader { 0 } else { 1 },
        is_leader,
        infinite_loop_addr: 0,
    }
}

fn mapped_region(len: usize) -> (Vec<u8>, Vec<u8>, usize) {
    let real = vec![0u8; len];
    let shadow = vec![0u8; len];
    let real_base = real.as_ptr() as usize;
    (real, shadow, real_base)
}

/// S3: a process outside the MVEE mutated shared memory behind the
/// leader's back; the next load must observe the real value and fix up
/// the shadow to match.
#[test]
fn s3_shm_load_observes_external_mutation() {
    let (mut real, mut shadow, _) = mapped_region(8);
    let real_base = real.as_mut_ptr() as usize;
    let shadow_base = shadow.as_mut_ptr() as usize;
    mvee_agent::mapping::global()
        .insert(mvee_agent::mapping::MappingEntry {
            real_base,
            shadow_base: Some(shadow_base),
            length: 8,
        })
        .unwrap();

    unsafe {
        *(shadow_base as *mut u32) = 7;
        *(real_base as *mut u32) = 99;
    }

    let monitor = Arc::new(MockMonitorClient::new(identity(true)));
    let leader = ShmAgent::new(identity(true), monitor, 0, 0);
    let result = leader.shm_op(OpCode::Load, real_base, 4, 0, 0).unwrap();
    assert_eq!(result.val, 99);
    unsafe { assert_eq!(*(shadow_base as *const u32), 99) };

    mvee_agent::mapping::global().delete(real_base);
}

/// S5: the per-thread SHM-op ring is sized far smaller than a batch of
/// ops; every op must still complete by flushing and restarting the ring
/// rather than stalling or erroring.
#[test]
fn s5_ring_exhaustion_flushes_and_restarts() {
    let original = mvee_agent::config::runtime().shm_ring_bytes();
    mvee_agent::config::runtime().set_shm_ring_bytes(256);

    let (mut real, mut shadow, _) = mapped_region(4096);
    let real_base = real.as_mut_ptr() as usize;
    let shadow_base = shadow.as_mut_ptr() as usize;
    mvee_agent::mapping::global()
        .insert(mvee_agent::mapping::MappingEntry {
            real_base,
            shadow_base: Some(shadow_base),
            length: 4096,
        })
        .unwrap();

    let monitor = Arc::new(MockMonitorClient::new(identity(true)));
    let leader = ShmAgent::new(identity(true), monitor, 0, 0);

    for i in 0..64u64 {
        leader.memset(real_base + (i as usize * 16), i as u8, 16).unwrap();
    }
    for i in 0..64usize {
        assert_eq!(real[i * 16], i as u8);
    }

    mvee_agent::mapping::global().delete(real_base);
    mvee_agent::config::runtime().set_shm_ring_bytes(original);
}

/// S4: two buffers holding the same canonical pointer, tagged
/// differently, reconcile as equivalent — a divergence check over
/// payloads must not fire just because shared-memory and shadow
/// addresses differ.
#[test]
fn s4_pointer_tagged_payloads_are_equivalent_across_variants() {
    let monitor = Arc::new(MockMonitorClient::new(identity(true)));
    let leader = ShmAgent::new(identity(true), monitor, 0x1111_0000, 0x2222_0000);

    let canonical: u64 = 0x0000_7f00_1234_0000;
    let leader_word = mvee_agent::addr::encode(canonical, 0x2222_0000);
    let local_word = mvee_agent::addr::encode(canonical, 0x1111_0000);

    assert!(leader.payload_matches(&local_word.to_ne_bytes(), &leader_word.to_ne_bytes(), true));
    assert!(!leader.payload_matches(&local_word.to_ne_bytes(), &leader_word.to_ne_bytes(), false));
}

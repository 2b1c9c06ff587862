// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The three-phase leader/follower protocol mediating every op against
//! externally-shared memory (spec §4.B.1): equivalence check, unique
//! access, follower replay.

use super::atomics::{self, RmwOp, Width};
use super::op_slot::{ShmOpSlot, REPLICATION_FROM_BUFFER};
use super::pointer_eq;
use super::shadow::ShadowView;
use super::OpCode;
use crate::buffer::thread_state;
use crate::buffer::ShmOpRing;
use crate::config::SpinPolicy;
use crate::error::{fatal_assert, AgentError, DivergenceReason, Result};
use crate::mapping::MappingTable;
use crate::monitor::{BufferKind, MonitorClient, VariantIdentity};
use std::sync::Arc;

/// Return value of [`ShmAgent::shm_op`], mirroring `mvee_shm_op`'s
/// `{val, cmp}` pair (spec §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShmOpResult {
    pub val: u64,
    pub cmp: bool,
}

/// Mediates every load/store/atomic/`mem*`/`str*` directed at memory
/// shared with processes outside the MVEE.
pub struct ShmAgent {
    identity: VariantIdentity,
    monitor: Arc<dyn MonitorClient>,
    mapping: &'static MappingTable,
    shm_tag: u64,
    leader_shm_tag: u64,
    spin: SpinPolicy,
}

fn width_bytes(width: Width) -> usize {
    match width {
        Width::W1 => 1,
        Width::W2 => 2,
        Width::W4 => 4,
        Width::W8 => 8,
    }
}

fn u64_to_width_bytes(value: u64, width: Width) -> Vec<u8> {
    value.to_ne_bytes()[..width_bytes(width)].to_vec()
}

fn width_bytes_to_u64(bytes: &[u8], width: Width) -> u64 {
    let mut buf = [0u8; 8];
    buf[..width_bytes(width)].copy_from_slice(&bytes[..width_bytes(width)]);
    u64::from_ne_bytes(buf)
}

fn to_rmw_op(op: OpCode) -> RmwOp {
    match op {
        OpCode::AtomicXchg => RmwOp::Xchg,
        OpCode::AtomicAdd => RmwOp::Add,
        OpCode::AtomicSub => RmwOp::Sub,
        OpCode::AtomicAnd => RmwOp::And,
        OpCode::AtomicNand => RmwOp::Nand,
        OpCode::AtomicOr => RmwOp::Or,
        OpCode::AtomicXor => RmwOp::Xor,
        other => fatal_assert(other as u64),
    }
}

impl ShmAgent {
    pub fn new(identity: VariantIdentity, monitor: Arc<dyn MonitorClient>, shm_tag: u64, leader_shm_tag: u64) -> Self {
        Self {
            identity,
            monitor,
            mapping: crate::mapping::global(),
            shm_tag,
            leader_shm_tag,
            spin: crate::config::runtime().spin_policy(),
        }
    }

    fn wait_published(&self, slot: &ShmOpSlot) {
        while slot.variants_checked() == 0 {
            crate::config::spin_once(self.spin);
        }
    }

    fn wait_all_checked(&self, slot: &ShmOpSlot) {
        while slot.variants_checked() < self.identity.num_variants {
            crate::config::spin_once(self.spin);
        }
    }

    fn wait_replicated(&self, slot: &ShmOpSlot) -> u8 {
        loop {
            let r = slot.replication_type();
            if r != 0 {
                return r;
            }
            crate::config::spin_once(self.spin);
        }
    }

    fn check_request_matches(&self, slot: &ShmOpSlot, op: OpCode, in_addr: u64, out_addr: u64, size: u64) {
        if slot.in_addr() != in_addr || slot.out_addr() != out_addr || slot.size() != size || slot.op_type() != op as u8
        {
            self.monitor.report_divergence(
                DivergenceReason::AddressMismatch,
                op as u16,
                &[slot.in_addr(), in_addr, slot.size(), size],
            );
        }
    }

    /// Compares a follower's own locally-read/computed input against the
    /// leader's published bytes, raising `PayloadMismatch` when they
    /// disagree and the runtime switch is enabled (spec §9(c)). Tolerance
    /// follows whichever value the leader published for this op in
    /// [`ShmOpSlot::pointer_equivalence_enabled`].
    fn check_payload_matches(&self, op: OpCode, addr: u64, local: &[u8], leader: &[u8], tolerance: bool) {
        if !crate::config::runtime().payload_check_enabled() {
            return;
        }
        if !self.payload_matches(local, leader, tolerance) {
            self.monitor
                .report_divergence(DivergenceReason::PayloadMismatch, op as u16, &[addr]);
        }
    }

    fn ensure_ring(&self) -> Result<()> {
        thread_state::with_state(|s| {
            if s.shm_ring.is_some() {
                return Ok(());
            }
            let bytes = crate::config::runtime().shm_ring_bytes();
            let handle = self.monitor.get_shared_buffer(BufferKind::ShmOpRing, bytes as u32);
            let name = format!("/mvee_shm_op_ring_{}", handle.ipc_key);
            let ring = if self.identity.is_leader {
                ShmOpRing::create(&name, bytes)?
            } else {
                ShmOpRing::attach(&name, bytes)?
            };
            s.shm_ring = Some(ring);
            Ok(())
        })
    }

    /// Carve a slot of `payload_len` bytes from this thread's ring,
    /// flushing and restarting if the ring is full (spec §4.D).
    fn carve_slot(&self, payload_len: usize) -> Result<ShmOpSlot> {
        self.ensure_ring()?;
        thread_state::with_state(|s| {
            let ring = s.shm_ring.as_mut().expect("ensure_ring populated this");
            let needed = ShmOpSlot::total_len(payload_len);
            loop {
                if let Some((ptr, _offset)) = ring.carve(needed) {
                    // SAFETY: `carve` guarantees `needed` live bytes at `ptr`.
                    return Ok(unsafe { ShmOpSlot::at(ptr, payload_len) });
                }
                self.monitor.flush_shared_buffer(BufferKind::ShmOpRing);
                ring.reset();
            }
        })
    }

    fn shadow_for(&self, real_addr: usize) -> Result<ShadowView> {
        match self.mapping.lookup(real_addr) {
            Some(entry) => Ok(ShadowView::new(entry)),
            None => fatal_assert(real_addr as u64),
        }
    }

    /// `mvee_shm_op`: load/store/atomic entry point (spec §6).
    pub fn shm_op(&self, op: OpCode, real_addr: usize, size: u64, value: u64, cmp_value: u64) -> Result<ShmOpResult> {
        if op.is_unsupported_rmw() || (op as u8) >= super::GLIBC_FUNC_BASE {
            fatal_assert(op as u64);
        }
        let width = match Width::from_size(size) {
            Ok(w) => w,
            Err(_) => fatal_assert(size),
        };
        let shadow = self.shadow_for(real_addr)?;
        let payload_len = match op {
            OpCode::Load | OpCode::AtomicLoad => width_bytes(width),
            OpCode::AtomicCmpXchg => width_bytes(width) * 2,
            _ if op.is_atomic_rmw() => width_bytes(width) * 2,
            _ => 0,
        };
        let slot = self.carve_slot(payload_len)?;
        let pointer_equivalence = matches!(op, OpCode::Load | OpCode::AtomicLoad | OpCode::AtomicCmpXchg);

        if self.identity.is_leader {
            slot.publish_request(real_addr as u64, real_addr as u64, size, value, cmp_value, op as u8, pointer_equivalence);
            self.leader_execute(op, real_addr, &shadow, width, value, cmp_value, &slot)
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, op, real_addr as u64, real_addr as u64, size);
            if op.writes_shared_memory() {
                slot.ack_write_capable();
            }
            self.wait_replicated(&slot);
            self.follower_replay(op, real_addr, &shadow, width, value, cmp_value, &slot)
        }
    }

    fn leader_execute(
        &self,
        op: OpCode,
        real_addr: usize,
        shadow: &ShadowView,
        width: Width,
        value: u64,
        cmp_value: u64,
        slot: &ShmOpSlot,
    ) -> Result<ShmOpResult> {
        if op.writes_shared_memory() {
            self.wait_all_checked(slot);
        }
        let real_ptr = real_addr as *mut u8;
        match op {
            OpCode::Load | OpCode::AtomicLoad => {
                // SAFETY: `real_ptr` is covered by a live mapping entry.
                let val = unsafe { atomics::load(real_ptr, width) };
                if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                    // SAFETY: shadow attachment mirrors the real region.
                    let shadow_val = unsafe { atomics::load(shadow_ptr, width) };
                    if shadow_val == val {
                        slot.publish_from_shadow();
                    } else {
                        unsafe { atomics::store(shadow_ptr, width, val) };
                        slot.payload_mut().copy_from_slice(&u64_to_width_bytes(val, width));
                        slot.publish_from_buffer();
                    }
                } else {
                    slot.payload_mut().copy_from_slice(&u64_to_width_bytes(val, width));
                    slot.publish_from_buffer();
                }
                Ok(ShmOpResult { val, cmp: false })
            }
            OpCode::Store | OpCode::AtomicStore => {
                // SAFETY: see above.
                unsafe {
                    if op == OpCode::AtomicStore {
                        atomics::store(real_ptr, width, value);
                    } else {
                        std::ptr::copy_nonoverlapping(
                            u64_to_width_bytes(value, width).as_ptr(),
                            real_ptr,
                            width_bytes(width),
                        );
                    }
                }
                shadow.write(real_addr, &u64_to_width_bytes(value, width));
                slot.publish_from_shadow();
                Ok(ShmOpResult { val: value, cmp: false })
            }
            OpCode::AtomicCmpXchg => {
                // SAFETY: see above.
                let (prev, ok) = unsafe { atomics::cmpxchg(real_ptr, width, cmp_value, value) };
                self.reconcile_write_result(shadow, real_addr, width, slot, prev, |shadow_ptr| unsafe {
                    atomics::cmpxchg(shadow_ptr, width, cmp_value, value);
                });
                Ok(ShmOpResult { val: prev, cmp: ok })
            }
            _ if op.is_atomic_rmw() => {
                let rmw_op = to_rmw_op(op);
                // SAFETY: see above.
                let prev = unsafe { atomics::rmw(real_ptr, width, rmw_op, value) };
                self.reconcile_write_result(shadow, real_addr, width, slot, prev, |shadow_ptr| unsafe {
                    atomics::rmw(shadow_ptr, width, rmw_op, value);
                });
                Ok(ShmOpResult { val: prev, cmp: false })
            }
            _ => unreachable!("glibc-block ops use dedicated methods"),
        }
    }

    /// Applies the same write to the shadow copy (if one exists), and
    /// publishes `{prev, final}` bytes whenever the shadow's outcome
    /// ends up disagreeing with the real access — the spec's "shadow is
    /// fixed up by copying the shared previous value into the buffer"
    /// (§4.B.1), generalized to also carry the post-state so followers
    /// without their own working shadow CAS can still replay exactly.
    fn reconcile_write_result(
        &self,
        shadow: &ShadowView,
        real_addr: usize,
        width: Width,
        slot: &ShmOpSlot,
        real_prev: u64,
        apply_to_shadow: impl FnOnce(*mut u8),
    ) {
        // SAFETY: `real_addr` already validated by a mapping lookup.
        let real_final = unsafe { atomics::load(real_addr as *mut u8, width) };
        match shadow.shadow_ptr(real_addr) {
            Some(shadow_ptr) => {
                apply_to_shadow(shadow_ptr);
                // SAFETY: shadow attachment mirrors the real region.
                let shadow_final = unsafe { atomics::load(shadow_ptr, width) };
                if shadow_final == real_final {
                    slot.publish_from_shadow();
                } else {
                    unsafe { atomics::store(shadow_ptr, width, real_final) };
                    self.publish_prev_and_final(slot, width, real_prev, real_final);
                }
            }
            None => self.publish_prev_and_final(slot, width, real_prev, real_final),
        }
    }

    fn publish_prev_and_final(&self, slot: &ShmOpSlot, width: Width, prev: u64, final_value: u64) {
        let n = width_bytes(width);
        let payload = slot.payload_mut();
        payload[..n].copy_from_slice(&u64_to_width_bytes(prev, width));
        payload[n..2 * n].copy_from_slice(&u64_to_width_bytes(final_value, width));
        slot.publish_from_buffer();
    }

    fn follower_replay(
        &self,
        op: OpCode,
        real_addr: usize,
        shadow: &ShadowView,
        width: Width,
        value: u64,
        cmp_value: u64,
        slot: &ShmOpSlot,
    ) -> Result<ShmOpResult> {
        match op {
            OpCode::Load | OpCode::AtomicLoad => {
                let val = if slot.replication_type() == REPLICATION_FROM_BUFFER {
                    let v = width_bytes_to_u64(slot.payload(), width);
                    if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                        // SAFETY: shadow attachment mirrors the real region.
                        unsafe { atomics::store(shadow_ptr, width, v) };
                    }
                    v
                } else if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                    // SAFETY: see above.
                    unsafe { atomics::load(shadow_ptr, width) }
                } else {
                    0
                };
                Ok(ShmOpResult { val, cmp: false })
            }
            OpCode::Store | OpCode::AtomicStore => {
                let local_bytes = u64_to_width_bytes(value, width);
                let leader_bytes = u64_to_width_bytes(slot.value(), width);
                self.check_payload_matches(
                    op,
                    real_addr as u64,
                    &local_bytes,
                    &leader_bytes,
                    slot.pointer_equivalence_enabled(),
                );
                shadow.write(real_addr, &leader_bytes);
                Ok(ShmOpResult { val: slot.value(), cmp: false })
            }
            OpCode::AtomicCmpXchg => {
                let local_cmp = u64_to_width_bytes(cmp_value, width);
                let leader_cmp = u64_to_width_bytes(slot.cmp(), width);
                self.check_payload_matches(
                    op,
                    real_addr as u64,
                    &local_cmp,
                    &leader_cmp,
                    slot.pointer_equivalence_enabled(),
                );
                let local_value = u64_to_width_bytes(value, width);
                let leader_value = u64_to_width_bytes(slot.value(), width);
                self.check_payload_matches(
                    op,
                    real_addr as u64,
                    &local_value,
                    &leader_value,
                    slot.pointer_equivalence_enabled(),
                );
                if slot.replication_type() == REPLICATION_FROM_BUFFER {
                    let n = width_bytes(width);
                    let prev = width_bytes_to_u64(&slot.payload()[..n], width);
                    let final_value = width_bytes_to_u64(&slot.payload()[n..2 * n], width);
                    if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                        // SAFETY: see above.
                        unsafe { atomics::store(shadow_ptr, width, final_value) };
                    }
                    Ok(ShmOpResult { val: prev, cmp: final_value == slot.value() })
                } else if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                    // SAFETY: see above.
                    let (prev, ok) = unsafe { atomics::cmpxchg(shadow_ptr, width, slot.cmp(), slot.value()) };
                    Ok(ShmOpResult { val: prev, cmp: ok })
                } else {
                    Ok(ShmOpResult { val: 0, cmp: false })
                }
            }
            _ if op.is_atomic_rmw() => {
                let local_value = u64_to_width_bytes(value, width);
                let leader_value = u64_to_width_bytes(slot.value(), width);
                self.check_payload_matches(
                    op,
                    real_addr as u64,
                    &local_value,
                    &leader_value,
                    slot.pointer_equivalence_enabled(),
                );
                if slot.replication_type() == REPLICATION_FROM_BUFFER {
                    let n = width_bytes(width);
                    let prev = width_bytes_to_u64(&slot.payload()[..n], width);
                    let final_value = width_bytes_to_u64(&slot.payload()[n..2 * n], width);
                    if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                        // SAFETY: see above.
                        unsafe { atomics::store(shadow_ptr, width, final_value) };
                    }
                    Ok(ShmOpResult { val: prev, cmp: false })
                } else if let Some(shadow_ptr) = shadow.shadow_ptr(real_addr) {
                    let rmw_op = to_rmw_op(op);
                    // SAFETY: see above.
                    let prev = unsafe { atomics::rmw(shadow_ptr, width, rmw_op, slot.value()) };
                    Ok(ShmOpResult { val: prev, cmp: false })
                } else {
                    Ok(ShmOpResult { val: 0, cmp: false })
                }
            }
            _ => unreachable!("glibc-block ops use dedicated methods"),
        }
    }

    /// Shared shape for `memcpy`/`memmove`/`memset`: leader waits for
    /// every follower's equivalence ack, performs the real write plus
    /// the shadow mirror, then buffers the bytes written for replay;
    /// followers replay only into their own shadow.
    fn bulk_write(&self, op: OpCode, dst: usize, size: u64, fill: impl FnOnce() -> Vec<u8>) -> Result<()> {
        let shadow = self.shadow_for(dst)?;
        let slot = self.carve_slot(size as usize)?;

        if self.identity.is_leader {
            slot.publish_request(dst as u64, dst as u64, size, 0, 0, op as u8, false);
            self.wait_all_checked(&slot);
            let bytes = fill();
            // SAFETY: `dst` validated by a mapping lookup; `bytes.len() ==
            // size` by construction of `fill`.
            unsafe { std::ptr::copy(bytes.as_ptr(), dst as *mut u8, bytes.len()) };
            shadow.write(dst, &bytes);
            slot.payload_mut().copy_from_slice(&bytes);
            slot.publish_from_buffer();
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, op, dst as u64, dst as u64, size);
            let local = fill();
            self.check_payload_matches(op, dst as u64, &local, slot.payload(), false);
            slot.ack_write_capable();
            self.wait_replicated(&slot);
            shadow.write(dst, slot.payload());
        }
        Ok(())
    }

    pub fn memcpy(&self, dst: usize, src: usize, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.bulk_write(OpCode::Memcpy, dst, size, || {
            // SAFETY: caller (the instrumented program) guarantees `src`
            // is readable for `size` bytes.
            unsafe { std::slice::from_raw_parts(src as *const u8, size as usize).to_vec() }
        })
    }

    pub fn memmove(&self, dst: usize, src: usize, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        // Reading into an owned `Vec` before writing `dst` makes overlap
        // safe without a separate relax-to-memcpy path.
        self.bulk_write(OpCode::Memmove, dst, size, || {
            // SAFETY: see `memcpy`.
            unsafe { std::slice::from_raw_parts(src as *const u8, size as usize).to_vec() }
        })
    }

    pub fn memset(&self, dst: usize, byte: u8, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        self.bulk_write(OpCode::Memset, dst, size, || vec![byte; size as usize])
    }

    pub fn memcmp(&self, a: usize, b: usize, size: u64) -> Result<i32> {
        if size == 0 {
            return Ok(0);
        }
        let slot = self.carve_slot(0)?;
        if self.identity.is_leader {
            // SAFETY: caller guarantees both ranges are readable.
            let (sa, sb) = unsafe {
                (
                    std::slice::from_raw_parts(a as *const u8, size as usize),
                    std::slice::from_raw_parts(b as *const u8, size as usize),
                )
            };
            let result = match sa.cmp(sb) {
                std::cmp::Ordering::Less => -1i32,
                std::cmp::Ordering::Equal => 0,
                std::cmp::Ordering::Greater => 1,
            };
            slot.publish_request(a as u64, b as u64, size, result as i64 as u64, 0, OpCode::Memcmp as u8, false);
            slot.publish_from_buffer();
            Ok(result)
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, OpCode::Memcmp, a as u64, b as u64, size);
            self.wait_replicated(&slot);
            Ok(slot.value() as i64 as i32)
        }
    }

    pub fn memchr(&self, addr: usize, byte: u8, size: u64) -> Result<Option<u64>> {
        if size == 0 {
            return Ok(None);
        }
        const NOT_FOUND: u64 = u64::MAX;
        let slot = self.carve_slot(0)?;
        if self.identity.is_leader {
            // SAFETY: caller guarantees the range is readable.
            let buf = unsafe { std::slice::from_raw_parts(addr as *const u8, size as usize) };
            let pos = buf.iter().position(|&b| b == byte).map_or(NOT_FOUND, |p| p as u64);
            slot.publish_request(addr as u64, pos, size, byte as u64, 0, OpCode::Memchr as u8, false);
            slot.publish_from_buffer();
            Ok((pos != NOT_FOUND).then_some(pos))
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, OpCode::Memchr, addr as u64, slot.out_addr(), size);
            self.wait_replicated(&slot);
            let pos = slot.out_addr();
            Ok((pos != NOT_FOUND).then_some(pos))
        }
    }

    pub fn strlen(&self, addr: usize) -> Result<u64> {
        let slot = self.carve_slot(0)?;
        if self.identity.is_leader {
            // SAFETY: caller guarantees a NUL-terminated string at `addr`.
            let len = unsafe { libc::strlen(addr as *const libc::c_char) } as u64;
            slot.publish_request(addr as u64, addr as u64, 0, len, 0, OpCode::Strlen as u8, false);
            slot.publish_from_buffer();
            Ok(len)
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, OpCode::Strlen, addr as u64, addr as u64, 0);
            self.wait_replicated(&slot);
            Ok(slot.value())
        }
    }

    pub fn strcmp(&self, a: usize, b: usize) -> Result<i32> {
        let slot = self.carve_slot(0)?;
        if self.identity.is_leader {
            // SAFETY: caller guarantees NUL-terminated strings at `a`/`b`.
            let result = unsafe { libc::strcmp(a as *const libc::c_char, b as *const libc::c_char) };
            slot.publish_request(a as u64, b as u64, 0, result as i64 as u64, 0, OpCode::Strcmp as u8, false);
            slot.publish_from_buffer();
            Ok(result)
        } else {
            self.wait_published(&slot);
            self.check_request_matches(&slot, OpCode::Strcmp, a as u64, b as u64, 0);
            self.wait_replicated(&slot);
            Ok(slot.value() as i64 as i32)
        }
    }

    /// Pointer-tolerant payload comparison, exposed for callers that need
    /// to validate a non-shared local input against a leader's published
    /// payload before raising a divergence (spec §4.B.1, phase 1).
    pub fn payload_matches(&self, local: &[u8], leader_payload: &[u8], tolerance_enabled: bool) -> bool {
        pointer_eq::buffers_equivalent(local, leader_payload, self.shm_tag, self.leader_shm_tag, tolerance_enabled)
    }

    pub fn report_missing_mapping(&self, addr: usize) -> AgentError {
        AgentError::Configuration(format!("no mapping entry for {addr:#x}"))
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

    fn map_region(len: usize) -> (Vec<u8>, Vec<u8>) {
        (vec![0u8; len], vec![0u8; len])
    }

    #[test]
    fn s3_shm_load_divergence_publishes_external_mutation() {
        let (mut real, mut shadow_buf) = map_region(8);
        let real_base = real.as_mut_ptr() as usize;
        let shadow_base = shadow_buf.as_mut_ptr() as usize;
        crate::mapping::global()
            .insert(crate::mapping::MappingEntry {
                real_base,
                shadow_base: Some(shadow_base),
                length: 8,
            })
            .unwrap();

        // Leader's shadow holds 0x11, external writer mutated real memory
        // to 0x22.
        unsafe {
            *(shadow_base as *mut u32) = 0x11;
            *(real_base as *mut u32) = 0x22;
        }

        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let leader = ShmAgent::new(identity(true), monitor, 0, 0);
        let result = leader.shm_op(OpCode::Load, real_base, 4, 0, 0).unwrap();
        assert_eq!(result.val, 0x22);
        unsafe {
            assert_eq!(*(shadow_base as *const u32), 0x22);
        }

        crate::mapping::global().delete(real_base);
    }

    #[test]
    fn zero_length_memcpy_is_a_no_op() {
        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let agent = ShmAgent::new(identity(true), monitor, 0, 0);
        agent.memcpy(0x1000, 0x2000, 0).unwrap();
    }

    #[test]
    #[should_panic(expected = "fatal_assert")]
    fn s6_unsupported_rmw_variant_is_a_fatal_assert() {
        let (mut real, mut shadow_buf) = map_region(8);
        let real_base = real.as_mut_ptr() as usize;
        let shadow_base = shadow_buf.as_mut_ptr() as usize;
        crate::mapping::global()
            .insert(crate::mapping::MappingEntry {
                real_base,
                shadow_base: Some(shadow_base),
                length: 8,
            })
            .unwrap();

        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let leader = ShmAgent::new(identity(true), monitor, 0, 0);
        let _ = leader.shm_op(OpCode::AtomicMax, real_base, 4, 1, 0);
    }

    #[test]
    fn follower_store_replay_with_mismatched_local_value_reports_payload_divergence() {
        let (mut real, mut shadow_buf) = map_region(8);
        let real_base = real.as_mut_ptr() as usize;
        let shadow_base = shadow_buf.as_mut_ptr() as usize;
        crate::mapping::global()
            .insert(crate::mapping::MappingEntry {
                real_base,
                shadow_base: Some(shadow_base),
                length: 8,
            })
            .unwrap();

        let monitor = Arc::new(MockMonitorClient::new(identity(false)));
        let follower = ShmAgent::new(identity(false), monitor.clone(), 0, 0);

        let mut buf = vec![0u8; ShmOpSlot::total_len(0)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 0) };
        slot.publish_request(real_base as u64, real_base as u64, 4, 0x42, 0, OpCode::Store as u8, false);

        let shadow = follower.shadow_for(real_base).unwrap();
        let result = follower
            .follower_replay(OpCode::Store, real_base, &shadow, Width::W4, 0x99, 0, &slot)
            .unwrap();

        // The leader's published value still wins — a mismatch is flagged,
        // not silently dropped, but replay stays deterministic.
        assert_eq!(result.val, 0x42);
        assert_eq!(monitor.divergence_count(), 1);
        assert_eq!(monitor.reports()[0].reason, DivergenceReason::PayloadMismatch);

        crate::mapping::global().delete(real_base);
    }

    #[test]
    fn follower_store_replay_with_matching_local_value_is_silent() {
        let (mut real, mut shadow_buf) = map_region(8);
        let real_base = real.as_mut_ptr() as usize;
        let shadow_base = shadow_buf.as_mut_ptr() as usize;
        crate::mapping::global()
            .insert(crate::mapping::MappingEntry {
                real_base,
                shadow_base: Some(shadow_base),
                length: 8,
            })
            .unwrap();

        let monitor = Arc::new(MockMonitorClient::new(identity(false)));
        let follower = ShmAgent::new(identity(false), monitor.clone(), 0, 0);

        let mut buf = vec![0u8; ShmOpSlot::total_len(0)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 0) };
        slot.publish_request(real_base as u64, real_base as u64, 4, 0x42, 0, OpCode::Store as u8, false);

        let shadow = follower.shadow_for(real_base).unwrap();
        follower
            .follower_replay(OpCode::Store, real_base, &shadow, Width::W4, 0x42, 0, &slot)
            .unwrap();

        assert_eq!(monitor.divergence_count(), 0);

        crate::mapping::global().delete(real_base);
    }

    #[test]
    fn bulk_write_payload_check_flags_mismatched_local_bytes() {
        let monitor = Arc::new(MockMonitorClient::new(identity(false)));
        let follower = ShmAgent::new(identity(false), monitor.clone(), 0, 0);

        let mut buf = vec![0u8; ShmOpSlot::total_len(16)];
        let slot = unsafe { ShmOpSlot::at(buf.as_mut_ptr(), 16) };
        slot.payload_mut().copy_from_slice(&[0xAB; 16]);

        follower.check_payload_matches(OpCode::Memset, 0x1000, &[0xCD; 16], slot.payload(), false);
        assert_eq!(monitor.divergence_count(), 1);
        assert_eq!(monitor.reports()[0].reason, DivergenceReason::PayloadMismatch);

        follower.check_payload_matches(OpCode::Memset, 0x1000, &[0xAB; 16], slot.payload(), false);
        assert_eq!(monitor.divergence_count(), 1);
    }

    #[test]
    fn payload_check_disabled_suppresses_divergence_report() {
        let monitor = Arc::new(MockMonitorClient::new(identity(false)));
        let follower = ShmAgent::new(identity(false), monitor.clone(), 0, 0);
        let original = crate::config::runtime().payload_check_enabled();
        crate::config::runtime().set_payload_check_enabled(false);

        follower.check_payload_matches(OpCode::Memset, 0x1000, &[0xCD; 4], &[0xAB; 4], false);
        assert_eq!(monitor.divergence_count(), 0);

        crate::config::runtime().set_payload_check_enabled(original);
    }

    #[test]
    #[should_panic(expected = "fatal_assert")]
    fn s6_glibc_block_op_code_rejected_by_shm_op() {
        let (mut real, mut shadow_buf) = map_region(8);
        let real_base = real.as_mut_ptr() as usize;
        let shadow_base = shadow_buf.as_mut_ptr() as usize;
        crate::mapping::global()
            .insert(crate::mapping::MappingEntry {
                real_base,
                shadow_base: Some(shadow_base),
                length: 8,
            })
            .unwrap();

        // Memcpy's op code is only valid through the dedicated `memcpy`
        // method, never through `shm_op` directly.
        let monitor = Arc::new(MockMonitorClient::new(identity(true)));
        let leader = ShmAgent::new(identity(true), monitor, 0, 0);
        let _ = leader.shm_op(OpCode::Memcpy, real_base, 8, 0, 0);
    }
}

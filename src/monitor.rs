// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The monitor collaborator: an out-of-process privileged supervisor reached
//! through a small set of numbered control calls.
//!
//! Modeled as [`MonitorClient`] so the rest of the crate never calls
//! `libc::syscall` directly — [`SyscallMonitor`] is the real implementation,
//! [`mock::MockMonitorClient`] drives the test suite.

use crate::error::DivergenceReason;

/// Control-call base, x86_64. ARM builds would use `0x6FF`; this crate only
/// targets 64-bit hosts (see [`crate::config`]).
pub const MVEE_CONTROL_BASE: i64 = 0x6FFF_FFFF;

/// Control-call numbers, offsets from [`MVEE_CONTROL_BASE`]. Stable ABI —
/// never renumber these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum ControlCall {
    RunsUnderMveeControl = MVEE_CONTROL_BASE,
    GetMasterThreadId = MVEE_CONTROL_BASE + 1,
    GetSharedBuffer = MVEE_CONTROL_BASE + 2,
    FlushSharedBuffer = MVEE_CONTROL_BASE + 3,
    AllHeapsAligned = MVEE_CONTROL_BASE + 4,
    ResetAtFork = MVEE_CONTROL_BASE + 5,
    InfiniteLoopPtr = MVEE_CONTROL_BASE + 6,
    ReportDivergence = MVEE_CONTROL_BASE + 7,
}

/// Identity tuple fetched once per variant via
/// [`MonitorClient::identify`]. Until this is fetched, every entry point
/// in [`crate::api`] is a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VariantIdentity {
    /// False means this process is not running under MVEE control; every
    /// agent entry point degrades to calling the underlying primitive
    /// directly (spec §7, "monitor unavailable").
    pub sync_enabled: bool,
    pub num_variants: u16,
    pub variant_index: u16,
    pub is_leader: bool,
    /// Address the monitor may steer this variant into on a fatal trap.
    pub infinite_loop_addr: usize,
}

impl VariantIdentity {
    /// The `{..}` the source returns for a process that is not under MVEE
    /// control at all.
    pub const UNMANAGED: Self = Self {
        sync_enabled: false,
        num_variants: 1,
        variant_index: 0,
        is_leader: true,
        infinite_loop_addr: 0,
    };
}

/// Buffer kinds the monitor allocates on request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BufferKind {
    SyncRing,
    ShmOpRing,
}

/// A shared buffer handle returned by [`MonitorClient::get_shared_buffer`].
#[derive(Debug, Clone, Copy)]
pub struct SharedBufferHandle {
    pub ipc_key: i32,
    pub slot_count: u32,
}

/// The monitor as seen by the agent: a set of blocking control calls.
///
/// Every method corresponds 1:1 to a control call in spec §4.A.4. Real
/// deployments use [`SyscallMonitor`]; tests use a mock (see
/// [`mock::MockMonitorClient`]).
pub trait MonitorClient: Send + Sync {
    /// `RUNS_UNDER_MVEE_CONTROL`.
    fn identify(&self) -> VariantIdentity;

    /// `GET_MASTERTHREAD_ID`: the leader's tid paired with `caller_tid`.
    fn master_thread_id(&self, caller_tid: u32) -> u32;

    /// `GET_SHARED_BUFFER`.
    fn get_shared_buffer(&self, kind: BufferKind, slot_size_hint: u32) -> SharedBufferHandle;

    /// `FLUSH_SHARED_BUFFER`: monitor drains and releases the buffer.
    fn flush_shared_buffer(&self, kind: BufferKind);

    /// `ALL_HEAPS_ALIGNED`.
    fn all_heaps_aligned(&self, heap: usize, align: usize, size: usize) -> bool;

    /// `RESET_ATFORK`: zero `*addr` in each variant after fork.
    fn reset_atfork(&self, addr: usize, size: usize);

    /// `INFINITE_LOOP_PTR`.
    fn infinite_loop_ptr(&self) -> usize;

    /// Distinguished control call reporting a divergence. Non-returning in
    /// spirit: the monitor either terminates the variant or steers it into
    /// `infinite_loop`, so callers should not expect further progress.
    fn report_divergence(&self, reason: DivergenceReason, op_type: u16, args: &[u64]);
}

/// Real [`MonitorClient`] backed by the numbered syscalls in
/// [`ControlCall`].
#[derive(Debug, Default)]
pub struct SyscallMonitor;

impl SyscallMonitor {
    pub const fn new() -> Self {
        Self
    }

    #[inline]
    fn syscall(&self, call: ControlCall, args: &[i64]) -> i64 {
        // SAFETY: `libc::syscall` is variadic; we only ever pass i64 args,
        // matching the convention the real monitor's trap handler expects.
        unsafe {
            match args.len() {
                0 => libc::syscall(call as i64) as i64,
                1 => libc::syscall(call as i64, args[0]) as i64,
                2 => libc::syscall(call as i64, args[0], args[1]) as i64,
                3 => libc::syscall(call as i64, args[0], args[1], args[2]) as i64,
                4 => libc::syscall(call as i64, args[0], args[1], args[2], args[3]) as i64,
                _ => libc::syscall(
                    call as i64,
                    args[0],
                    args[1],
                    args[2],
                    args[3],
                    args[4],
                ) as i64,
            }
        }
    }
}

impl MonitorClient for SyscallMonitor {
    fn identify(&self) -> VariantIdentity {
        let ret = self.syscall(ControlCall::RunsUnderMveeControl, &[]);
        if ret < 0 {
            return VariantIdentity::UNMANAGED;
        }
        // Layout agreed with the monitor: a packed word the real trap
        // handler fills via the syscall's output registers in the C
        // source; here we decode the single returned word.
        VariantIdentity {
            sync_enabled: ret & 0x1 != 0,
            num_variants: ((ret >> 1) & 0xFFFF) as u16,
            variant_index: ((ret >> 17) & 0xFFFF) as u16,
            is_leader: ret & 0x2_0000_0000 != 0,
            infinite_loop_addr: self.infinite_loop_ptr(),
        }
    }

    fn master_thread_id(&self, caller_tid: u32) -> u32 {
        self.syscall(ControlCall::GetMasterThreadId, &[caller_tid as i64]) as u32
    }

    fn get_shared_buffer(&self, kind: BufferKind, slot_size_hint: u32) -> SharedBufferHandle {
        let kind_arg = match kind {
            BufferKind::SyncRing => 0,
            BufferKind::ShmOpRing => 1,
        };
        let packed = self.syscall(
            ControlCall::GetSharedBuffer,
            &[kind_arg, slot_size_hint as i64],
        );
        SharedBufferHandle {
            ipc_key: (packed & 0xFFFF_FFFF) as i32,
            slot_count: ((packed >> 32) & 0xFFFF_FFFF) as u32,
        }
    }

    fn flush_shared_buffer(&self, kind: BufferKind) {
        let kind_arg = match kind {
            BufferKind::SyncRing => 0,
            BufferKind::ShmOpRing => 1,
        };
        self.syscall(ControlCall::FlushSharedBuffer, &[kind_arg]);
    }

    fn all_heaps_aligned(&self, heap: usize, align: usize, size: usize) -> bool {
        self.syscall(
            ControlCall::AllHeapsAligned,
            &[heap as i64, align as i64, size as i64],
        ) != 0
    }

    fn reset_atfork(&self, addr: usize, size: usize) {
        self.syscall(ControlCall::ResetAtFork, &[addr as i64, size as i64]);
    }

    fn infinite_loop_ptr(&self) -> usize {
        self.syscall(ControlCall::InfiniteLoopPtr, &[]) as usize
    }

    fn report_divergence(&self, reason: DivergenceReason, op_type: u16, args: &[u64]) {
        let arg0 = args.first().copied().unwrap_or(0) as i64;
        let arg1 = args.get(1).copied().unwrap_or(0) as i64;
        self.syscall(
            ControlCall::ReportDivergence,
            &[reason as i64, op_type as i64, arg0, arg1],
        );
    }
}

/// Fetch and cache the process-wide identity tuple in
/// [`crate::config::runtime`]. Safe to call more than once; later calls
/// overwrite the cached value (only exercised by tests).
pub fn fetch_identity(client: &dyn MonitorClient) -> VariantIdentity {
    let id = client.identify();
    crate::config::runtime().set_identity(id);
    id
}

#[cfg(any(test, feature = "test-support"))]
pub mod mock {
    //! In-process [`MonitorClient`] for the test suite: no real syscalls,
    //! buffers are plain heap allocations keyed by an incrementing counter.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Debug, Clone)]
    pub struct DivergenceReport {
        pub reason: DivergenceReason,
        pub op_type: u16,
        pub args: Vec<u64>,
    }

    /// Mock monitor shared by every variant thread in a test scenario.
    pub struct MockMonitorClient {
        inner: Mutex<MockState>,
        identity_template: VariantIdentity,
    }

    struct MockState {
        next_key: i32,
        buffers: HashMap<BufferKind, SharedBufferHandle>,
        heaps_aligned: bool,
        reports: Vec<DivergenceReport>,
    }

    impl MockMonitorClient {
        pub fn new(identity: VariantIdentity) -> Self {
            Self {
                inner: Mutex::new(MockState {
                    next_key: 1,
                    buffers: HashMap::new(),
                    heaps_aligned: true,
                    reports: Vec::new(),
                }),
                identity_template: identity,
            }
        }

        pub fn set_heaps_aligned(&self, aligned: bool) {
            self.inner.lock().heaps_aligned = aligned;
        }

        pub fn reports(&self) -> Vec<DivergenceReport> {
            self.inner.lock().reports.clone()
        }

        pub fn divergence_count(&self) -> usize {
            self.inner.lock().reports.len()
        }
    }

    impl MonitorClient for MockMonitorClient {
        fn identify(&self) -> VariantIdentity {
            self.identity_template
        }

        fn master_thread_id(&self, caller_tid: u32) -> u32 {
            // Identity mapping by default: good enough for single-process
            // test scenarios where "the leader's paired thread" is simply
            // whichever thread drives both roles, or a thread spawned
            // with a matching tid recorded by the test itself.
            caller_tid
        }

        fn get_shared_buffer(&self, kind: BufferKind, slot_size_hint: u32) -> SharedBufferHandle {
            let mut state = self.inner.lock();
            if let Some(existing) = state.buffers.get(&kind) {
                return *existing;
            }
            let key = state.next_key;
            state.next_key += 1;
            let handle = SharedBufferHandle {
                ipc_key: key,
                slot_count: slot_size_hint.max(1),
            };
            state.buffers.insert(kind, handle);
            handle
        }

        fn flush_shared_buffer(&self, kind: BufferKind) {
            self.inner.lock().buffers.remove(&kind);
        }

        fn all_heaps_aligned(&self, _heap: usize, _align: usize, _size: usize) -> bool {
            self.inner.lock().heaps_aligned
        }

        fn reset_atfork(&self, _addr: usize, _size: usize) {}

        fn infinite_loop_ptr(&self) -> usize {
            0
        }

        fn report_divergence(&self, reason: DivergenceReason, op_type: u16, args: &[u64]) {
            self.inner.lock().reports.push(DivergenceReport {
                reason,
                op_type,
                args: args.to_vec(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockMonitorClient;
    use super::*;

    fn leader_identity() -> VariantIdentity {
        VariantIdentity {
            sync_enabled: true,
            num_variants: 2,
            variant_index: 0,
            is_leader: true,
            infinite_loop_addr: 0,
        }
    }

    #[test]
    fn unmanaged_identity_has_sync_disabled() {
        assert!(!VariantIdentity::UNMANAGED.sync_enabled);
        assert!(VariantIdentity::UNMANAGED.is_leader);
    }

    #[test]
    fn mock_buffer_allocation_is_stable_per_kind() {
        let mock = MockMonitorClient::new(leader_identity());
        let a = mock.get_shared_buffer(BufferKind::SyncRing, 4096);
        let b = mock.get_shared_buffer(BufferKind::SyncRing, 4096);
        assert_eq!(a.ipc_key, b.ipc_key);
    }

    #[test]
    fn mock_records_divergence_reports() {
        let mock = MockMonitorClient::new(leader_identity());
        mock.report_divergence(DivergenceReason::SizeMismatch, 1, &[4, 8]);
        assert_eq!(mock.divergence_count(), 1);
        assert_eq!(mock.reports()[0].args, vec![4, 8]);
    }

    #[test]
    fn fetch_identity_caches_into_runtime_config() {
        let mock = MockMonitorClient::new(leader_identity());
        let id = fetch_identity(&mock);
        assert_eq!(id.variant_index, 0);
        assert_eq!(
            crate::config::runtime().identity().unwrap().num_variants,
            2
        );
    }
}

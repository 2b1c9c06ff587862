// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Agent configuration — Level 1 (compile-time constants) and Level 2
//! (runtime config, set once from the monitor).
//!
//! **NEVER hardcode ring sizes or counter geometry elsewhere.**

use crate::monitor::VariantIdentity;
use arc_swap::ArcSwapOption;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

// =======================================================================
// Level 1: compile-time constants
// =======================================================================

/// Cache line size assumed throughout the agent. All hot structures pad
/// to this boundary to avoid false sharing between variant threads.
pub const CACHE_LINE: usize = 64;

/// Maximum number of variants a single build supports. Bounds the fixed
/// `tags` array in [`crate::buffer::slot::SyncRingSlot`] — the source's
/// flexible array member has no Rust equivalent.
pub const MAX_VARIANTS: usize = 4;

/// Default sync-ring slot count (total/partial order modes).
pub const DEFAULT_SYNC_RING_SLOTS: usize = 4096;

/// Default per-thread SHM-op ring size in bytes.
pub const DEFAULT_SHM_RING_BYTES: usize = 64 * 1024;

/// Write-once-counter table size (`K` in spec §4.A.3).
pub const WOC_TOTAL_COUNTERS: usize = 2048;

/// Write-once-counter group size (spec §4.A.3).
pub const WOC_GROUP_SIZE: usize = 64;

/// Number of counter groups.
pub const WOC_TOTAL_GROUPS: usize = WOC_TOTAL_COUNTERS / WOC_GROUP_SIZE;

/// Default per-thread write-once-counter queue length.
pub const DEFAULT_WOC_QUEUE_LEN: usize = 1024;

const _: () = assert!(
    std::mem::size_of::<usize>() == 8,
    "mvee-agent requires a 64-bit target: address tagging steals bit 63"
);

/// How a prolog spins while waiting for a ring-buffer condition.
///
/// `original_source/csu/mvee-woc-agent.c` guards this with
/// `#ifdef MVEE_SLAVE_YIELD`; we expose it as a runtime choice since it
/// has no effect on wire layout or ABI, only on scheduler behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpinPolicy {
    /// `sched_yield()` between polls — trades latency for fairness under
    /// CPU oversubscription.
    Yield,
    /// Pure `core::hint::spin_loop()` busy-wait — lowest latency when each
    /// variant has a dedicated core.
    Relax,
}

impl Default for SpinPolicy {
    fn default() -> Self {
        Self::Relax
    }
}

/// Spin once per [`SpinPolicy`].
#[inline]
pub fn spin_once(policy: SpinPolicy) {
    match policy {
        SpinPolicy::Yield => std::thread::yield_now(),
        SpinPolicy::Relax => std::hint::spin_loop(),
    }
}

// =======================================================================
// Level 2: runtime configuration, set once from the monitor
// =======================================================================

/// Process-wide dynamic configuration.
///
/// `identity` is populated exactly once by [`crate::monitor::fetch_identity`]
/// (spec §3: "Until this tuple is fetched, all entry points are no-ops").
/// `spin_policy` and ring sizes can be tuned by an embedder before that
/// first call.
pub struct RuntimeConfig {
    identity: ArcSwapOption<VariantIdentity>,
    spin_policy: AtomicSpinPolicy,
    sync_ring_slots: AtomicUsize,
    shm_ring_bytes: AtomicUsize,
    payload_check_enabled: AtomicBool,
}

/// `SpinPolicy` packed into an atomic `u8` so it can live in a `static`.
struct AtomicSpinPolicy(std::sync::atomic::AtomicU8);

impl AtomicSpinPolicy {
    const fn new(p: SpinPolicy) -> Self {
        Self(std::sync::atomic::AtomicU8::new(p as u8))
    }
    fn load(&self) -> SpinPolicy {
        match self.0.load(Ordering::Relaxed) {
            0 => SpinPolicy::Yield,
            _ => SpinPolicy::Relax,
        }
    }
    fn store(&self, p: SpinPolicy) {
        self.0.store(p as u8, Ordering::Relaxed);
    }
}

impl RuntimeConfig {
    const fn new() -> Self {
        Self {
            identity: ArcSwapOption::const_empty(),
            spin_policy: AtomicSpinPolicy::new(SpinPolicy::Relax),
            sync_ring_slots: AtomicUsize::new(DEFAULT_SYNC_RING_SLOTS),
            shm_ring_bytes: AtomicUsize::new(DEFAULT_SHM_RING_BYTES),
            payload_check_enabled: AtomicBool::new(true),
        }
    }

    /// Identity tuple fetched from the monitor, if any.
    pub fn identity(&self) -> Option<std::sync::Arc<VariantIdentity>> {
        self.identity.load_full()
    }

    /// Install the identity tuple. Idempotent: later calls replace it,
    /// which only matters for tests (a real variant calls this once).
    pub fn set_identity(&self, id: VariantIdentity) {
        self.identity.store(Some(std::sync::Arc::new(id)));
    }

    pub fn spin_policy(&self) -> SpinPolicy {
        self.spin_policy.load()
    }

    pub fn set_spin_policy(&self, policy: SpinPolicy) {
        self.spin_policy.store(policy);
    }

    pub fn sync_ring_slots(&self) -> usize {
        self.sync_ring_slots.load(Ordering::Relaxed)
    }

    pub fn set_sync_ring_slots(&self, n: usize) {
        self.sync_ring_slots.store(n, Ordering::Relaxed);
    }

    pub fn shm_ring_bytes(&self) -> usize {
        self.shm_ring_bytes.load(Ordering::Relaxed)
    }

    pub fn set_shm_ring_bytes(&self, n: usize) {
        self.shm_ring_bytes.store(n, Ordering::Relaxed);
    }

    /// Whether a follower validates its own locally-read/computed input
    /// against the leader's published payload before replaying it.
    /// Enabled by default; an embedder can disable it once a known benign
    /// mismatch (e.g. uninitialized padding bytes) has been diagnosed.
    pub fn payload_check_enabled(&self) -> bool {
        self.payload_check_enabled.load(Ordering::Relaxed)
    }

    pub fn set_payload_check_enabled(&self, enabled: bool) {
        self.payload_check_enabled.store(enabled, Ordering::Relaxed);
    }
}

/// Global runtime configuration singleton.
static RUNTIME_CONFIG: RuntimeConfig = RuntimeConfig::new();

/// Access the global runtime configuration.
pub fn runtime() -> &'static RuntimeConfig {
    &RUNTIME_CONFIG
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spin_policy_default_is_relax() {
        assert_eq!(SpinPolicy::default(), SpinPolicy::Relax);
    }

    #[test]
    fn runtime_config_roundtrips_spin_policy() {
        let cfg = RuntimeConfig::new();
        cfg.set_spin_policy(SpinPolicy::Yield);
        assert_eq!(cfg.spin_policy(), SpinPolicy::Yield);
    }

    #[test]
    fn runtime_config_identity_starts_empty() {
        let cfg = RuntimeConfig::new();
        assert!(cfg.identity().is_none());
    }

    #[test]
    fn payload_check_enabled_defaults_true_and_roundtrips() {
        let cfg = RuntimeConfig::new();
        assert!(cfg.payload_check_enabled());
        cfg.set_payload_check_enabled(false);
        assert!(!cfg.payload_check_enabled());
    }
}

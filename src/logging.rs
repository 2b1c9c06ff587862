// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Hot-path tracing macros, mirroring the original's `LOG_EIPS` /
//! `LOG_SHM_OPS` build switches as Cargo features.
//!
//! These sit alongside ordinary [`log`] crate usage: `trace_eip!`/
//! `trace_shm_op!` are for the prolog/epilog hot path and compile to
//! nothing unless their feature is enabled; `log::debug!`/`log::warn!`
//! cover non-hot-path diagnostics (segment lifecycle, divergence reports)
//! and are always compiled in, gated only by the runtime log level.

/// Trace an atomic-op prolog/epilog transition. Expands to nothing unless
/// built with `--features log-eips`.
#[macro_export]
macro_rules! trace_eip {
    ($($arg:tt)*) => {
        #[cfg(feature = "log-eips")]
        {
            log::trace!(target: "mvee_agent::sync_agent", $($arg)*);
        }
    };
}

/// Trace an SHM-op protocol phase transition. Expands to nothing unless
/// built with `--features log-shm-ops`.
#[macro_export]
macro_rules! trace_shm_op {
    ($($arg:tt)*) => {
        #[cfg(feature = "log-shm-ops")]
        {
            log::trace!(target: "mvee_agent::shm_agent", $($arg)*);
        }
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn trace_macros_compile_with_and_without_args() {
        let op_type: u16 = 3;
        let addr: u64 = 0x1000;
        trace_eip!("preop op_type={op_type} addr={addr:#x}");
        trace_shm_op!("phase1 equivalence check");
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Agent error taxonomy.
//!
//! Three classes, matching the three ways the agent can fail:
//! [`AgentError::Divergence`] (recoverable only by the monitor),
//! [`AgentError::Configuration`] (fatal, a build/ABI bug), and the
//! "monitor unavailable" case, which is not an error at all — callers
//! check [`crate::monitor::VariantIdentity::sync_enabled`] and skip the
//! agent entirely rather than constructing an `AgentError`.

use std::fmt;

/// Why a divergence was raised. Carried to the monitor verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DivergenceReason {
    /// `{in_addr, out_addr, size, op_type}` disagreed between leader and follower.
    AddressMismatch,
    SizeMismatch,
    OpTypeMismatch,
    /// A value comparison failed and no pointer-equivalence reinterpretation reconciled it.
    ValueMismatch,
    /// Follower's local input differs from the leader's published `payload`.
    PayloadMismatch,
    /// A follower observed an uninitialized ring slot past the buffer boundary.
    UninitializedSlot,
}

impl fmt::Display for DivergenceReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::AddressMismatch => "address mismatch",
            Self::SizeMismatch => "size mismatch",
            Self::OpTypeMismatch => "op_type mismatch",
            Self::ValueMismatch => "value mismatch",
            Self::PayloadMismatch => "payload vs local-input mismatch",
            Self::UninitializedSlot => "uninitialized slot past buffer boundary",
        };
        write!(f, "{s}")
    }
}

/// Errors surfaced by the agent's public API.
///
/// `Divergence` and `Configuration` are the only two variants that reach a
/// caller; monitor-unavailable pass-through is handled upstream by simply
/// not calling into the agent (see [`crate::monitor::VariantIdentity`]).
#[derive(Debug, Clone)]
pub enum AgentError {
    /// A cross-variant equivalence check failed. The monitor has already
    /// been (or is about to be) notified; this variant exists so library
    /// callers can unwind cleanly in tests instead of aborting.
    Divergence {
        reason: DivergenceReason,
        op_type: u16,
    },
    /// An unsupported operation, unsupported atomic width, missing mapping
    /// entry, or a partial `munmap`/`shmdt` — all host-library bugs, not
    /// runtime conditions a caller can recover from.
    Configuration(String),
}

impl fmt::Display for AgentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Divergence { reason, op_type } => {
                write!(f, "divergence ({reason}) on op_type={op_type}")
            }
            Self::Configuration(msg) => write!(f, "configuration fault: {msg}"),
        }
    }
}

impl std::error::Error for AgentError {}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Fatal configuration fault: unsupported op code, unsupported atomic
/// width, missing mapping entry, partial munmap (spec §7). Matches the
/// host library's own convention for a hard assert — a write to address
/// zero carrying the diagnostic as the value. `cfg(test)` builds panic
/// instead, so the test suite can assert on the condition rather than
/// segfaulting the test runner.
#[cfg(not(test))]
pub fn fatal_assert(diagnostic: u64) -> ! {
    // SAFETY: none — this is intentionally a trap. A real host process
    // linking this agent expects a fatal assert to crash it immediately.
    unsafe {
        std::ptr::write_volatile(std::ptr::null_mut::<u64>(), diagnostic);
    }
    unreachable!("write to address zero did not trap")
}

#[cfg(test)]
pub fn fatal_assert(diagnostic: u64) -> ! {
    panic!("fatal_assert({diagnostic:#x})")
}

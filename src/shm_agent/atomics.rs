// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Size- and type-polymorphic atomics over raw shared-memory addresses
//! (spec §4.B.4). Widths 1/2/4/8 only; ordering is sequentially
//! consistent throughout — stores use release, loads use acquire, RMWs
//! use seq-cst, matching the data model's "each agent-mediated op is a
//! linearization point" guarantee.

use crate::error::{AgentError, Result};
use std::sync::atomic::{AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W1,
    W2,
    W4,
    W8,
}

impl Width {
    pub fn from_size(size: u64) -> Result<Self> {
        match size {
            1 => Ok(Width::W1),
            2 => Ok(Width::W2),
            4 => Ok(Width::W4),
            8 => Ok(Width::W8),
            other => Err(AgentError::Configuration(format!(
                "unsupported atomic width: {other} bytes"
            ))),
        }
    }
}

/// RMW operations the agent actually performs (spec §4.B.4 rejects
/// MAX/MIN/UMAX/UMIN/FADD/FSUB before this layer is ever reached — see
/// `OpCode::is_unsupported_rmw`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmwOp {
    Xchg,
    Add,
    Sub,
    And,
    Nand,
    Or,
    Xor,
}

/// # Safety
/// `ptr` must be valid, writable, and aligned to `width` for the
/// duration of the call.
pub unsafe fn load(ptr: *mut u8, width: Width) -> u64 {
    match width {
        Width::W1 => (*(ptr as *const AtomicU8)).load(Ordering::Acquire) as u64,
        Width::W2 => (*(ptr as *const AtomicU16)).load(Ordering::Acquire) as u64,
        Width::W4 => (*(ptr as *const AtomicU32)).load(Ordering::Acquire) as u64,
        Width::W8 => (*(ptr as *const AtomicU64)).load(Ordering::Acquire),
    }
}

/// # Safety
/// See [`load`].
pub unsafe fn store(ptr: *mut u8, width: Width, value: u64) {
    match width {
        Width::W1 => (*(ptr as *const AtomicU8)).store(value as u8, Ordering::Release),
        Width::W2 => (*(ptr as *const AtomicU16)).store(value as u16, Ordering::Release),
        Width::W4 => (*(ptr as *const AtomicU32)).store(value as u32, Ordering::Release),
        Width::W8 => (*(ptr as *const AtomicU64)).store(value, Ordering::Release),
    }
}

/// Returns `(previous_value, succeeded)`.
///
/// # Safety
/// See [`load`].
pub unsafe fn cmpxchg(ptr: *mut u8, width: Width, expected: u64, new: u64) -> (u64, bool) {
    match width {
        Width::W1 => {
            let r = (*(ptr as *const AtomicU8)).compare_exchange(
                expected as u8,
                new as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            match r {
                Ok(old) => (old as u64, true),
                Err(old) => (old as u64, false),
            }
        }
        Width::W2 => {
            let r = (*(ptr as *const AtomicU16)).compare_exchange(
                expected as u16,
                new as u16,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            match r {
                Ok(old) => (old as u64, true),
                Err(old) => (old as u64, false),
            }
        }
        Width::W4 => {
            let r = (*(ptr as *const AtomicU32)).compare_exchange(
                expected as u32,
                new as u32,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            match r {
                Ok(old) => (old as u64, true),
                Err(old) => (old as u64, false),
            }
        }
        Width::W8 => {
            let r = (*(ptr as *const AtomicU64)).compare_exchange(
                expected,
                new,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
            match r {
                Ok(old) => (old, true),
                Err(old) => (old, false),
            }
        }
    }
}

/// Returns the previous value, as the real hardware RMW instructions do.
///
/// # Safety
/// See [`load`].
pub unsafe fn rmw(ptr: *mut u8, width: Width, op: RmwOp, operand: u64) -> u64 {
    macro_rules! apply {
        ($atomic_ty:ty, $cast:ty) => {{
            let a = &*(ptr as *const $atomic_ty);
            let v = operand as $cast;
            (match op {
                RmwOp::Xchg => a.swap(v, Ordering::SeqCst),
                RmwOp::Add => a.fetch_add(v, Ordering::SeqCst),
                RmwOp::Sub => a.fetch_sub(v, Ordering::SeqCst),
                RmwOp::And => a.fetch_and(v, Ordering::SeqCst),
                RmwOp::Nand => a.fetch_nand(v, Ordering::SeqCst),
                RmwOp::Or => a.fetch_or(v, Ordering::SeqCst),
                RmwOp::Xor => a.fetch_xor(v, Ordering::SeqCst),
            }) as u64
        }};
    }
    match width {
        Width::W1 => apply!(AtomicU8, u8),
        Width::W2 => apply!(AtomicU16, u16),
        Width::W4 => apply!(AtomicU32, u32),
        Width::W8 => apply!(AtomicU64, u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn width_from_size_accepts_power_of_two_widths() {
        assert_eq!(Width::from_size(1).unwrap(), Width::W1);
        assert_eq!(Width::from_size(8).unwrap(), Width::W8);
        assert!(Width::from_size(3).is_err());
    }

    #[test]
    fn store_then_load_roundtrips_w4() {
        let mut cell = 0u32;
        let ptr = &mut cell as *mut u32 as *mut u8;
        unsafe {
            store(ptr, Width::W4, 0xdead_beef);
            assert_eq!(load(ptr, Width::W4), 0xdead_beef);
        }
    }

    #[test]
    fn cmpxchg_fails_on_mismatch_and_reports_current_value() {
        let mut cell = 5u64;
        let ptr = &mut cell as *mut u64 as *mut u8;
        unsafe {
            let (prev, ok) = cmpxchg(ptr, Width::W8, 999, 10);
            assert!(!ok);
            assert_eq!(prev, 5);
            let (prev2, ok2) = cmpxchg(ptr, Width::W8, 5, 10);
            assert!(ok2);
            assert_eq!(prev2, 5);
            assert_eq!(load(ptr, Width::W8), 10);
        }
    }

    #[test]
    fn rmw_add_returns_previous_value() {
        let mut cell = 1u8;
        let ptr = &mut cell as *mut u8;
        unsafe {
            let prev = rmw(ptr, Width::W1, RmwOp::Add, 4);
            assert_eq!(prev, 1);
            assert_eq!(load(ptr, Width::W1), 5);
        }
    }
}

// SPDX-License-Identifier: Apache-2.0 OR MIT

//! SHM Agent: mediates loads, stores, atomics, and `mem*`/`str*` calls
//! against memory shared with processes outside the MVEE.

pub mod atomics;
pub mod op_slot;
pub mod pointer_eq;
pub mod protocol;
pub mod replication;
pub mod shadow;

pub use op_slot::ShmOpSlot;
pub use protocol::{ShmAgent, ShmOpResult};
pub use replication::Replication;

/// Operation codes, numeric tags kept stable across versions (spec §4.B).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    Load = 0,
    Store = 1,
    AtomicLoad = 2,
    AtomicStore = 3,
    AtomicCmpXchg = 4,
    AtomicXchg = 5,
    AtomicAdd = 6,
    AtomicSub = 7,
    AtomicAnd = 8,
    AtomicNand = 9,
    AtomicOr = 10,
    AtomicXor = 11,
    AtomicMax = 12,
    AtomicMin = 13,
    AtomicUMax = 14,
    AtomicUMin = 15,
    AtomicFAdd = 16,
    AtomicFSub = 17,
    // GLIBC_FUNC_BASE block. STRLEN/STRCMP get distinct tags — the
    // original source shares one tag between them in a single revision;
    // this crate treats that as the incidental bug it is (spec §9, open
    // question b) and keeps them numerically distinct.
    Memcpy = 128,
    Memmove = 129,
    Memset = 130,
    Memchr = 131,
    Memcmp = 132,
    Strlen = 133,
    Strcmp = 134,
}

pub const GLIBC_FUNC_BASE: u8 = 128;

impl OpCode {
    /// RMW variants the agent rejects outright (spec §4.B: "MAX/MIN/
    /// UMAX/UMIN/F{ADD,SUB} are rejected as unsupported").
    pub const fn is_unsupported_rmw(self) -> bool {
        matches!(
            self,
            OpCode::AtomicMax
                | OpCode::AtomicMin
                | OpCode::AtomicUMax
                | OpCode::AtomicUMin
                | OpCode::AtomicFAdd
                | OpCode::AtomicFSub
        )
    }

    pub const fn is_atomic_rmw(self) -> bool {
        matches!(
            self,
            OpCode::AtomicXchg
                | OpCode::AtomicAdd
                | OpCode::AtomicSub
                | OpCode::AtomicAnd
                | OpCode::AtomicNand
                | OpCode::AtomicOr
                | OpCode::AtomicXor
        )
    }

    /// True for reads, where the follower needs the leader's published
    /// value rather than replaying a write against its shadow.
    pub const fn is_read_like(self) -> bool {
        matches!(
            self,
            OpCode::Load
                | OpCode::AtomicLoad
                | OpCode::Memchr
                | OpCode::Memcmp
                | OpCode::Strlen
                | OpCode::Strcmp
        )
    }

    pub const fn writes_shared_memory(self) -> bool {
        matches!(
            self,
            OpCode::Store
                | OpCode::AtomicStore
                | OpCode::AtomicCmpXchg
                | OpCode::Memcpy
                | OpCode::Memmove
                | OpCode::Memset
        ) || self.is_atomic_rmw()
    }

    pub fn from_u8(raw: u8) -> Option<Self> {
        use OpCode::*;
        Some(match raw {
            0 => Load,
            1 => Store,
            2 => AtomicLoad,
            3 => AtomicStore,
            4 => AtomicCmpXchg,
            5 => AtomicXchg,
            6 => AtomicAdd,
            7 => AtomicSub,
            8 => AtomicAnd,
            9 => AtomicNand,
            10 => AtomicOr,
            11 => AtomicXor,
            12 => AtomicMax,
            13 => AtomicMin,
            14 => AtomicUMax,
            15 => AtomicUMin,
            16 => AtomicFAdd,
            17 => AtomicFSub,
            128 => Memcpy,
            129 => Memmove,
            130 => Memset,
            131 => Memchr,
            132 => Memcmp,
            133 => Strlen,
            134 => Strcmp,
            _ => return None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strlen_and_strcmp_have_distinct_tags() {
        assert_ne!(OpCode::Strlen as u8, OpCode::Strcmp as u8);
    }

    #[test]
    fn unsupported_rmw_variants_are_flagged() {
        assert!(OpCode::AtomicMax.is_unsupported_rmw());
        assert!(!OpCode::AtomicAdd.is_unsupported_rmw());
    }

    #[test]
    fn from_u8_roundtrips_every_variant() {
        for raw in [0u8, 1, 2, 3, 4, 5, 128, 131, 133, 134] {
            assert_eq!(OpCode::from_u8(raw).unwrap() as u8, raw);
        }
    }

    #[test]
    fn from_u8_rejects_unknown_codes() {
        assert!(OpCode::from_u8(200).is_none());
    }
}

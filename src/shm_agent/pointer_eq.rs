// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Pointer-equivalence reconciliation (spec §4.B.2): two buffers that
//! *may* hold pointers at pointer-aligned offsets are treated as matching
//! when every word's decoded address agrees, even if the raw bits differ
//! — shared-memory and shadow regions necessarily live at different
//! virtual addresses, so raw pointer bytes are never expected to match.

use crate::addr;

/// True if `local_word` (decoded with this variant's `shm_tag`) and
/// `leader_word` (decoded with `leader_shm_tag`) refer to the same
/// canonical address, or are bit-identical scalars.
#[inline]
pub fn words_equivalent(local_word: u64, leader_word: u64, shm_tag: u64, leader_shm_tag: u64) -> bool {
    local_word == leader_word
        || addr::decode(local_word, shm_tag) == addr::decode_leader(leader_word, leader_shm_tag)
}

/// Compare two equal-length buffers for pointer-tolerant equivalence.
/// Falls back to raw byte comparison when the length isn't a multiple of
/// 8 (not an array of pointer-sized words) or when pointer-equivalence
/// tolerance was disabled for this operation (spec §4.B.2: "ops that
/// clearly carry scalar payloads disable it").
pub fn buffers_equivalent(
    local: &[u8],
    leader: &[u8],
    shm_tag: u64,
    leader_shm_tag: u64,
    tolerance_enabled: bool,
) -> bool {
    if local == leader {
        return true;
    }
    if !tolerance_enabled || local.len() != leader.len() || local.len() % 8 != 0 {
        return false;
    }
    local
        .chunks_exact(8)
        .zip(leader.chunks_exact(8))
        .all(|(l, r)| {
            let lw = u64::from_ne_bytes(l.try_into().unwrap());
            let rw = u64::from_ne_bytes(r.try_into().unwrap());
            words_equivalent(lw, rw, shm_tag, leader_shm_tag)
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_bytes_are_equivalent_without_tolerance() {
        let a = [1u8, 2, 3, 4, 5, 6, 7, 8];
        assert!(buffers_equivalent(&a, &a, 0, 0, false));
    }

    #[test]
    fn differently_tagged_pointers_reconcile_to_same_address() {
        let canonical: u64 = 0x0000_5555_0000_1234;
        let my_tag = 0x1111_0000u64;
        let leader_tag = 0x2222_0000u64;
        let local_word = addr::encode(canonical, my_tag);
        let leader_word = addr::encode(canonical, leader_tag);
        let local = local_word.to_ne_bytes();
        let leader = leader_word.to_ne_bytes();
        assert!(buffers_equivalent(&local, &leader, my_tag, leader_tag, true));
    }

    #[test]
    fn scalar_payload_with_tolerance_disabled_requires_exact_match() {
        let local = 7u64.to_ne_bytes();
        let leader = 8u64.to_ne_bytes();
        assert!(!buffers_equivalent(&local, &leader, 0, 0, false));
    }

    #[test]
    fn non_word_aligned_length_falls_back_to_raw_compare() {
        let local = [1u8, 2, 3];
        let leader = [1u8, 2, 3];
        assert!(buffers_equivalent(&local, &leader, 0, 0, true));
        let leader2 = [1u8, 2, 4];
        assert!(!buffers_equivalent(&local, &leader2, 0, 0, true));
    }
}

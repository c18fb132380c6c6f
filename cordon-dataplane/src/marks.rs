//! Packet-mark bit allocation.
//!
//! The TC programs use fixed mark bits compiled into
//! `cordon_common::marks`; everything else (accept, pass, scratch,
//! crypto steering, per-endpoint marks) is allocated at startup from
//! the configured allowed mask. Running out of bits for the required
//! marks is fatal.

use thiserror::Error;
use tracing::info;

use cordon_common::marks::MARKS_MASK;

#[derive(Debug, Error)]
pub enum MarkError {
    #[error("allowed mark mask {mask:#010x} does not cover the fixed program bits {required:#010x}")]
    FixedBitsNotCovered { mask: u32, required: u32 },

    #[error("not enough mark bits available in mask {mask:#010x}")]
    Exhausted { mask: u32 },
}

/// Hands out single bits and bit blocks from the allowed mask.
#[derive(Debug)]
pub struct MarkBits {
    available: u32,
}

impl MarkBits {
    pub fn new(available: u32) -> Self {
        Self { available }
    }

    /// Lowest free bit, removed from the pool.
    pub fn next_single_bit(&mut self) -> Option<u32> {
        if self.available == 0 {
            return None;
        }
        let bit = 1u32 << self.available.trailing_zeros();
        self.available &= !bit;
        Some(bit)
    }

    /// All remaining bits as one contiguous-use block.
    pub fn grab_remaining_block(&mut self) -> u32 {
        std::mem::take(&mut self.available)
    }

    pub fn available_count(&self) -> u32 {
        self.available.count_ones()
    }
}

/// The resolved mark plan for this run.
#[derive(Debug, Clone, Copy)]
pub struct Marks {
    pub accept: u32,
    /// Only used by the legacy path (policy chain -> endpoint chain).
    pub pass: u32,
    pub scratch0: u32,
    /// Steers inter-node traffic into the crypto device; zero when
    /// wireguard is disabled.
    pub wireguard: u32,
    /// Block of bits for per-endpoint marks.
    pub endpoint_block: u32,
}

/// Allocate the configurable marks from `mask`.
///
/// In fast-path mode the fixed program bits are carved out of the
/// allowed mask first and only the accept/scratch (and optional
/// wireguard) bits are allocated, to keep bits free for endpoint
/// marks.
///
/// FIXME: when the early-drop program is disabled, changing the
/// allowed mask at runtime leaves a window where the legacy path does
/// not yet match the new seen-mark bits and workload traffic that has
/// not traversed the new program can slip through unpoliced.
pub fn allocate(mask: u32, bpf_enabled: bool, wireguard_enabled: bool) -> Result<Marks, MarkError> {
    let mut mask = mask;
    if bpf_enabled {
        if mask & MARKS_MASK != MARKS_MASK {
            return Err(MarkError::FixedBitsNotCovered {
                mask,
                required: MARKS_MASK,
            });
        }
        mask &= !MARKS_MASK;
        info!(mask = format_args!("{mask:#010x}"), "reserved fixed program bits");
    }

    let mut bits = MarkBits::new(mask);
    let accept = bits.next_single_bit().ok_or(MarkError::Exhausted { mask })?;
    let pass = if bpf_enabled {
        0
    } else {
        bits.next_single_bit().ok_or(MarkError::Exhausted { mask })?
    };
    let scratch0 = bits.next_single_bit().ok_or(MarkError::Exhausted { mask })?;
    let wireguard = if wireguard_enabled {
        bits.next_single_bit().ok_or(MarkError::Exhausted { mask })?
    } else {
        0
    };
    let endpoint_block = bits.grab_remaining_block();

    info!(
        accept = format_args!("{accept:#010x}"),
        pass = format_args!("{pass:#010x}"),
        scratch0 = format_args!("{scratch0:#010x}"),
        wireguard = format_args!("{wireguard:#010x}"),
        endpoint_block = format_args!("{endpoint_block:#010x}"),
        "allocated mark bits"
    );

    Ok(Marks {
        accept,
        pass,
        scratch0,
        wireguard,
        endpoint_block,
    })
}

/// Assigns one bit from the endpoint block per live endpoint.
#[derive(Debug)]
pub struct EndpointMarkAllocator {
    block: u32,
    in_use: u32,
}

impl EndpointMarkAllocator {
    pub fn new(block: u32) -> Self {
        Self { block, in_use: 0 }
    }

    /// Allocate a free bit; `None` when the block is exhausted (the
    /// endpoint then runs unmarked).
    pub fn allocate(&mut self) -> Option<u32> {
        let free = self.block & !self.in_use;
        if free == 0 {
            return None;
        }
        let bit = 1u32 << free.trailing_zeros();
        self.in_use |= bit;
        Some(bit)
    }

    pub fn release(&mut self, bit: u32) {
        self.in_use &= !bit;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_bits_must_be_covered_in_bpf_mode() {
        let err = allocate(0x0000_ffff, true, false).unwrap_err();
        assert!(matches!(err, MarkError::FixedBitsNotCovered { .. }));
    }

    #[test]
    fn bpf_mode_skips_pass_bit() {
        let marks = allocate(0xffff_0000, true, false).unwrap();
        assert_eq!(marks.pass, 0);
        assert_ne!(marks.accept, 0);
        // Nothing allocated may overlap the fixed program bits.
        for bit in [marks.accept, marks.scratch0, marks.endpoint_block] {
            assert_eq!(bit & MARKS_MASK, 0, "{bit:#010x} overlaps fixed bits");
        }
    }

    #[test]
    fn legacy_mode_allocates_distinct_bits() {
        let marks = allocate(0x000f_0000, false, false).unwrap();
        let all = [marks.accept, marks.pass, marks.scratch0];
        for (i, a) in all.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &all[i + 1..] {
                assert_eq!(a & b, 0);
            }
        }
    }

    #[test]
    fn endpoint_marks_allocate_and_release() {
        let mut alloc = EndpointMarkAllocator::new(0b1110_0000);
        let a = alloc.allocate().unwrap();
        let b = alloc.allocate().unwrap();
        let c = alloc.allocate().unwrap();
        assert!(alloc.allocate().is_none());
        assert_eq!(a | b | c, 0b1110_0000);
        alloc.release(b);
        assert_eq!(alloc.allocate(), Some(b));
    }

    #[test]
    fn wireguard_bit_only_when_enabled() {
        let without = allocate(0x000f_0000, false, false).unwrap();
        assert_eq!(without.wireguard, 0);
        let with = allocate(0x000f_0000, false, true).unwrap();
        assert_ne!(with.wireguard, 0);
    }
}

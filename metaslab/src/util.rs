// vim: tw=80
//! Common utility functions used throughout the allocator

use std::{
    hash::Hasher,
    ops::{Add, Div, Sub},
};

/// Checksum an `IoVec` or anything else that looks like a byte slice
pub fn checksum_iovec<T: AsRef<[u8]>, H: Hasher>(iovec: &T, hasher: &mut H) {
    hasher.write(iovec.as_ref());
}

/// Checksum an `SGList`.
///
/// Hashing a slice is not the same thing as hashing its contents, because the
/// former includes the length.  This function hashes only the contents, so a
/// buffer has the same checksum whether it is split or not.
pub fn checksum_sglist<T, H>(sglist: &[T], hasher: &mut H)
    where T: AsRef<[u8]>, H: Hasher {

    for buf in sglist {
        let s: &[u8] = buf.as_ref();
        hasher.write(s);
    }
}

/// Divide two unsigned numbers (usually integers), rounding up.
pub fn div_roundup<T>(dividend: T, divisor: T) -> T
    where T: Add<Output=T> + Copy + Div<Output=T> + From<u8> + Sub<Output=T>
{
    (dividend + divisor - T::from(1u8)) / divisor
}

/// Index of the highest set bit, counting from 0.  `x` must be nonzero.
pub fn highbit(x: u64) -> u32 {
    debug_assert!(x != 0);
    63 - x.leading_zeros()
}

/// Is `x` a multiple of `align`?  `align` must be a power of two.
pub fn p2_aligned(x: u64, align: u64) -> bool {
    debug_assert!(align.is_power_of_two());
    x & (align - 1) == 0
}

/// Round `x` up to the next multiple of `align`, a power of two.
pub fn p2_roundup(x: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    x.wrapping_add(align - 1) & !(align - 1)
}

/// The largest power of two that divides `x`.  `x` must be nonzero.
pub fn p2_phase_align(x: u64) -> u64 {
    debug_assert!(x != 0);
    x & x.wrapping_neg()
}

// LCOV_EXCL_STOP

//! Deterministic byte patterns for verifying range reads.
//!
//! Every byte depends on its offset, so a read from the wrong offset or the
//! wrong object version is caught by a plain comparison.

/// Bytes `0..len` of the pattern for `seed`.
///
/// # Example
///
/// ```
/// use test_utils::pattern_bytes;
///
/// let a = pattern_bytes(1000, 1);
/// assert_eq!(a.len(), 1000);
/// assert_eq!(&a[10..20], &test_utils::pattern_slice(10, 10, 1)[..]);
/// assert_ne!(a, pattern_bytes(1000, 2));
/// ```
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    pattern_slice(0, len, seed)
}

/// Bytes `offset..offset + len` of the pattern for `seed`.
pub fn pattern_slice(offset: usize, len: usize, seed: u8) -> Vec<u8> {
    (offset..offset + len).map(|i| pattern_byte(i, seed)).collect()
}

fn pattern_byte(offset: usize, seed: u8) -> u8 {
    // 251 is prime, so the pattern does not repeat on power-of-two block sizes.
    ((offset % 251) as u8)
        .wrapping_mul(31)
        .wrapping_add(seed.wrapping_mul(97))
        ^ ((offset >> 8) as u8)
}

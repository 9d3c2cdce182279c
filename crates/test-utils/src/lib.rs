//! Shared test utilities for the block cache workspace.
//!
//! This crate provides common testing infrastructure including:
//! - An in-process HTTP range server with conditional request support
//! - Deterministic byte pattern generators
//! - Temporary data directories and polling helpers
//!
//! # Usage
//!
//! Add to your crate's `Cargo.toml`:
//!
//! ```toml
//! [dev-dependencies]
//! test-utils = { path = "../test-utils" }
//! ```
//!
//! Then import in your tests:
//!
//! ```ignore
//! use test_utils::{pattern_bytes, RangeServer};
//! ```

pub mod fixtures;
pub mod generators;
pub mod range_server;

// Re-export commonly used items at the crate root
pub use fixtures::*;
pub use generators::*;
pub use range_server::{http_date, RangeServer, RecordedRequest, StoredObject};

/// Assert that a byte slice equals the pattern for `seed` at `offset`.
///
/// # Usage
///
/// ```ignore
/// use test_utils::assert_pattern;
///
/// let bytes = manager.read_with(file, 4096, 100, |b| b.to_vec()).await?;
/// assert_pattern!(bytes, 4096, 1);
/// ```
#[macro_export]
macro_rules! assert_pattern {
    ($bytes:expr, $offset:expr, $seed:expr) => {{
        let bytes: &[u8] = &$bytes[..];
        let offset = $offset as usize;
        let expected = $crate::pattern_slice(offset, bytes.len(), $seed);
        if let Some(pos) = bytes.iter().zip(&expected).position(|(a, b)| a != b) {
            panic!(
                "assertion failed: pattern mismatch at offset {} (byte {} of {}): got {}, expected {}",
                offset + pos,
                pos,
                bytes.len(),
                bytes[pos],
                expected[pos]
            );
        }
    }};
}

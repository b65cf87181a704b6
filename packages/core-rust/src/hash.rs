//! FNV-1a URI hashing for legacy forest placement.
//!
//! The legacy assignment policy places a document by hashing its URI into a
//! 64-bit key and reducing that key modulo the number of placement forests.
//! The key function is the shared contract between this client and the
//! server's own placement: a document written through fast load must land in
//! the same forest the server would have chosen, so the constants and the
//! byte order here are pinned and covered by fixed test vectors.
//!
//! # Compatibility
//!
//! The hash iterates over the UTF-8 bytes of the URI text exactly as given.
//! No case folding or path normalisation is applied; two URIs that differ
//! only in case are different documents on the server as well.

/// FNV-1a offset basis (64-bit).
const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;

/// FNV-1a prime (64-bit).
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Number of fixed segments used by segment placement.
pub const SEGMENT_COUNT: u64 = 16_384;

/// Computes the 64-bit legacy placement key for a document URI.
///
/// # Examples
///
/// ```
/// use contentpump_core::hash::legacy_uri_key;
///
/// assert_eq!(legacy_uri_key(""), 0xcbf2_9ce4_8422_2325);
/// assert_eq!(legacy_uri_key("a"), 0xaf63_dc4c_8601_ec8c);
/// ```
#[must_use]
pub fn legacy_uri_key(uri: &str) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for byte in uri.bytes() {
        hash ^= u64::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Maps a URI to a forest index in `[0, forest_count)` the way the server does.
///
/// Returns `None` when `forest_count` is zero: there is nowhere to place the
/// document.
#[must_use]
#[allow(clippy::cast_possible_truncation)] // result < forest_count, which is a usize
pub fn legacy_placement(uri: &str, forest_count: usize) -> Option<usize> {
    match forest_count {
        0 => None,
        1 => Some(0),
        n => Some((legacy_uri_key(uri) % n as u64) as usize),
    }
}

/// Maps a URI to one of [`SEGMENT_COUNT`] fixed segments.
#[must_use]
pub fn segment_of(uri: &str) -> u64 {
    legacy_uri_key(uri) % SEGMENT_COUNT
}

//! Content fingerprints for normalized image payloads.

use sha2::{Digest, Sha256};

/// Default number of hex characters kept from the digest.
pub const DEFAULT_FINGERPRINT_LEN: usize = 16;

/// Full SHA-256 hex length; requested lengths are capped here.
pub const MAX_FINGERPRINT_LEN: usize = 64;

/// First `len` hex characters of the SHA-256 digest of `bytes`.
///
/// Used as a cache and dedup key, so it must depend on nothing but the
/// payload bytes.
///
/// ```rust
/// use partscan_core::fingerprint::fingerprint;
///
/// let fp = fingerprint(b"abc", 16);
/// assert_eq!(fp, "ba7816bf8f01cfea");
/// ```
pub fn fingerprint(bytes: &[u8], len: usize) -> String {
    let digest = Sha256::digest(bytes);
    let mut hex = hex::encode(digest);
    hex.truncate(len.min(MAX_FINGERPRINT_LEN));
    hex
}

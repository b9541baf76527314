//! Stable fingerprints for devpaths and rule lists.
//!
//! Fingerprints are URL/filename-safe so they can double as map keys in the
//! persisted databases and as path components.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// SHA-256 of `content`, URL-safe base64 without padding (43 chars).
pub fn fingerprint(content: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_ref());
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

/// Fingerprint of an ordered rule list.
///
/// Rules are delimited by a newline between elements (none after the last)
/// so that `[a]` and `[a, ""]` hash differently while `[a]` stays consistent
/// with `fingerprint(a)`.
pub fn fingerprint_rules<S: AsRef<str>>(rules: &[S]) -> String {
    let mut hasher = Sha256::new();
    let mut first = true;
    for rule in rules {
        if !first {
            hasher.update(b"\n");
        }
        first = false;
        hasher.update(rule.as_ref().as_bytes());
    }
    URL_SAFE_NO_PAD.encode(hasher.finalize())
}

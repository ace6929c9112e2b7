//! Content hashing for change detection
//!
//! A value is serialized to JSON and digested with SHA-256; the digest is
//! encoded URL-safe base64 without padding so it fits in a status field or a
//! label. Field order follows the struct definition and maps must be ordered
//! (`BTreeMap`), which keeps the hash stable across processes.

use aws_lc_rs::digest;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;

use crate::Error;

/// Compute the content hash of any serializable value
pub fn content_hash<T: Serialize + ?Sized>(value: &T) -> Result<String, Error> {
    let bytes = serde_json::to_vec(value)?;
    Ok(digest_bytes(&bytes))
}

/// Hash raw bytes with SHA-256 and encode the digest
pub fn digest_bytes(bytes: &[u8]) -> String {
    let d = digest::digest(&digest::SHA256, bytes);
    URL_SAFE_NO_PAD.encode(d.as_ref())
}

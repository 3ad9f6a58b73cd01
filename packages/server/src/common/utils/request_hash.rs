use serde::Serialize;
use sha2::{Digest, Sha256};

/// Generate the fingerprint of a normalized command payload.
///
/// The payload goes through `serde_json::Value` first, whose object map keeps
/// keys sorted, so the rendered JSON is canonical at every depth and two equal
/// values hash the same regardless of field declaration order. Normalizing the
/// values themselves (trimming, lower-casing slugs) is the caller's job.
///
/// Sorted keys depend on serde_json's `preserve_order` feature staying off.
pub fn generate_request_hash<T: Serialize + ?Sized>(payload: &T) -> serde_json::Result<String> {
    let canonical = serde_json::to_string(&serde_json::to_value(payload)?)?;

    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    Ok(format!("{:x}", hasher.finalize()))
}

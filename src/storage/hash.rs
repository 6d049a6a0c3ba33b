use sha2::{Digest, Sha256};

pub fn compute_hash(input: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    let digest = hasher.finalize();
    hex::encode(digest)
}

/// 20-character identifier in the style of cloud document stores.
pub fn document_id(seed: &str) -> String {
    let mut hash = compute_hash(seed);
    hash.truncate(20);
    hash
}

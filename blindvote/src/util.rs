use sha2::{Digest, Sha256};

/// SHA-256 of the given bytes
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hasher.finalize().into()
}

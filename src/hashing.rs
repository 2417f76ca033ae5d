use sha2::{Digest, Sha256};

/// Stable 64-bit hash over length-prefixed parts. Unlike `DefaultHasher`
/// this never changes between builds, so stored selections stay reproducible.
pub fn stable_hash<I, P>(parts: I) -> u64
where
    I: IntoIterator<Item = P>,
    P: AsRef<[u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        let part = part.as_ref();
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    let digest = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head)
}

use sha2::{Digest, Sha256};

/// Bump when the derivation changes; old outputs were made with other seeds.
pub const SEED_SCHEME_VERSION: u32 = 1;
pub const SEED_MODULUS: u64 = 1_000_000;

pub const COVER_TOKEN: &str = "cover";

/// Deterministic seed for `(story_id, token)`, where token is a segment index
/// or [`COVER_TOKEN`].
///
/// SHA-256 over the UTF-8 bytes of `story_id + token`, first eight bytes read
/// big-endian, reduced modulo [`SEED_MODULUS`]. Identical across processes and
/// platforms.
pub fn derive_seed(story_id: &str, token: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(story_id.as_bytes());
    hasher.update(token.as_bytes());
    let digest = hasher.finalize();

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    u64::from_be_bytes(head) % SEED_MODULUS
}

pub fn segment_seed(story_id: &str, index: u32) -> u64 {
    derive_seed(story_id, &index.to_string())
}

pub fn cover_seed(story_id: &str) -> u64 {
    derive_seed(story_id, COVER_TOKEN)
}

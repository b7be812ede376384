use sha1::{Digest, Sha1};

/// SHA-1 over the raw bencoded info dictionary.
pub fn info_hash(info_bytes: &[u8]) -> [u8; 20] {
    Sha1::digest(info_bytes).into()
}

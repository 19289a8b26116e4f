//! Hash helpers. All text digests are lowercase hex.

use md5::Md5;
use rand::RngCore;
use sha2::{Digest, Sha256};

/// SHA-256 of `data`, hex encoded. Used for block hashes and transaction digests.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// MD5 of `data`, hex encoded.
///
/// Only ever used to spread keys over shards. MD5's collision weakness
/// is irrelevant there: a collision just puts two keys in the same shard.
pub fn md5_hex(data: &[u8]) -> String {
    hex::encode(md5_digest(data))
}

/// Raw MD5 digest of `data`.
pub fn md5_digest(data: &[u8]) -> [u8; 16] {
    let mut hasher = Md5::new();
    hasher.update(data);
    let mut output = [0u8; 16];
    output.copy_from_slice(&hasher.finalize());
    output
}

/// BLAKE3 digest of `data`.
pub fn blake3_hash(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// `len` random bytes from the thread RNG, hex encoded.
///
/// Node ids, offer ids, and request correlation ids are all produced here.
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn md5_known_vector() {
        assert_eq!(md5_hex(b"abc"), "900150983cd24fb0d6963f7d28e17f72");
        assert_eq!(md5_hex(b""), "d41d8cd98f00b204e9800998ecf8427e");
    }

    #[test]
    fn blake3_is_deterministic() {
        assert_eq!(blake3_hash(b"envelope"), blake3_hash(b"envelope"));
        assert_ne!(blake3_hash(b"envelope"), blake3_hash(b"envelope2"));
    }

    #[test]
    fn random_hex_has_requested_length() {
        let id = random_hex(8);
        assert_eq!(id.len(), 16);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(random_hex(16), random_hex(16));
    }
}

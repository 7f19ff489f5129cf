//! blake2b-256 helpers.

use blake2::digest::consts::U32;
use blake2::digest::Mac;
use blake2::{Blake2b, Blake2bMac, Digest};

use crate::bytes::Blake2b32;

type Blake2b256 = Blake2b<U32>;

/// Unkeyed blake2b-256 over the concatenation of `parts`.
pub fn blake2b_32(parts: &[&[u8]]) -> Blake2b32 {
    let mut h = Blake2b256::new();
    for part in parts {
        h.update(part);
    }
    Blake2b32(h.finalize().into())
}

/// Keyed blake2b-256 over the concatenation of `parts`.  The key must be
/// at most 64 bytes (a blake2b limit).
pub fn blake2b_32_keyed(key: &[u8], parts: &[&[u8]]) -> Blake2b32 {
    let mut h =
        Blake2bMac::<U32>::new_from_slice(key).expect("blake2b key must be <= 64 bytes");
    for part in parts {
        Mac::update(&mut h, part);
    }
    Blake2b32(h.finalize().into_bytes().into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn concatenation_is_equivalent_to_one_part() {
        let whole = blake2b_32(&[b"hello world"]);
        let split = blake2b_32(&[b"hello", b" ", b"world"]);
        assert_eq!(whole, split);
    }

    #[test]
    fn keyed_differs_from_unkeyed() {
        let plain = blake2b_32(&[b"payload"]);
        let keyed = blake2b_32_keyed(b"some key", &[b"payload"]);
        assert_ne!(plain, keyed);
    }

    #[test]
    fn distinct_inputs_distinct_digests() {
        assert_ne!(blake2b_32(&[b"a"]), blake2b_32(&[b"b"]));
        assert_ne!(
            blake2b_32_keyed(b"k1", &[b"a"]),
            blake2b_32_keyed(b"k2", &[b"a"])
        );
    }
}

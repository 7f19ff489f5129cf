//! Crypto primitives for the push notification relay: fixed-size byte
//! types, blake2b hashing, and the ed25519 signature schemes used to
//! authorize swarm subscriptions.

pub mod bytes;
pub mod hash;
pub mod signature;
pub mod subaccount;

pub use bytes::{
    AccountId, Blake2b32, EncKey, Ed25519Pk, ParseBytesError, Signature, SubaccountTag, SubkeyTag,
    X25519Pk, X25519Sk,
};
pub use hash::{blake2b_32, blake2b_32_keyed};
pub use signature::{
    ed25519_to_x25519, verify_signature, verify_subscription_signature, SignatureError,
};
pub use subaccount::{Subaccount, Subauth};

use rand_core::OsRng;

/// Generates a fresh x25519 identity keypair, e.g. for a new relay
/// deployment.  Returns `(pubkey, privkey)`.
pub fn generate_x25519_identity() -> (X25519Pk, X25519Sk) {
    let secret = x25519_dalek::StaticSecret::random_from_rng(OsRng);
    let public = x25519_dalek::PublicKey::from(&secret);
    (X25519Pk(public.to_bytes()), X25519Sk(secret.to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_keypair_is_consistent() {
        let (pk, sk) = generate_x25519_identity();
        let derived = x25519_dalek::PublicKey::from(&x25519_dalek::StaticSecret::from(sk.0));
        assert_eq!(pk.0, derived.to_bytes());
    }
}

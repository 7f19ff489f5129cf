//! ed25519 signature verification for subscription requests, including
//! both subaccount authorization schemes.

use curve25519_dalek::edwards::CompressedEdwardsY;
use curve25519_dalek::scalar::Scalar;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;

use crate::bytes::{Ed25519Pk, Signature, SubkeyTag, X25519Pk};
use crate::hash::blake2b_32_keyed;
use crate::subaccount::{Subauth, FLAG_ANY_PREFIX, FLAG_READ};

/// Keyed-hash domain for the legacy derived-subkey scheme.
const SUBKEY_HASH_KEY: &[u8] = b"OxenSSSubkey";

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("signature verification failed")]
    BadSignature,
    #[error("invalid ed25519 public key")]
    BadPublicKey,
    #[error("subaccount tag does not grant read access")]
    SubaccountNotReadable,
    #[error("subaccount tag is for a different network prefix")]
    SubaccountWrongNetwork,
    #[error("failed to derive subkey public key")]
    SubkeyDerivation,
}

/// Plain ed25519 signature verification.
pub fn verify_signature(
    msg: &[u8],
    sig: &Signature,
    pubkey: &Ed25519Pk,
) -> Result<(), SignatureError> {
    let key = VerifyingKey::from_bytes(&pubkey.0).map_err(|_| SignatureError::BadPublicKey)?;
    let sig = ed25519_dalek::Signature::from_bytes(&sig.0);
    key.verify_strict(msg, &sig)
        .map_err(|_| SignatureError::BadSignature)
}

/// Verifies a subscription (or unsubscription) request signature.
///
/// With no subaccount authorization the signature must verify against
/// the account's own ed25519 pubkey.  With a delegated subaccount, the
/// tag must grant read access and match the account's network prefix
/// (unless the any-prefix flag is set), the tag signature must verify
/// against the owner key, and the request signature must verify against
/// the delegated pubkey.  With a legacy subkey tag the request signature
/// verifies against the derived pubkey `(c + H(c ‖ A)) A`.
pub fn verify_subscription_signature(
    msg: &[u8],
    sig: &Signature,
    network_prefix: u8,
    owner: &Ed25519Pk,
    auth: Option<&Subauth>,
) -> Result<(), SignatureError> {
    match auth {
        None => verify_signature(msg, sig, owner),
        Some(Subauth::Delegated(sub)) => {
            if sub.tag.flags() & FLAG_READ == 0 {
                return Err(SignatureError::SubaccountNotReadable);
            }
            if sub.tag.flags() & FLAG_ANY_PREFIX == 0
                && sub.tag.network_prefix() != network_prefix
            {
                return Err(SignatureError::SubaccountWrongNetwork);
            }
            verify_signature(&sub.tag.0, &sub.sig, owner)?;
            verify_signature(msg, sig, &sub.tag.delegated_pubkey())
        }
        Some(Subauth::LegacySubkey(tag)) => {
            let derived = derive_legacy_subkey(tag, owner)?;
            verify_signature(msg, sig, &derived)
        }
    }
}

/// Legacy subkey derivation: `(c + H(c ‖ A, key="OxenSSSubkey")) A`
/// where `c` is the subkey tag scalar and `A` the owner pubkey point.
pub fn derive_legacy_subkey(
    tag: &SubkeyTag,
    owner: &Ed25519Pk,
) -> Result<Ed25519Pk, SignatureError> {
    let digest = blake2b_32_keyed(SUBKEY_HASH_KEY, &[&tag.0, &owner.0]);
    let scalar =
        Scalar::from_bytes_mod_order(tag.0) + Scalar::from_bytes_mod_order(digest.0);
    let point = CompressedEdwardsY(owner.0)
        .decompress()
        .ok_or(SignatureError::SubkeyDerivation)?;
    Ok(Ed25519Pk((point * scalar).compress().to_bytes()))
}

/// Converts an ed25519 pubkey to its x25519 (curve25519) form, as used
/// to cross-check a session account id against its claimed ed25519 key.
pub fn ed25519_to_x25519(ed: &Ed25519Pk) -> Result<X25519Pk, SignatureError> {
    let key = VerifyingKey::from_bytes(&ed.0).map_err(|_| SignatureError::BadPublicKey)?;
    Ok(X25519Pk(key.to_montgomery().to_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytes::SubaccountTag;
    use crate::subaccount::{Subaccount, FLAG_WRITE};
    use ed25519_dalek::{Signer, SigningKey};
    use rand_core::OsRng;

    fn keypair() -> (SigningKey, Ed25519Pk) {
        let sk = SigningKey::generate(&mut OsRng);
        let pk = Ed25519Pk(sk.verifying_key().to_bytes());
        (sk, pk)
    }

    fn sign(sk: &SigningKey, msg: &[u8]) -> Signature {
        Signature(sk.sign(msg).to_bytes())
    }

    #[test]
    fn direct_signature_verifies() {
        let (sk, pk) = keypair();
        let msg = b"MONITOR05aa17";
        let sig = sign(&sk, msg);
        assert!(verify_subscription_signature(msg, &sig, 0x05, &pk, None).is_ok());
        assert!(verify_subscription_signature(b"other", &sig, 0x05, &pk, None).is_err());
    }

    #[test]
    fn delegated_subaccount_verifies() {
        let (owner_sk, owner_pk) = keypair();
        let (delegated_sk, delegated_pk) = keypair();

        let tag = SubaccountTag::build(0x05, FLAG_READ, &delegated_pk);
        let auth = Subauth::Delegated(Subaccount {
            tag,
            sig: sign(&owner_sk, &tag.0),
        });

        let msg = b"MONITOR...";
        let sig = sign(&delegated_sk, msg);
        assert!(verify_subscription_signature(msg, &sig, 0x05, &owner_pk, Some(&auth)).is_ok());

        // Signed by the owner instead of the delegated key: rejected.
        let owner_signed = sign(&owner_sk, msg);
        assert!(
            verify_subscription_signature(msg, &owner_signed, 0x05, &owner_pk, Some(&auth))
                .is_err()
        );
    }

    #[test]
    fn subaccount_requires_read_flag() {
        let (owner_sk, owner_pk) = keypair();
        let (delegated_sk, delegated_pk) = keypair();

        let tag = SubaccountTag::build(0x05, FLAG_WRITE, &delegated_pk);
        let auth = Subauth::Delegated(Subaccount {
            tag,
            sig: sign(&owner_sk, &tag.0),
        });
        let msg = b"msg";
        let sig = sign(&delegated_sk, msg);
        assert!(matches!(
            verify_subscription_signature(msg, &sig, 0x05, &owner_pk, Some(&auth)),
            Err(SignatureError::SubaccountNotReadable)
        ));
    }

    #[test]
    fn subaccount_network_prefix_must_match_unless_any() {
        let (owner_sk, owner_pk) = keypair();
        let (delegated_sk, delegated_pk) = keypair();
        let msg = b"msg";
        let sig = sign(&delegated_sk, msg);

        let tag = SubaccountTag::build(0x03, FLAG_READ, &delegated_pk);
        let auth = Subauth::Delegated(Subaccount {
            tag,
            sig: sign(&owner_sk, &tag.0),
        });
        assert!(matches!(
            verify_subscription_signature(msg, &sig, 0x05, &owner_pk, Some(&auth)),
            Err(SignatureError::SubaccountWrongNetwork)
        ));

        let tag = SubaccountTag::build(0x03, FLAG_READ | FLAG_ANY_PREFIX, &delegated_pk);
        let auth = Subauth::Delegated(Subaccount {
            tag,
            sig: sign(&owner_sk, &tag.0),
        });
        assert!(verify_subscription_signature(msg, &sig, 0x05, &owner_pk, Some(&auth)).is_ok());
    }

    #[test]
    fn subaccount_tag_signature_must_be_owners() {
        let (_owner_sk, owner_pk) = keypair();
        let (delegated_sk, delegated_pk) = keypair();
        let (imposter_sk, _) = keypair();

        let tag = SubaccountTag::build(0x05, FLAG_READ, &delegated_pk);
        let auth = Subauth::Delegated(Subaccount {
            tag,
            sig: sign(&imposter_sk, &tag.0),
        });
        let msg = b"msg";
        let sig = sign(&delegated_sk, msg);
        assert!(matches!(
            verify_subscription_signature(msg, &sig, 0x05, &owner_pk, Some(&auth)),
            Err(SignatureError::BadSignature)
        ));
    }

    #[test]
    fn legacy_subkey_derivation_is_deterministic() {
        let (_, owner_pk) = keypair();
        let tag = SubkeyTag([7u8; 32]);
        let a = derive_legacy_subkey(&tag, &owner_pk).unwrap();
        let b = derive_legacy_subkey(&tag, &owner_pk).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, owner_pk);

        // A garbage signature does not verify against the derived key.
        let sig = Signature([0u8; 64]);
        assert!(verify_subscription_signature(
            b"msg",
            &sig,
            0x05,
            &owner_pk,
            Some(&Subauth::LegacySubkey(tag))
        )
        .is_err());
    }

    #[test]
    fn ed25519_to_x25519_conversion() {
        let (_, pk) = keypair();
        let x1 = ed25519_to_x25519(&pk).unwrap();
        let x2 = ed25519_to_x25519(&pk).unwrap();
        assert_eq!(x1, x2);
        assert_ne!(x1.0, pk.0);
    }
}

//! Delegated subaccount authorization.
//!
//! An account owner can delegate signing to another device by issuing a
//! 36-byte subaccount tag laid out as `(netprefix, flags, reserved[2],
//! delegated_pubkey[32])` together with an ed25519 signature over the
//! raw tag made with the owner key.  A request authorized this way
//! carries both the tag and the owner's tag signature; the request
//! signature itself is made by the delegated key.

use crate::bytes::{Ed25519Pk, Signature, SubaccountTag, SubkeyTag};

/// Subaccount flag bits (byte 1 of the tag).
pub const FLAG_READ: u8 = 0x01;
pub const FLAG_WRITE: u8 = 0x02;
pub const FLAG_DELETE: u8 = 0x04;
/// When set, the tag is valid for any network prefix rather than just
/// the one in byte 0.
pub const FLAG_ANY_PREFIX: u8 = 0x08;

impl SubaccountTag {
    pub fn network_prefix(&self) -> u8 {
        self.0[0]
    }

    pub fn flags(&self) -> u8 {
        self.0[1]
    }

    /// The delegated ed25519 pubkey (bytes 4..36).
    pub fn delegated_pubkey(&self) -> Ed25519Pk {
        let mut pk = [0u8; 32];
        pk.copy_from_slice(&self.0[4..36]);
        Ed25519Pk(pk)
    }

    /// Builds a tag from its parts; the two reserved bytes are zeroed.
    pub fn build(network_prefix: u8, flags: u8, delegated: &Ed25519Pk) -> Self {
        let mut tag = [0u8; 36];
        tag[0] = network_prefix;
        tag[1] = flags;
        tag[4..36].copy_from_slice(&delegated.0);
        Self(tag)
    }
}

/// A delegated subaccount authorization: the owner-issued tag plus the
/// owner's signature over it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Subaccount {
    pub tag: SubaccountTag,
    pub sig: Signature,
}

/// How a subscription request is authorized when not signed directly by
/// the account owner.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subauth {
    /// The delegated subaccount scheme.
    Delegated(Subaccount),
    /// The historical derived-subkey scheme; only honored when the relay
    /// is configured to accept it.
    LegacySubkey(SubkeyTag),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_layout_round_trips() {
        let delegated = Ed25519Pk([0x42; 32]);
        let tag = SubaccountTag::build(0x05, FLAG_READ | FLAG_WRITE, &delegated);
        assert_eq!(tag.network_prefix(), 0x05);
        assert_eq!(tag.flags(), FLAG_READ | FLAG_WRITE);
        assert_eq!(tag.delegated_pubkey(), delegated);
        assert_eq!(tag.0[2], 0);
        assert_eq!(tag.0[3], 0);
    }
}

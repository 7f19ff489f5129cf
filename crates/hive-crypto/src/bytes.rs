//! Fixed-size byte array newtypes used throughout the relay.
//!
//! Values arrive from clients as raw bytes, hex, or (possibly unpadded)
//! base64; [`from_str`](AccountId::from_str) style parsing accepts all
//! three, keyed on input length.

use std::fmt;

use base64::Engine;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ParseBytesError {
    #[error("invalid value: expected {expected} bytes, {expected_hex} hex chars, or base64")]
    BadLength { expected: usize, expected_hex: usize },
    #[error("invalid hex encoding")]
    BadHex,
    #[error("invalid base64 encoding")]
    BadBase64,
}

macro_rules! byte_array {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            pub const SIZE: usize = $len;

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Parses from raw bytes, hex, or base64, keyed on length.
            pub fn parse(input: &[u8]) -> Result<Self, ParseBytesError> {
                parse_fixed(input).map(Self)
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(raw: [u8; $len]) -> Self {
                Self(raw)
            }
        }

        impl TryFrom<&[u8]> for $name {
            type Error = ParseBytesError;
            fn try_from(raw: &[u8]) -> Result<Self, ParseBytesError> {
                let arr: [u8; $len] = raw.try_into().map_err(|_| ParseBytesError::BadLength {
                    expected: $len,
                    expected_hex: 2 * $len,
                })?;
                Ok(Self(arr))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.to_hex())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.to_hex())
            }
        }

        impl serde::Serialize for $name {
            fn serialize<S: serde::Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
                s.serialize_str(&self.to_hex())
            }
        }

        impl<'de> serde::Deserialize<'de> for $name {
            fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
                let raw = <String as serde::Deserialize>::deserialize(d)?;
                Self::parse(raw.as_bytes()).map_err(serde::de::Error::custom)
            }
        }
    };
}

// Pubkey-sized (and larger) types hash well by reading a word out of the
// middle of the value: the contents are uniformly distributed already, so
// feeding the whole array through a hasher is wasted work.  Only types of
// at least 32 bytes may opt in.
macro_rules! entropy_hash {
    ($name:ident) => {
        const _: () = assert!($name::SIZE >= 32);

        #[allow(clippy::derived_hash_with_manual_eq)]
        impl std::hash::Hash for $name {
            fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
                let mut word = [0u8; 8];
                word.copy_from_slice(&self.0[16..24]);
                state.write_u64(u64::from_ne_bytes(word));
            }
        }
    };
}

byte_array!(
    /// A 33-byte account id; byte 0 is the network prefix (0x05 for user
    /// accounts, 0x03 for groups), the rest is a pubkey.
    AccountId,
    33
);
byte_array!(Ed25519Pk, 32);
byte_array!(X25519Pk, 32);
byte_array!(X25519Sk, 32);
byte_array!(
    /// An ed25519 signature.
    Signature,
    64
);
byte_array!(
    /// Per-subscription notification payload encryption key.
    EncKey,
    32
);
byte_array!(
    /// Legacy derived-subkey tag (a scalar).
    SubkeyTag,
    32
);
byte_array!(
    /// Delegated subaccount tag: `(netprefix, flags, reserved[2], pubkey[32])`.
    SubaccountTag,
    36
);
byte_array!(
    /// 32-byte blake2b digest, used for notification dedup tags.
    Blake2b32,
    32
);

entropy_hash!(AccountId);
entropy_hash!(Ed25519Pk);
entropy_hash!(X25519Pk);
entropy_hash!(Blake2b32);
entropy_hash!(SubaccountTag);

impl AccountId {
    /// The network prefix byte.
    pub fn network_prefix(&self) -> u8 {
        self.0[0]
    }

    /// The 32 pubkey bytes following the prefix.
    pub fn pubkey_bytes(&self) -> [u8; 32] {
        let mut out = [0u8; 32];
        out.copy_from_slice(&self.0[1..33]);
        out
    }
}

fn parse_fixed<const N: usize>(input: &[u8]) -> Result<[u8; N], ParseBytesError> {
    if input.len() == N {
        let mut out = [0u8; N];
        out.copy_from_slice(input);
        return Ok(out);
    }
    if input.len() == 2 * N {
        let mut out = [0u8; N];
        hex::decode_to_slice(input, &mut out).map_err(|_| ParseBytesError::BadHex)?;
        return Ok(out);
    }
    // Strip any base64 padding, then require the exact unpadded length.
    let mut b64 = input;
    while let [rest @ .., b'='] = b64 {
        b64 = rest;
    }
    if b64.len() == (N * 4 + 2) / 3 {
        let decoded = base64::engine::general_purpose::STANDARD_NO_PAD
            .decode(b64)
            .map_err(|_| ParseBytesError::BadBase64)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&decoded);
        return Ok(out);
    }
    Err(ParseBytesError::BadLength {
        expected: N,
        expected_hex: 2 * N,
    })
}

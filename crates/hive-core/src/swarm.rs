//! Account identity and swarm assignment.
//!
//! Every account maps to a 64-bit "swarm space" coordinate derived from
//! its id; the network's swarms carve up that space and the closest
//! swarm (circularly) is responsible for the account's inbox.

use hive_crypto::{ed25519_to_x25519, AccountId, Ed25519Pk};
use thiserror::Error;

/// Network prefix for user (session) accounts.
pub const PREFIX_USER: u8 = 0x05;
/// Network prefix for group accounts.
pub const PREFIX_GROUP: u8 = 0x03;

/// Sentinel swarm id for "not assigned to any swarm".
pub const INVALID_SWARM_ID: u64 = u64::MAX;

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("session_ed25519 may only be used with 05-prefixed session IDs")]
    SessionEdWrongPrefix,
    #[error("session_ed25519 is required for 05-prefixed session IDs")]
    SessionEdMissing,
    #[error("failed to convert session_ed25519 to x25519 pubkey")]
    SessionEdInvalid,
    #[error("account_id/session_ed25519 mismatch: session_ed25519 does not convert to given account_id")]
    SessionEdMismatch,
}

/// An account key prepared for swarm duty: the raw account id, the
/// ed25519 key that actually signs for it, and the derived swarm-space
/// coordinate.  Identity (equality, hashing) is the account id alone.
#[derive(Clone, Copy, Debug)]
pub struct SwarmPubkey {
    pub id: AccountId,
    pub ed25519: Ed25519Pk,
    /// True when the signing key differs from the account id body, i.e.
    /// for session accounts whose id is an x25519 conversion.
    pub session_ed: bool,
    pub swarm_space: u64,
}

impl PartialEq for SwarmPubkey {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for SwarmPubkey {}

impl std::hash::Hash for SwarmPubkey {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

fn swarm_space(id: &AccountId) -> u64 {
    // XOR of the four big-endian 8-byte chunks of the pubkey body
    // (bytes 1..33; the prefix byte is not included).
    let mut space = 0u64;
    for chunk in id.0[1..33].chunks_exact(8) {
        space ^= u64::from_be_bytes(chunk.try_into().unwrap());
    }
    space
}

impl SwarmPubkey {
    /// Builds and validates a swarm pubkey.  For 05-prefixed accounts a
    /// `session_ed25519` key is required and must convert (x25519) back
    /// to the account id; for other prefixes the account id body *is*
    /// the ed25519 key and `session_ed25519` must be absent.
    pub fn new(id: AccountId, session_ed25519: Option<Ed25519Pk>) -> Result<Self, AccountError> {
        match session_ed25519 {
            Some(ed) => {
                if id.network_prefix() != PREFIX_USER {
                    return Err(AccountError::SessionEdWrongPrefix);
                }
                let x = ed25519_to_x25519(&ed).map_err(|_| AccountError::SessionEdInvalid)?;
                let mut derived = [0u8; 33];
                derived[0] = PREFIX_USER;
                derived[1..33].copy_from_slice(&x.0);
                if AccountId(derived) != id {
                    return Err(AccountError::SessionEdMismatch);
                }
                Ok(Self::trusted(id, Some(ed)))
            }
            None => {
                if id.network_prefix() == PREFIX_USER {
                    return Err(AccountError::SessionEdMissing);
                }
                Ok(Self::trusted(id, None))
            }
        }
    }

    /// Builds without the id/key consistency check; for rows reloaded
    /// from the store, which were validated when first accepted.
    pub fn trusted(id: AccountId, session_ed25519: Option<Ed25519Pk>) -> Self {
        let (ed25519, session_ed) = match session_ed25519 {
            Some(ed) => (ed, true),
            None => (Ed25519Pk(id.pubkey_bytes()), false),
        };
        Self {
            swarm_space: swarm_space(&id),
            id,
            ed25519,
            session_ed,
        }
    }

    /// The swarm responsible for this account given the sorted list of
    /// swarm ids; [`INVALID_SWARM_ID`] if the list is empty.
    pub fn closest_swarm(&self, swarm_ids: &[u64]) -> u64 {
        closest_swarm(self.swarm_space, swarm_ids)
    }
}

/// Finds the swarm id circularly closest to `space`.  `swarm_ids` must
/// be sorted ascending.  Ties go to the right neighbor.
pub fn closest_swarm(space: u64, swarm_ids: &[u64]) -> u64 {
    match swarm_ids {
        [] => INVALID_SWARM_ID,
        [only] => *only,
        _ => {
            // First swarm id >= space, wrapping to the front if space is
            // beyond the last one.
            let right_idx = swarm_ids.partition_point(|&id| id < space) % swarm_ids.len();
            let left_idx = if right_idx == 0 {
                swarm_ids.len() - 1
            } else {
                right_idx - 1
            };
            let dright = swarm_ids[right_idx].wrapping_sub(space);
            let dleft = space.wrapping_sub(swarm_ids[left_idx]);
            // Equidistant picks the right neighbor.
            if dright <= dleft {
                swarm_ids[right_idx]
            } else {
                swarm_ids[left_idx]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand_core::OsRng;

    fn session_account() -> (SigningKey, AccountId, Ed25519Pk) {
        let sk = SigningKey::generate(&mut OsRng);
        let ed = Ed25519Pk(sk.verifying_key().to_bytes());
        let x = ed25519_to_x25519(&ed).unwrap();
        let mut id = [0u8; 33];
        id[0] = PREFIX_USER;
        id[1..33].copy_from_slice(&x.0);
        (sk, AccountId(id), ed)
    }

    #[test]
    fn session_account_validates() {
        let (_, id, ed) = session_account();
        let pk = SwarmPubkey::new(id, Some(ed)).unwrap();
        assert!(pk.session_ed);
        assert_eq!(pk.ed25519, ed);
    }

    #[test]
    fn session_account_mismatch_rejected() {
        let (_, id, _) = session_account();
        let (_, _, other_ed) = session_account();
        assert!(matches!(
            SwarmPubkey::new(id, Some(other_ed)),
            Err(AccountError::SessionEdMismatch)
        ));
    }

    #[test]
    fn session_account_requires_ed() {
        let (_, id, _) = session_account();
        assert!(matches!(
            SwarmPubkey::new(id, None),
            Err(AccountError::SessionEdMissing)
        ));
    }

    #[test]
    fn group_account_uses_id_body_as_ed() {
        let mut raw = [7u8; 33];
        raw[0] = PREFIX_GROUP;
        let id = AccountId(raw);
        let pk = SwarmPubkey::new(id, None).unwrap();
        assert!(!pk.session_ed);
        assert_eq!(pk.ed25519.0, id.pubkey_bytes());
    }

    #[test]
    fn group_account_rejects_session_ed() {
        let mut raw = [7u8; 33];
        raw[0] = PREFIX_GROUP;
        let (_, _, ed) = session_account();
        assert!(matches!(
            SwarmPubkey::new(AccountId(raw), Some(ed)),
            Err(AccountError::SessionEdWrongPrefix)
        ));
    }

    #[test]
    fn swarm_space_xor_fold() {
        let mut raw = [0u8; 33];
        raw[0] = PREFIX_GROUP;
        raw[1] = 0x01; // chunk 0: 0x0100_0000_0000_0000
        raw[9] = 0x02; // chunk 1: 0x0200_0000_0000_0000
        let id = AccountId(raw);
        let pk = SwarmPubkey::trusted(id, None);
        assert_eq!(pk.swarm_space, 0x0300_0000_0000_0000);
    }

    #[test]
    fn closest_swarm_edge_cases() {
        assert_eq!(closest_swarm(5, &[]), INVALID_SWARM_ID);
        assert_eq!(closest_swarm(5, &[100]), 100);

        // Between two ids: whichever is circularly closer wins.
        assert_eq!(closest_swarm(40, &[10, 100]), 10);
        assert_eq!(closest_swarm(90, &[10, 100]), 100);

        // Exact tie goes to the right.
        assert_eq!(closest_swarm(55, &[10, 100]), 100);

        // Above the top id: wraps into the gap between last and first.
        assert_eq!(closest_swarm(u64::MAX - 5, &[10, 100]), 10);
        // Just past the last id, still closer to it than the wrap.
        assert_eq!(closest_swarm(110, &[10, 100]), 100);

        // Exactly on an id.
        assert_eq!(closest_swarm(100, &[10, 100, 200]), 100);
    }

    #[test]
    fn closest_swarm_is_stable() {
        let ids = vec![5, 900, 4_000_000, u64::MAX - 3];
        let (_, id, ed) = session_account();
        let pk = SwarmPubkey::new(id, Some(ed)).unwrap();
        let first = pk.closest_swarm(&ids);
        assert_eq!(first, pk.closest_swarm(&ids));
        assert!(ids.contains(&first));
    }
}

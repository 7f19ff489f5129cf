//! Property tests for the pure parts: swarm assignment, subscription
//! coverage, and the bencode codec.

use proptest::prelude::*;

use crate::bt::{BtDictReader, BtDictWriter};
use crate::subscription::Subscription;
use crate::swarm::{closest_swarm, INVALID_SWARM_ID};
use hive_crypto::Signature;

fn sorted_unique(mut ids: Vec<u64>) -> Vec<u64> {
    ids.retain(|&id| id != INVALID_SWARM_ID);
    ids.sort_unstable();
    ids.dedup();
    ids
}

proptest! {
    /// The assigned swarm is always a member of the id list (or the
    /// sentinel when the list is empty), and assignment is stable.
    #[test]
    fn closest_swarm_is_a_member(
        space in any::<u64>(),
        ids in prop::collection::vec(any::<u64>(), 0..20),
    ) {
        let ids = sorted_unique(ids);
        let chosen = closest_swarm(space, &ids);
        if ids.is_empty() {
            prop_assert_eq!(chosen, INVALID_SWARM_ID);
        } else {
            prop_assert!(ids.contains(&chosen));
        }
        prop_assert_eq!(chosen, closest_swarm(space, &ids));
    }

    /// No other swarm is circularly closer than the assigned one.
    #[test]
    fn closest_swarm_minimizes_distance(
        space in any::<u64>(),
        ids in prop::collection::vec(any::<u64>(), 1..20),
    ) {
        let ids = sorted_unique(ids);
        prop_assume!(!ids.is_empty());
        let chosen = closest_swarm(space, &ids);
        let dist = |id: u64| {
            let right = id.wrapping_sub(space);
            let left = space.wrapping_sub(id);
            right.min(left)
        };
        for &id in &ids {
            prop_assert!(dist(chosen) <= dist(id));
        }
    }

    /// A subscription always covers any subset of its own namespaces
    /// (with the same auth and an equal-or-weaker data flag).
    #[test]
    fn covers_any_subset(
        ns in prop::collection::btree_set(any::<i16>(), 1..12),
        keep in prop::collection::vec(any::<bool>(), 12),
        want_data in any::<bool>(),
    ) {
        let full: Vec<i16> = ns.into_iter().collect();
        let subset: Vec<i16> = full
            .iter()
            .zip(keep.iter().chain(std::iter::repeat(&true)))
            .filter(|(_, keep)| **keep)
            .map(|(ns, _)| *ns)
            .collect();
        prop_assume!(!subset.is_empty());

        let big = Subscription::trusted(None, full, want_data, 1, Signature([0; 64]));
        let small = Subscription::trusted(None, subset.clone(), false, 1, Signature([0; 64]));
        prop_assert!(big.covers(&small));

        // Dropping any namespace breaks coverage in the other direction.
        if subset.len() < big.namespaces.len() {
            prop_assert!(!small.covers(&big));
        }
    }

    /// Dict entries written in order come back out byte-for-byte.
    #[test]
    fn bt_dict_round_trips(
        blob in prop::collection::vec(any::<u8>(), 0..200),
        int in any::<i64>(),
    ) {
        let mut buf = Vec::new();
        let mut dict = BtDictWriter::new(&mut buf);
        dict.append_str("a", &blob);
        dict.append_int("b", int);
        dict.finish();

        let mut rd = BtDictReader::new(&buf).unwrap();
        prop_assert!(rd.skip_until(b"a").unwrap());
        prop_assert_eq!(rd.string().unwrap(), &blob[..]);
        prop_assert!(rd.skip_until(b"b").unwrap());
        prop_assert_eq!(rd.integer::<i64>().unwrap(), int);
    }
}

//! The validated subscription value object.

use hive_crypto::{verify_subscription_signature, Signature, Subauth};

use crate::error::SubscribeError;
use crate::swarm::SwarmPubkey;

/// How long a subscription signature stays valid.  The storage servers
/// cut subscriptions off at 14 days, so ours can be no longer.
pub const SIGNATURE_EXPIRY_SECS: i64 = 14 * 24 * 60 * 60;

/// How far an unsubscribe signature timestamp may deviate from now.
pub const UNSUBSCRIBE_GRACE_SECS: i64 = 24 * 60 * 60;

/// Current unix timestamp in seconds.
pub fn unix_now() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// A single validated device subscription for one account.
#[derive(Clone, Debug)]
pub struct Subscription {
    pub auth: Option<Subauth>,
    /// Strictly ascending namespace list; never empty.
    pub namespaces: Vec<i16>,
    pub want_data: bool,
    pub sig_ts: i64,
    pub sig: Signature,
}

/// The canonical message signed for a subscribe request:
/// `MONITOR` ‖ hex(account) ‖ sig_ts ‖ 0|1 ‖ ns0,ns1,...
pub fn monitor_message(
    pubkey: &SwarmPubkey,
    sig_ts: i64,
    want_data: bool,
    namespaces: &[i16],
) -> String {
    let mut msg = String::with_capacity(7 + 66 + 12 + 1 + 7 * namespaces.len());
    msg.push_str("MONITOR");
    msg.push_str(&pubkey.id.to_hex());
    msg.push_str(&sig_ts.to_string());
    msg.push(if want_data { '1' } else { '0' });
    for (i, ns) in namespaces.iter().enumerate() {
        if i > 0 {
            msg.push(',');
        }
        msg.push_str(&ns.to_string());
    }
    msg
}

/// The canonical message signed for an unsubscribe request:
/// `UNSUBSCRIBE` ‖ hex(account) ‖ sig_ts.
pub fn unsubscribe_message(pubkey: &SwarmPubkey, sig_ts: i64) -> String {
    format!("UNSUBSCRIBE{}{}", pubkey.id.to_hex(), sig_ts)
}

/// True when two optional subauths use the same scheme and tag (the tag
/// signature does not contribute to subscription identity).
pub fn same_auth(a: &Option<Subauth>, b: &Option<Subauth>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Subauth::Delegated(x)), Some(Subauth::Delegated(y))) => x.tag == y.tag,
        (Some(Subauth::LegacySubkey(x)), Some(Subauth::LegacySubkey(y))) => x == y,
        _ => false,
    }
}

impl Subscription {
    /// Validates and constructs a subscription: namespaces must be a
    /// non-empty strictly ascending list, `sig_ts` must fall inside the
    /// `[now - 14d, now + 24h)` window, and the signature must verify
    /// over the canonical monitor message.
    pub fn new(
        pubkey: &SwarmPubkey,
        auth: Option<Subauth>,
        namespaces: Vec<i16>,
        want_data: bool,
        sig_ts: i64,
        sig: Signature,
        now: i64,
    ) -> Result<Self, SubscribeError> {
        if namespaces.is_empty() {
            return Err(SubscribeError::bad_input("namespaces missing or empty"));
        }
        for pair in namespaces.windows(2) {
            if pair[0] > pair[1] {
                return Err(SubscribeError::bad_input(
                    "namespaces are not sorted numerically",
                ));
            }
            if pair[0] == pair[1] {
                return Err(SubscribeError::bad_input("namespaces contains duplicates"));
            }
        }
        if sig_ts == 0 {
            return Err(SubscribeError::bad_input("signature timestamp is missing"));
        }
        if sig_ts <= now - SIGNATURE_EXPIRY_SECS {
            return Err(SubscribeError::bad_input("sig_ts timestamp is too old"));
        }
        if sig_ts >= now + 24 * 60 * 60 {
            return Err(SubscribeError::bad_input(
                "sig_ts timestamp is too far in the future",
            ));
        }

        let msg = monitor_message(pubkey, sig_ts, want_data, &namespaces);
        verify_subscription_signature(
            msg.as_bytes(),
            &sig,
            pubkey.id.network_prefix(),
            &pubkey.ed25519,
            auth.as_ref(),
        )?;

        Ok(Self {
            auth,
            namespaces,
            want_data,
            sig_ts,
            sig,
        })
    }

    /// Constructs without re-validating; for rows reloaded from the
    /// store.
    pub fn trusted(
        auth: Option<Subauth>,
        namespaces: Vec<i16>,
        want_data: bool,
        sig_ts: i64,
        sig: Signature,
    ) -> Self {
        Self {
            auth,
            namespaces,
            want_data,
            sig_ts,
            sig,
        }
    }

    /// True if `self` and the given parts represent the same upstream
    /// swarm subscription: same auth tag, namespaces, and data flag.
    /// Callers are responsible for the two referring to the same
    /// account.
    pub fn is_same_parts(
        &self,
        auth: &Option<Subauth>,
        namespaces: &[i16],
        want_data: bool,
    ) -> bool {
        same_auth(&self.auth, auth) && self.namespaces == namespaces && self.want_data == want_data
    }

    pub fn is_same(&self, other: &Subscription) -> bool {
        self.is_same_parts(&other.auth, &other.namespaces, other.want_data)
    }

    pub fn is_newer(&self, other: &Subscription) -> bool {
        self.sig_ts > other.sig_ts
    }

    pub fn is_expired(&self, now: i64) -> bool {
        self.sig_ts < now - SIGNATURE_EXPIRY_SECS
    }

    /// True if `self` subscribes to at least everything `other` needs:
    /// same auth, a data flag at least as permissive, and a namespace
    /// superset.  Only meaningful for subscriptions to the same account.
    pub fn covers(&self, other: &Subscription) -> bool {
        if !same_auth(&self.auth, &other.auth) {
            return false;
        }
        if other.want_data && !self.want_data {
            return false;
        }
        // Both lists are sorted: walk them together, skipping extras in
        // self; fail if other has anything self lacks.
        let mut i = 0;
        for &needed in &other.namespaces {
            loop {
                match self.namespaces.get(i) {
                    None => return false,
                    Some(&have) if have > needed => return false,
                    Some(&have) if have == needed => {
                        i += 1;
                        break;
                    }
                    Some(_) => i += 1,
                }
            }
        }
        true
    }
}

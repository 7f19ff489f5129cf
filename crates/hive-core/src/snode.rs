//! Per-service-node peer state.
//!
//! Each storage node we know about gets an [`SNode`]: the connection to
//! it (with reconnect backoff), the set of accounts it should carry
//! subscriptions for, and a time-ordered queue deciding when each
//! account's subscription gets re-issued.  Queue removal is lazy: an
//! entry is tombstoned in place and discarded when the drain reaches it,
//! so force-now requeues never pay for a scan-and-remove.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use hive_crypto::{Subauth, X25519Pk};
use parking_lot::Mutex;
use rand::Rng;
use tracing::{debug, warn};

use crate::bt::BtDictWriter;
use crate::hivemind::{AccountEntry, HiveMind};
use crate::mq::MessageQueue;
use crate::swarm::{closest_swarm, SwarmPubkey};

/// Rough cap on the body size of one subscription batch request.  Not a
/// hard limit: we stop adding entries once past it, so the final entry
/// can push the body a little over.
pub const SUBS_REQUEST_LIMIT: usize = 5_000_000;

/// Bounds of the uniform random delay before a subscription is renewed;
/// randomized so renewals spread out instead of arriving in bursts.
pub const RESUBSCRIBE_MIN: Duration = Duration::from_secs(45 * 60);
pub const RESUBSCRIBE_MAX: Duration = Duration::from_secs(55 * 60);

/// Reconnect backoff ladder; consecutive failures walk rightward and
/// saturate at the last entry.
pub const CONNECT_COOLDOWN: [Duration; 4] = [
    Duration::from_secs(10),
    Duration::from_secs(30),
    Duration::from_secs(60),
    Duration::from_secs(120),
];

struct Inner {
    addr: String,
    conn: Option<u64>,
    connecting: bool,
    /// Bumped on every disconnect so stale async connect results can be
    /// recognized and dropped.
    generation: u64,
    subs: HashSet<SwarmPubkey>,
    /// Sorted by resubscribe time; `None` accounts are tombstones.
    next: VecDeque<(Option<SwarmPubkey>, SystemTime)>,
    cooldown_until: Option<Instant>,
    cooldown_fails: usize,
}

pub struct SNode {
    pubkey: X25519Pk,
    mq: Arc<dyn MessageQueue>,
    hivemind: Weak<HiveMind>,
    connected: AtomicBool,
    swarm: AtomicU64,
    // Never take the hivemind state lock while holding this one.
    inner: Mutex<Inner>,
}

impl SNode {
    pub fn new(
        hivemind: Weak<HiveMind>,
        mq: Arc<dyn MessageQueue>,
        pubkey: X25519Pk,
        addr: String,
        swarm: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            pubkey,
            mq,
            hivemind,
            connected: AtomicBool::new(false),
            swarm: AtomicU64::new(swarm),
            inner: Mutex::new(Inner {
                addr,
                conn: None,
                connecting: false,
                generation: 0,
                subs: HashSet::new(),
                next: VecDeque::new(),
                cooldown_until: None,
                cooldown_fails: 0,
            }),
        })
    }

    pub fn pubkey(&self) -> X25519Pk {
        self.pubkey
    }

    pub fn swarm(&self) -> u64 {
        self.swarm.load(Ordering::Relaxed)
    }

    pub fn connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn addr(&self) -> String {
        self.inner.lock().addr.clone()
    }

    /// Initiates a connection to the current address if there is none in
    /// flight, subject to the orchestrator's admission gate.
    pub fn connect(self: &Arc<Self>) {
        let (addr, generation) = {
            let mut inner = self.inner.lock();
            if inner.conn.is_some() || inner.connecting {
                return;
            }
            let Some(hivemind) = self.hivemind.upgrade() else {
                return;
            };
            if !hivemind.allow_connect() {
                // Over the pending-connection cap; the periodic tick
                // will try again.
                return;
            }
            inner.connecting = true;
            (inner.addr.clone(), inner.generation)
        };

        debug!(%addr, "establishing connection");
        let this = self.clone();
        tokio::spawn(async move {
            match this.mq.connect(&addr).await {
                Ok(conn) => this.on_connected(conn, generation),
                Err(err) => this.on_connect_fail(&err.to_string(), generation),
            }
        });
    }

    /// Switches to `addr` if it differs (disconnecting first), then
    /// ensures a connection is underway.
    pub fn connect_to(self: &Arc<Self>, addr: String) {
        let reconnect = {
            let inner = self.inner.lock();
            inner.addr != addr
        };
        if reconnect {
            debug!(new = %addr, "address changed; reconnecting");
            self.disconnect();
            self.inner.lock().addr = addr;
        }
        self.connect();
    }

    pub fn disconnect(&self) {
        let mut inner = self.inner.lock();
        self.connected.store(false, Ordering::Relaxed);
        inner.connecting = false;
        inner.generation += 1;
        if let Some(conn) = inner.conn.take() {
            debug!(addr = %inner.addr, "disconnecting");
            self.mq.disconnect(conn);
        }
    }

    fn on_connected(self: &Arc<Self>, conn: u64, generation: u64) {
        let stale = {
            let mut inner = self.inner.lock();
            if inner.generation != generation || !inner.connecting {
                // Superseded while we were connecting (disconnect or
                // address change); discard the new connection.
                true
            } else {
                debug!(addr = %inner.addr, "connection established");
                inner.connecting = false;
                inner.cooldown_fails = 0;
                inner.cooldown_until = None;
                inner.conn = Some(conn);
                // Force a resubscription for everyone on (re)connect.
                for (_, next) in inner.next.iter_mut() {
                    *next = UNIX_EPOCH;
                }
                self.connected.store(true, Ordering::Relaxed);
                false
            }
        };

        if stale {
            self.mq.disconnect(conn);
        }
        let Some(hivemind) = self.hivemind.upgrade() else {
            return;
        };
        hivemind.finished_connect();
        if !stale {
            hivemind.check_my_subs(self, true);
        }
    }

    fn on_connect_fail(self: &Arc<Self>, reason: &str, generation: u64) {
        {
            let mut inner = self.inner.lock();
            if inner.generation == generation {
                inner.connecting = false;
                inner.conn = None;
                let cooldown = CONNECT_COOLDOWN
                    [inner.cooldown_fails.min(CONNECT_COOLDOWN.len() - 1)];
                inner.cooldown_until = Some(Instant::now() + cooldown);
                inner.cooldown_fails += 1;
                warn!(
                    addr = %inner.addr,
                    reason,
                    failures = inner.cooldown_fails,
                    retry_in = ?cooldown,
                    "connection failed"
                );
                self.connected.store(false, Ordering::Relaxed);
            }
        }
        if let Some(hivemind) = self.hivemind.upgrade() {
            hivemind.finished_connect();
        }
    }

    /// Signs the account up for subscriptions through this node.  A new
    /// account (or `force_now`) goes to the front of the queue with an
    /// epoch timestamp so the next fast check picks it up immediately.
    pub fn add_account(&self, account: &SwarmPubkey, force_now: bool) {
        let mut inner = self.inner.lock();
        if inner.subs.insert(*account) {
            inner.next.push_front((Some(*account), UNIX_EPOCH));
        } else if force_now {
            for (acct, _) in inner.next.iter_mut() {
                if acct.as_ref() == Some(account) {
                    *acct = None;
                    break;
                }
            }
            inner.next.push_front((Some(*account), UNIX_EPOCH));
        }
    }

    /// Swarm reassignment drops all account state.
    pub fn reset_swarm(&self, new_swarm: u64) {
        let mut inner = self.inner.lock();
        inner.next.clear();
        inner.subs.clear();
        self.swarm.store(new_swarm, Ordering::Relaxed);
    }

    /// Ejects any subscribed account whose swarm (under the new swarm id
    /// list) is no longer ours.  Adding newly-arrived members is the
    /// orchestrator's job; this only removes.
    pub fn remove_stale_swarm_members(&self, swarm_ids: &[u64]) {
        let my_swarm = self.swarm();
        let mut inner = self.inner.lock();
        let Inner { subs, next, .. } = &mut *inner;
        for (acct, _) in next.iter_mut() {
            if let Some(pk) = acct {
                if closest_swarm(pk.swarm_space, swarm_ids) != my_swarm {
                    subs.remove(pk);
                    *acct = None;
                }
            }
        }
    }

    /// Drains due queue entries into one bencoded batch request and
    /// submits it to the node's `monitor.messages` endpoint.
    ///
    /// With `initial` set (first check after connecting) a size-capped
    /// request is followed by another check as soon as the reply comes
    /// back, draining the backlog with at most one large request in
    /// flight.  With `fast` set only epoch-stamped entries (brand-new
    /// force-now additions) are processed.
    pub(crate) fn check_subs(
        self: &Arc<Self>,
        all_subs: &HashMap<SwarmPubkey, AccountEntry>,
        initial: bool,
        fast: bool,
    ) {
        if !self.connected() {
            {
                let mut inner = self.inner.lock();
                if inner.conn.is_some() || inner.connecting {
                    return; // already connecting
                }
                match inner.cooldown_until {
                    Some(until) if until > Instant::now() => return,
                    Some(_) => inner.cooldown_until = None,
                    None => {}
                }
            }
            // We get called again once the connection lands.
            return self.connect();
        }

        let mut body = vec![b'l'];
        let now = SystemTime::now();
        let mut req_count = 0usize;

        let conn = {
            let mut inner = self.inner.lock();
            let Some(conn) = inner.conn else { return };

            while body.len() < SUBS_REQUEST_LIMIT {
                let Some((head, head_time)) = inner.next.front() else {
                    break;
                };
                if *head_time > now {
                    break;
                }
                if fast && *head_time > UNIX_EPOCH {
                    break;
                }
                let Some(acct) = *head else {
                    inner.next.pop_front(); // tombstone
                    continue;
                };
                let Some(entry) = all_subs.get(&acct) else {
                    inner.next.pop_front();
                    continue;
                };

                for sub in &entry.subs {
                    let mut dict = BtDictWriter::new(&mut body);
                    // Keys in ascii-sorted order.
                    if acct.session_ed {
                        dict.append_str("P", &acct.ed25519.0);
                    }
                    match &sub.auth {
                        Some(Subauth::Delegated(sa)) => {
                            dict.append_str("S", &sa.sig.0);
                            dict.append_str("T", &sa.tag.0);
                        }
                        Some(Subauth::LegacySubkey(tag)) => {
                            dict.append_str("T", &tag.0);
                        }
                        None => {}
                    }
                    if sub.want_data {
                        dict.append_int("d", 1);
                    }
                    dict.append_int_list("n", sub.namespaces.iter().map(|&ns| i64::from(ns)));
                    if !acct.session_ed {
                        dict.append_str("p", &acct.id.0);
                    }
                    dict.append_str("s", &sub.sig.0);
                    dict.append_int("t", sub.sig_ts);
                    dict.finish();
                    req_count += 1;
                }

                let delay = Duration::from_secs(rand::thread_rng().gen_range(
                    RESUBSCRIBE_MIN.as_secs()..=RESUBSCRIBE_MAX.as_secs(),
                ));
                inner.next.push_back((Some(acct), now + delay));
                inner.next.pop_front();
            }

            if body.len() == 1 {
                return; // nothing due
            }
            body.push(b'e');

            // The random delays leave the appended tail unsorted; every
            // appended time is >= now + RESUBSCRIBE_MIN and everything
            // we didn't touch is already sorted, so re-sorting from the
            // first entry at or past that cutoff restores the ordering.
            let cutoff = now + RESUBSCRIBE_MIN;
            let start = inner.next.partition_point(|(_, t)| *t < cutoff);
            inner.next.make_contiguous()[start..].sort_by_key(|(_, t)| *t);

            conn
        };

        debug!(
            count = req_count,
            bytes = body.len(),
            addr = %self.addr(),
            "(re-)subscribing accounts"
        );

        let right_away = initial && body.len() >= SUBS_REQUEST_LIMIT;
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this
                .mq
                .request(conn, "monitor.messages", vec![Bytes::from(body)])
                .await
            {
                // Not worth retrying: the swarm's other members carry
                // the same subscriptions.
                debug!(addr = %this.addr(), %err, "subscription batch failed");
            }
            if right_away {
                if let Some(hivemind) = this.hivemind.upgrade() {
                    hivemind.check_my_subs(&this, true);
                }
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn queue_snapshot(&self) -> Vec<(Option<SwarmPubkey>, SystemTime)> {
        self.inner.lock().next.iter().cloned().collect()
    }

    #[cfg(test)]
    pub(crate) fn subscriber_count(&self) -> usize {
        self.inner.lock().subs.len()
    }

    #[cfg(test)]
    pub(crate) fn force_connected(&self, conn: u64) {
        let mut inner = self.inner.lock();
        inner.conn = Some(conn);
        self.connected.store(true, Ordering::Relaxed);
    }

    #[cfg(test)]
    pub(crate) fn cooldown_state(&self) -> (usize, Option<Instant>) {
        let inner = self.inner.lock();
        (inner.cooldown_fails, inner.cooldown_until)
    }
}

impl Drop for SNode {
    fn drop(&mut self) {
        let mut inner = self.inner.lock();
        if let Some(conn) = inner.conn.take() {
            self.mq.disconnect(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::subscription::Subscription;
    use hive_crypto::{AccountId, Signature};

    fn test_pubkey(fill: u8) -> SwarmPubkey {
        let mut raw = [fill; 33];
        raw[0] = 0x03;
        SwarmPubkey::trusted(AccountId(raw), None)
    }

    fn detached_snode() -> Arc<SNode> {
        let hub = crate::mq::LocalHub::new();
        let peer = hub.client("test");
        SNode::new(Weak::new(), peer, X25519Pk([1; 32]), "sn".into(), 7)
    }

    #[test]
    fn add_account_queues_at_front_with_epoch() {
        let sn = detached_snode();
        let a = test_pubkey(1);
        let b = test_pubkey(2);

        sn.add_account(&a, false);
        sn.add_account(&b, false);
        let queue = sn.queue_snapshot();
        assert_eq!(queue.len(), 2);
        assert_eq!(queue[0].0, Some(b));
        assert!(queue.iter().all(|(_, t)| *t == UNIX_EPOCH));

        // Re-adding without force_now is a no-op.
        sn.add_account(&a, false);
        assert_eq!(sn.queue_snapshot().len(), 2);
        assert_eq!(sn.subscriber_count(), 2);
    }

    #[test]
    fn force_now_tombstones_the_old_entry() {
        let sn = detached_snode();
        let a = test_pubkey(1);
        sn.add_account(&a, false);
        sn.add_account(&a, true);

        let queue = sn.queue_snapshot();
        assert_eq!(queue.len(), 3);
        assert_eq!(queue[0].0, Some(a));
        // Exactly one live entry for the account remains.
        let live = queue.iter().filter(|(acct, _)| acct.is_some()).count();
        assert_eq!(live, 1);
        assert_eq!(sn.subscriber_count(), 1);
    }

    #[test]
    fn reset_swarm_clears_state() {
        let sn = detached_snode();
        sn.add_account(&test_pubkey(1), false);
        sn.reset_swarm(99);
        assert_eq!(sn.swarm(), 99);
        assert!(sn.queue_snapshot().is_empty());
        assert_eq!(sn.subscriber_count(), 0);
    }

    #[test]
    fn remove_stale_swarm_members_ejects_movers() {
        let sn = detached_snode();
        let a = test_pubkey(1);
        let b = test_pubkey(2);
        sn.add_account(&a, false);
        sn.add_account(&b, false);

        // With this id list, exactly one swarm exists, and it isn't 7,
        // so every member is stale.
        sn.remove_stale_swarm_members(&[42]);
        assert_eq!(sn.subscriber_count(), 0);
        assert!(sn.queue_snapshot().iter().all(|(acct, _)| acct.is_none()));

        // With the node's own swarm as the only id everyone stays.
        let sn = detached_snode();
        sn.add_account(&a, false);
        sn.remove_stale_swarm_members(&[7]);
        assert_eq!(sn.subscriber_count(), 1);
    }

    #[tokio::test]
    async fn check_subs_builds_sorted_batch_and_requeues() {
        let hub = crate::mq::LocalHub::new();
        let requests: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
        let _storage = hub.peer("sn", crate::mq::AuthLevel::None, {
            let requests = requests.clone();
            Arc::new(move |msg: crate::mq::Message| {
                requests.lock().push(msg.parts[0].to_vec());
                if let Some(replier) = &msg.replier {
                    replier.send(vec![Bytes::from_static(b"ok")]);
                }
            })
        });
        let peer = hub.peer("relay", crate::mq::AuthLevel::None, Arc::new(|_| {}));
        let conn = peer.connect("sn").await.unwrap();

        let sn = SNode::new(Weak::new(), peer, X25519Pk([1; 32]), "sn".into(), 7);
        sn.force_connected(conn);

        let acct = test_pubkey(9);
        sn.add_account(&acct, false);

        let mut all_subs = HashMap::new();
        all_subs.insert(
            acct,
            AccountEntry {
                swarm: 7,
                subs: vec![Subscription::trusted(
                    None,
                    vec![-400, 0, 17],
                    true,
                    1_700_000_000,
                    Signature([3; 64]),
                )],
            },
        );

        sn.check_subs(&all_subs, false, false);
        // Let the spawned request task run.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let reqs = requests.lock();
        assert_eq!(reqs.len(), 1);
        let body = &reqs[0];
        assert_eq!(body.first(), Some(&b'l'));
        assert_eq!(body.last(), Some(&b'e'));
        // Group account: no P, has p; wants data; sorted dict keys.
        let inner = &body[1..body.len() - 1];
        let mut dict = crate::bt::BtDictReader::new(inner).unwrap();
        assert!(dict.skip_until(b"d").unwrap());
        assert_eq!(dict.integer::<i64>().unwrap(), 1);
        assert!(dict.skip_until(b"p").unwrap());
        assert_eq!(dict.string().unwrap(), &acct.id.0[..]);
        assert!(dict.skip_until(b"t").unwrap());
        assert_eq!(dict.integer::<i64>().unwrap(), 1_700_000_000);
        drop(dict);

        // The account was rescheduled 45-55 minutes out and the queue is
        // time-sorted.
        let queue = sn.queue_snapshot();
        assert_eq!(queue.len(), 1);
        let (requeued, at) = &queue[0];
        assert_eq!(*requeued, Some(acct));
        let delay = at.duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
            - SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap()
                .as_secs() as i64;
        assert!((RESUBSCRIBE_MIN.as_secs() as i64 - 2..=RESUBSCRIBE_MAX.as_secs() as i64 + 2)
            .contains(&delay));
    }

    #[tokio::test]
    async fn fast_mode_only_processes_epoch_entries() {
        let hub = crate::mq::LocalHub::new();
        let requests: Arc<Mutex<usize>> = Arc::new(Mutex::new(0));
        let _storage = hub.peer("sn", crate::mq::AuthLevel::None, {
            let requests = requests.clone();
            Arc::new(move |msg: crate::mq::Message| {
                *requests.lock() += 1;
                if let Some(replier) = &msg.replier {
                    replier.send(vec![Bytes::from_static(b"ok")]);
                }
            })
        });
        let peer = hub.peer("relay", crate::mq::AuthLevel::None, Arc::new(|_| {}));
        let conn = peer.connect("sn").await.unwrap();
        let sn = SNode::new(Weak::new(), peer, X25519Pk([1; 32]), "sn".into(), 7);
        sn.force_connected(conn);

        let acct = test_pubkey(9);
        sn.add_account(&acct, false);
        let mut all_subs = HashMap::new();
        all_subs.insert(
            acct,
            AccountEntry {
                swarm: 7,
                subs: vec![Subscription::trusted(
                    None,
                    vec![0],
                    false,
                    1,
                    Signature([3; 64]),
                )],
            },
        );

        // Drain the epoch entry; it is rescheduled ~50 minutes out.
        sn.check_subs(&all_subs, false, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*requests.lock(), 1);

        // Fast mode has nothing epoch-stamped left to do.
        sn.check_subs(&all_subs, false, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*requests.lock(), 1);
    }
}

//! The central orchestrator.
//!
//! A `HiveMind` tracks the network's service-node fleet (from the
//! blockchain RPC), keeps every registered account subscribed on all of
//! its swarm's storage nodes, validates client subscribe/unsubscribe
//! requests via the responsible notifier backend, and fans incoming
//! message notifications out to those backends with a rotating dedup
//! filter in between.
//!
//! Locking: one non-reentrant mutex guards the orchestrator state, each
//! [`SNode`] has its own; the only permitted order is orchestrator then
//! snode.  The deferred-request queue has a dedicated mutex used solely
//! to serialize the `ready` flip against handler admission.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use hive_crypto::{
    blake2b_32, verify_subscription_signature, AccountId, Blake2b32, EncKey, Ed25519Pk, Signature,
    Subaccount, SubaccountTag, Subauth, SubkeyTag, X25519Pk,
};
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::bt::{BtDictReader, BtDictWriter};
use crate::config::Config;
use crate::error::{SubscribeCode, SubscribeError};
use crate::mq::{ConnectionId, Message, MessageQueue, Replier};
use crate::snode::SNode;
use crate::store::{StoreError, SubscriberStore};
use crate::subscription::{
    unix_now, unsubscribe_message, Subscription, SIGNATURE_EXPIRY_SECS, UNSUBSCRIBE_GRACE_SECS,
};
use crate::swarm::{SwarmPubkey, INVALID_SWARM_ID, PREFIX_USER};

pub const MSG_HASH_MIN_SIZE: usize = 32;
pub const MSG_HASH_MAX_SIZE: usize = 99;
pub const SERVICE_NAME_MAX_SIZE: usize = 32;
pub const SERVICE_ID_MIN_SIZE: usize = 32;
pub const SERVICE_ID_MAX_SIZE: usize = 999;
pub const SERVICE_DATA_MAX_SIZE: usize = 99_999;
/// Storage server message size limit.
pub const MSG_DATA_MAX_SIZE: usize = 76_800;
/// Largest subscribe/unsubscribe request body we accept.
const REQUEST_MAX_SIZE: usize = 100_000;

const DB_CLEANUP_INTERVAL: Duration = Duration::from_secs(30);
const STATUS_INTERVAL: Duration = Duration::from_secs(15);
const SUBS_FAST_INTERVAL: Duration = Duration::from_millis(100);

/// Field selection for the service-node list request.
const GET_SNS_PARAMS: &str = r#"{
  "active_only": true,
  "fields": {
    "pubkey_x25519": true,
    "public_ip": true,
    "storage_lmq_port": true,
    "swarm_id": true,
    "block_hash": true,
    "height": true
  }
}"#;

#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("oxend connection failed: {0}")]
    OxendConnect(crate::mq::MqError),
    #[error("oxend failed to respond to ping: {0}")]
    OxendPing(crate::mq::MqError),
}

/// Per-account in-memory state: the currently assigned swarm plus the
/// deduplicated subscriptions for the account.
pub(crate) struct AccountEntry {
    pub swarm: u64,
    pub subs: Vec<Subscription>,
}

struct State {
    sns: HashMap<X25519Pk, Arc<SNode>>,
    swarms: HashMap<u64, HashMap<X25519Pk, Arc<SNode>>>,
    /// Sorted ascending.
    swarm_ids: Vec<u64>,
    subscribers: HashMap<SwarmPubkey, AccountEntry>,
    services: HashMap<String, ConnectionId>,
    filter: HashSet<Blake2b32>,
    filter_rotate: HashSet<Blake2b32>,
    filter_rotate_at: Instant,
    last_block: (String, i64),
    oxend: Option<ConnectionId>,
}

enum DeferredKind {
    Subscribe,
    Unsubscribe,
}

struct DeferredRequest {
    kind: DeferredKind,
    msg: Message,
}

pub struct HiveMind {
    pub config: Config,
    mq: Arc<dyn MessageQueue>,
    /// Optional dedicated transports for storage-node connections; when
    /// present, new snodes are assigned across them round-robin to
    /// spread the socket load.
    push_mqs: Vec<Arc<dyn MessageQueue>>,
    push_next: std::sync::atomic::AtomicUsize,
    store: SubscriberStore,
    state: Mutex<State>,
    deferred: Mutex<VecDeque<DeferredRequest>>,
    ready: AtomicBool,
    have_new_subs: AtomicBool,
    pending_connects: AtomicI64,
    connect_count: AtomicI64,
    started: Instant,
}

// What a validated request is waiting on from the notifier.
enum PendingAction {
    Subscribe { sub: Subscription, enc_key: EncKey },
    Unsubscribe { auth: Option<Subauth>, sig: Signature, sig_ts: i64 },
}

struct PendingValidation {
    conn: ConnectionId,
    service: String,
    service_info: String,
    pubkey: SwarmPubkey,
    action: PendingAction,
}

struct SubUnsubArgs {
    pubkey: SwarmPubkey,
    auth: Option<Subauth>,
    sig_ts: i64,
    sig: Signature,
    service: String,
    service_info: Value,
}

fn req_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, SubscribeError> {
    args.get(key)
        .ok_or_else(|| SubscribeError::bad_input(format!("missing required parameter: {key}")))?
        .as_str()
        .ok_or_else(|| SubscribeError::bad_input(format!("invalid parameter: {key}")))
}

fn opt_str<'a>(args: &'a Value, key: &str) -> Result<Option<&'a str>, SubscribeError> {
    match args.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_str()
            .map(Some)
            .ok_or_else(|| SubscribeError::bad_input(format!("invalid parameter: {key}"))),
    }
}

impl HiveMind {
    /// Opens the orchestrator over an already-opened store: cleans out
    /// expired rows and loads the surviving subscriptions into memory.
    pub fn new(
        config: Config,
        mq: Arc<dyn MessageQueue>,
        store: SubscriberStore,
    ) -> Result<Arc<Self>, StartupError> {
        Self::with_push_transports(config, mq, Vec::new(), store)
    }

    /// Like [`new`](Self::new), with dedicated transport instances for
    /// the storage-node connection load.
    pub fn with_push_transports(
        config: Config,
        mq: Arc<dyn MessageQueue>,
        push_mqs: Vec<Arc<dyn MessageQueue>>,
        store: SubscriberStore,
    ) -> Result<Arc<Self>, StartupError> {
        store.cleanup_expired(unix_now() - SIGNATURE_EXPIRY_SECS)?;

        let hivemind = Arc::new(Self {
            state: Mutex::new(State {
                sns: HashMap::new(),
                swarms: HashMap::new(),
                swarm_ids: Vec::new(),
                subscribers: HashMap::new(),
                services: HashMap::new(),
                filter: HashSet::new(),
                filter_rotate: HashSet::new(),
                filter_rotate_at: Instant::now() + config.filter_lifetime(),
                last_block: (String::new(), -1),
                oxend: None,
            }),
            deferred: Mutex::new(VecDeque::new()),
            ready: AtomicBool::new(false),
            have_new_subs: AtomicBool::new(false),
            pending_connects: AtomicI64::new(0),
            connect_count: AtomicI64::new(0),
            started: Instant::now(),
            push_next: std::sync::atomic::AtomicUsize::new(0),
            config,
            mq,
            push_mqs,
            store,
        });
        hivemind.load_saved_subscriptions()?;
        Ok(hivemind)
    }

    fn load_saved_subscriptions(&self) -> Result<(), StoreError> {
        let total = self.store.subscription_count()?;
        info!(total, "loading stored subscriptions");

        let mut unique = 0i64;
        let mut state = self.state.lock();
        for row in self.store.load_all()? {
            let pubkey = SwarmPubkey::trusted(row.account, row.session_ed25519);
            let entry = state.subscribers.entry(pubkey).or_insert(AccountEntry {
                swarm: INVALID_SWARM_ID,
                subs: Vec::new(),
            });

            // Several devices may share one effective subscription; keep
            // whichever signature is newest.
            let sub = row.subscription;
            match entry.subs.iter_mut().find(|existing| existing.is_same(&sub)) {
                Some(existing) => {
                    if sub.sig_ts > existing.sig_ts {
                        existing.sig_ts = sub.sig_ts;
                        existing.sig = sub.sig;
                    }
                }
                None => {
                    unique += 1;
                    entry.subs.push(sub);
                }
            }
        }
        info!(
            unique,
            accounts = state.subscribers.len(),
            "done loading saved subscriptions"
        );
        Ok(())
    }

    /// Startup sequencing after construction: connect and ping the
    /// blockchain RPC, give notifiers a window to register, flip ready
    /// (draining deferred requests), kick the first service-node
    /// refresh, and start the periodic timers.
    pub async fn start(self: &Arc<Self>) -> Result<(), StartupError> {
        info!(addr = %self.config.oxend_rpc, "connecting to oxend");
        let oxend = self
            .mq
            .connect(&self.config.oxend_rpc)
            .await
            .map_err(StartupError::OxendConnect)?;
        self.mq
            .request(oxend, "ping.ping", vec![])
            .await
            .map_err(StartupError::OxendPing)?;
        info!("connected to oxend");
        self.state.lock().oxend = Some(oxend);

        if self.config.notifier_wait_ms > 0 {
            let deadline = Instant::now() + self.config.notifier_wait();
            info!(
                max_wait = ?self.config.notifier_wait(),
                "waiting for notifiers to register"
            );
            while !self.notifier_startup_done(deadline) {
                tokio::time::sleep(Duration::from_millis(25)).await;
            }
            info!(
                registered = self.state.lock().services.len(),
                "done waiting for notifiers"
            );
        }

        self.set_ready();
        self.refresh_sns();

        self.spawn_timer(DB_CLEANUP_INTERVAL, |hm| hm.db_cleanup());
        self.spawn_timer(self.config.subs_interval(), |hm| hm.subs_slow());
        self.spawn_timer(SUBS_FAST_INTERVAL, |hm| hm.subs_fast());
        self.spawn_timer(STATUS_INTERVAL, |hm| hm.log_status());

        info!("startup complete");
        Ok(())
    }

    fn spawn_timer(self: &Arc<Self>, period: Duration, tick: fn(&Arc<Self>)) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            interval.tick().await; // completes immediately
            loop {
                interval.tick().await;
                let Some(hivemind) = weak.upgrade() else { break };
                tick(&hivemind);
            }
        });
    }

    fn notifier_startup_done(&self, deadline: Instant) -> bool {
        let state = self.state.lock();
        if !self.config.notifiers_expected.is_empty() {
            let missing: Vec<&String> = self
                .config
                .notifiers_expected
                .iter()
                .filter(|name| !state.services.contains_key(*name))
                .collect();
            if missing.is_empty() {
                info!("all configured notifiers have registered");
                return true;
            }
            if Instant::now() > deadline {
                warn!(?missing, "notifier startup timeout reached");
                return true;
            }
            return false;
        }
        Instant::now() > deadline
    }

    // -- readiness / deferral ----------------------------------------------

    /// Flips `ready` under the deferred-queue lock (so no request can
    /// slip between the flip and the drain), then replays the queue in
    /// FIFO order.
    fn set_ready(self: &Arc<Self>) {
        let drained: Vec<DeferredRequest> = {
            let mut deferred = self.deferred.lock();
            self.ready.store(true, Ordering::Release);
            deferred.drain(..).collect()
        };
        if !drained.is_empty() {
            info!(count = drained.len(), "processing deferred requests");
        }
        for request in drained {
            match request.kind {
                DeferredKind::Subscribe => self.on_subscribe(request.msg),
                DeferredKind::Unsubscribe => self.on_unsubscribe(request.msg),
            }
        }
    }

    fn ready_or_defer(&self, msg: Message, kind: DeferredKind) -> Option<Message> {
        if self.ready.load(Ordering::Acquire) {
            return Some(msg);
        }
        let mut deferred = self.deferred.lock();
        if self.ready.load(Ordering::Acquire) {
            // Flipped between the check and the lock; run it now.
            return Some(msg);
        }
        deferred.push_back(DeferredRequest { kind, msg });
        None
    }

    // -- connection admission ----------------------------------------------

    /// Optimistic admission: increment, and on overshoot undo and deny.
    /// A granted connect must be paired with [`finished_connect`].
    pub fn allow_connect(&self) -> bool {
        let count = self.pending_connects.fetch_add(1, Ordering::AcqRel) + 1;
        if count > self.config.max_pending_connects {
            self.pending_connects.fetch_sub(1, Ordering::AcqRel);
            return false;
        }
        let total = self.connect_count.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(pending = count, total, "establishing connection");
        true
    }

    pub fn finished_connect(&self) {
        // If we were saturated, freed capacity means gated snodes can
        // now try again.
        let try_more = self.pending_connects.load(Ordering::Acquire)
            >= self.config.max_pending_connects;
        self.pending_connects.fetch_sub(1, Ordering::AcqRel);
        if try_more {
            self.check_subs(false);
        }
    }

    // -- subscription checks -----------------------------------------------

    fn check_subs(&self, fast: bool) {
        let state = self.state.lock();
        Self::check_subs_on(&state.sns, &state.subscribers, fast);
    }

    fn check_subs_on(
        sns: &HashMap<X25519Pk, Arc<SNode>>,
        subscribers: &HashMap<SwarmPubkey, AccountEntry>,
        fast: bool,
    ) {
        for snode in sns.values() {
            snode.check_subs(subscribers, false, fast);
        }
    }

    /// Single-snode subscription check, used by the snode itself right
    /// after connecting (and while draining its initial backlog).
    pub(crate) fn check_my_subs(&self, snode: &Arc<SNode>, initial: bool) {
        let state = self.state.lock();
        snode.check_subs(&state.subscribers, initial, false);
    }

    fn db_cleanup(self: &Arc<Self>) {
        if let Err(err) = self
            .store
            .cleanup_expired(unix_now() - SIGNATURE_EXPIRY_SECS)
        {
            warn!(%err, "database cleanup failed");
        }
    }

    fn subs_slow(self: &Arc<Self>) {
        // Re-request block notifications so the subscription with the
        // chain daemon stays alive; the ack content is of no use.
        let oxend = self.state.lock().oxend;
        if let Some(conn) = oxend {
            let mq = self.mq.clone();
            tokio::spawn(async move {
                let _ = mq.request(conn, "sub.block", vec![]).await;
            });
        }
        self.check_subs(false);
    }

    fn subs_fast(self: &Arc<Self>) {
        if self.have_new_subs.swap(false, Ordering::AcqRel) {
            self.check_subs(true);
        }
    }

    // -- client subscribe / unsubscribe ------------------------------------

    fn parse_body(&self, msg: &Message) -> Result<Value, SubscribeError> {
        let body = msg
            .parts
            .first()
            .ok_or_else(|| SubscribeError::bad_input("request body missing"))?;
        if body.len() > REQUEST_MAX_SIZE {
            return Err(SubscribeError::bad_input("request too large"));
        }
        serde_json::from_slice(body).map_err(|_| SubscribeError::bad_input("invalid JSON"))
    }

    fn parse_sub_unsub_args(&self, args: &Value) -> Result<SubUnsubArgs, SubscribeError> {
        let account = AccountId::parse(req_str(args, "pubkey")?.as_bytes())
            .map_err(|err| SubscribeError::bad_input(format!("invalid pubkey: {err}")))?;

        let session_ed = if account.network_prefix() == PREFIX_USER {
            let raw = req_str(args, "session_ed25519")?;
            Some(Ed25519Pk::parse(raw.as_bytes()).map_err(|err| {
                SubscribeError::bad_input(format!("invalid session_ed25519: {err}"))
            })?)
        } else {
            None
        };
        let pubkey = SwarmPubkey::new(account, session_ed)
            .map_err(|err| SubscribeError::bad_input(err.to_string()))?;

        let auth = if let Some(tag) = opt_str(args, "subaccount")? {
            let tag = SubaccountTag::parse(tag.as_bytes())
                .map_err(|err| SubscribeError::bad_input(format!("invalid subaccount: {err}")))?;
            let sig = Signature::parse(req_str(args, "subaccount_sig")?.as_bytes()).map_err(
                |err| SubscribeError::bad_input(format!("invalid subaccount_sig: {err}")),
            )?;
            Some(Subauth::Delegated(Subaccount { tag, sig }))
        } else if let Some(tag) = opt_str(args, "subkey_tag")? {
            if !self.config.allow_legacy_subkeys {
                return Err(SubscribeError::bad_input(
                    "subkey_tag authentication is not enabled",
                ));
            }
            let tag = SubkeyTag::parse(tag.as_bytes())
                .map_err(|err| SubscribeError::bad_input(format!("invalid subkey_tag: {err}")))?;
            Some(Subauth::LegacySubkey(tag))
        } else {
            None
        };

        let sig = Signature::parse(req_str(args, "signature")?.as_bytes())
            .map_err(|err| SubscribeError::bad_input(format!("invalid signature: {err}")))?;
        let sig_ts = args
            .get("sig_ts")
            .and_then(Value::as_i64)
            .ok_or_else(|| SubscribeError::bad_input("missing required parameter: sig_ts"))?;

        let service = req_str(args, "service")?.to_string();
        if service.is_empty() || service.len() > SERVICE_NAME_MAX_SIZE {
            return Err(SubscribeError::bad_input("invalid service name"));
        }
        let service_info = args
            .get("service_info")
            .cloned()
            .ok_or_else(|| SubscribeError::bad_input("missing required parameter: service_info"))?;

        Ok(SubUnsubArgs {
            pubkey,
            auth,
            sig_ts,
            sig,
            service,
            service_info,
        })
    }

    fn service_conn(&self, service: &str) -> Result<ConnectionId, SubscribeError> {
        self.state
            .lock()
            .services
            .get(service)
            .copied()
            .ok_or_else(|| {
                SubscribeError::new(
                    SubscribeCode::ServiceNotAvailable,
                    format!("{service} notification service not currently available"),
                )
            })
    }

    pub fn on_subscribe(self: &Arc<Self>, msg: Message) {
        let Some(mut msg) = self.ready_or_defer(msg, DeferredKind::Subscribe) else {
            return;
        };
        let Some(replier) = msg.replier.take() else { return };

        let pending = (|| -> Result<PendingValidation, SubscribeError> {
            let args = self.parse_body(&msg)?;
            let common = self.parse_sub_unsub_args(&args)?;
            let enc_key = EncKey::parse(req_str(&args, "enc_key")?.as_bytes())
                .map_err(|err| SubscribeError::bad_input(format!("invalid enc_key: {err}")))?;
            let namespaces: Vec<i16> = args
                .get("namespaces")
                .ok_or_else(|| {
                    SubscribeError::bad_input("missing required parameter: namespaces")
                })
                .and_then(|v| {
                    serde_json::from_value(v.clone())
                        .map_err(|_| SubscribeError::bad_input("invalid namespaces"))
                })?;
            let want_data = args
                .get("data")
                .and_then(Value::as_bool)
                .ok_or_else(|| SubscribeError::bad_input("missing required parameter: data"))?;

            let conn = self.service_conn(&common.service)?;

            // Validates namespaces, the timestamp window, and the
            // signature (including any subaccount authorization).
            let sub = Subscription::new(
                &common.pubkey,
                common.auth,
                namespaces,
                want_data,
                common.sig_ts,
                common.sig,
                unix_now(),
            )?;

            Ok(PendingValidation {
                conn,
                service: common.service,
                service_info: common.service_info.to_string(),
                pubkey: common.pubkey,
                action: PendingAction::Subscribe { sub, enc_key },
            })
        })();

        match pending {
            Ok(pending) => self.dispatch_validation(pending, replier),
            Err(err) => {
                debug!(code = err.code as i32, "subscribe rejected: {}", err.message);
                reply_json(&replier, err.to_json());
            }
        }
    }

    pub fn on_unsubscribe(self: &Arc<Self>, msg: Message) {
        let Some(mut msg) = self.ready_or_defer(msg, DeferredKind::Unsubscribe) else {
            return;
        };
        let Some(replier) = msg.replier.take() else { return };

        let pending = (|| -> Result<PendingValidation, SubscribeError> {
            let args = self.parse_body(&msg)?;
            let common = self.parse_sub_unsub_args(&args)?;
            let conn = self.service_conn(&common.service)?;
            Ok(PendingValidation {
                conn,
                service: common.service,
                service_info: common.service_info.to_string(),
                pubkey: common.pubkey,
                action: PendingAction::Unsubscribe {
                    auth: common.auth,
                    sig: common.sig,
                    sig_ts: common.sig_ts,
                },
            })
        })();

        match pending {
            Ok(pending) => self.dispatch_validation(pending, replier),
            Err(err) => {
                debug!(
                    code = err.code as i32,
                    "unsubscribe rejected: {}", err.message
                );
                reply_json(&replier, err.to_json());
            }
        }
    }

    /// Asks the notifier service to validate the client's service_info;
    /// everything else (including the client reply) happens when the
    /// notifier answers.
    fn dispatch_validation(self: &Arc<Self>, pending: PendingValidation, replier: Replier) {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this
                .mq
                .request(
                    pending.conn,
                    "notifier.validate",
                    vec![
                        Bytes::from(pending.service.clone()),
                        Bytes::from(pending.service_info.clone()),
                    ],
                )
                .await;
            trace!(service = %pending.service, ok = result.is_ok(), "notifier validation reply");
            let body = match this.handle_validation(result, pending) {
                Ok(mut extras) => {
                    extras.insert("success".to_string(), Value::Bool(true));
                    Value::Object(extras)
                }
                Err(err) => err.to_json(),
            };
            reply_json(&replier, body);
        });
    }

    fn handle_validation(
        &self,
        result: Result<Vec<Bytes>, crate::mq::MqError>,
        pending: PendingValidation,
    ) -> Result<serde_json::Map<String, Value>, SubscribeError> {
        let data = match result {
            Err(crate::mq::MqError::Timeout) => {
                error!(service = %pending.service, "notifier validation timed out");
                return Err(SubscribeError::new(
                    SubscribeCode::ServiceTimeout,
                    format!("{} notification service timed out", pending.service),
                ));
            }
            Err(err) => {
                error!(service = %pending.service, %err, "notifier communication failed");
                return Err(SubscribeError::error(format!(
                    "failed to communicate with {} notification service",
                    pending.service
                )));
            }
            Ok(data) => data,
        };

        if data.len() < 2 || data.len() > 3 {
            return Err(SubscribeError::error(format!(
                "invalid {}-part response from notification service",
                data.len()
            )));
        }

        let code: i32 = std::str::from_utf8(&data[0])
            .ok()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                SubscribeError::error("notification service did not give a status code")
            })?;
        if code != SubscribeCode::Ok as i32 {
            // Pass the notifier's own code and message through.
            return Err(SubscribeError {
                code: SubscribeCode::from_i32(code).unwrap_or(SubscribeCode::Error),
                message: String::from_utf8_lossy(&data[1]).into_owned(),
            });
        }

        let svcid = std::str::from_utf8(&data[1])
            .map_err(|_| SubscribeError::error("service id is not valid utf8"))?
            .to_string();
        if svcid.len() < SERVICE_ID_MIN_SIZE {
            return Err(SubscribeError::error(format!(
                "service id too short ({})",
                svcid.len()
            )));
        }
        if svcid.len() > SERVICE_ID_MAX_SIZE {
            return Err(SubscribeError::error(format!(
                "service id too long ({})",
                svcid.len()
            )));
        }

        let mut extras = serde_json::Map::new();
        match pending.action {
            PendingAction::Subscribe { sub, enc_key } => {
                let svcdata = data.get(2).map(|d| d.to_vec());
                if let Some(d) = &svcdata {
                    if d.len() > SERVICE_DATA_MAX_SIZE {
                        return Err(SubscribeError::error(format!(
                            "service data too long ({})",
                            d.len()
                        )));
                    }
                }
                trace!(
                    service = %pending.service,
                    account = %pending.pubkey.id,
                    "adding subscription"
                );
                let newsub = self.add_subscription(
                    pending.pubkey,
                    &pending.service,
                    &svcid,
                    svcdata.as_deref(),
                    &enc_key,
                    sub,
                )?;
                if newsub {
                    self.have_new_subs.store(true, Ordering::Release);
                }
                extras.insert(
                    if newsub { "added" } else { "updated" }.to_string(),
                    Value::Bool(true),
                );
                extras.insert(
                    "message".to_string(),
                    Value::String(
                        if newsub {
                            "Subscription successful"
                        } else {
                            "Resubscription successful"
                        }
                        .to_string(),
                    ),
                );
            }
            PendingAction::Unsubscribe { auth, sig, sig_ts } => {
                let removed = self.remove_subscription(
                    &pending.pubkey,
                    &auth,
                    &pending.service,
                    &svcid,
                    &sig,
                    sig_ts,
                )?;
                extras.insert("removed".to_string(), Value::Bool(removed));
                extras.insert(
                    "message".to_string(),
                    Value::String(
                        if removed {
                            "Device unsubscribed from push notifications"
                        } else {
                            "Device was not subscribed to push notifications"
                        }
                        .to_string(),
                    ),
                );
            }
        }
        Ok(extras)
    }

    /// Adds or renews a subscription.  The durable row is written first;
    /// the in-memory entry is then merged (keeping the newer signature
    /// for an equivalent subscription).  A brand-new subscription is
    /// pushed to every snode in the account's swarm with force-now so
    /// the next fast tick issues it immediately.
    ///
    /// Returns true if the row was brand new.
    fn add_subscription(
        &self,
        pubkey: SwarmPubkey,
        service: &str,
        svcid: &str,
        svcdata: Option<&[u8]>,
        enc_key: &EncKey,
        sub: Subscription,
    ) -> Result<bool, SubscribeError> {
        let session_ed = pubkey.session_ed.then_some(&pubkey.ed25519);
        let new_sub = self
            .store
            .upsert_subscription(&pubkey.id, session_ed, service, svcid, svcdata, enc_key, &sub)?;

        let mut state = self.state.lock();
        let swarm = pubkey.closest_swarm(&state.swarm_ids);
        let entry = state.subscribers.entry(pubkey).or_insert(AccountEntry {
            swarm,
            subs: Vec::new(),
        });
        entry.swarm = swarm;
        match entry.subs.iter_mut().find(|existing| existing.is_same(&sub)) {
            Some(existing) => {
                if sub.is_newer(existing) {
                    existing.sig = sub.sig;
                    existing.sig_ts = sub.sig_ts;
                }
            }
            None => entry.subs.push(sub),
        }

        if new_sub {
            // Get the new subscription active on the swarm ASAP.
            if let Some(members) = state.swarms.get(&swarm) {
                for snode in members.values() {
                    snode.add_account(&pubkey, true);
                }
            }
        }

        Ok(new_sub)
    }

    /// Validates and removes a stored subscription row.  In-memory state
    /// is deliberately left alone: other devices may share the same
    /// effective subscription, and without a row no notification will be
    /// delivered anyway.
    fn remove_subscription(
        &self,
        pubkey: &SwarmPubkey,
        auth: &Option<Subauth>,
        service: &str,
        svcid: &str,
        sig: &Signature,
        sig_ts: i64,
    ) -> Result<bool, SubscribeError> {
        let now = unix_now();
        if sig_ts < now - UNSUBSCRIBE_GRACE_SECS || sig_ts > now + UNSUBSCRIBE_GRACE_SECS {
            return Err(SubscribeError::error(
                "invalid signature: sig_ts is too far from current time",
            ));
        }
        let msg = unsubscribe_message(pubkey, sig_ts);
        verify_subscription_signature(
            msg.as_bytes(),
            sig,
            pubkey.id.network_prefix(),
            &pubkey.ed25519,
            auth.as_ref(),
        )?;

        Ok(self.store.remove_subscription(&pubkey.id, service, svcid)?)
    }

    // -- notifier-facing endpoints -----------------------------------------

    pub fn on_reg_service(self: &Arc<Self>, msg: Message) {
        if msg.parts.len() != 1 {
            error!(parts = msg.parts.len(), "register_service expects 1-part data");
            return;
        }
        let Ok(service) = std::str::from_utf8(&msg.parts[0]) else {
            error!("service registration used a non-utf8 service name");
            return;
        };
        if service.is_empty() {
            error!("service registration used illegal empty service name");
            return;
        }
        if service.len() > SERVICE_NAME_MAX_SIZE {
            error!(len = service.len(), "service name too long");
            return;
        }

        let mut state = self.state.lock();
        match state.services.insert(service.to_string(), msg.conn) {
            None => info!(service, "notification service registered"),
            Some(old) if old != msg.conn => {
                info!(service, "notification service reconnected/reregistered")
            }
            Some(_) => trace!(service, "notification service confirmed"),
        }
    }

    /// Stats report from a notifier: a service name and a bencoded dict.
    /// `+`-prefixed integer values increment the stored counter; other
    /// values replace it.
    pub fn on_service_stats(self: &Arc<Self>, msg: Message) {
        if msg.parts.len() != 2 {
            warn!("invalid service_stats call: expected 2-part message");
            return;
        }
        let Ok(service) = std::str::from_utf8(&msg.parts[0]) else {
            warn!("service stats with non-utf8 service name");
            return;
        };
        if service.is_empty() {
            warn!("service stats received illegal empty service name");
            return;
        }

        if let Err(err) = self.apply_service_stats(service, &msg.parts[1]) {
            warn!(service, %err, "invalid service stats");
        }
    }

    fn apply_service_stats(&self, service: &str, payload: &[u8]) -> Result<(), SubscribeError> {
        self.store
            .set_stat_int("", &format!("last.{service}"), unix_now())?;

        let mut dict = BtDictReader::new(payload)
            .map_err(|err| SubscribeError::bad_input(err.to_string()))?;
        loop {
            let Some(key) = dict
                .next_key()
                .map_err(|err| SubscribeError::bad_input(err.to_string()))?
            else {
                break;
            };
            let key = std::str::from_utf8(key)
                .map_err(|_| SubscribeError::bad_input("non-utf8 stat name"))?
                .to_string();
            if let Some(counter) = key.strip_prefix('+') {
                let val: i64 = dict
                    .integer()
                    .map_err(|_| SubscribeError::bad_input("+keys only allow integers"))?;
                self.store.increment_stat(service, counter, val)?;
            } else if dict.is_integer() {
                let val: i64 = dict
                    .integer()
                    .map_err(|err| SubscribeError::bad_input(err.to_string()))?;
                self.store.set_stat_int(service, &key, val)?;
            } else {
                let val = dict
                    .string()
                    .map_err(|_| SubscribeError::bad_input("values must be string or int"))?;
                let val = std::str::from_utf8(val)
                    .map_err(|_| SubscribeError::bad_input("non-utf8 stat value"))?;
                self.store.set_stat_str(service, &key, val)?;
            }
        }
        Ok(())
    }

    pub fn on_get_stats(self: &Arc<Self>, msg: Message) {
        if let Some(replier) = &msg.replier {
            reply_json(replier, self.get_stats_json());
        }
    }

    pub fn get_stats_json(&self) -> Value {
        let mut result = serde_json::json!({});
        let now = unix_now();

        if let Ok(rows) = self.store.stats_rows() {
            for (service, name, val_str, val_int) in rows {
                if service.is_empty() {
                    if let Some(s) = val_str {
                        result[&name] = Value::String(s);
                    } else if let Some(i) = val_int {
                        result[&name] = Value::from(i);
                        if let Some(rest) = name.strip_prefix("last.") {
                            // A notifier is alive if it reported recently.
                            result[format!("alive.{rest}")] = Value::Bool(i > now - 60);
                        }
                    }
                } else if let Some(s) = val_str {
                    result["notifier"][&service][&name] = Value::String(s);
                } else if let Some(i) = val_int {
                    result["notifier"][&service][&name] = Value::from(i);
                }
            }
        }

        if let Ok(counts) = self.store.subscription_counts() {
            let mut total = 0i64;
            for (service, count) in counts {
                result["subscriptions"][&service] = Value::from(count);
                total += count;
            }
            result["subscriptions"]["total"] = Value::from(total);
        }

        let state = self.state.lock();
        let connections = state.sns.values().filter(|sn| sn.connected()).count();
        result["block_hash"] = Value::String(state.last_block.0.clone());
        result["block_height"] = Value::from(state.last_block.1);
        result["swarms"] = Value::from(state.swarms.len());
        result["snodes"] = Value::from(state.sns.len());
        result["accounts_monitored"] = Value::from(state.subscribers.len());
        result["connections"] = Value::from(connections);
        result["pending_connections"] = Value::from(self.pending_connects.load(Ordering::Acquire));
        result["uptime"] = Value::from(self.started.elapsed().as_secs_f64());
        result
    }

    fn log_status(self: &Arc<Self>) {
        let stats = self.get_stats_json();
        let alive: Vec<&str> = stats
            .as_object()
            .map(|obj| {
                obj.iter()
                    .filter(|(k, v)| k.starts_with("alive.") && v.as_bool() == Some(true))
                    .map(|(k, _)| &k["alive.".len()..])
                    .collect()
            })
            .unwrap_or_default();
        let notifies: i64 = stats["notifier"]
            .as_object()
            .map(|services| {
                services
                    .values()
                    .filter_map(|s| s["notifies"].as_i64())
                    .sum()
            })
            .unwrap_or(0);
        let conns = format!(
            "{}/{} ({} pending)",
            stats["connections"], stats["snodes"], stats["pending_connections"]
        );
        info!(
            connections = %conns,
            height = %stats["block_height"],
            accounts = %stats["accounts_monitored"],
            subscriptions = %stats["subscriptions"]["total"],
            services = %alive.join(", "),
            notifies,
            "status"
        );
    }

    // -- notification ingest -----------------------------------------------

    /// A storage node notified us about a newly stored message: find the
    /// matching subscription rows, drop what the rotating filter has
    /// already seen, and push the rest to their notifier services.
    pub fn on_message_notification(self: &Arc<Self>, msg: Message) {
        if msg.parts.len() != 1 {
            warn!(
                parts = msg.parts.len(),
                "unexpected message notification: expected 1-part data"
            );
            return;
        }
        if let Err(err) = self.handle_notification(&msg.parts[0]) {
            warn!("unexpected notification: {err}");
        }
    }

    fn handle_notification(&self, payload: &[u8]) -> Result<(), String> {
        let mut dict = BtDictReader::new(payload).map_err(|e| e.to_string())?;

        if !dict.skip_until(b"@").map_err(|e| e.to_string())? {
            return Err("missing account (@)".into());
        }
        let account = AccountId::try_from(dict.string().map_err(|e| e.to_string())?)
            .map_err(|_| "wrong account size (@)".to_string())?;

        if !dict.skip_until(b"h").map_err(|e| e.to_string())? {
            return Err("missing msg hash (h)".into());
        }
        let hash = dict.string().map_err(|e| e.to_string())?.to_vec();
        if hash.len() < MSG_HASH_MIN_SIZE || hash.len() > MSG_HASH_MAX_SIZE {
            return Err("bad msg hash size".into());
        }

        if !dict.skip_until(b"n").map_err(|e| e.to_string())? {
            return Err("missing namespace (n)".into());
        }
        let namespace: i16 = dict.integer().map_err(|e| e.to_string())?;

        if !dict.skip_until(b"t").map_err(|e| e.to_string())? {
            return Err("missing message timestamp (t)".into());
        }
        let timestamp_ms: i64 = dict.integer().map_err(|e| e.to_string())?;

        if !dict.skip_until(b"z").map_err(|e| e.to_string())? {
            return Err("missing message expiry (z)".into());
        }
        let expiry_ms: i64 = dict.integer().map_err(|e| e.to_string())?;

        let mut data: Option<Vec<u8>> = None;
        if dict.skip_until(b"~").map_err(|e| e.to_string())? {
            let raw = dict.string().map_err(|e| e.to_string())?;
            if raw.len() <= MSG_DATA_MAX_SIZE {
                data = Some(raw.to_vec());
            } else {
                debug!(len = raw.len(), "notification data over size limit; dropping data");
            }
        }

        trace!(
            account = %account,
            namespace,
            timestamp_ms,
            expiry_ms,
            data = data.as_ref().map(|d| d.len()).unwrap_or(0),
            "message notification"
        );

        let targets = self
            .store
            .matching_subscriptions(&account, namespace)
            .map_err(|e| e.to_string())?;
        if targets.is_empty() {
            debug!("no active subscriptions match; ignoring notification");
            return Ok(());
        }

        let mut notify_count = 0i64;
        {
            let mut state = self.state.lock();

            let now = Instant::now();
            if now >= state.filter_rotate_at {
                state.filter_rotate = std::mem::take(&mut state.filter);
                state.filter_rotate_at = now + self.config.filter_lifetime();
            }

            for target in &targets {
                let tag = blake2b_32(&[
                    target.service.as_bytes(),
                    target.svcid.as_bytes(),
                    &hash,
                ]);
                if state.filter_rotate.contains(&tag) || !state.filter.insert(tag) {
                    debug!("ignoring duplicate notification");
                    continue;
                }

                let Some(conn) = state.services.get(&target.service).copied() else {
                    warn!(
                        service = %target.service,
                        "notification depends on unregistered service; ignoring"
                    );
                    continue;
                };

                let mut payload = Vec::with_capacity(
                    200 + hash.len()
                        + target.svcid.len()
                        + target.svcdata.as_ref().map(|d| d.len()).unwrap_or(0)
                        + data.as_ref().map(|d| d.len()).unwrap_or(0),
                );
                let mut push = BtDictWriter::new(&mut payload);
                // Keys in ascii-sorted order.
                push.append_str("", target.service.as_bytes());
                if let Some(svcdata) = &target.svcdata {
                    push.append_str("!", svcdata);
                }
                push.append_str("#", &hash);
                push.append_str("&", target.svcid.as_bytes());
                push.append_str("@", &account.0);
                push.append_str("^", &target.enc_key.0);
                push.append_int("n", i64::from(namespace));
                if target.want_data {
                    if let Some(data) = &data {
                        push.append_str("~", data);
                    }
                }
                push.finish();

                debug!(service = %target.service, "sending push");
                self.mq.send(conn, "notifier.push", vec![Bytes::from(payload)]);
                notify_count += 1;
            }
        }

        self.store
            .increment_stat("", "notifications", notify_count)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    // -- service node refresh ----------------------------------------------

    pub fn on_new_block(self: &Arc<Self>, _msg: Message) {
        self.refresh_sns();
    }

    /// Kicks off a service-node list refresh from the blockchain RPC.
    pub fn refresh_sns(self: &Arc<Self>) {
        let oxend = self.state.lock().oxend;
        let Some(conn) = oxend else {
            warn!("cannot refresh service nodes: no oxend connection");
            return;
        };
        let this = self.clone();
        tokio::spawn(async move {
            match this
                .mq
                .request(
                    conn,
                    "rpc.get_service_nodes",
                    vec![Bytes::from_static(GET_SNS_PARAMS.as_bytes())],
                )
                .await
            {
                Ok(data) => this.on_sns_response(data),
                Err(err) => warn!(%err, "get_service_nodes request failed"),
            }
        });
    }

    pub(crate) fn on_sns_response(self: &Arc<Self>, data: Vec<Bytes>) {
        if data.len() != 2 {
            warn!(
                parts = data.len(),
                "get_service_nodes returned unexpected response length"
            );
            return;
        }
        if &data[0][..] != b"200" {
            warn!(
                status = %String::from_utf8_lossy(&data[0]),
                "get_service_nodes returned unexpected status"
            );
            return;
        }
        let res: Value = match serde_json::from_slice(&data[1]) {
            Ok(res) => res,
            Err(err) => {
                warn!(%err, "failed to parse get_service_nodes response");
                return;
            }
        };
        let Some(sn_states) = res.get("service_node_states").and_then(Value::as_array) else {
            warn!("unexpected get_service_nodes response: service_node_states looks wrong");
            return;
        };

        let mut state = self.state.lock();

        let mut swarms_changed = false;
        let new_hash = res
            .get("block_hash")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let new_height = res.get("height").and_then(Value::as_i64).unwrap_or(-1);
        if new_hash != state.last_block.0 {
            debug!(block = %new_hash, height = new_height, "new block");

            // Block changed, so swarm membership may have too.
            let new_ids: Vec<u64> = sn_states
                .iter()
                .filter_map(|sn| sn.get("swarm_id").and_then(Value::as_u64))
                .filter(|&id| id != INVALID_SWARM_ID)
                .collect::<BTreeSet<u64>>()
                .into_iter()
                .collect();
            if new_ids != state.swarm_ids {
                swarms_changed = true;
                state.swarm_ids = new_ids;
            }
            state.last_block = (new_hash, new_height);
        }

        // x25519 -> (ip, port, swarm) for every usable entry.
        let mut listed: HashMap<X25519Pk, (String, u16, u64)> = HashMap::new();
        for sn in sn_states {
            let pkx = sn.get("pubkey_x25519").and_then(Value::as_str).unwrap_or("");
            let ip = sn.get("public_ip").and_then(Value::as_str).unwrap_or("");
            let port = sn
                .get("storage_lmq_port")
                .and_then(Value::as_u64)
                .unwrap_or(0);
            let swarm = sn
                .get("swarm_id")
                .and_then(Value::as_u64)
                .unwrap_or(INVALID_SWARM_ID);
            if pkx.len() == 64
                && !ip.is_empty()
                && ip != "0.0.0.0"
                && port > 0
                && port <= u16::MAX as u64
                && swarm != INVALID_SWARM_ID
            {
                if let Ok(pk) = X25519Pk::parse(pkx.as_bytes()) {
                    listed.insert(pk, (ip.to_string(), port as u16, swarm));
                }
            }
        }
        debug!(
            active = listed.len(),
            missing_details = sn_states.len() - listed.len(),
            "service node list"
        );

        let State {
            sns,
            swarms,
            swarm_ids,
            subscribers,
            ..
        } = &mut *state;

        // Anything known but no longer listed has left the network (or
        // lost its details); disconnect and forget it.
        let mut dropped = 0usize;
        sns.retain(|pubkey, snode| {
            if listed.contains_key(pubkey) {
                return true;
            }
            debug!(%pubkey, "dropping delisted service node");
            if let Some(members) = swarms.get_mut(&snode.swarm()) {
                members.remove(pubkey);
            }
            snode.disconnect();
            dropped += 1;
            false
        });

        let mut new_or_changed: Vec<Arc<SNode>> = Vec::new();
        for (pubkey, (ip, port, swarm)) in &listed {
            let addr = format!("tcp://{ip}:{port}");
            if let Some(snode) = sns.get(pubkey) {
                let snode = snode.clone();
                if snode.swarm() != *swarm {
                    if let Some(members) = swarms.get_mut(&snode.swarm()) {
                        members.remove(pubkey);
                    }
                    snode.reset_swarm(*swarm);
                    swarms.entry(*swarm).or_default().insert(*pubkey, snode.clone());
                    new_or_changed.push(snode.clone());
                }
                // Reconnects only if the address actually changed.
                snode.connect_to(addr);
            } else {
                let snode = SNode::new(
                    Arc::downgrade(self),
                    self.next_push_mq(),
                    *pubkey,
                    addr,
                    *swarm,
                );
                sns.insert(*pubkey, snode.clone());
                swarms.entry(*swarm).or_default().insert(*pubkey, snode.clone());
                new_or_changed.push(snode.clone());
                snode.connect();
            }
        }

        swarms.retain(|_, members| !members.is_empty());

        debug!(
            new_or_changed = new_or_changed.len(),
            dropped, "service node update"
        );

        if swarms_changed {
            // Full swarm-membership recheck: every account's swarm is
            // recomputed, stale members are ejected from each snode, and
            // the now-local subscribers are (re-)added everywhere.
            let mut moved = 0usize;
            for (pubkey, entry) in subscribers.iter_mut() {
                let swarm = pubkey.closest_swarm(swarm_ids);
                if swarm != entry.swarm {
                    entry.swarm = swarm;
                    moved += 1;
                }
            }
            debug!(moved, "accounts changed swarms");

            for (swarm_id, members) in swarms.iter() {
                for snode in members.values() {
                    snode.remove_stale_swarm_members(swarm_ids);
                }
                for (pubkey, entry) in subscribers.iter() {
                    if entry.swarm == *swarm_id {
                        for snode in members.values() {
                            snode.add_account(pubkey, false);
                        }
                    }
                }
            }
            Self::check_subs_on(sns, subscribers, false);
        } else if !new_or_changed.is_empty() {
            // Swarms are unchanged (so no account moved), but snodes may
            // have joined or moved between existing swarms; make sure
            // each such snode has every local subscriber.
            for snode in &new_or_changed {
                for (pubkey, entry) in subscribers.iter() {
                    if entry.swarm == snode.swarm() {
                        snode.add_account(pubkey, false);
                    }
                }
            }
            Self::check_subs_on(sns, subscribers, false);
        }
    }

    fn next_push_mq(&self) -> Arc<dyn MessageQueue> {
        if self.push_mqs.is_empty() {
            return self.mq.clone();
        }
        let i = self.push_next.fetch_add(1, Ordering::Relaxed) % self.push_mqs.len();
        self.push_mqs[i].clone()
    }

    /// The durable store backing this orchestrator.
    pub fn store(&self) -> &SubscriberStore {
        &self.store
    }

    // -- test support -------------------------------------------------------

    #[cfg(test)]
    pub(crate) fn test_set_ready(self: &Arc<Self>) {
        self.set_ready();
    }

    #[cfg(test)]
    pub(crate) fn test_counts(&self) -> (usize, usize, usize) {
        let state = self.state.lock();
        (state.sns.len(), state.swarms.len(), state.subscribers.len())
    }

    #[cfg(test)]
    pub(crate) fn test_swarm_ids(&self) -> Vec<u64> {
        self.state.lock().swarm_ids.clone()
    }

    #[cfg(test)]
    pub(crate) fn test_snode(&self, pubkey: &X25519Pk) -> Option<Arc<SNode>> {
        self.state.lock().sns.get(pubkey).cloned()
    }

    #[cfg(test)]
    pub(crate) fn test_subscriber_swarm(&self, account: &AccountId) -> Option<u64> {
        let state = self.state.lock();
        state
            .subscribers
            .iter()
            .find(|(pk, _)| &pk.id == account)
            .map(|(_, entry)| entry.swarm)
    }
}

fn reply_json(replier: &Replier, body: Value) {
    replier.send(vec![Bytes::from(body.to_string())]);
}

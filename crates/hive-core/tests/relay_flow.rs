//! End-to-end relay flow over the in-process transport: startup
//! sequencing, subscribe → storage-node subscription → notification →
//! push, swarm refresh on new blocks, and restart durability.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use ed25519_dalek::{Signer, SigningKey};
use hive_core::bt::{BtDictReader, BtDictWriter, BtListReader};
use hive_core::mq::{AuthLevel, ConnectionId, LocalHub, LocalPeer, Message, MessageQueue};
use hive_core::rpc::hivemind_router;
use hive_core::store::SubscriberStore;
use hive_core::subscription::{monitor_message, unix_now, unsubscribe_message};
use hive_core::{Config, HiveMind, SwarmPubkey};
use hive_crypto::{ed25519_to_x25519, AccountId, Ed25519Pk, X25519Pk};
use serde_json::{json, Value};

struct TestAccount {
    sk: SigningKey,
    pubkey: SwarmPubkey,
}

impl TestAccount {
    fn new() -> Self {
        let sk = SigningKey::generate(&mut rand_core::OsRng);
        let ed = Ed25519Pk(sk.verifying_key().to_bytes());
        let x = ed25519_to_x25519(&ed).unwrap();
        let mut id = [0u8; 33];
        id[0] = 0x05;
        id[1..33].copy_from_slice(&x.0);
        let pubkey = SwarmPubkey::new(AccountId(id), Some(ed)).unwrap();
        Self { sk, pubkey }
    }

    fn subscribe_body(&self, namespaces: &[i16], want_data: bool) -> Value {
        let sig_ts = unix_now();
        let msg = monitor_message(&self.pubkey, sig_ts, want_data, namespaces);
        let sig = self.sk.sign(msg.as_bytes());
        json!({
            "pubkey": self.pubkey.id.to_hex(),
            "session_ed25519": self.pubkey.ed25519.to_hex(),
            "namespaces": namespaces,
            "data": want_data,
            "sig_ts": sig_ts,
            "signature": hex::encode(sig.to_bytes()),
            "service": "apns",
            "service_info": { "token": "integration-test-device" },
            "enc_key": hex::encode([9u8; 32]),
        })
    }

    fn unsubscribe_body(&self) -> Value {
        let sig_ts = unix_now();
        let msg = unsubscribe_message(&self.pubkey, sig_ts);
        let sig = self.sk.sign(msg.as_bytes());
        json!({
            "pubkey": self.pubkey.id.to_hex(),
            "session_ed25519": self.pubkey.ed25519.to_hex(),
            "sig_ts": sig_ts,
            "signature": hex::encode(sig.to_bytes()),
            "service": "apns",
            "service_info": { "token": "integration-test-device" },
        })
    }
}

/// A fake storage node: records monitor.messages bodies and the
/// connection they arrived on, so the test can send notifications back
/// over the same connection.
struct StorageNode {
    batches: Arc<Mutex<Vec<Vec<u8>>>>,
    conn: Arc<Mutex<Option<ConnectionId>>>,
    peer: Arc<LocalPeer>,
}

fn attach_storage_node(hub: &Arc<LocalHub>, addr: &str) -> StorageNode {
    let batches: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let conn: Arc<Mutex<Option<ConnectionId>>> = Arc::new(Mutex::new(None));
    let peer = hub.peer(addr, AuthLevel::None, {
        let batches = batches.clone();
        let conn = conn.clone();
        Arc::new(move |msg: Message| {
            if msg.endpoint == "monitor.messages" {
                batches.lock().unwrap().push(msg.parts[0].to_vec());
                *conn.lock().unwrap() = Some(msg.conn);
                if let Some(replier) = &msg.replier {
                    replier.send(vec![Bytes::from_static(b"ok")]);
                }
            }
        })
    });
    StorageNode {
        batches,
        conn,
        peer,
    }
}

impl StorageNode {
    fn first_batch(&self) -> Option<Vec<u8>> {
        self.batches.lock().unwrap().first().cloned()
    }

    /// Sends a stored-message notification over the connection hivemind
    /// opened to this node.
    fn notify(&self, payload: Vec<u8>) {
        let conn = self.conn.lock().unwrap().expect("no inbound connection yet");
        self.peer
            .send(conn, "notify.message", vec![Bytes::from(payload)]);
    }
}

fn sn_states(entries: &[(&X25519Pk, &str, u64)]) -> Value {
    Value::Array(
        entries
            .iter()
            .map(|(pk, host, swarm)| {
                json!({
                    "pubkey_x25519": pk.to_hex(),
                    "public_ip": host,
                    "storage_lmq_port": 1,
                    "swarm_id": swarm,
                })
            })
            .collect(),
    )
}

struct ChainStub {
    response: Mutex<Value>,
    conn: Mutex<Option<ConnectionId>>,
    peer: Mutex<Option<Arc<LocalPeer>>>,
}

fn attach_chain(hub: &Arc<LocalHub>, addr: &str, initial: Value) -> Arc<ChainStub> {
    let chain = Arc::new(ChainStub {
        response: Mutex::new(initial),
        conn: Mutex::new(None),
        peer: Mutex::new(None),
    });
    let peer = hub.peer(addr, AuthLevel::Basic, {
        let chain = chain.clone();
        Arc::new(move |msg: Message| {
            *chain.conn.lock().unwrap() = Some(msg.conn);
            let Some(replier) = &msg.replier else { return };
            match msg.endpoint.as_str() {
                "ping.ping" => replier.send(vec![Bytes::from_static(b"pong")]),
                "rpc.get_service_nodes" => {
                    let body = chain.response.lock().unwrap().to_string();
                    replier.send(vec![Bytes::from_static(b"200"), Bytes::from(body)]);
                }
                "sub.block" => replier.send(vec![Bytes::from_static(b"ok")]),
                _ => {}
            }
        })
    });
    *chain.peer.lock().unwrap() = Some(peer);
    chain
}

impl ChainStub {
    /// Announces a new block over the connection hivemind opened to us.
    fn notify_block(&self) {
        let conn = self.conn.lock().unwrap().expect("hivemind never connected");
        let peer = self.peer.lock().unwrap().clone().unwrap();
        peer.send(conn, "notify.block", vec![]);
    }
}

struct Relay {
    hub: Arc<LocalHub>,
    hivemind: Arc<HiveMind>,
    chain: Arc<ChainStub>,
    pushes: Arc<Mutex<Vec<Vec<u8>>>>,
    client: Arc<LocalPeer>,
    client_conn: ConnectionId,
}

async fn start_relay(hub: &Arc<LocalHub>, store: SubscriberStore, initial_chain: Value) -> Relay {
    let (pubkey, privkey) = hive_crypto::generate_x25519_identity();
    let config = Config {
        oxend_rpc: "oxend".to_string(),
        hivemind_sock: "hivemind".to_string(),
        pubkey,
        privkey,
        notifier_wait_ms: 2_000,
        notifiers_expected: ["apns".to_string()].into_iter().collect(),
        ..Config::default()
    };

    let chain = attach_chain(hub, "oxend", initial_chain);

    let mq = hub.client("hivemind");
    let hivemind = HiveMind::new(config, mq, store).unwrap();
    hub.peer(
        "hivemind",
        AuthLevel::Admin,
        hivemind_router(&hivemind).into_handler(),
    );

    // An "apns" notifier that validates everything; registering it
    // short-circuits the startup notifier wait.
    let pushes: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    let apns = hub.peer("apns", AuthLevel::None, {
        let pushes = pushes.clone();
        Arc::new(move |msg: Message| match msg.endpoint.as_str() {
            "notifier.validate" => {
                if let Some(replier) = &msg.replier {
                    replier.send(vec![
                        Bytes::from_static(b"0"),
                        Bytes::from(format!("{:0>32}", "integration-test-device")),
                    ]);
                }
            }
            "notifier.push" => pushes.lock().unwrap().push(msg.parts[0].to_vec()),
            _ => {}
        })
    });
    let apns_conn = apns.connect("hivemind").await.unwrap();
    apns.send(
        apns_conn,
        "admin.register_service",
        vec![Bytes::from_static(b"apns")],
    );

    hivemind.start().await.unwrap();

    let client = hub.client("frontend");
    let client_conn = client.connect("hivemind").await.unwrap();

    Relay {
        hub: hub.clone(),
        hivemind,
        chain,
        pushes,
        client,
        client_conn,
    }
}

impl Relay {
    async fn push_request(&self, endpoint: &str, body: &Value) -> Value {
        let reply = self
            .client
            .request(
                self.client_conn,
                endpoint,
                vec![Bytes::from(body.to_string())],
            )
            .await
            .unwrap();
        serde_json::from_slice(&reply[0]).unwrap()
    }
}

/// Waits until the service-node refresh has landed; `start` returns
/// before the asynchronous first refresh completes.
async fn wait_for_snodes(relay: &Relay, count: i64) {
    wait_for(|| (relay.hivemind.get_stats_json()["snodes"] == count).then_some(())).await;
}

async fn wait_for<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    for _ in 0..150 {
        if let Some(found) = probe() {
            return found;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn subscribe_notify_unsubscribe_flow() {
    let sn_pk = X25519Pk([0x42; 32]);
    let hub = LocalHub::new();
    let storage = attach_storage_node(&hub, "tcp://sn1:1");

    let initial = json!({
        "block_hash": "block-1",
        "height": 100,
        "service_node_states": sn_states(&[(&sn_pk, "sn1", 0x1000)]),
    });
    let relay = start_relay(&hub, SubscriberStore::open_in_memory().unwrap(), initial).await;
    wait_for_snodes(&relay, 1).await;

    let account = TestAccount::new();
    let reply = relay
        .push_request("push.subscribe", &account.subscribe_body(&[0, 1], true))
        .await;
    assert_eq!(reply["success"], true, "{reply}");
    assert_eq!(reply["added"], true);

    // The new subscription must reach the storage node as a bencoded
    // monitor batch within the fast-path window.
    let body = wait_for(|| storage.first_batch()).await;
    let mut list = BtListReader::new(&body).unwrap();
    let entry = list.next_raw().unwrap().unwrap();
    let mut dict = BtDictReader::new(entry).unwrap();
    assert!(dict.skip_until(b"P").unwrap());
    assert_eq!(dict.string().unwrap(), &account.pubkey.ed25519.0[..]);
    assert!(dict.skip_until(b"d").unwrap());
    assert_eq!(dict.integer::<i64>().unwrap(), 1);
    assert!(dict.skip_until(b"s").unwrap());

    // A stored-message notification from the storage node fans out to
    // the notifier.
    let mut payload = Vec::new();
    let mut notif = BtDictWriter::new(&mut payload);
    notif.append_str("@", &account.pubkey.id.0);
    notif.append_str("h", &[0x77u8; 43]);
    notif.append_int("n", 1);
    notif.append_int("t", 1_700_000_000_000);
    notif.append_int("z", 1_700_001_000_000);
    notif.append_str("~", b"ciphertext");
    notif.finish();
    storage.notify(payload);

    let push = wait_for(|| relay.pushes.lock().unwrap().first().cloned()).await;
    let mut dict = BtDictReader::new(&push).unwrap();
    assert!(dict.skip_until(b"").unwrap());
    assert_eq!(dict.string().unwrap(), b"apns");
    assert!(dict.skip_until(b"@").unwrap());
    assert_eq!(dict.string().unwrap(), &account.pubkey.id.0[..]);
    assert!(dict.skip_until(b"~").unwrap());
    assert_eq!(dict.string().unwrap(), b"ciphertext");

    // Stats see all of it.
    let stats = relay.hivemind.get_stats_json();
    assert_eq!(stats["subscriptions"]["total"], 1);
    assert_eq!(stats["subscriptions"]["apns"], 1);
    assert_eq!(stats["block_height"], 100);
    assert_eq!(stats["snodes"], 1);

    // Unsubscribe removes the durable row; repeating reports removed
    // false.
    let reply = relay
        .push_request("push.unsubscribe", &account.unsubscribe_body())
        .await;
    assert_eq!(reply["success"], true);
    assert_eq!(reply["removed"], true);
    let reply = relay
        .push_request("push.unsubscribe", &account.unsubscribe_body())
        .await;
    assert_eq!(reply["removed"], false);
}

#[tokio::test]
async fn new_block_with_new_swarm_resubscribes() {
    let sn1 = X25519Pk([0x42; 32]);
    let sn2 = X25519Pk([0x43; 32]);
    let hub = LocalHub::new();
    let storage1 = attach_storage_node(&hub, "tcp://sn1:1");
    let storage2 = attach_storage_node(&hub, "tcp://sn2:1");

    let initial = json!({
        "block_hash": "block-1",
        "height": 100,
        "service_node_states": sn_states(&[(&sn1, "sn1", 0x1000)]),
    });
    let relay = start_relay(&hub, SubscriberStore::open_in_memory().unwrap(), initial).await;
    wait_for_snodes(&relay, 1).await;

    let account = TestAccount::new();
    let reply = relay
        .push_request("push.subscribe", &account.subscribe_body(&[0], true))
        .await;
    assert_eq!(reply["success"], true, "{reply}");
    wait_for(|| storage1.first_batch()).await;

    // A new block adds a second swarm whose id exactly matches the
    // account's swarm space; the account must move there and sn2 must
    // receive its subscription.
    *relay.chain.response.lock().unwrap() = json!({
        "block_hash": "block-2",
        "height": 101,
        "service_node_states": sn_states(&[
            (&sn1, "sn1", 0x1000),
            (&sn2, "sn2", account.pubkey.swarm_space),
        ]),
    });
    relay.chain.notify_block();

    wait_for(|| storage2.first_batch()).await;
    let stats = relay.hivemind.get_stats_json();
    assert_eq!(stats["block_height"], 101);
    assert_eq!(stats["swarms"], 2);
}

#[tokio::test]
async fn subscriptions_survive_restart() {
    let db_path = std::env::temp_dir().join(format!(
        "hive-test-{}-{}.db",
        std::process::id(),
        unix_now()
    ));

    let sn_pk = X25519Pk([0x42; 32]);
    let initial = json!({
        "block_hash": "block-1",
        "height": 100,
        "service_node_states": sn_states(&[(&sn_pk, "sn1", 0x1000)]),
    });

    let account = TestAccount::new();
    {
        let hub = LocalHub::new();
        let _storage = attach_storage_node(&hub, "tcp://sn1:1");
        let store = SubscriberStore::open(&db_path).unwrap();
        let relay = start_relay(&hub, store, initial.clone()).await;
        wait_for_snodes(&relay, 1).await;
        let reply = relay
            .push_request("push.subscribe", &account.subscribe_body(&[0], true))
            .await;
        assert_eq!(reply["success"], true, "{reply}");
    }

    // A fresh instance over the same database sees the subscription
    // without any client interaction.
    let hub = LocalHub::new();
    let _storage = attach_storage_node(&hub, "tcp://sn1:1");
    let store = SubscriberStore::open(&db_path).unwrap();
    let relay = start_relay(&hub, store, initial).await;
    let stats = relay.hivemind.get_stats_json();
    assert_eq!(stats["subscriptions"]["total"], 1);
    assert_eq!(stats["accounts_monitored"], 1);

    std::fs::remove_file(&db_path).ok();
}

#[tokio::test]
async fn public_listener_auth_gates_admin_endpoints() {
    let hub = LocalHub::new();
    let initial = json!({
        "block_hash": "block-1",
        "height": 100,
        "service_node_states": [],
    });
    let relay = start_relay(&hub, SubscriberStore::open_in_memory().unwrap(), initial).await;

    // Expose the same endpoint table on a public listener that grants
    // no auth to connections.
    let handler = hivemind_router(&relay.hivemind).into_handler();
    relay.hub.peer("hivemind-public", AuthLevel::None, handler);

    let outsider = relay.hub.client("outsider");
    let conn = outsider.connect("hivemind-public").await.unwrap();

    let reply = outsider
        .request(conn, "admin.get_stats", vec![])
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&reply[0]).unwrap();
    assert_eq!(body["error"], 4);
    assert_eq!(body["message"], "not authorized");

    // The public subscribe path still works without auth.
    let account = TestAccount::new();
    let reply = outsider
        .request(
            conn,
            "push.subscribe",
            vec![Bytes::from(account.subscribe_body(&[0], true).to_string())],
        )
        .await
        .unwrap();
    let body: Value = serde_json::from_slice(&reply[0]).unwrap();
    assert_eq!(body["success"], true, "{body}");
}

//! hived: the push notification relay daemon.
//!
//! The relay core is transport-agnostic (see [`hive_core::mq`]); a
//! production deployment embeds it behind a real message-queue
//! transport.  This binary wires the core up over the in-process hub,
//! which is enough to run it standalone for development: with
//! `--dummy-peers` a stub chain RPC and a "dummy" notifier service are
//! attached so the whole subscribe → notify pipeline can be exercised
//! locally.
//!
//! `hived keygen` prints a fresh x25519 identity in config format.

use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use hive_core::mq::{AuthLevel, LocalHub, Message, MessageQueue};
use hive_core::rpc::hivemind_router;
use hive_core::store::SubscriberStore;
use hive_core::{Config, HiveMind};

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().collect();
    if args.get(1).map(String::as_str) == Some("keygen") {
        let (pubkey, privkey) = hive_crypto::generate_x25519_identity();
        println!("pubkey = \"{}\"", pubkey.to_hex());
        println!("privkey = \"{}\"", privkey.to_hex());
        return Ok(());
    }
    let dummy_peers = args.iter().any(|a| a == "--dummy-peers");

    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting hived");

    let config = Config::load()?;
    let store = SubscriberStore::open(&config.db_path)?;

    let hub = LocalHub::new();
    if dummy_peers {
        attach_dummy_chain(&hub, &config.oxend_rpc);
    }

    let mq = hub.client(&config.hivemind_sock);
    let hivemind = HiveMind::new(config, mq, store)?;

    // Local socket connections are implicitly admin; the public curve
    // listener (when a networked transport provides one) grants admin
    // only to allowlisted keys, per rpc::curve_auth_level.
    hub.peer(
        &hivemind.config.hivemind_sock,
        AuthLevel::Admin,
        hivemind_router(&hivemind).into_handler(),
    );
    info!(sock = %hivemind.config.hivemind_sock, "listening for local connections");

    if dummy_peers {
        attach_dummy_notifier(&hub, &hivemind.config.hivemind_sock).await;
    }

    if let Err(err) = hivemind.start().await {
        error!(%err, "startup failed");
        return Err(err.into());
    }

    // Everything from here on is timer- and message-driven.
    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    Ok(())
}

/// A stand-in chain RPC: answers pings and returns an empty service
/// node list.
fn attach_dummy_chain(hub: &Arc<LocalHub>, addr: &str) {
    hub.peer(
        addr,
        AuthLevel::Basic,
        Arc::new(|msg: Message| {
            let Some(replier) = &msg.replier else { return };
            match msg.endpoint.as_str() {
                "ping.ping" => replier.send(vec![Bytes::from_static(b"pong")]),
                "rpc.get_service_nodes" => replier.send(vec![
                    Bytes::from_static(b"200"),
                    Bytes::from_static(
                        br#"{"block_hash": "", "height": 0, "service_node_states": []}"#,
                    ),
                ]),
                "sub.block" => replier.send(vec![Bytes::from_static(b"ok")]),
                other => warn!(endpoint = other, "dummy chain: unexpected request"),
            }
        }),
    );
}

/// An in-process "dummy" notifier, useful for exercising the full
/// subscribe → validate → push pipeline without a real push backend.
/// Wants a `service_info` of `{"foo": "TEST-...", "bar": <int>}`.
async fn attach_dummy_notifier(hub: &Arc<LocalHub>, hivemind_sock: &str) {
    use parking_lot::Mutex;

    let notifies = Arc::new(Mutex::new(0i64));
    let peer = hub.peer("dummy-notifier", AuthLevel::None, {
        let notifies = notifies.clone();
        Arc::new(move |msg: Message| match msg.endpoint.as_str() {
            "notifier.validate" => {
                let Some(replier) = &msg.replier else { return };
                match dummy_validate(&msg.parts) {
                    Ok((svcid, svcdata)) => replier.send(vec![
                        Bytes::from_static(b"0"),
                        Bytes::from(svcid),
                        Bytes::from(svcdata),
                    ]),
                    Err(message) => {
                        replier.send(vec![Bytes::from_static(b"1"), Bytes::from(message)])
                    }
                }
            }
            "notifier.push" => {
                info!(bytes = msg.parts[0].len(), "dummy notifier received push");
                *notifies.lock() += 1;
            }
            _ => {}
        })
    });

    match peer.connect(hivemind_sock).await {
        Ok(conn) => {
            peer.send(conn, "admin.register_service", vec![Bytes::from_static(b"dummy")]);
            info!("dummy notifier registered");

            // Report stats once a second, like a real notifier would.
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    let count = std::mem::take(&mut *notifies.lock());
                    let mut report = Vec::new();
                    let mut dict = hive_core::bt::BtDictWriter::new(&mut report);
                    dict.append_int("+notifies", count);
                    dict.finish();
                    peer.send(
                        conn,
                        "admin.service_stats",
                        vec![Bytes::from_static(b"dummy"), Bytes::from(report)],
                    );
                }
            });
        }
        Err(err) => error!(%err, "dummy notifier could not reach hivemind"),
    }
}

/// Validation for the dummy service: `foo` must start with `TEST-` and
/// `bar` must be an integer; the device id is a keyed hash of the two.
fn dummy_validate(parts: &[Bytes]) -> Result<(String, Vec<u8>), String> {
    if parts.len() != 2 || &parts[0][..] != b"dummy" {
        return Err("Internal error: invalid input to notifier.validate".to_string());
    }
    let info: serde_json::Value =
        serde_json::from_slice(&parts[1]).map_err(|e| format!("invalid service_info: {e}"))?;
    let foo = info
        .get("foo")
        .and_then(serde_json::Value::as_str)
        .ok_or("missing required service_info key foo")?;
    if !foo.starts_with("TEST-") {
        return Err("Invalid input: foo must start with TEST-".to_string());
    }
    let bar = info
        .get("bar")
        .and_then(serde_json::Value::as_i64)
        .ok_or("Invalid input: bar must be an integer")?;

    let unique_id = hive_crypto::blake2b_32_keyed(
        b"TestNotifier",
        &[format!("{bar}_{foo}").as_bytes()],
    );

    let mut svcdata = Vec::new();
    let mut dict = hive_core::bt::BtDictWriter::new(&mut svcdata);
    dict.append_int("bar", bar);
    dict.append_str("foo", foo.as_bytes());
    dict.finish();

    Ok((unique_id.to_hex(), svcdata))
}

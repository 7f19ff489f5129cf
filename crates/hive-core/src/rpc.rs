//! The named endpoint surface exposed over the message-queue transport.
//!
//! Endpoint bodies are thin adapters into [`HiveMind`]; this module owns
//! the name → handler table, the per-category auth requirements, and the
//! last-resort error reply when a handler panics.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use bytes::Bytes;
use hive_crypto::X25519Pk;
use tracing::{error, warn};

use crate::config::Config;
use crate::error::SubscribeCode;
use crate::hivemind::HiveMind;
use crate::mq::{AuthLevel, Handler, Message};

struct Endpoint {
    auth: AuthLevel,
    handler: Box<dyn Fn(Message) + Send + Sync>,
}

/// Dispatch table for incoming messages.
#[derive(Default)]
pub struct Router {
    endpoints: HashMap<String, Endpoint>,
}

impl Router {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &mut self,
        name: &str,
        auth: AuthLevel,
        handler: impl Fn(Message) + Send + Sync + 'static,
    ) {
        self.endpoints.insert(
            name.to_string(),
            Endpoint {
                auth,
                handler: Box::new(handler),
            },
        );
    }

    pub fn dispatch(&self, msg: Message) {
        let Some(endpoint) = self.endpoints.get(&msg.endpoint) else {
            warn!(endpoint = %msg.endpoint, "request for unknown endpoint");
            return;
        };
        if msg.auth < endpoint.auth {
            warn!(
                endpoint = %msg.endpoint,
                granted = ?msg.auth,
                required = ?endpoint.auth,
                "denying insufficiently authorized request"
            );
            if let Some(replier) = &msg.replier {
                replier.send(vec![json_error(SubscribeCode::Error, "not authorized")]);
            }
            return;
        }

        // A panicking handler must not take the whole relay down, and a
        // request deserves *some* answer.
        let name = msg.endpoint.clone();
        let fallback = msg.replier.clone();
        if std::panic::catch_unwind(AssertUnwindSafe(|| (endpoint.handler)(msg))).is_err() {
            error!(endpoint = %name, "handler panicked");
            if let Some(replier) = fallback {
                replier.send(vec![json_error(
                    SubscribeCode::InternalError,
                    "An internal error occurred while processing your request",
                )]);
            }
        }
    }

    /// Wraps the router as a transport dispatcher.
    pub fn into_handler(self) -> Handler {
        Arc::new(move |msg| self.dispatch(msg))
    }
}

fn json_error(code: SubscribeCode, message: &str) -> Bytes {
    Bytes::from(serde_json::json!({ "error": code as i32, "message": message }).to_string())
}

/// Builds the full endpoint table of the relay.
pub fn hivemind_router(hivemind: &Arc<HiveMind>) -> Router {
    let mut router = Router::new();

    // Blockchain daemon: a new block means possibly-changed swarms.
    let hm = hivemind.clone();
    router.add("notify.block", AuthLevel::Basic, move |msg| {
        hm.on_new_block(msg)
    });

    // Storage nodes: a message arrived in a monitored account's inbox.
    let hm = hivemind.clone();
    router.add("notify.message", AuthLevel::Basic, move |msg| {
        hm.on_message_notification(msg)
    });

    // Front-end: client (un)subscriptions; no auth, payloads prove
    // themselves by signature.
    let hm = hivemind.clone();
    router.add("push.subscribe", AuthLevel::None, move |msg| {
        hm.on_subscribe(msg)
    });
    let hm = hivemind.clone();
    router.add("push.unsubscribe", AuthLevel::None, move |msg| {
        hm.on_unsubscribe(msg)
    });

    // Notifier backends (and operators).
    let hm = hivemind.clone();
    router.add("admin.register_service", AuthLevel::Admin, move |msg| {
        hm.on_reg_service(msg)
    });
    let hm = hivemind.clone();
    router.add("admin.service_stats", AuthLevel::Admin, move |msg| {
        hm.on_service_stats(msg)
    });
    let hm = hivemind.clone();
    router.add("admin.get_stats", AuthLevel::Admin, move |msg| {
        hm.on_get_stats(msg)
    });

    router
}

/// Auth granted to a connection on the public curve listener:
/// allowlisted keys are admin, everyone else gets the public level.
pub fn curve_auth_level(config: &Config, remote: &X25519Pk) -> AuthLevel {
    if config.hivemind_curve_admin.contains(remote) {
        AuthLevel::Admin
    } else {
        AuthLevel::None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::Replier;
    use parking_lot::Mutex;

    fn msg(endpoint: &str, auth: AuthLevel, replier: Option<Replier>) -> Message {
        Message {
            conn: 1,
            endpoint: endpoint.to_string(),
            auth,
            parts: vec![],
            replier,
        }
    }

    #[test]
    fn dispatch_routes_by_name() {
        let hits = Arc::new(Mutex::new(0));
        let mut router = Router::new();
        let hits2 = hits.clone();
        router.add("a.b", AuthLevel::None, move |_| *hits2.lock() += 1);

        router.dispatch(msg("a.b", AuthLevel::None, None));
        router.dispatch(msg("a.c", AuthLevel::None, None));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn insufficient_auth_is_denied_with_error_reply() {
        let hits = Arc::new(Mutex::new(0));
        let mut router = Router::new();
        let hits2 = hits.clone();
        router.add("admin.x", AuthLevel::Admin, move |_| *hits2.lock() += 1);

        let (replier, mut rx) = Replier::new();
        router.dispatch(msg("admin.x", AuthLevel::Basic, Some(replier)));
        assert_eq!(*hits.lock(), 0);
        let reply = rx.try_recv().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&reply[0]).unwrap();
        assert_eq!(body["error"], SubscribeCode::Error as i32);

        router.dispatch(msg("admin.x", AuthLevel::Admin, None));
        assert_eq!(*hits.lock(), 1);
    }

    #[test]
    fn panicking_handler_yields_internal_error_reply() {
        let mut router = Router::new();
        router.add("boom", AuthLevel::None, |_| panic!("kaboom"));

        let (replier, mut rx) = Replier::new();
        router.dispatch(msg("boom", AuthLevel::None, Some(replier)));
        let reply = rx.try_recv().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&reply[0]).unwrap();
        assert_eq!(body["error"], SubscribeCode::InternalError as i32);
    }

    #[test]
    fn curve_auth_allowlist() {
        let (admin_pk, _) = hive_crypto::generate_x25519_identity();
        let (other_pk, _) = hive_crypto::generate_x25519_identity();
        let mut config = Config::default();
        config.hivemind_curve_admin.insert(admin_pk);

        assert_eq!(curve_auth_level(&config, &admin_pk), AuthLevel::Admin);
        assert_eq!(curve_auth_level(&config, &other_pk), AuthLevel::None);
    }
}

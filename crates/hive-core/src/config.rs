//! Relay configuration.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use hive_crypto::{X25519Pk, X25519Sk};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Address of the blockchain RPC node providing the service node
    /// list and block notifications.
    pub oxend_rpc: String,

    /// Path of the subscription database.
    pub db_path: PathBuf,

    /// Local socket on which the front-end and notifier services talk
    /// to us; local connections are implicitly admin.
    pub hivemind_sock: String,

    /// Optional public listener with curve encryption.
    pub hivemind_curve: Option<String>,

    /// X25519 pubkeys granted admin on the curve listener.
    pub hivemind_curve_admin: HashSet<X25519Pk>,

    /// Our own x25519 keypair; must be set explicitly.
    pub pubkey: X25519Pk,
    pub privkey: X25519Sk,

    /// How long a notification dedup filter generation lives; repeats
    /// are suppressed for between one and two lifetimes.
    pub filter_lifetime_secs: u64,

    /// How long after startup we wait for notifier services to register
    /// before taking requests.
    pub notifier_wait_ms: u64,

    /// Stop waiting early once all of these services have registered.
    pub notifiers_expected: HashSet<String>,

    /// Slow-path resubscription check interval.
    pub subs_interval_secs: u64,

    /// Maximum simultaneous connection attempts to storage nodes.
    /// 0 makes a "dry run" relay that never connects out.
    pub max_pending_connects: i64,

    /// Accept the historical derived-subkey authentication scheme in
    /// addition to delegated subaccounts.
    pub allow_legacy_subkeys: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            oxend_rpc: String::new(),
            db_path: PathBuf::from("hive.db"),
            hivemind_sock: "ipc://./hivemind.sock".to_string(),
            hivemind_curve: None,
            hivemind_curve_admin: HashSet::new(),
            pubkey: X25519Pk([0; 32]),
            privkey: X25519Sk([0; 32]),
            filter_lifetime_secs: 600,
            notifier_wait_ms: 10_000,
            notifiers_expected: HashSet::new(),
            subs_interval_secs: 30,
            max_pending_connects: 500,
            allow_legacy_subkeys: false,
        }
    }
}

impl Config {
    /// Loads configuration: TOML file first (from `HIVED_CONFIG` if
    /// set), then environment variable overrides, then validation.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var("HIVED_CONFIG") {
            Ok(path) => Self::from_toml(&std::fs::read_to_string(path)?)?,
            Err(_) => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    fn apply_env(&mut self) {
        if let Ok(addr) = std::env::var("HIVED_OXEND_RPC") {
            self.oxend_rpc = addr;
        }
        if let Ok(path) = std::env::var("HIVED_DB") {
            self.db_path = PathBuf::from(path);
        }
        if let Ok(sock) = std::env::var("HIVED_SOCK") {
            self.hivemind_sock = sock;
        }
        if let Ok(curve) = std::env::var("HIVED_CURVE") {
            self.hivemind_curve = Some(curve);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.oxend_rpc.is_empty() {
            return Err(ConfigError::Invalid("oxend_rpc must be set".to_string()));
        }
        if self.hivemind_sock.is_empty() {
            return Err(ConfigError::Invalid(
                "hivemind_sock must be set".to_string(),
            ));
        }
        if self.pubkey.0 == [0; 32] || self.privkey.0 == [0; 32] {
            return Err(ConfigError::Invalid(
                "pubkey/privkey keypair must be set (see `hived keygen`)".to_string(),
            ));
        }
        if self.filter_lifetime_secs == 0 {
            return Err(ConfigError::Invalid(
                "filter_lifetime_secs must be > 0".to_string(),
            ));
        }
        if self.max_pending_connects < 0 {
            return Err(ConfigError::Invalid(
                "max_pending_connects cannot be negative".to_string(),
            ));
        }
        Ok(())
    }

    pub fn filter_lifetime(&self) -> Duration {
        Duration::from_secs(self.filter_lifetime_secs)
    }

    pub fn notifier_wait(&self) -> Duration {
        Duration::from_millis(self.notifier_wait_ms)
    }

    pub fn subs_interval(&self) -> Duration {
        Duration::from_secs(self.subs_interval_secs)
    }
}

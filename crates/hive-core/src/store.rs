//! Durable subscription storage.
//!
//! A thin typed layer over SQLite with a small auto-returning
//! connection pool: connections are handed out LIFO (so excess ones age
//! out) and go back to the pool when the guard drops.  The schema owns
//! three tables: `subscriptions`, `sub_namespaces`, and `service_stats`.

use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use hive_crypto::{
    AccountId, EncKey, Ed25519Pk, Signature, Subaccount, SubaccountTag, Subauth, SubkeyTag,
};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use thiserror::Error;
use tracing::debug;

use crate::subscription::Subscription;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("corrupt stored value: {0}")]
    Corrupt(&'static str),
}

// ---------------------------------------------------------------------------
// Connection pool

/// How long an idle connection may sit in the pool before being closed.
const MAX_IDLE_TIME: Duration = Duration::from_secs(600);
/// Maximum number of idle connections kept around.
const MAX_IDLE: usize = 8;

static MEMORY_DB_SEQ: AtomicUsize = AtomicUsize::new(0);

enum PoolTarget {
    File(PathBuf),
    /// Shared-cache in-memory database; the anchor connection keeps it
    /// alive while the pool cycles others.
    Memory {
        uri: String,
        _anchor: Mutex<Connection>,
    },
}

struct SqlitePool {
    target: PoolTarget,
    idle: Mutex<Vec<(Connection, Instant)>>,
}

impl SqlitePool {
    fn open(&self) -> Result<Connection, StoreError> {
        let conn = match &self.target {
            PoolTarget::File(path) => Connection::open(path)?,
            PoolTarget::Memory { uri, .. } => Connection::open_with_flags(
                uri,
                OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI,
            )?,
        };
        conn.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        Ok(conn)
    }

    fn get(&self) -> Result<PooledConn<'_>, StoreError> {
        self.prune_idle();
        let reused = self.idle.lock().pop();
        let conn = match reused {
            Some((conn, _)) => conn,
            None => self.open()?,
        };
        Ok(PooledConn {
            pool: self,
            conn: Some(conn),
        })
    }

    fn release(&self, conn: Connection) {
        let mut idle = self.idle.lock();
        if idle.len() < MAX_IDLE {
            idle.push((conn, Instant::now()));
        }
    }

    fn prune_idle(&self) {
        let mut idle = self.idle.lock();
        let now = Instant::now();
        idle.retain(|(_, since)| now.duration_since(*since) < MAX_IDLE_TIME);
    }
}

/// A pooled connection; returns itself to the pool on drop.
struct PooledConn<'p> {
    pool: &'p SqlitePool,
    conn: Option<Connection>,
}

impl Deref for PooledConn<'_> {
    type Target = Connection;
    fn deref(&self) -> &Connection {
        self.conn.as_ref().expect("connection taken")
    }
}

impl DerefMut for PooledConn<'_> {
    fn deref_mut(&mut self) -> &mut Connection {
        self.conn.as_mut().expect("connection taken")
    }
}

impl Drop for PooledConn<'_> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.pool.release(conn);
        }
    }
}

// ---------------------------------------------------------------------------
// Schema

fn migrate(conn: &Connection) -> Result<(), StoreError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
        [],
    )?;
    let version: i32 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM schema_version", [], |row| {
            row.get(0)
        })?;
    if version < 1 {
        conn.execute_batch(
            r#"
            CREATE TABLE subscriptions (
                id INTEGER PRIMARY KEY,
                account BLOB NOT NULL,
                session_ed25519 BLOB,
                subaccount_tag BLOB,
                subaccount_sig BLOB,
                subkey_tag BLOB,
                signature BLOB NOT NULL,
                signature_ts INTEGER NOT NULL,
                want_data INTEGER NOT NULL,
                enc_key BLOB NOT NULL,
                service TEXT NOT NULL,
                svcid TEXT NOT NULL,
                svcdata BLOB,
                UNIQUE(account, service, svcid)
            );
            CREATE INDEX idx_subscriptions_ts ON subscriptions(signature_ts);

            CREATE TABLE sub_namespaces (
                subscription INTEGER NOT NULL
                    REFERENCES subscriptions(id) ON DELETE CASCADE,
                namespace INTEGER NOT NULL,
                UNIQUE(subscription, namespace)
            );

            CREATE TABLE service_stats (
                service TEXT NOT NULL,
                name TEXT NOT NULL,
                val_str TEXT,
                val_int INTEGER,
                PRIMARY KEY(service, name)
            );

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )?;
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Typed rows

/// A stored subscription as reloaded at startup.
pub struct StoredSubscription {
    pub account: AccountId,
    pub session_ed25519: Option<Ed25519Pk>,
    pub subscription: Subscription,
}

/// One matching row for an incoming notification.
#[derive(Debug, Clone)]
pub struct NotifyTarget {
    pub want_data: bool,
    pub enc_key: EncKey,
    pub service: String,
    pub svcid: String,
    pub svcdata: Option<Vec<u8>>,
}

fn fixed<const N: usize>(
    blob: Vec<u8>,
    what: &'static str,
) -> Result<[u8; N], StoreError> {
    blob.try_into().map_err(|_| StoreError::Corrupt(what))
}

fn auth_columns(auth: &Option<Subauth>) -> (Option<&[u8]>, Option<&[u8]>, Option<&[u8]>) {
    match auth {
        None => (None, None, None),
        Some(Subauth::Delegated(sub)) => {
            (Some(&sub.tag.0[..]), Some(&sub.sig.0[..]), None)
        }
        Some(Subauth::LegacySubkey(tag)) => (None, None, Some(&tag.0[..])),
    }
}

fn auth_from_columns(
    subaccount_tag: Option<Vec<u8>>,
    subaccount_sig: Option<Vec<u8>>,
    subkey_tag: Option<Vec<u8>>,
) -> Result<Option<Subauth>, StoreError> {
    if let Some(tag) = subaccount_tag {
        let sig = subaccount_sig.ok_or(StoreError::Corrupt("subaccount tag without sig"))?;
        return Ok(Some(Subauth::Delegated(Subaccount {
            tag: SubaccountTag(fixed(tag, "subaccount_tag")?),
            sig: Signature(fixed(sig, "subaccount_sig")?),
        })));
    }
    if let Some(tag) = subkey_tag {
        return Ok(Some(Subauth::LegacySubkey(SubkeyTag(fixed(
            tag,
            "subkey_tag",
        )?))));
    }
    Ok(None)
}

// ---------------------------------------------------------------------------
// Store

pub struct SubscriberStore {
    pool: SqlitePool,
}

impl SubscriberStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let pool = SqlitePool {
            target: PoolTarget::File(path.as_ref().to_path_buf()),
            idle: Mutex::new(Vec::new()),
        };
        migrate(&*pool.get()?)?;
        Ok(Self { pool })
    }

    /// In-memory store (shared across pool connections); for tests.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let uri = format!(
            "file:hivemem{}?mode=memory&cache=shared",
            MEMORY_DB_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let anchor =
            Connection::open_with_flags(&uri, OpenFlags::default() | OpenFlags::SQLITE_OPEN_URI)?;
        let pool = SqlitePool {
            target: PoolTarget::Memory {
                uri,
                _anchor: Mutex::new(anchor),
            },
            idle: Mutex::new(Vec::new()),
        };
        migrate(&*pool.get()?)?;
        Ok(Self { pool })
    }

    /// Deletes rows whose signature timestamp is at or before `cutoff`.
    pub fn cleanup_expired(&self, cutoff: i64) -> Result<usize, StoreError> {
        let conn = self.pool.get()?;
        let deleted =
            conn.execute("DELETE FROM subscriptions WHERE signature_ts <= ?1", [cutoff])?;
        if deleted > 0 {
            debug!(deleted, "removed expired subscriptions");
        }
        Ok(deleted)
    }

    pub fn subscription_count(&self) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM subscriptions", [], |row| row.get(0))?)
    }

    /// Loads every stored subscription (namespaces included).
    pub fn load_all(&self) -> Result<Vec<StoredSubscription>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT s.id, s.account, s.session_ed25519, s.subaccount_tag, s.subaccount_sig,
                   s.subkey_tag, s.signature, s.signature_ts, s.want_data, n.namespace
            FROM subscriptions s
            JOIN sub_namespaces n ON n.subscription = s.id
            ORDER BY s.id, n.namespace
            "#,
        )?;

        struct Partial {
            id: i64,
            stored: StoredSubscription,
        }
        let mut out: Vec<StoredSubscription> = Vec::new();
        let mut current: Option<Partial> = None;

        let mut rows = stmt.query([])?;
        while let Some(row) = rows.next()? {
            let id: i64 = row.get(0)?;
            let ns: i16 = row.get(9)?;
            match &mut current {
                Some(partial) if partial.id == id => {
                    partial.stored.subscription.namespaces.push(ns);
                    continue;
                }
                _ => {}
            }
            if let Some(done) = current.take() {
                out.push(done.stored);
            }

            let account = AccountId(fixed(row.get::<_, Vec<u8>>(1)?, "account")?);
            let session_ed25519 = row
                .get::<_, Option<Vec<u8>>>(2)?
                .map(|b| fixed(b, "session_ed25519").map(Ed25519Pk))
                .transpose()?;
            let auth = auth_from_columns(row.get(3)?, row.get(4)?, row.get(5)?)?;
            let sig = Signature(fixed(row.get::<_, Vec<u8>>(6)?, "signature")?);
            let sig_ts: i64 = row.get(7)?;
            let want_data: bool = row.get(8)?;

            current = Some(Partial {
                id,
                stored: StoredSubscription {
                    account,
                    session_ed25519,
                    subscription: Subscription::trusted(auth, vec![ns], want_data, sig_ts, sig),
                },
            });
        }
        if let Some(done) = current.take() {
            out.push(done.stored);
        }
        Ok(out)
    }

    /// Inserts or updates the row for `(account, service, svcid)`.
    /// Returns true if this created a brand new subscription row.
    /// Also bumps the `subscription`/`sub_renew` counters (both the
    /// global and the per-service one) in the same transaction.
    #[allow(clippy::too_many_arguments)]
    pub fn upsert_subscription(
        &self,
        account: &AccountId,
        session_ed25519: Option<&Ed25519Pk>,
        service: &str,
        svcid: &str,
        svcdata: Option<&[u8]>,
        enc_key: &EncKey,
        sub: &Subscription,
    ) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction()?;
        let (sa_tag, sa_sig, subkey_tag) = auth_columns(&sub.auth);

        let existing: Option<i64> = tx
            .query_row(
                "SELECT id FROM subscriptions WHERE account = ?1 AND service = ?2 AND svcid = ?3",
                params![&account.0[..], service, svcid],
                |row| row.get(0),
            )
            .optional()?;

        let (id, new_sub) = match existing {
            Some(id) => {
                tx.execute(
                    r#"
                    UPDATE subscriptions
                    SET session_ed25519 = ?2, subaccount_tag = ?3, subaccount_sig = ?4,
                        subkey_tag = ?5, signature = ?6, signature_ts = ?7, want_data = ?8,
                        enc_key = ?9, svcdata = ?10
                    WHERE id = ?1
                    "#,
                    params![
                        id,
                        session_ed25519.map(|k| &k.0[..]),
                        sa_tag,
                        sa_sig,
                        subkey_tag,
                        &sub.sig.0[..],
                        sub.sig_ts,
                        sub.want_data,
                        &enc_key.0[..],
                        svcdata,
                    ],
                )?;
                (id, false)
            }
            None => {
                tx.execute(
                    r#"
                    INSERT INTO subscriptions
                        (account, session_ed25519, subaccount_tag, subaccount_sig, subkey_tag,
                         signature, signature_ts, want_data, enc_key, service, svcid, svcdata)
                    VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                    "#,
                    params![
                        &account.0[..],
                        session_ed25519.map(|k| &k.0[..]),
                        sa_tag,
                        sa_sig,
                        subkey_tag,
                        &sub.sig.0[..],
                        sub.sig_ts,
                        sub.want_data,
                        &enc_key.0[..],
                        service,
                        svcid,
                        svcdata,
                    ],
                )?;
                (tx.last_insert_rowid(), true)
            }
        };

        let stored_ns: Vec<i16> = if new_sub {
            Vec::new()
        } else {
            let mut stmt = tx.prepare(
                "SELECT namespace FROM sub_namespaces WHERE subscription = ?1 ORDER BY namespace",
            )?;
            let ns = stmt
                .query_map([id], |row| row.get(0))?
                .collect::<Result<_, _>>()?;
            ns
        };
        if stored_ns != sub.namespaces {
            tx.execute("DELETE FROM sub_namespaces WHERE subscription = ?1", [id])?;
            for ns in &sub.namespaces {
                tx.execute(
                    "INSERT INTO sub_namespaces (subscription, namespace) VALUES (?1, ?2)",
                    params![id, ns],
                )?;
            }
        }

        let counter = if new_sub { "subscription" } else { "sub_renew" };
        increment_stat_tx(&tx, "", counter, 1)?;
        increment_stat_tx(&tx, service, counter, 1)?;

        tx.commit()?;
        Ok(new_sub)
    }

    /// Deletes the `(account, service, svcid)` row; true if it existed.
    pub fn remove_subscription(
        &self,
        account: &AccountId,
        service: &str,
        svcid: &str,
    ) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let deleted = conn.execute(
            "DELETE FROM subscriptions WHERE account = ?1 AND service = ?2 AND svcid = ?3",
            params![&account.0[..], service, svcid],
        )?;
        Ok(deleted > 0)
    }

    /// The rows to notify for a message to `account` in `namespace`.
    pub fn matching_subscriptions(
        &self,
        account: &AccountId,
        namespace: i16,
    ) -> Result<Vec<NotifyTarget>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT want_data, enc_key, service, svcid, svcdata FROM subscriptions
            WHERE account = ?1
                AND EXISTS(SELECT 1 FROM sub_namespaces
                           WHERE subscription = id AND namespace = ?2)
            "#,
        )?;
        let rows = stmt.query_map(params![&account.0[..], namespace], |row| {
            Ok((
                row.get::<_, bool>(0)?,
                row.get::<_, Vec<u8>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<Vec<u8>>>(4)?,
            ))
        })?;
        let mut out = Vec::new();
        for row in rows {
            let (want_data, enc_key, service, svcid, svcdata) = row?;
            out.push(NotifyTarget {
                want_data,
                enc_key: EncKey(fixed(enc_key, "enc_key")?),
                service,
                svcid,
                svcdata,
            });
        }
        Ok(out)
    }

    // -- service stats ------------------------------------------------------

    pub fn set_stat_str(&self, service: &str, name: &str, val: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO service_stats (service, name, val_str) VALUES (?1, ?2, ?3)
            ON CONFLICT (service, name) DO UPDATE
                SET val_str = excluded.val_str, val_int = NULL
            "#,
            params![service, name, val],
        )?;
        Ok(())
    }

    pub fn set_stat_int(&self, service: &str, name: &str, val: i64) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO service_stats (service, name, val_int) VALUES (?1, ?2, ?3)
            ON CONFLICT (service, name) DO UPDATE
                SET val_str = NULL, val_int = excluded.val_int
            "#,
            params![service, name, val],
        )?;
        Ok(())
    }

    pub fn increment_stat(&self, service: &str, name: &str, by: i64) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        increment_stat_tx(&conn, service, name, by)
    }

    /// All `(service, name, val_str, val_int)` stat rows.
    #[allow(clippy::type_complexity)]
    pub fn stats_rows(
        &self,
    ) -> Result<Vec<(String, String, Option<String>, Option<i64>)>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT service, name, val_str, val_int FROM service_stats")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
        })?;
        Ok(rows.collect::<Result<_, _>>()?)
    }

    /// Subscription row counts per service.
    pub fn subscription_counts(&self) -> Result<Vec<(String, i64)>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt =
            conn.prepare("SELECT service, COUNT(*) FROM subscriptions GROUP BY service")?;
        let rows = stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?;
        Ok(rows.collect::<Result<_, _>>()?)
    }
}

fn increment_stat_tx(
    conn: &Connection,
    service: &str,
    name: &str,
    by: i64,
) -> Result<(), StoreError> {
    conn.execute(
        r#"
        INSERT INTO service_stats (service, name, val_int) VALUES (?1, ?2, ?3)
        ON CONFLICT (service, name) DO UPDATE
            SET val_str = NULL,
                val_int = COALESCE(service_stats.val_int, 0) + excluded.val_int
        "#,
        params![service, name, by],
    )?;
    Ok(())
}

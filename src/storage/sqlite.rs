//! SQLite implementation of [`NodeStore`]
//!
//! All node state lives in a single `nodes` table. Candidate selection is
//! expressed as set-based queries; a take runs its query and its claim
//! update inside one `BEGIN IMMEDIATE` transaction so the write lock is held
//! from the first read, and no other writer can observe the pre-claim state.
//!
//! Timestamps are stored as Unix milliseconds. Connections come from a
//! `deadpool-sqlite` pool; every call runs on the blocking thread pool
//! through `Object::interact`.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_sqlite::{Hook, HookError, Manager, Pool, Runtime};
use rusqlite::types::{FromSql, FromSqlResult, ToSqlOutput, ValueRef};
use rusqlite::{params, Connection, OptionalExtension, ToSql, TransactionBehavior};
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::NodeStore;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{Endpoint, HandshakeError, HandshakeTry, NodeAddr, NodeId};
use crate::scheduler::{CrawlCriteria, HandshakeCriteria};

/// Ids per `IN (...)` list, well below SQLite's parameter limit
const CHUNK_SIZE: usize = 500;

/// Rows buffered between the blocking reader and the async consumer
const ENUMERATE_BUFFER: usize = 256;

// language=SQL
const SQL_CONFIGURE_CONNECTION: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA foreign_keys = ON;
"#;

// language=SQL
const SQL_CREATE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY,

    ip TEXT,
    port_disc INTEGER,
    port_rlpx INTEGER,
    ip_v6 TEXT,
    ip_v6_port_disc INTEGER,
    ip_v6_port_rlpx INTEGER,
    addr_updated INTEGER NOT NULL,

    ping_try INTEGER NOT NULL DEFAULT 0,

    compat_fork INTEGER,
    compat_fork_updated INTEGER,

    client_id TEXT,
    network_id INTEGER,
    handshake_err TEXT,
    handshake_try INTEGER NOT NULL DEFAULT 0,
    handshake_updated INTEGER,
    handshake_claimed INTEGER,

    neighbor_keys TEXT,

    taken_last INTEGER
);

CREATE INDEX IF NOT EXISTS idx_nodes_taken_last ON nodes (taken_last);
CREATE INDEX IF NOT EXISTS idx_nodes_ip ON nodes (ip);
CREATE INDEX IF NOT EXISTS idx_nodes_ip_v6 ON nodes (ip_v6);
CREATE INDEX IF NOT EXISTS idx_nodes_compat_fork ON nodes (compat_fork);
CREATE INDEX IF NOT EXISTS idx_nodes_handshake_updated ON nodes (handshake_updated);

CREATE TABLE IF NOT EXISTS handshake_errors (
    id TEXT NOT NULL,
    err TEXT NOT NULL,
    updated INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_handshake_errors_id ON handshake_errors (id, updated);
"#;

const SQL_UPSERT_NODE_ADDR: &str = r#"
INSERT INTO nodes (
    id,
    ip, port_disc, port_rlpx,
    ip_v6, ip_v6_port_disc, ip_v6_port_rlpx,
    addr_updated
) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
ON CONFLICT(id) DO UPDATE SET
    ip = excluded.ip,
    port_disc = excluded.port_disc,
    port_rlpx = excluded.port_rlpx,
    ip_v6 = excluded.ip_v6,
    ip_v6_port_disc = excluded.ip_v6_port_disc,
    ip_v6_port_rlpx = excluded.ip_v6_port_rlpx,
    addr_updated = excluded.addr_updated
"#;

const SQL_FIND_NODE_ADDR: &str = r#"
SELECT ip, port_disc, port_rlpx, ip_v6, ip_v6_port_disc, ip_v6_port_rlpx
FROM nodes
WHERE id = ?1
"#;

const SQL_UPDATE_CLIENT_ID: &str = r#"
UPDATE nodes SET
    client_id = ?1,
    handshake_err = NULL,
    handshake_try = 0,
    handshake_updated = ?2,
    handshake_claimed = NULL
WHERE id = ?3
"#;

const SQL_UPDATE_HANDSHAKE_ERROR: &str = r#"
UPDATE nodes SET
    handshake_err = ?1,
    handshake_try = handshake_try + 1,
    handshake_updated = ?2,
    handshake_claimed = NULL
WHERE id = ?3
"#;

// Only nodes that exist get a history row
const SQL_INSERT_HANDSHAKE_ERROR: &str = r#"
INSERT INTO handshake_errors (id, err, updated)
SELECT id, ?2, ?3 FROM nodes WHERE id = ?1
"#;

const SQL_FIND_HANDSHAKE_LAST_ERRORS: &str = r#"
SELECT err, updated FROM handshake_errors
WHERE id = ?1
ORDER BY updated DESC, rowid DESC
LIMIT ?2
"#;

const SQL_FIND_HANDSHAKE_LAST_TRY: &str = r#"
SELECT handshake_err IS NOT NULL, handshake_try, handshake_updated, handshake_claimed IS NOT NULL
FROM nodes
WHERE id = ?1
"#;

// ?1 = ok cutoff, ?2 = err cutoff, ?3 = max tries, ?4 = transient error, ?5 = limit
const SQL_FIND_HANDSHAKE_CANDIDATES: &str = r#"
SELECT id FROM nodes
WHERE ((handshake_claimed IS NOT NULL AND handshake_claimed < ?2)
        OR (handshake_claimed IS NULL
            AND ((handshake_updated IS NULL)
                OR (handshake_updated < ?1 AND handshake_err IS NULL)
                OR (handshake_updated < ?2 AND handshake_err IS NOT NULL))))
    AND (compat_fork IS NULL OR compat_fork = 1)
    AND (handshake_try <= ?3 OR handshake_err = ?4)
ORDER BY handshake_updated, id
LIMIT ?5
"#;

const SQL_MARK_TAKEN_HANDSHAKE_CANDIDATES: &str =
    "UPDATE nodes SET handshake_claimed = ?1, handshake_updated = ?1";

// ?1 = taken cutoff, ?2 = max ping tries, ?3 = max handshake tries,
// ?4 = transient handshake error, ?5 = limit
const SQL_FIND_CANDIDATES: &str = r#"
SELECT id FROM nodes
WHERE (taken_last IS NULL OR taken_last < ?1)
    AND (compat_fork IS NULL OR compat_fork = 1)
    AND ping_try <= ?2
    AND (handshake_try <= ?3 OR handshake_err = ?4)
ORDER BY taken_last, id
LIMIT ?5
"#;

const SQL_MARK_TAKEN_NODES: &str = "UPDATE nodes SET taken_last = ?1";

// ?1 = optional ping failure ceiling
const SQL_COUNT_NODES: &str = "SELECT COUNT(*) FROM nodes WHERE (?1 IS NULL OR ping_try <= ?1)";

const SQL_COUNT_COMPATIBLE_NODES: &str = r#"
SELECT COUNT(*) FROM nodes
WHERE (compat_fork IS NULL OR compat_fork = 1)
    AND (?1 IS NULL OR ping_try <= ?1)
"#;

const SQL_COUNT_IPS: &str =
    "SELECT COUNT(DISTINCT ip) FROM nodes WHERE (?1 IS NULL OR ping_try <= ?1)";

const SQL_ENUMERATE_CLIENT_IDS: &str =
    "SELECT client_id FROM nodes WHERE (?1 IS NULL OR ping_try <= ?1)";

// ============================================================================
// Column Conversions
// ============================================================================

impl ToSql for NodeId {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for NodeId {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        String::column_result(value).map(NodeId::new)
    }
}

fn millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

fn from_millis(op: &'static str, value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| Error::malformed(op, format!("timestamp {value} out of range")))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

/// Per-connection settings, applied once when the pool opens a connection
fn configure(conn: &Connection, busy_timeout: Duration) -> rusqlite::Result<()> {
    conn.busy_timeout(busy_timeout)?;
    conn.execute_batch(SQL_CONFIGURE_CONNECTION)
}

/// Address columns as stored: absent IPs and zero ports are NULL
struct AddrColumns {
    ip: Option<String>,
    port_disc: Option<u16>,
    port_rlpx: Option<u16>,
    ip_v6: Option<String>,
    ip_v6_port_disc: Option<u16>,
    ip_v6_port_rlpx: Option<u16>,
}

impl AddrColumns {
    fn from_addr(addr: &NodeAddr) -> Self {
        Self {
            ip: addr.ipv4.ip.map(|ip| ip.to_string()),
            port_disc: addr.ipv4.disc_port(),
            port_rlpx: addr.ipv4.rlpx_port(),
            ip_v6: addr.ipv6.ip.map(|ip| ip.to_string()),
            ip_v6_port_disc: addr.ipv6.disc_port(),
            ip_v6_port_rlpx: addr.ipv6.rlpx_port(),
        }
    }

    fn into_addr(self, op: &'static str) -> Result<NodeAddr> {
        let ipv4 = self
            .ip
            .map(|ip| {
                ip.parse()
                    .map_err(|_| Error::malformed(op, format!("unparsable IPv4 '{ip}'")))
            })
            .transpose()?;
        let ipv6 = self
            .ip_v6
            .map(|ip| {
                ip.parse()
                    .map_err(|_| Error::malformed(op, format!("unparsable IPv6 '{ip}'")))
            })
            .transpose()?;

        let addr = NodeAddr {
            ipv4: Endpoint {
                ip: ipv4,
                port_disc: self.port_disc.unwrap_or(0),
                port_rlpx: self.port_rlpx.unwrap_or(0),
            },
            ipv6: Endpoint {
                ip: ipv6,
                port_disc: self.ip_v6_port_disc.unwrap_or(0),
                port_rlpx: self.ip_v6_port_rlpx.unwrap_or(0),
            },
        };
        Ok(addr.normalized())
    }
}

// ============================================================================
// Candidate Queries
// ============================================================================

fn query_ids(
    conn: &Connection,
    op: &'static str,
    sql: &str,
    params: &[&dyn ToSql],
) -> Result<Vec<NodeId>> {
    let mut stmt = conn.prepare_cached(sql).map_err(|e| Error::database(op, e))?;
    let rows = stmt
        .query_map(params, |row| row.get::<_, NodeId>(0))
        .map_err(|e| Error::database(op, e))?;
    let ids = rows
        .collect::<rusqlite::Result<Vec<_>>>()
        .map_err(|e| Error::database(op, e))?;
    Ok(ids)
}

fn exec(conn: &Connection, op: &'static str, sql: &str, params: &[&dyn ToSql]) -> Result<()> {
    conn.execute(sql, params)
        .map(|_| ())
        .map_err(|e| Error::database(op, e))
}

fn find_handshake_candidates(
    conn: &Connection,
    op: &'static str,
    criteria: &HandshakeCriteria,
) -> Result<Vec<NodeId>> {
    let cutoffs = criteria.cutoffs(Utc::now());
    query_ids(
        conn,
        op,
        SQL_FIND_HANDSHAKE_CANDIDATES,
        params![
            millis(cutoffs.ok_before),
            millis(cutoffs.err_before),
            criteria.max_tries,
            criteria.transient_err,
            limit_param(criteria.limit),
        ],
    )
}

fn find_candidates(
    conn: &Connection,
    op: &'static str,
    criteria: &CrawlCriteria,
) -> Result<Vec<NodeId>> {
    let taken_before = criteria.taken_before(Utc::now());
    query_ids(
        conn,
        op,
        SQL_FIND_CANDIDATES,
        params![
            millis(taken_before),
            criteria.max_ping_tries,
            criteria.max_handshake_tries,
            criteria.transient_handshake_err,
            limit_param(criteria.limit),
        ],
    )
}

/// Run `update ... WHERE id IN (...)` over `ids`, binding `now` as `?1`
fn mark_ids(conn: &Connection, op: &'static str, update: &str, ids: &[NodeId]) -> Result<()> {
    let now = millis(Utc::now());

    for chunk in ids.chunks(CHUNK_SIZE) {
        let placeholders: String = (0..chunk.len())
            .map(|i| format!("?{}", i + 2))
            .collect::<Vec<_>>()
            .join(",");
        let query = format!("{update} WHERE id IN ({placeholders})");

        let mut params: Vec<&dyn ToSql> = Vec::with_capacity(chunk.len() + 1);
        params.push(&now);
        params.extend(chunk.iter().map(|id| id as &dyn ToSql));

        conn.execute(&query, params.as_slice())
            .map_err(|e| Error::database(op, e))?;
    }
    Ok(())
}

// ============================================================================
// Cancellation
// ============================================================================

/// Abort flag shared between an async caller and its blocking transaction
#[derive(Clone)]
struct Abort {
    op: &'static str,
    flag: Arc<AtomicBool>,
}

impl Abort {
    fn new(op: &'static str) -> Self {
        Self {
            op,
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    fn check(&self) -> Result<()> {
        if self.flag.load(Ordering::SeqCst) {
            return Err(Error::Cancelled { op: self.op });
        }
        Ok(())
    }

    /// Raises the flag when the caller's future goes away
    fn on_drop(&self) -> AbortOnDrop {
        AbortOnDrop(Arc::clone(&self.flag))
    }
}

struct AbortOnDrop(Arc<AtomicBool>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// Store
// ============================================================================

/// Node store persisted in a SQLite database file
pub struct SqliteNodeStore {
    pool: Pool,
    path: PathBuf,
}

impl SqliteNodeStore {
    /// Open (creating if needed) the database described by `config`
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let busy_timeout = config.busy_timeout();
        let conn = Connection::open(&config.path).map_err(|e| Error::database("CreateSchema", e))?;
        configure(&conn, busy_timeout).map_err(|e| Error::database("CreateSchema", e))?;
        conn.execute_batch(SQL_CREATE_SCHEMA)
            .map_err(|e| Error::database("CreateSchema", e))?;
        drop(conn);

        let manager = Manager::from_config(
            &deadpool_sqlite::Config::new(&config.path),
            Runtime::Tokio1,
        );
        let pool = Pool::builder(manager)
            .max_size(config.max_connections)
            .runtime(Runtime::Tokio1)
            .post_create(Hook::async_fn(move |conn, _| {
                Box::pin(async move {
                    conn.interact(move |conn| configure(conn, busy_timeout))
                        .await
                        .map_err(|e| HookError::Message(e.to_string().into()))?
                        .map_err(HookError::Backend)
                })
            }))
            .build()?;

        info!(
            path = %config.path.display(),
            max_connections = config.max_connections,
            "SQLite node store initialized"
        );
        Ok(Self {
            pool,
            path: config.path.clone(),
        })
    }

    /// Open a database at `path` with default settings
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        Self::open(&StoreConfig {
            path: path.as_ref().to_path_buf(),
            ..StoreConfig::default()
        })
    }

    /// Database file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` on a pooled connection on the blocking thread pool
    async fn run<T, F>(&self, op: &'static str, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        let conn = self.pool.get().await.map_err(|e| Error::pool(op, e))?;
        conn.interact(f)
            .await
            .map_err(|e| Error::interact(op, e))?
    }

    /// Run `claim` inside an immediate transaction
    ///
    /// Dropping the returned future raises the abort flag. The transaction
    /// checks it after the find and right before commit and rolls back if
    /// it is set. A drop after that last check, while `COMMIT` runs, is not
    /// seen: the claim commits and its ids stay claimed with no worker
    /// until the cooldown expires.
    async fn run_claim<F>(&self, op: &'static str, claim: F) -> Result<Vec<NodeId>>
    where
        F: FnOnce(&Connection, &Abort) -> Result<Vec<NodeId>> + Send + 'static,
    {
        let abort = Abort::new(op);
        let _guard = abort.on_drop();

        let ids = self
            .run(op, move |conn| {
                let tx = conn
                    .transaction_with_behavior(TransactionBehavior::Immediate)
                    .map_err(|e| Error::database(op, e))?;
                let ids = claim(&tx, &abort)?;
                abort.check()?;
                tx.commit().map_err(|e| Error::database(op, e))?;
                Ok(ids)
            })
            .await?;

        debug!(op, count = ids.len(), "Claimed candidates");
        Ok(ids)
    }

    async fn count(
        &self,
        op: &'static str,
        sql: &'static str,
        max_ping_tries: Option<u32>,
    ) -> Result<u64> {
        self.run(op, move |conn| {
            conn.query_row(sql, params![max_ping_tries], |row| row.get::<_, i64>(0))
                .map(|count| count.max(0) as u64)
                .map_err(|e| Error::database(op, e))
        })
        .await
    }
}

#[async_trait]
impl NodeStore for SqliteNodeStore {
    async fn upsert_node_addr(&self, id: &NodeId, addr: NodeAddr) -> Result<()> {
        let id = id.clone();
        let columns = AddrColumns::from_addr(&addr);
        let updated = millis(Utc::now());

        self.run("UpsertNodeAddr", move |conn| {
            conn.execute(
                SQL_UPSERT_NODE_ADDR,
                params![
                    id,
                    columns.ip,
                    columns.port_disc,
                    columns.port_rlpx,
                    columns.ip_v6,
                    columns.ip_v6_port_disc,
                    columns.ip_v6_port_rlpx,
                    updated,
                ],
            )
            .map(|_| ())
            .map_err(|e| Error::database("UpsertNodeAddr", e))
        })
        .await
    }

    async fn find_node_addr(&self, id: &NodeId) -> Result<Option<NodeAddr>> {
        const OP: &str = "FindNodeAddr";
        let id = id.clone();

        self.run(OP, move |conn| {
            let columns = conn
                .query_row(SQL_FIND_NODE_ADDR, params![id], |row| {
                    Ok(AddrColumns {
                        ip: row.get(0)?,
                        port_disc: row.get(1)?,
                        port_rlpx: row.get(2)?,
                        ip_v6: row.get(3)?,
                        ip_v6_port_disc: row.get(4)?,
                        ip_v6_port_rlpx: row.get(5)?,
                    })
                })
                .optional()
                .map_err(|e| Error::database(OP, e))?;

            columns.map(|c| c.into_addr(OP)).transpose()
        })
        .await
    }

    async fn reset_ping_error(&self, id: &NodeId) -> Result<()> {
        const OP: &str = "ResetPingError";
        let id = id.clone();
        self.run(OP, move |conn| {
            exec(conn, OP, "UPDATE nodes SET ping_try = 0 WHERE id = ?1", params![id])
        })
        .await
    }

    async fn update_ping_error(&self, id: &NodeId) -> Result<()> {
        const OP: &str = "UpdatePingError";
        let id = id.clone();
        self.run(OP, move |conn| {
            exec(
                conn,
                OP,
                "UPDATE nodes SET ping_try = ping_try + 1 WHERE id = ?1",
                params![id],
            )
        })
        .await
    }

    async fn count_ping_errors(&self, id: &NodeId) -> Result<Option<u32>> {
        const OP: &str = "CountPingErrors";
        let id = id.clone();

        self.run(OP, move |conn| {
            conn.query_row(
                "SELECT ping_try FROM nodes WHERE id = ?1",
                params![id],
                |row| row.get::<_, u32>(0),
            )
            .optional()
            .map_err(|e| Error::database(OP, e))
        })
        .await
    }

    async fn update_client_id(&self, id: &NodeId, client_id: &str) -> Result<()> {
        const OP: &str = "UpdateClientID";
        let id = id.clone();
        let client_id = client_id.to_string();
        let updated = millis(Utc::now());
        self.run(OP, move |conn| {
            exec(conn, OP, SQL_UPDATE_CLIENT_ID, params![client_id, updated, id])
        })
        .await
    }

    async fn update_network_id(&self, id: &NodeId, network_id: u64) -> Result<()> {
        const OP: &str = "UpdateNetworkID";
        let id = id.clone();
        let network_id = i64::try_from(network_id)
            .map_err(|_| Error::malformed(OP, format!("network id {network_id} out of range")))?;
        self.run(OP, move |conn| {
            exec(
                conn,
                OP,
                "UPDATE nodes SET network_id = ?1 WHERE id = ?2",
                params![network_id, id],
            )
        })
        .await
    }

    async fn find_network_id(&self, id: &NodeId) -> Result<Option<u64>> {
        const OP: &str = "FindNetworkID";
        let id = id.clone();

        self.run(OP, move |conn| {
            let network_id = conn
                .query_row(
                    "SELECT network_id FROM nodes WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, Option<i64>>(0),
                )
                .optional()
                .map_err(|e| Error::database(OP, e))?
                .flatten();

            network_id
                .map(|v| {
                    u64::try_from(v)
                        .map_err(|_| Error::malformed(OP, format!("negative network id {v}")))
                })
                .transpose()
        })
        .await
    }

    async fn update_handshake_error(&self, id: &NodeId, handshake_err: &str) -> Result<()> {
        const OP: &str = "UpdateHandshakeError";
        let id = id.clone();
        let handshake_err = handshake_err.to_string();
        let updated = millis(Utc::now());
        self.run(OP, move |conn| {
            let tx = conn.transaction().map_err(|e| Error::database(OP, e))?;
            exec(&tx, OP, SQL_UPDATE_HANDSHAKE_ERROR, params![handshake_err, updated, id])?;
            exec(&tx, OP, SQL_INSERT_HANDSHAKE_ERROR, params![id, handshake_err, updated])?;
            tx.commit().map_err(|e| Error::database(OP, e))
        })
        .await
    }

    async fn delete_handshake_errors(&self, id: &NodeId) -> Result<()> {
        const OP: &str = "DeleteHandshakeErrors";
        let id = id.clone();
        self.run(OP, move |conn| {
            let tx = conn.transaction().map_err(|e| Error::database(OP, e))?;
            exec(
                &tx,
                OP,
                "UPDATE nodes SET handshake_err = NULL, handshake_try = 0 WHERE id = ?1",
                params![id],
            )?;
            exec(&tx, OP, "DELETE FROM handshake_errors WHERE id = ?1", params![id])?;
            tx.commit().map_err(|e| Error::database(OP, e))
        })
        .await
    }

    async fn find_handshake_last_errors(
        &self,
        id: &NodeId,
        limit: usize,
    ) -> Result<Vec<HandshakeError>> {
        const OP: &str = "FindHandshakeLastErrors";
        let id = id.clone();

        self.run(OP, move |conn| {
            let mut stmt = conn
                .prepare_cached(SQL_FIND_HANDSHAKE_LAST_ERRORS)
                .map_err(|e| Error::database(OP, e))?;
            let rows = stmt
                .query_map(params![id, limit_param(limit)], |row| {
                    Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
                })
                .map_err(|e| Error::database(OP, e))?;

            let mut errors = Vec::new();
            for row in rows {
                let (error, updated) = row.map_err(|e| Error::database(OP, e))?;
                errors.push(HandshakeError {
                    error,
                    time: from_millis(OP, updated)?,
                });
            }
            Ok(errors)
        })
        .await
    }

    async fn find_handshake_last_try(&self, id: &NodeId) -> Result<Option<HandshakeTry>> {
        const OP: &str = "FindHandshakeLastTry";
        let id = id.clone();

        self.run(OP, move |conn| {
            let row = conn
                .query_row(SQL_FIND_HANDSHAKE_LAST_TRY, params![id], |row| {
                    Ok((
                        row.get::<_, bool>(0)?,
                        row.get::<_, u32>(1)?,
                        row.get::<_, Option<i64>>(2)?,
                        row.get::<_, bool>(3)?,
                    ))
                })
                .optional()
                .map_err(|e| Error::database(OP, e))?;

            // a handshake was never attempted while the update time is NULL
            let Some((has_error, tries, Some(updated), claimed)) = row else {
                return Ok(None);
            };

            Ok(Some(HandshakeTry {
                has_error,
                tries,
                updated: from_millis(OP, updated)?,
                claimed,
            }))
        })
        .await
    }

    async fn find_handshake_candidates(
        &self,
        criteria: &HandshakeCriteria,
    ) -> Result<Vec<NodeId>> {
        const OP: &str = "FindHandshakeCandidates";
        let criteria = criteria.clone();
        self.run(OP, move |conn| find_handshake_candidates(conn, OP, &criteria))
            .await
    }

    async fn mark_taken_handshake_candidates(&self, ids: &[NodeId]) -> Result<()> {
        const OP: &str = "MarkTakenHandshakeCandidates";
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.run(OP, move |conn| {
            mark_ids(conn, OP, SQL_MARK_TAKEN_HANDSHAKE_CANDIDATES, &ids)
        })
        .await
    }

    async fn take_handshake_candidates(
        &self,
        criteria: &HandshakeCriteria,
    ) -> Result<Vec<NodeId>> {
        const OP: &str = "TakeHandshakeCandidates";
        let criteria = criteria.clone();
        self.run_claim(OP, move |tx, abort| {
            let ids = find_handshake_candidates(tx, OP, &criteria)?;
            abort.check()?;
            mark_ids(tx, OP, SQL_MARK_TAKEN_HANDSHAKE_CANDIDATES, &ids)?;
            Ok(ids)
        })
        .await
    }

    async fn update_fork_compatibility(&self, id: &NodeId, is_compatible: bool) -> Result<()> {
        const OP: &str = "UpdateForkCompatibility";
        let id = id.clone();
        let updated = millis(Utc::now());
        self.run(OP, move |conn| {
            exec(
                conn,
                OP,
                "UPDATE nodes SET compat_fork = ?1, compat_fork_updated = ?2 WHERE id = ?3",
                params![is_compatible, updated, id],
            )
        })
        .await
    }

    async fn update_neighbor_bucket_keys(&self, id: &NodeId, keys: &[String]) -> Result<()> {
        const OP: &str = "UpdateNeighborBucketKeys";
        let id = id.clone();
        let keys = serde_json::to_string(keys)?;
        self.run(OP, move |conn| {
            exec(
                conn,
                OP,
                "UPDATE nodes SET neighbor_keys = ?1 WHERE id = ?2",
                params![keys, id],
            )
        })
        .await
    }

    async fn find_neighbor_bucket_keys(&self, id: &NodeId) -> Result<Option<Vec<String>>> {
        const OP: &str = "FindNeighborBucketKeys";
        let id = id.clone();

        self.run(OP, move |conn| {
            let keys: Option<String> = conn
                .query_row(
                    "SELECT neighbor_keys FROM nodes WHERE id = ?1",
                    params![id],
                    |row| row.get::<_, Option<String>>(0),
                )
                .optional()
                .map_err(|e| Error::database(OP, e))?
                .flatten();

            keys.map(|json| {
                serde_json::from_str(&json)
                    .map_err(|e| Error::malformed(OP, format!("neighbor keys: {e}")))
            })
            .transpose()
        })
        .await
    }

    async fn find_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>> {
        const OP: &str = "FindCandidates";
        let criteria = criteria.clone();
        self.run(OP, move |conn| find_candidates(conn, OP, &criteria))
            .await
    }

    async fn mark_taken_nodes(&self, ids: &[NodeId]) -> Result<()> {
        const OP: &str = "MarkTakenNodes";
        if ids.is_empty() {
            return Ok(());
        }
        let ids = ids.to_vec();
        self.run(OP, move |conn| mark_ids(conn, OP, SQL_MARK_TAKEN_NODES, &ids))
            .await
    }

    async fn take_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>> {
        const OP: &str = "TakeCandidates";
        let criteria = criteria.clone();
        self.run_claim(OP, move |tx, abort| {
            let ids = find_candidates(tx, OP, &criteria)?;
            abort.check()?;
            mark_ids(tx, OP, SQL_MARK_TAKEN_NODES, &ids)?;
            Ok(ids)
        })
        .await
    }

    async fn count_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        self.count("CountNodes", SQL_COUNT_NODES, max_ping_tries).await
    }

    async fn count_compatible_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        self.count("CountCompatibleNodes", SQL_COUNT_COMPATIBLE_NODES, max_ping_tries)
            .await
    }

    async fn count_ips(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        self.count("CountIPs", SQL_COUNT_IPS, max_ping_tries).await
    }

    async fn enumerate_client_ids(
        &self,
        max_ping_tries: Option<u32>,
        consumer: &mut (dyn FnMut(Option<String>) + Send),
    ) -> Result<()> {
        const OP: &str = "EnumerateClientIDs";
        let (tx, mut rx) = mpsc::channel::<Option<String>>(ENUMERATE_BUFFER);
        let conn = self.pool.get().await.map_err(|e| Error::pool(OP, e))?;

        let reader = conn.interact(move |conn| -> Result<()> {
            let mut stmt = conn
                .prepare(SQL_ENUMERATE_CLIENT_IDS)
                .map_err(|e| Error::database(OP, e))?;
            let mut rows = stmt
                .query(params![max_ping_tries])
                .map_err(|e| Error::database(OP, e))?;

            while let Some(row) = rows.next().map_err(|e| Error::database(OP, e))? {
                let client_id: Option<String> = row.get(0).map_err(|e| Error::database(OP, e))?;
                if tx.blocking_send(client_id).is_err() {
                    // consumer side went away
                    break;
                }
            }
            Ok(())
        });

        let consume = async {
            while let Some(client_id) = rx.recv().await {
                consumer(client_id);
            }
        };

        let (read, ()) = tokio::join!(reader, consume);
        read.map_err(|e| Error::interact(OP, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use tempfile::TempDir;

    fn open() -> (TempDir, SqliteNodeStore) {
        let dir = TempDir::new().unwrap();
        let store = SqliteNodeStore::open_path(dir.path().join("nodes.db")).unwrap();
        (dir, store)
    }

    /// Second connection to the same file, outside the pool
    fn raw(store: &SqliteNodeStore) -> Connection {
        Connection::open(store.path()).unwrap()
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/dir/nodes.db");

        let first = SqliteNodeStore::open_path(&path).unwrap();
        first
            .upsert_node_addr(&NodeId::from("a"), NodeAddr::default())
            .await
            .unwrap();
        drop(first);

        let second = SqliteNodeStore::open_path(&path).unwrap();
        assert_eq!(second.path(), path.as_path());
        assert_eq!(second.count_nodes(None).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_unparsable_ip_is_hard_error() {
        let (_dir, store) = open();
        let id = NodeId::from("broken");
        store
            .upsert_node_addr(&id, NodeAddr::v4(Ipv4Addr::LOCALHOST, 1, 2))
            .await
            .unwrap();

        let conn = raw(&store);
        conn.execute("UPDATE nodes SET ip = 'not-an-ip' WHERE id = 'broken'", [])
            .unwrap();
        drop(conn);

        let err = store.find_node_addr(&id).await.unwrap_err();
        assert!(matches!(err, Error::MalformedData { op: "FindNodeAddr", .. }));
        assert!(!store.is_conflict_error(&err));
    }

    #[tokio::test]
    async fn test_malformed_neighbor_keys_is_hard_error() {
        let (_dir, store) = open();
        let id = NodeId::from("broken");
        store.upsert_node_addr(&id, NodeAddr::default()).await.unwrap();

        let conn = raw(&store);
        conn.execute("UPDATE nodes SET neighbor_keys = 'a,b' WHERE id = 'broken'", [])
            .unwrap();
        drop(conn);

        let err = store.find_neighbor_bucket_keys(&id).await.unwrap_err();
        assert!(matches!(err, Error::MalformedData { .. }));
    }

    #[tokio::test]
    async fn test_zero_ports_stored_as_null() {
        let (_dir, store) = open();
        let id = NodeId::from("node");
        store
            .upsert_node_addr(&id, NodeAddr::v4(Ipv4Addr::new(1, 1, 1, 1), 0, 30303))
            .await
            .unwrap();

        let conn = raw(&store);
        let (port_disc, port_rlpx, ip_v6): (Option<i64>, Option<i64>, Option<String>) = conn
            .query_row(
                "SELECT port_disc, port_rlpx, ip_v6 FROM nodes WHERE id = 'node'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .unwrap();
        assert_eq!(port_disc, None);
        assert_eq!(port_rlpx, Some(30303));
        assert_eq!(ip_v6, None);
    }

    #[tokio::test]
    async fn test_mark_handles_more_ids_than_one_chunk() {
        let (_dir, store) = open();
        let ids: Vec<NodeId> = (0..CHUNK_SIZE + 10)
            .map(|i| NodeId::new(format!("node-{i:04}")))
            .collect();
        for id in &ids {
            store.upsert_node_addr(id, NodeAddr::default()).await.unwrap();
        }

        store.mark_taken_nodes(&ids).await.unwrap();

        let conn = raw(&store);
        let untaken: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes WHERE taken_last IS NULL", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(untaken, 0);
    }

    #[tokio::test]
    async fn test_pool_connections_are_configured() {
        let (_dir, store) = open();
        let (journal_mode, synchronous) = store
            .run("Pragmas", |conn| {
                let journal_mode: String = conn
                    .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                    .map_err(|e| Error::database("Pragmas", e))?;
                let synchronous: i64 = conn
                    .query_row("PRAGMA synchronous", [], |row| row.get(0))
                    .map_err(|e| Error::database("Pragmas", e))?;
                Ok((journal_mode, synchronous))
            })
            .await
            .unwrap();

        assert_eq!(journal_mode, "wal");
        // NORMAL
        assert_eq!(synchronous, 1);
    }

    #[tokio::test]
    async fn test_dropped_take_rolls_back() {
        let (_dir, store) = open();
        for name in ["a", "b", "c"] {
            store
                .upsert_node_addr(&NodeId::from(name), NodeAddr::default())
                .await
                .unwrap();
        }
        let criteria = CrawlCriteria {
            min_unused: Duration::from_secs(3600),
            max_ping_tries: 3,
            max_handshake_tries: 3,
            transient_handshake_err: "timeout".to_string(),
            limit: 10,
        };

        let lock = raw(&store);
        lock.execute_batch("BEGIN IMMEDIATE").unwrap();

        let timed_out =
            tokio::time::timeout(Duration::from_millis(100), store.take_candidates(&criteria))
                .await;
        assert!(timed_out.is_err());

        // the abandoned claim gets the write lock now and must roll back
        lock.execute_batch("ROLLBACK").unwrap();
        tokio::time::sleep(Duration::from_millis(500)).await;

        assert_eq!(store.find_candidates(&criteria).await.unwrap().len(), 3);
        assert_eq!(store.take_candidates(&criteria).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_handshake_error_history_only_for_known_nodes() {
        let (_dir, store) = open();
        store
            .update_handshake_error(&NodeId::from("ghost"), "timeout")
            .await
            .unwrap();

        let rows: i64 = raw(&store)
            .query_row("SELECT COUNT(*) FROM handshake_errors", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }
}

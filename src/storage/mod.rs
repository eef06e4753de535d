//! Node persistence
//!
//! [`NodeStore`] is the contract consumed by the crawl driver. Two
//! implementations are provided:
//!
//! - [`SqliteNodeStore`] - durable store backed by SQLite in WAL mode
//! - [`MemoryNodeStore`] - in-process store, useful for tests and tooling
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │          Crawl driver (ping / handshake / crawl)            │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      NodeStore trait                        │
//! └─────────────────────────────────────────────────────────────┘
//!                   │                         │
//!                   ▼                         ▼
//!          ┌─────────────────┐       ┌─────────────────┐
//!          │     SQLite      │       │     Memory      │
//!          └─────────────────┘       └─────────────────┘
//! ```
//!
//! Updates addressed to an id that has no record are silent no-ops; a
//! record only comes into existence through [`NodeStore::upsert_node_addr`].
//! Dropping the future of any operation cancels it; a claim that has not
//! committed yet is rolled back.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;

pub use memory::MemoryNodeStore;
pub use sqlite::SqliteNodeStore;

use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::models::{HandshakeError, HandshakeTry, NodeAddr, NodeId};
use crate::scheduler::{CrawlCriteria, HandshakeCriteria};

/// Persistent scheduling state for discovered nodes
#[async_trait]
pub trait NodeStore: Send + Sync {
    // ------------------------------------------------------------------
    // Address
    // ------------------------------------------------------------------

    /// Insert a node or replace its address
    async fn upsert_node_addr(&self, id: &NodeId, addr: NodeAddr) -> Result<()>;

    /// Stored address, `None` when the node is unknown
    async fn find_node_addr(&self, id: &NodeId) -> Result<Option<NodeAddr>>;

    // ------------------------------------------------------------------
    // Ping health
    // ------------------------------------------------------------------

    /// Clear the ping failure counter
    async fn reset_ping_error(&self, id: &NodeId) -> Result<()>;

    /// Atomically add one ping failure
    async fn update_ping_error(&self, id: &NodeId) -> Result<()>;

    /// Current ping failure count, `None` when the node is unknown
    async fn count_ping_errors(&self, id: &NodeId) -> Result<Option<u32>>;

    // ------------------------------------------------------------------
    // Handshake
    // ------------------------------------------------------------------

    /// Record a successful handshake; resets the handshake backoff
    async fn update_client_id(&self, id: &NodeId, client_id: &str) -> Result<()>;

    /// Record the network id announced in the node's status message
    async fn update_network_id(&self, id: &NodeId, network_id: u64) -> Result<()>;

    /// Stored network id, `None` when never set or the node is unknown
    async fn find_network_id(&self, id: &NodeId) -> Result<Option<u64>>;

    /// Record a failed handshake with its error tag and append it to the
    /// node's error history
    async fn update_handshake_error(&self, id: &NodeId, handshake_err: &str) -> Result<()>;

    /// Forget handshake errors, history included, without recording a
    /// client id
    async fn delete_handshake_errors(&self, id: &NodeId) -> Result<()>;

    /// Up to `limit` recorded handshake errors, newest first
    async fn find_handshake_last_errors(
        &self,
        id: &NodeId,
        limit: usize,
    ) -> Result<Vec<HandshakeError>>;

    /// Last handshake state, `None` when never attempted or unknown
    async fn find_handshake_last_try(&self, id: &NodeId) -> Result<Option<HandshakeTry>>;

    /// Nodes due for a handshake, never-attempted first
    async fn find_handshake_candidates(&self, criteria: &HandshakeCriteria)
        -> Result<Vec<NodeId>>;

    /// Claim the given nodes for handshaking
    async fn mark_taken_handshake_candidates(&self, ids: &[NodeId]) -> Result<()>;

    /// Find and claim handshake candidates in one transaction
    async fn take_handshake_candidates(&self, criteria: &HandshakeCriteria)
        -> Result<Vec<NodeId>>;

    // ------------------------------------------------------------------
    // Fork compatibility
    // ------------------------------------------------------------------

    /// Set whether the node follows our fork
    async fn update_fork_compatibility(&self, id: &NodeId, is_compatible: bool) -> Result<()>;

    // ------------------------------------------------------------------
    // Neighbor bucket keys
    // ------------------------------------------------------------------

    /// Replace the routing bucket keys the node was last seen under
    async fn update_neighbor_bucket_keys(&self, id: &NodeId, keys: &[String]) -> Result<()>;

    /// Stored bucket keys, `None` when never set or the node is unknown
    async fn find_neighbor_bucket_keys(&self, id: &NodeId) -> Result<Option<Vec<String>>>;

    // ------------------------------------------------------------------
    // Crawl
    // ------------------------------------------------------------------

    /// Nodes due for a crawl, never-taken first
    async fn find_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>>;

    /// Claim the given nodes for crawling
    async fn mark_taken_nodes(&self, ids: &[NodeId]) -> Result<()>;

    /// Find and claim crawl candidates in one transaction
    async fn take_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>>;

    // ------------------------------------------------------------------
    // Diagnostics
    // ------------------------------------------------------------------

    /// Whether `err` is transient lock contention worth retrying
    fn is_conflict_error(&self, err: &Error) -> bool {
        err.is_conflict()
    }

    //
    // `max_ping_tries` restricts these to reachable nodes, those with at
    // most that many ping failures. `None` counts every node.

    /// Number of known nodes
    async fn count_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64>;

    /// Nodes not known to be on an incompatible fork
    async fn count_compatible_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64>;

    /// Distinct IPv4 addresses
    async fn count_ips(&self, max_ping_tries: Option<u32>) -> Result<u64>;

    /// Feed one client id per node (absent ones included) to `consumer`
    async fn enumerate_client_ids(
        &self,
        max_ping_tries: Option<u32>,
        consumer: &mut (dyn FnMut(Option<String>) + Send),
    ) -> Result<()>;
}

/// Thread-safe shared store handle
pub type SharedNodeStore = Arc<dyn NodeStore>;

/// Open the SQLite store described by `config`
pub fn open_sqlite_store(config: &StoreConfig) -> Result<SharedNodeStore> {
    let store = SqliteNodeStore::open(config)?;
    Ok(Arc::new(store))
}

//! Common test utilities

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use nodescope::models::{NodeAddr, NodeId};
use nodescope::scheduler::{CrawlCriteria, HandshakeCriteria};
use nodescope::storage::{MemoryNodeStore, SharedNodeStore, SqliteNodeStore};
use tempfile::TempDir;

/// A store under test; keeps its temp directory alive
pub struct TestStore {
    pub name: &'static str,
    pub store: SharedNodeStore,
    _dir: Option<TempDir>,
}

/// One store per backend
pub fn create_test_stores() -> Vec<TestStore> {
    let dir = TempDir::new().unwrap();
    let sqlite = SqliteNodeStore::open_path(dir.path().join("nodes.db")).unwrap();

    vec![
        TestStore {
            name: "sqlite",
            store: Arc::new(sqlite),
            _dir: Some(dir),
        },
        TestStore {
            name: "memory",
            store: Arc::new(MemoryNodeStore::new()),
            _dir: None,
        },
    ]
}

/// Address derived from an index, unique up to 65k nodes
pub fn test_addr(i: u16) -> NodeAddr {
    let [hi, lo] = i.to_be_bytes();
    NodeAddr::v4(Ipv4Addr::new(10, 0, hi, lo), 30303, 30303)
}

/// Insert `count` nodes named `node-0000`, `node-0001`, ...
pub async fn seed_nodes(store: &SharedNodeStore, count: u16) -> Vec<NodeId> {
    let mut ids = Vec::with_capacity(count as usize);
    for i in 0..count {
        let id = NodeId::new(format!("node-{i:04}"));
        store.upsert_node_addr(&id, test_addr(i)).await.unwrap();
        ids.push(id);
    }
    ids
}

/// Crawl criteria with generous ceilings
pub fn crawl_criteria(min_unused: Duration, limit: usize) -> CrawlCriteria {
    CrawlCriteria {
        min_unused,
        max_ping_tries: 3,
        max_handshake_tries: 3,
        transient_handshake_err: "timeout".to_string(),
        limit,
    }
}

/// Handshake criteria with the same quiet period for success and failure
pub fn handshake_criteria(min_unused: Duration, max_tries: u32, limit: usize) -> HandshakeCriteria {
    HandshakeCriteria {
        min_unused_ok: min_unused,
        min_unused_err: min_unused,
        max_tries,
        transient_err: "timeout".to_string(),
        limit,
    }
}

/// Long enough that nothing expires during a test
#[allow(dead_code)]
pub const HOUR: Duration = Duration::from_secs(3600);

/// Sleep past the millisecond resolution of stored timestamps
#[allow(dead_code)]
pub async fn tick() {
    tokio::time::sleep(Duration::from_millis(15)).await;
}

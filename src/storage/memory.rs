//! In-memory implementation of [`NodeStore`]
//!
//! Records live in a map behind a single `RwLock`. A take runs its find and
//! its mark under one write guard, which gives the same exclusivity as the
//! SQLite transaction.

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::Utc;

use super::NodeStore;
use crate::error::{Error, Result};
use crate::models::{ForkCompat, HandshakeError, HandshakeTry, NodeAddr, NodeId, NodeRecord};
use crate::scheduler::{crawl, handshake, CrawlCriteria, HandshakeCriteria};

type Records = HashMap<NodeId, NodeRecord>;

/// Node store kept entirely in process memory
#[derive(Default)]
pub struct MemoryNodeStore {
    records: RwLock<Records>,
}

impl MemoryNodeStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one record
    pub fn get(&self, id: &NodeId) -> Option<NodeRecord> {
        self.records.read().ok()?.get(id).cloned()
    }

    fn read(&self, op: &'static str) -> Result<RwLockReadGuard<'_, Records>> {
        self.records.read().map_err(|_| Error::Poisoned { op })
    }

    fn write(&self, op: &'static str) -> Result<RwLockWriteGuard<'_, Records>> {
        self.records.write().map_err(|_| Error::Poisoned { op })
    }

    /// Apply `update` to the record if it exists
    fn update(
        &self,
        op: &'static str,
        id: &NodeId,
        update: impl FnOnce(&mut NodeRecord),
    ) -> Result<()> {
        if let Some(record) = self.write(op)?.get_mut(id) {
            update(record);
        }
        Ok(())
    }

    fn select_handshake(records: &Records, criteria: &HandshakeCriteria) -> Vec<NodeId> {
        let cutoffs = criteria.cutoffs(Utc::now());
        let mut matches: Vec<&NodeRecord> = records
            .values()
            .filter(|record| criteria.matches(record, &cutoffs))
            .collect();
        matches.sort_by(|a, b| handshake::priority(a, b));
        matches
            .into_iter()
            .take(criteria.limit)
            .map(|record| record.id.clone())
            .collect()
    }

    fn select_crawl(records: &Records, criteria: &CrawlCriteria) -> Vec<NodeId> {
        let taken_before = criteria.taken_before(Utc::now());
        let mut matches: Vec<&NodeRecord> = records
            .values()
            .filter(|record| criteria.matches(record, taken_before))
            .collect();
        matches.sort_by(|a, b| crawl::priority(a, b));
        matches
            .into_iter()
            .take(criteria.limit)
            .map(|record| record.id.clone())
            .collect()
    }

    fn claim_handshake(records: &mut Records, ids: &[NodeId]) {
        let now = Utc::now();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.handshake_claimed = Some(now);
                record.handshake_updated = Some(now);
            }
        }
    }

    fn claim_crawl(records: &mut Records, ids: &[NodeId]) {
        let now = Utc::now();
        for id in ids {
            if let Some(record) = records.get_mut(id) {
                record.taken_last = Some(now);
            }
        }
    }
}

#[async_trait]
impl NodeStore for MemoryNodeStore {
    async fn upsert_node_addr(&self, id: &NodeId, addr: NodeAddr) -> Result<()> {
        let now = Utc::now();
        let mut records = self.write("UpsertNodeAddr")?;
        records
            .entry(id.clone())
            .and_modify(|record| {
                record.addr = addr.normalized();
                record.addr_updated = now;
            })
            .or_insert_with(|| NodeRecord::new(id.clone(), addr, now));
        Ok(())
    }

    async fn find_node_addr(&self, id: &NodeId) -> Result<Option<NodeAddr>> {
        Ok(self.read("FindNodeAddr")?.get(id).map(|record| record.addr))
    }

    async fn reset_ping_error(&self, id: &NodeId) -> Result<()> {
        self.update("ResetPingError", id, |record| record.ping_try = 0)
    }

    async fn update_ping_error(&self, id: &NodeId) -> Result<()> {
        self.update("UpdatePingError", id, |record| {
            record.ping_try = record.ping_try.saturating_add(1);
        })
    }

    async fn count_ping_errors(&self, id: &NodeId) -> Result<Option<u32>> {
        Ok(self.read("CountPingErrors")?.get(id).map(|record| record.ping_try))
    }

    async fn update_client_id(&self, id: &NodeId, client_id: &str) -> Result<()> {
        let now = Utc::now();
        self.update("UpdateClientID", id, |record| {
            record.client_id = Some(client_id.to_string());
            record.handshake_err = None;
            record.handshake_try = 0;
            record.handshake_updated = Some(now);
            record.handshake_claimed = None;
        })
    }

    async fn update_network_id(&self, id: &NodeId, network_id: u64) -> Result<()> {
        self.update("UpdateNetworkID", id, |record| {
            record.network_id = Some(network_id);
        })
    }

    async fn find_network_id(&self, id: &NodeId) -> Result<Option<u64>> {
        Ok(self
            .read("FindNetworkID")?
            .get(id)
            .and_then(|record| record.network_id))
    }

    async fn update_handshake_error(&self, id: &NodeId, handshake_err: &str) -> Result<()> {
        let now = Utc::now();
        self.update("UpdateHandshakeError", id, |record| {
            record.handshake_err = Some(handshake_err.to_string());
            record.handshake_try = record.handshake_try.saturating_add(1);
            record.handshake_updated = Some(now);
            record.handshake_claimed = None;
            record.handshake_errors.push(HandshakeError {
                error: handshake_err.to_string(),
                time: now,
            });
        })
    }

    async fn delete_handshake_errors(&self, id: &NodeId) -> Result<()> {
        self.update("DeleteHandshakeErrors", id, |record| {
            record.handshake_err = None;
            record.handshake_try = 0;
            record.handshake_errors.clear();
        })
    }

    async fn find_handshake_last_errors(
        &self,
        id: &NodeId,
        limit: usize,
    ) -> Result<Vec<HandshakeError>> {
        Ok(self
            .read("FindHandshakeLastErrors")?
            .get(id)
            .map(|record| record.last_handshake_errors(limit))
            .unwrap_or_default())
    }

    async fn find_handshake_last_try(&self, id: &NodeId) -> Result<Option<HandshakeTry>> {
        Ok(self
            .read("FindHandshakeLastTry")?
            .get(id)
            .and_then(NodeRecord::handshake_last_try))
    }

    async fn find_handshake_candidates(
        &self,
        criteria: &HandshakeCriteria,
    ) -> Result<Vec<NodeId>> {
        let records = self.read("FindHandshakeCandidates")?;
        Ok(Self::select_handshake(&records, criteria))
    }

    async fn mark_taken_handshake_candidates(&self, ids: &[NodeId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut records = self.write("MarkTakenHandshakeCandidates")?;
        Self::claim_handshake(&mut records, ids);
        Ok(())
    }

    async fn take_handshake_candidates(
        &self,
        criteria: &HandshakeCriteria,
    ) -> Result<Vec<NodeId>> {
        let mut records = self.write("TakeHandshakeCandidates")?;
        let ids = Self::select_handshake(&records, criteria);
        Self::claim_handshake(&mut records, &ids);
        Ok(ids)
    }

    async fn update_fork_compatibility(&self, id: &NodeId, is_compatible: bool) -> Result<()> {
        let now = Utc::now();
        self.update("UpdateForkCompatibility", id, |record| {
            record.fork_compat = ForkCompat::from(is_compatible);
            record.fork_compat_updated = Some(now);
        })
    }

    async fn update_neighbor_bucket_keys(&self, id: &NodeId, keys: &[String]) -> Result<()> {
        self.update("UpdateNeighborBucketKeys", id, |record| {
            record.neighbor_keys = Some(keys.to_vec());
        })
    }

    async fn find_neighbor_bucket_keys(&self, id: &NodeId) -> Result<Option<Vec<String>>> {
        Ok(self
            .read("FindNeighborBucketKeys")?
            .get(id)
            .and_then(|record| record.neighbor_keys.clone()))
    }

    async fn find_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>> {
        let records = self.read("FindCandidates")?;
        Ok(Self::select_crawl(&records, criteria))
    }

    async fn mark_taken_nodes(&self, ids: &[NodeId]) -> Result<()> {
        if ids.is_empty() {
            return Ok(());
        }
        let mut records = self.write("MarkTakenNodes")?;
        Self::claim_crawl(&mut records, ids);
        Ok(())
    }

    async fn take_candidates(&self, criteria: &CrawlCriteria) -> Result<Vec<NodeId>> {
        let mut records = self.write("TakeCandidates")?;
        let ids = Self::select_crawl(&records, criteria);
        Self::claim_crawl(&mut records, &ids);
        Ok(ids)
    }

    async fn count_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        let records = self.read("CountNodes")?;
        Ok(records
            .values()
            .filter(|record| record.is_reachable(max_ping_tries))
            .count() as u64)
    }

    async fn count_compatible_nodes(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        let records = self.read("CountCompatibleNodes")?;
        Ok(records
            .values()
            .filter(|record| record.is_reachable(max_ping_tries))
            .filter(|record| record.fork_compat.is_eligible())
            .count() as u64)
    }

    async fn count_ips(&self, max_ping_tries: Option<u32>) -> Result<u64> {
        let records = self.read("CountIPs")?;
        let ips: HashSet<Ipv4Addr> = records
            .values()
            .filter(|record| record.is_reachable(max_ping_tries))
            .filter_map(|record| record.addr.ipv4.ip)
            .collect();
        Ok(ips.len() as u64)
    }

    async fn enumerate_client_ids(
        &self,
        max_ping_tries: Option<u32>,
        consumer: &mut (dyn FnMut(Option<String>) + Send),
    ) -> Result<()> {
        let client_ids: Vec<Option<String>> = self
            .read("EnumerateClientIDs")?
            .values()
            .filter(|record| record.is_reachable(max_ping_tries))
            .map(|record| record.client_id.clone())
            .collect();
        for client_id in client_ids {
            consumer(client_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_store_utilities() {
        let store = MemoryNodeStore::new();
        assert!(store.is_empty());

        let id = NodeId::from("node");
        store.upsert_node_addr(&id, NodeAddr::default()).await.unwrap();
        assert_eq!(store.len(), 1);

        let record = store.get(&id).unwrap();
        assert_eq!(record.ping_try, 0);
        assert_eq!(record.fork_compat, ForkCompat::Unknown);
        assert!(store.get(&NodeId::from("missing")).is_none());
    }

    #[tokio::test]
    async fn test_upsert_keeps_health_state() {
        let store = MemoryNodeStore::new();
        let id = NodeId::from("node");
        store.upsert_node_addr(&id, NodeAddr::default()).await.unwrap();
        store.update_ping_error(&id).await.unwrap();
        store.update_handshake_error(&id, "timeout").await.unwrap();

        let addr = NodeAddr::v4(Ipv4Addr::new(8, 8, 8, 8), 30303, 30303);
        store.upsert_node_addr(&id, addr).await.unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.addr, addr);
        assert_eq!(record.ping_try, 1);
        assert_eq!(record.handshake_try, 1);
    }

    #[tokio::test]
    async fn test_claim_preserves_last_error() {
        let store = MemoryNodeStore::new();
        let id = NodeId::from("node");
        store.upsert_node_addr(&id, NodeAddr::default()).await.unwrap();
        store.update_handshake_error(&id, "timeout").await.unwrap();

        store
            .mark_taken_handshake_candidates(std::slice::from_ref(&id))
            .await
            .unwrap();

        let record = store.get(&id).unwrap();
        assert_eq!(record.handshake_err.as_deref(), Some("timeout"));
        assert!(record.handshake_claimed.is_some());
        assert_eq!(record.handshake_claimed, record.handshake_updated);
    }
}

//! Node population statistics
//!
//! Aggregates the store's diagnostic counters and a histogram of client
//! software names into one snapshot.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::NodeStore;

/// Snapshot of the node population
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStats {
    /// Total known nodes
    pub total: u64,

    /// Nodes not known to be on an incompatible fork
    pub compatible: u64,

    /// Distinct IPv4 addresses
    pub ips: u64,

    /// Nodes per client software name
    pub clients: BTreeMap<String, u64>,

    /// Nodes with no recorded client id
    pub unidentified: u64,
}

impl NodeStats {
    /// Share of nodes on a compatible fork, in percent
    pub fn compatible_percent(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.compatible as f64 / self.total as f64 * 100.0
    }

    /// Client names ordered by node count, largest first
    pub fn top_clients(&self, n: usize) -> Vec<(&str, u64)> {
        let mut clients: Vec<(&str, u64)> = self
            .clients
            .iter()
            .map(|(name, count)| (name.as_str(), *count))
            .collect();
        clients.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        clients.truncate(n);
        clients
    }
}

/// Software name of a client id such as `Geth/v1.13.0-stable/linux-amd64/go1.21`
///
/// Returns `None` for ids with an empty name segment.
pub fn client_name(client_id: &str) -> Option<String> {
    let name = client_id.split('/').next()?.trim();
    if name.is_empty() {
        return None;
    }
    Some(name.to_lowercase())
}

/// Collect a [`NodeStats`] snapshot from `store`
///
/// With `max_ping_tries` set, only nodes with at most that many ping
/// failures are counted.
pub async fn collect_stats(
    store: &dyn NodeStore,
    max_ping_tries: Option<u32>,
) -> Result<NodeStats> {
    let mut stats = NodeStats {
        total: store.count_nodes(max_ping_tries).await?,
        compatible: store.count_compatible_nodes(max_ping_tries).await?,
        ips: store.count_ips(max_ping_tries).await?,
        ..NodeStats::default()
    };

    let mut clients: BTreeMap<String, u64> = BTreeMap::new();
    let mut unidentified = 0u64;
    store
        .enumerate_client_ids(max_ping_tries, &mut |client_id| {
            match client_id.as_deref().and_then(client_name) {
                Some(name) => *clients.entry(name).or_default() += 1,
                None => unidentified += 1,
            }
        })
        .await?;

    stats.clients = clients;
    stats.unidentified = unidentified;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{NodeAddr, NodeId};
    use crate::storage::MemoryNodeStore;
    use std::net::Ipv4Addr;

    #[test]
    fn test_client_name() {
        assert_eq!(
            client_name("Geth/v1.13.0-stable/linux-amd64/go1.21").as_deref(),
            Some("geth")
        );
        assert_eq!(client_name("erigon").as_deref(), Some("erigon"));
        assert_eq!(client_name(""), None);
        assert_eq!(client_name("/v1.0"), None);
    }

    #[test]
    fn test_top_clients_orders_by_count() {
        let stats = NodeStats {
            clients: BTreeMap::from([
                ("besu".to_string(), 2),
                ("geth".to_string(), 5),
                ("nethermind".to_string(), 2),
            ]),
            ..NodeStats::default()
        };

        assert_eq!(stats.top_clients(2), vec![("geth", 5), ("besu", 2)]);
    }

    #[test]
    fn test_compatible_percent_of_empty_store() {
        assert_eq!(NodeStats::default().compatible_percent(), 0.0);
    }

    #[tokio::test]
    async fn test_collect_stats() {
        let store = MemoryNodeStore::new();
        let nodes = [
            ("a", Some("Geth/v1.13.0"), true),
            ("b", Some("geth/v1.12.2"), true),
            ("c", Some("Nethermind/v1.25.0"), false),
            ("d", None, true),
        ];

        for (i, (id, client_id, compatible)) in nodes.iter().enumerate() {
            let id = NodeId::from(*id);
            let ip = Ipv4Addr::new(10, 0, 0, (i % 3) as u8);
            store.upsert_node_addr(&id, NodeAddr::v4(ip, 30303, 30303)).await.unwrap();
            if let Some(client_id) = client_id {
                store.update_client_id(&id, client_id).await.unwrap();
            }
            store.update_fork_compatibility(&id, *compatible).await.unwrap();
        }

        let stats = collect_stats(&store, None).await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.compatible, 3);
        assert_eq!(stats.ips, 3);
        assert_eq!(stats.clients.get("geth"), Some(&2));
        assert_eq!(stats.clients.get("nethermind"), Some(&1));
        assert_eq!(stats.unidentified, 1);

        // "a" stops answering pings
        let a = NodeId::from("a");
        store.update_ping_error(&a).await.unwrap();
        store.update_ping_error(&a).await.unwrap();

        let reachable = collect_stats(&store, Some(1)).await.unwrap();
        assert_eq!(reachable.total, 3);
        assert_eq!(reachable.compatible, 2);
        assert_eq!(reachable.ips, 3);
        assert_eq!(reachable.clients.get("geth"), Some(&1));
        assert_eq!(collect_stats(&store, Some(2)).await.unwrap(), stats);
    }
}

//! Concurrent workers claiming through `CandidateScheduler`

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{crawl_criteria, create_test_stores, handshake_criteria, seed_nodes, HOUR};
use nodescope::models::NodeId;
use nodescope::scheduler::{CandidateScheduler, HandshakeOutcome};
use nodescope::stats::collect_stats;
use tokio::task::JoinSet;

const NODES: u16 = 240;
const WORKERS: usize = 8;

/// Run `WORKERS` tasks claiming batches until the pool is drained
async fn drain<F, Fut>(scheduler: Arc<CandidateScheduler>, next: F) -> Vec<NodeId>
where
    F: Fn(Arc<CandidateScheduler>) -> Fut + Clone + Send + 'static,
    Fut: std::future::Future<Output = nodescope::error::Result<Vec<NodeId>>> + Send,
{
    let mut workers = JoinSet::new();
    for _ in 0..WORKERS {
        let scheduler = Arc::clone(&scheduler);
        let next = next.clone();
        workers.spawn(async move {
            let mut claimed = Vec::new();
            loop {
                let batch = next(Arc::clone(&scheduler)).await.unwrap();
                if batch.is_empty() {
                    break claimed;
                }
                claimed.extend(batch);
            }
        });
    }

    let mut all = Vec::new();
    while let Some(claimed) = workers.join_next().await {
        all.extend(claimed.unwrap());
    }
    all
}

fn assert_disjoint_cover(name: &str, claimed: &[NodeId], seeded: &[NodeId]) {
    let unique: HashSet<&NodeId> = claimed.iter().collect();
    assert_eq!(unique.len(), claimed.len(), "{name}: a node was claimed twice");
    assert_eq!(unique.len(), seeded.len(), "{name}: some nodes were never claimed");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_crawl_claims_are_disjoint() {
    for t in create_test_stores() {
        let seeded = seed_nodes(&t.store, NODES).await;
        let scheduler = Arc::new(CandidateScheduler::new(
            Arc::clone(&t.store),
            handshake_criteria(HOUR, 3, 7),
            crawl_criteria(HOUR, 7),
        ));

        let claimed = drain(scheduler, |s| async move { s.next_crawl_batch().await }).await;

        assert_disjoint_cover(t.name, &claimed, &seeded);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_handshake_claims_are_disjoint() {
    for t in create_test_stores() {
        let seeded = seed_nodes(&t.store, NODES).await;
        let scheduler = Arc::new(CandidateScheduler::new(
            Arc::clone(&t.store),
            handshake_criteria(HOUR, 3, 5),
            crawl_criteria(HOUR, 5),
        ));

        let claimed = drain(scheduler, |s| async move { s.next_handshake_batch().await }).await;

        assert_disjoint_cover(t.name, &claimed, &seeded);
    }
}

#[tokio::test]
async fn test_handshake_round_trip() {
    for t in create_test_stores() {
        let seeded = seed_nodes(&t.store, 4).await;
        let scheduler = CandidateScheduler::new(
            Arc::clone(&t.store),
            handshake_criteria(HOUR, 3, 10),
            crawl_criteria(HOUR, 10),
        );

        let batch = scheduler.next_handshake_batch().await.unwrap();
        assert_eq!(batch, seeded, "{}", t.name);

        for (i, id) in batch.iter().enumerate() {
            let outcome = if i % 2 == 0 {
                HandshakeOutcome::Success {
                    client_id: format!("Geth/v1.13.{i}"),
                }
            } else {
                HandshakeOutcome::Failure {
                    error: "timeout".to_string(),
                }
            };
            scheduler.report_handshake(id, &outcome).await.unwrap();
            scheduler.report_ping(id, i != 3).await.unwrap();
        }

        let stats = collect_stats(t.store.as_ref(), None).await.unwrap();
        assert_eq!(stats.total, 4, "{}", t.name);
        assert_eq!(stats.clients.get("geth"), Some(&2), "{}", t.name);
        assert_eq!(stats.unidentified, 2, "{}", t.name);

        assert_eq!(t.store.count_ping_errors(&seeded[3]).await.unwrap(), Some(1));
        assert!(scheduler.next_handshake_batch().await.unwrap().is_empty());
    }
}

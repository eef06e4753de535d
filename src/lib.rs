//! nodescope - scheduling core of a P2P network crawler
//!
//! Keeps per-node health state for discovered peers and hands out disjoint
//! batches of ping, handshake and crawl work to concurrent workers.
//!
//! # Architecture
//!
//! The library is organized into several modules:
//!
//! - [`config`] - Configuration management and settings
//! - [`models`] - Node identity, addresses and health records
//! - [`scheduler`] - Candidate eligibility rules and the batch scheduler
//! - [`storage`] - The `NodeStore` contract with SQLite and in-memory backends
//! - [`stats`] - Population counters and client histogram
//! - [`utils`] - Retry with backoff for contended claims
//!
//! # Example
//!
//! ```no_run
//! use nodescope::config::Config;
//! use nodescope::scheduler::CandidateScheduler;
//! use nodescope::storage::open_sqlite_store;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::from_env()?;
//!     let store = open_sqlite_store(&config.store)?;
//!     let scheduler = CandidateScheduler::new(
//!         store,
//!         config.handshake.criteria(),
//!         config.crawl.criteria(),
//!     );
//!     let batch = scheduler.next_crawl_batch().await?;
//!     println!("claimed {} nodes", batch.len());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod models;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod utils;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::Config;
    pub use crate::error::{Error, ErrorCategory, Result};
    pub use crate::models::{ForkCompat, HandshakeTry, NodeAddr, NodeId, NodeRecord};
    pub use crate::scheduler::{
        CandidateScheduler, CrawlCriteria, HandshakeCriteria, HandshakeOutcome,
    };
    pub use crate::stats::{collect_stats, NodeStats};
    pub use crate::storage::{MemoryNodeStore, NodeStore, SharedNodeStore, SqliteNodeStore};
}

// Direct re-exports for convenience
pub use models::{NodeAddr, NodeId};
pub use storage::NodeStore;

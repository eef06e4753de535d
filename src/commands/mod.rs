use anyhow::{Context, Result};

use nodescope::config::Config;
use nodescope::models::{Endpoint, NodeId};
use nodescope::scheduler::CandidateScheduler;
use nodescope::stats::collect_stats;
use nodescope::storage::{open_sqlite_store, SharedNodeStore};
use nodescope::utils::RetryConfig;

fn open_store(config: &Config) -> Result<SharedNodeStore> {
    open_sqlite_store(&config.store)
        .with_context(|| format!("Failed to open node store {}", config.store.path.display()))
}

fn scheduler(config: &Config) -> Result<CandidateScheduler> {
    let store = open_store(config)?;
    Ok(CandidateScheduler::new(store, config.handshake.criteria(), config.crawl.criteria())
        .with_retry(RetryConfig::from(&config.retry)))
}

fn format_endpoint<Ip: std::fmt::Display>(endpoint: &Endpoint<Ip>) -> String {
    match &endpoint.ip {
        Some(ip) => format!(
            "{ip} (disc {}, rlpx {})",
            endpoint.port_disc, endpoint.port_rlpx
        ),
        None => String::from("-"),
    }
}

/// Recent handshake errors listed by `node`
const LAST_ERRORS: usize = 5;

pub async fn stats(config: &Config, top: usize, max_ping_tries: Option<u32>) -> Result<()> {
    let store = open_store(config)?;
    let stats = collect_stats(store.as_ref(), max_ping_tries).await?;

    println!("Node Statistics");
    println!("===============");
    println!("Database: {}", config.store.path.display());
    if let Some(max) = max_ping_tries {
        println!("Reachable only (at most {max} ping failures)");
    }
    println!();
    println!("Total nodes:   {}", stats.total);
    println!(
        "  Compatible:  {} ({:.1}%)",
        stats.compatible,
        stats.compatible_percent()
    );
    println!("Distinct IPs:  {}", stats.ips);
    println!();
    println!("Clients:");
    for (name, count) in stats.top_clients(top) {
        println!("  {name:<16} {count}");
    }
    println!("  {:<16} {}", "(unknown)", stats.unidentified);

    Ok(())
}

pub async fn node(config: &Config, id: String) -> Result<()> {
    let store = open_store(config)?;
    let id = NodeId::new(id);

    let Some(addr) = store.find_node_addr(&id).await? else {
        println!("Node not found: {id}");
        return Ok(());
    };

    println!("Node {id}");
    println!("  IPv4:          {}", format_endpoint(&addr.ipv4));
    println!("  IPv6:          {}", format_endpoint(&addr.ipv6));

    let ping_tries = store.count_ping_errors(&id).await?.unwrap_or(0);
    println!("  Ping failures: {ping_tries}");

    match store.find_handshake_last_try(&id).await? {
        Some(last) => println!(
            "  Handshake:     {} try {} at {}{}",
            if last.has_error { "failed" } else { "ok" },
            last.tries,
            last.updated.to_rfc3339(),
            if last.claimed { " (claimed)" } else { "" }
        ),
        None => println!("  Handshake:     never attempted"),
    }

    let errors = store.find_handshake_last_errors(&id, LAST_ERRORS).await?;
    for error in &errors {
        println!("    {}  {}", error.time.to_rfc3339(), error.error);
    }

    match store.find_network_id(&id).await? {
        Some(network_id) => println!("  Network id:    {network_id}"),
        None => println!("  Network id:    -"),
    }

    match store.find_neighbor_bucket_keys(&id).await? {
        Some(keys) => println!("  Neighbor keys: {}", keys.join(", ")),
        None => println!("  Neighbor keys: -"),
    }

    Ok(())
}

pub async fn take_handshake(config: &Config) -> Result<()> {
    let ids = scheduler(config)?.next_handshake_batch().await?;
    tracing::info!(count = ids.len(), "Claimed handshake candidates");
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

pub async fn take_crawl(config: &Config) -> Result<()> {
    let ids = scheduler(config)?.next_crawl_batch().await?;
    tracing::info!(count = ids.len(), "Claimed crawl candidates");
    for id in ids {
        println!("{id}");
    }
    Ok(())
}

//! Core data structures and types
//!
//! This module defines the node record and the value types exchanged with
//! the store: node identifiers, dual-stack addresses, fork compatibility and
//! handshake state.

use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identity
// ============================================================================

/// Opaque, public-key derived node identifier
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Create a node id from its string form
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Borrow the id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for NodeId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Addresses
// ============================================================================

/// One stack of a node address: an IP plus discovery and RLPx ports
///
/// Ports are only meaningful while `ip` is present; a zero port means
/// "unknown".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint<Ip> {
    /// IP literal, absent when the node was never seen on this stack
    pub ip: Option<Ip>,

    /// Discovery (UDP) port
    pub port_disc: u16,

    /// RLPx (TCP) messaging port
    pub port_rlpx: u16,
}

impl<Ip> Default for Endpoint<Ip> {
    fn default() -> Self {
        Self {
            ip: None,
            port_disc: 0,
            port_rlpx: 0,
        }
    }
}

impl<Ip: Copy> Endpoint<Ip> {
    /// Create an endpoint with both ports
    pub fn new(ip: Ip, port_disc: u16, port_rlpx: u16) -> Self {
        Self {
            ip: Some(ip),
            port_disc,
            port_rlpx,
        }
    }

    /// Discovery port, if the IP is present and the port is non-zero
    pub fn disc_port(&self) -> Option<u16> {
        self.ip.and(Some(self.port_disc)).filter(|port| *port != 0)
    }

    /// RLPx port, if the IP is present and the port is non-zero
    pub fn rlpx_port(&self) -> Option<u16> {
        self.ip.and(Some(self.port_rlpx)).filter(|port| *port != 0)
    }

    /// Drop ports that have no IP to belong to
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            ip: self.ip,
            port_disc: self.disc_port().unwrap_or(0),
            port_rlpx: self.rlpx_port().unwrap_or(0),
        }
    }
}

/// Dual-stack node address
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddr {
    pub ipv4: Endpoint<Ipv4Addr>,
    pub ipv6: Endpoint<Ipv6Addr>,
}

impl NodeAddr {
    /// Address with only an IPv4 endpoint
    pub fn v4(ip: Ipv4Addr, port_disc: u16, port_rlpx: u16) -> Self {
        Self {
            ipv4: Endpoint::new(ip, port_disc, port_rlpx),
            ipv6: Endpoint::default(),
        }
    }

    /// Builder-style setter for the IPv6 endpoint
    #[must_use]
    pub fn with_ipv6(mut self, ip: Ipv6Addr, port_disc: u16, port_rlpx: u16) -> Self {
        self.ipv6 = Endpoint::new(ip, port_disc, port_rlpx);
        self
    }

    /// Address as it reads back from the store
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            ipv4: self.ipv4.normalized(),
            ipv6: self.ipv6.normalized(),
        }
    }

    /// True when neither stack carries an IP
    pub fn is_empty(&self) -> bool {
        self.ipv4.ip.is_none() && self.ipv6.ip.is_none()
    }
}

// ============================================================================
// Fork Compatibility
// ============================================================================

/// Whether a node follows the same network fork as the crawler
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForkCompat {
    Compatible,
    Incompatible,
    #[default]
    Unknown,
}

impl ForkCompat {
    /// Unknown and compatible nodes stay in the candidate pools
    pub fn is_eligible(&self) -> bool {
        !matches!(self, ForkCompat::Incompatible)
    }

    /// Convert to the nullable column representation
    pub fn to_column(self) -> Option<bool> {
        match self {
            ForkCompat::Compatible => Some(true),
            ForkCompat::Incompatible => Some(false),
            ForkCompat::Unknown => None,
        }
    }

    /// Convert from the nullable column representation
    pub fn from_column(value: Option<bool>) -> Self {
        match value {
            Some(true) => ForkCompat::Compatible,
            Some(false) => ForkCompat::Incompatible,
            None => ForkCompat::Unknown,
        }
    }
}

impl From<bool> for ForkCompat {
    fn from(is_compatible: bool) -> Self {
        Self::from_column(Some(is_compatible))
    }
}

// ============================================================================
// Handshake State
// ============================================================================

/// Outcome of the most recent handshake attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTry {
    /// Whether the last real attempt failed
    pub has_error: bool,

    /// Consecutive failed attempts since the last success
    pub tries: u32,

    /// When the last attempt or claim happened
    pub updated: DateTime<Utc>,

    /// Claimed by a worker that has not reported back yet
    pub claimed: bool,
}

/// One recorded handshake failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandshakeError {
    /// Error tag reported by the worker
    pub error: String,

    /// When the failure was recorded
    pub time: DateTime<Utc>,
}

// ============================================================================
// Node Record
// ============================================================================

/// Everything the scheduler knows about one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeRecord {
    pub id: NodeId,

    pub addr: NodeAddr,
    pub addr_updated: DateTime<Utc>,

    pub ping_try: u32,

    pub fork_compat: ForkCompat,
    pub fork_compat_updated: Option<DateTime<Utc>>,

    pub client_id: Option<String>,
    pub network_id: Option<u64>,
    pub handshake_err: Option<String>,
    pub handshake_try: u32,
    pub handshake_updated: Option<DateTime<Utc>>,
    pub handshake_claimed: Option<DateTime<Utc>>,
    /// Failure history, oldest first
    pub handshake_errors: Vec<HandshakeError>,

    pub neighbor_keys: Option<Vec<String>>,

    pub taken_last: Option<DateTime<Utc>>,
}

impl NodeRecord {
    /// Fresh record as created by the first address upsert
    pub fn new(id: NodeId, addr: NodeAddr, now: DateTime<Utc>) -> Self {
        Self {
            id,
            addr: addr.normalized(),
            addr_updated: now,
            ping_try: 0,
            fork_compat: ForkCompat::Unknown,
            fork_compat_updated: None,
            client_id: None,
            network_id: None,
            handshake_err: None,
            handshake_try: 0,
            handshake_updated: None,
            handshake_claimed: None,
            handshake_errors: Vec::new(),
            neighbor_keys: None,
            taken_last: None,
        }
    }

    /// Handshake state, `None` when a handshake was never attempted
    pub fn handshake_last_try(&self) -> Option<HandshakeTry> {
        self.handshake_updated.map(|updated| HandshakeTry {
            has_error: self.handshake_err.is_some(),
            tries: self.handshake_try,
            updated,
            claimed: self.handshake_claimed.is_some(),
        })
    }

    /// Up to `limit` recorded handshake failures, newest first
    pub fn last_handshake_errors(&self, limit: usize) -> Vec<HandshakeError> {
        self.handshake_errors.iter().rev().take(limit).cloned().collect()
    }

    /// Whether the node passes an optional ping failure ceiling
    pub fn is_reachable(&self, max_ping_tries: Option<u32>) -> bool {
        max_ping_tries.map_or(true, |max| self.ping_try <= max)
    }
}

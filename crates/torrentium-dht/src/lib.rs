//! Torrentium DHT - Kademlia content discovery
//!
//! This crate provides a distributed hash table for peer discovery,
//! mapping content identifiers to the peers that provide them.

pub mod routing;
pub mod service;
pub mod storage;

pub use service::{DhtService, DhtState, MaintenanceReport};

use std::time::Duration;
use thiserror::Error;
use torrentium_core::PeerAddress;

#[derive(Error, Debug)]
pub enum DhtError {
    #[error("Node not found")]
    NodeNotFound,

    #[error("Timeout waiting for response")]
    Timeout,

    #[error("Network error: {0}")]
    Network(String),

    #[error("Not bootstrapped: routing table is empty")]
    NotBootstrapped,

    #[error("Bootstrap failed after {attempts} attempts")]
    BootstrapFailed { attempts: u32 },

    #[error("All {queried} queried nodes failed")]
    AllQueriesFailed { queried: usize },

    #[error("Cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, DhtError>;

impl From<DhtError> for torrentium_core::Error {
    fn from(err: DhtError) -> Self {
        match err {
            DhtError::Cancelled => torrentium_core::Error::Cancelled,
            other => torrentium_core::Error::Discovery(other.to_string()),
        }
    }
}

/// DHT node configuration
#[derive(Debug, Clone)]
pub struct DhtConfig {
    /// Number of nodes per k-bucket, and replication factor for announcements
    pub k: usize,
    /// Parallelism factor for lookups
    pub alpha: usize,
    /// Peers contacted to join the overlay
    pub bootstrap_nodes: Vec<PeerAddress>,
    /// Bound on every single DHT query
    pub query_timeout: Duration,
    /// Provider records older than this are dropped
    pub provider_ttl: Duration,
    pub max_providers_per_key: usize,
    pub bootstrap_max_attempts: u32,
    /// Initial retry delay; doubles after each failed attempt
    pub bootstrap_backoff: Duration,
    /// Upper bound on lookup rounds
    pub max_lookup_rounds: usize,
}

impl Default for DhtConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            bootstrap_nodes: Vec::new(),
            query_timeout: Duration::from_secs(5),
            provider_ttl: Duration::from_secs(24 * 60 * 60),
            max_providers_per_key: 20,
            bootstrap_max_attempts: 5,
            bootstrap_backoff: Duration::from_millis(500),
            max_lookup_rounds: 8,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dht_error_conversion() {
        let err: torrentium_core::Error = DhtError::Cancelled.into();
        assert!(matches!(err, torrentium_core::Error::Cancelled));

        let err: torrentium_core::Error = DhtError::AllQueriesFailed { queried: 3 }.into();
        match err {
            torrentium_core::Error::Discovery(msg) => assert!(msg.contains("3")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}

use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::PathBuf;

use crate::error::{RaftError, Result};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub node_id: u64,
    pub listen_addr: SocketAddr,
    pub peers: Vec<PeerConfig>,
    pub election_timeout_min_ms: u64,
    pub election_timeout_max_ms: u64,
    pub heartbeat_interval_ms: u64,
    /// Upper bound on a single peer RPC before it is treated as lost.
    pub rpc_timeout_ms: u64,
    /// Directory for durable state. `None` keeps state in memory only.
    pub data_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct PeerConfig {
    pub node_id: u64,
    pub addr: String, // host:port format, supports both IP and hostnames
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50051"
                .parse()
                .expect("default listen address is valid"),
            peers: Vec::new(),
            election_timeout_min_ms: 500,
            election_timeout_max_ms: 2500,
            heartbeat_interval_ms: 100,
            rpc_timeout_ms: 100,
            data_dir: None,
        }
    }
}

impl NodeConfig {
    pub fn new(node_id: u64, listen_addr: SocketAddr) -> Self {
        Self {
            node_id,
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_peer(mut self, node_id: u64, addr: String) -> Self {
        self.peers.push(PeerConfig { node_id, addr });
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Ids of every other cluster member.
    pub fn peer_ids(&self) -> Vec<u64> {
        self.peers.iter().map(|p| p.node_id).collect()
    }

    /// Number of voting members, this node included.
    pub fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    /// Check the settings the consensus engine relies on.
    pub fn validate(&self) -> Result<()> {
        if self.election_timeout_min_ms == 0 {
            return Err(RaftError::InvalidConfig(
                "election timeout must be positive".to_string(),
            ));
        }
        if self.election_timeout_min_ms > self.election_timeout_max_ms {
            return Err(RaftError::InvalidConfig(format!(
                "election timeout range is empty ({}..={} ms)",
                self.election_timeout_min_ms, self.election_timeout_max_ms
            )));
        }
        if self.heartbeat_interval_ms == 0
            || self.heartbeat_interval_ms >= self.election_timeout_min_ms
        {
            return Err(RaftError::InvalidConfig(format!(
                "heartbeat interval ({} ms) must be positive and below the minimum election timeout ({} ms)",
                self.heartbeat_interval_ms, self.election_timeout_min_ms
            )));
        }
        let mut seen = HashSet::new();
        for peer in &self.peers {
            if peer.node_id == self.node_id {
                return Err(RaftError::InvalidConfig(format!(
                    "node {} lists itself as a peer",
                    self.node_id
                )));
            }
            if !seen.insert(peer.node_id) {
                return Err(RaftError::InvalidConfig(format!(
                    "duplicate peer id {}",
                    peer.node_id
                )));
            }
        }
        Ok(())
    }
}

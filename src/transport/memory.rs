//! In-process simulated network for tests and local experiments.
//!
//! Every registered node is reachable through a [`MemoryTransport`]. Nodes can
//! be disconnected, links can be cut in either direction, and the network can
//! be switched to unreliable mode, where requests and replies are randomly
//! delayed or dropped.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;

use crate::error::{RaftError, Result};
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::RaftNode;
use crate::transport::RaftTransport;

/// Percentage of requests, and separately of replies, lost when unreliable
const DROP_PERCENT: u32 = 10;
/// Upper bound of the random delivery delay when unreliable
const MAX_DELAY_MS: u64 = 27;
/// How long a call to an unreachable node takes to fail
const UNREACHABLE_DELAY_MS: u64 = 20;

#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<u64, Arc<RaftNode>>>,
    disconnected: RwLock<HashSet<u64>>,
    // Directed (from, to) links that drop everything
    cut_links: RwLock<HashSet<(u64, u64)>>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Transport used by node `from` to reach its peers.
    pub fn transport(self: &Arc<Self>, from: u64) -> Arc<MemoryTransport> {
        Arc::new(MemoryTransport {
            from,
            network: Arc::clone(self),
        })
    }

    /// Make `node` reachable under its id, replacing a previous incarnation.
    pub fn register(&self, node: Arc<RaftNode>) {
        self.nodes.write().insert(node.id, node);
    }

    /// Remove a node; calls to it fail until a new node registers.
    pub fn remove(&self, node_id: u64) -> Option<Arc<RaftNode>> {
        self.nodes.write().remove(&node_id)
    }

    /// Drop every registered node, breaking node <-> network reference cycles.
    pub fn clear(&self) {
        self.nodes.write().clear();
    }

    /// Cut a node off from everyone, in both directions.
    pub fn disconnect(&self, node_id: u64) {
        tracing::debug!(node_id, "Disconnecting node");
        self.disconnected.write().insert(node_id);
    }

    pub fn connect(&self, node_id: u64) {
        tracing::debug!(node_id, "Reconnecting node");
        self.disconnected.write().remove(&node_id);
    }

    pub fn is_connected(&self, node_id: u64) -> bool {
        !self.disconnected.read().contains(&node_id)
    }

    /// Cut every link between the two groups, in both directions.
    pub fn partition(&self, group_a: &[u64], group_b: &[u64]) {
        let mut cut = self.cut_links.write();
        for &a in group_a {
            for &b in group_b {
                cut.insert((a, b));
                cut.insert((b, a));
            }
        }
    }

    /// Restore every cut link. Disconnected nodes stay disconnected.
    pub fn heal(&self) {
        self.cut_links.write().clear();
    }

    pub fn set_reliable(&self, reliable: bool) {
        self.unreliable.store(!reliable, Ordering::SeqCst);
    }

    /// Number of RPCs attempted through this network.
    pub fn rpc_count(&self) -> u64 {
        self.rpc_count.load(Ordering::SeqCst)
    }

    fn link_up(&self, from: u64, to: u64) -> bool {
        let disconnected = self.disconnected.read();
        !disconnected.contains(&from)
            && !disconnected.contains(&to)
            && !self.cut_links.read().contains(&(from, to))
    }

    /// Returns (delay, drop) for one leg of a call.
    fn roll_leg(&self) -> (Duration, bool) {
        if !self.unreliable.load(Ordering::SeqCst) {
            return (Duration::ZERO, false);
        }
        let mut rng = rand::thread_rng();
        let delay = Duration::from_millis(rng.gen_range(0..=MAX_DELAY_MS));
        let drop = rng.gen_range(0..100) < DROP_PERCENT;
        (delay, drop)
    }

    async fn deliver<T, F, Fut>(&self, from: u64, to: u64, call: F) -> Result<T>
    where
        F: FnOnce(Arc<RaftNode>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.rpc_count.fetch_add(1, Ordering::SeqCst);

        let target = self.nodes.read().get(&to).cloned();
        let target = match target {
            Some(node) if self.link_up(from, to) => node,
            _ => {
                tokio::time::sleep(Duration::from_millis(UNREACHABLE_DELAY_MS)).await;
                return Err(RaftError::network(to, "unreachable"));
            }
        };

        let (delay, dropped) = self.roll_leg();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if dropped {
            return Err(RaftError::network(to, "request lost"));
        }

        let reply = call(target).await?;

        let (delay, dropped) = self.roll_leg();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if dropped || !self.link_up(to, from) {
            return Err(RaftError::network(to, "reply lost"));
        }
        Ok(reply)
    }
}

/// A node's handle onto a [`MemoryNetwork`].
pub struct MemoryTransport {
    from: u64,
    network: Arc<MemoryNetwork>,
}

#[async_trait]
impl RaftTransport for MemoryTransport {
    async fn request_vote(&self, peer_id: u64, req: VoteRequest) -> Result<VoteResponse> {
        self.network
            .deliver(self.from, peer_id, move |node| async move {
                node.handle_request_vote(req).await
            })
            .await
    }

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        self.network
            .deliver(self.from, peer_id, move |node| async move {
                node.handle_append_entries(req).await
            })
            .await
    }

    async fn install_snapshot(
        &self,
        peer_id: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        self.network
            .deliver(self.from, peer_id, move |node| async move {
                node.handle_install_snapshot(req).await
            })
            .await
    }
}

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;

use crate::config::NodeConfig;
use crate::error::{RaftError, Result};
use crate::persister::Persister;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::apply::ApplyMsg;
use crate::raft::rpc::{self, Effects};
use crate::raft::state::{PendingSnapshot, RaftRole, RaftState};
use crate::raft::timer::ElectionTimer;
use crate::transport::RaftTransport;

/// Point-in-time view of a node, for status endpoints and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeStatus {
    pub node_id: u64,
    pub role: RaftRole,
    pub term: u64,
    pub leader_id: Option<u64>,
    pub commit_index: u64,
    pub last_applied: u64,
    pub last_log_index: u64,
    pub snapshot_index: u64,
}

/// A single Raft cluster member.
///
/// All node state sits behind one lock. RPC handlers and the background
/// tasks (election timer, applier, one replication task per leadership
/// tenure) take it for every read or change and never hold it across a
/// network call or an apply-channel send.
pub struct RaftNode {
    pub id: u64,
    pub state: Mutex<RaftState>,
    pub(crate) config: NodeConfig,
    pub(crate) peer_ids: Vec<u64>,
    pub(crate) persister: Arc<dyn Persister>,
    pub(crate) transport: Arc<dyn RaftTransport>,
    pub(crate) apply_tx: mpsc::Sender<ApplyMsg>,
    pub(crate) timer: ElectionTimer,
    pub(crate) apply_wake: Notify,
    pub(crate) replicate_wake: Notify,
    pub(crate) shutdown: CancellationToken,
}

impl RaftNode {
    /// Create a node, restore whatever `persister` holds, and spawn its
    /// background tasks. Returns immediately; must be called from within a
    /// Tokio runtime.
    pub fn start(
        config: NodeConfig,
        persister: Arc<dyn Persister>,
        transport: Arc<dyn RaftTransport>,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let mut state = RaftState::restore(&persister.read_state()?)?;
        if state.snapshot_index() > 0 {
            state.snapshot_data = persister.read_snapshot()?;
            // The application rebuilds from the snapshot before replaying the log
            state.pending_snapshot = Some(PendingSnapshot {
                term: state.snapshot_term(),
                index: state.snapshot_index(),
                data: state.snapshot_data.clone(),
            });
        }

        let timer = ElectionTimer::new(config.election_timeout_min_ms, config.election_timeout_max_ms);
        let first_timeout = timer.reset(&mut state.election_deadline);

        tracing::info!(
            node_id = config.node_id,
            term = state.current_term,
            last_log_index = state.last_log_index(),
            snapshot_index = state.snapshot_index(),
            timeout_ms = first_timeout.as_millis() as u64,
            "Starting raft node"
        );

        let node = Arc::new(Self {
            id: config.node_id,
            peer_ids: config.peer_ids(),
            state: Mutex::new(state),
            config,
            persister,
            transport,
            apply_tx,
            timer,
            apply_wake: Notify::new(),
            replicate_wake: Notify::new(),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(node.clone().run_election_timer());
        tokio::spawn(node.clone().run_applier());

        Ok(node)
    }

    /// Current term and whether this node believes it is the leader.
    pub async fn get_state(&self) -> (u64, bool) {
        let state = self.state.lock().await;
        (state.current_term, state.role == RaftRole::Leader)
    }

    /// Check if this node is the leader
    pub async fn is_leader(&self) -> bool {
        self.state.lock().await.role == RaftRole::Leader
    }

    /// Get the current leader ID
    pub async fn leader_id(&self) -> Option<u64> {
        self.state.lock().await.leader_id
    }

    pub async fn status(&self) -> NodeStatus {
        let state = self.state.lock().await;
        NodeStatus {
            node_id: self.id,
            role: state.role,
            term: state.current_term,
            leader_id: state.leader_id,
            commit_index: state.commit_index,
            last_applied: state.last_applied,
            last_log_index: state.last_log_index(),
            snapshot_index: state.snapshot_index(),
        }
    }

    /// Start agreement on `command`.
    ///
    /// Returns the index the command will occupy if it is ever committed and
    /// the current term. The entry is durable before this returns, but the
    /// call does not wait for replication; commitment (or loss after a
    /// leadership change) shows up on the apply channel.
    pub async fn submit(&self, command: Vec<u8>) -> Result<(u64, u64)> {
        let mut state = self.state.lock().await;
        if self.is_shutdown() || state.role != RaftRole::Leader {
            return Err(RaftError::NotLeader {
                term: state.current_term,
                leader_hint: state.leader_id.filter(|&id| id != self.id),
            });
        }

        let term = state.current_term;
        let index = state.append_entry(command);
        if let Err(e) = self.persist(&mut state) {
            state.truncate_from(index);
            return Err(e);
        }
        drop(state);

        tracing::debug!(node_id = self.id, index, term, "Appended command to log");
        self.replicate_wake.notify_one();
        Ok((index, term))
    }

    /// Logically kill the node. Idempotent.
    ///
    /// Background loops exit once they observe the signal. The node keeps
    /// answering RPCs with its last known term but never grants a vote or
    /// acts as leader again.
    pub async fn shutdown(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();

        let mut state = self.state.lock().await;
        if state.role != RaftRole::Follower {
            state.role = RaftRole::Follower;
            state.votes_received = 0;
            state.next_index.clear();
            state.match_index.clear();
        }
        tracing::info!(node_id = self.id, term = state.current_term, "Raft node shut down");
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Handle incoming RequestVote RPC
    pub async fn handle_request_vote(&self, req: VoteRequest) -> Result<VoteResponse> {
        let mut state = self.state.lock().await;
        if self.is_shutdown() {
            return Ok(VoteResponse {
                term: state.current_term,
                vote_granted: false,
            });
        }

        let (response, effects) = rpc::handle_request_vote(&mut state, &req, self.id);
        self.apply_effects(&mut state, effects)?;
        Ok(response)
    }

    /// Handle incoming AppendEntries RPC
    pub async fn handle_append_entries(
        &self,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse> {
        let mut state = self.state.lock().await;
        if self.is_shutdown() {
            return Ok(AppendEntriesResponse {
                term: state.current_term,
                success: false,
                conflict_term: 0,
                conflict_index: 0,
            });
        }

        let (response, effects) = rpc::handle_append_entries(&mut state, req, self.id);
        self.apply_effects(&mut state, effects)?;
        Ok(response)
    }

    /// Handle incoming InstallSnapshot RPC
    pub async fn handle_install_snapshot(
        &self,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse> {
        let mut state = self.state.lock().await;
        if self.is_shutdown() {
            return Ok(InstallSnapshotResponse {
                term: state.current_term,
            });
        }

        let (response, effects) = rpc::handle_install_snapshot(&mut state, req, self.id);
        self.apply_effects(&mut state, effects)?;
        Ok(response)
    }

    /// Carry out handler side effects. Persistence comes first so nothing is
    /// acknowledged that a restart could forget, including changes left
    /// unsaved by an earlier failed write.
    fn apply_effects(&self, state: &mut RaftState, effects: Effects) -> Result<()> {
        if effects.persist || state.needs_persist {
            self.persist(state).inspect_err(|e| {
                tracing::error!(node_id = self.id, error = %e, "Failed to persist raft state");
            })?;
        }
        if effects.reset_timer {
            self.timer.reset(&mut state.election_deadline);
        }
        if effects.commit_advanced || effects.snapshot_received {
            self.apply_wake.notify_one();
        }
        Ok(())
    }

    /// Save term, vote and log. A failed save leaves `needs_persist` set until
    /// a later save succeeds.
    pub(crate) fn persist(&self, state: &mut RaftState) -> Result<()> {
        let saved = self.persister.save_state(state.encode_persistent());
        state.needs_persist = saved.is_err();
        saved
    }

    /// Save term, vote and log together with a snapshot of everything up to
    /// the log sentinel, and keep the snapshot for lagging followers.
    pub(crate) fn persist_with_snapshot(
        &self,
        state: &mut RaftState,
        snapshot: Vec<u8>,
    ) -> Result<()> {
        state.snapshot_data = snapshot;
        self.persister
            .save_state_and_snapshot(state.encode_persistent(), state.snapshot_data.clone())?;
        state.needs_persist = false;
        Ok(())
    }

    /// Adopt a higher term seen in a reply and fall back to follower.
    pub(crate) fn step_down(&self, state: &mut RaftState, term: u64) {
        let previous = state.role;
        state.become_follower(term);
        if let Err(e) = self.persist(state) {
            tracing::error!(node_id = self.id, error = %e, "Failed to persist new term");
        }
        self.timer.reset(&mut state.election_deadline);
        tracing::info!(
            node_id = self.id,
            term,
            previous_role = %previous,
            "Observed higher term, stepping down"
        );
    }

    /// Majority of the full cluster, this node included.
    pub(crate) fn quorum(&self) -> u64 {
        (self.config.cluster_size() / 2 + 1) as u64
    }
}

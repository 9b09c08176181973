use std::sync::Arc;
use std::time::Duration;

use crate::proto::{
    self, AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest,
};
use crate::raft::node::RaftNode;
use crate::raft::state::{RaftRole, RaftState};

/// Maximum number of entries carried by one AppendEntries request.
pub const MAX_ENTRIES_PER_APPEND: usize = 512;

impl RaftNode {
    /// Replication task for one leadership tenure. Every heartbeat tick, or
    /// right after a submission, sends each peer what it is missing. Exits as
    /// soon as this node is no longer leader of `term`.
    pub(crate) async fn run_replication(self: Arc<Self>, term: u64) {
        let interval = Duration::from_millis(self.config.heartbeat_interval_ms);

        loop {
            {
                let mut state = self.state.lock().await;
                if self.is_shutdown() || state.role != RaftRole::Leader || state.current_term != term
                {
                    break;
                }
                // Without peers no reply ever arrives to advance the commit index
                if self.peer_ids.is_empty() && state.advance_leader_commit(1) {
                    self.apply_wake.notify_one();
                }
                self.broadcast(&state);
            }

            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.replicate_wake.notified() => {}
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::debug!(node_id = self.id, term, "Leadership tenure ended, replication stopped");
    }

    /// Fan out one independent send per peer.
    fn broadcast(self: &Arc<Self>, state: &RaftState) {
        for &peer_id in &self.peer_ids {
            let next = state
                .next_index
                .get(&peer_id)
                .copied()
                .unwrap_or(state.last_log_index() + 1)
                .min(state.last_log_index() + 1);

            if next <= state.snapshot_index() {
                // The entries this peer needs were compacted away
                let req = InstallSnapshotRequest {
                    term: state.current_term,
                    leader_id: self.id,
                    last_included_index: state.snapshot_index(),
                    last_included_term: state.snapshot_term(),
                    data: state.snapshot_data.clone(),
                };
                tokio::spawn(self.clone().send_snapshot(peer_id, req));
                continue;
            }

            let prev_log_index = next - 1;
            let entries: Vec<proto::LogEntry> = state
                .get_entries_batch(next, MAX_ENTRIES_PER_APPEND)
                .into_iter()
                .map(proto::LogEntry::from)
                .collect();
            let req = AppendEntriesRequest {
                term: state.current_term,
                leader_id: self.id,
                prev_log_index,
                prev_log_term: state.term_at(prev_log_index).unwrap_or(0),
                entries,
                leader_commit: state.commit_index,
            };
            tokio::spawn(self.clone().send_append_entries(peer_id, req));
        }
    }

    async fn send_append_entries(self: Arc<Self>, peer_id: u64, req: AppendEntriesRequest) {
        let sent_term = req.term;
        let prev_log_index = req.prev_log_index;
        let entries_sent = req.entries.len() as u64;

        let resp = match self.transport.append_entries(peer_id, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::trace!(node_id = self.id, peer_id, error = %e, "AppendEntries failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        if self.is_shutdown() {
            return;
        }
        if resp.term > state.current_term {
            self.step_down(&mut state, resp.term);
            return;
        }

        let commit_advanced = handle_append_entries_reply(
            &mut state,
            peer_id,
            sent_term,
            prev_log_index,
            entries_sent,
            &resp,
            self.config.cluster_size(),
        );
        if commit_advanced {
            tracing::debug!(
                node_id = self.id,
                commit_index = state.commit_index,
                "Updated commit index"
            );
            self.apply_wake.notify_one();
        }
    }

    async fn send_snapshot(self: Arc<Self>, peer_id: u64, req: InstallSnapshotRequest) {
        let sent_term = req.term;
        let last_included_index = req.last_included_index;

        let resp = match self.transport.install_snapshot(peer_id, req).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer_id, error = %e, "InstallSnapshot failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        if self.is_shutdown() {
            return;
        }
        if resp.term > state.current_term {
            self.step_down(&mut state, resp.term);
            return;
        }

        tracing::debug!(node_id = self.id, peer_id, last_included_index, "Peer accepted snapshot");
        if handle_install_snapshot_reply(
            &mut state,
            peer_id,
            sent_term,
            last_included_index,
            self.config.cluster_size(),
        ) {
            self.apply_wake.notify_one();
        }
    }
}

fn still_leading(state: &RaftState, sent_term: u64) -> bool {
    state.role == RaftRole::Leader && state.current_term == sent_term
}

fn record_match(state: &mut RaftState, peer_id: u64, matched: u64) {
    let entry = state.match_index.entry(peer_id).or_insert(0);
    if matched > *entry {
        *entry = matched;
    }
    let next = *entry + 1;
    state.next_index.insert(peer_id, next);
}

/// Leader-side processing of an AppendEntries reply whose term is not newer
/// than ours. Replies from an earlier tenure are ignored. Returns true if the
/// commit index advanced.
pub fn handle_append_entries_reply(
    state: &mut RaftState,
    peer_id: u64,
    sent_term: u64,
    prev_log_index: u64,
    entries_sent: u64,
    resp: &AppendEntriesResponse,
    cluster_size: usize,
) -> bool {
    if !still_leading(state, sent_term) {
        return false;
    }

    if resp.success {
        record_match(state, peer_id, prev_log_index + entries_sent);
        return state.advance_leader_commit(cluster_size);
    }

    if resp.conflict_index == 0 {
        // No hint (the peer is shutting down); retry unchanged next tick
        return false;
    }

    // Fast backtrack: skip the whole conflicting term in one step
    let hinted = if resp.conflict_term != 0 {
        state
            .last_index_of_term(resp.conflict_term)
            .map(|index| index + 1)
            .unwrap_or(resp.conflict_index)
    } else {
        resp.conflict_index
    };

    let floor = state.match_index.get(&peer_id).copied().unwrap_or(0) + 1;
    let current = state
        .next_index
        .get(&peer_id)
        .copied()
        .unwrap_or(state.last_log_index() + 1);
    let next = hinted.min(current).max(floor);
    if next != current {
        tracing::trace!(peer_id, from = current, to = next, "Backing off next_index");
        state.next_index.insert(peer_id, next);
    }
    false
}

/// Leader-side processing of an InstallSnapshot reply. Returns true if the
/// commit index advanced.
pub fn handle_install_snapshot_reply(
    state: &mut RaftState,
    peer_id: u64,
    sent_term: u64,
    last_included_index: u64,
    cluster_size: usize,
) -> bool {
    if !still_leading(state, sent_term) {
        return false;
    }
    record_match(state, peer_id, last_included_index);
    state.advance_leader_commit(cluster_size)
}

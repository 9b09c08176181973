use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use crate::raft::state::{LogEntry, PendingSnapshot, RaftRole, RaftState};

/// Side effects a handler asks the node to carry out before replying.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Effects {
    /// Term, vote or log changed and must be saved before the reply leaves.
    pub persist: bool,
    /// The election deadline must be pushed back.
    pub reset_timer: bool,
    /// Commit index moved, the applier has work.
    pub commit_advanced: bool,
    /// A leader snapshot is waiting for the applier.
    pub snapshot_received: bool,
}

/// Adopt `term` if it is newer and fall back to follower.
/// Returns true if the persistent term changed.
fn observe_term(state: &mut RaftState, term: u64) -> bool {
    if term > state.current_term {
        state.become_follower(term);
        true
    } else {
        false
    }
}

/// Handle RequestVote RPC
pub fn handle_request_vote(
    state: &mut RaftState,
    req: &VoteRequest,
    my_id: u64,
) -> (VoteResponse, Effects) {
    let mut effects = Effects::default();

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        tracing::debug!(
            node_id = my_id,
            candidate = req.candidate_id,
            term = req.term,
            current_term = state.current_term,
            "Rejecting vote for stale term"
        );
        return (
            VoteResponse {
                term: state.current_term,
                vote_granted: false,
            },
            effects,
        );
    }

    // If request term is greater, update our term and become follower
    if observe_term(state, req.term) {
        effects.persist = true;
        effects.reset_timer = true;
    }

    let vote_granted = if state.voted_for.is_some() && state.voted_for != Some(req.candidate_id) {
        // Already voted for someone else in this term
        false
    } else if !state.is_log_up_to_date(req.last_log_index, req.last_log_term) {
        // Candidate's log is not up-to-date
        false
    } else {
        if state.voted_for != Some(req.candidate_id) {
            state.voted_for = Some(req.candidate_id);
            effects.persist = true;
        }
        effects.reset_timer = true;
        true
    };

    tracing::debug!(
        node_id = my_id,
        candidate = req.candidate_id,
        term = req.term,
        granted = vote_granted,
        "RequestVote response"
    );

    (
        VoteResponse {
            term: state.current_term,
            vote_granted,
        },
        effects,
    )
}

/// Handle AppendEntries RPC
pub fn handle_append_entries(
    state: &mut RaftState,
    req: AppendEntriesRequest,
    my_id: u64,
) -> (AppendEntriesResponse, Effects) {
    let mut effects = Effects::default();

    // Reject if request term is less than our current term
    if req.term < state.current_term {
        return (reject(state.current_term, 0, 0), effects);
    }

    // Valid AppendEntries from the leader of this term
    effects.persist = observe_term(state, req.term);
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);
    effects.reset_timer = true;

    // Check if we have the prev_log entry
    if req.prev_log_index > state.last_log_index() {
        let conflict_index = state.last_log_index() + 1;
        tracing::trace!(
            node_id = my_id,
            prev_log_index = req.prev_log_index,
            conflict_index,
            "Log too short for AppendEntries"
        );
        return (reject(state.current_term, 0, conflict_index), effects);
    }
    if let Some(term) = state.term_at(req.prev_log_index) {
        if term != req.prev_log_term {
            let conflict_index = state.first_index_of_term(term, req.prev_log_index);
            tracing::debug!(
                node_id = my_id,
                prev_log_index = req.prev_log_index,
                conflict_term = term,
                conflict_index,
                "Log mismatch at prev_log_index"
            );
            return (reject(state.current_term, term, conflict_index), effects);
        }
    }
    // prev_log_index below our snapshot point is part of the committed prefix

    let last_new_index = req.prev_log_index + req.entries.len() as u64;
    if !req.entries.is_empty() {
        let count = req.entries.len();
        let entries: Vec<LogEntry> = req.entries.into_iter().map(LogEntry::from).collect();
        if state.merge_entries(entries) {
            effects.persist = true;
            tracing::debug!(
                node_id = my_id,
                entries_received = count,
                new_last_index = state.last_log_index(),
                "Appended entries"
            );
        }
    }

    if state.advance_follower_commit(req.leader_commit, last_new_index) {
        effects.commit_advanced = true;
        tracing::trace!(
            node_id = my_id,
            commit_index = state.commit_index,
            "Follower commit index advanced"
        );
    }

    (
        AppendEntriesResponse {
            term: state.current_term,
            success: true,
            conflict_term: 0,
            conflict_index: 0,
        },
        effects,
    )
}

fn reject(term: u64, conflict_term: u64, conflict_index: u64) -> AppendEntriesResponse {
    AppendEntriesResponse {
        term,
        success: false,
        conflict_term,
        conflict_index,
    }
}

/// Handle InstallSnapshot RPC. The snapshot is only queued here; it takes
/// effect once the application accepts it through `cond_install_snapshot`.
pub fn handle_install_snapshot(
    state: &mut RaftState,
    req: InstallSnapshotRequest,
    my_id: u64,
) -> (InstallSnapshotResponse, Effects) {
    let mut effects = Effects::default();

    if req.term < state.current_term {
        return (
            InstallSnapshotResponse {
                term: state.current_term,
            },
            effects,
        );
    }

    effects.persist = observe_term(state, req.term);
    if state.role != RaftRole::Follower {
        state.become_follower(req.term);
    }
    state.leader_id = Some(req.leader_id);
    effects.reset_timer = true;

    let newer_than_pending = state
        .pending_snapshot
        .as_ref()
        .map_or(true, |p| req.last_included_index > p.index);

    if req.last_included_index > state.commit_index && newer_than_pending {
        tracing::info!(
            node_id = my_id,
            leader = req.leader_id,
            last_included_index = req.last_included_index,
            last_included_term = req.last_included_term,
            "Received snapshot from leader"
        );
        state.pending_snapshot = Some(PendingSnapshot {
            term: req.last_included_term,
            index: req.last_included_index,
            data: req.data,
        });
        effects.snapshot_received = true;
    }

    (
        InstallSnapshotResponse {
            term: state.current_term,
        },
        effects,
    )
}

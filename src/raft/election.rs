use std::sync::Arc;

use tokio::time::Instant;

use crate::proto::VoteRequest;
use crate::raft::node::RaftNode;
use crate::raft::state::{RaftRole, RaftState};

impl RaftNode {
    /// Election waiter. Sleeps until the deadline or a reset, and starts an
    /// election when the deadline passes while this node is not the leader.
    pub(crate) async fn run_election_timer(self: Arc<Self>) {
        loop {
            let (role, deadline) = {
                let state = self.state.lock().await;
                (state.role, state.election_deadline)
            };

            if role == RaftRole::Leader {
                // Leaders have no deadline; losing leadership resets the timer
                tokio::select! {
                    _ = self.timer.wait_for_reset() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            tokio::select! {
                fired = self.timer.wait_until(deadline) => {
                    if fired {
                        self.on_election_timeout().await;
                    }
                }
                _ = self.shutdown.cancelled() => break,
            }
        }

        tracing::debug!(node_id = self.id, "Election timer stopped");
    }

    async fn on_election_timeout(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        // The deadline may have moved while we waited for the lock
        if self.is_shutdown()
            || state.role == RaftRole::Leader
            || Instant::now() < state.election_deadline
        {
            return;
        }
        self.start_election(&mut state);
    }

    /// Start a new election
    fn start_election(self: &Arc<Self>, state: &mut RaftState) {
        let previous = state.role;
        state.become_candidate(self.id);
        if let Err(e) = self.persist(state) {
            // Asking for votes without a durable self-vote could double vote after a crash
            tracing::error!(node_id = self.id, error = %e, "Failed to persist candidacy");
            return;
        }
        self.timer.reset(&mut state.election_deadline);

        let term = state.current_term;
        tracing::info!(
            node_id = self.id,
            term,
            previous_role = %previous,
            "Election timeout, starting election"
        );

        if state.votes_received >= self.quorum() {
            // Single-node cluster
            self.become_leader(state);
            return;
        }

        let req = VoteRequest {
            term,
            candidate_id: self.id,
            last_log_index: state.last_log_index(),
            last_log_term: state.last_log_term(),
        };
        for &peer_id in &self.peer_ids {
            tokio::spawn(self.clone().request_vote_from(peer_id, req.clone()));
        }
    }

    /// Ask one peer for its vote and count the reply against the election
    /// that sent it.
    async fn request_vote_from(self: Arc<Self>, peer_id: u64, req: VoteRequest) {
        let resp = match self.transport.request_vote(peer_id, req.clone()).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::debug!(node_id = self.id, peer_id, error = %e, "Vote request failed");
                return;
            }
        };

        let mut state = self.state.lock().await;
        // A killed node neither counts votes nor saves a newer term
        if self.is_shutdown() {
            return;
        }
        if resp.term > state.current_term {
            // Higher term seen, become follower
            self.step_down(&mut state, resp.term);
            return;
        }

        // Replies for a superseded election are discarded
        if state.role != RaftRole::Candidate || state.current_term != req.term {
            return;
        }

        if resp.vote_granted {
            state.votes_received += 1;
            tracing::debug!(
                node_id = self.id,
                peer_id,
                term = req.term,
                votes = state.votes_received,
                "Received vote"
            );
            if state.votes_received >= self.quorum() {
                self.become_leader(&mut state);
            }
        }
    }

    fn become_leader(self: &Arc<Self>, state: &mut RaftState) {
        state.become_leader(self.id, &self.peer_ids);
        let term = state.current_term;
        tracing::info!(
            node_id = self.id,
            term,
            votes = state.votes_received,
            last_log_index = state.last_log_index(),
            "Became leader"
        );
        tokio::spawn(self.clone().run_replication(term));
    }
}

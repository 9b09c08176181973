use std::sync::Arc;

use crate::raft::node::RaftNode;
use crate::raft::state::RaftState;

/// Message delivered to the application, strictly in log order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A committed log entry.
    Command { index: u64, command: Vec<u8> },
    /// A snapshot covering every entry up to and including `index`. The
    /// application must answer it with `RaftNode::cond_install_snapshot`
    /// before further messages are delivered.
    Snapshot { term: u64, index: u64, data: Vec<u8> },
}

impl ApplyMsg {
    pub fn index(&self) -> u64 {
        match self {
            ApplyMsg::Command { index, .. } | ApplyMsg::Snapshot { index, .. } => *index,
        }
    }
}

/// Collect the next messages to deliver and mark them applied.
///
/// A pending snapshot goes out alone and pauses delivery until the
/// application decides on it. Otherwise every committed, unapplied entry is
/// returned in order.
pub fn next_apply_batch(state: &mut RaftState) -> Vec<ApplyMsg> {
    if state.snapshot_in_flight {
        return Vec::new();
    }

    if let Some(snapshot) = state.pending_snapshot.take() {
        state.snapshot_in_flight = true;
        return vec![ApplyMsg::Snapshot {
            term: snapshot.term,
            index: snapshot.index,
            data: snapshot.data,
        }];
    }

    let mut batch = Vec::new();
    while state.last_applied < state.commit_index {
        let index = state.last_applied + 1;
        let Some(entry) = state.get_entry(index) else {
            break;
        };
        batch.push(ApplyMsg::Command {
            index,
            command: entry.command.clone(),
        });
        state.last_applied = index;
    }
    batch
}

impl RaftNode {
    /// The single consumer feeding the apply channel.
    pub(crate) async fn run_applier(self: Arc<Self>) {
        loop {
            let batch = {
                let mut state = self.state.lock().await;
                next_apply_batch(&mut state)
            };

            if batch.is_empty() {
                tokio::select! {
                    _ = self.apply_wake.notified() => continue,
                    _ = self.shutdown.cancelled() => break,
                }
            }

            if let (Some(first), Some(last)) = (batch.first(), batch.last()) {
                tracing::trace!(
                    node_id = self.id,
                    from = first.index(),
                    to = last.index(),
                    "Delivering committed entries"
                );
            }

            for msg in batch {
                tokio::select! {
                    sent = self.apply_tx.send(msg) => {
                        if sent.is_err() {
                            tracing::info!(node_id = self.id, "Apply channel closed, applier exiting");
                            return;
                        }
                    }
                    _ = self.shutdown.cancelled() => return,
                }
            }
        }

        tracing::debug!(node_id = self.id, "Applier stopped");
    }
}

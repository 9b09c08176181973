use crate::error::Result;
use crate::raft::node::RaftNode;

impl RaftNode {
    /// Answer an `ApplyMsg::Snapshot`: returns true if the application should
    /// switch to the snapshot.
    ///
    /// A snapshot at or below the commit index is stale (the log already
    /// delivers those entries), unless it is exactly this node's own snapshot
    /// baseline, as delivered after a restart. A newer snapshot is installed:
    /// the log is cut back to it and state plus snapshot are persisted.
    /// Either way, apply delivery resumes afterwards.
    pub async fn cond_install_snapshot(
        &self,
        last_included_term: u64,
        last_included_index: u64,
        snapshot: Vec<u8>,
    ) -> Result<bool> {
        let mut state = self.state.lock().await;
        state.snapshot_in_flight = false;

        let accepted = if last_included_index <= state.commit_index {
            last_included_index == state.snapshot_index()
                && last_included_term == state.snapshot_term()
        } else {
            state.compact_to(last_included_term, last_included_index);
            if state
                .pending_snapshot
                .as_ref()
                .is_some_and(|p| p.index <= last_included_index)
            {
                state.pending_snapshot = None;
            }
            self.persist_with_snapshot(&mut state, snapshot)?;
            tracing::info!(
                node_id = self.id,
                last_included_index,
                last_included_term,
                "Installed snapshot"
            );
            true
        };
        drop(state);

        if !accepted {
            tracing::debug!(
                node_id = self.id,
                last_included_index,
                "Declined stale snapshot"
            );
        }
        self.apply_wake.notify_one();
        Ok(accepted)
    }

    /// The application has a snapshot of everything up to and including
    /// `index`; drop those entries from the log.
    ///
    /// Ignored if `index` is not newer than the current snapshot or has not
    /// been applied yet.
    pub async fn snapshot(&self, index: u64, snapshot: Vec<u8>) -> Result<()> {
        let mut state = self.state.lock().await;
        if index <= state.snapshot_index() || index > state.last_applied {
            tracing::debug!(
                node_id = self.id,
                index,
                snapshot_index = state.snapshot_index(),
                last_applied = state.last_applied,
                "Ignoring snapshot request"
            );
            return Ok(());
        }

        let Some(term) = state.term_at(index) else {
            return Ok(());
        };
        state.compact_to(term, index);
        self.persist_with_snapshot(&mut state, snapshot)?;

        tracing::info!(
            node_id = self.id,
            index,
            term,
            remaining_entries = state.log.len() - 1,
            "Compacted log"
        );
        Ok(())
    }
}

use std::collections::HashMap;

use prost::Message;
use tokio::time::Instant;

use crate::error::Result;
use crate::proto;

/// Raft node role
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaftRole {
    Follower,
    Candidate,
    Leader,
}

impl std::fmt::Display for RaftRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RaftRole::Follower => write!(f, "follower"),
            RaftRole::Candidate => write!(f, "candidate"),
            RaftRole::Leader => write!(f, "leader"),
        }
    }
}

/// A single entry in the Raft log. The command is opaque to the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub term: u64,
    pub index: u64,
    pub command: Vec<u8>,
}

impl LogEntry {
    fn sentinel(term: u64, index: u64) -> Self {
        Self {
            term,
            index,
            command: Vec::new(),
        }
    }
}

impl From<&LogEntry> for proto::LogEntry {
    fn from(entry: &LogEntry) -> Self {
        proto::LogEntry {
            term: entry.term,
            index: entry.index,
            command: entry.command.clone(),
        }
    }
}

impl From<LogEntry> for proto::LogEntry {
    fn from(entry: LogEntry) -> Self {
        proto::LogEntry {
            term: entry.term,
            index: entry.index,
            command: entry.command,
        }
    }
}

impl From<proto::LogEntry> for LogEntry {
    fn from(entry: proto::LogEntry) -> Self {
        LogEntry {
            term: entry.term,
            index: entry.index,
            command: entry.command,
        }
    }
}

/// A snapshot handed over by the leader that the applier has not delivered yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingSnapshot {
    pub term: u64,
    pub index: u64,
    pub data: Vec<u8>,
}

/// Node state guarded by the node lock.
///
/// # Raft Safety Invariants
///
/// ## Election Safety
/// At most one leader can be elected in a given term. Enforced by:
/// - Each node votes for at most one candidate per term (`voted_for`), and the
///   vote is only cleared when `current_term` advances
/// - Candidate must receive a strict majority of votes for the same term
///
/// ## Log Matching
/// If two logs contain an entry with the same index and term, then the logs
/// are identical in all entries up through that index. Enforced by:
/// - `AppendEntries` consistency check (prev_log_index, prev_log_term)
/// - Only conflicting suffixes are truncated, matching entries are kept
///
/// ## Leader Completeness
/// - Vote restriction: candidates must have up-to-date logs (`is_log_up_to_date`)
/// - Leaders only commit entries from their current term by counting replicas
///
/// ## Log layout
/// `log[0]` is a sentinel holding the `(term, index)` of the last compacted
/// entry, `(0, 0)` when nothing was compacted. The entry with absolute index
/// `i` lives at `log[i - snapshot_index()]`.
#[derive(Debug)]
pub struct RaftState {
    // Persistent state
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub log: Vec<LogEntry>,

    // Volatile state on all servers
    pub commit_index: u64,
    pub last_applied: u64,
    pub election_deadline: Instant,

    // Volatile state on leaders (reinitialized after election)
    pub next_index: HashMap<u64, u64>,
    pub match_index: HashMap<u64, u64>,

    // Current role
    pub role: RaftRole,

    // Known leader (if any)
    pub leader_id: Option<u64>,

    // Votes received in the election for `current_term` (for candidates)
    pub votes_received: u64,

    // Snapshot received from a leader, waiting for the applier
    pub pending_snapshot: Option<PendingSnapshot>,

    // A snapshot was delivered and the application has not decided on it yet
    pub snapshot_in_flight: bool,

    // Application snapshot covering everything up to the log sentinel
    pub snapshot_data: Vec<u8>,

    // Term, vote or log changed but the last save failed
    pub needs_persist: bool,
}

impl RaftState {
    pub fn new() -> Self {
        Self {
            current_term: 0,
            voted_for: None,
            log: vec![LogEntry::sentinel(0, 0)],
            commit_index: 0,
            last_applied: 0,
            election_deadline: Instant::now(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            role: RaftRole::Follower,
            leader_id: None,
            votes_received: 0,
            pending_snapshot: None,
            snapshot_in_flight: false,
            snapshot_data: Vec::new(),
            needs_persist: false,
        }
    }

    /// Rebuild state from bytes produced by [`RaftState::encode_persistent`].
    ///
    /// Empty input means a fresh node. Commit and apply progress restart at
    /// the snapshot baseline.
    pub fn restore(data: &[u8]) -> Result<Self> {
        let mut state = Self::new();
        if data.is_empty() {
            return Ok(state);
        }

        let persisted = proto::PersistentState::decode(data)?;
        state.current_term = persisted.current_term;
        state.voted_for = persisted.has_voted_for.then_some(persisted.voted_for);
        if !persisted.log.is_empty() {
            state.log = persisted.log.into_iter().map(LogEntry::from).collect();
        }
        state.commit_index = state.snapshot_index();
        state.last_applied = state.snapshot_index();
        Ok(state)
    }

    /// Encode the persistent fields (term, vote, log with sentinel).
    pub fn encode_persistent(&self) -> Vec<u8> {
        proto::PersistentState {
            current_term: self.current_term,
            has_voted_for: self.voted_for.is_some(),
            voted_for: self.voted_for.unwrap_or_default(),
            log: self.log.iter().map(proto::LogEntry::from).collect(),
        }
        .encode_to_vec()
    }

    /// Index of the last entry covered by the snapshot (0 if none)
    pub fn snapshot_index(&self) -> u64 {
        self.log[0].index
    }

    /// Term of the last entry covered by the snapshot (0 if none)
    pub fn snapshot_term(&self) -> u64 {
        self.log[0].term
    }

    /// Get the last log index
    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(0)
    }

    /// Get the last log term
    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(0)
    }

    fn position(&self, index: u64) -> Option<usize> {
        let offset = self.snapshot_index();
        if index < offset || index > self.last_log_index() {
            return None;
        }
        Some((index - offset) as usize)
    }

    /// Term of the entry at `index`, including the sentinel.
    /// `None` if the index was compacted away or lies past the end of the log.
    pub fn term_at(&self, index: u64) -> Option<u64> {
        self.position(index).map(|pos| self.log[pos].term)
    }

    /// Get log entry at index (1-indexed). The sentinel is not an entry.
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index() {
            return None;
        }
        self.position(index).map(|pos| &self.log[pos])
    }

    /// Get entries starting from index (inclusive)
    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.snapshot_index() + 1);
        match self.position(start) {
            Some(pos) => self.log[pos..].to_vec(),
            None => Vec::new(),
        }
    }

    /// Get at most `max` entries starting from index (inclusive)
    pub fn get_entries_batch(&self, start_index: u64, max: usize) -> Vec<LogEntry> {
        let start = start_index.max(self.snapshot_index() + 1);
        match self.position(start) {
            Some(pos) => {
                let end = self.log.len().min(pos + max);
                self.log[pos..end].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Append a new entry in the current term and return its index
    pub fn append_entry(&mut self, command: Vec<u8>) -> u64 {
        let index = self.last_log_index() + 1;
        self.log.push(LogEntry {
            term: self.current_term,
            index,
            command,
        });
        index
    }

    /// Drop every entry at `index` and after. The sentinel is never removed.
    pub fn truncate_from(&mut self, index: u64) {
        let keep = index.saturating_sub(self.snapshot_index()).max(1) as usize;
        self.log.truncate(keep);
    }

    /// Merge entries sent by a leader, starting right after a matched prefix.
    ///
    /// Entries already present with the same term are kept, so a delayed or
    /// duplicated request never shortens the log. Returns true if the log
    /// changed.
    pub fn merge_entries(&mut self, entries: Vec<LogEntry>) -> bool {
        let mut changed = false;
        for entry in entries {
            if entry.index <= self.snapshot_index() {
                continue;
            }
            match self.term_at(entry.index) {
                Some(term) if term == entry.term => continue,
                Some(_) => {
                    self.truncate_from(entry.index);
                    self.log.push(entry);
                    changed = true;
                }
                None => {
                    self.log.push(entry);
                    changed = true;
                }
            }
        }
        changed
    }

    /// First index of the run of entries with `term` ending at `index`.
    pub fn first_index_of_term(&self, term: u64, index: u64) -> u64 {
        let floor = self.snapshot_index() + 1;
        let mut first = index;
        while first > floor && self.term_at(first - 1) == Some(term) {
            first -= 1;
        }
        first
    }

    /// Last index in the log holding `term`, if any.
    pub fn last_index_of_term(&self, term: u64) -> Option<u64> {
        self.log
            .iter()
            .skip(1)
            .rev()
            .find(|e| e.term == term)
            .map(|e| e.index)
    }

    /// Check if candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_last_term = self.last_log_term();
        let our_last_index = self.last_log_index();

        // Candidate's log is up-to-date if:
        // 1. Their last term is greater, OR
        // 2. Terms are equal and their index is >= ours
        last_log_term > our_last_term
            || (last_log_term == our_last_term && last_log_index >= our_last_index)
    }

    /// Transition to follower state. The vote is only cleared when the term
    /// advances; a candidate that loses to a same-term leader keeps its vote.
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.role = RaftRole::Follower;
        self.votes_received = 0;
        self.next_index.clear();
        self.match_index.clear();
    }

    /// Transition to candidate state
    pub fn become_candidate(&mut self, my_id: u64) {
        self.role = RaftRole::Candidate;
        self.current_term += 1;
        self.voted_for = Some(my_id);
        self.votes_received = 1; // Vote for self
        self.leader_id = None;
    }

    /// Transition to leader state
    pub fn become_leader(&mut self, my_id: u64, peer_ids: &[u64]) {
        self.role = RaftRole::Leader;
        self.leader_id = Some(my_id);

        // Initialize next_index and match_index for all peers
        let next = self.last_log_index() + 1;
        self.next_index.clear();
        self.match_index.clear();
        for &peer_id in peer_ids {
            self.next_index.insert(peer_id, next);
            self.match_index.insert(peer_id, 0);
        }
    }

    /// Leader-side commit rule: advance `commit_index` to the highest index
    /// stored on a majority whose entry belongs to the current term.
    /// Returns true if the commit index moved.
    pub fn advance_leader_commit(&mut self, cluster_size: usize) -> bool {
        let majority = cluster_size / 2 + 1;
        let mut candidate = self.last_log_index();
        while candidate > self.commit_index {
            match self.term_at(candidate) {
                Some(term) if term == self.current_term => {
                    // The leader always holds its own entries
                    let replicas = 1 + self
                        .match_index
                        .values()
                        .filter(|&&m| m >= candidate)
                        .count();
                    if replicas >= majority {
                        self.commit_index = candidate;
                        return true;
                    }
                }
                // Older terms are only committed indirectly
                Some(term) if term < self.current_term => return false,
                _ => {}
            }
            candidate -= 1;
        }
        false
    }

    /// Follower-side commit rule. Never moves the commit index backwards.
    pub fn advance_follower_commit(&mut self, leader_commit: u64, last_new_index: u64) -> bool {
        let target = leader_commit.min(last_new_index);
        if target > self.commit_index {
            self.commit_index = target;
            true
        } else {
            false
        }
    }

    /// Make `(term, index)` the new log start. Entries after `index` are kept
    /// when the log agrees with the snapshot at `index`, otherwise the whole
    /// log is replaced by the sentinel.
    pub fn compact_to(&mut self, term: u64, index: u64) {
        if self.term_at(index) == Some(term) {
            let pos = (index - self.snapshot_index()) as usize;
            self.log.drain(..pos);
            self.log[0] = LogEntry::sentinel(term, index);
        } else {
            self.log = vec![LogEntry::sentinel(term, index)];
        }
        self.commit_index = self.commit_index.max(index);
        self.last_applied = self.last_applied.max(index);
    }
}

impl Default for RaftState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry {
            term,
            index,
            command: vec![index as u8],
        }
    }

    fn state_with_terms(terms: &[u64]) -> RaftState {
        let mut state = RaftState::new();
        for &term in terms {
            state.current_term = term;
            state.append_entry(Vec::new());
        }
        state
    }

    #[test]
    fn test_new_state_is_follower() {
        let state = RaftState::new();
        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 0);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.log.len(), 1);
        assert_eq!(state.last_log_index(), 0);
        assert_eq!(state.last_log_term(), 0);
    }

    #[test]
    fn test_become_candidate() {
        let mut state = RaftState::new();
        state.become_candidate(1);

        assert_eq!(state.role, RaftRole::Candidate);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
        assert_eq!(state.votes_received, 1); // Self-vote
        assert_eq!(state.leader_id, None);
    }

    #[test]
    fn test_become_leader() {
        let mut state = state_with_terms(&[1, 1]);
        state.become_candidate(1);
        state.become_leader(1, &[2, 3]);

        assert_eq!(state.role, RaftRole::Leader);
        assert_eq!(state.leader_id, Some(1));
        assert_eq!(state.next_index.get(&2), Some(&3));
        assert_eq!(state.next_index.get(&3), Some(&3));
        assert_eq!(state.match_index.get(&2), Some(&0));
    }

    #[test]
    fn test_become_follower_with_higher_term_clears_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(5);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 5);
        assert_eq!(state.voted_for, None);
        assert_eq!(state.votes_received, 0);
    }

    #[test]
    fn test_become_follower_same_term_keeps_vote() {
        let mut state = RaftState::new();
        state.become_candidate(1);
        state.become_follower(1);

        assert_eq!(state.role, RaftRole::Follower);
        assert_eq!(state.current_term, 1);
        assert_eq!(state.voted_for, Some(1));
    }

    #[test]
    fn test_append_and_lookup() {
        let state = state_with_terms(&[1, 2]);

        assert_eq!(state.last_log_index(), 2);
        assert_eq!(state.last_log_term(), 2);
        assert!(state.get_entry(0).is_none());
        assert_eq!(state.get_entry(1).unwrap().term, 1);
        assert_eq!(state.get_entry(2).unwrap().term, 2);
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.term_at(0), Some(0));
        assert_eq!(state.term_at(3), None);
    }

    #[test]
    fn test_get_entries_from() {
        let state = state_with_terms(&[1, 2, 3]);

        let entries = state.get_entries_from(2);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].index, 2);
        assert_eq!(entries[1].index, 3);

        assert_eq!(state.get_entries_from(0).len(), 3);
        assert!(state.get_entries_from(10).is_empty());
    }

    #[test]
    fn test_get_entries_batch_is_bounded() {
        let state = state_with_terms(&[1, 1, 1, 1]);

        let batch = state.get_entries_batch(2, 2);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].index, 2);
        assert_eq!(batch[1].index, 3);
        assert_eq!(state.get_entries_batch(4, 10).len(), 1);
        assert!(state.get_entries_batch(5, 10).is_empty());
    }

    #[test]
    fn test_merge_replaces_conflicting_suffix() {
        let mut state = state_with_terms(&[1, 1, 1]);

        let changed = state.merge_entries(vec![entry(2, 2), entry(2, 3), entry(2, 4)]);

        assert!(changed);
        let terms: Vec<u64> = state.log.iter().skip(1).map(|e| e.term).collect();
        assert_eq!(terms, vec![1, 2, 2, 2]);
    }

    #[test]
    fn test_merge_stale_request_keeps_longer_log() {
        let mut state = state_with_terms(&[1, 1, 1]);

        // A delayed request that only carries entry 2 must not drop entry 3
        let stale = state.get_entry(2).unwrap().clone();
        let changed = state.merge_entries(vec![stale]);

        assert!(!changed);
        assert_eq!(state.last_log_index(), 3);
    }

    #[test]
    fn test_is_log_up_to_date() {
        let mut state = RaftState::new();

        // Empty log - any log is up-to-date
        assert!(state.is_log_up_to_date(0, 0));
        assert!(state.is_log_up_to_date(1, 1));

        state.current_term = 1;
        state.append_entry(Vec::new());
        state.current_term = 2;
        state.append_entry(Vec::new());

        // Higher term is always up-to-date
        assert!(state.is_log_up_to_date(1, 3));
        // Same term, same or higher index is up-to-date
        assert!(state.is_log_up_to_date(2, 2));
        assert!(state.is_log_up_to_date(3, 2));
        // Lower term is never up-to-date
        assert!(!state.is_log_up_to_date(5, 1));
        // Same term, lower index is not up-to-date
        assert!(!state.is_log_up_to_date(1, 2));
    }

    #[test]
    fn test_term_boundaries() {
        let state = state_with_terms(&[1, 2, 2, 2, 3]);

        assert_eq!(state.first_index_of_term(2, 4), 2);
        assert_eq!(state.first_index_of_term(1, 1), 1);
        assert_eq!(state.last_index_of_term(2), Some(4));
        assert_eq!(state.last_index_of_term(7), None);
    }

    #[test]
    fn test_leader_commit_requires_majority() {
        let mut state = state_with_terms(&[1, 1]);
        state.become_leader(1, &[2, 3, 4, 5]);

        state.match_index.insert(2, 2);
        assert!(!state.advance_leader_commit(5));
        assert_eq!(state.commit_index, 0);

        state.match_index.insert(3, 1);
        assert!(state.advance_leader_commit(5));
        assert_eq!(state.commit_index, 1);

        state.match_index.insert(3, 2);
        assert!(state.advance_leader_commit(5));
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_leader_does_not_commit_old_term_by_count() {
        let mut state = state_with_terms(&[1, 1]);
        state.current_term = 2;
        state.become_leader(1, &[2, 3]);
        state.match_index.insert(2, 2);
        state.match_index.insert(3, 2);

        // Entries from term 1 are replicated everywhere but must wait
        assert!(!state.advance_leader_commit(3));
        assert_eq!(state.commit_index, 0);

        // A current-term entry carries them forward
        state.append_entry(Vec::new());
        state.match_index.insert(2, 3);
        assert!(state.advance_leader_commit(3));
        assert_eq!(state.commit_index, 3);
    }

    #[test]
    fn test_follower_commit_is_monotonic() {
        let mut state = state_with_terms(&[1, 1, 1]);

        assert!(state.advance_follower_commit(5, 2));
        assert_eq!(state.commit_index, 2);
        assert!(!state.advance_follower_commit(1, 3));
        assert_eq!(state.commit_index, 2);
    }

    #[test]
    fn test_compact_keeps_matching_suffix() {
        let mut state = state_with_terms(&[1, 1, 2, 2]);
        state.commit_index = 3;
        state.last_applied = 3;

        state.compact_to(2, 3);

        assert_eq!(state.snapshot_index(), 3);
        assert_eq!(state.snapshot_term(), 2);
        assert_eq!(state.last_log_index(), 4);
        assert!(state.get_entry(3).is_none());
        assert_eq!(state.get_entry(4).unwrap().term, 2);
        assert_eq!(state.term_at(3), Some(2));
        assert_eq!(state.term_at(2), None);
        assert_eq!(state.get_entries_from(1).len(), 1);
    }

    #[test]
    fn test_compact_discards_divergent_log() {
        let mut state = state_with_terms(&[1, 1]);

        state.compact_to(3, 5);

        assert_eq!(state.log.len(), 1);
        assert_eq!(state.last_log_index(), 5);
        assert_eq!(state.commit_index, 5);
        assert_eq!(state.last_applied, 5);
    }

    #[test]
    fn test_truncate_never_removes_sentinel() {
        let mut state = state_with_terms(&[1, 1, 1]);
        state.compact_to(1, 1);

        state.truncate_from(1);

        assert_eq!(state.log.len(), 1);
        assert_eq!(state.last_log_index(), 1);
    }

    #[test]
    fn test_persistent_round_trip_restores_baseline() {
        let mut state = state_with_terms(&[1, 2, 2]);
        state.voted_for = Some(3);
        state.compact_to(1, 1);

        let restored = RaftState::restore(&state.encode_persistent()).unwrap();

        assert_eq!(restored.current_term, 2);
        assert_eq!(restored.voted_for, Some(3));
        assert_eq!(restored.log, state.log);
        assert_eq!(restored.commit_index, 1);
        assert_eq!(restored.last_applied, 1);
        assert_eq!(restored.role, RaftRole::Follower);
    }

    #[test]
    fn test_restore_from_empty_is_fresh() {
        let state = RaftState::restore(&[]).unwrap();
        assert_eq!(state.current_term, 0);
        assert_eq!(state.last_log_index(), 0);
    }
}

//! Snapshot and log compaction tests.
//!
//! Every test application snapshots its state every few entries, so leaders
//! compact their logs and lagging followers must be caught up through
//! InstallSnapshot.


use std::time::Duration;

use raft_lite::raft::RaftState;
use raft_lite::Persister;
use test_harness::{decode_snapshot, wait_for, TestCluster};

const SNAPSHOT_EVERY: u64 = 5;

fn cmd(n: u64) -> Vec<u8> {
    format!("cmd-{}", n).into_bytes()
}

/// Test 1: Applications compact the log and the snapshot is persisted with it
#[tokio::test]
async fn test_log_compaction() {
    let mut cluster = TestCluster::with_snapshots(3, SNAPSHOT_EVERY).await;

    let mut last = 0;
    for n in 1..=12 {
        last = cluster.one(&cmd(n), 3).await;
    }
    assert!(
        cluster
            .wait_for_applied(&cluster.ids(), last, Duration::from_secs(3))
            .await
    );

    for id in cluster.ids() {
        let compacted = wait_for(
            || async { cluster.node(id).status().await.snapshot_index >= 10 },
            Duration::from_secs(2),
            Duration::from_millis(20),
        )
        .await;
        assert!(compacted, "Node {} should have compacted through index 10", id);

        let status = cluster.node(id).status().await;
        let state = RaftState::restore(&cluster.persister(id).read_state().unwrap()).unwrap();
        assert_eq!(state.snapshot_index(), status.snapshot_index);
        assert!(
            state.log.len() as u64 <= status.last_log_index - status.snapshot_index + 1,
            "Compacted entries must not be persisted"
        );

        let snapshot = decode_snapshot(&cluster.persister(id).read_snapshot().unwrap());
        assert_eq!(snapshot.len() as u64, status.snapshot_index);
        assert_eq!(snapshot.get(&1), Some(&cmd(1)));
    }
    cluster.assert_no_apply_errors();

    cluster.shutdown().await;
}

/// Test 2: A follower that missed compacted entries is caught up by snapshot
#[tokio::test]
async fn test_install_snapshot_to_lagging_follower() {
    let mut cluster = TestCluster::with_snapshots(3, SNAPSHOT_EVERY).await;
    cluster.one(&cmd(0), 3).await;

    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Leader should be elected");
    let lagging = cluster
        .ids()
        .into_iter()
        .find(|&id| id != leader)
        .expect("Should have a follower");
    cluster.disconnect(lagging);

    for n in 1..=20 {
        cluster.one(&cmd(n), 2).await;
    }
    let leader = cluster
        .wait_for_leader(Duration::from_secs(5))
        .await
        .expect("Majority should have a leader");
    let leader_snapshot = cluster.node(leader).status().await.snapshot_index;
    assert!(
        leader_snapshot > cluster.node(lagging).last_applied() + 1,
        "Leader should have compacted past the lagging follower"
    );

    cluster.connect(lagging);
    let last = cluster.one(b"after", 3).await;

    assert!(
        cluster
            .wait_for_applied(&[lagging], last, Duration::from_secs(5))
            .await,
        "Lagging follower should catch up"
    );
    let installed = cluster.node(lagging).applied.lock().snapshots_installed;
    assert!(installed >= 1, "Follower should have installed a snapshot");

    // Snapshots go out from memory, not from storage on every heartbeat
    for id in cluster.ids() {
        assert_eq!(cluster.node(id).snapshot_reads(), 0, "Node {} reread its snapshot", id);
    }

    // The snapshot carried the same history the others applied
    for index in 1..=last {
        let (count, _) = cluster.n_committed(index);
        assert_eq!(count, 3, "Index {} missing on some node", index);
    }
    cluster.assert_no_apply_errors();

    cluster.shutdown().await;
}

/// Test 3: Restarted nodes rebuild from their snapshot before replaying the log
#[tokio::test]
async fn test_restart_from_snapshot() {
    let mut cluster = TestCluster::with_snapshots(3, SNAPSHOT_EVERY).await;

    for n in 1..=13 {
        cluster.one(&cmd(n), 3).await;
    }
    assert!(
        cluster
            .wait_for_applied(&cluster.ids(), 13, Duration::from_secs(3))
            .await
    );

    for id in cluster.ids() {
        cluster.restart(id).await;
    }
    let last = cluster.one(b"after-restart", 3).await;
    assert_eq!(last, 14);

    assert!(
        cluster
            .wait_for_applied(&cluster.ids(), last, Duration::from_secs(5))
            .await
    );
    for id in cluster.ids() {
        let applied = cluster.node(id).applied.lock();
        assert_eq!(applied.snapshots_installed, 1, "Node {} should restore its snapshot", id);
        assert_eq!(applied.entries.get(&1), Some(&cmd(1)));
        assert_eq!(applied.entries.get(&13), Some(&cmd(13)));
    }
    cluster.assert_no_apply_errors();

    cluster.shutdown().await;
}

/// Test 4: Snapshots keep working with crashes and an unreliable network
#[tokio::test]
async fn test_snapshots_with_crashes_and_loss() {
    let mut cluster = TestCluster::with_snapshots(3, SNAPSHOT_EVERY).await;
    cluster.set_reliable(false);

    for round in 0..4 {
        let leader = cluster
            .wait_for_leader(Duration::from_secs(5))
            .await
            .expect("Leader should be elected");
        let victim = if round % 2 == 0 {
            leader
        } else {
            cluster
                .ids()
                .into_iter()
                .find(|&id| id != leader)
                .expect("Should have a follower")
        };

        for n in 0..3 {
            cluster.one(&cmd(round * 10 + n), 3).await;
        }
        cluster.crash(victim).await;
        for n in 3..8 {
            cluster.one(&cmd(round * 10 + n), 2).await;
        }
        cluster.restart(victim).await;
    }

    cluster.set_reliable(true);
    let last = cluster.one(b"final", 3).await;
    assert!(
        cluster
            .wait_for_applied(&cluster.ids(), last, Duration::from_secs(5))
            .await
    );
    cluster.assert_no_apply_errors();

    cluster.shutdown().await;
}

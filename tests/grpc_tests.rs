//! End-to-end tests over real gRPC sockets.
//!
//! Each node runs a `GrpcServer` on a loopback port and reaches its peers
//! through `GrpcTransport`.


use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;

use raft_lite::grpc::GrpcServer;
use raft_lite::proto::node_service_client::NodeServiceClient;
use raft_lite::proto::{GetStatusRequest, SubmitRequest};
use raft_lite::{ApplyMsg, GrpcTransport, MemoryPersister, NodeConfig, RaftNode};
use test_harness::wait_for;

struct GrpcNode {
    raft_node: Arc<RaftNode>,
    port: u16,
    shutdown: CancellationToken,
    server_handle: JoinHandle<()>,
    apply_rx: mpsc::Receiver<ApplyMsg>,
}

fn grpc_config(node_id: u64, port: u16, peers: &[(u64, u16)]) -> NodeConfig {
    let mut config = NodeConfig::new(node_id, format!("127.0.0.1:{}", port).parse().unwrap());
    for &(peer_id, peer_port) in peers.iter().filter(|(id, _)| *id != node_id) {
        config = config.with_peer(peer_id, format!("127.0.0.1:{}", peer_port));
    }
    config.election_timeout_min_ms = 300;
    config.election_timeout_max_ms = 600;
    config.heartbeat_interval_ms = 50;
    config.rpc_timeout_ms = 200;
    config
}

fn start_grpc_cluster(base_port: u16, size: u64) -> Vec<GrpcNode> {
    test_harness::init_tracing();
    let members: Vec<(u64, u16)> = (1..=size).map(|id| (id, base_port + id as u16)).collect();

    members
        .iter()
        .map(|&(node_id, port)| {
            let config = grpc_config(node_id, port, &members);
            let transport = Arc::new(GrpcTransport::new(&config).unwrap());
            let (tx, apply_rx) = mpsc::channel(64);
            let raft_node =
                RaftNode::start(config.clone(), Arc::new(MemoryPersister::new()), transport, tx)
                    .unwrap();

            let shutdown = CancellationToken::new();
            let server = GrpcServer::new(config.listen_addr, raft_node.clone());
            let token = shutdown.clone();
            let server_handle = tokio::spawn(async move {
                if let Err(e) = server.run(token).await {
                    tracing::error!("gRPC server error: {}", e);
                }
            });

            GrpcNode {
                raft_node,
                port,
                shutdown,
                server_handle,
                apply_rx,
            }
        })
        .collect()
}

async fn client(port: u16) -> NodeServiceClient<Channel> {
    let addr = format!("http://127.0.0.1:{}", port);
    for _ in 0..50 {
        if let Ok(client) = NodeServiceClient::connect(addr.clone()).await {
            return client;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("Could not connect to {}", addr);
}

async fn find_leader(nodes: &[GrpcNode]) -> Option<usize> {
    let elected = wait_for(
        || async {
            for node in nodes {
                if node.raft_node.is_leader().await {
                    return true;
                }
            }
            false
        },
        Duration::from_secs(10),
        Duration::from_millis(50),
    )
    .await;
    if !elected {
        return None;
    }
    for (i, node) in nodes.iter().enumerate() {
        if node.raft_node.is_leader().await {
            return Some(i);
        }
    }
    None
}

async fn stop(nodes: Vec<GrpcNode>) {
    for node in nodes {
        node.raft_node.shutdown().await;
        node.shutdown.cancel();
        let _ = node.server_handle.await;
    }
}

/// Test 1: A single node serves submit and status over gRPC
#[tokio::test]
async fn test_single_node_submit_and_status() {
    let mut nodes = start_grpc_cluster(51100, 1);
    find_leader(&nodes).await.expect("Single node should lead");

    let mut client = client(nodes[0].port).await;
    let resp = client
        .submit(SubmitRequest {
            command: b"hello".to_vec(),
        })
        .await
        .expect("Submit should succeed")
        .into_inner();
    assert_eq!(resp.index, 1);
    assert!(resp.term >= 1);

    let msg = tokio::time::timeout(Duration::from_secs(3), nodes[0].apply_rx.recv())
        .await
        .expect("Entry should be applied")
        .expect("Channel open");
    assert_eq!(
        msg,
        ApplyMsg::Command {
            index: 1,
            command: b"hello".to_vec()
        }
    );

    let status = client
        .get_status(GetStatusRequest {})
        .await
        .expect("Status should succeed")
        .into_inner();
    assert_eq!(status.node_id, 1);
    assert_eq!(status.role, "leader");
    assert!(status.has_leader);
    assert_eq!(status.leader_id, 1);
    assert_eq!(status.commit_index, 1);
    assert_eq!(status.last_log_index, 1);

    let err = client
        .submit(SubmitRequest { command: vec![] })
        .await
        .expect_err("Empty command should be rejected");
    assert_eq!(err.code(), tonic::Code::InvalidArgument);

    stop(nodes).await;
}

/// Test 2: Three nodes elect a leader and replicate over gRPC
#[tokio::test]
async fn test_three_node_cluster_over_grpc() {
    let mut nodes = start_grpc_cluster(51200, 3);
    let leader = find_leader(&nodes).await.expect("Leader should be elected");

    let mut leader_client = client(nodes[leader].port).await;
    for n in 1..=3u64 {
        let resp = leader_client
            .submit(SubmitRequest {
                command: format!("cmd-{}", n).into_bytes(),
            })
            .await
            .expect("Leader should accept")
            .into_inner();
        assert_eq!(resp.index, n);
    }

    for node in nodes.iter_mut() {
        for n in 1..=3u64 {
            let msg = tokio::time::timeout(Duration::from_secs(5), node.apply_rx.recv())
                .await
                .expect("Entry should be applied on every node")
                .expect("Channel open");
            assert_eq!(
                msg,
                ApplyMsg::Command {
                    index: n,
                    command: format!("cmd-{}", n).into_bytes()
                }
            );
        }
    }

    // Followers redirect clients with FailedPrecondition
    let follower = (0..nodes.len()).find(|&i| i != leader).unwrap();
    let mut follower_client = client(nodes[follower].port).await;
    let err = follower_client
        .submit(SubmitRequest {
            command: b"nope".to_vec(),
        })
        .await
        .expect_err("Follower should reject");
    assert_eq!(err.code(), tonic::Code::FailedPrecondition);

    let status = follower_client
        .get_status(GetStatusRequest {})
        .await
        .unwrap()
        .into_inner();
    assert_eq!(status.role, "follower");
    assert_eq!(status.leader_id, (leader + 1) as u64);

    stop(nodes).await;
}

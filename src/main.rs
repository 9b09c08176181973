use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing_subscriber::EnvFilter;

use raft_lite::config::{NodeConfig, PeerConfig};
use raft_lite::grpc::GrpcServer;
use raft_lite::proto::node_service_client::NodeServiceClient;
use raft_lite::proto::{GetStatusRequest, SubmitRequest};
use raft_lite::shutdown::install_shutdown_handler;
use raft_lite::{
    ApplyMsg, FilePersister, GrpcTransport, MemoryPersister, Persister, RaftNode, RaftTransport,
};

/// Capacity of the channel between the applier and the application.
const APPLY_CHANNEL_CAPACITY: usize = 1024;

#[derive(Parser, Debug)]
#[command(name = "raft-lite")]
#[command(version)]
#[command(about = "A single Raft consensus node with a gRPC front end")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Start a raft-lite server node
    Server(ServerArgs),

    /// Submit a command to the cluster leader
    Submit {
        #[command(flatten)]
        client: ClientArgs,

        /// Command payload (sent as UTF-8 bytes)
        command: String,
    },

    /// Show the raft status of one node
    Status {
        #[command(flatten)]
        client: ClientArgs,
    },
}

// =============================================================================
// Server Arguments
// =============================================================================

#[derive(Parser, Debug)]
struct ServerArgs {
    /// Node ID (unique identifier for this node)
    #[arg(long, default_value = "1")]
    node_id: u64,

    /// Port to listen on for gRPC
    #[arg(long, default_value = "50051")]
    port: u16,

    /// Peer addresses (comma-separated, format: "id:host:port")
    /// Example: "2:127.0.0.1:50052,3:127.0.0.1:50053"
    #[arg(long, default_value = "")]
    peers: String,

    /// Directory for durable raft state; state is kept in memory if omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Interval between leader heartbeats
    #[arg(long, default_value = "100")]
    heartbeat_ms: u64,

    /// Lower bound of the randomized election timeout
    #[arg(long, default_value = "500")]
    election_min_ms: u64,

    /// Upper bound of the randomized election timeout
    #[arg(long, default_value = "2500")]
    election_max_ms: u64,

    /// Per-RPC timeout for peer calls
    #[arg(long, default_value = "100")]
    rpc_timeout_ms: u64,

    /// Snapshot the demo state machine every N applied commands (0 disables)
    #[arg(long, default_value = "0")]
    snapshot_every: u64,
}

// =============================================================================
// Client Arguments (shared by submit and status)
// =============================================================================

#[derive(Parser, Debug)]
struct ClientArgs {
    /// Server address
    #[arg(long, short = 'a', default_value = "http://127.0.0.1:50051")]
    addr: String,
}

// =============================================================================
// Helper Functions
// =============================================================================

fn parse_peers(peers_str: &str) -> Vec<PeerConfig> {
    if peers_str.is_empty() {
        return Vec::new();
    }

    peers_str
        .split(',')
        .filter_map(|peer| {
            let parts: Vec<&str> = peer.trim().split(':').collect();
            if parts.len() == 3 {
                let node_id: u64 = parts[0].parse().ok()?;
                let addr = format!("{}:{}", parts[1], parts[2]);
                Some(PeerConfig { node_id, addr })
            } else {
                tracing::warn!(peer, "Invalid peer format, expected id:host:port");
                None
            }
        })
        .collect()
}

async fn connect(args: &ClientArgs) -> Result<NodeServiceClient<Channel>, Box<dyn std::error::Error>> {
    let channel = Channel::from_shared(args.addr.clone())?.connect().await?;
    Ok(NodeServiceClient::new(channel))
}

/// Demo state machine: counts applied commands and remembers the last one.
/// Its snapshot is the count as little-endian bytes.
#[derive(Debug, Default)]
struct CommandCounter {
    applied: u64,
    last_index: u64,
}

impl CommandCounter {
    fn encode(&self) -> Vec<u8> {
        self.applied.to_le_bytes().to_vec()
    }

    fn restore(&mut self, index: u64, data: &[u8]) {
        let mut buf = [0u8; 8];
        let len = data.len().min(8);
        buf[..len].copy_from_slice(&data[..len]);
        self.applied = u64::from_le_bytes(buf);
        self.last_index = index;
    }
}

/// Consume the apply channel until the node stops.
async fn run_state_machine(
    node: Arc<RaftNode>,
    mut apply_rx: mpsc::Receiver<ApplyMsg>,
    snapshot_every: u64,
    shutdown: CancellationToken,
) {
    let mut counter = CommandCounter::default();

    loop {
        let msg = tokio::select! {
            msg = apply_rx.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = shutdown.cancelled() => break,
        };
        match msg {
            ApplyMsg::Command { index, command } => {
                counter.applied += 1;
                counter.last_index = index;
                tracing::info!(
                    index,
                    command = %String::from_utf8_lossy(&command),
                    applied = counter.applied,
                    "Applied command"
                );

                if snapshot_every > 0 && counter.applied % snapshot_every == 0 {
                    if let Err(e) = node.snapshot(index, counter.encode()).await {
                        tracing::error!(error = %e, index, "Failed to snapshot");
                    }
                }
            }
            ApplyMsg::Snapshot { term, index, data } => {
                match node.cond_install_snapshot(term, index, data.clone()).await {
                    Ok(true) => {
                        counter.restore(index, &data);
                        tracing::info!(index, applied = counter.applied, "Restored from snapshot");
                    }
                    Ok(false) => {}
                    Err(e) => tracing::error!(error = %e, index, "Failed to install snapshot"),
                }
            }
        }
    }

    tracing::debug!(last_index = counter.last_index, "State machine stopped");
}

// =============================================================================
// Server Implementation
// =============================================================================

async fn run_server(args: ServerArgs) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let listen_addr: SocketAddr = format!("0.0.0.0:{}", args.port).parse()?;
    let config = NodeConfig {
        node_id: args.node_id,
        listen_addr,
        peers: parse_peers(&args.peers),
        election_timeout_min_ms: args.election_min_ms,
        election_timeout_max_ms: args.election_max_ms,
        heartbeat_interval_ms: args.heartbeat_ms,
        rpc_timeout_ms: args.rpc_timeout_ms,
        data_dir: args.data_dir,
    };
    config.validate()?;

    tracing::info!(
        node_id = config.node_id,
        listen_addr = %config.listen_addr,
        data_dir = ?config.data_dir,
        peers = ?config.peers.iter().map(|p| format!("{}:{}", p.node_id, p.addr)).collect::<Vec<_>>(),
        "Starting raft-lite node"
    );

    let persister: Arc<dyn Persister> = match &config.data_dir {
        Some(dir) => Arc::new(FilePersister::open(dir)?),
        None => {
            tracing::warn!("No --data-dir given, raft state will not survive a restart");
            Arc::new(MemoryPersister::new())
        }
    };
    let transport: Arc<dyn RaftTransport> = Arc::new(GrpcTransport::new(&config)?);
    let (apply_tx, apply_rx) = mpsc::channel(APPLY_CHANNEL_CAPACITY);

    let shutdown = install_shutdown_handler()?;
    let raft_node = RaftNode::start(config.clone(), persister, transport, apply_tx)?;
    let state_machine = tokio::spawn(run_state_machine(
        raft_node.clone(),
        apply_rx,
        args.snapshot_every,
        shutdown.clone(),
    ));

    let server = GrpcServer::new(config.listen_addr, raft_node.clone());
    let served = server.run(shutdown.clone()).await;

    shutdown.cancel();
    raft_node.shutdown().await;
    if let Err(e) = state_machine.await {
        tracing::warn!(error = %e, "State machine task failed");
    }

    served?;
    tracing::info!("Shutdown complete");
    Ok(())
}

// =============================================================================
// Client Command Handlers
// =============================================================================

async fn handle_submit(args: &ClientArgs, command: String) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(args).await?;
    match client
        .submit(SubmitRequest {
            command: command.into_bytes(),
        })
        .await
    {
        Ok(response) => {
            let resp = response.into_inner();
            println!("Command accepted");
            println!("Index: {}", resp.index);
            println!("Term:  {}", resp.term);
        }
        Err(status) => {
            eprintln!("Error: Submission failed: {}", status.message());
            if status.code() == tonic::Code::FailedPrecondition {
                eprintln!("Hint: Use -a to point at the leader, see `raft-lite status`");
            }
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn handle_status(args: &ClientArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut client = connect(args).await?;
    let status = client.get_status(GetStatusRequest {}).await?.into_inner();

    let leader = if status.has_leader {
        format!("Node {}", status.leader_id)
    } else {
        "unknown".to_string()
    };

    println!("Node Status");
    println!("{}", "=".repeat(40));
    println!("Node ID:        {}", status.node_id);
    println!("Role:           {}", status.role);
    println!("Term:           {}", status.term);
    println!("Leader:         {}", leader);
    println!("Commit Index:   {}", status.commit_index);
    println!("Last Applied:   {}", status.last_applied);
    println!("Last Log Index: {}", status.last_log_index);
    println!("Snapshot Index: {}", status.snapshot_index);
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Commands::Server(server_args) => run_server(server_args).await?,
        Commands::Submit { client, command } => handle_submit(&client, command).await?,
        Commands::Status { client } => handle_status(&client).await?,
    }

    Ok(())
}

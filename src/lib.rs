pub mod config;
pub mod error;
pub mod grpc;
pub mod persister;
pub mod raft;
pub mod shutdown;
pub mod transport;

// Re-export generated protobuf types
pub mod proto {
    tonic::include_proto!("raft");
}

pub use config::{NodeConfig, PeerConfig};
pub use error::{RaftError, Result};
pub use persister::{FilePersister, MemoryPersister, Persister};
pub use raft::{ApplyMsg, NodeStatus, RaftNode, RaftRole};
pub use transport::{GrpcTransport, MemoryNetwork, RaftTransport};

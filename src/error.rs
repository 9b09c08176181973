use thiserror::Error;

#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Not the leader (term {term}), last known leader is node {leader_hint:?}")]
    NotLeader { term: u64, leader_hint: Option<u64> },

    #[error("Network failure talking to node {peer_id}: {reason}")]
    Network { peer_id: u64, reason: String },

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to decode persisted state: {0}")]
    Decode(#[from] prost::DecodeError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Node has been shut down")]
    Shutdown,

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),
}

impl RaftError {
    pub fn network(peer_id: u64, reason: impl Into<String>) -> Self {
        RaftError::Network {
            peer_id,
            reason: reason.into(),
        }
    }
}

impl From<RaftError> for tonic::Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::NotLeader { .. } => tonic::Status::failed_precondition(err.to_string()),
            RaftError::Shutdown => tonic::Status::unavailable(err.to_string()),
            RaftError::GrpcError(status) => status,
            other => tonic::Status::internal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, RaftError>;

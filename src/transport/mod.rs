//! Outbound peer RPCs.
//!
//! A transport is an unreliable, at-most-once request/response channel: a
//! call either returns the peer's reply or an error, and an error says nothing
//! about whether the peer saw the request.

pub mod grpc;
pub mod memory;

use async_trait::async_trait;

use crate::error::Result;
use crate::proto::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};

pub use grpc::GrpcTransport;
pub use memory::{MemoryNetwork, MemoryTransport};

#[async_trait]
pub trait RaftTransport: Send + Sync + 'static {
    async fn request_vote(&self, peer_id: u64, req: VoteRequest) -> Result<VoteResponse>;

    async fn append_entries(
        &self,
        peer_id: u64,
        req: AppendEntriesRequest,
    ) -> Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        peer_id: u64,
        req: InstallSnapshotRequest,
    ) -> Result<InstallSnapshotResponse>;
}

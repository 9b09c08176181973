pub mod apply;
mod election;
pub mod node;
pub mod replication;
pub mod rpc;
mod snapshot;
pub mod state;
pub mod timer;

pub use apply::ApplyMsg;
pub use node::{NodeStatus, RaftNode};
pub use state::{LogEntry, RaftRole, RaftState};

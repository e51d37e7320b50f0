//! Worker to master RPC: wire messages, the master-side reactor, and the
//! worker-side failover proxy.

mod messages;
mod proxy;
mod reactor;

pub use messages::{
    CallId, ContainerHeartbeat, DeployState, HeartbeatResponse,
    OperatorDeployInfo, OperatorHeartbeat, UmbilicalReply, UmbilicalRequest,
};
pub use proxy::FailoverRpcProxy;
pub use reactor::{ConnId, WorkerCall, WorkerReactor};

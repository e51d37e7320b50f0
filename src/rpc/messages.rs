//! Worker to master RPC messages.

use crate::plan::{Checkpoint, NetAddr, OperatorId, OperatorStats};

use serde::{Deserialize, Serialize};

/// RPC call ID type, unique per proxy.
pub type CallId = u64;

/// Deployment state an operator reports for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployState {
    Active,
    Idle,
    Failed,
}

/// Per-operator part of a container heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorHeartbeat {
    pub operator_id: OperatorId,
    pub deploy_state: DeployState,
    pub current_window_id: u64,

    /// Checkpoint completed since the last heartbeat, if any.
    pub checkpoint: Option<Checkpoint>,

    pub stats: OperatorStats,
}

/// Periodic heartbeat a container sends to the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerHeartbeat {
    /// External id the container was allocated under.
    pub external_id: String,

    /// Data-plane buffer address, once the container is listening.
    pub buffer_addr: Option<NetAddr>,

    pub operators: Vec<OperatorHeartbeat>,
}

/// What a container should deploy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorDeployInfo {
    pub operator_id: OperatorId,

    /// Logical operator name.
    pub logical: String,

    /// Implementation class name.
    pub class: String,

    pub partition: u32,

    /// Checkpoint to restore from, if any.
    pub checkpoint: Option<Checkpoint>,
}

/// Deployment instructions returned for a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub deploy: Vec<OperatorDeployInfo>,
    pub undeploy: Vec<OperatorId>,

    /// True if the container should exit.
    pub shutdown: bool,
}

/// Request from a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UmbilicalRequest {
    Heartbeat(ContainerHeartbeat),

    /// Diagnostic log line from a container.
    Log { container: String, msg: String },

    /// Error report for some operators of a container.
    ReportError {
        container: String,
        operators: Vec<OperatorId>,
        msg: String,
    },
}

/// Reply from the master.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UmbilicalReply {
    Heartbeat(HeartbeatResponse),
    Ack,

    /// Application-level error; never retried by the proxy.
    Error(String),
}

/// Request frame on the wire.
pub(crate) type RequestFrame = (CallId, UmbilicalRequest);

/// Reply frame on the wire.
pub(crate) type ReplyFrame = (CallId, UmbilicalReply);

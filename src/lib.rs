//! Master-side recovery core of a streaming dataflow engine: journaled
//! physical plan state, snapshot/journal recovery, the cluster manager
//! control loop, and the worker RPC proxy that follows the master across
//! restarts.

#[macro_use]
mod utils;

pub mod journal;
pub mod manager;
pub mod plan;
pub mod recovery;
pub mod rpc;

pub use utils::{logger_init, DagError, ME};

pub use journal::{Journal, JournalEntry, RotationPolicy};
pub use manager::{ClusterManager, ManagerConfig, ManagerHandle};
pub use plan::{LogicalPlan, PhysicalPlan, PlanChange, PlanStateMachine};
pub use recovery::{FsStorageAgent, RecoveryStore, StorageAgent};
pub use rpc::FailoverRpcProxy;

//! Logical and physical plan model, its journaled mutations, and the plan
//! state machine.

mod context;
mod logical;
mod mutations;
mod physical;
mod placement;
mod statemach;

pub use context::{NoObservers, OperatorStats, PlanContext, StatsObserver};
pub use logical::{
    LogicalPlan, OperatorMeta, PlanChange, PortRef, StreamMeta,
    ATTR_APPLICATION_PATH, ATTR_CONTAINERS_MAX_COUNT,
    ATTR_CONTAINER_MEMORY_MB, ATTR_INITIAL_PARTITION_COUNT,
};
pub use mutations::{PurgeCheckpoints, SetContainerState, SetOperatorState};
pub use physical::{
    Checkpoint, Container, ContainerId, ContainerState, NetAddr, Operator,
    OperatorId, OperatorState, PartitionKeys, PhysicalPlan,
};
pub use placement::{PartitionSpec, Placer, RoundRobinPlacer};
pub use statemach::PlanStateMachine;

//! Journaled mutations of the physical plan.

use crate::journal::{JournalEntry, OpCode};
use crate::plan::physical::{
    Container, ContainerId, ContainerState, NetAddr, OperatorId,
    OperatorState, PhysicalPlan,
};
use crate::utils::DagError;

use serde::{Deserialize, Serialize};

/// Sets the lifecycle state of an operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetOperatorState {
    pub operator_id: OperatorId,
    pub state: OperatorState,
}

impl JournalEntry<PhysicalPlan> for SetOperatorState {
    const OPCODE: OpCode = 1;

    fn apply(&self, plan: &mut PhysicalPlan) -> Result<(), DagError> {
        let Some(op) = plan.operator_mut(self.operator_id) else {
            return logged_err!(
                "set state of unknown operator {}",
                self.operator_id
            );
        };
        op.state = self.state;
        Ok(())
    }
}

/// Overwrites every mutable field of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetContainerState {
    pub container_id: ContainerId,
    pub state: ContainerState,
    pub external_id: Option<String>,
    pub host: Option<String>,
    pub buffer_addr: Option<NetAddr>,
    pub required_memory_mb: u32,
    pub allocated_memory_mb: u32,
}

impl From<&Container> for SetContainerState {
    fn from(c: &Container) -> Self {
        SetContainerState {
            container_id: c.id,
            state: c.state,
            external_id: c.external_id.clone(),
            host: c.host.clone(),
            buffer_addr: c.buffer_addr.clone(),
            required_memory_mb: c.required_memory_mb,
            allocated_memory_mb: c.allocated_memory_mb,
        }
    }
}

impl JournalEntry<PhysicalPlan> for SetContainerState {
    const OPCODE: OpCode = 2;

    fn apply(&self, plan: &mut PhysicalPlan) -> Result<(), DagError> {
        let Some(c) = plan.container_mut(self.container_id) else {
            return logged_err!(
                "set state of unknown container {}",
                self.container_id
            );
        };
        c.state = self.state;
        c.external_id = self.external_id.clone();
        c.host = self.host.clone();
        c.buffer_addr = self.buffer_addr.clone();
        c.required_memory_mb = self.required_memory_mb;
        c.allocated_memory_mb = self.allocated_memory_mb;
        Ok(())
    }
}

/// Drops checkpoints of an operator older than a window id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PurgeCheckpoints {
    pub operator_id: OperatorId,
    pub below_window: u64,
}

impl JournalEntry<PhysicalPlan> for PurgeCheckpoints {
    const OPCODE: OpCode = 3;

    fn apply(&self, plan: &mut PhysicalPlan) -> Result<(), DagError> {
        let Some(op) = plan.operator_mut(self.operator_id) else {
            return logged_err!(
                "purge checkpoints of unknown operator {}",
                self.operator_id
            );
        };
        op.checkpoints.retain(|cp| cp.window_id >= self.below_window);
        Ok(())
    }
}

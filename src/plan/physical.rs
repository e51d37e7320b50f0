//! Physical plan: containers, partitioned operators, and checkpoints.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;

use crate::plan::logical::{LogicalPlan, PlanChange};
use crate::plan::placement::{PartitionSpec, Placer};
use crate::utils::DagError;

use serde::{Deserialize, Serialize};

/// Container ID type.
pub type ContainerId = u32;

/// Physical operator ID type.
pub type OperatorId = u32;

/// Container lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContainerState {
    New,
    Allocated,
    Active,
    Killed,
}

/// Physical operator lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperatorState {
    PendingDeploy,
    Active,
    Inactive,
}

/// Network address of a container's data-plane buffer service.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddr {
    pub host: String,
    pub port: u16,
}

impl NetAddr {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        NetAddr {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NetAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// A durable point an operator can resume from. Ordered by window id
/// first.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
)]
pub struct Checkpoint {
    pub window_id: u64,
    pub app_window_count: u32,
    pub checkpoint_window_count: u32,
}

impl Checkpoint {
    pub fn new(window_id: u64) -> Self {
        Checkpoint {
            window_id,
            app_window_count: 0,
            checkpoint_window_count: 0,
        }
    }
}

/// Partition keys of one input port: a tuple goes to this partition if
/// `hash & mask` is in `keys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionKeys {
    pub mask: u32,
    pub keys: BTreeSet<u32>,
}

/// A worker process slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub state: ContainerState,

    /// Resource-manager assigned id; unset until allocated.
    pub external_id: Option<String>,

    pub host: Option<String>,
    pub buffer_addr: Option<NetAddr>,
    pub required_memory_mb: u32,
    pub allocated_memory_mb: u32,

    /// Operators deployed to this container.
    pub operators: Vec<OperatorId>,
}

impl Container {
    fn new(id: ContainerId, required_memory_mb: u32) -> Self {
        Container {
            id,
            state: ContainerState::New,
            external_id: None,
            host: None,
            buffer_addr: None,
            required_memory_mb,
            allocated_memory_mb: 0,
            operators: vec![],
        }
    }

    /// Returns to `New` with allocation fields cleared, keeping the hosted
    /// operators.
    pub fn reset(&mut self) {
        self.state = ContainerState::New;
        self.external_id = None;
        self.host = None;
        self.buffer_addr = None;
        self.allocated_memory_mb = 0;
    }
}

/// One partition of a logical operator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operator {
    pub id: OperatorId,

    /// Logical operator name.
    pub logical: String,

    pub partition: u32,

    /// Map from input port name -> partition keys; empty if unpartitioned.
    pub partition_keys: BTreeMap<String, PartitionKeys>,

    /// Owning container (lookup only).
    pub container: ContainerId,

    pub state: OperatorState,

    /// Checkpoint history, non-decreasing in window id.
    pub checkpoints: Vec<Checkpoint>,
}

impl Operator {
    /// Appends a checkpoint. Returns `Ok(false)` if the window id is already
    /// the most recent one, and errors if it is older.
    pub fn add_checkpoint(
        &mut self,
        checkpoint: Checkpoint,
    ) -> Result<bool, DagError> {
        if let Some(last) = self.checkpoints.last() {
            if last.window_id == checkpoint.window_id {
                return Ok(false);
            }
            if last.window_id > checkpoint.window_id {
                return logged_err!(
                    "checkpoint {} older than {} on operator {}",
                    checkpoint.window_id,
                    last.window_id,
                    self.id
                );
            }
        }
        self.checkpoints.push(checkpoint);
        Ok(true)
    }

    /// Most recent checkpoint, if any.
    pub fn recent_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoints.last()
    }
}

/// The physical plan derived from a logical plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhysicalPlan {
    logical: LogicalPlan,
    containers: BTreeMap<ContainerId, Container>,
    operators: BTreeMap<OperatorId, Operator>,
    next_container_id: ContainerId,
    next_operator_id: OperatorId,
}

impl PhysicalPlan {
    /// Builds the physical plan of a logical plan: every logical operator
    /// is split into its partitions, which the placer groups into
    /// containers.
    pub fn from_logical(
        logical: LogicalPlan,
        placer: &dyn Placer,
    ) -> Result<Self, DagError> {
        let max_containers = logical.max_containers();
        let names: Vec<String> = logical.operators.keys().cloned().collect();
        let mut plan = PhysicalPlan {
            logical,
            containers: BTreeMap::new(),
            operators: BTreeMap::new(),
            next_container_id: 1,
            next_operator_id: 1,
        };
        plan.place_operators(&names, placer, max_containers)?;
        Ok(plan)
    }

    /// Partition keys of every connected input port of a partitioned
    /// logical operator. All `mask + 1` key values are dealt out over the
    /// partitions, so partition `p` owns every key `k` with
    /// `k % count == p`.
    fn partition_keys_of(
        logical: &LogicalPlan,
        name: &str,
        partition: u32,
        count: u32,
    ) -> BTreeMap<String, PartitionKeys> {
        let mut keys = BTreeMap::new();
        if count <= 1 {
            return keys;
        }
        let mask = count.next_power_of_two() - 1;
        let owned: BTreeSet<u32> =
            (0..=mask).filter(|k| k % count == partition).collect();
        for stream in logical.streams.values() {
            for sink in stream.sinks.iter().filter(|p| p.operator == name) {
                keys.insert(
                    sink.port.clone(),
                    PartitionKeys {
                        mask,
                        keys: owned.clone(),
                    },
                );
            }
        }
        keys
    }

    /// Creates physical operators for the named logical operators and the
    /// containers hosting them.
    fn place_operators(
        &mut self,
        names: &[String],
        placer: &dyn Placer,
        max_containers: Option<usize>,
    ) -> Result<(), DagError> {
        let mut specs = vec![];
        for name in names {
            for partition in 0..self.logical.partition_count(name) {
                specs.push(PartitionSpec {
                    logical: name.clone(),
                    partition,
                });
            }
        }
        if specs.is_empty() {
            return Ok(());
        }
        if max_containers == Some(0) {
            return self.place_on_existing(&specs, names);
        }

        let groups = placer.place(&specs, max_containers);
        if let Some(max) = max_containers {
            if groups.len() > max {
                return logged_err!(
                    "placer used {} containers > max {}",
                    groups.len(),
                    max
                );
            }
        }
        let mut seen = HashSet::new();
        for idx in groups.iter().flatten() {
            if *idx >= specs.len() || !seen.insert(*idx) {
                return logged_err!("placer returned invalid index {}", idx);
            }
        }
        if seen.len() != specs.len() {
            return logged_err!("placer left partitions unplaced");
        }

        let memory = self.logical.container_memory_mb();
        for group in groups {
            let cid = self.next_container_id;
            self.next_container_id += 1;
            let mut container = Container::new(cid, memory);

            for idx in group {
                let oid = self.insert_operator(&specs[idx], cid);
                container.operators.push(oid);
            }
            self.containers.insert(cid, container);
        }
        Ok(())
    }

    /// With the container budget used up, new partitions join the live
    /// containers round-robin in id order.
    fn place_on_existing(
        &mut self,
        specs: &[PartitionSpec],
        names: &[String],
    ) -> Result<(), DagError> {
        let live: Vec<ContainerId> = self
            .containers
            .values()
            .filter(|c| c.state != ContainerState::Killed)
            .map(|c| c.id)
            .collect();
        if live.is_empty() {
            return logged_err!("no container capacity left for {:?}", names);
        }
        for (i, spec) in specs.iter().enumerate() {
            let cid = live[i % live.len()];
            let oid = self.insert_operator(spec, cid);
            if let Some(container) = self.containers.get_mut(&cid) {
                container.operators.push(oid);
            }
        }
        pf_debug!(
            "placed {} partitions on {} existing containers",
            specs.len(),
            live.len()
        );
        Ok(())
    }

    /// Registers a `PendingDeploy` operator for `spec` owned by container
    /// `cid`; the caller lists it on the container.
    fn insert_operator(
        &mut self,
        spec: &PartitionSpec,
        cid: ContainerId,
    ) -> OperatorId {
        let oid = self.next_operator_id;
        self.next_operator_id += 1;
        let count = self.logical.partition_count(&spec.logical);
        self.operators.insert(
            oid,
            Operator {
                id: oid,
                logical: spec.logical.clone(),
                partition: spec.partition,
                partition_keys: Self::partition_keys_of(
                    &self.logical,
                    &spec.logical,
                    spec.partition,
                    count,
                ),
                container: cid,
                state: OperatorState::PendingDeploy,
                checkpoints: vec![],
            },
        );
        oid
    }

    /// Returns a new plan with a batch of logical changes applied. Physical
    /// operators of removed logical operators are dropped (together with
    /// containers left empty that were never allocated); partitions of added
    /// logical operators are placed on new containers, or on existing ones
    /// once the container budget is used up. Existing operators keep their
    /// ids, states and checkpoints, and their partition count cannot
    /// change. `self` is left untouched.
    pub fn with_changes(
        &self,
        changes: &[PlanChange],
        placer: &dyn Placer,
    ) -> Result<PhysicalPlan, DagError> {
        let logical = self.logical.apply_changes(changes)?;
        for name in self.logical.operators.keys() {
            if logical.operators.contains_key(name)
                && logical.partition_count(name)
                    != self.logical.partition_count(name)
            {
                return logged_err!(
                    "cannot repartition existing operator '{}'",
                    name
                );
            }
        }
        let mut plan = self.clone();

        let removed: Vec<OperatorId> = plan
            .operators
            .values()
            .filter(|o| !logical.operators.contains_key(&o.logical))
            .map(|o| o.id)
            .collect();
        for oid in &removed {
            plan.operators.remove(oid);
        }
        for container in plan.containers.values_mut() {
            container.operators.retain(|oid| !removed.contains(oid));
        }
        plan.containers.retain(|_, c| {
            !(c.operators.is_empty() && c.state == ContainerState::New)
        });

        let added: Vec<String> = logical
            .operators
            .keys()
            .filter(|name| !self.logical.operators.contains_key(*name))
            .cloned()
            .collect();
        plan.logical = logical;

        // refresh partition keys of existing operators whose inputs changed
        let refreshed: Vec<(OperatorId, BTreeMap<String, PartitionKeys>)> =
            plan.operators
                .values()
                .map(|o| {
                    let count = plan.logical.partition_count(&o.logical);
                    (
                        o.id,
                        Self::partition_keys_of(
                            &plan.logical,
                            &o.logical,
                            o.partition,
                            count,
                        ),
                    )
                })
                .collect();
        for (oid, keys) in refreshed {
            if let Some(op) = plan.operators.get_mut(&oid) {
                op.partition_keys = keys;
            }
        }

        let budget = plan.logical.max_containers().map(|max| {
            max.saturating_sub(
                plan.containers
                    .values()
                    .filter(|c| c.state != ContainerState::Killed)
                    .count(),
            )
        });
        plan.place_operators(&added, placer, budget)?;
        Ok(plan)
    }

    /// Returns a new plan in which container `id` is `Killed` and a new
    /// `New` container hosts its operators, which go back to
    /// `PendingDeploy` unless stopped. Also returns the new container's id.
    pub fn with_replaced_container(
        &self,
        id: ContainerId,
    ) -> Result<(PhysicalPlan, ContainerId), DagError> {
        let mut plan = self.clone();
        let Some(old) = plan.containers.get_mut(&id) else {
            return logged_err!("replacing unknown container {}", id);
        };
        if old.state == ContainerState::Killed {
            return logged_err!("container {} already killed", id);
        }
        old.state = ContainerState::Killed;
        let hosted = std::mem::take(&mut old.operators);
        let memory = old.required_memory_mb;

        let new_id = plan.next_container_id;
        plan.next_container_id += 1;
        let mut replacement = Container::new(new_id, memory);
        replacement.operators = hosted.clone();
        plan.containers.insert(new_id, replacement);

        for oid in hosted {
            if let Some(op) = plan.operators.get_mut(&oid) {
                op.container = new_id;
                if op.state != OperatorState::Inactive {
                    op.state = OperatorState::PendingDeploy;
                }
            }
        }
        Ok((plan, new_id))
    }

    pub fn logical(&self) -> &LogicalPlan {
        &self.logical
    }

    pub fn container(&self, id: ContainerId) -> Option<&Container> {
        self.containers.get(&id)
    }

    pub fn container_mut(&mut self, id: ContainerId) -> Option<&mut Container> {
        self.containers.get_mut(&id)
    }

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.operators.get(&id)
    }

    pub fn operator_mut(&mut self, id: OperatorId) -> Option<&mut Operator> {
        self.operators.get_mut(&id)
    }

    pub fn containers(&self) -> impl Iterator<Item = &Container> {
        self.containers.values()
    }

    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.operators.values()
    }

    /// Physical operators (partitions) of a logical operator, by id.
    pub fn operators_of(&self, logical: &str) -> Vec<&Operator> {
        self.operators
            .values()
            .filter(|o| o.logical == logical)
            .collect()
    }

    /// Operators deployed to a container.
    pub fn operators_on(&self, container: ContainerId) -> Vec<&Operator> {
        self.containers
            .get(&container)
            .map(|c| {
                c.operators
                    .iter()
                    .filter_map(|oid| self.operators.get(oid))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Looks up a non-killed container by its external id.
    pub fn container_by_external_id(
        &self,
        external_id: &str,
    ) -> Option<&Container> {
        self.containers.values().find(|c| {
            c.state != ContainerState::Killed
                && c.external_id.as_deref() == Some(external_id)
        })
    }
}

//! Logical DAG description and plan-modification requests.

use std::collections::BTreeMap;

use crate::utils::DagError;

use serde::{Deserialize, Serialize};

/// Application directory attribute.
pub const ATTR_APPLICATION_PATH: &str = "APPLICATION_PATH";

/// Upper bound on containers the placer may use.
pub const ATTR_CONTAINERS_MAX_COUNT: &str = "CONTAINERS_MAX_COUNT";

/// Number of physical partitions of a logical operator.
pub const ATTR_INITIAL_PARTITION_COUNT: &str = "INITIAL_PARTITION_COUNT";

/// Memory requested per container in MB.
pub const ATTR_CONTAINER_MEMORY_MB: &str = "CONTAINER_MEMORY_MB";

const DEFAULT_CONTAINER_MEMORY_MB: u32 = 1024;

/// Reference to a port of a logical operator.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PortRef {
    pub operator: String,
    pub port: String,
}

impl PortRef {
    pub fn new(operator: impl Into<String>, port: impl Into<String>) -> Self {
        PortRef {
            operator: operator.into(),
            port: port.into(),
        }
    }
}

/// Logical operator metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorMeta {
    pub name: String,

    /// Implementation class name the worker instantiates.
    pub class: String,

    pub attributes: BTreeMap<String, String>,
}

/// Logical stream connecting one output port to any number of input ports.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMeta {
    pub name: String,
    pub source: PortRef,
    pub sinks: Vec<PortRef>,
}

/// Logical DAG of an application.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub attributes: BTreeMap<String, String>,
    pub operators: BTreeMap<String, OperatorMeta>,
    pub streams: BTreeMap<String, StreamMeta>,
}

/// One logical change of a plan-modification batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlanChange {
    /// Add a new operator.
    CreateOperator { name: String, class: String },

    /// Create a stream, or add a sink to an existing stream with the same
    /// source.
    CreateStream {
        name: String,
        source: PortRef,
        sink: PortRef,
    },

    /// Remove a stream.
    RemoveStream { name: String },

    /// Remove an operator; it must not be connected to any stream.
    RemoveOperator { name: String },

    /// Set an attribute of an existing operator.
    SetOperatorAttribute {
        operator: String,
        name: String,
        value: String,
    },
}

impl LogicalPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an operator; the name must be new.
    pub fn add_operator(
        &mut self,
        name: impl Into<String>,
        class: impl Into<String>,
    ) -> Result<&mut OperatorMeta, DagError> {
        let name = name.into();
        if self.operators.contains_key(&name) {
            return logged_err!("operator '{}' already exists", name);
        }
        let meta = OperatorMeta {
            name: name.clone(),
            class: class.into(),
            attributes: BTreeMap::new(),
        };
        Ok(self.operators.entry(name).or_insert(meta))
    }

    /// Adds a sink to stream `name`, creating the stream if it does not
    /// exist. Both ends must name existing operators.
    pub fn add_stream(
        &mut self,
        name: impl Into<String>,
        source: PortRef,
        sink: PortRef,
    ) -> Result<(), DagError> {
        let name = name.into();
        for end in [&source, &sink] {
            if !self.operators.contains_key(&end.operator) {
                return logged_err!(
                    "stream '{}' refers to unknown operator '{}'",
                    name,
                    end.operator
                );
            }
        }

        match self.streams.get_mut(&name) {
            Some(stream) => {
                if stream.source != source {
                    return logged_err!(
                        "stream '{}' already has source {:?}",
                        name,
                        stream.source
                    );
                }
                if !stream.sinks.contains(&sink) {
                    stream.sinks.push(sink);
                }
            }
            None => {
                self.streams.insert(
                    name.clone(),
                    StreamMeta {
                        name,
                        source,
                        sinks: vec![sink],
                    },
                );
            }
        }
        Ok(())
    }

    /// Sets an application-level attribute.
    pub fn set_attribute(
        &mut self,
        name: impl Into<String>,
        value: impl ToString,
    ) {
        self.attributes.insert(name.into(), value.to_string());
    }

    pub fn operator(&self, name: &str) -> Option<&OperatorMeta> {
        self.operators.get(name)
    }

    /// Number of partitions of a logical operator (at least 1).
    pub fn partition_count(&self, operator: &str) -> u32 {
        self.operators
            .get(operator)
            .and_then(|meta| meta.attributes.get(ATTR_INITIAL_PARTITION_COUNT))
            .and_then(|v| v.parse::<u32>().ok())
            .map_or(1, |n| n.max(1))
    }

    /// Container count bound, `None` if unbounded.
    pub fn max_containers(&self) -> Option<usize> {
        self.attributes
            .get(ATTR_CONTAINERS_MAX_COUNT)
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
    }

    pub fn container_memory_mb(&self) -> u32 {
        self.attributes
            .get(ATTR_CONTAINER_MEMORY_MB)
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(DEFAULT_CONTAINER_MEMORY_MB)
    }

    fn is_connected(&self, operator: &str) -> bool {
        self.streams.values().any(|s| {
            s.source.operator == operator
                || s.sinks.iter().any(|p| p.operator == operator)
        })
    }

    fn apply_change(&mut self, change: &PlanChange) -> Result<(), DagError> {
        match change {
            PlanChange::CreateOperator { name, class } => {
                self.add_operator(name.clone(), class.clone())?;
            }
            PlanChange::CreateStream { name, source, sink } => {
                self.add_stream(name.clone(), source.clone(), sink.clone())?;
            }
            PlanChange::RemoveStream { name } => {
                if self.streams.remove(name).is_none() {
                    return logged_err!("removing unknown stream '{}'", name);
                }
            }
            PlanChange::RemoveOperator { name } => {
                if !self.operators.contains_key(name) {
                    return logged_err!("removing unknown operator '{}'", name);
                }
                if self.is_connected(name) {
                    return logged_err!(
                        "operator '{}' still connected to a stream",
                        name
                    );
                }
                self.operators.remove(name);
            }
            PlanChange::SetOperatorAttribute {
                operator,
                name,
                value,
            } => match self.operators.get_mut(operator) {
                Some(meta) => {
                    meta.attributes.insert(name.clone(), value.clone());
                }
                None => {
                    return logged_err!(
                        "setting attribute of unknown operator '{}'",
                        operator
                    );
                }
            },
        }
        Ok(())
    }

    /// Applies a batch of changes to a copy of this plan. The batch is
    /// all-or-nothing: on any invalid change the error is returned and no
    /// plan is produced.
    pub fn apply_changes(
        &self,
        changes: &[PlanChange],
    ) -> Result<LogicalPlan, DagError> {
        let mut plan = self.clone();
        for change in changes {
            plan.apply_change(change)?;
        }
        Ok(plan)
    }
}

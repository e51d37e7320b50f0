//! Operator placement seam: which physical operators share a container.

/// One physical operator awaiting placement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionSpec {
    /// Logical operator name.
    pub logical: String,

    /// Partition index within the logical operator.
    pub partition: u32,
}

/// Physical planner interface. Given the partitions to place and an
/// optional container count bound, returns groups of indices into `specs`;
/// every group becomes one container. Every index must appear in exactly
/// one group.
pub trait Placer: Send + Sync {
    fn place(
        &self,
        specs: &[PartitionSpec],
        max_containers: Option<usize>,
    ) -> Vec<Vec<usize>>;
}

/// Places partitions one per container until the bound is reached, then
/// wraps around.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoundRobinPlacer;

impl Placer for RoundRobinPlacer {
    fn place(
        &self,
        specs: &[PartitionSpec],
        max_containers: Option<usize>,
    ) -> Vec<Vec<usize>> {
        let slots = max_containers
            .map_or(specs.len(), |max| max.min(specs.len()))
            .max(1);
        let mut groups: Vec<Vec<usize>> = vec![vec![]; slots];
        for idx in 0..specs.len() {
            groups[idx % slots].push(idx);
        }
        groups.retain(|g| !g.is_empty());
        groups
    }
}

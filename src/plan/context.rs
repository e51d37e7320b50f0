//! Non-persisted collaborators bound to a plan after it is built or
//! recovered.

use std::sync::Arc;

use crate::plan::logical::OperatorMeta;
use crate::plan::physical::OperatorId;

use serde::{Deserialize, Serialize};

/// Runtime statistics an operator reports with a heartbeat.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorStats {
    /// Tuples processed since the last report.
    pub tuples_processed: u64,

    /// Tuples emitted since the last report.
    pub tuples_emitted: u64,

    /// Average per-window latency in millisecs.
    pub latency_ms: u64,
}

/// Observer notified synchronously with the stats of an operator during
/// heartbeat processing. Must not call back into the plan.
pub trait StatsObserver: Send + Sync {
    fn process_stats(&self, operator: OperatorId, stats: &OperatorStats);
}

/// Context a recovered plan is re-attached to; produces the stats
/// observers of each logical operator.
pub trait PlanContext: Send + Sync {
    fn stats_observers(&self, meta: &OperatorMeta)
        -> Vec<Arc<dyn StatsObserver>>;
}

/// Context that attaches no observers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoObservers;

impl PlanContext for NoObservers {
    fn stats_observers(
        &self,
        _meta: &OperatorMeta,
    ) -> Vec<Arc<dyn StatsObserver>> {
        vec![]
    }
}

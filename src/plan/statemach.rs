//! Journaled state machine over the physical plan.

use std::collections::HashMap;
use std::sync::Arc;

use crate::journal::{
    Journal, JournalEntry, JournalSink, ReplayStats, RotationPolicy,
};
use crate::plan::context::{OperatorStats, PlanContext, StatsObserver};
use crate::plan::mutations::{
    PurgeCheckpoints, SetContainerState, SetOperatorState,
};
use crate::plan::physical::{
    Checkpoint, Container, ContainerId, OperatorId, OperatorState,
    PhysicalPlan,
};
use crate::recovery::StorageAgent;
use crate::utils::DagError;

use tokio::io::AsyncRead;

/// Owner of the live physical plan. Every crash-relevant mutation is made
/// durable in the journal before it is applied to the live plan.
pub struct PlanStateMachine {
    /// Live physical plan.
    plan: PhysicalPlan,

    /// Write-ahead journal of mutations since the last snapshot.
    journal: Journal<PhysicalPlan>,

    /// Map from operator ID -> attached stats observers; not persisted.
    observers: HashMap<OperatorId, Vec<Arc<dyn StatsObserver>>>,
}

impl PlanStateMachine {
    /// Wraps a plan, registering every plan mutation with a fresh journal.
    /// The journal has no output until `install()` or `set_output()`.
    pub fn new(
        plan: PhysicalPlan,
        policy: RotationPolicy,
    ) -> Result<Self, DagError> {
        let mut journal = Journal::new(policy);
        journal.register_entry::<SetOperatorState>()?;
        journal.register_entry::<SetContainerState>()?;
        journal.register_entry::<PurgeCheckpoints>()?;
        Ok(PlanStateMachine {
            plan,
            journal,
            observers: HashMap::new(),
        })
    }

    pub fn plan(&self) -> &PhysicalPlan {
        &self.plan
    }

    /// Replays journaled mutations onto the live plan.
    pub async fn replay<R>(
        &mut self,
        reader: &mut R,
    ) -> Result<ReplayStats, DagError>
    where
        R: AsyncRead + Unpin,
    {
        self.journal.replay(reader, &mut self.plan).await
    }

    pub fn set_output(&mut self, sink: Box<dyn JournalSink>) {
        self.journal.set_output(sink);
    }

    /// Swaps in a plan that has just been made durable by a snapshot,
    /// journaling subsequent mutations to `sink`. Observers are dropped and
    /// must be re-attached.
    pub fn install(&mut self, plan: PhysicalPlan, sink: Box<dyn JournalSink>) {
        self.plan = plan;
        self.journal.set_output(sink);
        self.observers.clear();
    }

    /// Returns true if routine mutations should be folded into a snapshot.
    pub fn rotation_due(&self) -> bool {
        self.journal.rotation_due()
    }

    pub fn journal(&self) -> &Journal<PhysicalPlan> {
        &self.journal
    }

    /// Makes the entry durable, then applies it.
    async fn commit<E>(&mut self, entry: E) -> Result<(), DagError>
    where
        E: JournalEntry<PhysicalPlan>,
    {
        self.journal.write(&entry).await?;
        entry.apply(&mut self.plan)
    }

    /// Transitions an operator to a new lifecycle state.
    pub async fn set_operator_state(
        &mut self,
        id: OperatorId,
        state: OperatorState,
    ) -> Result<(), DagError> {
        let Some(op) = self.plan.operator(id) else {
            return logged_err!("unknown operator {}", id);
        };
        if op.state == state {
            return Ok(());
        }
        pf_debug!("operator {} {:?} -> {:?}", id, op.state, state);
        self.commit(SetOperatorState {
            operator_id: id,
            state,
        })
        .await
    }

    /// Computes a new container value with `update` and commits it. The
    /// container id and hosted operators cannot be changed this way.
    pub async fn update_container<F>(
        &mut self,
        id: ContainerId,
        update: F,
    ) -> Result<(), DagError>
    where
        F: FnOnce(&mut Container),
    {
        let Some(current) = self.plan.container(id) else {
            return logged_err!("unknown container {}", id);
        };
        let mut updated = current.clone();
        update(&mut updated);
        updated.id = current.id;
        updated.operators = current.operators.clone();
        if &updated == current {
            return Ok(());
        }
        pf_debug!("container {} {:?} -> {:?}", id, current.state, updated.state);
        self.commit(SetContainerState::from(&updated)).await
    }

    /// Drops checkpoints of an operator below a window id; returns the
    /// window ids dropped.
    pub async fn purge_checkpoints(
        &mut self,
        id: OperatorId,
        below_window: u64,
    ) -> Result<Vec<u64>, DagError> {
        let Some(op) = self.plan.operator(id) else {
            return logged_err!("unknown operator {}", id);
        };
        let purged: Vec<u64> = op
            .checkpoints
            .iter()
            .map(|cp| cp.window_id)
            .filter(|&w| w < below_window)
            .collect();
        if purged.is_empty() {
            return Ok(purged);
        }
        self.commit(PurgeCheckpoints {
            operator_id: id,
            below_window,
        })
        .await?;
        Ok(purged)
    }

    /// Appends a checkpoint an operator reported. Not journaled: the
    /// artifact is durable in checkpoint storage and is rediscovered by
    /// `reconcile_offline_checkpoints()` after a crash.
    pub fn record_checkpoint(
        &mut self,
        id: OperatorId,
        checkpoint: Checkpoint,
    ) -> Result<bool, DagError> {
        let Some(op) = self.plan.operator_mut(id) else {
            return logged_err!("checkpoint for unknown operator {}", id);
        };
        op.add_checkpoint(checkpoint)
    }

    /// Appends, in ascending order, every stored checkpoint artifact newer
    /// than the newest checkpoint each operator knows of. Returns the number
    /// of checkpoints added.
    pub async fn reconcile_offline_checkpoints(
        &mut self,
        agent: &dyn StorageAgent,
    ) -> Result<usize, DagError> {
        let ids: Vec<OperatorId> = self.plan.operators().map(|o| o.id).collect();
        let mut added = 0;
        for id in ids {
            let stored = agent.window_ids(id).await?;
            let Some(op) = self.plan.operator_mut(id) else {
                continue;
            };
            let known = op.recent_checkpoint().map(|cp| cp.window_id);
            for window_id in stored {
                if known.map_or(false, |k| window_id <= k) {
                    continue;
                }
                if op.add_checkpoint(Checkpoint::new(window_id))? {
                    pf_info!(
                        "reconciled offline checkpoint {} of operator {}",
                        window_id,
                        id
                    );
                    added += 1;
                }
            }
        }
        Ok(added)
    }

    /// Rebinds stats observers from the context; returns how many were
    /// attached.
    pub fn attach(&mut self, context: &dyn PlanContext) -> usize {
        self.observers.clear();
        let mut count = 0;
        for op in self.plan.operators() {
            let Some(meta) = self.plan.logical().operator(&op.logical) else {
                continue;
            };
            let observers = context.stats_observers(meta);
            if !observers.is_empty() {
                count += observers.len();
                self.observers.insert(op.id, observers);
            }
        }
        count
    }

    /// Number of observers attached to an operator.
    pub fn observer_count(&self, id: OperatorId) -> usize {
        self.observers.get(&id).map_or(0, |o| o.len())
    }

    /// Delivers an operator's stats to its observers.
    pub fn notify_stats(&self, id: OperatorId, stats: &OperatorStats) {
        if let Some(observers) = self.observers.get(&id) {
            for observer in observers {
                observer.process_stats(id, stats);
            }
        }
    }
}

#[cfg(test)]
mod statemach_tests {
    use super::*;
    use crate::journal::MemSink;
    use crate::plan::logical::{LogicalPlan, OperatorMeta, PortRef};
    use crate::plan::physical::{ContainerState, NetAddr};
    use crate::plan::placement::RoundRobinPlacer;
    use crate::recovery::{FsStorageAgent, RecoveryStore};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn test_plan() -> Result<PhysicalPlan, DagError> {
        let mut dag = LogicalPlan::new();
        dag.add_operator("o1", "GenericTestOperator")?;
        dag.add_operator("o2", "StatsListeningOperator")?;
        dag.add_stream(
            "s1",
            PortRef::new("o1", "outport1"),
            PortRef::new("o2", "inport1"),
        )?;
        PhysicalPlan::from_logical(dag, &RoundRobinPlacer)
    }

    fn first_op(plan: &PhysicalPlan, name: &str) -> OperatorId {
        plan.operators_of(name).first().map_or(0, |o| o.id)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn operator_state_replay() -> Result<(), DagError> {
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let sink = MemSink::new();
        let mut sm = PlanStateMachine::new(plan.clone(), RotationPolicy::never())?;
        sm.set_output(Box::new(sink.clone()));

        sm.set_operator_state(o1, OperatorState::Active).await?;
        assert_eq!(sink.flush_count(), 1);
        assert_eq!(
            sm.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::Active)
        );
        // no-op transition is not journaled
        sm.set_operator_state(o1, OperatorState::Active).await?;
        assert_eq!(sink.flush_count(), 1);

        let mut fresh = PlanStateMachine::new(plan, RotationPolicy::never())?;
        assert_eq!(
            fresh.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::PendingDeploy)
        );
        let bytes = sink.bytes();
        fresh.replay(&mut &bytes[..]).await?;
        assert_eq!(
            fresh.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::Active)
        );
        assert!(sm.set_operator_state(999, OperatorState::Active).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn container_state_roundtrip() -> Result<(), DagError> {
        let plan = test_plan()?;
        let cid = plan.containers().next().map_or(0, |c| c.id);
        let sink = MemSink::new();
        let mut sm = PlanStateMachine::new(plan, RotationPolicy::never())?;
        sm.set_output(Box::new(sink.clone()));

        sm.update_container(cid, |c| {
            c.state = ContainerState::Allocated;
            c.external_id = Some("eid1".into());
            c.host = Some("host1".into());
            c.buffer_addr = Some(NetAddr::new("localhost", 0));
            c.required_memory_mb = 384;
            c.allocated_memory_mb = 256;
        })
        .await?;
        assert_eq!(sink.flush_count(), 1);
        let expected = sm.plan().container(cid).cloned();

        // reset the in-memory object, then recover it from the journal
        if let Some(c) = sm.plan.container_mut(cid) {
            c.reset();
            c.required_memory_mb = 0;
        }
        assert_eq!(
            sm.plan().container(cid).map(|c| c.state),
            Some(ContainerState::New)
        );
        let bytes = sink.bytes();
        sm.replay(&mut &bytes[..]).await?;
        let recovered = sm.plan().container(cid).cloned();
        assert_eq!(recovered, expected);
        let Some(recovered) = recovered else {
            return Err(DagError::msg("container missing"));
        };
        assert_eq!(recovered.state, ContainerState::Allocated);
        assert_eq!(recovered.host.as_deref(), Some("host1"));
        assert_eq!(recovered.external_id.as_deref(), Some("eid1"));
        assert_eq!(recovered.buffer_addr, Some(NetAddr::new("localhost", 0)));
        assert_eq!(recovered.required_memory_mb, 384);
        assert_eq!(recovered.allocated_memory_mb, 256);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn failed_write_not_applied() -> Result<(), DagError> {
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let o2 = first_op(&plan, "o2");
        let sink = MemSink::new();
        let mut sm = PlanStateMachine::new(plan.clone(), RotationPolicy::never())?;
        sm.set_output(Box::new(sink.clone()));
        sm.set_operator_state(o1, OperatorState::Active).await?;

        sink.set_torn(true);
        assert!(sm.set_operator_state(o2, OperatorState::Active).await.is_err());
        sink.set_torn(false);
        assert!(sm
            .set_operator_state(o1, OperatorState::Inactive)
            .await
            .is_err());
        assert_eq!(
            sm.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::Active)
        );
        assert_eq!(
            sm.plan().operator(o2).map(|o| o.state),
            Some(OperatorState::PendingDeploy)
        );

        // the journal still replays up to the last accepted mutation
        let mut fresh = PlanStateMachine::new(plan, RotationPolicy::never())?;
        let bytes = sink.bytes();
        let stats = fresh.replay(&mut &bytes[..]).await?;
        assert!(stats.truncated);
        assert_eq!(fresh.plan(), sm.plan());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn snapshot_plus_tail_equivalence() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-statemach-tail";
        let _ = tokio::fs::remove_dir_all(dir).await;
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let o2 = first_op(&plan, "o2");
        let cid = plan.containers().next().map_or(0, |c| c.id);

        let mut store = RecoveryStore::new_and_setup(dir).await?;
        let mut sm = PlanStateMachine::new(plan, RotationPolicy::never())?;
        sm.set_output(Box::new(MemSink::new()));
        sm.set_operator_state(o1, OperatorState::Active).await?;

        // snapshot after the first entry, then keep journaling
        let sink = store.write_snapshot(sm.plan()).await?;
        sm.set_output(Box::new(sink));
        sm.update_container(cid, |c| c.state = ContainerState::Allocated)
            .await?;
        sm.set_operator_state(o2, OperatorState::Active).await?;
        sm.set_operator_state(o1, OperatorState::Inactive).await?;

        let mut store = RecoveryStore::new_and_setup(dir).await?;
        let mut recovered = store.load_latest::<PhysicalPlan>().await?;
        let Some(snapshot) = recovered.state.take() else {
            return Err(DagError::msg("snapshot missing"));
        };
        let mut rebuilt =
            PlanStateMachine::new(snapshot, RotationPolicy::never())?;
        let stats = rebuilt.replay(&mut recovered.journal).await?;
        assert_eq!(stats.applied, 3);
        assert_eq!(rebuilt.plan(), sm.plan());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn offline_checkpoints_reconciled() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-statemach-offline";
        let _ = tokio::fs::remove_dir_all(dir).await;
        let agent = FsStorageAgent::new(dir);
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let o2 = first_op(&plan, "o2");
        let mut sm = PlanStateMachine::new(plan, RotationPolicy::never())?;

        assert_eq!(sm.reconcile_offline_checkpoints(&agent).await?, 0);
        sm.record_checkpoint(o1, Checkpoint::new(3))?;
        agent.save(o1, 1, b"old").await?;
        agent.save(o1, 3, b"known").await?;
        agent.save(o1, 10, b"offline").await?;
        agent.save(o2, 7, b"offline").await?;

        assert_eq!(sm.reconcile_offline_checkpoints(&agent).await?, 2);
        let windows = |sm: &PlanStateMachine, id| -> Vec<u64> {
            sm.plan()
                .operator(id)
                .map(|o| o.checkpoints.iter().map(|c| c.window_id).collect())
                .unwrap_or_default()
        };
        assert_eq!(windows(&sm, o1), vec![3, 10]);
        assert_eq!(windows(&sm, o2), vec![7]);
        assert_eq!(sm.reconcile_offline_checkpoints(&agent).await?, 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn purge_replays() -> Result<(), DagError> {
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let sink = MemSink::new();
        let mut sm = PlanStateMachine::new(plan, RotationPolicy::never())?;
        sm.set_output(Box::new(sink.clone()));
        for w in [1, 3, 10] {
            sm.record_checkpoint(o1, Checkpoint::new(w))?;
        }
        let before = sm.plan().clone();

        assert_eq!(sm.purge_checkpoints(o1, 10).await?, vec![1, 3]);
        assert!(sm.purge_checkpoints(o1, 10).await?.is_empty());
        assert_eq!(sink.flush_count(), 1);

        let mut fresh = PlanStateMachine::new(before, RotationPolicy::never())?;
        let bytes = sink.bytes();
        fresh.replay(&mut &bytes[..]).await?;
        assert_eq!(fresh.plan(), sm.plan());
        Ok(())
    }

    struct CountingObserver(AtomicUsize);

    impl StatsObserver for CountingObserver {
        fn process_stats(&self, _operator: OperatorId, _stats: &OperatorStats) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct ListeningContext(Arc<CountingObserver>);

    impl PlanContext for ListeningContext {
        fn stats_observers(
            &self,
            meta: &OperatorMeta,
        ) -> Vec<Arc<dyn StatsObserver>> {
            if meta.class == "StatsListeningOperator" {
                vec![self.0.clone() as Arc<dyn StatsObserver>]
            } else {
                vec![]
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn observers_attach_and_notify() -> Result<(), DagError> {
        let plan = test_plan()?;
        let o1 = first_op(&plan, "o1");
        let o2 = first_op(&plan, "o2");
        let mut sm = PlanStateMachine::new(plan, RotationPolicy::never())?;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        assert_eq!(sm.attach(&ListeningContext(counter.clone())), 1);
        assert_eq!(sm.observer_count(o1), 0);
        assert_eq!(sm.observer_count(o2), 1);

        sm.notify_stats(o1, &OperatorStats::default());
        sm.notify_stats(o2, &OperatorStats::default());
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);
        Ok(())
    }
}

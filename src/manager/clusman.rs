//! Cluster manager control loop and plan-level operations.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use crate::journal::RotationPolicy;
use crate::manager::{ManagerConfig, ManagerHandle, PlanChangeReq};
use crate::plan::{
    ContainerId, ContainerState, LogicalPlan, NetAddr, OperatorId,
    OperatorState, PhysicalPlan, PlanChange, PlanContext, PlanStateMachine,
    Placer, ATTR_APPLICATION_PATH,
};
use crate::recovery::{ConnectRecord, RecoveryStore, StorageAgent};
use crate::rpc::{WorkerCall, WorkerReactor};
use crate::utils::{DagError, ME};

use tokio::sync::{mpsc, watch};
use tokio::time::{self, Duration, Instant, MissedTickBehavior};

/// The master's cluster manager. All plan mutations happen on the task
/// that owns it; other parties submit work through a `ManagerHandle` or
/// the worker RPC.
pub struct ClusterManager {
    /// Configuration parameters struct.
    config: ManagerConfig,

    /// Snapshot and journal storage of the application.
    store: RecoveryStore,

    /// Journaled physical plan.
    pub(super) statemach: PlanStateMachine,

    /// Checkpoint artifact storage.
    pub(super) agent: Arc<dyn StorageAgent>,

    /// Physical planner used for new operators.
    placer: Box<dyn Placer>,

    /// Context stats observers are attached from.
    context: Arc<dyn PlanContext>,

    /// Worker-facing reactor; `None` until `serve()`.
    reactor: Option<WorkerReactor>,

    /// Sender side of the plan-change channel, cloned into handles.
    tx_change: mpsc::UnboundedSender<PlanChangeReq>,

    /// Receiver side of the plan-change channel.
    rx_change: mpsc::UnboundedReceiver<PlanChangeReq>,

    /// Map from container ID -> time of its last heartbeat.
    pub(super) last_heartbeat: HashMap<ContainerId, Instant>,
}

impl ClusterManager {
    /// Creates the cluster manager of the application at `app_path`. If a
    /// snapshot exists the plan is recovered from it (plus its journal tail
    /// and any checkpoints stored meanwhile) and `logical` is ignored;
    /// otherwise the plan is built from `logical`. Either way a fresh
    /// snapshot is written before returning.
    pub async fn new_and_setup(
        config_str: Option<&str>,
        logical: Option<LogicalPlan>,
        agent: Arc<dyn StorageAgent>,
        placer: Box<dyn Placer>,
        context: Arc<dyn PlanContext>,
    ) -> Result<Self, DagError> {
        let _ = ME.set("m".into());

        let config = parsed_config!(config_str => ManagerConfig;
                                    app_path, bind_addr, advertise_host,
                                    rpc_timeout_ms, retry_delay_ms,
                                    retry_timeout_ms, journal_max_entries,
                                    journal_max_bytes, heartbeat_timeout_ms,
                                    monitor_interval_ms)?;
        if config.rpc_timeout_ms == 0 {
            return logged_err!(
                "invalid config.rpc_timeout_ms '{}'",
                config.rpc_timeout_ms
            );
        }
        if config.monitor_interval_ms == 0 {
            return logged_err!(
                "invalid config.monitor_interval_ms '{}'",
                config.monitor_interval_ms
            );
        }
        let policy = RotationPolicy {
            max_entries: config.journal_max_entries,
            max_bytes: config.journal_max_bytes,
        };

        let mut store = RecoveryStore::new_and_setup(&config.app_path).await?;
        let mut recovered = store.load_latest::<PhysicalPlan>().await?;
        let mut statemach = match recovered.state.take() {
            Some(plan) => {
                if logical.is_some() {
                    pf_info!("snapshot found, ignoring supplied logical plan");
                }
                let mut statemach = PlanStateMachine::new(plan, policy)?;
                let stats = statemach.replay(&mut recovered.journal).await?;
                let reconciled = statemach
                    .reconcile_offline_checkpoints(agent.as_ref())
                    .await?;
                pf_info!(
                    "recovered plan: {} journal entries, {} offline checkpoints",
                    stats.applied,
                    reconciled
                );
                statemach
            }
            None => {
                let Some(mut logical) = logical else {
                    return logged_err!(
                        "no snapshot in '{}' and no logical plan given",
                        config.app_path
                    );
                };
                logical.set_attribute(ATTR_APPLICATION_PATH, &config.app_path);
                let plan = PhysicalPlan::from_logical(logical, placer.as_ref())?;
                pf_info!(
                    "built plan: {} operators on {} containers",
                    plan.operators().count(),
                    plan.containers().count()
                );
                PlanStateMachine::new(plan, policy)?
            }
        };

        let sink = store.write_snapshot(statemach.plan()).await?;
        statemach.set_output(Box::new(sink));
        let attached = statemach.attach(context.as_ref());
        pf_debug!("attached {} stats observers", attached);

        let (tx_change, rx_change) = mpsc::unbounded_channel();
        Ok(ClusterManager {
            config,
            store,
            statemach,
            agent,
            placer,
            context,
            reactor: None,
            tx_change,
            rx_change,
            last_heartbeat: HashMap::new(),
        })
    }

    /// Binds the worker-facing reactor and publishes the connect record
    /// workers resolve this master from. Returns the bound address.
    pub async fn serve(&mut self) -> Result<SocketAddr, DagError> {
        let bind_addr: SocketAddr = self.config.bind_addr.parse()?;
        let reactor = WorkerReactor::new_and_setup(bind_addr).await?;
        let local_addr = reactor.local_addr();

        let record = ConnectRecord {
            addr: format!("{}:{}", self.config.advertise_host, local_addr.port()),
            rpc_timeout_ms: self.config.rpc_timeout_ms,
            retry_delay_ms: self.config.retry_delay_ms,
            retry_timeout_ms: self.config.retry_timeout_ms,
        };
        self.store.write_connect_record(&record).await?;
        self.reactor = Some(reactor);
        Ok(local_addr)
    }

    /// Returns a handle for submitting plan modifications.
    pub fn handle(&self) -> ManagerHandle {
        ManagerHandle {
            tx_change: self.tx_change.clone(),
        }
    }

    pub fn plan(&self) -> &PhysicalPlan {
        self.statemach.plan()
    }

    pub fn statemach(&self) -> &PlanStateMachine {
        &self.statemach
    }

    /// Generation of the newest snapshot.
    pub fn snapshot_generation(&self) -> u64 {
        self.store.generation()
    }

    /// Looks up a container by external id, killed ones included.
    pub(super) fn find_container(&self, external_id: &str) -> Option<ContainerId> {
        self.plan()
            .container_by_external_id(external_id)
            .or_else(|| {
                self.plan()
                    .containers()
                    .find(|c| c.external_id.as_deref() == Some(external_id))
            })
            .map(|c| c.id)
    }

    /// Snapshots if routine mutations have outgrown the rotation policy, or
    /// if a failed append left the journal without an output stream.
    pub(super) async fn maybe_rotate(&mut self) -> Result<(), DagError> {
        if !self.statemach.journal().has_output() {
            pf_warn!("journal output lost, snapshotting to start afresh");
            self.rotate().await?;
        } else if self.statemach.rotation_due() {
            self.rotate().await?;
        }
        Ok(())
    }

    /// Snapshots the current plan and continues on an empty journal.
    pub async fn rotate(&mut self) -> Result<(), DagError> {
        let sink = self.store.write_snapshot(self.statemach.plan()).await?;
        self.statemach.set_output(Box::new(sink));
        pf_info!("rotated journal into snapshot {}", self.store.generation());
        Ok(())
    }

    /// Makes a structurally changed plan durable by snapshot, then installs
    /// it. On failure the live plan is left untouched.
    async fn install_plan(&mut self, plan: PhysicalPlan) -> Result<(), DagError> {
        let sink = self.store.write_snapshot(&plan).await?;
        self.statemach.install(plan, Box::new(sink));
        self.statemach.attach(self.context.as_ref());
        let plan = self.statemach.plan();
        self.last_heartbeat.retain(|cid, _| {
            plan.container(*cid)
                .map_or(false, |c| c.state != ContainerState::Killed)
        });
        Ok(())
    }

    /// Transitions an operator, e.g. to stop it.
    pub async fn set_operator_state(
        &mut self,
        id: OperatorId,
        state: OperatorState,
    ) -> Result<(), DagError> {
        self.statemach.set_operator_state(id, state).await?;
        self.maybe_rotate().await
    }

    /// Records that the resource manager granted container `id`.
    pub async fn allocate_container(
        &mut self,
        id: ContainerId,
        external_id: &str,
        host: &str,
        buffer_addr: Option<NetAddr>,
        allocated_memory_mb: u32,
    ) -> Result<(), DagError> {
        let Some(container) = self.plan().container(id) else {
            return logged_err!("allocating unknown container {}", id);
        };
        if container.state != ContainerState::New {
            return logged_err!(
                "allocating container {} in state {:?}",
                id,
                container.state
            );
        }
        if self.plan().container_by_external_id(external_id).is_some() {
            return logged_err!("external id '{}' already in use", external_id);
        }

        self.statemach
            .update_container(id, |c| {
                c.state = ContainerState::Allocated;
                c.external_id = Some(external_id.into());
                c.host = Some(host.into());
                c.buffer_addr = buffer_addr;
                c.allocated_memory_mb = allocated_memory_mb;
            })
            .await?;
        pf_info!("container {} allocated as '{}'", id, external_id);
        self.maybe_rotate().await
    }

    /// Sends a container back to `New` for re-allocation, keeping its
    /// operators, which return to `PendingDeploy` unless stopped.
    pub async fn schedule_container_restart(
        &mut self,
        external_id: &str,
    ) -> Result<(), DagError> {
        let Some(container) = self.plan().container_by_external_id(external_id)
        else {
            return logged_err!("restarting unknown container '{}'", external_id);
        };
        let cid = container.id;
        let redeploy: Vec<OperatorId> = self
            .plan()
            .operators_on(cid)
            .iter()
            .filter(|o| o.state == OperatorState::Active)
            .map(|o| o.id)
            .collect();

        self.statemach.update_container(cid, |c| c.reset()).await?;
        for oid in redeploy {
            self.statemach
                .set_operator_state(oid, OperatorState::PendingDeploy)
                .await?;
        }
        self.last_heartbeat.remove(&cid);
        pf_info!("container {} '{}' scheduled for restart", cid, external_id);
        self.maybe_rotate().await
    }

    /// Replaces a terminated container: it becomes `Killed` and a new
    /// container takes over its operators. Returns the new container's id.
    pub async fn container_terminated(
        &mut self,
        external_id: &str,
    ) -> Result<ContainerId, DagError> {
        let Some(container) = self.plan().container_by_external_id(external_id)
        else {
            return logged_err!("unknown terminated container '{}'", external_id);
        };
        let (plan, new_id) =
            self.plan().with_replaced_container(container.id)?;
        pf_info!(
            "container {} '{}' terminated, replaced by {}",
            container.id,
            external_id,
            new_id
        );
        self.install_plan(plan).await?;
        Ok(new_id)
    }

    /// Drops checkpoints of an operator below a window id, together with
    /// their stored artifacts. Returns how many were dropped.
    pub async fn purge_checkpoints(
        &mut self,
        id: OperatorId,
        below_window: u64,
    ) -> Result<usize, DagError> {
        let purged = self.statemach.purge_checkpoints(id, below_window).await?;
        for window_id in &purged {
            self.agent.delete(id, *window_id).await?;
        }
        self.maybe_rotate().await?;
        Ok(purged.len())
    }

    /// Applies a plan-modification batch: the whole batch is validated and
    /// applied to a copy of the plan, the copy is snapshotted, and only then
    /// does it replace the live plan.
    pub async fn apply_plan_change(
        &mut self,
        changes: &[PlanChange],
    ) -> Result<(), DagError> {
        let plan = self.plan().with_changes(changes, self.placer.as_ref())?;
        self.install_plan(plan).await?;
        pf_info!(
            "applied plan change of {} requests, snapshot {}",
            changes.len(),
            self.store.generation()
        );
        Ok(())
    }

    /// Applies a queued batch and reports the outcome to its submitter.
    pub(super) async fn handle_plan_change(&mut self, req: PlanChangeReq) {
        let result = self.apply_plan_change(&req.changes).await;
        if let Err(e) = &result {
            pf_error!("plan change rejected: {}", e);
        }
        if req.tx_done.send(result).is_err() {
            pf_debug!("plan change submitter went away");
        }
    }

    /// Re-establishes a lost journal, applies at most one queued
    /// plan-modification batch, then restarts containers whose heartbeats
    /// stopped.
    pub async fn monitor_heartbeat(&mut self) -> Result<(), DagError> {
        self.maybe_rotate().await?;
        if let Ok(req) = self.rx_change.try_recv() {
            self.handle_plan_change(req).await;
        }

        let timeout = Duration::from_millis(self.config.heartbeat_timeout_ms);
        let now = Instant::now();
        let lost: Vec<String> = self
            .plan()
            .containers()
            .filter(|c| c.state == ContainerState::Active)
            .filter(|c| {
                self.last_heartbeat
                    .get(&c.id)
                    .map_or(false, |t| now.duration_since(*t) > timeout)
            })
            .filter_map(|c| c.external_id.clone())
            .collect();
        let conns = self.reactor.as_ref().map_or(0, |r| r.num_conns());
        for external_id in lost {
            pf_warn!(
                "container '{}' heartbeat timed out ({} worker conns open)",
                external_id,
                conns
            );
            self.schedule_container_restart(&external_id).await?;
        }
        Ok(())
    }

    async fn recv_call(
        reactor: &mut Option<WorkerReactor>,
    ) -> Result<WorkerCall, DagError> {
        match reactor {
            Some(reactor) => reactor.recv_call().await,
            None => std::future::pending().await,
        }
    }

    /// Main event loop of the cluster manager. Breaks out of the loop only
    /// upon catching a termination signal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<(), DagError> {
        let mut ticker = time::interval(Duration::from_millis(
            self.config.monitor_interval_ms,
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                // worker call
                call = Self::recv_call(&mut self.reactor) => {
                    match call {
                        Ok(call) => {
                            if let Err(e) = self.handle_call(call).await {
                                pf_error!("error handling worker call: {}", e);
                            }
                        }
                        Err(e) => {
                            pf_error!("error receiving worker call: {}", e);
                            break;
                        }
                    }
                },

                // plan modification submitted
                req = self.rx_change.recv() => {
                    if let Some(req) = req {
                        self.handle_plan_change(req).await;
                    }
                },

                // monitor tick
                _ = ticker.tick() => {
                    if let Err(e) = self.monitor_heartbeat().await {
                        pf_error!("error monitoring heartbeats: {}", e);
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!("manager caught termination signal");
                    break;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod clusman_tests {
    use super::*;
    use crate::plan::{
        Checkpoint, NoObservers, OperatorMeta, OperatorStats, PortRef,
        RoundRobinPlacer, StatsObserver,
    };
    use crate::journal::MemSink;
    use crate::recovery::FsStorageAgent;
    use crate::rpc::{
        ContainerHeartbeat, DeployState, FailoverRpcProxy, OperatorHeartbeat,
    };
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::fs;

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

    fn config_str(dir: &str) -> String {
        format!(
            "app_path = '{}'\nbind_addr = '127.0.0.1:0'\nretry_timeout_ms = 3000",
            dir
        )
    }

    async fn start_manager(
        dir: &str,
        logical: Option<LogicalPlan>,
        counter: &Arc<CountingObserver>,
    ) -> Result<ClusterManager, DagError> {
        ClusterManager::new_and_setup(
            Some(&config_str(dir)),
            logical,
            Arc::new(FsStorageAgent::new(dir)),
            Box::new(RoundRobinPlacer),
            Arc::new(ListeningContext(counter.clone())),
        )
        .await
    }

    fn single_op_dag() -> Result<LogicalPlan, DagError> {
        let mut dag = LogicalPlan::new();
        dag.add_operator("o1", "StatsListeningOperator")?;
        Ok(dag)
    }

    fn heartbeat(
        external_id: &str,
        operators: Vec<OperatorHeartbeat>,
    ) -> ContainerHeartbeat {
        ContainerHeartbeat {
            external_id: external_id.into(),
            buffer_addr: None,
            operators,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn container_manager_recovery() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-recovery";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let buffer_addr = NetAddr::new("localhost", 9010);

        // fresh start writes the initial snapshot
        let mut mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        assert!(Path::new(dir).join("snapshot").exists());
        assert_eq!(mgr.plan().containers().count(), 1);
        let o1 = mgr.plan().operators_of("o1")[0].id;
        let cid = mgr.plan().operators_of("o1")[0].container;
        mgr.allocate_container(cid, "container-1", "host1", Some(buffer_addr.clone()), 1024)
            .await?;
        assert_eq!(
            mgr.plan().container(cid).map(|c| c.state),
            Some(ContainerState::Allocated)
        );
        drop(mgr);

        // restore from initial snapshot + journal
        let mut mgr = start_manager(dir, Some(LogicalPlan::new()), &counter).await?;
        let op = mgr.plan().operator(o1).cloned();
        assert_eq!(op.as_ref().map(|o| o.state), Some(OperatorState::PendingDeploy));
        let container = mgr.plan().container(cid).cloned();
        assert_eq!(container.as_ref().map(|c| c.state), Some(ContainerState::Allocated));
        assert_eq!(
            container.as_ref().and_then(|c| c.external_id.clone()),
            Some("container-1".into())
        );
        assert_eq!(container.and_then(|c| c.buffer_addr), Some(buffer_addr.clone()));
        assert_eq!(mgr.statemach().observer_count(o1), 1);
        assert_eq!(counter.0.load(Ordering::SeqCst), 0);

        // container terminated while the master was down
        mgr.schedule_container_restart("container-1").await?;
        assert_eq!(
            mgr.plan().container(cid).map(|c| c.state),
            Some(ContainerState::New)
        );
        mgr.allocate_container(cid, "container-2", "host1", Some(buffer_addr.clone()), 1024)
            .await?;
        mgr.agent.save(o1, 3, b"checkpoint-3").await?;
        let response = mgr
            .process_heartbeat(&heartbeat(
                "container-2",
                vec![OperatorHeartbeat {
                    operator_id: o1,
                    deploy_state: DeployState::Active,
                    current_window_id: 3,
                    checkpoint: Some(Checkpoint::new(3)),
                    stats: OperatorStats::default(),
                }],
            ))
            .await?;
        assert!(response.deploy.is_empty());
        assert_eq!(
            mgr.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::Active)
        );
        assert_eq!(
            mgr.plan().container(cid).map(|c| c.state),
            Some(ContainerState::Active)
        );
        assert_eq!(counter.0.load(Ordering::SeqCst), 1);

        // logical plan modification forces a snapshot
        let generation = mgr.snapshot_generation();
        let mut done = mgr.handle().submit_plan_change(vec![
            PlanChange::CreateOperator {
                name: "o2".into(),
                class: "GenericTestOperator".into(),
            },
            PlanChange::CreateStream {
                name: "s1".into(),
                source: PortRef::new("o1", "outputPort"),
                sink: PortRef::new("o2", "input1"),
            },
        ])?;
        let result = loop {
            if let Some(result) = done.try_result() {
                break result;
            }
            mgr.monitor_heartbeat().await?;
        };
        result?;
        assert_eq!(mgr.plan().logical().operators.len(), 2);
        assert!(mgr.snapshot_generation() > generation);
        assert_eq!(mgr.statemach().journal().entries_written(), 0);

        // operator state change goes to the journal
        mgr.set_operator_state(o1, OperatorState::Inactive).await?;
        assert_eq!(mgr.statemach().journal().entries_written(), 1);

        // checkpoint written while the master is out
        mgr.agent.save(o1, 10, b"checkpoint-10").await?;
        drop(mgr);

        let mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        assert_eq!(mgr.plan().logical().operators.len(), 2);
        let op = mgr.plan().operator(o1).cloned();
        assert_eq!(op.as_ref().map(|o| o.state), Some(OperatorState::Inactive));
        assert_eq!(mgr.statemach().observer_count(o1), 1);
        let container = mgr.plan().container(cid).cloned();
        assert_eq!(container.as_ref().map(|c| c.state), Some(ContainerState::Active));
        assert_eq!(container.and_then(|c| c.buffer_addr), Some(buffer_addr));

        // offline checkpoint detection
        assert_eq!(
            op.map(|o| o.checkpoints).unwrap_or_default(),
            vec![Checkpoint::new(3), Checkpoint::new(10)]
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn no_snapshot_no_plan_fails() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-noplan";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        assert!(start_manager(dir, None, &counter).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn bad_plan_change_leaves_plan() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-badchange";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let mut mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        let before = mgr.plan().clone();
        let generation = mgr.snapshot_generation();

        let done = mgr.handle().submit_plan_change(vec![
            PlanChange::CreateOperator {
                name: "o2".into(),
                class: "GenericTestOperator".into(),
            },
            PlanChange::RemoveStream {
                name: "nonexistent".into(),
            },
        ])?;
        mgr.monitor_heartbeat().await?;
        assert!(done.await.is_err());
        assert_eq!(mgr.plan(), &before);
        assert_eq!(mgr.snapshot_generation(), generation);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn terminated_container_replaced() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-replace";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let mut mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        let o1 = mgr.plan().operators_of("o1")[0].id;
        let cid = mgr.plan().operators_of("o1")[0].container;
        mgr.allocate_container(cid, "container-1", "host1", None, 512)
            .await?;
        let generation = mgr.snapshot_generation();

        let new_id = mgr.container_terminated("container-1").await?;
        assert_ne!(new_id, cid);
        assert!(mgr.snapshot_generation() > generation);
        assert_eq!(
            mgr.plan().container(cid).map(|c| c.state),
            Some(ContainerState::Killed)
        );
        assert_eq!(mgr.plan().operator(o1).map(|o| o.container), Some(new_id));
        assert_eq!(mgr.statemach().observer_count(o1), 1);

        // the killed container is told to shut down
        let response = mgr.process_heartbeat(&heartbeat("container-1", vec![])).await?;
        assert!(response.shutdown);
        assert!(mgr.process_heartbeat(&heartbeat("nobody", vec![])).await.is_err());
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn purge_deletes_artifacts() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-purge";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let agent = FsStorageAgent::new(dir);
        let mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        let o1 = mgr.plan().operators_of("o1")[0].id;
        drop(mgr);

        // artifacts stored while down are picked up on recovery
        for w in [1, 3, 10] {
            agent.save(o1, w, b"data").await?;
        }
        let mut mgr = start_manager(dir, None, &counter).await?;
        assert_eq!(
            mgr.plan().operator(o1).map(|o| o.checkpoints.len()),
            Some(3)
        );

        assert_eq!(mgr.purge_checkpoints(o1, 10).await?, 2);
        assert_eq!(agent.window_ids(o1).await?, vec![10]);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn lost_journal_recovered_by_snapshot() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-lostjournal";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let mut mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        let o1 = mgr.plan().operators_of("o1")[0].id;
        let generation = mgr.snapshot_generation();

        let sink = MemSink::new();
        sink.set_torn(true);
        mgr.statemach.set_output(Box::new(sink));
        assert!(mgr.set_operator_state(o1, OperatorState::Active).await.is_err());
        assert!(mgr.set_operator_state(o1, OperatorState::Active).await.is_err());
        assert_eq!(
            mgr.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::PendingDeploy)
        );

        // the next monitor tick snapshots and journaling resumes
        mgr.monitor_heartbeat().await?;
        assert_eq!(mgr.snapshot_generation(), generation + 1);
        mgr.set_operator_state(o1, OperatorState::Inactive).await?;
        drop(mgr);

        let mgr = start_manager(dir, None, &counter).await?;
        assert_eq!(
            mgr.plan().operator(o1).map(|o| o.state),
            Some(OperatorState::Inactive)
        );
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 1)]
    async fn routine_mutations_rotate() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-rotate";
        let _ = fs::remove_dir_all(dir).await;
        let config = format!("app_path = '{}'\njournal_max_entries = 2", dir);
        let mut mgr = ClusterManager::new_and_setup(
            Some(&config),
            Some(single_op_dag()?),
            Arc::new(FsStorageAgent::new(dir)),
            Box::new(RoundRobinPlacer),
            Arc::new(NoObservers),
        )
        .await?;
        let o1 = mgr.plan().operators_of("o1")[0].id;
        let generation = mgr.snapshot_generation();

        mgr.set_operator_state(o1, OperatorState::Active).await?;
        assert_eq!(mgr.snapshot_generation(), generation);
        mgr.set_operator_state(o1, OperatorState::Inactive).await?;
        assert_eq!(mgr.snapshot_generation(), generation + 1);
        assert_eq!(mgr.statemach().journal().entries_written(), 0);
        Ok(())
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn serve_worker_heartbeats() -> Result<(), DagError> {
        let dir = "/tmp/dagmaster-test-clusman-serve";
        let _ = fs::remove_dir_all(dir).await;
        let counter = Arc::new(CountingObserver(AtomicUsize::new(0)));
        let mut mgr = start_manager(dir, Some(single_op_dag()?), &counter).await?;
        let o1 = mgr.plan().operators_of("o1")[0].id;
        let cid = mgr.plan().operators_of("o1")[0].container;
        mgr.allocate_container(cid, "container-1", "host1", None, 1024)
            .await?;
        mgr.serve().await?;

        let (tx_term, rx_term) = watch::channel(false);
        let manager = tokio::spawn(async move {
            mgr.run(rx_term).await?;
            Ok::<_, DagError>(mgr)
        });

        let proxy = FailoverRpcProxy::new_and_setup(dir).await?;
        let response = proxy.heartbeat(heartbeat("container-1", vec![])).await?;
        assert_eq!(response.deploy.len(), 1);
        assert_eq!(response.deploy[0].operator_id, o1);
        assert_eq!(response.deploy[0].class, "StatsListeningOperator");
        proxy.log("container-1", "hello").await?;
        let res = proxy.heartbeat(heartbeat("nobody", vec![])).await;
        assert!(matches!(&res, Err(e) if e.is_remote()));

        tx_term.send(true).map_err(DagError::msg)?;
        let mgr = manager.await.map_err(DagError::msg)??;
        assert_eq!(
            mgr.plan().container(cid).map(|c| c.state),
            Some(ContainerState::Active)
        );
        Ok(())
    }
}

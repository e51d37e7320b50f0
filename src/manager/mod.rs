//! The master's cluster manager: owns the plan state machine, serves
//! worker calls, and applies plan modifications.

mod clusman;
mod heartbeat;

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use crate::plan::PlanChange;
use crate::utils::DagError;

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot};

pub use clusman::ClusterManager;

/// Configuration parameters struct.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Application recovery directory.
    pub app_path: String,

    /// Worker-facing RPC listen address.
    pub bind_addr: String,

    /// Host published in the connect record.
    pub advertise_host: String,

    /// Per-call timeout published to workers in millisecs.
    pub rpc_timeout_ms: u64,

    /// Delay between proxy retries in millisecs.
    pub retry_delay_ms: u64,

    /// Cumulative proxy retry budget in millisecs.
    pub retry_timeout_ms: u64,

    /// Journal entries after which a snapshot is taken (0 = off).
    pub journal_max_entries: usize,

    /// Journal bytes after which a snapshot is taken (0 = off).
    pub journal_max_bytes: usize,

    /// A container silent for this long is restarted, in millisecs.
    pub heartbeat_timeout_ms: u64,

    /// Interval of the monitor tick in millisecs.
    pub monitor_interval_ms: u64,
}

#[allow(clippy::derivable_impls)]
impl Default for ManagerConfig {
    fn default() -> Self {
        ManagerConfig {
            app_path: "/tmp/dagmaster.app".into(),
            bind_addr: "0.0.0.0:0".into(),
            advertise_host: "127.0.0.1".into(),
            rpc_timeout_ms: 5000,
            retry_delay_ms: 100,
            retry_timeout_ms: 30000,
            journal_max_entries: 1000,
            journal_max_bytes: 1024 * 1024,
            heartbeat_timeout_ms: 30000,
            monitor_interval_ms: 1000,
        }
    }
}

/// A submitted plan-modification batch.
pub(crate) struct PlanChangeReq {
    pub(crate) changes: Vec<PlanChange>,
    pub(crate) tx_done: oneshot::Sender<Result<(), DagError>>,
}

/// Cloneable handle for submitting work to a running manager.
#[derive(Clone)]
pub struct ManagerHandle {
    tx_change: mpsc::UnboundedSender<PlanChangeReq>,
}

impl ManagerHandle {
    /// Queues a plan-modification batch. Batches are applied one at a time
    /// by the manager loop; the returned future resolves once the batch is
    /// durable, or with the error that rejected the whole batch.
    pub fn submit_plan_change(
        &self,
        changes: Vec<PlanChange>,
    ) -> Result<PlanChangeFuture, DagError> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx_change
            .send(PlanChangeReq { changes, tx_done })
            .map_err(|_| DagError::msg("cluster manager has exited"))?;
        Ok(PlanChangeFuture { rx_done })
    }
}

/// Completion of a submitted plan-modification batch.
pub struct PlanChangeFuture {
    rx_done: oneshot::Receiver<Result<(), DagError>>,
}

impl PlanChangeFuture {
    /// Returns the outcome if the batch has been processed, without
    /// waiting.
    pub fn try_result(&mut self) -> Option<Result<(), DagError>> {
        match self.rx_done.try_recv() {
            Ok(result) => Some(result),
            Err(oneshot::error::TryRecvError::Empty) => None,
            Err(oneshot::error::TryRecvError::Closed) => {
                Some(Err(DagError::msg("plan change dropped by manager")))
            }
        }
    }
}

impl Future for PlanChangeFuture {
    type Output = Result<(), DagError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx_done).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(e)) => Poll::Ready(Err(e.into())),
            Poll::Pending => Poll::Pending,
        }
    }
}

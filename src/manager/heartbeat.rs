//! Handling of worker heartbeats and other umbilical calls.

use crate::manager::ClusterManager;
use crate::plan::{ContainerState, OperatorId, OperatorState};
use crate::rpc::{
    ContainerHeartbeat, DeployState, HeartbeatResponse, OperatorDeployInfo,
    UmbilicalReply, UmbilicalRequest, WorkerCall,
};
use crate::utils::DagError;

use tokio::time::Instant;

impl ClusterManager {
    /// Processes one container heartbeat: activates the container, moves
    /// reported operators through their lifecycle, records their checkpoints
    /// and stats, and tells the container what to deploy or undeploy.
    pub async fn process_heartbeat(
        &mut self,
        heartbeat: &ContainerHeartbeat,
    ) -> Result<HeartbeatResponse, DagError> {
        let Some(cid) = self.find_container(&heartbeat.external_id) else {
            return logged_err!(
                "heartbeat from unknown container '{}'",
                heartbeat.external_id
            );
        };
        let mut response = HeartbeatResponse::default();
        let state = self.plan().container(cid).map(|c| c.state);
        if state == Some(ContainerState::Killed) {
            pf_warn!(
                "heartbeat from killed container '{}'",
                heartbeat.external_id
            );
            response.shutdown = true;
            return Ok(response);
        }
        self.last_heartbeat.insert(cid, Instant::now());

        if matches!(
            state,
            Some(ContainerState::New) | Some(ContainerState::Allocated)
        ) {
            let buffer_addr = heartbeat.buffer_addr.clone();
            self.statemach
                .update_container(cid, |c| {
                    c.state = ContainerState::Active;
                    if buffer_addr.is_some() {
                        c.buffer_addr = buffer_addr;
                    }
                })
                .await?;
            pf_info!("container {} '{}' active", cid, heartbeat.external_id);
        }

        for report in &heartbeat.operators {
            let oid = report.operator_id;
            let Some(op) = self.plan().operator(oid) else {
                response.undeploy.push(oid);
                continue;
            };
            if op.container != cid {
                response.undeploy.push(oid);
                continue;
            }
            let op_state = op.state;

            match report.deploy_state {
                DeployState::Active => {
                    if op_state == OperatorState::Inactive {
                        response.undeploy.push(oid);
                    } else if op_state == OperatorState::PendingDeploy {
                        self.statemach
                            .set_operator_state(oid, OperatorState::Active)
                            .await?;
                    }
                }
                DeployState::Failed => {
                    if op_state != OperatorState::Inactive {
                        pf_warn!("operator {} reported failed", oid);
                        self.statemach
                            .set_operator_state(
                                oid,
                                OperatorState::PendingDeploy,
                            )
                            .await?;
                    }
                }
                DeployState::Idle => {}
            }

            if let Some(checkpoint) = &report.checkpoint {
                if let Err(e) =
                    self.statemach.record_checkpoint(oid, checkpoint.clone())
                {
                    pf_warn!("dropping checkpoint of operator {}: {}", oid, e);
                }
            }
            self.statemach.notify_stats(oid, &report.stats);
        }

        for op in self.plan().operators_on(cid) {
            if op.state != OperatorState::PendingDeploy {
                continue;
            }
            let Some(meta) = self.plan().logical().operator(&op.logical) else {
                continue;
            };
            response.deploy.push(OperatorDeployInfo {
                operator_id: op.id,
                logical: op.logical.clone(),
                class: meta.class.clone(),
                partition: op.partition,
                checkpoint: op.recent_checkpoint().cloned(),
            });
        }

        self.maybe_rotate().await?;
        Ok(response)
    }

    /// Marks operators a container reported as errored for redeployment.
    async fn redeploy_errored(
        &mut self,
        external_id: &str,
        operators: &[OperatorId],
    ) -> Result<(), DagError> {
        let Some(cid) = self
            .plan()
            .container_by_external_id(external_id)
            .map(|c| c.id)
        else {
            return logged_err!(
                "error report from unknown container '{}'",
                external_id
            );
        };
        for &oid in operators {
            let redeploy = self.plan().operator(oid).map_or(false, |op| {
                op.container == cid && op.state == OperatorState::Active
            });
            if redeploy {
                self.statemach
                    .set_operator_state(oid, OperatorState::PendingDeploy)
                    .await?;
            }
        }
        self.maybe_rotate().await
    }

    /// Serves one worker call and sends its reply.
    pub(super) async fn handle_call(
        &mut self,
        call: WorkerCall,
    ) -> Result<(), DagError> {
        let reply = match &call.req {
            UmbilicalRequest::Heartbeat(heartbeat) => {
                match self.process_heartbeat(heartbeat).await {
                    Ok(response) => UmbilicalReply::Heartbeat(response),
                    Err(e) => UmbilicalReply::Error(e.to_string()),
                }
            }
            UmbilicalRequest::Log { container, msg } => {
                pf_info!("[{}] {}", container, msg);
                UmbilicalReply::Ack
            }
            UmbilicalRequest::ReportError {
                container,
                operators,
                msg,
            } => {
                pf_error!("[{}] operators {:?}: {}", container, operators, msg);
                match self.redeploy_errored(container, operators).await {
                    Ok(()) => UmbilicalReply::Ack,
                    Err(e) => UmbilicalReply::Error(e.to_string()),
                }
            }
        };
        call.reply(reply)
    }
}

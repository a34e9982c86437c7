//! UI-visible status events and their fan-out.
//!
//! The controller writes every event to one bounded channel; the publisher
//! task drains it onto the status topic. There is no drop policy: when the
//! channel fills the controller blocks on the send.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::messaging::{Outbound, Topics};
use crate::store::{AgentId, ExecVertexId, ExecWfId, ExecutionId, Status};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum StatusEvent {
    ExecutionStarted {
        execution_id: ExecutionId,
        workflow_name: String,
        start_ts: DateTime<Utc>,
    },
    ExecutionFinished {
        execution_id: ExecutionId,
        status: Status,
        finish_ts: DateTime<Utc>,
    },
    WfStarted {
        execution_id: ExecutionId,
        exec_wf_id: ExecWfId,
    },
    WfFinished {
        execution_id: ExecutionId,
        exec_wf_id: ExecWfId,
        vertices: Vec<ExecVertexId>,
        success: bool,
    },
    JobStarted {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        agent_id: AgentId,
    },
    JobFinished {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        success: bool,
        status: Status,
        error_msg: Option<String>,
    },
}

/// Serializes status events onto the status topic via the publish channel.
pub fn spawn_status_publisher(
    mut rx: mpsc::Receiver<StatusEvent>,
    publish_tx: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = rx.recv() => {
                    let Some(event) = event else { break };
                    match serde_json::to_vec(&event) {
                        Ok(payload) => {
                            let out = Outbound {
                                topic: Topics::status().to_string(),
                                payload,
                            };
                            if publish_tx.send(out).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::error!(error = %e, "Status event encode failed"),
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

//! Typed wire envelopes for the agent protocol.
//!
//! Every payload is JSON with a `msg` discriminator, kebab-cased to match
//! the field names agents put on the wire.

use serde::{Deserialize, Serialize};

use crate::store::{AgentId, ExecVertexId, ExecWfId, ExecutionId, JobRow, Status};

/// Messages agents send to the conductor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum AgentMessage {
    AgentRegistering {
        agent_id: AgentId,
    },
    HeartbeatAck {
        agent_id: AgentId,
    },
    RunJobAck {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        agent_id: AgentId,
    },
    JobFinished {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        /// Absent on conductor-forced failures.
        agent_id: Option<AgentId>,
        success: bool,
        status: Status,
        error_msg: Option<String>,
        #[serde(default)]
        forced_by_conductor: bool,
    },
    Ping {
        reply_to: AgentId,
    },
}

/// Messages the conductor sends to agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg", rename_all = "kebab-case", rename_all_fields = "kebab-case")]
pub enum ConductorMessage {
    RunJob {
        job: JobRow,
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        /// Milliseconds after which the agent self-fails the job;
        /// `i64::MAX` means no timeout.
        timeout: i64,
    },
    JobFinishedAck {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
    },
    KillJob {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
    },
    Heartbeat,
    /// Asks agents to re-introduce themselves.
    AgentsRegister,
    AgentRegistered {
        agent_id: AgentId,
    },
    Pong {
        reply_to: AgentId,
    },
}

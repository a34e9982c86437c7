//! Persistent-store seam for the conductor.
//!
//! The conductor never talks to a database engine directly: everything it
//! persists goes through the [`Store`] trait, whose methods mirror the
//! snapshot schema (executions, execution workflows, vertices, edges) and
//! the read-only template tables (nodes, jobs, workflows, schedules).
//! Status-transition writes return `bool` so redelivered terminal messages
//! are detected at the store boundary and handled idempotently.

pub mod memory;

use std::collections::HashSet;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryStore;

pub type NodeId = i64;
pub type WorkflowId = i64;
pub type WfVertexId = i64;
pub type ScheduleId = i64;
pub type NodeScheduleId = i64;
pub type ExecutionId = i64;
pub type ExecWfId = i64;
pub type ExecVertexId = i64;
pub type AgentId = String;

/// Reserved workflow id used to run a single job as an execution.
pub const SYNTHETIC_WORKFLOW_ID: WorkflowId = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NodeType {
    Job,
    Workflow,
}

impl NodeType {
    pub fn as_id(self) -> i32 {
        match self {
            NodeType::Job => 1,
            NodeType::Workflow => 2,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(NodeType::Job),
            2 => Some(NodeType::Workflow),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Unexecuted,
    Started,
    FinishedSuccess,
    FinishedError,
    Aborted,
    Unknown,
    Pending,
}

impl Status {
    pub fn as_id(self) -> i32 {
        match self {
            Status::Unexecuted => 1,
            Status::Started => 2,
            Status::FinishedSuccess => 3,
            Status::FinishedError => 4,
            Status::Aborted => 5,
            Status::Unknown => 6,
            Status::Pending => 7,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            1 => Some(Status::Unexecuted),
            2 => Some(Status::Started),
            3 => Some(Status::FinishedSuccess),
            4 => Some(Status::FinishedError),
            5 => Some(Status::Aborted),
            6 => Some(Status::Unknown),
            7 => Some(Status::Pending),
            _ => None,
        }
    }

    /// Terminal statuses are never overwritten within the same run.
    /// `Unknown` is not terminal: the job may still be running on a
    /// quarantined agent and report back later.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Status::FinishedSuccess | Status::FinishedError | Status::Aborted
        )
    }
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Status::Unexecuted => "unexecuted",
            Status::Started => "started",
            Status::FinishedSuccess => "finished-success",
            Status::FinishedError => "finished-error",
            Status::Aborted => "aborted",
            Status::Unknown => "unknown",
            Status::Pending => "pending",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeRow {
    pub node_id: NodeId,
    pub node_type: NodeType,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRow {
    pub node_id: NodeId,
    pub command_line: String,
    pub execution_directory: Option<String>,
    pub agent_affinity: Option<HashSet<AgentId>>,
    pub max_retries: u32,
    pub max_concurrent: Option<u32>,
    pub timeout_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowVertexRow {
    pub wf_vertex_id: WfVertexId,
    pub workflow_id: WorkflowId,
    pub node_id: NodeId,
    pub layout: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdgeRow {
    pub workflow_id: WorkflowId,
    pub from_wf_vertex_id: WfVertexId,
    pub to_wf_vertex_id: WfVertexId,
    pub success: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduleRow {
    pub schedule_id: ScheduleId,
    pub cron_expression: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeScheduleRow {
    pub node_schedule_id: NodeScheduleId,
    pub node_id: NodeId,
    pub schedule_id: ScheduleId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRow {
    pub execution_id: ExecutionId,
    pub status: Status,
    pub start_ts: DateTime<Utc>,
    pub finish_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionWorkflowRow {
    pub exec_wf_id: ExecWfId,
    pub execution_id: ExecutionId,
    pub workflow_id: WorkflowId,
    pub root: bool,
    pub status: Status,
    pub start_ts: Option<DateTime<Utc>>,
    pub finish_ts: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionVertexRow {
    pub exec_vertex_id: ExecVertexId,
    pub exec_wf_id: ExecWfId,
    pub node_id: NodeId,
    pub status: Status,
    pub start_ts: Option<DateTime<Utc>>,
    pub finish_ts: Option<DateTime<Utc>>,
    pub layout: Option<String>,
    pub agent_id: Option<AgentId>,
    /// For workflow vertices, the child execution workflow this vertex
    /// expands into. Persisted so resumed executions reproduce the links.
    pub runs_exec_wf_id: Option<ExecWfId>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEdgeRow {
    pub execution_id: ExecutionId,
    pub from_exec_vertex_id: ExecVertexId,
    pub to_exec_vertex_id: ExecVertexId,
    pub success: bool,
}

#[async_trait]
pub trait Store: Send + Sync {
    // Template tables (written by the CRUD collaborator, read-only here).
    async fn node(&self, node_id: NodeId) -> Result<Option<NodeRow>>;
    async fn nodes(&self) -> Result<Vec<NodeRow>>;
    async fn job(&self, node_id: NodeId) -> Result<Option<JobRow>>;
    async fn workflow_vertices(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVertexRow>>;
    async fn workflow_edges(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowEdgeRow>>;
    async fn schedule(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleRow>>;
    async fn schedules(&self) -> Result<Vec<ScheduleRow>>;
    async fn node_schedules(&self) -> Result<Vec<NodeScheduleRow>>;
    async fn node_schedules_for_node(&self, node_id: NodeId) -> Result<Vec<NodeScheduleRow>>;

    // Execution snapshot creation.
    async fn insert_execution(
        &self,
        status: Status,
        start_ts: DateTime<Utc>,
    ) -> Result<ExecutionId>;
    async fn insert_execution_workflow(
        &self,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        root: bool,
    ) -> Result<ExecWfId>;
    async fn insert_execution_vertex(
        &self,
        exec_wf_id: ExecWfId,
        node_id: NodeId,
        layout: Option<String>,
    ) -> Result<ExecVertexId>;
    async fn insert_execution_edge(&self, edge: ExecutionEdgeRow) -> Result<()>;
    async fn set_vertex_runs_workflow(
        &self,
        exec_vertex_id: ExecVertexId,
        child_exec_wf_id: ExecWfId,
    ) -> Result<()>;

    // Execution snapshot reads.
    async fn execution(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRow>>;
    async fn execution_workflows(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionWorkflowRow>>;
    async fn execution_vertices(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionVertexRow>>;
    async fn execution_edges(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionEdgeRow>>;

    // Status transitions.
    async fn mark_execution_started(
        &self,
        execution_id: ExecutionId,
        start_ts: DateTime<Utc>,
    ) -> Result<()>;
    async fn finish_execution(
        &self,
        execution_id: ExecutionId,
        status: Status,
        finish_ts: DateTime<Utc>,
    ) -> Result<()>;
    /// Marks the execution and all its non-terminal workflows and vertices
    /// aborted in one transaction.
    async fn abort_execution(&self, execution_id: ExecutionId, ts: DateTime<Utc>) -> Result<()>;
    async fn mark_exec_wf_started(&self, exec_wf_id: ExecWfId, ts: DateTime<Utc>) -> Result<()>;
    /// Returns `false` when the vertex is already `started` (a redelivered
    /// `run-job-ack`); the caller must then skip its side effects.
    async fn mark_vertex_started(
        &self,
        exec_vertex_id: ExecVertexId,
        agent_id: Option<&str>,
        ts: DateTime<Utc>,
    ) -> Result<bool>;
    /// Returns `false` when the vertex already carries a terminal status
    /// (a redelivered `job-finished`).
    async fn finish_vertex(
        &self,
        exec_vertex_id: ExecVertexId,
        status: Status,
        ts: DateTime<Utc>,
    ) -> Result<bool>;
    /// Finishes a chain of workflow vertices and their execution workflows
    /// in one transaction.
    async fn finish_workflow_chain(
        &self,
        vertex_ids: &[ExecVertexId],
        exec_wf_ids: &[ExecWfId],
        status: Status,
        ts: DateTime<Utc>,
    ) -> Result<()>;
    async fn mark_vertices_unknown(&self, vertex_ids: &[ExecVertexId]) -> Result<()>;
}

const RETRY_ATTEMPTS: u32 = 3;

/// Retries a transient store or publish operation with doubling backoff.
/// After the last attempt the error propagates to the guarded dispatch
/// boundary, which logs it and leaves the execution for watchdog/resume
/// recovery.
pub async fn with_retries<T, Fut, F>(op: &'static str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = Duration::from_millis(50);
    let mut attempt = 1;
    loop {
        match f().await {
            Ok(v) => return Ok(v),
            Err(e) if attempt < RETRY_ATTEMPTS => {
                tracing::warn!(op, attempt, error = %e, "Transient failure, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(e) => {
                tracing::error!(op, attempt, error = %e, "Operation failed after retries");
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{NodeType, Status};

    #[test]
    fn status_ids_are_stable() {
        for status in [
            Status::Unexecuted,
            Status::Started,
            Status::FinishedSuccess,
            Status::FinishedError,
            Status::Aborted,
            Status::Unknown,
            Status::Pending,
        ] {
            assert_eq!(Status::from_id(status.as_id()), Some(status));
        }
        assert_eq!(Status::Unexecuted.as_id(), 1);
        assert_eq!(Status::Pending.as_id(), 7);
        assert_eq!(Status::from_id(0), None);
    }

    #[test]
    fn node_type_ids_are_stable() {
        assert_eq!(NodeType::Job.as_id(), 1);
        assert_eq!(NodeType::Workflow.as_id(), 2);
        assert_eq!(NodeType::from_id(2), Some(NodeType::Workflow));
        assert_eq!(NodeType::from_id(3), None);
    }

    #[test]
    fn unknown_is_not_terminal() {
        assert!(!Status::Unknown.is_terminal());
        assert!(!Status::Started.is_terminal());
        assert!(Status::Aborted.is_terminal());
    }
}

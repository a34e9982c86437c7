//! In-memory [`Store`] implementation.
//!
//! Backs the test harness and the default binary. Fixture methods
//! (`put_node`, `add_workflow_vertex`, ...) stand in for the CRUD
//! collaborator that owns the template tables in a real deployment.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use super::{
    ExecVertexId, ExecWfId, ExecutionEdgeRow, ExecutionId, ExecutionRow, ExecutionVertexRow,
    ExecutionWorkflowRow, JobRow, NodeId, NodeRow, NodeScheduleId, NodeScheduleRow, ScheduleId,
    ScheduleRow, Status, Store, WfVertexId, WorkflowEdgeRow, WorkflowId, WorkflowVertexRow,
};
use crate::error::Result;

#[derive(Debug, Default)]
struct Inner {
    nodes: HashMap<NodeId, NodeRow>,
    jobs: HashMap<NodeId, JobRow>,
    workflow_vertices: HashMap<WfVertexId, WorkflowVertexRow>,
    workflow_edges: Vec<WorkflowEdgeRow>,
    schedules: HashMap<ScheduleId, ScheduleRow>,
    node_schedules: HashMap<NodeScheduleId, NodeScheduleRow>,

    executions: HashMap<ExecutionId, ExecutionRow>,
    execution_workflows: HashMap<ExecWfId, ExecutionWorkflowRow>,
    execution_vertices: HashMap<ExecVertexId, ExecutionVertexRow>,
    execution_edges: Vec<ExecutionEdgeRow>,

    next_wf_vertex_id: WfVertexId,
    next_node_schedule_id: NodeScheduleId,
    next_execution_id: ExecutionId,
    next_exec_wf_id: ExecWfId,
    next_exec_vertex_id: ExecVertexId,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    // Fixture API, standing in for the CRUD collaborator.

    pub fn put_node(&self, node: NodeRow) {
        self.inner.lock().nodes.insert(node.node_id, node);
    }

    pub fn put_job(&self, job: JobRow) {
        self.inner.lock().jobs.insert(job.node_id, job);
    }

    pub fn put_schedule(&self, schedule: ScheduleRow) {
        self.inner
            .lock()
            .schedules
            .insert(schedule.schedule_id, schedule);
    }

    pub fn put_node_schedule(&self, node_id: NodeId, schedule_id: ScheduleId) -> NodeScheduleId {
        let mut inner = self.inner.lock();
        inner.next_node_schedule_id += 1;
        let id = inner.next_node_schedule_id;
        inner.node_schedules.insert(
            id,
            NodeScheduleRow {
                node_schedule_id: id,
                node_id,
                schedule_id,
            },
        );
        id
    }

    pub fn add_workflow_vertex(
        &self,
        workflow_id: WorkflowId,
        node_id: NodeId,
        layout: Option<String>,
    ) -> WfVertexId {
        let mut inner = self.inner.lock();
        inner.next_wf_vertex_id += 1;
        let id = inner.next_wf_vertex_id;
        inner.workflow_vertices.insert(
            id,
            WorkflowVertexRow {
                wf_vertex_id: id,
                workflow_id,
                node_id,
                layout,
            },
        );
        id
    }

    pub fn add_workflow_edge(
        &self,
        workflow_id: WorkflowId,
        from: WfVertexId,
        to: WfVertexId,
        success: bool,
    ) {
        self.inner.lock().workflow_edges.push(WorkflowEdgeRow {
            workflow_id,
            from_wf_vertex_id: from,
            to_wf_vertex_id: to,
            success,
        });
    }

    /// Direct row read used by test assertions.
    pub fn vertex_row(&self, exec_vertex_id: ExecVertexId) -> Option<ExecutionVertexRow> {
        self.inner.lock().execution_vertices.get(&exec_vertex_id).cloned()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn node(&self, node_id: NodeId) -> Result<Option<NodeRow>> {
        Ok(self.inner.lock().nodes.get(&node_id).cloned())
    }

    async fn nodes(&self) -> Result<Vec<NodeRow>> {
        Ok(self.inner.lock().nodes.values().cloned().collect())
    }

    async fn job(&self, node_id: NodeId) -> Result<Option<JobRow>> {
        Ok(self.inner.lock().jobs.get(&node_id).cloned())
    }

    async fn workflow_vertices(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowVertexRow>> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .workflow_vertices
            .values()
            .filter(|v| v.workflow_id == workflow_id)
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.wf_vertex_id);
        Ok(rows)
    }

    async fn workflow_edges(&self, workflow_id: WorkflowId) -> Result<Vec<WorkflowEdgeRow>> {
        Ok(self
            .inner
            .lock()
            .workflow_edges
            .iter()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect())
    }

    async fn schedule(&self, schedule_id: ScheduleId) -> Result<Option<ScheduleRow>> {
        Ok(self.inner.lock().schedules.get(&schedule_id).cloned())
    }

    async fn schedules(&self) -> Result<Vec<ScheduleRow>> {
        Ok(self.inner.lock().schedules.values().cloned().collect())
    }

    async fn node_schedules(&self) -> Result<Vec<NodeScheduleRow>> {
        Ok(self.inner.lock().node_schedules.values().cloned().collect())
    }

    async fn node_schedules_for_node(&self, node_id: NodeId) -> Result<Vec<NodeScheduleRow>> {
        Ok(self
            .inner
            .lock()
            .node_schedules
            .values()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn insert_execution(
        &self,
        status: Status,
        start_ts: DateTime<Utc>,
    ) -> Result<ExecutionId> {
        let mut inner = self.inner.lock();
        inner.next_execution_id += 1;
        let id = inner.next_execution_id;
        inner.executions.insert(
            id,
            ExecutionRow {
                execution_id: id,
                status,
                start_ts,
                finish_ts: None,
            },
        );
        Ok(id)
    }

    async fn insert_execution_workflow(
        &self,
        execution_id: ExecutionId,
        workflow_id: WorkflowId,
        root: bool,
    ) -> Result<ExecWfId> {
        let mut inner = self.inner.lock();
        inner.next_exec_wf_id += 1;
        let id = inner.next_exec_wf_id;
        inner.execution_workflows.insert(
            id,
            ExecutionWorkflowRow {
                exec_wf_id: id,
                execution_id,
                workflow_id,
                root,
                status: Status::Unexecuted,
                start_ts: None,
                finish_ts: None,
            },
        );
        Ok(id)
    }

    async fn insert_execution_vertex(
        &self,
        exec_wf_id: ExecWfId,
        node_id: NodeId,
        layout: Option<String>,
    ) -> Result<ExecVertexId> {
        let mut inner = self.inner.lock();
        inner.next_exec_vertex_id += 1;
        let id = inner.next_exec_vertex_id;
        inner.execution_vertices.insert(
            id,
            ExecutionVertexRow {
                exec_vertex_id: id,
                exec_wf_id,
                node_id,
                status: Status::Unexecuted,
                start_ts: None,
                finish_ts: None,
                layout,
                agent_id: None,
                runs_exec_wf_id: None,
            },
        );
        Ok(id)
    }

    async fn insert_execution_edge(&self, edge: ExecutionEdgeRow) -> Result<()> {
        self.inner.lock().execution_edges.push(edge);
        Ok(())
    }

    async fn set_vertex_runs_workflow(
        &self,
        exec_vertex_id: ExecVertexId,
        child_exec_wf_id: ExecWfId,
    ) -> Result<()> {
        if let Some(v) = self
            .inner
            .lock()
            .execution_vertices
            .get_mut(&exec_vertex_id)
        {
            v.runs_exec_wf_id = Some(child_exec_wf_id);
        }
        Ok(())
    }

    async fn execution(&self, execution_id: ExecutionId) -> Result<Option<ExecutionRow>> {
        Ok(self.inner.lock().executions.get(&execution_id).cloned())
    }

    async fn execution_workflows(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionWorkflowRow>> {
        let mut rows: Vec<_> = self
            .inner
            .lock()
            .execution_workflows
            .values()
            .filter(|w| w.execution_id == execution_id)
            .cloned()
            .collect();
        rows.sort_by_key(|w| w.exec_wf_id);
        Ok(rows)
    }

    async fn execution_vertices(
        &self,
        execution_id: ExecutionId,
    ) -> Result<Vec<ExecutionVertexRow>> {
        let inner = self.inner.lock();
        let mut rows: Vec<_> = inner
            .execution_vertices
            .values()
            .filter(|v| {
                inner
                    .execution_workflows
                    .get(&v.exec_wf_id)
                    .map(|w| w.execution_id == execution_id)
                    .unwrap_or(false)
            })
            .cloned()
            .collect();
        rows.sort_by_key(|v| v.exec_vertex_id);
        Ok(rows)
    }

    async fn execution_edges(&self, execution_id: ExecutionId) -> Result<Vec<ExecutionEdgeRow>> {
        Ok(self
            .inner
            .lock()
            .execution_edges
            .iter()
            .filter(|e| e.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn mark_execution_started(
        &self,
        execution_id: ExecutionId,
        start_ts: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(e) = self.inner.lock().executions.get_mut(&execution_id) {
            e.status = Status::Started;
            e.start_ts = start_ts;
        }
        Ok(())
    }

    async fn finish_execution(
        &self,
        execution_id: ExecutionId,
        status: Status,
        finish_ts: DateTime<Utc>,
    ) -> Result<()> {
        if let Some(e) = self.inner.lock().executions.get_mut(&execution_id) {
            e.status = status;
            e.finish_ts = Some(finish_ts);
        }
        Ok(())
    }

    async fn abort_execution(&self, execution_id: ExecutionId, ts: DateTime<Utc>) -> Result<()> {
        let mut inner = self.inner.lock();
        if let Some(e) = inner.executions.get_mut(&execution_id) {
            e.status = Status::Aborted;
            e.finish_ts = Some(ts);
        }
        let wf_ids: Vec<ExecWfId> = inner
            .execution_workflows
            .values()
            .filter(|w| w.execution_id == execution_id)
            .map(|w| w.exec_wf_id)
            .collect();
        for wf_id in &wf_ids {
            if let Some(w) = inner.execution_workflows.get_mut(wf_id) {
                if !w.status.is_terminal() {
                    w.status = Status::Aborted;
                    w.finish_ts = Some(ts);
                }
            }
        }
        for v in inner.execution_vertices.values_mut() {
            if wf_ids.contains(&v.exec_wf_id) && !v.status.is_terminal() {
                v.status = Status::Aborted;
                v.finish_ts = Some(ts);
            }
        }
        Ok(())
    }

    async fn mark_exec_wf_started(&self, exec_wf_id: ExecWfId, ts: DateTime<Utc>) -> Result<()> {
        if let Some(w) = self.inner.lock().execution_workflows.get_mut(&exec_wf_id) {
            w.status = Status::Started;
            w.start_ts = Some(ts);
        }
        Ok(())
    }

    async fn mark_vertex_started(
        &self,
        exec_vertex_id: ExecVertexId,
        agent_id: Option<&str>,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.execution_vertices.get_mut(&exec_vertex_id) {
            Some(v) if v.status == Status::Started => Ok(false),
            Some(v) => {
                v.status = Status::Started;
                v.start_ts = Some(ts);
                if let Some(agent) = agent_id {
                    v.agent_id = Some(agent.to_string());
                }
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_vertex(
        &self,
        exec_vertex_id: ExecVertexId,
        status: Status,
        ts: DateTime<Utc>,
    ) -> Result<bool> {
        let mut inner = self.inner.lock();
        match inner.execution_vertices.get_mut(&exec_vertex_id) {
            Some(v) if v.status.is_terminal() => Ok(false),
            Some(v) => {
                v.status = status;
                v.finish_ts = Some(ts);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn finish_workflow_chain(
        &self,
        vertex_ids: &[ExecVertexId],
        exec_wf_ids: &[ExecWfId],
        status: Status,
        ts: DateTime<Utc>,
    ) -> Result<()> {
        // Unconditional writes: the controller closes each chain exactly
        // once per run, and a resumed execution overwrites the statuses
        // its previous run left behind.
        let mut inner = self.inner.lock();
        for id in vertex_ids {
            if let Some(v) = inner.execution_vertices.get_mut(id) {
                v.status = status;
                v.finish_ts = Some(ts);
            }
        }
        for id in exec_wf_ids {
            if let Some(w) = inner.execution_workflows.get_mut(id) {
                w.status = status;
                w.finish_ts = Some(ts);
            }
        }
        Ok(())
    }

    async fn mark_vertices_unknown(&self, vertex_ids: &[ExecVertexId]) -> Result<()> {
        let mut inner = self.inner.lock();
        for id in vertex_ids {
            if let Some(v) = inner.execution_vertices.get_mut(id) {
                if !v.status.is_terminal() {
                    v.status = Status::Unknown;
                }
            }
        }
        Ok(())
    }
}

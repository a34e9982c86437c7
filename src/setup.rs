//! Execution Setup: turns a workflow template (or a single job) into a
//! persisted execution snapshot and a finalized [`ExecutionModel`].
//!
//! Snapshotting copies every referenced template row into execution rows at
//! launch time, so later edits to the templates never affect a running or
//! resumable execution.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use crate::error::{ConductorError, Result};
use crate::model::ExecutionModel;
use crate::store::{
    ExecVertexId, ExecutionEdgeRow, ExecutionId, ExecutionVertexRow, ExecutionWorkflowRow,
    NodeId, NodeRow, NodeType, Status, Store, WfVertexId, WorkflowId, SYNTHETIC_WORKFLOW_ID,
};

/// Everything the controller needs to register a fresh or resumed
/// execution.
pub struct Launch {
    pub execution_id: ExecutionId,
    pub model: ExecutionModel,
    pub workflow_name: String,
    pub start_ts: DateTime<Utc>,
}

/// Snapshots a workflow template into a new execution and builds its model.
///
/// On a cyclic template the execution row is marked `finished_error` before
/// the error propagates, so the failed trigger stays visible post hoc.
pub async fn launch_workflow(store: &dyn Store, workflow_id: WorkflowId) -> Result<Launch> {
    let node = store
        .node(workflow_id)
        .await?
        .ok_or(ConductorError::NodeNotFound(workflow_id))?;
    let start_ts = Utc::now();
    let execution_id = store.insert_execution(Status::Pending, start_ts).await?;

    // Transitively collect every referenced sub-workflow template, once.
    let mut templates: Vec<WorkflowId> = vec![workflow_id];
    let mut seen: HashSet<WorkflowId> = templates.iter().copied().collect();
    let mut queue: VecDeque<WorkflowId> = templates.iter().copied().collect();
    while let Some(wid) = queue.pop_front() {
        for vertex in store.workflow_vertices(wid).await? {
            let referenced = store
                .node(vertex.node_id)
                .await?
                .ok_or(ConductorError::NodeNotFound(vertex.node_id))?;
            if referenced.node_type == NodeType::Workflow && seen.insert(vertex.node_id) {
                templates.push(vertex.node_id);
                queue.push_back(vertex.node_id);
            }
        }
    }

    let mut wf_of_template: HashMap<WorkflowId, i64> = HashMap::new();
    for wid in &templates {
        let exec_wf_id = store
            .insert_execution_workflow(execution_id, *wid, *wid == workflow_id)
            .await?;
        wf_of_template.insert(*wid, exec_wf_id);
    }

    // Project template vertices and edges into the snapshot, rewiring edge
    // endpoints to the freshly minted exec-vertex ids.
    let mut vertex_of: HashMap<(WorkflowId, WfVertexId), ExecVertexId> = HashMap::new();
    for wid in &templates {
        let exec_wf_id = wf_of_template[wid];
        for vertex in store.workflow_vertices(*wid).await? {
            let exec_vertex_id = store
                .insert_execution_vertex(exec_wf_id, vertex.node_id, vertex.layout.clone())
                .await?;
            vertex_of.insert((*wid, vertex.wf_vertex_id), exec_vertex_id);
        }
    }
    for wid in &templates {
        for edge in store.workflow_edges(*wid).await? {
            let from = *vertex_of
                .get(&(*wid, edge.from_wf_vertex_id))
                .ok_or(ConductorError::VertexNotFound(edge.from_wf_vertex_id))?;
            let to = *vertex_of
                .get(&(*wid, edge.to_wf_vertex_id))
                .ok_or(ConductorError::VertexNotFound(edge.to_wf_vertex_id))?;
            store
                .insert_execution_edge(ExecutionEdgeRow {
                    execution_id,
                    from_exec_vertex_id: from,
                    to_exec_vertex_id: to,
                    success: edge.success,
                })
                .await?;
        }
    }

    let model = build_initial_model(store, execution_id).await?;
    Ok(Launch {
        execution_id,
        model,
        workflow_name: node.name,
        start_ts,
    })
}

/// Snapshots a single job node as an execution over the reserved synthetic
/// workflow.
pub async fn launch_job(store: &dyn Store, node_id: NodeId) -> Result<Launch> {
    let node = store
        .node(node_id)
        .await?
        .ok_or(ConductorError::NodeNotFound(node_id))?;
    store
        .job(node_id)
        .await?
        .ok_or(ConductorError::JobNotFound(node_id))?;
    let start_ts = Utc::now();
    let execution_id = store.insert_execution(Status::Pending, start_ts).await?;
    let exec_wf_id = store
        .insert_execution_workflow(execution_id, SYNTHETIC_WORKFLOW_ID, true)
        .await?;
    store
        .insert_execution_vertex(exec_wf_id, node_id, None)
        .await?;

    let model = build_initial_model(store, execution_id).await?;
    Ok(Launch {
        execution_id,
        model,
        workflow_name: node.name,
        start_ts,
    })
}

/// Rebuilds the model of an existing execution for resume, replaying the
/// persisted vertex→child-workflow links instead of re-deriving them.
pub async fn resume(store: &dyn Store, execution_id: ExecutionId) -> Result<Launch> {
    let row = store
        .execution(execution_id)
        .await?
        .ok_or(ConductorError::ExecutionNotFound(execution_id))?;
    let workflows = store.execution_workflows(execution_id).await?;
    let vertices = store.execution_vertices(execution_id).await?;

    let mut model = load_snapshot(store, execution_id, &workflows, &vertices).await?;
    for vertex in &vertices {
        if let Some(child) = vertex.runs_exec_wf_id {
            model.set_vertex_runs_workflow(vertex.exec_vertex_id, child);
        }
    }
    model.finalize()?;

    let workflow_name = root_workflow_name(store, &workflows, &vertices).await?;
    Ok(Launch {
        execution_id,
        model,
        workflow_name,
        start_ts: row.start_ts,
    })
}

/// Loads the freshly inserted snapshot back out, derives the workflow
/// vertex links from the template mapping, finalizes, and persists the
/// links for later resume.
async fn build_initial_model(store: &dyn Store, execution_id: ExecutionId) -> Result<ExecutionModel> {
    let workflows = store.execution_workflows(execution_id).await?;
    let vertices = store.execution_vertices(execution_id).await?;

    let mut model = load_snapshot(store, execution_id, &workflows, &vertices).await?;

    let wf_of_template: HashMap<WorkflowId, i64> = workflows
        .iter()
        .map(|w| (w.workflow_id, w.exec_wf_id))
        .collect();
    let mut links: Vec<(ExecVertexId, i64)> = Vec::new();
    for vertex in &vertices {
        let is_workflow = model
            .vertex_attrs(vertex.exec_vertex_id)
            .map(|a| a.node_type == NodeType::Workflow)
            .unwrap_or(false);
        if is_workflow {
            if let Some(child) = wf_of_template.get(&vertex.node_id) {
                model.set_vertex_runs_workflow(vertex.exec_vertex_id, *child);
                links.push((vertex.exec_vertex_id, *child));
            }
        }
    }

    if let Err(e) = model.finalize() {
        store
            .finish_execution(execution_id, Status::FinishedError, Utc::now())
            .await?;
        tracing::warn!(execution_id, error = %e, "Snapshot rejected");
        return Err(e);
    }

    for (vertex_id, child) in links {
        store.set_vertex_runs_workflow(vertex_id, child).await?;
    }
    Ok(model)
}

/// Builds the unfinalized model from flat snapshot rows.
async fn load_snapshot(
    store: &dyn Store,
    execution_id: ExecutionId,
    workflows: &[ExecutionWorkflowRow],
    vertices: &[ExecutionVertexRow],
) -> Result<ExecutionModel> {
    let mut model = ExecutionModel::new();
    model.add_workflows(workflows.iter().map(|w| w.exec_wf_id));
    for wf in workflows {
        model.add_workflow_mapping(wf.exec_wf_id, wf.workflow_id);
        if wf.root {
            model.set_root_workflow(wf.exec_wf_id);
        }
    }

    model.add_vertices(vertices.iter().map(|v| v.exec_vertex_id));
    let mut node_cache: HashMap<NodeId, NodeRow> = HashMap::new();
    for vertex in vertices {
        let node = match node_cache.get(&vertex.node_id) {
            Some(n) => n.clone(),
            None => {
                let n = store
                    .node(vertex.node_id)
                    .await?
                    .ok_or(ConductorError::NodeNotFound(vertex.node_id))?;
                node_cache.insert(vertex.node_id, n.clone());
                n
            }
        };
        model.set_vertex_attrs(
            vertex.exec_vertex_id,
            vertex.node_id,
            node.name,
            node.node_type,
            vertex.exec_wf_id,
        );
    }

    let wf_of_vertex: HashMap<ExecVertexId, i64> = vertices
        .iter()
        .map(|v| (v.exec_vertex_id, v.exec_wf_id))
        .collect();
    for edge in store.execution_edges(execution_id).await? {
        let wf = wf_of_vertex
            .get(&edge.from_exec_vertex_id)
            .copied()
            .ok_or(ConductorError::VertexNotFound(edge.from_exec_vertex_id))?;
        model.add_dependency(wf, edge.from_exec_vertex_id, edge.to_exec_vertex_id, edge.success);
    }
    Ok(model)
}

async fn root_workflow_name(
    store: &dyn Store,
    workflows: &[ExecutionWorkflowRow],
    vertices: &[ExecutionVertexRow],
) -> Result<String> {
    let root = workflows
        .iter()
        .find(|w| w.root)
        .ok_or_else(|| ConductorError::Model("execution has no root workflow".to_string()))?;
    if root.workflow_id == SYNTHETIC_WORKFLOW_ID {
        // Synthetic executions are named after their single job node.
        let vertex = vertices
            .iter()
            .find(|v| v.exec_wf_id == root.exec_wf_id)
            .ok_or_else(|| ConductorError::Model("synthetic workflow is empty".to_string()))?;
        let node = store
            .node(vertex.node_id)
            .await?
            .ok_or(ConductorError::NodeNotFound(vertex.node_id))?;
        Ok(node.name)
    } else {
        let node = store
            .node(root.workflow_id)
            .await?
            .ok_or(ConductorError::NodeNotFound(root.workflow_id))?;
        Ok(node.name)
    }
}

//! In-memory image of one execution's graph.
//!
//! The model is built by [`crate::setup`] from the persisted snapshot rows
//! and then finalized. Before [`ExecutionModel::finalize`] it is a plain
//! builder; afterwards it is immutable and every query is safe to call from
//! concurrent readers. Vertices, workflows, and parents reference each
//! other by id, never by pointer.

use std::collections::{HashMap, HashSet};

use petgraph::algo::is_cyclic_directed;
use petgraph::graphmap::DiGraphMap;

use crate::error::{ConductorError, Result};
use crate::store::{ExecVertexId, ExecWfId, NodeId, NodeType, WorkflowId};

#[derive(Debug, Clone, PartialEq)]
pub struct VertexAttrs {
    pub node_id: NodeId,
    pub node_name: String,
    pub node_type: NodeType,
    pub exec_wf_id: ExecWfId,
}

#[derive(Debug, Default)]
struct VertexState {
    attrs: Option<VertexAttrs>,
    runs_exec_wf_id: Option<ExecWfId>,
    on_success: HashSet<ExecVertexId>,
    on_failure: HashSet<ExecVertexId>,
    parent_vertex: Option<ExecVertexId>,
}

#[derive(Debug, Default)]
struct WorkflowState {
    edges: Vec<(ExecVertexId, ExecVertexId, bool)>,
    roots: HashSet<ExecVertexId>,
}

#[derive(Debug, Default)]
pub struct ExecutionModel {
    root_exec_wf_id: Option<ExecWfId>,
    templates: HashMap<ExecWfId, WorkflowId>,
    workflows: HashMap<ExecWfId, WorkflowState>,
    vertices: HashMap<ExecVertexId, VertexState>,
    finalized: bool,
}

impl ExecutionModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_workflows(&mut self, exec_wf_ids: impl IntoIterator<Item = ExecWfId>) {
        debug_assert!(!self.finalized);
        for id in exec_wf_ids {
            self.workflows.entry(id).or_default();
        }
    }

    pub fn add_workflow_mapping(&mut self, exec_wf_id: ExecWfId, workflow_id: WorkflowId) {
        debug_assert!(!self.finalized);
        self.templates.insert(exec_wf_id, workflow_id);
    }

    pub fn set_root_workflow(&mut self, exec_wf_id: ExecWfId) {
        debug_assert!(!self.finalized);
        self.root_exec_wf_id = Some(exec_wf_id);
    }

    pub fn add_vertices(&mut self, vertex_ids: impl IntoIterator<Item = ExecVertexId>) {
        debug_assert!(!self.finalized);
        for id in vertex_ids {
            self.vertices.entry(id).or_default();
        }
    }

    pub fn set_vertex_attrs(
        &mut self,
        vertex_id: ExecVertexId,
        node_id: NodeId,
        node_name: String,
        node_type: NodeType,
        exec_wf_id: ExecWfId,
    ) {
        debug_assert!(!self.finalized);
        self.vertices.entry(vertex_id).or_default().attrs = Some(VertexAttrs {
            node_id,
            node_name,
            node_type,
            exec_wf_id,
        });
    }

    /// Records one success/failure edge inside `exec_wf_id`.
    pub fn add_dependency(
        &mut self,
        exec_wf_id: ExecWfId,
        from: ExecVertexId,
        to: ExecVertexId,
        success: bool,
    ) {
        debug_assert!(!self.finalized);
        self.workflows
            .entry(exec_wf_id)
            .or_default()
            .edges
            .push((from, to, success));
    }

    /// Links a workflow vertex to the child execution workflow it expands
    /// into.
    pub fn set_vertex_runs_workflow(&mut self, vertex_id: ExecVertexId, child: ExecWfId) {
        debug_assert!(!self.finalized);
        self.vertices.entry(vertex_id).or_default().runs_exec_wf_id = Some(child);
    }

    /// Computes successor sets, per-workflow roots, and parent pointers,
    /// then freezes the model. Fails with `CyclicGraph` if any execution
    /// workflow's internal graph has a cycle.
    pub fn finalize(&mut self) -> Result<()> {
        let members: HashMap<ExecWfId, Vec<ExecVertexId>> = {
            let mut m: HashMap<ExecWfId, Vec<ExecVertexId>> = HashMap::new();
            for (id, v) in &self.vertices {
                if let Some(attrs) = &v.attrs {
                    m.entry(attrs.exec_wf_id).or_default().push(*id);
                }
            }
            m
        };

        for (wf_id, wf) in &mut self.workflows {
            let mut graph: DiGraphMap<ExecVertexId, ()> = DiGraphMap::new();
            for v in members.get(wf_id).into_iter().flatten() {
                graph.add_node(*v);
            }
            for (from, to, _) in &wf.edges {
                graph.add_edge(*from, *to, ());
            }
            if is_cyclic_directed(&graph) {
                let workflow_id = self.templates.get(wf_id).copied().unwrap_or(*wf_id);
                return Err(ConductorError::CyclicGraph { workflow_id });
            }
            wf.roots = graph
                .nodes()
                .filter(|n| {
                    graph
                        .neighbors_directed(*n, petgraph::Direction::Incoming)
                        .next()
                        .is_none()
                })
                .collect();
        }

        let all_edges: Vec<(ExecWfId, ExecVertexId, ExecVertexId, bool)> = self
            .workflows
            .iter()
            .flat_map(|(wf, s)| s.edges.iter().map(move |(f, t, ok)| (*wf, *f, *t, *ok)))
            .collect();
        for (_, from, to, success) in all_edges {
            let entry = self.vertices.entry(from).or_default();
            if success {
                entry.on_success.insert(to);
            } else {
                entry.on_failure.insert(to);
            }
        }

        let mut links: Vec<(ExecVertexId, ExecWfId)> = self
            .vertices
            .iter()
            .filter_map(|(id, v)| v.runs_exec_wf_id.map(|child| (*id, child)))
            .collect();
        links.sort_by_key(|(id, _)| *id);
        for (parent, child) in links {
            for member in members.get(&child).into_iter().flatten() {
                let v = self.vertices.entry(*member).or_default();
                if v.parent_vertex.is_none() {
                    v.parent_vertex = Some(parent);
                }
            }
        }

        self.finalized = true;
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn vertices(&self) -> Vec<ExecVertexId> {
        let mut ids: Vec<_> = self.vertices.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn workflows(&self) -> Vec<ExecWfId> {
        let mut ids: Vec<_> = self.workflows.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn vertex_attrs(&self, vertex_id: ExecVertexId) -> Option<&VertexAttrs> {
        self.vertices.get(&vertex_id).and_then(|v| v.attrs.as_ref())
    }

    /// Successor set of `vertex_id` for the given outcome.
    pub fn dependencies(&self, vertex_id: ExecVertexId, success: bool) -> HashSet<ExecVertexId> {
        self.vertices
            .get(&vertex_id)
            .map(|v| {
                if success {
                    v.on_success.clone()
                } else {
                    v.on_failure.clone()
                }
            })
            .unwrap_or_default()
    }

    /// Vertices of `exec_wf_id` with no predecessor inside it.
    pub fn workflow_roots(&self, exec_wf_id: ExecWfId) -> HashSet<ExecVertexId> {
        self.workflows
            .get(&exec_wf_id)
            .map(|w| w.roots.clone())
            .unwrap_or_default()
    }

    pub fn workflow_edges(&self, exec_wf_id: ExecWfId) -> Vec<(ExecVertexId, ExecVertexId, bool)> {
        self.workflows
            .get(&exec_wf_id)
            .map(|w| w.edges.clone())
            .unwrap_or_default()
    }

    pub fn root_workflow(&self) -> Option<ExecWfId> {
        self.root_exec_wf_id
    }

    pub fn template_of(&self, exec_wf_id: ExecWfId) -> Option<WorkflowId> {
        self.templates.get(&exec_wf_id).copied()
    }

    /// The workflow vertex that contains this vertex's execution workflow,
    /// or `None` for vertices of the root workflow.
    pub fn parent_vertex(&self, vertex_id: ExecVertexId) -> Option<ExecVertexId> {
        self.vertices.get(&vertex_id).and_then(|v| v.parent_vertex)
    }

    /// For a workflow vertex, the child execution workflow it expands into.
    pub fn runs_workflow(&self, vertex_id: ExecVertexId) -> Option<ExecWfId> {
        self.vertices.get(&vertex_id).and_then(|v| v.runs_exec_wf_id)
    }
}

//! Execution-driving handlers: triggering, dispatching job vertices,
//! reacting to completions, and walking finished workflows up the nesting
//! chain.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use futures::future::BoxFuture;

use super::{Controller, ExecInfo};
use crate::error::{ConductorError, Result};
use crate::events::StatusEvent;
use crate::messaging::{AgentMessage, ConductorMessage, Topics};
use crate::setup::{self, Launch};
use crate::store::{
    with_retries, AgentId, ExecVertexId, ExecWfId, ExecutionId, NodeId, NodeType, Status,
};

impl Controller {
    /// Entry point for timer and external triggers: snapshots the node's
    /// template (or the synthetic one-job workflow) and starts running it.
    pub(crate) async fn trigger_node(&mut self, node_id: NodeId) -> Result<()> {
        let Some(node) = self.cache.node(node_id).cloned() else {
            tracing::warn!(node_id, "Trigger for unknown node discarded");
            return Ok(());
        };
        if !node.enabled {
            tracing::debug!(node_id, "Trigger for disabled node discarded");
            return Ok(());
        }

        let launch = match node.node_type {
            NodeType::Workflow => setup::launch_workflow(&*self.store, node_id).await,
            NodeType::Job => setup::launch_job(&*self.store, node_id).await,
        };
        let launch = match launch {
            Ok(launch) => launch,
            Err(e @ ConductorError::CyclicGraph { .. }) => {
                // Setup already marked the execution finished_error.
                tracing::warn!(node_id, error = %e, "Trigger failed");
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            execution_id = launch.execution_id,
            node_id,
            workflow = %launch.workflow_name,
            "Execution triggered"
        );
        self.begin_execution(launch).await
    }

    /// Registers the execution in memory, persists "started", announces it,
    /// and kicks off the root workflow.
    async fn begin_execution(&mut self, launch: Launch) -> Result<()> {
        let Launch {
            execution_id,
            model,
            workflow_name,
            start_ts,
        } = launch;
        let model = Arc::new(model);
        let root_wf = model
            .root_workflow()
            .ok_or_else(|| ConductorError::Model("execution has no root workflow".to_string()))?;
        let running_jobs: HashMap<ExecWfId, i64> =
            model.workflows().into_iter().map(|wf| (wf, 0)).collect();
        self.exec_infos.insert(
            execution_id,
            ExecInfo {
                model,
                root_wf_name: workflow_name.clone(),
                start_ts,
                running_jobs,
                failed_exec_wfs: HashSet::new(),
            },
        );

        let store = self.store.clone();
        with_retries("mark_execution_started", || {
            store.mark_execution_started(execution_id, start_ts)
        })
        .await?;
        self.emit(StatusEvent::ExecutionStarted {
            execution_id,
            workflow_name,
            start_ts,
        })
        .await?;

        self.start_exec_wf(None, root_wf, execution_id).await
    }

    /// Starts one execution workflow: marks it (and the containing
    /// workflow vertex, if any) started, then runs its root vertices.
    pub(crate) async fn start_exec_wf(
        &mut self,
        containing_vertex: Option<ExecVertexId>,
        exec_wf_id: ExecWfId,
        execution_id: ExecutionId,
    ) -> Result<()> {
        let ts = Utc::now();
        let store = self.store.clone();
        with_retries("mark_exec_wf_started", || {
            store.mark_exec_wf_started(exec_wf_id, ts)
        })
        .await?;
        if let Some(vertex) = containing_vertex {
            with_retries("mark_vertex_started", || {
                store.mark_vertex_started(vertex, None, ts)
            })
            .await?;
        }
        self.emit(StatusEvent::WfStarted {
            execution_id,
            exec_wf_id,
        })
        .await?;

        let model = self.model_of(execution_id)?;
        let mut roots: Vec<ExecVertexId> = model.workflow_roots(exec_wf_id).into_iter().collect();
        roots.sort_unstable();
        self.run_nodes(roots, execution_id).await
    }

    /// Runs a set of vertices of one execution workflow: job vertices are
    /// dispatched to agents, workflow vertices expand into their child
    /// execution workflows. Boxed because nested workflows recurse through
    /// `start_exec_wf`.
    pub(crate) fn run_nodes<'a>(
        &'a mut self,
        vertices: Vec<ExecVertexId>,
        execution_id: ExecutionId,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if vertices.is_empty() {
                return Ok(());
            }
            let model = self.model_of(execution_id)?;

            let mut exec_wfs: HashSet<ExecWfId> = HashSet::new();
            let mut jobs: Vec<ExecVertexId> = Vec::new();
            let mut workflows: Vec<ExecVertexId> = Vec::new();
            for vertex in &vertices {
                let attrs = model.vertex_attrs(*vertex).ok_or_else(|| {
                    ConductorError::Model(format!("vertex {} has no attributes", vertex))
                })?;
                exec_wfs.insert(attrs.exec_wf_id);
                match attrs.node_type {
                    NodeType::Job => jobs.push(*vertex),
                    NodeType::Workflow => workflows.push(*vertex),
                }
            }
            // Successor sets never cross workflow boundaries.
            if exec_wfs.len() != 1 {
                return Err(ConductorError::Model(format!(
                    "vertices {:?} span multiple execution workflows",
                    vertices
                )));
            }
            let exec_wf_id = exec_wfs.into_iter().next().unwrap_or_default();

            for vertex in workflows {
                let child = model.runs_workflow(vertex).ok_or_else(|| {
                    ConductorError::Model(format!(
                        "workflow vertex {} has no child execution workflow",
                        vertex
                    ))
                })?;
                self.start_exec_wf(Some(vertex), child, execution_id).await?;
            }
            if !jobs.is_empty() {
                self.run_jobs(jobs, exec_wf_id, execution_id).await?;
            }
            Ok(())
        })
    }

    /// Dispatches job vertices. When no eligible agent exists the vertex is
    /// failed with a conductor-forced `job-finished`, so the DAG's failure
    /// edges take over without a network round-trip.
    pub(crate) async fn run_jobs(
        &mut self,
        mut vertices: Vec<ExecVertexId>,
        exec_wf_id: ExecWfId,
        execution_id: ExecutionId,
    ) -> Result<()> {
        vertices.sort_unstable();
        let model = self.model_of(execution_id)?;
        for vertex in vertices {
            let attrs = model.vertex_attrs(vertex).ok_or_else(|| {
                ConductorError::Model(format!("vertex {} has no attributes", vertex))
            })?;
            let job = self
                .store
                .job(attrs.node_id)
                .await?
                .ok_or(ConductorError::JobNotFound(attrs.node_id))?;

            let picked = self
                .tracker
                .pick_agent(job.agent_affinity.as_ref(), self.config.max_concurrent_per_agent);
            match picked {
                Some(agent_id) => {
                    self.tracker.assign_job(&agent_id, vertex, Utc::now());
                    let timeout = job.timeout_ms.unwrap_or(i64::MAX);
                    tracing::info!(
                        execution_id,
                        exec_vertex_id = vertex,
                        agent_id = %agent_id,
                        "Job dispatched"
                    );
                    self.publish(
                        &Topics::agent_commands(&agent_id),
                        &ConductorMessage::RunJob {
                            job,
                            execution_id,
                            exec_vertex_id: vertex,
                            exec_wf_id,
                            timeout,
                        },
                    )
                    .await?;
                }
                None => {
                    tracing::warn!(
                        execution_id,
                        exec_vertex_id = vertex,
                        "No eligible agent, failing job"
                    );
                    self.pending.push_back(AgentMessage::JobFinished {
                        execution_id,
                        exec_vertex_id: vertex,
                        exec_wf_id,
                        agent_id: None,
                        success: false,
                        status: Status::FinishedError,
                        error_msg: Some("no eligible agent available".to_string()),
                        forced_by_conductor: true,
                    });
                }
            }
        }
        Ok(())
    }

    /// An agent accepted a job. Idempotent: a redelivered ack finds the
    /// vertex already `started` and is skipped wholesale.
    pub(crate) async fn handle_run_job_ack(
        &mut self,
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        agent_id: AgentId,
    ) -> Result<()> {
        if !self.exec_infos.contains_key(&execution_id) {
            tracing::warn!(execution_id, exec_vertex_id, "run-job-ack for unknown execution discarded");
            return Ok(());
        }

        let ts = Utc::now();
        let store = self.store.clone();
        let fresh = with_retries("mark_vertex_started", || {
            store.mark_vertex_started(exec_vertex_id, Some(&agent_id), ts)
        })
        .await?;
        if !fresh {
            tracing::debug!(execution_id, exec_vertex_id, "Duplicate run-job-ack ignored");
            return Ok(());
        }

        let info = self.info_mut(execution_id)?;
        *info.running_jobs.entry(exec_wf_id).or_insert(0) += 1;
        self.tracker.assign_job(&agent_id, exec_vertex_id, ts);
        self.emit(StatusEvent::JobStarted {
            execution_id,
            exec_vertex_id,
            exec_wf_id,
            agent_id,
        })
        .await
    }

    /// A job reached a terminal state, either reported by its agent or
    /// forced by the conductor. Walks the matching successor edges, or
    /// closes the execution workflow when nothing is left to run.
    #[allow(clippy::too_many_arguments)]
    pub(crate) async fn handle_job_finished(
        &mut self,
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
        exec_wf_id: ExecWfId,
        agent_id: Option<AgentId>,
        success: bool,
        status: Status,
        error_msg: Option<String>,
        forced_by_conductor: bool,
    ) -> Result<()> {
        if !self.exec_infos.contains_key(&execution_id) {
            tracing::warn!(execution_id, exec_vertex_id, "job-finished for unknown execution discarded");
            return Ok(());
        }

        let ts = Utc::now();
        let store = self.store.clone();
        let fresh = with_retries("finish_vertex", || {
            store.finish_vertex(exec_vertex_id, status, ts)
        })
        .await?;
        if !fresh {
            tracing::warn!(execution_id, exec_vertex_id, "Duplicate job-finished ignored");
            return Ok(());
        }

        if !forced_by_conductor {
            if let Some(agent) = &agent_id {
                self.tracker.clear_job(agent, exec_vertex_id);
                self.publish(
                    &Topics::agent_commands(agent),
                    &ConductorMessage::JobFinishedAck {
                        execution_id,
                        exec_vertex_id,
                    },
                )
                .await?;
            }
            let info = self.info_mut(execution_id)?;
            let counter = info.running_jobs.entry(exec_wf_id).or_insert(0);
            *counter = (*counter - 1).max(0);
        }

        let model = self.model_of(execution_id)?;
        let mut next: Vec<ExecVertexId> =
            model.dependencies(exec_vertex_id, success).into_iter().collect();
        next.sort_unstable();

        let info = self.info_mut(execution_id)?;
        if !success && next.is_empty() {
            info.failed_exec_wfs.insert(exec_wf_id);
        }
        let running = info.running_jobs.get(&exec_wf_id).copied().unwrap_or(0);

        self.emit(StatusEvent::JobFinished {
            execution_id,
            exec_vertex_id,
            exec_wf_id,
            success,
            status,
            error_msg,
        })
        .await?;

        if running == 0 && next.is_empty() {
            let containing = model.parent_vertex(exec_vertex_id);
            self.when_wf_finished(execution_id, exec_wf_id, containing)
                .await
        } else {
            self.run_nodes(next, execution_id).await
        }
    }

    /// An execution workflow has no running jobs and no successors left:
    /// close it, then walk up the nesting chain closing every containing
    /// workflow vertex that is likewise done, and run the successors of the
    /// vertex where the walk stopped.
    pub(crate) async fn when_wf_finished(
        &mut self,
        execution_id: ExecutionId,
        exec_wf_id: ExecWfId,
        containing_vertex: Option<ExecVertexId>,
    ) -> Result<()> {
        let model = self.model_of(execution_id)?;
        let (wf_success, closed_vertices, closed_wfs, chain_top) = {
            let info = self
                .exec_infos
                .get(&execution_id)
                .ok_or(ConductorError::ExecutionNotFound(execution_id))?;
            let wf_success = !info.failed_exec_wfs.contains(&exec_wf_id);

            let mut closed_vertices: Vec<ExecVertexId> = Vec::new();
            let mut closed_wfs: Vec<ExecWfId> = vec![exec_wf_id];
            let mut chain_top: Option<ExecVertexId> = None;
            let mut cursor = containing_vertex;
            while let Some(vertex) = cursor {
                chain_top = Some(vertex);
                closed_vertices.push(vertex);
                let attrs = model.vertex_attrs(vertex).ok_or_else(|| {
                    ConductorError::Model(format!("vertex {} has no attributes", vertex))
                })?;
                let successors = model.dependencies(vertex, wf_success);
                let running = info
                    .running_jobs
                    .get(&attrs.exec_wf_id)
                    .copied()
                    .unwrap_or(0);
                if successors.is_empty() && running == 0 {
                    // The containing workflow is done too; keep walking.
                    closed_wfs.push(attrs.exec_wf_id);
                    cursor = model.parent_vertex(vertex);
                } else {
                    break;
                }
            }
            (wf_success, closed_vertices, closed_wfs, chain_top)
        };

        if !wf_success {
            let info = self.info_mut(execution_id)?;
            for wf in &closed_wfs {
                info.failed_exec_wfs.insert(*wf);
            }
        }

        let status = if wf_success {
            Status::FinishedSuccess
        } else {
            Status::FinishedError
        };
        let ts = Utc::now();
        let store = self.store.clone();
        with_retries("finish_workflow_chain", || {
            store.finish_workflow_chain(&closed_vertices, &closed_wfs, status, ts)
        })
        .await?;

        for wf in &closed_wfs {
            self.emit(StatusEvent::WfFinished {
                execution_id,
                exec_wf_id: *wf,
                vertices: closed_vertices.clone(),
                success: wf_success,
            })
            .await?;
        }

        if let Some(top) = chain_top {
            let mut next: Vec<ExecVertexId> =
                model.dependencies(top, wf_success).into_iter().collect();
            next.sort_unstable();
            self.run_nodes(next, execution_id).await?;
        }

        let root_wf = model
            .root_workflow()
            .ok_or_else(|| ConductorError::Model("execution has no root workflow".to_string()))?;
        if closed_wfs.contains(&root_wf) {
            let success = self
                .exec_infos
                .get(&execution_id)
                .map(|info| !info.failed_exec_wfs.contains(&root_wf))
                .unwrap_or(wf_success);
            self.execution_finished(execution_id, success).await?;
        }
        Ok(())
    }

    /// The root workflow closed: persist the final status, announce it, and
    /// drop the execution from memory.
    pub(crate) async fn execution_finished(
        &mut self,
        execution_id: ExecutionId,
        success: bool,
    ) -> Result<()> {
        let status = if success {
            Status::FinishedSuccess
        } else {
            Status::FinishedError
        };
        let finish_ts = Utc::now();
        let store = self.store.clone();
        with_retries("finish_execution", || {
            store.finish_execution(execution_id, status, finish_ts)
        })
        .await?;
        self.emit(StatusEvent::ExecutionFinished {
            execution_id,
            status,
            finish_ts,
        })
        .await?;

        let info = self.exec_infos.remove(&execution_id);
        tracing::info!(execution_id, status = %status, "Execution finished");
        if !success {
            let name = info.map(|i| i.root_wf_name).unwrap_or_default();
            self.notifier
                .execution_failed(execution_id, &name, "execution finished with errors")
                .await?;
        }
        Ok(())
    }

    /// Best-effort abort: kill messages go to every agent holding one of
    /// the execution's vertices, the snapshot is marked aborted, and the
    /// in-memory record is purged so late replies are discarded.
    pub(crate) async fn abort_execution(&mut self, execution_id: ExecutionId) -> Result<()> {
        let Some(info) = self.exec_infos.remove(&execution_id) else {
            tracing::warn!(execution_id, "Abort for unknown execution discarded");
            return Ok(());
        };

        let vertices: HashSet<ExecVertexId> = info.model.vertices().into_iter().collect();
        for (agent_id, held) in self.tracker.holders_of(&vertices) {
            for vertex in held {
                self.tracker.clear_job(&agent_id, vertex);
                self.publish(
                    &Topics::agent_commands(&agent_id),
                    &ConductorMessage::KillJob {
                        execution_id,
                        exec_vertex_id: vertex,
                    },
                )
                .await?;
            }
        }

        let finish_ts = Utc::now();
        let store = self.store.clone();
        with_retries("abort_execution", || {
            store.abort_execution(execution_id, finish_ts)
        })
        .await?;
        tracing::info!(execution_id, "Execution aborted");
        self.emit(StatusEvent::ExecutionFinished {
            execution_id,
            status: Status::Aborted,
            finish_ts,
        })
        .await
    }

    /// Rebuilds a past execution and re-enters it at one vertex. Refused
    /// while the execution is live.
    pub(crate) async fn resume_execution(
        &mut self,
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
    ) -> Result<()> {
        if self.exec_infos.contains_key(&execution_id) {
            return Err(ConductorError::ExecutionLive(execution_id));
        }

        let launch = setup::resume(&*self.store, execution_id).await?;
        let model = Arc::new(launch.model);
        let running_jobs: HashMap<ExecWfId, i64> =
            model.workflows().into_iter().map(|wf| (wf, 0)).collect();
        self.exec_infos.insert(
            execution_id,
            ExecInfo {
                model,
                root_wf_name: launch.workflow_name.clone(),
                start_ts: launch.start_ts,
                running_jobs,
                failed_exec_wfs: HashSet::new(),
            },
        );

        let start_ts = Utc::now();
        let store = self.store.clone();
        with_retries("mark_execution_started", || {
            store.mark_execution_started(execution_id, start_ts)
        })
        .await?;
        tracing::info!(execution_id, exec_vertex_id, "Execution resumed");
        self.emit(StatusEvent::ExecutionStarted {
            execution_id,
            workflow_name: launch.workflow_name,
            start_ts,
        })
        .await?;

        self.run_nodes(vec![exec_vertex_id], execution_id).await
    }
}

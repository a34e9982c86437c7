//! The conductor controller: one logical event loop that owns every piece
//! of mutable execution state.
//!
//! All mutation of `exec_infos`, the agent tracker, and the schedule cache
//! happens on this loop. Other tasks (subscriber reader, publisher writer,
//! timer source, status fan-out) only talk to it through channels, so the
//! handlers below are atomic with respect to one another. Heartbeat
//! broadcasting and the dead-agent sweep run as interval arms of the same
//! `select!`.

mod execution;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::cache::ScheduleCache;
use crate::config::ConductorConfig;
use crate::error::{ConductorError, Result};
use crate::events::StatusEvent;
use crate::messaging::{AgentMessage, ConductorMessage, Outbound, Topics};
use crate::model::ExecutionModel;
use crate::notifier::Notifier;
use crate::store::{
    with_retries, ExecVertexId, ExecWfId, ExecutionId, NodeId, ScheduleId, Store,
};
use crate::timer::{TimerEvent, TimerSource};
use crate::tracker::AgentTracker;

/// Everything the controller consumes, from any source.
#[derive(Debug)]
pub enum ControllerMessage {
    /// Decoded agent reply from the subscriber.
    Agent(AgentMessage),
    /// A cron schedule fired for this node.
    Trigger(TimerEvent),
    /// CRUD collaborator saved a node.
    NodeSave { node_id: NodeId },
    /// CRUD collaborator saved a schedule.
    ScheduleSave { schedule_id: ScheduleId },
    /// CRUD collaborator changed a node's schedule associations.
    ScheduleAssoc { node_id: NodeId },
    AbortExecution { execution_id: ExecutionId },
    ResumeExecution {
        execution_id: ExecutionId,
        exec_vertex_id: ExecVertexId,
    },
}

/// Per-execution in-memory record, kept while any vertex is non-terminal.
pub(crate) struct ExecInfo {
    pub(crate) model: Arc<ExecutionModel>,
    pub(crate) root_wf_name: String,
    pub(crate) start_ts: DateTime<Utc>,
    /// In-flight job vertices per execution workflow.
    pub(crate) running_jobs: HashMap<ExecWfId, i64>,
    pub(crate) failed_exec_wfs: HashSet<ExecWfId>,
}

pub struct Controller {
    pub(crate) config: ConductorConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) timer: Arc<dyn TimerSource>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) cache: ScheduleCache,
    pub(crate) tracker: AgentTracker,
    pub(crate) exec_infos: HashMap<ExecutionId, ExecInfo>,
    /// Conductor-forced messages queued for dispatch through the regular
    /// path, drained before the loop takes the next inbound message.
    pub(crate) pending: VecDeque<AgentMessage>,
    message_tx: mpsc::Sender<ControllerMessage>,
    publish_tx: mpsc::Sender<Outbound>,
    events_tx: mpsc::Sender<StatusEvent>,
}

impl Controller {
    pub fn new(
        config: ConductorConfig,
        store: Arc<dyn Store>,
        timer: Arc<dyn TimerSource>,
        notifier: Arc<dyn Notifier>,
        publish_tx: mpsc::Sender<Outbound>,
        events_tx: mpsc::Sender<StatusEvent>,
    ) -> (Self, mpsc::Receiver<ControllerMessage>) {
        let (message_tx, message_rx) = mpsc::channel(256);
        let tracker = if config.deterministic_agent_choice {
            AgentTracker::deterministic()
        } else {
            AgentTracker::new()
        };
        let controller = Self {
            config,
            store,
            timer,
            notifier,
            cache: ScheduleCache::new(),
            tracker,
            exec_infos: HashMap::new(),
            pending: VecDeque::new(),
            message_tx,
            publish_tx,
            events_tx,
        };
        (controller, message_rx)
    }

    /// Sender for external producers (subscriber, timer bridge, API layer).
    pub fn message_sender(&self) -> mpsc::Sender<ControllerMessage> {
        self.message_tx.clone()
    }

    /// Runs the controller loop until shutdown.
    pub async fn run(
        mut self,
        mut inbox: mpsc::Receiver<ControllerMessage>,
        shutdown: CancellationToken,
    ) {
        if let Err(e) = self.bootstrap().await {
            // A cold cache would drop every trigger.
            tracing::error!(error = %e, "Bootstrap failed, shutting down");
            return;
        }

        let mut heartbeat =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_interval_ms));
        let mut watchdog =
            tokio::time::interval(Duration::from_millis(self.config.heartbeat_dead_after_ms));

        loop {
            tokio::select! {
                msg = inbox.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = self.dispatch(msg).await {
                        tracing::error!(error = %e, "Handler failed");
                    }
                    self.drain_pending().await;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = self
                        .publish(Topics::broadcast(), &ConductorMessage::Heartbeat)
                        .await
                    {
                        tracing::warn!(error = %e, "Heartbeat publish failed");
                    }
                }
                _ = watchdog.tick() => {
                    if let Err(e) = self.sweep_dead_agents().await {
                        tracing::error!(error = %e, "Dead-agent sweep failed");
                    }
                    self.drain_pending().await;
                }
                _ = shutdown.cancelled() => {
                    tracing::info!("Controller shutting down");
                    break;
                }
            }
        }
    }

    /// Primes the schedule cache, registers cron triggers, and asks running
    /// agents to re-introduce themselves.
    async fn bootstrap(&mut self) -> Result<()> {
        let nodes = self.store.nodes().await?;
        let node_count = nodes.len();
        self.cache.put_nodes(nodes);
        let schedules = self.store.schedules().await?;
        self.cache.put_schedules(schedules);
        let assocs = self.store.node_schedules().await?;
        self.cache.put_assocs(assocs.clone());
        for assoc in assocs {
            if let Some(schedule) = self.cache.schedule(assoc.schedule_id) {
                let cron = schedule.cron_expression.clone();
                self.timer
                    .schedule_cron_job(assoc.node_schedule_id, assoc.node_id, &cron)
                    .await?;
            }
        }
        self.publish(Topics::broadcast(), &ConductorMessage::AgentsRegister)
            .await?;
        tracing::info!(nodes = node_count, "Conductor bootstrapped");
        Ok(())
    }

    async fn dispatch(&mut self, msg: ControllerMessage) -> Result<()> {
        match msg {
            ControllerMessage::Agent(m) => self.handle_agent_message(m).await,
            ControllerMessage::Trigger(TimerEvent { node_id }) => {
                self.trigger_node(node_id).await
            }
            ControllerMessage::NodeSave { node_id } => self.handle_node_save(node_id).await,
            ControllerMessage::ScheduleSave { schedule_id } => {
                self.handle_schedule_save(schedule_id).await
            }
            ControllerMessage::ScheduleAssoc { node_id } => {
                self.handle_schedule_assoc(node_id).await
            }
            ControllerMessage::AbortExecution { execution_id } => {
                self.abort_execution(execution_id).await
            }
            ControllerMessage::ResumeExecution {
                execution_id,
                exec_vertex_id,
            } => self.resume_execution(execution_id, exec_vertex_id).await,
        }
    }

    /// Dispatches conductor-forced messages through the same path inbound
    /// ones take. A forced `job-finished` can enqueue further forced ones
    /// (a chain of jobs with no eligible agent), so this loops until dry.
    async fn drain_pending(&mut self) {
        while let Some(msg) = self.pending.pop_front() {
            if let Err(e) = self.handle_agent_message(msg).await {
                tracing::error!(error = %e, "Forced message handler failed");
            }
        }
    }

    async fn handle_agent_message(&mut self, msg: AgentMessage) -> Result<()> {
        match msg {
            AgentMessage::AgentRegistering { agent_id } => {
                self.tracker.add_agent(&agent_id, Utc::now());
                self.publish(
                    &Topics::agent_commands(&agent_id),
                    &ConductorMessage::AgentRegistered {
                        agent_id: agent_id.clone(),
                    },
                )
                .await
            }
            AgentMessage::HeartbeatAck { agent_id } => {
                if self.tracker.heartbeat(&agent_id, Utc::now()) {
                    return Ok(());
                }
                // Heartbeat from an agent we quarantined or never saw:
                // ask it to re-register and start from zero assignments.
                tracing::info!(agent_id = %agent_id, "Heartbeat from unregistered agent");
                self.publish(
                    &Topics::agent_commands(&agent_id),
                    &ConductorMessage::AgentsRegister,
                )
                .await
            }
            AgentMessage::Ping { reply_to } => {
                self.publish(
                    &Topics::agent_commands(&reply_to),
                    &ConductorMessage::Pong {
                        reply_to: reply_to.clone(),
                    },
                )
                .await
            }
            AgentMessage::RunJobAck {
                execution_id,
                exec_vertex_id,
                exec_wf_id,
                agent_id,
            } => {
                self.handle_run_job_ack(execution_id, exec_vertex_id, exec_wf_id, agent_id)
                    .await
            }
            AgentMessage::JobFinished {
                execution_id,
                exec_vertex_id,
                exec_wf_id,
                agent_id,
                success,
                status,
                error_msg,
                forced_by_conductor,
            } => {
                self.handle_job_finished(
                    execution_id,
                    exec_vertex_id,
                    exec_wf_id,
                    agent_id,
                    success,
                    status,
                    error_msg,
                    forced_by_conductor,
                )
                .await
            }
        }
    }

    async fn handle_node_save(&mut self, node_id: NodeId) -> Result<()> {
        if let Some(node) = self.store.node(node_id).await? {
            tracing::debug!(node_id, "Node refreshed");
            self.cache.put_node(node);
        }
        Ok(())
    }

    async fn handle_schedule_save(&mut self, schedule_id: ScheduleId) -> Result<()> {
        let Some(schedule) = self.store.schedule(schedule_id).await? else {
            return Ok(());
        };
        self.cache.put_schedule(schedule.clone());
        let assocs: Vec<_> = self
            .cache
            .assocs_for_schedule(schedule_id)
            .into_iter()
            .cloned()
            .collect();
        for assoc in assocs {
            self.timer
                .schedule_cron_job(
                    assoc.node_schedule_id,
                    assoc.node_id,
                    &schedule.cron_expression,
                )
                .await?;
        }
        Ok(())
    }

    async fn handle_schedule_assoc(&mut self, node_id: NodeId) -> Result<()> {
        self.timer.remove_node_triggers(node_id).await?;
        let stale: Vec<_> = self
            .cache
            .assocs_for_node(node_id)
            .into_iter()
            .map(|a| a.node_schedule_id)
            .collect();
        self.cache.remove_assocs(&stale);

        let fresh = self.store.node_schedules_for_node(node_id).await?;
        self.cache.put_assocs(fresh.clone());
        for assoc in fresh {
            let Some(schedule) = self.cache.schedule(assoc.schedule_id) else {
                tracing::warn!(
                    schedule_id = assoc.schedule_id,
                    "Association references unknown schedule"
                );
                continue;
            };
            let cron = schedule.cron_expression.clone();
            self.timer
                .schedule_cron_job(assoc.node_schedule_id, node_id, &cron)
                .await?;
        }
        Ok(())
    }

    /// Quarantines agents whose heartbeat went stale: their in-flight
    /// vertices become `unknown` (the jobs may still be running on the
    /// agent hosts), the agents leave the tracker, and operators get
    /// notified.
    async fn sweep_dead_agents(&mut self) -> Result<()> {
        let threshold =
            Utc::now() - chrono::Duration::milliseconds(self.config.heartbeat_dead_after_ms as i64);
        let dead = self.tracker.dead_since(threshold);
        if dead.is_empty() {
            return Ok(());
        }

        let vertices: Vec<ExecVertexId> = dead.values().flatten().copied().collect();
        if !vertices.is_empty() {
            let store = self.store.clone();
            let ids = vertices.clone();
            with_retries("mark_vertices_unknown", || {
                store.mark_vertices_unknown(&ids)
            })
            .await?;
        }
        self.tracker.remove_agents(dead.keys());
        tracing::warn!(agents = ?dead.keys().collect::<Vec<_>>(), affected = vertices.len(), "Dead agents quarantined");
        self.notifier.dead_agents(&dead).await?;
        Ok(())
    }

    pub(crate) async fn publish(&self, topic: &str, msg: &ConductorMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.publish_tx
            .send(Outbound {
                topic: topic.to_string(),
                payload,
            })
            .await
            .map_err(|_| ConductorError::Transport("publish channel closed".to_string()))
    }

    pub(crate) async fn emit(&self, event: StatusEvent) -> Result<()> {
        self.events_tx
            .send(event)
            .await
            .map_err(|_| ConductorError::Transport("event channel closed".to_string()))
    }

    pub(crate) fn model_of(&self, execution_id: ExecutionId) -> Result<Arc<ExecutionModel>> {
        self.exec_infos
            .get(&execution_id)
            .map(|info| info.model.clone())
            .ok_or(ConductorError::ExecutionNotFound(execution_id))
    }

    pub(crate) fn info_mut(&mut self, execution_id: ExecutionId) -> Result<&mut ExecInfo> {
        self.exec_infos
            .get_mut(&execution_id)
            .ok_or(ConductorError::ExecutionNotFound(execution_id))
    }
}

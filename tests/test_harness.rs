#![allow(dead_code)]
//! Test harness for conductor integration tests.
//!
//! Runs a real controller loop against the in-memory store, a recording
//! notifier, and an in-process publish channel. Mock agents are spawned as
//! tasks that answer `run-job` the way a real agent would; tests can also
//! drive the wire protocol by hand through the inbox.

use std::collections::HashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use maestro::config::ConductorConfig;
use maestro::controller::{Controller, ControllerMessage};
use maestro::error::Result;
use maestro::events::StatusEvent;
use maestro::messaging::{AgentMessage, ConductorMessage, Outbound, Topics};
use maestro::notifier::Notifier;
use maestro::store::{
    AgentId, ExecVertexId, ExecutionId, JobRow, MemoryStore, NodeId, NodeRow, NodeType, Status,
    WorkflowId,
};
use maestro::timer::{NullTimer, TimerEvent};

const WAIT: Duration = Duration::from_secs(5);

/// What the recording notifier saw.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    DeadAgents(Vec<AgentId>),
    ExecutionFailed(ExecutionId),
}

struct RecordingNotifier {
    tx: mpsc::UnboundedSender<Notice>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn dead_agents(&self, dead: &HashMap<AgentId, HashSet<ExecVertexId>>) -> Result<()> {
        let mut agents: Vec<AgentId> = dead.keys().cloned().collect();
        agents.sort();
        let _ = self.tx.send(Notice::DeadAgents(agents));
        Ok(())
    }

    async fn execution_failed(
        &self,
        execution_id: ExecutionId,
        _workflow_name: &str,
        _detail: &str,
    ) -> Result<()> {
        let _ = self.tx.send(Notice::ExecutionFailed(execution_id));
        Ok(())
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MockAgentOptions {
    /// Reply to heartbeat broadcasts.
    pub heartbeats: bool,
    /// Send `job-finished` after acking a job.
    pub finish_jobs: bool,
}

impl Default for MockAgentOptions {
    fn default() -> Self {
        Self {
            heartbeats: true,
            finish_jobs: true,
        }
    }
}

/// A running conductor with channels for assertions.
pub struct TestConductor {
    pub store: Arc<MemoryStore>,
    pub inbox: mpsc::Sender<ControllerMessage>,
    pub events: mpsc::Receiver<StatusEvent>,
    published: mpsc::UnboundedReceiver<Outbound>,
    pub notices: mpsc::UnboundedReceiver<Notice>,
    agents: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>>,
    shutdown: CancellationToken,
    controller_handle: JoinHandle<()>,
    router_handle: JoinHandle<()>,
}

impl TestConductor {
    /// Starts a conductor with deterministic agent choice and default
    /// timing.
    pub async fn start(store: Arc<MemoryStore>) -> Self {
        let config = ConductorConfig {
            deterministic_agent_choice: true,
            ..ConductorConfig::default()
        };
        Self::start_with(store, config).await
    }

    pub async fn start_with(store: Arc<MemoryStore>, config: ConductorConfig) -> Self {
        let timer = Arc::new(NullTimer::new());
        let (notice_tx, notices) = mpsc::unbounded_channel();
        let notifier = Arc::new(RecordingNotifier { tx: notice_tx });
        let (publish_tx, mut publish_rx) = mpsc::channel(256);
        let (events_tx, events) = mpsc::channel(256);

        let (controller, inbox_rx) = Controller::new(
            config,
            store.clone(),
            timer,
            notifier,
            publish_tx,
            events_tx,
        );
        let inbox = controller.message_sender();
        let shutdown = CancellationToken::new();
        let controller_handle = tokio::spawn(controller.run(inbox_rx, shutdown.clone()));

        // Router: every publish lands in the assertion log and in the
        // queue of each mock agent addressed by its topic.
        let agents: Arc<Mutex<HashMap<String, mpsc::UnboundedSender<Outbound>>>> =
            Arc::new(Mutex::new(HashMap::new()));
        let (published_tx, published) = mpsc::unbounded_channel();
        let router_agents = agents.clone();
        let router_handle = tokio::spawn(async move {
            while let Some(out) = publish_rx.recv().await {
                let _ = published_tx.send(out.clone());
                let map = router_agents.lock().unwrap();
                for (agent_id, tx) in map.iter() {
                    if out.topic == Topics::broadcast()
                        || out.topic == Topics::agent_commands(agent_id)
                    {
                        let _ = tx.send(out.clone());
                    }
                }
            }
        });

        Self {
            store,
            inbox,
            events,
            published,
            notices,
            agents,
            shutdown,
            controller_handle,
            router_handle,
        }
    }

    /// Registers a mock agent and spawns its responder task.
    pub async fn spawn_agent(&self, agent_id: &str, opts: MockAgentOptions) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.agents
            .lock()
            .unwrap()
            .insert(agent_id.to_string(), tx);
        self.send_agent(AgentMessage::AgentRegistering {
            agent_id: agent_id.to_string(),
        })
        .await;

        let inbox = self.inbox.clone();
        let id = agent_id.to_string();
        tokio::spawn(async move {
            while let Some(out) = rx.recv().await {
                let Ok(msg) = serde_json::from_slice::<ConductorMessage>(&out.payload) else {
                    continue;
                };
                match msg {
                    ConductorMessage::RunJob {
                        job,
                        execution_id,
                        exec_vertex_id,
                        exec_wf_id,
                        ..
                    } => {
                        let _ = inbox
                            .send(ControllerMessage::Agent(AgentMessage::RunJobAck {
                                execution_id,
                                exec_vertex_id,
                                exec_wf_id,
                                agent_id: id.clone(),
                            }))
                            .await;
                        if opts.finish_jobs {
                            let fail = job.command_line.contains("fail");
                            let _ = inbox
                                .send(ControllerMessage::Agent(AgentMessage::JobFinished {
                                    execution_id,
                                    exec_vertex_id,
                                    exec_wf_id,
                                    agent_id: Some(id.clone()),
                                    success: !fail,
                                    status: if fail {
                                        Status::FinishedError
                                    } else {
                                        Status::FinishedSuccess
                                    },
                                    error_msg: fail.then(|| "exit status 1".to_string()),
                                    forced_by_conductor: false,
                                }))
                                .await;
                        }
                    }
                    ConductorMessage::Heartbeat => {
                        if opts.heartbeats {
                            let _ = inbox
                                .send(ControllerMessage::Agent(AgentMessage::HeartbeatAck {
                                    agent_id: id.clone(),
                                }))
                                .await;
                        }
                    }
                    ConductorMessage::AgentsRegister => {
                        let _ = inbox
                            .send(ControllerMessage::Agent(AgentMessage::AgentRegistering {
                                agent_id: id.clone(),
                            }))
                            .await;
                    }
                    _ => {}
                }
            }
        });
    }

    pub async fn trigger(&self, node_id: NodeId) {
        self.inbox
            .send(ControllerMessage::Trigger(TimerEvent { node_id }))
            .await
            .expect("controller inbox closed");
    }

    pub async fn send_agent(&self, msg: AgentMessage) {
        self.inbox
            .send(ControllerMessage::Agent(msg))
            .await
            .expect("controller inbox closed");
    }

    pub async fn next_event(&mut self) -> StatusEvent {
        tokio::time::timeout(WAIT, self.events.recv())
            .await
            .expect("timed out waiting for status event")
            .expect("event channel closed")
    }

    /// Next published command on `topic`, skipping everything else.
    pub async fn next_command_on(&mut self, topic: &str) -> ConductorMessage {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let out = tokio::time::timeout_at(deadline, self.published.recv())
                .await
                .expect("timed out waiting for publish")
                .expect("publish channel closed");
            if out.topic == topic {
                return serde_json::from_slice(&out.payload).expect("undecodable payload");
            }
        }
    }

    pub async fn next_notice(&mut self) -> Notice {
        tokio::time::timeout(WAIT, self.notices.recv())
            .await
            .expect("timed out waiting for notification")
            .expect("notice channel closed")
    }

    /// Consumes the next event, which must be `execution-started`, and
    /// returns the execution id.
    pub async fn expect_execution_started(&mut self) -> ExecutionId {
        match self.next_event().await {
            StatusEvent::ExecutionStarted { execution_id, .. } => execution_id,
            other => panic!("expected execution-started, got {:?}", other),
        }
    }

    /// Drains the publish log without waiting.
    pub fn drain_published(&mut self) -> Vec<(String, ConductorMessage)> {
        let mut drained = Vec::new();
        while let Ok(out) = self.published.try_recv() {
            if let Ok(msg) = serde_json::from_slice::<ConductorMessage>(&out.payload) {
                drained.push((out.topic, msg));
            }
        }
        drained
    }

    /// Drains the event log without waiting.
    pub fn drain_events(&mut self) -> Vec<StatusEvent> {
        let mut drained = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            drained.push(event);
        }
        drained
    }
}

impl Drop for TestConductor {
    fn drop(&mut self) {
        self.shutdown.cancel();
        self.controller_handle.abort();
        self.router_handle.abort();
    }
}

/// Seeds a job node with the given command line.
pub fn seed_job_node(store: &MemoryStore, node_id: NodeId, name: &str, command: &str) {
    store.put_node(NodeRow {
        node_id,
        node_type: NodeType::Job,
        name: name.to_string(),
        enabled: true,
    });
    store.put_job(JobRow {
        node_id,
        command_line: command.to_string(),
        execution_directory: None,
        agent_affinity: None,
        max_retries: 0,
        max_concurrent: None,
        timeout_ms: None,
    });
}

/// Seeds a workflow node. Vertices and edges are added separately.
pub fn seed_workflow_node(store: &MemoryStore, node_id: WorkflowId, name: &str) {
    store.put_node(NodeRow {
        node_id,
        node_type: NodeType::Workflow,
        name: name.to_string(),
        enabled: true,
    });
}

/// Maps node ids to exec-vertex ids for one execution.
pub async fn vertex_ids_by_node(
    store: &MemoryStore,
    execution_id: ExecutionId,
) -> HashMap<NodeId, ExecVertexId> {
    use maestro::store::Store;
    store
        .execution_vertices(execution_id)
        .await
        .unwrap()
        .into_iter()
        .map(|v| (v.node_id, v.exec_vertex_id))
        .collect()
}

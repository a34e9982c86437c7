//! Operator notifications for failure and dead-agent events.
//!
//! Mail delivery itself is an external collaborator; the conductor renders
//! the message and hands it over through this trait.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;

use crate::error::Result;
use crate::store::{AgentId, ExecVertexId, ExecutionId};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn dead_agents(&self, dead: &HashMap<AgentId, HashSet<ExecVertexId>>) -> Result<()>;

    async fn execution_failed(
        &self,
        execution_id: ExecutionId,
        workflow_name: &str,
        detail: &str,
    ) -> Result<()>;
}

/// Renders notifications into the log, addressed to the configured
/// recipient.
pub struct LogNotifier {
    recipient: String,
}

impl LogNotifier {
    pub fn new(recipient: String) -> Self {
        Self { recipient }
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn dead_agents(&self, dead: &HashMap<AgentId, HashSet<ExecVertexId>>) -> Result<()> {
        let mut agents: Vec<&AgentId> = dead.keys().collect();
        agents.sort();
        tracing::error!(
            to = %self.recipient,
            agents = ?agents,
            "Agents stopped heartbeating; their in-flight vertices were marked unknown"
        );
        Ok(())
    }

    async fn execution_failed(
        &self,
        execution_id: ExecutionId,
        workflow_name: &str,
        detail: &str,
    ) -> Result<()> {
        tracing::error!(
            to = %self.recipient,
            execution_id,
            workflow_name,
            detail,
            "Execution failed"
        );
        Ok(())
    }
}

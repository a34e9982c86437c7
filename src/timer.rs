//! Timer source: emits a trigger event whenever a node's cron schedule
//! fires. The controller consumes the events and keeps the source in sync
//! when schedules or associations change.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_cron_scheduler::{Job, JobScheduler};
use uuid::Uuid;

use crate::error::{ConductorError, Result};
use crate::store::{NodeId, NodeScheduleId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub node_id: NodeId,
}

#[async_trait]
pub trait TimerSource: Send + Sync {
    /// Registers (or replaces) the cron trigger for one node↔schedule
    /// association.
    async fn schedule_cron_job(
        &self,
        node_schedule_id: NodeScheduleId,
        node_id: NodeId,
        cron_expression: &str,
    ) -> Result<()>;

    /// Drops every trigger registered for the node.
    async fn remove_node_triggers(&self, node_id: NodeId) -> Result<()>;
}

/// Cron-backed timer source.
pub struct CronTimer {
    scheduler: JobScheduler,
    events: mpsc::Sender<TimerEvent>,
    jobs: Mutex<HashMap<NodeScheduleId, (NodeId, Uuid)>>,
}

impl CronTimer {
    pub async fn new(events: mpsc::Sender<TimerEvent>) -> Result<Self> {
        let scheduler = JobScheduler::new()
            .await
            .map_err(|e| ConductorError::Timer(e.to_string()))?;
        scheduler
            .start()
            .await
            .map_err(|e| ConductorError::Timer(e.to_string()))?;
        Ok(Self {
            scheduler,
            events,
            jobs: Mutex::new(HashMap::new()),
        })
    }
}

#[async_trait]
impl TimerSource for CronTimer {
    async fn schedule_cron_job(
        &self,
        node_schedule_id: NodeScheduleId,
        node_id: NodeId,
        cron_expression: &str,
    ) -> Result<()> {
        let previous = self.jobs.lock().remove(&node_schedule_id);
        if let Some((_, uuid)) = previous {
            let _ = self.scheduler.remove(&uuid).await;
        }

        let tx = self.events.clone();
        let job = Job::new_async(cron_expression, move |_uuid, _scheduler| {
            let tx = tx.clone();
            Box::pin(async move {
                if tx.send(TimerEvent { node_id }).await.is_err() {
                    tracing::warn!(node_id, "Trigger dropped, controller inbox closed");
                }
            })
        })
        .map_err(|e| ConductorError::Timer(e.to_string()))?;
        let uuid = self
            .scheduler
            .add(job)
            .await
            .map_err(|e| ConductorError::Timer(e.to_string()))?;
        self.jobs.lock().insert(node_schedule_id, (node_id, uuid));
        tracing::info!(node_schedule_id, node_id, cron = cron_expression, "Cron trigger registered");
        Ok(())
    }

    async fn remove_node_triggers(&self, node_id: NodeId) -> Result<()> {
        let stale: Vec<(NodeScheduleId, Uuid)> = self
            .jobs
            .lock()
            .iter()
            .filter(|(_, (nid, _))| *nid == node_id)
            .map(|(id, (_, uuid))| (*id, *uuid))
            .collect();
        for (id, uuid) in stale {
            self.jobs.lock().remove(&id);
            self.scheduler
                .remove(&uuid)
                .await
                .map_err(|e| ConductorError::Timer(e.to_string()))?;
        }
        Ok(())
    }
}

/// Recording timer source for tests: remembers registrations and removals,
/// never fires.
#[derive(Debug, Default)]
pub struct NullTimer {
    pub scheduled: Mutex<Vec<(NodeScheduleId, NodeId, String)>>,
    pub removed: Mutex<Vec<NodeId>>,
}

impl NullTimer {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TimerSource for NullTimer {
    async fn schedule_cron_job(
        &self,
        node_schedule_id: NodeScheduleId,
        node_id: NodeId,
        cron_expression: &str,
    ) -> Result<()> {
        self.scheduled
            .lock()
            .push((node_schedule_id, node_id, cron_expression.to_string()));
        Ok(())
    }

    async fn remove_node_triggers(&self, node_id: NodeId) -> Result<()> {
        self.removed.lock().push(node_id);
        Ok(())
    }
}

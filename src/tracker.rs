//! In-memory registry of live agents and their in-flight vertices.
//!
//! Owned exclusively by the controller loop; the dead-agent sweep and every
//! assignment decision go through here.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use rand::Rng;

use crate::store::{AgentId, ExecVertexId};

#[derive(Debug, Clone)]
pub struct AgentState {
    pub agent_id: AgentId,
    pub last_heartbeat: DateTime<Utc>,
    pub running: HashSet<ExecVertexId>,
}

impl AgentState {
    fn new(agent_id: AgentId, ts: DateTime<Utc>) -> Self {
        Self {
            agent_id,
            last_heartbeat: ts,
            running: HashSet::new(),
        }
    }
}

#[derive(Debug, Default)]
pub struct AgentTracker {
    agents: HashMap<AgentId, AgentState>,
    deterministic: bool,
}

impl AgentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracker that breaks selection ties by lowest agent id instead of
    /// randomly. Used by tests.
    pub fn deterministic() -> Self {
        Self {
            agents: HashMap::new(),
            deterministic: true,
        }
    }

    /// Registers an agent. Re-registration resets it to zero assignments.
    pub fn add_agent(&mut self, agent_id: &str, ts: DateTime<Utc>) {
        self.agents
            .insert(agent_id.to_string(), AgentState::new(agent_id.to_string(), ts));
        tracing::info!(agent_id, "Agent registered");
    }

    pub fn remove_agent(&mut self, agent_id: &str) {
        self.agents.remove(agent_id);
    }

    pub fn remove_agents<'a>(&mut self, agent_ids: impl IntoIterator<Item = &'a AgentId>) {
        for id in agent_ids {
            self.agents.remove(id);
        }
    }

    /// Refreshes the heartbeat timestamp. Returns `false` for unknown
    /// agents, which the controller asks to re-register.
    pub fn heartbeat(&mut self, agent_id: &str, ts: DateTime<Utc>) -> bool {
        match self.agents.get_mut(agent_id) {
            Some(agent) => {
                agent.last_heartbeat = ts;
                true
            }
            None => false,
        }
    }

    pub fn assign_job(&mut self, agent_id: &str, vertex: ExecVertexId, ts: DateTime<Utc>) {
        let agent = self
            .agents
            .entry(agent_id.to_string())
            .or_insert_with(|| AgentState::new(agent_id.to_string(), ts));
        agent.running.insert(vertex);
        agent.last_heartbeat = ts;
    }

    pub fn clear_job(&mut self, agent_id: &str, vertex: ExecVertexId) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.running.remove(&vertex);
        }
    }

    pub fn agents(&self) -> Vec<AgentId> {
        let mut ids: Vec<_> = self.agents.keys().cloned().collect();
        ids.sort_unstable();
        ids
    }

    pub fn agent_exists(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    pub fn running_count(&self, agent_id: &str) -> usize {
        self.agents
            .get(agent_id)
            .map(|a| a.running.len())
            .unwrap_or(0)
    }

    /// Agents whose last heartbeat is at or before `threshold`, with the
    /// vertices they were running.
    pub fn dead_since(
        &self,
        threshold: DateTime<Utc>,
    ) -> HashMap<AgentId, HashSet<ExecVertexId>> {
        self.agents
            .values()
            .filter(|a| a.last_heartbeat <= threshold)
            .map(|a| (a.agent_id.clone(), a.running.clone()))
            .collect()
    }

    /// Agents currently holding any of `vertices`, with the held subset.
    pub fn holders_of(
        &self,
        vertices: &HashSet<ExecVertexId>,
    ) -> HashMap<AgentId, Vec<ExecVertexId>> {
        let mut held: HashMap<AgentId, Vec<ExecVertexId>> = HashMap::new();
        for agent in self.agents.values() {
            let mut mine: Vec<_> = agent.running.intersection(vertices).copied().collect();
            if !mine.is_empty() {
                mine.sort_unstable();
                held.insert(agent.agent_id.clone(), mine);
            }
        }
        held
    }

    /// Picks the agent for a job: affinity filter, then concurrency cap,
    /// then fewest in-flight vertices with ties broken randomly.
    pub fn pick_agent(
        &self,
        affinity: Option<&HashSet<AgentId>>,
        max_concurrent: Option<u32>,
    ) -> Option<AgentId> {
        let candidates: Vec<&AgentState> = self
            .agents
            .values()
            .filter(|a| affinity.map(|set| set.contains(&a.agent_id)).unwrap_or(true))
            .filter(|a| {
                max_concurrent
                    .map(|cap| a.running.len() < cap as usize)
                    .unwrap_or(true)
            })
            .collect();
        let min_load = candidates.iter().map(|a| a.running.len()).min()?;
        let mut tied: Vec<&AgentState> = candidates
            .into_iter()
            .filter(|a| a.running.len() == min_load)
            .collect();
        tied.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        let index = if self.deterministic || tied.len() == 1 {
            0
        } else {
            rand::thread_rng().gen_range(0..tied.len())
        };
        Some(tied[index].agent_id.clone())
    }
}

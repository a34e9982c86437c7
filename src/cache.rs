//! Single-writer cache of nodes, schedules, and node↔schedule
//! associations. Mutated only from the controller loop when the CRUD
//! collaborator announces a save.

use std::collections::{HashMap, HashSet};

use crate::store::{NodeId, NodeRow, NodeScheduleId, NodeScheduleRow, ScheduleId, ScheduleRow};

#[derive(Debug, Default)]
pub struct ScheduleCache {
    nodes: HashMap<NodeId, NodeRow>,
    schedules: HashMap<ScheduleId, ScheduleRow>,
    assocs: HashMap<NodeScheduleId, NodeScheduleRow>,
    by_node: HashMap<NodeId, HashSet<NodeScheduleId>>,
    by_schedule: HashMap<ScheduleId, HashSet<NodeScheduleId>>,
}

impl ScheduleCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put_node(&mut self, node: NodeRow) {
        self.nodes.insert(node.node_id, node);
    }

    pub fn put_nodes(&mut self, nodes: impl IntoIterator<Item = NodeRow>) {
        for node in nodes {
            self.put_node(node);
        }
    }

    pub fn put_schedule(&mut self, schedule: ScheduleRow) {
        self.schedules.insert(schedule.schedule_id, schedule);
    }

    pub fn put_schedules(&mut self, schedules: impl IntoIterator<Item = ScheduleRow>) {
        for schedule in schedules {
            self.put_schedule(schedule);
        }
    }

    pub fn put_assocs(&mut self, assocs: impl IntoIterator<Item = NodeScheduleRow>) {
        for assoc in assocs {
            self.by_node
                .entry(assoc.node_id)
                .or_default()
                .insert(assoc.node_schedule_id);
            self.by_schedule
                .entry(assoc.schedule_id)
                .or_default()
                .insert(assoc.node_schedule_id);
            self.assocs.insert(assoc.node_schedule_id, assoc);
        }
    }

    pub fn remove_assocs(&mut self, ids: &[NodeScheduleId]) {
        for id in ids {
            if let Some(assoc) = self.assocs.remove(id) {
                if let Some(set) = self.by_node.get_mut(&assoc.node_id) {
                    set.remove(id);
                }
                if let Some(set) = self.by_schedule.get_mut(&assoc.schedule_id) {
                    set.remove(id);
                }
            }
        }
    }

    pub fn node(&self, node_id: NodeId) -> Option<&NodeRow> {
        self.nodes.get(&node_id)
    }

    pub fn schedule(&self, schedule_id: ScheduleId) -> Option<&ScheduleRow> {
        self.schedules.get(&schedule_id)
    }

    pub fn assoc(&self, id: NodeScheduleId) -> Option<&NodeScheduleRow> {
        self.assocs.get(&id)
    }

    pub fn assocs_for_node(&self, node_id: NodeId) -> Vec<&NodeScheduleRow> {
        self.collect(self.by_node.get(&node_id))
    }

    pub fn assocs_for_schedule(&self, schedule_id: ScheduleId) -> Vec<&NodeScheduleRow> {
        self.collect(self.by_schedule.get(&schedule_id))
    }

    fn collect(&self, ids: Option<&HashSet<NodeScheduleId>>) -> Vec<&NodeScheduleRow> {
        let mut rows: Vec<&NodeScheduleRow> = ids
            .into_iter()
            .flatten()
            .filter_map(|id| self.assocs.get(id))
            .collect();
        rows.sort_by_key(|a| a.node_schedule_id);
        rows
    }
}

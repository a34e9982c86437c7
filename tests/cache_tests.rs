use maestro::cache::ScheduleCache;
use maestro::store::{NodeRow, NodeScheduleRow, NodeType, ScheduleRow};

fn node(node_id: i64, name: &str) -> NodeRow {
    NodeRow {
        node_id,
        node_type: NodeType::Job,
        name: name.to_string(),
        enabled: true,
    }
}

fn assoc(id: i64, node_id: i64, schedule_id: i64) -> NodeScheduleRow {
    NodeScheduleRow {
        node_schedule_id: id,
        node_id,
        schedule_id,
    }
}

#[test]
fn put_and_get_records() {
    let mut cache = ScheduleCache::new();
    cache.put_node(node(1, "backup"));
    cache.put_schedule(ScheduleRow {
        schedule_id: 5,
        cron_expression: "0 0 * * * *".to_string(),
    });

    assert_eq!(cache.node(1).unwrap().name, "backup");
    assert_eq!(cache.schedule(5).unwrap().cron_expression, "0 0 * * * *");
    assert!(cache.node(2).is_none());
}

#[test]
fn node_save_replaces_record() {
    let mut cache = ScheduleCache::new();
    cache.put_node(node(1, "old"));
    cache.put_node(node(1, "new"));
    assert_eq!(cache.node(1).unwrap().name, "new");
}

#[test]
fn assoc_indexes_by_node_and_schedule() {
    let mut cache = ScheduleCache::new();
    cache.put_assocs([assoc(1, 10, 5), assoc(2, 10, 6), assoc(3, 11, 5)]);

    let for_node: Vec<i64> = cache
        .assocs_for_node(10)
        .into_iter()
        .map(|a| a.node_schedule_id)
        .collect();
    assert_eq!(for_node, vec![1, 2]);

    let for_schedule: Vec<i64> = cache
        .assocs_for_schedule(5)
        .into_iter()
        .map(|a| a.node_schedule_id)
        .collect();
    assert_eq!(for_schedule, vec![1, 3]);
}

#[test]
fn remove_assocs_clears_indexes() {
    let mut cache = ScheduleCache::new();
    cache.put_assocs([assoc(1, 10, 5), assoc(2, 10, 6)]);
    cache.remove_assocs(&[1]);

    assert!(cache.assoc(1).is_none());
    let remaining: Vec<i64> = cache
        .assocs_for_node(10)
        .into_iter()
        .map(|a| a.node_schedule_id)
        .collect();
    assert_eq!(remaining, vec![2]);
    assert!(cache.assocs_for_schedule(5).is_empty());
}

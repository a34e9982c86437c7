use std::collections::HashSet;

use chrono::{Duration, Utc};
use maestro::tracker::AgentTracker;

#[test]
fn pick_agent_with_no_agents_is_none() {
    let tracker = AgentTracker::deterministic();
    assert_eq!(tracker.pick_agent(None, None), None);
}

#[test]
fn pick_agent_prefers_least_loaded() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.add_agent("a2", now);
    tracker.assign_job("a1", 10, now);

    assert_eq!(tracker.pick_agent(None, None), Some("a2".to_string()));
}

#[test]
fn pick_agent_breaks_ties_by_lowest_id_when_deterministic() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("b", now);
    tracker.add_agent("a", now);

    assert_eq!(tracker.pick_agent(None, None), Some("a".to_string()));
}

#[test]
fn pick_agent_honors_affinity() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.add_agent("a2", now);
    tracker.assign_job("a1", 10, now);

    let affinity: HashSet<String> = ["a1".to_string()].into_iter().collect();
    // a2 is less loaded but outside the affinity set.
    assert_eq!(
        tracker.pick_agent(Some(&affinity), None),
        Some("a1".to_string())
    );

    let unknown: HashSet<String> = ["zz".to_string()].into_iter().collect();
    assert_eq!(tracker.pick_agent(Some(&unknown), None), None);
}

#[test]
fn pick_agent_honors_concurrency_cap() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.assign_job("a1", 10, now);

    assert_eq!(tracker.pick_agent(None, Some(1)), None);
    assert_eq!(tracker.pick_agent(None, Some(2)), Some("a1".to_string()));
}

#[test]
fn randomized_tracker_still_picks_a_candidate() {
    let mut tracker = AgentTracker::new();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.add_agent("a2", now);

    let picked = tracker.pick_agent(None, None).unwrap();
    assert!(picked == "a1" || picked == "a2");
}

#[test]
fn clear_job_releases_capacity() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.assign_job("a1", 10, now);
    assert_eq!(tracker.running_count("a1"), 1);

    tracker.clear_job("a1", 10);
    assert_eq!(tracker.running_count("a1"), 0);
}

#[test]
fn heartbeat_for_unknown_agent_is_rejected() {
    let mut tracker = AgentTracker::deterministic();
    assert!(!tracker.heartbeat("ghost", Utc::now()));

    tracker.add_agent("a1", Utc::now());
    assert!(tracker.heartbeat("a1", Utc::now()));
}

#[test]
fn reregistration_resets_assignments() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.assign_job("a1", 10, now);
    assert_eq!(tracker.running_count("a1"), 1);

    tracker.add_agent("a1", now);
    assert_eq!(tracker.running_count("a1"), 0);
}

#[test]
fn dead_since_returns_stale_agents_with_their_vertices() {
    let mut tracker = AgentTracker::deterministic();
    let old = Utc::now() - Duration::seconds(60);
    let now = Utc::now();
    tracker.add_agent("stale", old);
    tracker.assign_job("stale", 10, old);
    tracker.assign_job("stale", 11, old);
    tracker.add_agent("fresh", now);

    let threshold = now - Duration::seconds(30);
    let dead = tracker.dead_since(threshold);
    assert_eq!(dead.len(), 1);
    let vertices = &dead["stale"];
    assert!(vertices.contains(&10) && vertices.contains(&11));

    tracker.remove_agents(dead.keys());
    assert!(!tracker.agent_exists("stale"));
    assert!(tracker.agent_exists("fresh"));
}

#[test]
fn agents_lists_sorted_and_remove_agent_drops_one() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("b", now);
    tracker.add_agent("a", now);
    assert_eq!(tracker.agents(), vec!["a".to_string(), "b".to_string()]);

    tracker.remove_agent("a");
    assert_eq!(tracker.agents(), vec!["b".to_string()]);
}

#[test]
fn holders_of_intersects_running_sets() {
    let mut tracker = AgentTracker::deterministic();
    let now = Utc::now();
    tracker.add_agent("a1", now);
    tracker.add_agent("a2", now);
    tracker.assign_job("a1", 10, now);
    tracker.assign_job("a2", 11, now);
    tracker.assign_job("a2", 99, now);

    let wanted: HashSet<i64> = [10, 11].into_iter().collect();
    let held = tracker.holders_of(&wanted);
    assert_eq!(held["a1"], vec![10]);
    assert_eq!(held["a2"], vec![11]);
}

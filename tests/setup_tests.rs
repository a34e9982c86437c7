mod test_harness;

use std::sync::Arc;

use maestro::error::ConductorError;
use maestro::setup;
use maestro::store::{MemoryStore, Status, Store, SYNTHETIC_WORKFLOW_ID};
use test_harness::{seed_job_node, seed_workflow_node};

#[tokio::test]
async fn workflow_snapshot_projects_templates() {
    let store = Arc::new(MemoryStore::new());
    seed_workflow_node(&store, 10, "pipeline");
    seed_job_node(&store, 101, "extract", "echo extract");
    seed_job_node(&store, 102, "load", "echo load");
    let va = store.add_workflow_vertex(10, 101, Some("0,0".to_string()));
    let vb = store.add_workflow_vertex(10, 102, None);
    store.add_workflow_edge(10, va, vb, true);

    let launch = setup::launch_workflow(&*store, 10).await.unwrap();
    assert_eq!(launch.workflow_name, "pipeline");
    assert!(launch.model.is_finalized());

    let execution = store.execution(launch.execution_id).await.unwrap().unwrap();
    assert_eq!(execution.status, Status::Pending);

    let workflows = store
        .execution_workflows(launch.execution_id)
        .await
        .unwrap();
    assert_eq!(workflows.len(), 1);
    assert!(workflows[0].root);
    assert_eq!(workflows[0].workflow_id, 10);

    let vertices = store.execution_vertices(launch.execution_id).await.unwrap();
    assert_eq!(vertices.len(), 2);
    assert!(vertices.iter().all(|v| v.status == Status::Unexecuted));
    // Layout copied from the template vertex.
    let extract = vertices.iter().find(|v| v.node_id == 101).unwrap();
    assert_eq!(extract.layout.as_deref(), Some("0,0"));

    let edges = store.execution_edges(launch.execution_id).await.unwrap();
    assert_eq!(edges.len(), 1);
    let load = vertices.iter().find(|v| v.node_id == 102).unwrap();
    assert_eq!(edges[0].from_exec_vertex_id, extract.exec_vertex_id);
    assert_eq!(edges[0].to_exec_vertex_id, load.exec_vertex_id);
    assert!(edges[0].success);

    // The snapshot drives the model, not the template tables.
    let roots = launch
        .model
        .workflow_roots(workflows[0].exec_wf_id);
    assert_eq!(roots.into_iter().collect::<Vec<_>>(), vec![extract.exec_vertex_id]);
}

#[tokio::test]
async fn single_job_uses_synthetic_workflow() {
    let store = Arc::new(MemoryStore::new());
    seed_job_node(&store, 55, "cleanup", "echo clean");

    let launch = setup::launch_job(&*store, 55).await.unwrap();
    assert_eq!(launch.workflow_name, "cleanup");

    let workflows = store
        .execution_workflows(launch.execution_id)
        .await
        .unwrap();
    assert_eq!(workflows.len(), 1);
    assert_eq!(workflows[0].workflow_id, SYNTHETIC_WORKFLOW_ID);
    assert!(workflows[0].root);

    let vertices = store.execution_vertices(launch.execution_id).await.unwrap();
    assert_eq!(vertices.len(), 1);
    assert_eq!(vertices[0].node_id, 55);
}

#[tokio::test]
async fn nested_templates_are_snapshotted_once() {
    let store = Arc::new(MemoryStore::new());
    seed_workflow_node(&store, 10, "outer");
    seed_workflow_node(&store, 20, "inner");
    seed_job_node(&store, 201, "work", "echo work");
    // Two outer vertices reference the same inner template.
    let x1 = store.add_workflow_vertex(10, 20, None);
    let x2 = store.add_workflow_vertex(10, 20, None);
    store.add_workflow_edge(10, x1, x2, true);
    store.add_workflow_vertex(20, 201, None);

    let launch = setup::launch_workflow(&*store, 10).await.unwrap();

    let workflows = store
        .execution_workflows(launch.execution_id)
        .await
        .unwrap();
    // Deduplicated: one exec-wf per referenced template.
    assert_eq!(workflows.len(), 2);
    let inner = workflows.iter().find(|w| w.workflow_id == 20).unwrap();

    let vertices = store.execution_vertices(launch.execution_id).await.unwrap();
    let outer_vertices: Vec<_> = vertices.iter().filter(|v| v.node_id == 20).collect();
    assert_eq!(outer_vertices.len(), 2);
    for vertex in outer_vertices {
        assert_eq!(vertex.runs_exec_wf_id, Some(inner.exec_wf_id));
        assert_eq!(
            launch.model.runs_workflow(vertex.exec_vertex_id),
            Some(inner.exec_wf_id)
        );
    }
}

#[tokio::test]
async fn cyclic_template_fails_and_marks_execution() {
    let store = Arc::new(MemoryStore::new());
    seed_workflow_node(&store, 10, "looped");
    seed_job_node(&store, 101, "a", "echo a");
    seed_job_node(&store, 102, "b", "echo b");
    let va = store.add_workflow_vertex(10, 101, None);
    let vb = store.add_workflow_vertex(10, 102, None);
    store.add_workflow_edge(10, va, vb, true);
    store.add_workflow_edge(10, vb, va, true);

    match setup::launch_workflow(&*store, 10).await {
        Err(ConductorError::CyclicGraph { workflow_id }) => assert_eq!(workflow_id, 10),
        other => panic!("expected CyclicGraph, got {:?}", other.map(|l| l.execution_id)),
    }

    // The failed trigger is visible post hoc.
    let execution = store.execution(1).await.unwrap().unwrap();
    assert_eq!(execution.status, Status::FinishedError);
    assert!(execution.finish_ts.is_some());
}

#[tokio::test]
async fn resume_replays_child_workflow_links() {
    let store = Arc::new(MemoryStore::new());
    seed_workflow_node(&store, 10, "outer");
    seed_workflow_node(&store, 20, "inner");
    seed_job_node(&store, 201, "work", "echo work");
    store.add_workflow_vertex(10, 20, None);
    store.add_workflow_vertex(20, 201, None);

    let launch = setup::launch_workflow(&*store, 10).await.unwrap();
    let vertices = store.execution_vertices(launch.execution_id).await.unwrap();
    let outer_vertex = vertices.iter().find(|v| v.node_id == 20).unwrap();
    let original_child = launch.model.runs_workflow(outer_vertex.exec_vertex_id).unwrap();

    let resumed = setup::resume(&*store, launch.execution_id).await.unwrap();
    assert!(resumed.model.is_finalized());
    assert_eq!(resumed.workflow_name, "outer");
    assert_eq!(
        resumed.model.runs_workflow(outer_vertex.exec_vertex_id),
        Some(original_child)
    );
    assert_eq!(
        resumed.model.parent_vertex(
            vertices.iter().find(|v| v.node_id == 201).unwrap().exec_vertex_id
        ),
        Some(outer_vertex.exec_vertex_id)
    );
}

#[tokio::test]
async fn resume_of_unknown_execution_fails() {
    let store = Arc::new(MemoryStore::new());
    match setup::resume(&*store, 42).await {
        Err(ConductorError::ExecutionNotFound(42)) => {}
        other => panic!("expected ExecutionNotFound, got {:?}", other.map(|l| l.execution_id)),
    }
}

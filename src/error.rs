use thiserror::Error;

use crate::store::{ExecVertexId, ExecutionId, NodeId, WorkflowId};

#[derive(Error, Debug)]
pub enum ConductorError {
    #[error("cyclic graph in workflow {workflow_id}")]
    CyclicGraph { workflow_id: WorkflowId },

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("job not found for node {0}")]
    JobNotFound(NodeId),

    #[error("execution not found: {0}")]
    ExecutionNotFound(ExecutionId),

    #[error("execution {0} is already running")]
    ExecutionLive(ExecutionId),

    #[error("execution vertex not found: {0}")]
    VertexNotFound(ExecVertexId),

    #[error("execution model invariant violated: {0}")]
    Model(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("timer error: {0}")]
    Timer(String),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConductorError>;

//! Pub/sub messaging between the conductor, its agents, and UI servers.
//!
//! The conductor publishes on per-agent command topics, a broadcast topic,
//! and a status topic, and consumes agent replies from a single inbox
//! topic. Publishing goes through a bounded channel drained by a dedicated
//! writer task, so controller handlers never block on socket I/O; when the
//! channel fills, the controller blocks on the send rather than dropping
//! correctness-bearing messages.

pub mod client;
pub mod protocol;
pub mod topics;

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

pub use client::{MqttConnection, MqttTransport};
pub use protocol::{AgentMessage, ConductorMessage};
pub use topics::Topics;

/// One outbound publish: topic plus encoded payload.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Publishing half of the transport.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()>;
}

/// Drains the publish channel onto the transport until the channel closes
/// or shutdown is requested.
pub fn spawn_publisher(
    mut rx: mpsc::Receiver<Outbound>,
    transport: Arc<dyn Transport>,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if let Err(e) = transport.publish(&msg.topic, msg.payload).await {
                        tracing::warn!(topic = %msg.topic, error = %e, "Publish failed");
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }
    })
}

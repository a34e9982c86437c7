//! MQTT transport implementation.

use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::protocol::AgentMessage;
use super::topics::Topics;
use super::Transport;
use crate::controller::ControllerMessage;
use crate::error::{ConductorError, Result};

/// Broker-backed connection owning the rumqttc event loop.
pub struct MqttConnection {
    client: AsyncClient,
    eventloop: EventLoop,
}

impl MqttConnection {
    pub fn new(host: &str, port: u16, client_id: &str) -> Self {
        let mut options = MqttOptions::new(client_id, host, port);
        options.set_keep_alive(std::time::Duration::from_secs(30));
        let (client, eventloop) = AsyncClient::new(options, 64);
        Self { client, eventloop }
    }

    /// Subscribes to the inbox topic agents publish their replies on.
    pub async fn subscribe_inbox(&self) -> Result<()> {
        self.client
            .subscribe(Topics::conductor_inbox(), QoS::AtLeastOnce)
            .await
            .map_err(|e| ConductorError::Transport(e.to_string()))?;
        tracing::info!(topic = Topics::conductor_inbox(), "Subscribed");
        Ok(())
    }

    /// Publishing handle, cheap to clone into the writer task.
    pub fn transport(&self) -> MqttTransport {
        MqttTransport {
            client: self.client.clone(),
        }
    }

    /// Consumes the connection, decoding inbound agent messages and
    /// forwarding them into the controller inbox. Undecodable payloads are
    /// logged and dropped, never fatal.
    pub async fn run(
        mut self,
        inbox: mpsc::Sender<ControllerMessage>,
        shutdown: CancellationToken,
    ) {
        loop {
            tokio::select! {
                event = self.eventloop.poll() => match event {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        match serde_json::from_slice::<AgentMessage>(&publish.payload) {
                            Ok(msg) => {
                                tracing::debug!(topic = %publish.topic, "Agent message received");
                                if inbox.send(ControllerMessage::Agent(msg)).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                tracing::warn!(topic = %publish.topic, error = %e, "Undecodable payload dropped");
                            }
                        }
                    }
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        tracing::info!("Broker connected");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "Broker poll error, reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                },
                _ = shutdown.cancelled() => break,
            }
        }
    }
}

/// Publishing half of [`MqttConnection`].
#[derive(Clone)]
pub struct MqttTransport {
    client: AsyncClient,
}

#[async_trait]
impl Transport for MqttTransport {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| ConductorError::Transport(e.to_string()))
    }
}

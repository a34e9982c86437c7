use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use maestro::config::ConductorConfig;
use maestro::controller::{Controller, ControllerMessage};
use maestro::events;
use maestro::messaging::{self, MqttConnection, Transport};
use maestro::notifier::LogNotifier;
use maestro::shutdown;
use maestro::store::MemoryStore;
use maestro::timer::CronTimer;

#[derive(Parser, Debug)]
#[command(name = "maestro")]
#[command(about = "Conductor core of a distributed job-scheduling system")]
struct Args {
    /// Interval between heartbeat broadcasts to agents
    #[arg(long, env = "HEARTBEAT_INTERVAL_MS", default_value = "5000")]
    heartbeat_interval_ms: u64,

    /// Heartbeat silence after which an agent is declared dead
    #[arg(long, env = "HEARTBEAT_DEAD_AFTER_MS", default_value = "15000")]
    heartbeat_dead_after_ms: u64,

    /// Pub/sub broker host
    #[arg(long, env = "BROKER_HOST", default_value = "127.0.0.1")]
    broker_host: String,

    /// Pub/sub broker port
    #[arg(long, env = "BROKER_PORT", default_value = "1883")]
    broker_port: u16,

    /// Persistent store URL
    #[arg(long, env = "DB_URL", default_value = "memory://")]
    db_url: String,

    /// Recipient for failure and dead-agent notifications
    #[arg(long, env = "ERROR_EMAIL_TO", default_value = "ops@localhost")]
    error_email_to: String,

    /// Optional cap on in-flight vertices per agent
    #[arg(long, env = "MAX_CONCURRENT_PER_AGENT")]
    max_concurrent_per_agent: Option<u32>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let config = ConductorConfig {
        heartbeat_interval_ms: args.heartbeat_interval_ms,
        heartbeat_dead_after_ms: args.heartbeat_dead_after_ms,
        broker_host: args.broker_host,
        broker_port: args.broker_port,
        db_url: args.db_url,
        error_email_to: args.error_email_to,
        max_concurrent_per_agent: args.max_concurrent_per_agent,
        deterministic_agent_choice: false,
    };

    tracing::info!(
        broker = %format!("{}:{}", config.broker_host, config.broker_port),
        db_url = %config.db_url,
        heartbeat_interval_ms = config.heartbeat_interval_ms,
        "Starting maestro conductor"
    );

    let shutdown = shutdown::install_shutdown_handler();

    // The in-memory store backs the default binary; a database-backed
    // implementation plugs in through the same trait.
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(LogNotifier::new(config.error_email_to.clone()));

    let (timer_tx, mut timer_rx) = mpsc::channel(64);
    let timer = Arc::new(CronTimer::new(timer_tx).await?);

    let connection = MqttConnection::new(&config.broker_host, config.broker_port, "maestro-conductor");
    connection.subscribe_inbox().await?;
    let transport: Arc<dyn Transport> = Arc::new(connection.transport());

    let (publish_tx, publish_rx) = mpsc::channel(256);
    let (events_tx, events_rx) = mpsc::channel(256);

    let (controller, inbox_rx) = Controller::new(
        config,
        store,
        timer,
        notifier,
        publish_tx.clone(),
        events_tx,
    );
    let inbox_tx = controller.message_sender();

    messaging::spawn_publisher(publish_rx, transport, shutdown.clone());
    events::spawn_status_publisher(events_rx, publish_tx, shutdown.clone());

    // Subscriber reader: decoded agent replies flow into the controller.
    let subscriber_inbox = inbox_tx.clone();
    let subscriber_shutdown = shutdown.clone();
    tokio::spawn(async move {
        connection.run(subscriber_inbox, subscriber_shutdown).await;
    });

    // Timer-source consumer: cron firings become trigger messages.
    let trigger_inbox = inbox_tx;
    tokio::spawn(async move {
        while let Some(event) = timer_rx.recv().await {
            if trigger_inbox
                .send(ControllerMessage::Trigger(event))
                .await
                .is_err()
            {
                break;
            }
        }
    });

    controller.run(inbox_rx, shutdown).await;
    Ok(())
}

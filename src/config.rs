#[derive(Debug, Clone)]
pub struct ConductorConfig {
    pub heartbeat_interval_ms: u64,
    pub heartbeat_dead_after_ms: u64,
    pub broker_host: String,
    pub broker_port: u16,
    pub db_url: String,
    pub error_email_to: String,
    /// Upper bound on in-flight vertices per agent. `None` disables the cap.
    pub max_concurrent_per_agent: Option<u32>,
    /// Break agent-selection ties by lowest agent id instead of randomly.
    pub deterministic_agent_choice: bool,
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 5_000,
            heartbeat_dead_after_ms: 15_000,
            broker_host: "127.0.0.1".to_string(),
            broker_port: 1883,
            db_url: "memory://".to_string(),
            error_email_to: "ops@localhost".to_string(),
            max_concurrent_per_agent: None,
            deterministic_agent_choice: false,
        }
    }
}

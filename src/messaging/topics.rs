//! Topic scheme for conductor↔agent messaging.

/// Topic patterns. Agents subscribe to their own command topic plus the
/// broadcast topic; the conductor subscribes to the inbox; UI servers
/// subscribe to the status topic.
pub struct Topics;

impl Topics {
    /// Unicast commands for one agent.
    pub fn agent_commands(agent_id: &str) -> String {
        format!("maestro/agent/{}/cmd", agent_id)
    }

    /// Commands addressed to every agent.
    pub fn broadcast() -> &'static str {
        "maestro/broadcast"
    }

    /// Agent replies to the conductor.
    pub fn conductor_inbox() -> &'static str {
        "maestro/conductor"
    }

    /// Status events for UI servers.
    pub fn status() -> &'static str {
        "maestro/status"
    }

    /// Extracts the agent id from a command topic.
    pub fn parse_agent_id(topic: &str) -> Option<String> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() == 4 && parts[0] == "maestro" && parts[1] == "agent" && parts[3] == "cmd" {
            Some(parts[2].to_string())
        } else {
            None
        }
    }
}

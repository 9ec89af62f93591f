//! Message shapes for the Outpost agent control channel. Keeping them in one
//! crate lets the agent and any server-side tooling agree on the JSON layout
//! without copying structs around.

use serde::{Deserialize, Serialize};

mod directive;

pub use directive::Directive;

/// First frame the agent writes after every successful dial.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthHello {
    pub token: String,
    pub server_id: String,
    pub version: String,
}

impl AuthHello {
    pub fn new(
        token: impl Into<String>,
        server_id: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            token: token.into(),
            server_id: server_id.into(),
            version: version.into(),
        }
    }
}

/// Host load snapshot carried by heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatSnapshot {
    pub cpu_usage: f64,
    pub memory_usage: f64,
    /// RFC3339 timestamp of when the sample was taken.
    pub timestamp: String,
}

/// Everything the agent pushes to the server after authenticating.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content", rename_all = "snake_case")]
pub enum AgentMessage {
    Heartbeat(HeartbeatSnapshot),
    Status(String),
    Error(String),
    CommandResult(String),
}

impl AgentMessage {
    pub fn status(text: impl Into<String>) -> Self {
        AgentMessage::Status(text.into())
    }

    pub fn error(text: impl Into<String>) -> Self {
        AgentMessage::Error(text.into())
    }

    pub fn command_result(output: impl Into<String>) -> Self {
        AgentMessage::CommandResult(output.into())
    }
}

use serde::{Deserialize, Serialize};

/// Topic of the frame acknowledging a `join` command.
pub const JOIN_ACK_TOPIC: &str = "@join";
/// Topic of the frame acknowledging a `leave` command.
pub const LEAVE_ACK_TOPIC: &str = "@leave";

/// Inbound command frame: `{"cmd": "join" | "leave", "args": [topic, ...]}`.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "cmd", content = "args", rename_all = "lowercase")]
pub enum ClientCommand {
    Join(Vec<String>),
    Leave(Vec<String>),
}

impl ClientCommand {
    /// Parses a frame; `None` for anything that is not a known command.
    pub fn parse(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }

    /// Topics named by the command, empty names removed.
    pub fn topics(&self) -> Vec<String> {
        let (Self::Join(topics) | Self::Leave(topics)) = self;
        topics.iter().filter(|t| !t.is_empty()).cloned().collect()
    }
}

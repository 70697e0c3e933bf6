//! Session status

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the session is doing right now. Exactly one is active.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    #[default]
    Idle,
    /// Exchange accepted, request being composed
    Thinking,
    /// Response events are arriving
    Streaming,
    /// Executing the tool calls of the last response
    ToolUse,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Thinking => "thinking",
            SessionStatus::Streaming => "streaming",
            SessionStatus::ToolUse => "tool_use",
        }
    }

    pub fn is_idle(self) -> bool {
        self == SessionStatus::Idle
    }

    pub fn is_busy(self) -> bool {
        !self.is_idle()
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The tool call currently awaiting completion, if any
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTool {
    pub tool_use_id: String,
    pub name: String,
}

//! Streaming event model
//!
//! One ordered sequence of these events is produced per outgoing request.
//! Transports translate their wire format into this shape; the assembler
//! consumes nothing else.

use super::{LlmError, StopReason};
use futures::Stream;
use serde_json::{Map, Value};
use std::pin::Pin;

/// Boxed event stream returned by a transport
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, LlmError>> + Send>>;

/// Events emitted while a response streams in
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A content block opened at `index`
    BlockStart { index: usize, kind: BlockKind },
    /// Incremental content for the block at `index`
    BlockDelta { index: usize, delta: Delta },
    /// Message-level update; carries the stop reason near the end
    MessageDelta { stop_reason: Option<StopReason> },
    /// The message is complete
    MessageStop,
    /// Error reported in-band by the server
    Error { message: String },
}

/// Declared kind of a content block at `BlockStart`
#[derive(Debug, Clone, PartialEq)]
pub enum BlockKind {
    Text,
    ToolUse { id: String, name: String },
    /// A block type this client does not know; its content still accumulates
    Other(String),
}

impl BlockKind {
    pub fn type_name(&self) -> &str {
        match self {
            BlockKind::Text => "text",
            BlockKind::ToolUse { .. } => "tool_use",
            BlockKind::Other(name) => name,
        }
    }
}

/// Incremental fragment of a block's content
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Text { text: String },
    InputJson { partial_json: String },
    /// Unrecognized delta kind, kept verbatim so its fields can be merged
    Other { kind: String, fields: Map<String, Value> },
}

impl Delta {
    pub fn kind(&self) -> &str {
        match self {
            Delta::Text { .. } => "text_delta",
            Delta::InputJson { .. } => "input_json_delta",
            Delta::Other { kind, .. } => kind,
        }
    }
}

/// Convenience constructors used by transports and tests
impl StreamEvent {
    pub fn text_start(index: usize) -> Self {
        StreamEvent::BlockStart {
            index,
            kind: BlockKind::Text,
        }
    }

    pub fn tool_start(index: usize, id: impl Into<String>, name: impl Into<String>) -> Self {
        StreamEvent::BlockStart {
            index,
            kind: BlockKind::ToolUse {
                id: id.into(),
                name: name.into(),
            },
        }
    }

    pub fn text_delta(index: usize, text: impl Into<String>) -> Self {
        StreamEvent::BlockDelta {
            index,
            delta: Delta::Text { text: text.into() },
        }
    }

    pub fn json_delta(index: usize, partial_json: impl Into<String>) -> Self {
        StreamEvent::BlockDelta {
            index,
            delta: Delta::InputJson {
                partial_json: partial_json.into(),
            },
        }
    }

    pub fn stop_reason(reason: impl Into<StopReason>) -> Self {
        StreamEvent::MessageDelta {
            stop_reason: Some(reason.into()),
        }
    }
}

//! Block assembler
//!
//! Rebuilds one finalized message from the ordered event stream of a single
//! response. Blocks are keyed by the server-assigned index, so deltas for
//! different blocks may interleave freely. Partial tool JSON is only ever
//! buffered; it is parsed exactly once, in [`BlockAssembler::finalize`].

use super::{BlockKind, ContentBlock, Delta, LlmError, StopReason, StreamEvent};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Finalized content of one streamed response
#[derive(Debug, Clone, PartialEq)]
pub struct AssembledMessage {
    pub content: Vec<ContentBlock>,
    pub stop_reason: Option<StopReason>,
}

/// Non-authoritative snapshot of a block while it streams
#[derive(Debug, Clone, PartialEq)]
pub enum PreviewBlock {
    Text {
        index: usize,
        text: String,
    },
    ToolUse {
        index: usize,
        id: String,
        name: String,
        /// Raw JSON received so far; usually not parseable yet
        partial_input: String,
    },
}

#[derive(Debug)]
struct BlockEntry {
    kind: BlockKind,
    text: String,
    input_buffer: String,
    /// Fields of unrecognized deltas, merged as-is
    extra: Map<String, Value>,
}

impl BlockEntry {
    fn new(kind: BlockKind) -> Self {
        Self {
            kind,
            text: String::new(),
            input_buffer: String::new(),
            extra: Map::new(),
        }
    }

    fn preview(&self, index: usize) -> Option<PreviewBlock> {
        match &self.kind {
            BlockKind::ToolUse { id, name } => Some(PreviewBlock::ToolUse {
                index,
                id: id.clone(),
                name: name.clone(),
                partial_input: self.input_buffer.clone(),
            }),
            BlockKind::Text | BlockKind::Other(_) if !self.text.is_empty() => {
                Some(PreviewBlock::Text {
                    index,
                    text: self.text.clone(),
                })
            }
            BlockKind::Text | BlockKind::Other(_) => None,
        }
    }

    /// Convert to a content block, dropping internal-only state
    fn into_content(self, index: usize) -> Option<ContentBlock> {
        match self.kind {
            BlockKind::ToolUse { id, name } => {
                let input = parse_tool_input(&self.input_buffer, &name, index);
                Some(ContentBlock::ToolUse { id, name, input })
            }
            BlockKind::Text | BlockKind::Other(_) if !self.text.is_empty() => {
                Some(ContentBlock::Text { text: self.text })
            }
            BlockKind::Text => None,
            BlockKind::Other(kind) => {
                tracing::debug!(
                    index,
                    kind = %kind,
                    extra_fields = self.extra.len(),
                    "Omitting block of unknown kind with no text content"
                );
                None
            }
        }
    }
}

/// Parse a fully buffered tool input. Never fails: a malformed buffer yields
/// `None`, which the dispatcher turns into a tool-level error.
fn parse_tool_input(buffer: &str, name: &str, index: usize) -> Option<Value> {
    if buffer.trim().is_empty() {
        // Tools without arguments stream no JSON at all
        return Some(Value::Object(Map::new()));
    }
    match serde_json::from_str(buffer) {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(
                tool = %name,
                index,
                error = %e,
                "Tool input is not valid JSON"
            );
            None
        }
    }
}

/// Incremental message builder, one per streamed response
#[derive(Debug, Default)]
pub struct BlockAssembler {
    blocks: BTreeMap<usize, BlockEntry>,
    stop_reason: Option<StopReason>,
    finalized: Option<AssembledMessage>,
}

impl BlockAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one event. Only an in-band server error is returned as `Err`;
    /// every other irregularity is logged and tolerated.
    pub fn on_event(&mut self, event: StreamEvent) -> Result<(), LlmError> {
        if self.finalized.is_some() {
            if let StreamEvent::Error { message } = event {
                return Err(LlmError::stream(message));
            }
            tracing::warn!(?event, "Ignoring stream event after message was finalized");
            return Ok(());
        }

        match event {
            StreamEvent::BlockStart { index, kind } => self.start_block(index, kind),
            StreamEvent::BlockDelta { index, delta } => self.apply_delta(index, delta),
            StreamEvent::MessageDelta { stop_reason } => {
                if stop_reason.is_some() {
                    self.stop_reason = stop_reason;
                }
            }
            StreamEvent::MessageStop => {
                self.finalize();
            }
            StreamEvent::Error { message } => return Err(LlmError::stream(message)),
        }
        Ok(())
    }

    fn start_block(&mut self, index: usize, kind: BlockKind) {
        if let BlockKind::Other(name) = &kind {
            tracing::warn!(index, kind = %name, "Unrecognized content block kind");
        }
        match self.blocks.get_mut(&index) {
            Some(existing) => {
                tracing::warn!(index, "Duplicate block start; keeping accumulated content");
                if matches!(existing.kind, BlockKind::Other(_)) {
                    existing.kind = kind;
                }
            }
            None => {
                self.blocks.insert(index, BlockEntry::new(kind));
            }
        }
    }

    fn apply_delta(&mut self, index: usize, delta: Delta) {
        let entry = self.blocks.entry(index).or_insert_with(|| {
            tracing::warn!(index, delta = %delta.kind(), "Delta received before block start");
            let kind = match &delta {
                Delta::Text { .. } => BlockKind::Text,
                Delta::InputJson { .. } | Delta::Other { .. } => {
                    BlockKind::Other("implicit".to_string())
                }
            };
            BlockEntry::new(kind)
        });

        match delta {
            Delta::Text { text } => entry.text.push_str(&text),
            Delta::InputJson { partial_json } => entry.input_buffer.push_str(&partial_json),
            Delta::Other { kind, fields } => {
                tracing::warn!(index, delta = %kind, "Merging unrecognized delta kind");
                entry.extra.extend(fields);
            }
        }
    }

    /// Snapshot of the blocks streamed so far, in index order
    pub fn preview(&self) -> Vec<PreviewBlock> {
        self.blocks
            .iter()
            .filter_map(|(index, entry)| entry.preview(*index))
            .collect()
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.is_some()
    }

    /// Produce the finished message. The block table is consumed on the
    /// first call; later calls return the cached result unchanged.
    pub fn finalize(&mut self) -> AssembledMessage {
        if let Some(done) = &self.finalized {
            return done.clone();
        }

        let content = std::mem::take(&mut self.blocks)
            .into_iter()
            .filter_map(|(index, entry)| entry.into_content(index))
            .collect();

        let message = AssembledMessage {
            content,
            stop_reason: self.stop_reason.clone(),
        };
        self.finalized = Some(message.clone());
        message
    }
}

//! Scene tools the model may invoke
//!
//! The dispatcher owns a static set of tool declarations and routes each
//! call to a pluggable backend. When no backend is ready, every known tool
//! answers with a canned response so the conversation can continue.

mod object;
mod room;
mod scene;

pub use object::{AddObjectInput, AddObjectTool, RemoveObjectInput, RemoveObjectTool};
pub use room::{CreateRoomInput, CreateRoomTool, ListRoomsTool};
pub use scene::SceneBackend;

use crate::llm::ToolDefinition;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

/// Validated tool call, ready for a backend
#[derive(Debug, Clone, PartialEq)]
pub enum SceneCommand {
    CreateRoom(CreateRoomInput),
    AddObject(AddObjectInput),
    RemoveObject(RemoveObjectInput),
    ListRooms,
}

impl SceneCommand {
    pub fn tool_name(&self) -> &'static str {
        match self {
            SceneCommand::CreateRoom(_) => CreateRoomTool::NAME,
            SceneCommand::AddObject(_) => AddObjectTool::NAME,
            SceneCommand::RemoveObject(_) => RemoveObjectTool::NAME,
            SceneCommand::ListRooms => ListRoomsTool::NAME,
        }
    }
}

/// Failure reported by a backend, in words the model can act on
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct BackendError(pub String);

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Why a tool call produced no successful result
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid input for {tool}: {reason}")]
    InvalidInput { tool: String, reason: String },
    #[error("{tool} failed: {message}")]
    Backend { tool: String, message: String },
    #[error("Tool call cancelled")]
    Cancelled,
}

/// Domain backend that performs scene mutations
#[async_trait]
pub trait ToolBackend: Send + Sync {
    /// Whether the backend can accept calls right now
    fn is_ready(&self) -> bool;

    async fn execute(&self, command: &SceneCommand) -> Result<String, BackendError>;
}

#[async_trait]
impl<T: ToolBackend + ?Sized> ToolBackend for Arc<T> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    async fn execute(&self, command: &SceneCommand) -> Result<String, BackendError> {
        (**self).execute(command).await
    }
}

/// Declaration and validation for a single tool
pub trait Tool: Send + Sync {
    /// Tool name
    fn name(&self) -> &'static str;

    /// Tool description for LLM
    fn description(&self) -> String;

    /// JSON schema for tool input
    fn input_schema(&self) -> Value;

    /// Validate raw model input into a backend command
    fn parse(&self, input: &Value) -> Result<SceneCommand, String>;

    /// Degraded response used when no backend is ready
    fn fallback(&self, command: &SceneCommand) -> String;

    fn definition(&self) -> ToolDefinition {
        ToolDefinition {
            name: self.name().to_string(),
            description: self.description(),
            input_schema: self.input_schema(),
        }
    }
}

/// Deserialize tool input into its typed form
pub(crate) fn parse_input<T: DeserializeOwned>(input: &Value) -> Result<T, String> {
    if !input.is_object() {
        return Err(format!("expected a JSON object, got {input}"));
    }
    serde_json::from_value(input.clone()).map_err(|e| e.to_string())
}

/// Reject blank required strings; returns the trimmed value
pub(crate) fn require_non_empty(field: &str, value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(format!("`{field}` must not be empty"))
    } else {
        Ok(trimmed.to_string())
    }
}

/// Routes tool calls to the backend, or to canned responses
pub struct ToolDispatcher {
    tools: Vec<Arc<dyn Tool>>,
    backend: Option<Arc<dyn ToolBackend>>,
}

impl ToolDispatcher {
    /// Dispatcher for the standard scene tools
    pub fn new(backend: Option<Arc<dyn ToolBackend>>) -> Self {
        let tools: Vec<Arc<dyn Tool>> = vec![
            Arc::new(CreateRoomTool),
            Arc::new(AddObjectTool),
            Arc::new(RemoveObjectTool),
            Arc::new(ListRoomsTool),
        ];
        Self { tools, backend }
    }

    /// Dispatcher that only ever answers with canned responses
    pub fn offline() -> Self {
        Self::new(None)
    }

    /// Declarations sent to the model with every request
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.iter().map(|t| t.definition()).collect()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name).cloned()
    }

    /// Execute one tool call. `input` is `None` when the model's arguments
    /// could not be parsed; that is reported as invalid input.
    pub async fn execute(&self, name: &str, input: Option<&Value>) -> Result<String, ToolError> {
        let tool = self
            .get(name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        let input = input.ok_or_else(|| ToolError::InvalidInput {
            tool: name.to_string(),
            reason: "arguments were missing or not valid JSON".to_string(),
        })?;

        let command = tool.parse(input).map_err(|reason| ToolError::InvalidInput {
            tool: name.to_string(),
            reason,
        })?;

        match &self.backend {
            Some(backend) if backend.is_ready() => {
                backend
                    .execute(&command)
                    .await
                    .map_err(|e| ToolError::Backend {
                        tool: name.to_string(),
                        message: e.0,
                    })
            }
            _ => {
                tracing::warn!(tool = %name, "No ready backend, using canned response");
                Ok(tool.fallback(&command))
            }
        }
    }
}

//! LLM transport abstraction
//!
//! Defines the streaming interface the conversation loop talks to, the
//! block assembler that rebuilds messages from it, and the Anthropic
//! implementation.

mod anthropic;
pub mod assembler;
mod error;
mod registry;
pub mod stream;
mod types;

#[cfg(test)]
mod proptests;

pub use anthropic::AnthropicTransport;
pub use assembler::{AssembledMessage, BlockAssembler, PreviewBlock};
pub use error::{LlmError, LlmErrorKind};
pub use registry::{RegistryError, TransportKey, TransportRegistry};
pub use stream::{BlockKind, Delta, EventStream, StreamEvent};
pub use types::*;

use async_trait::async_trait;
use std::sync::Arc;

/// Common interface for streaming LLM providers
#[async_trait]
pub trait LlmTransport: Send + Sync {
    /// Open a streaming request. The returned stream yields events in
    /// server order and ends after `MessageStop` or on the first error.
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, LlmError>;

    /// Get the model ID
    fn model_id(&self) -> &str;
}

#[async_trait]
impl<T: LlmTransport + ?Sized> LlmTransport for Arc<T> {
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, LlmError> {
        (**self).stream(request).await
    }

    fn model_id(&self) -> &str {
        (**self).model_id()
    }
}

/// Logging wrapper for LLM transports
pub struct LoggingTransport {
    inner: Arc<dyn LlmTransport>,
    model_id: String,
}

impl LoggingTransport {
    pub fn new(inner: Arc<dyn LlmTransport>) -> Self {
        let model_id = inner.model_id().to_string();
        Self { inner, model_id }
    }
}

#[async_trait]
impl LlmTransport for LoggingTransport {
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, LlmError> {
        let start = std::time::Instant::now();
        let result = self.inner.stream(request).await;
        let duration = start.elapsed();

        match &result {
            Ok(_) => {
                tracing::info!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    messages = request.messages.len(),
                    tools = request.tools.len(),
                    "LLM stream opened"
                );
            }
            Err(e) => {
                tracing::error!(
                    model = %self.model_id,
                    duration_ms = %duration.as_millis(),
                    error = %e.message,
                    retryable = e.kind.is_retryable(),
                    "LLM request failed"
                );
            }
        }

        result
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

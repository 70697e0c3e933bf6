//! Roomwright - streaming conversation core for a tool-using room designer
//!
//! Reconstructs streamed model responses, dispatches the tool calls they
//! request, and loops until the model answers without tools.

pub mod config;
pub mod llm;
pub mod runtime;
pub mod state_machine;
pub mod system_prompt;
pub mod tools;

pub use config::{ClientConfig, ConfigError};
pub use runtime::{ConversationController, ExchangeError};

//! Runtime for conducting conversations
//!
//! The controller owns the session and history; observers and the context
//! provider are the seams a host plugs into.

mod executor;
pub mod traits;

#[cfg(test)]
pub mod testing;

pub use executor::{ControllerSettings, ConversationController, ExchangeError, TransportSource};
pub use traits::*;

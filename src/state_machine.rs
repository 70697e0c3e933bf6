//! Session state machine
//!
//! Pure transitions over the session status. The controller feeds events
//! in and executes the returned effects; nothing here performs I/O.

mod effect;
pub mod event;
pub mod state;
pub(crate) mod transition;

#[cfg(test)]
mod proptests;

pub use effect::Effect;
pub use event::SessionEvent;
pub use state::{PendingTool, SessionStatus};
pub use transition::{transition, TransitionError, TransitionResult};

//! Pure state transition function

use super::{Effect, SessionEvent, SessionStatus};
use thiserror::Error;

/// Result of a state transition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransitionResult {
    pub new_status: SessionStatus,
    pub effects: Vec<Effect>,
}

impl TransitionResult {
    pub fn new(status: SessionStatus) -> Self {
        Self {
            new_status: status,
            effects: vec![],
        }
    }

    #[must_use]
    pub fn with_effect(mut self, effect: Effect) -> Self {
        self.effects.push(effect);
        self
    }

    #[must_use]
    pub fn with_effects(mut self, effects: impl IntoIterator<Item = Effect>) -> Self {
        self.effects.extend(effects);
        self
    }
}

/// Errors that can occur during transition
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransitionError {
    #[error("An exchange is already in progress (status: {0})")]
    Busy(SessionStatus),
    #[error("Invalid transition: {event:?} while {status}")]
    InvalidTransition {
        status: SessionStatus,
        event: SessionEvent,
    },
}

/// Pure transition function
///
/// Given the same inputs it always produces the same outputs, with no I/O.
pub fn transition(
    status: SessionStatus,
    event: SessionEvent,
) -> Result<TransitionResult, TransitionError> {
    use SessionEvent as E;
    use SessionStatus as S;

    match (status, event) {
        (S::Idle, E::Begin) => Ok(enter(S::Thinking)),
        (busy, E::Begin) => Err(TransitionError::Busy(busy)),

        // The first turn streams after thinking; later turns after tools
        (S::Thinking | S::ToolUse, E::StartStreaming) => Ok(enter(S::Streaming)),

        (S::Streaming, E::ToolUseRequested) => {
            Ok(TransitionResult::new(S::ToolUse)
                .with_effects([Effect::ClearPreview, Effect::NotifyStatus(S::ToolUse)]))
        }

        (S::Streaming, E::Finish) => Ok(back_to_idle()),

        (S::Thinking | S::Streaming | S::ToolUse, E::Fail) => Ok(back_to_idle()),

        // Abort is idempotent; nothing to undo when already idle
        (S::Idle, E::Abort) => Ok(TransitionResult::new(S::Idle)),
        (S::Thinking | S::Streaming, E::Abort) => Ok(TransitionResult::new(S::Idle)
            .with_effects([
                Effect::CancelInFlight,
                Effect::ClearPreview,
                Effect::NotifyStatus(S::Idle),
            ])),
        (S::ToolUse, E::Abort) => Ok(TransitionResult::new(S::Idle).with_effects([
            Effect::CancelInFlight,
            Effect::RejectPendingTool,
            Effect::ClearPreview,
            Effect::NotifyStatus(S::Idle),
        ])),

        (status, event) => Err(TransitionError::InvalidTransition { status, event }),
    }
}

fn enter(status: SessionStatus) -> TransitionResult {
    TransitionResult::new(status).with_effect(Effect::NotifyStatus(status))
}

fn back_to_idle() -> TransitionResult {
    TransitionResult::new(SessionStatus::Idle)
        .with_effects([Effect::ClearPreview, Effect::NotifyStatus(SessionStatus::Idle)])
}

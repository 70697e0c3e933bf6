//! Effects produced by state transitions

use super::SessionStatus;

/// Effects to be executed by the controller after a transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    /// Tell observers about the new status
    NotifyStatus(SessionStatus),

    /// Drop live-preview state and publish an empty preview
    ClearPreview,

    /// Signal the in-flight stream or tool wait to stop
    CancelInFlight,

    /// Fail the tracked pending tool with a cancellation error
    RejectPendingTool,
}

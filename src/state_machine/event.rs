//! Events that drive session transitions

/// Inputs to [`super::transition`], all raised by the conversation controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// A new exchange was requested
    Begin,
    /// About to open a response stream
    StartStreaming,
    /// The finished response asked for tools
    ToolUseRequested,
    /// The exchange completed normally
    Finish,
    /// The exchange failed; the error goes back to the caller
    Fail,
    /// The caller cancelled. Valid from every status.
    Abort,
}

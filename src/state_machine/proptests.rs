//! Property-based tests for the session state machine

use super::*;
use proptest::prelude::*;

fn arb_status() -> impl Strategy<Value = SessionStatus> {
    prop_oneof![
        Just(SessionStatus::Idle),
        Just(SessionStatus::Thinking),
        Just(SessionStatus::Streaming),
        Just(SessionStatus::ToolUse),
    ]
}

fn arb_event() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        Just(SessionEvent::Begin),
        Just(SessionEvent::StartStreaming),
        Just(SessionEvent::ToolUseRequested),
        Just(SessionEvent::Finish),
        Just(SessionEvent::Fail),
        Just(SessionEvent::Abort),
    ]
}

proptest! {
    /// Abort succeeds from every status and always lands in idle
    #[test]
    fn abort_always_returns_to_idle(status in arb_status()) {
        let result = transition(status, SessionEvent::Abort).unwrap();
        prop_assert_eq!(result.new_status, SessionStatus::Idle);
        if status.is_busy() {
            prop_assert!(result.effects.contains(&Effect::CancelInFlight));
            prop_assert!(result.effects.contains(&Effect::ClearPreview));
        } else {
            prop_assert!(result.effects.is_empty());
        }
    }

    /// Repeated aborts are no-ops after the first
    #[test]
    fn abort_is_idempotent(status in arb_status()) {
        let first = transition(status, SessionEvent::Abort).unwrap();
        let second = transition(first.new_status, SessionEvent::Abort).unwrap();
        prop_assert_eq!(second, TransitionResult::new(SessionStatus::Idle));
    }

    /// Only an idle session accepts a new exchange
    #[test]
    fn begin_only_from_idle(status in arb_status()) {
        let result = transition(status, SessionEvent::Begin);
        prop_assert_eq!(result.is_ok(), status.is_idle());
    }

    /// Every status change is announced exactly once, with the new status
    #[test]
    fn status_changes_are_notified(status in arb_status(), event in arb_event()) {
        if let Ok(result) = transition(status, event) {
            let notified: Vec<_> = result
                .effects
                .iter()
                .filter_map(|e| match e {
                    Effect::NotifyStatus(s) => Some(*s),
                    _ => None,
                })
                .collect();
            if result.new_status == status {
                prop_assert!(notified.is_empty());
            } else {
                prop_assert_eq!(notified, vec![result.new_status]);
            }
        }
    }

    /// Pending tools are only rejected when aborting tool use
    #[test]
    fn reject_pending_only_from_tool_use(status in arb_status(), event in arb_event()) {
        if let Ok(result) = transition(status, event) {
            let rejects = result.effects.contains(&Effect::RejectPendingTool);
            prop_assert_eq!(
                rejects,
                status == SessionStatus::ToolUse && event == SessionEvent::Abort
            );
        }
    }

    /// Any walk of valid transitions followed by abort ends idle
    #[test]
    fn random_walk_then_abort(events in proptest::collection::vec(arb_event(), 0..24)) {
        let mut status = SessionStatus::Idle;
        for event in events {
            if let Ok(result) = transition(status, event) {
                status = result.new_status;
            }
        }
        let final_status = transition(status, SessionEvent::Abort).unwrap().new_status;
        prop_assert_eq!(final_status, SessionStatus::Idle);
    }
}

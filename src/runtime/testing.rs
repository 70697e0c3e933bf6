//! Mock implementations for testing
//!
//! These mocks drive the controller end to end without network I/O.

use super::*;
use crate::config::{ClientConfig, ConfigError};
use crate::llm::{
    ContentBlock, EventStream, LlmError, LlmErrorKind, LlmRequest, LlmTransport, Message,
    MessageRole, StreamEvent, TransportRegistry,
};
use crate::state_machine::SessionStatus;
use crate::tools::{BackendError, SceneBackend, SceneCommand, ToolBackend, ToolDispatcher};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use tokio::sync::Notify;

// ============================================================================
// Mock Transports
// ============================================================================

type Script = Result<Vec<Result<StreamEvent, LlmError>>, LlmError>;

/// Transport that replays queued event sequences, one per request
pub struct ScriptedTransport {
    scripts: Mutex<VecDeque<Script>>,
    requests: Mutex<Vec<LlmRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        })
    }

    /// Queue a response that streams `events` in order
    pub fn queue_events(&self, events: Vec<StreamEvent>) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Ok(events.into_iter().map(Ok).collect()));
    }

    /// Queue a response whose stream yields `events` then fails
    pub fn queue_failing_stream(&self, events: Vec<StreamEvent>, error: LlmError) {
        let mut items: Vec<_> = events.into_iter().map(Ok).collect();
        items.push(Err(error));
        self.scripts.lock().unwrap().push_back(Ok(items));
    }

    /// Queue a request that fails before any event
    pub fn queue_error(&self, error: LlmError) {
        self.scripts.lock().unwrap().push_back(Err(error));
    }

    pub fn recorded_requests(&self) -> Vec<LlmRequest> {
        self.requests.lock().unwrap().clone()
    }
}

#[async_trait]
impl LlmTransport for ScriptedTransport {
    async fn stream(&self, request: &LlmRequest) -> Result<EventStream, LlmError> {
        self.requests.lock().unwrap().push(request.clone());
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(LlmError::network("No scripted response queued")))?;
        Ok(Box::pin(futures::stream::iter(script)))
    }

    fn model_id(&self) -> &str {
        "scripted"
    }
}

/// Transport that streams a prefix of events and then stalls until the
/// exchange is cancelled
pub struct DelayedTransport {
    prefix: Vec<StreamEvent>,
    /// Signaled each time a stream is opened
    pub started: Notify,
    requests: AtomicUsize,
}

impl DelayedTransport {
    pub fn new(prefix: Vec<StreamEvent>) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            started: Notify::new(),
            requests: AtomicUsize::new(0),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmTransport for DelayedTransport {
    async fn stream(&self, _request: &LlmRequest) -> Result<EventStream, LlmError> {
        use futures::StreamExt;

        self.requests.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        let prefix: Vec<Result<StreamEvent, LlmError>> =
            self.prefix.iter().cloned().map(Ok).collect();
        Ok(Box::pin(
            futures::stream::iter(prefix).chain(futures::stream::pending()),
        ))
    }

    fn model_id(&self) -> &str {
        "delayed"
    }
}

// ============================================================================
// Mock Observer
// ============================================================================

/// Observer that records every notification
#[derive(Default)]
pub struct RecordingObserver {
    events: Mutex<Vec<ConversationEvent>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<ConversationEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn appended(&self) -> Vec<Message> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::MessageAppended(m) => Some(m),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<SessionStatus> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                ConversationEvent::StatusChanged(s) => Some(s),
                _ => None,
            })
            .collect()
    }
}

impl ConversationObserver for RecordingObserver {
    fn on_message_appended(&self, message: &Message) {
        self.events
            .lock()
            .unwrap()
            .push(ConversationEvent::MessageAppended(message.clone()));
    }

    fn on_live_preview(&self, preview: Option<&[crate::llm::PreviewBlock]>) {
        self.events
            .lock()
            .unwrap()
            .push(ConversationEvent::Preview(preview.map(<[_]>::to_vec)));
    }

    fn on_status_change(&self, status: SessionStatus) {
        self.events
            .lock()
            .unwrap()
            .push(ConversationEvent::StatusChanged(status));
    }
}

/// What makes an [`AbortingObserver`] pull the plug
#[derive(Debug, Clone, Copy)]
pub enum AbortTrigger {
    Status(SessionStatus),
    Preview,
}

/// Observer that aborts its controller from inside the first matching
/// callback
pub struct AbortingObserver {
    controller: OnceLock<Weak<ConversationController>>,
    trigger: AbortTrigger,
    fired: AtomicBool,
}

impl AbortingObserver {
    pub fn attach(controller: &Arc<ConversationController>, trigger: AbortTrigger) -> Arc<Self> {
        let observer = Arc::new(Self {
            controller: OnceLock::new(),
            trigger,
            fired: AtomicBool::new(false),
        });
        let _ = observer.controller.set(Arc::downgrade(controller));
        controller.subscribe(observer.clone());
        observer
    }

    pub fn fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    fn fire(&self) {
        if self.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
            controller.abort();
        }
    }
}

impl ConversationObserver for AbortingObserver {
    fn on_live_preview(&self, preview: Option<&[crate::llm::PreviewBlock]>) {
        if matches!(self.trigger, AbortTrigger::Preview) && preview.is_some() {
            self.fire();
        }
    }

    fn on_status_change(&self, status: SessionStatus) {
        if matches!(self.trigger, AbortTrigger::Status(s) if s == status) {
            self.fire();
        }
    }
}

// ============================================================================
// Mock Backends
// ============================================================================

/// Backend that records commands and fails for chosen tools
#[derive(Default)]
pub struct MockBackend {
    failing: Vec<&'static str>,
    calls: Mutex<Vec<SceneCommand>>,
}

impl MockBackend {
    pub fn failing_on(tools: &[&'static str]) -> Arc<Self> {
        Arc::new(Self {
            failing: tools.to_vec(),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn recorded_calls(&self) -> Vec<SceneCommand> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ToolBackend for MockBackend {
    fn is_ready(&self) -> bool {
        true
    }

    async fn execute(&self, command: &SceneCommand) -> Result<String, BackendError> {
        self.calls.lock().unwrap().push(command.clone());
        let name = command.tool_name();
        if self.failing.contains(&name) {
            Err(BackendError::new(format!("{name} exploded")))
        } else {
            Ok(format!("{name} ok"))
        }
    }
}

/// Backend whose calls block until released
#[derive(Default)]
pub struct BlockingBackend {
    pub entered: Notify,
    pub release: Notify,
}

#[async_trait]
impl ToolBackend for BlockingBackend {
    fn is_ready(&self) -> bool {
        true
    }

    async fn execute(&self, _command: &SceneCommand) -> Result<String, BackendError> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok("finished late".to_string())
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn text_response(text: &str) -> Vec<StreamEvent> {
    vec![
        StreamEvent::text_start(0),
        StreamEvent::text_delta(0, text),
        StreamEvent::stop_reason("end_turn"),
        StreamEvent::MessageStop,
    ]
}

/// Text block at index 0 followed by one tool block per `(id, name, json)`
pub fn tool_response(text: &str, tools: &[(&str, &str, &str)]) -> Vec<StreamEvent> {
    let mut events = vec![StreamEvent::text_start(0), StreamEvent::text_delta(0, text)];
    for (i, (id, name, json)) in tools.iter().enumerate() {
        let index = i + 1;
        events.push(StreamEvent::tool_start(index, *id, *name));
        // Split the arguments to exercise buffering
        let mid = json.len() / 2;
        let (head, tail) = json.split_at(if json.is_char_boundary(mid) { mid } else { 0 });
        events.push(StreamEvent::json_delta(index, head));
        events.push(StreamEvent::json_delta(index, tail));
    }
    events.push(StreamEvent::stop_reason("tool_use"));
    events.push(StreamEvent::MessageStop);
    events
}

pub fn controller_with(
    transport: Arc<dyn LlmTransport>,
    backend: Option<Arc<dyn ToolBackend>>,
) -> Arc<ConversationController> {
    controller_with_settings(transport, backend, ControllerSettings::default())
}

pub fn controller_with_settings(
    transport: Arc<dyn LlmTransport>,
    backend: Option<Arc<dyn ToolBackend>>,
    settings: ControllerSettings,
) -> Arc<ConversationController> {
    Arc::new(ConversationController::new(
        TransportSource::Fixed(transport),
        Arc::new(ToolDispatcher::new(backend)),
        Arc::new(|| "You are a test assistant.".to_string()),
        settings,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn tool_result_blocks(message: &Message) -> Vec<(String, String, bool)> {
        message
            .content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => Some((tool_use_id.clone(), content.clone(), *is_error)),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_tool_round_trip_returns_three_messages() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response(
            "Sure!",
            &[("toolu_1", "create_room", r#"{"name":"Library"}"#)],
        ));
        transport.queue_events(text_response("Done."));

        let backend = Arc::new(SceneBackend::new());
        let controller = controller_with(transport.clone(), Some(backend.clone()));
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        let messages = controller
            .send_message("create a room called Library")
            .await
            .unwrap();

        assert_eq!(messages.len(), 3);

        assert_eq!(messages[0].role, MessageRole::Assistant);
        assert_eq!(
            messages[0].content,
            vec![
                ContentBlock::text("Sure!"),
                ContentBlock::tool_use("toolu_1", "create_room", Some(json!({"name": "Library"}))),
            ]
        );

        assert_eq!(messages[1].role, MessageRole::User);
        assert_eq!(
            tool_result_blocks(&messages[1]),
            vec![(
                "toolu_1".to_string(),
                "Successfully created room \"Library\".".to_string(),
                false
            )]
        );

        assert_eq!(messages[2].role, MessageRole::Assistant);
        assert_eq!(messages[2].text(), "Done.");

        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(backend.room_names(), vec!["Library"]);

        // History holds the prompt plus everything returned
        let history = controller.history();
        assert_eq!(history.len(), 4);
        assert_eq!(history[0], Message::user_text("create a room called Library"));
        assert_eq!(&history[1..], &messages[..]);

        // Second request carries the tool result back
        let requests = transport.recorded_requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].messages.len(), 3);
        assert_eq!(requests[1].messages[2], messages[1]);
        assert_eq!(requests[0].system_prompt, "You are a test assistant.");
        assert_eq!(requests[0].tools.len(), 4);

        assert_eq!(observer.appended(), messages);
        assert_eq!(
            observer.statuses(),
            vec![
                SessionStatus::Thinking,
                SessionStatus::Streaming,
                SessionStatus::ToolUse,
                SessionStatus::Streaming,
                SessionStatus::Idle,
            ]
        );
    }

    #[tokio::test]
    async fn test_transport_error_mid_stream_resets_to_idle() {
        let transport = ScriptedTransport::new();
        transport.queue_failing_stream(
            vec![StreamEvent::text_start(0), StreamEvent::text_delta(0, "Par")],
            LlmError::network("connection reset"),
        );

        let controller = controller_with(transport.clone(), None);
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        let err = controller.send_message("hello").await.unwrap_err();

        match err {
            ExchangeError::Transport(e) => assert_eq!(e.kind, LlmErrorKind::Network),
            other => panic!("expected transport error, got {other:?}"),
        }
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert!(controller.history().is_empty());
        assert!(observer.appended().is_empty());

        // Preview was cleared on the way out
        assert_eq!(
            observer.events().last(),
            Some(&ConversationEvent::StatusChanged(SessionStatus::Idle))
        );
        assert!(observer
            .events()
            .contains(&ConversationEvent::Preview(None)));
    }

    #[tokio::test]
    async fn test_transport_error_before_stream() {
        let transport = ScriptedTransport::new();
        transport.queue_error(LlmError::auth("bad key"));
        let controller = controller_with(transport, None);

        let err = controller.send_message("hello").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(ref e) if e.kind == LlmErrorKind::Auth));
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert!(controller.history().is_empty());
    }

    #[tokio::test]
    async fn test_in_band_error_event() {
        let transport = ScriptedTransport::new();
        transport.queue_events(vec![
            StreamEvent::text_start(0),
            StreamEvent::Error {
                message: "overloaded_error: Overloaded".to_string(),
            },
        ]);
        let controller = controller_with(transport, None);

        let err = controller.send_message("hello").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Transport(ref e) if e.kind == LlmErrorKind::Stream));
        assert_eq!(controller.status(), SessionStatus::Idle);
    }

    #[tokio::test]
    async fn test_abort_while_streaming() {
        let transport = DelayedTransport::new(vec![
            StreamEvent::text_start(0),
            StreamEvent::text_delta(0, "Thinking about"),
        ]);
        let controller = controller_with(transport.clone(), None);
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_message("hello").await })
        };

        transport.started.notified().await;
        assert_eq!(controller.status(), SessionStatus::Streaming);

        controller.abort();
        assert_eq!(controller.status(), SessionStatus::Idle);

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert!(controller.history().is_empty());
        assert!(observer.appended().is_empty());
        assert_eq!(observer.statuses().last(), Some(&SessionStatus::Idle));
    }

    #[tokio::test]
    async fn test_abort_is_idempotent() {
        let controller = controller_with(ScriptedTransport::new(), None);
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        controller.abort();
        controller.abort();

        assert_eq!(controller.status(), SessionStatus::Idle);
        assert!(observer.events().is_empty());
    }

    #[tokio::test]
    async fn test_reentrant_call_rejected_before_network() {
        let transport = DelayedTransport::new(vec![]);
        let controller = controller_with(transport.clone(), None);

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_message("first").await })
        };
        transport.started.notified().await;

        let err = controller.send_message("second").await.unwrap_err();
        assert!(matches!(err, ExchangeError::Busy));
        assert_eq!(transport.request_count(), 1);
        assert!(matches!(controller.clear_history(), Err(ExchangeError::Busy)));

        controller.abort();
        assert!(task.await.unwrap().unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_tools_run_in_block_order_with_errors() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response(
            "Working on it.",
            &[
                ("t1", "create_room", r#"{"name":"Den"}"#),
                ("t2", "add_object", r#"{"room":"Den","#),
                ("t3", "paint_walls", r#"{"color":"red"}"#),
                ("t4", "add_object", r#"{"room":"Den","kind":"sofa"}"#),
                ("t5", "list_rooms", "{}"),
            ],
        ));
        transport.queue_events(text_response("All set."));

        let backend = MockBackend::failing_on(&["list_rooms"]);
        let controller = controller_with(transport, Some(backend.clone()));

        let messages = controller.send_message("furnish the den").await.unwrap();
        assert_eq!(messages.len(), 3);

        let results = tool_result_blocks(&messages[1]);
        let ids: Vec<_> = results.iter().map(|(id, _, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["t1", "t2", "t3", "t4", "t5"]);

        let errors: Vec<_> = results.iter().map(|(_, _, is_error)| *is_error).collect();
        assert_eq!(errors, vec![false, true, true, false, true]);
        assert!(results[2].1.contains("Unknown tool: paint_walls"));
        assert_eq!(results[4].1, "list_rooms failed: list_rooms exploded");

        // Malformed and unknown calls never reach the backend
        let called: Vec<_> = backend
            .recorded_calls()
            .iter()
            .map(SceneCommand::tool_name)
            .collect();
        assert_eq!(called, vec!["create_room", "add_object", "list_rooms"]);
    }

    #[tokio::test]
    async fn test_offline_dispatcher_uses_canned_results() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response(
            "",
            &[("t1", "create_room", r#"{"name":"Library"}"#)],
        ));
        transport.queue_events(text_response("Noted."));

        let controller = controller_with(transport, None);
        let messages = controller.send_message("make a library").await.unwrap();

        let results = tool_result_blocks(&messages[1]);
        assert_eq!(results.len(), 1);
        assert!(!results[0].2);
        assert!(results[0].1.contains("Library"));
    }

    #[tokio::test]
    async fn test_empty_response_ends_exchange() {
        let transport = ScriptedTransport::new();
        transport.queue_events(vec![
            StreamEvent::stop_reason("end_turn"),
            StreamEvent::MessageStop,
        ]);
        let controller = controller_with(transport.clone(), None);

        let messages = controller.send_message("hello").await.unwrap();
        assert!(messages.is_empty());
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(transport.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_tool_use_stop_without_blocks_ends_exchange() {
        let transport = ScriptedTransport::new();
        transport.queue_events(vec![
            StreamEvent::text_start(0),
            StreamEvent::text_delta(0, "Let me"),
            StreamEvent::stop_reason("tool_use"),
            StreamEvent::MessageStop,
        ]);
        let controller = controller_with(transport.clone(), None);

        let messages = controller.send_message("hello").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(transport.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_turn_limit() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response("", &[("t1", "list_rooms", "{}")]));
        transport.queue_events(text_response("never sent"));

        let settings = ControllerSettings {
            max_turns: NonZeroUsize::new(1),
            ..ControllerSettings::default()
        };
        let controller = controller_with_settings(
            transport.clone(),
            Some(Arc::new(SceneBackend::new())),
            settings,
        );

        let err = controller.send_message("loop").await.unwrap_err();
        assert!(matches!(err, ExchangeError::TurnLimit { limit: 1 }));
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(transport.recorded_requests().len(), 1);
    }

    #[tokio::test]
    async fn test_abort_during_tool_discards_result() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response(
            "On it.",
            &[("t1", "create_room", r#"{"name":"Attic"}"#)],
        ));
        transport.queue_events(text_response("Okay."));

        let backend = Arc::new(BlockingBackend::default());
        let controller = controller_with(transport.clone(), Some(backend.clone()));
        let observer = RecordingObserver::new();
        controller.subscribe(observer.clone());

        let task = {
            let controller = controller.clone();
            tokio::spawn(async move { controller.send_message("add an attic").await })
        };

        backend.entered.notified().await;
        assert_eq!(controller.status(), SessionStatus::ToolUse);
        controller.abort();

        assert!(task.await.unwrap().unwrap_err().is_cancelled());
        backend.release.notify_one();

        // The tool-use turn was committed; no result was
        assert_eq!(observer.appended().len(), 1);
        assert_eq!(controller.history().len(), 2);

        // The next exchange answers the orphaned tool call first
        controller.send_message("never mind").await.unwrap();
        let requests = transport.recorded_requests();
        let prompt = requests[1].messages.last().unwrap();
        assert_eq!(prompt.role, MessageRole::User);
        assert_eq!(
            tool_result_blocks(prompt),
            vec![(
                "t1".to_string(),
                "Tool call was cancelled before it completed.".to_string(),
                true
            )]
        );
        assert_eq!(prompt.text(), "never mind");
    }

    #[tokio::test]
    async fn test_missing_api_key_is_configuration_error() {
        let created = Arc::new(AtomicUsize::new(0));
        let counter = created.clone();
        let registry = Arc::new(TransportRegistry::with_factory(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(ScriptedTransport::new() as Arc<dyn LlmTransport>)
        }));

        let controller = ConversationController::from_config(
            registry,
            ClientConfig::default(),
            Arc::new(ToolDispatcher::offline()),
            Arc::new(String::new),
        );

        let err = controller.send_message("hello").await.unwrap_err();
        assert!(matches!(
            err,
            ExchangeError::Configuration(ConfigError::MissingApiKey)
        ));
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(created.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_context_provider_called_per_request() {
        let transport = ScriptedTransport::new();
        transport.queue_events(tool_response("", &[("t1", "list_rooms", "{}")]));
        transport.queue_events(text_response("Nothing here."));

        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let controller = ConversationController::new(
            TransportSource::Fixed(transport.clone()),
            Arc::new(ToolDispatcher::new(Some(Arc::new(SceneBackend::new())))),
            Arc::new(move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                format!("prompt #{n}")
            }),
            ControllerSettings::default(),
        );

        controller.send_message("what rooms exist?").await.unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);
        let prompts: Vec<_> = transport
            .recorded_requests()
            .into_iter()
            .map(|r| r.system_prompt)
            .collect();
        assert_eq!(prompts, vec!["prompt #1", "prompt #2"]);
    }

    #[tokio::test]
    async fn test_unsubscribed_observer_is_silent() {
        let transport = ScriptedTransport::new();
        transport.queue_events(text_response("hi"));
        transport.queue_events(text_response("again"));
        let controller = controller_with(transport, None);

        let observer = RecordingObserver::new();
        let id = controller.subscribe(observer.clone());
        controller.send_message("one").await.unwrap();
        let seen = observer.events().len();
        assert!(seen > 0);

        assert!(controller.unsubscribe(id));
        controller.send_message("two").await.unwrap();
        assert_eq!(observer.events().len(), seen);
    }

    #[tokio::test]
    async fn test_history_accumulates_across_exchanges() {
        let transport = ScriptedTransport::new();
        transport.queue_events(text_response("first"));
        transport.queue_events(text_response("second"));
        let controller = controller_with(transport.clone(), None);

        controller.send_message("one").await.unwrap();
        controller.send_message("two").await.unwrap();

        assert_eq!(controller.history().len(), 4);
        assert_eq!(transport.recorded_requests()[1].messages.len(), 3);

        controller.clear_history().unwrap();
        assert!(controller.history().is_empty());
    }

    #[tokio::test]
    async fn test_broadcast_observer_receives_exchange() {
        let transport = ScriptedTransport::new();
        transport.queue_events(text_response("hello there"));
        let controller = controller_with(transport, None);

        let broadcast = Arc::new(BroadcastObserver::new(64));
        let mut rx = broadcast.subscribe();
        controller.subscribe(broadcast);

        let messages = controller.send_message("hi").await.unwrap();

        let mut appended = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ConversationEvent::MessageAppended(m) = event {
                appended.push(m);
            }
        }
        assert_eq!(appended, messages);
    }

    #[tokio::test]
    async fn test_abort_from_status_callback_is_last_word() {
        let transport = ScriptedTransport::new();
        transport.queue_events(text_response("hello"));
        let controller = controller_with(transport.clone(), None);

        let aborter =
            AbortingObserver::attach(&controller, AbortTrigger::Status(SessionStatus::Thinking));
        let recorder = RecordingObserver::new();
        controller.subscribe(recorder.clone());

        let err = controller.send_message("hi").await.unwrap_err();
        assert!(aborter.fired());
        assert!(err.is_cancelled());
        assert_eq!(controller.status(), SessionStatus::Idle);
        assert_eq!(
            recorder.statuses(),
            vec![SessionStatus::Thinking, SessionStatus::Idle]
        );
        assert!(transport.recorded_requests().is_empty());

        // The session is usable afterwards
        let messages = controller.send_message("hi again").await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(recorder.statuses().last(), Some(&SessionStatus::Idle));
    }

    #[tokio::test]
    async fn test_abort_from_preview_callback_clears_preview_last() {
        let transport = DelayedTransport::new(vec![
            StreamEvent::text_start(0),
            StreamEvent::text_delta(0, "Hel"),
            StreamEvent::text_delta(0, "lo"),
        ]);
        let controller = controller_with(transport, None);

        let aborter = AbortingObserver::attach(&controller, AbortTrigger::Preview);
        let recorder = RecordingObserver::new();
        controller.subscribe(recorder.clone());

        let err = controller.send_message("hi").await.unwrap_err();
        assert!(aborter.fired());
        assert!(err.is_cancelled());

        let previews: Vec<_> = recorder
            .events()
            .into_iter()
            .filter(|e| matches!(e, ConversationEvent::Preview(_)))
            .collect();
        assert_eq!(previews.last(), Some(&ConversationEvent::Preview(None)));
        assert_eq!(
            previews
                .iter()
                .filter(|e| matches!(e, ConversationEvent::Preview(Some(_))))
                .count(),
            1
        );
        assert_eq!(recorder.statuses().last(), Some(&SessionStatus::Idle));
    }
}

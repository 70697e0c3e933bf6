//! Conversation loop controller
//!
//! Drives one exchange at a time: stream a response, run any requested
//! tools in block order, feed the results back, and repeat until the model
//! stops asking for tools.

use super::traits::{ContextProvider, ConversationObserver, ObserverSet, SubscriptionId};
use crate::config::{ClientConfig, ConfigError};
use crate::llm::{
    AssembledMessage, BlockAssembler, ContentBlock, LlmError, LlmRequest, LlmTransport, Message,
    MessageRole, PreviewBlock, RegistryError, StopReason, ToolUse, TransportRegistry,
};
use crate::state_machine::{
    transition, Effect, PendingTool, SessionEvent, SessionStatus, TransitionError,
};
use crate::tools::{ToolDispatcher, ToolError};
use futures::StreamExt;
use std::collections::VecDeque;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Errors returned to the caller of an exchange
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("An exchange is already in progress")]
    Busy,
    #[error("Transport error: {0}")]
    Transport(#[from] LlmError),
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Exchange exceeded the limit of {limit} model turns")]
    TurnLimit { limit: usize },
    #[error("Session state error: {0}")]
    State(#[from] TransitionError),
}

impl ExchangeError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ExchangeError::Transport(e) if e.is_cancelled())
    }
}

impl From<RegistryError> for ExchangeError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::Config(e) => ExchangeError::Configuration(e),
            RegistryError::Transport(e) => ExchangeError::Transport(e),
        }
    }
}

/// Request parameters applied to every turn
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    pub model: String,
    pub max_output_tokens: u32,
    pub temperature: f32,
    /// Cap on model turns per exchange; `None` means unbounded
    pub max_turns: Option<NonZeroUsize>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self::from_config(&ClientConfig::default())
    }
}

impl ControllerSettings {
    pub fn from_config(config: &ClientConfig) -> Self {
        Self {
            model: config.model.clone(),
            max_output_tokens: config.max_output_tokens,
            temperature: config.temperature,
            max_turns: config.max_turns,
        }
    }
}

/// Where each exchange gets its transport from
#[derive(Clone)]
pub enum TransportSource {
    /// Always the same transport
    Fixed(Arc<dyn LlmTransport>),
    /// Resolved through the memoized registry when an exchange starts, so a
    /// changed credential takes effect on the next exchange
    Registry {
        registry: Arc<TransportRegistry>,
        config: ClientConfig,
    },
}

impl TransportSource {
    fn resolve(&self) -> Result<Arc<dyn LlmTransport>, ExchangeError> {
        match self {
            TransportSource::Fixed(transport) => Ok(transport.clone()),
            TransportSource::Registry { registry, config } => Ok(registry.for_config(config)?),
        }
    }
}

/// Mutable session state, guarded by one lock that is never held across
/// an await
struct Session {
    status: SessionStatus,
    /// Incremented per exchange; stale exchanges compare against it
    epoch: u64,
    cancel: Option<CancellationToken>,
    pending_tool: Option<PendingTool>,
    history: Vec<Message>,
    source: TransportSource,
    settings: ControllerSettings,
}

/// Per-exchange snapshot, owned by the running exchange
struct Exchange {
    epoch: u64,
    cancel: CancellationToken,
    transport: Arc<dyn LlmTransport>,
    settings: ControllerSettings,
}

/// Notification for observers. Queued while the session lock is held so
/// queue order matches the order of state changes.
enum Notice {
    Status(SessionStatus),
    Preview(Option<Vec<PreviewBlock>>),
    Appended(Message),
}

/// Notices waiting for delivery. One caller at a time drains the queue;
/// notices queued meanwhile, including from observer callbacks, are
/// delivered by that caller after the ones before them.
#[derive(Default)]
struct Outbox {
    queue: VecDeque<Notice>,
    draining: bool,
}

/// Releases the drain role when an observer panics mid-delivery
struct DrainGuard<'a>(&'a Mutex<Outbox>);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .draining = false;
        }
    }
}

/// Runs conversation exchanges for a single session
pub struct ConversationController {
    dispatcher: Arc<ToolDispatcher>,
    context: Arc<dyn ContextProvider>,
    session: Mutex<Session>,
    observers: Mutex<ObserverSet>,
    outbox: Mutex<Outbox>,
}

impl ConversationController {
    pub fn new(
        source: TransportSource,
        dispatcher: Arc<ToolDispatcher>,
        context: Arc<dyn ContextProvider>,
        settings: ControllerSettings,
    ) -> Self {
        Self {
            dispatcher,
            context,
            session: Mutex::new(Session {
                status: SessionStatus::Idle,
                epoch: 0,
                cancel: None,
                pending_tool: None,
                history: Vec::new(),
                source,
                settings,
            }),
            observers: Mutex::new(ObserverSet::default()),
            outbox: Mutex::new(Outbox::default()),
        }
    }

    /// Controller resolving its transport from `config` through `registry`
    pub fn from_config(
        registry: Arc<TransportRegistry>,
        config: ClientConfig,
        dispatcher: Arc<ToolDispatcher>,
        context: Arc<dyn ContextProvider>,
    ) -> Self {
        let settings = ControllerSettings::from_config(&config);
        Self::new(
            TransportSource::Registry { registry, config },
            dispatcher,
            context,
            settings,
        )
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_session().status
    }

    /// Committed conversation history
    pub fn history(&self) -> Vec<Message> {
        self.lock_session().history.clone()
    }

    pub fn clear_history(&self) -> Result<(), ExchangeError> {
        let mut session = self.lock_session();
        if session.status.is_busy() {
            return Err(ExchangeError::Busy);
        }
        session.history.clear();
        Ok(())
    }

    /// Replace settings and, for registry-backed controllers, the transport
    /// configuration. Takes effect on the next exchange.
    pub fn update_config(&self, config: ClientConfig) -> Result<(), ExchangeError> {
        let mut session = self.lock_session();
        if session.status.is_busy() {
            return Err(ExchangeError::Busy);
        }
        session.settings = ControllerSettings::from_config(&config);
        if let TransportSource::Registry { config: current, .. } = &mut session.source {
            *current = config;
        }
        Ok(())
    }

    pub fn subscribe(&self, observer: Arc<dyn ConversationObserver>) -> SubscriptionId {
        self.lock_observers().subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.lock_observers().unsubscribe(id)
    }

    /// Cancel the in-flight exchange, if any. Safe to call from any state
    /// and any number of times, including from an observer callback. The
    /// session is idle on return; observers hear about it in order, after
    /// any notice queued before the abort.
    pub fn abort(&self) {
        let mut session = self.lock_session();
        let notices = match transition(session.status, SessionEvent::Abort) {
            Ok(result) => {
                if session.status.is_busy() {
                    tracing::info!(status = %session.status, epoch = session.epoch, "Aborting exchange");
                }
                apply(&mut session, result.new_status, &result.effects)
            }
            Err(e) => {
                // Abort is valid from every status
                tracing::error!(error = %e, "Abort rejected by state machine");
                Vec::new()
            }
        };
        self.publish(session, notices);
    }

    /// Run one exchange for `text` and return every message it appended
    /// after the user prompt, in order.
    pub async fn send_message(
        &self,
        text: impl Into<String>,
    ) -> Result<Vec<Message>, ExchangeError> {
        let text = text.into();

        let (exchange, history, user) = {
            let mut session = self.lock_session();
            let result = transition(session.status, SessionEvent::Begin).map_err(|e| match e {
                TransitionError::Busy(_) => ExchangeError::Busy,
                other => ExchangeError::State(other),
            })?;

            let mut content = unanswered_tool_results(&session.history);
            if !content.is_empty() {
                tracing::info!(count = content.len(), "Answering tool calls left by an aborted exchange");
            }
            content.push(ContentBlock::text(text));
            let user = Message {
                role: MessageRole::User,
                content,
            };

            session.epoch += 1;
            let cancel = CancellationToken::new();
            session.cancel = Some(cancel.clone());
            let notices = apply(&mut session, result.new_status, &result.effects);

            let source = session.source.clone();
            let exchange = (session.epoch, cancel, session.settings.clone(), source);
            let history = session.history.clone();
            self.publish(session, notices);
            (exchange, history, user)
        };

        let (epoch, cancel, settings, source) = exchange;
        tracing::info!(epoch, model = %settings.model, "Exchange started");

        let transport = match source.resolve() {
            Ok(transport) => transport,
            Err(e) => {
                self.fail(epoch, &cancel);
                return Err(e);
            }
        };

        let exchange = Exchange {
            epoch,
            cancel,
            transport,
            settings,
        };

        match self.run_turns(&exchange, history, user).await {
            Ok(appended) => {
                tracing::info!(epoch, messages = appended.len(), "Exchange completed");
                Ok(appended)
            }
            Err(e) => {
                if e.is_cancelled() {
                    tracing::info!(epoch, "Exchange cancelled");
                } else {
                    tracing::warn!(epoch, error = %e, "Exchange failed");
                }
                self.fail(exchange.epoch, &exchange.cancel);
                Err(e)
            }
        }
    }

    async fn run_turns(
        &self,
        exchange: &Exchange,
        mut conversation: Vec<Message>,
        user: Message,
    ) -> Result<Vec<Message>, ExchangeError> {
        let tools = self.dispatcher.definitions();
        conversation.push(user.clone());
        // Committed together with the first assistant message
        let mut uncommitted_user = Some(user);
        let mut appended = Vec::new();
        let mut turns = 0usize;

        loop {
            if let Some(limit) = exchange.settings.max_turns {
                if turns >= limit.get() {
                    return Err(ExchangeError::TurnLimit { limit: limit.get() });
                }
            }
            turns += 1;

            self.advance(exchange, SessionEvent::StartStreaming)?;
            let request = LlmRequest {
                model: exchange.settings.model.clone(),
                max_output_tokens: exchange.settings.max_output_tokens,
                temperature: exchange.settings.temperature,
                system_prompt: self.context.system_prompt(),
                messages: conversation.clone(),
                tools: tools.clone(),
            };

            let assembled = self.stream_turn(exchange, &request).await?;
            if assembled.content.is_empty() {
                tracing::warn!(epoch = exchange.epoch, turn = turns, "Empty response, ending exchange");
                self.advance(exchange, SessionEvent::Finish)?;
                return Ok(appended);
            }

            let AssembledMessage {
                content,
                stop_reason,
            } = assembled;
            let message = Message::assistant(content);
            self.commit(exchange, uncommitted_user.take(), message.clone())?;
            conversation.push(message.clone());
            appended.push(message.clone());

            let tool_uses = message.tool_uses();
            if stop_reason != Some(StopReason::ToolUse) {
                self.advance(exchange, SessionEvent::Finish)?;
                return Ok(appended);
            }
            if tool_uses.is_empty() {
                tracing::warn!(epoch = exchange.epoch, "tool_use stop reason without tool_use blocks");
                self.advance(exchange, SessionEvent::Finish)?;
                return Ok(appended);
            }

            self.advance(exchange, SessionEvent::ToolUseRequested)?;
            let results = self.run_tools(exchange, &tool_uses).await?;
            let results = Message::tool_results(results);
            self.commit(exchange, None, results.clone())?;
            conversation.push(results.clone());
            appended.push(results);
        }
    }

    /// Stream one response into a fresh assembler
    async fn stream_turn(
        &self,
        exchange: &Exchange,
        request: &LlmRequest,
    ) -> Result<AssembledMessage, ExchangeError> {
        let mut events = tokio::select! {
            biased;
            () = exchange.cancel.cancelled() => return Err(LlmError::cancelled().into()),
            result = exchange.transport.stream(request) => result?,
        };

        let mut assembler = BlockAssembler::new();
        loop {
            let next = tokio::select! {
                biased;
                () = exchange.cancel.cancelled() => return Err(LlmError::cancelled().into()),
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    assembler.on_event(event)?;
                    if assembler.is_finalized() {
                        break;
                    }
                    self.publish_preview(exchange, &assembler);
                }
                Some(Err(e)) => return Err(e.into()),
                None => break,
            }
        }

        Ok(assembler.finalize())
    }

    /// Execute tool calls sequentially in block order. Tool failures become
    /// error results; only cancellation ends the turn.
    async fn run_tools(
        &self,
        exchange: &Exchange,
        tool_uses: &[ToolUse<'_>],
    ) -> Result<Vec<ContentBlock>, ExchangeError> {
        let mut results = Vec::with_capacity(tool_uses.len());

        for tool_use in tool_uses {
            self.set_pending(
                exchange,
                Some(PendingTool {
                    tool_use_id: tool_use.id.to_string(),
                    name: tool_use.name.to_string(),
                }),
            )?;

            let started = std::time::Instant::now();
            match self.run_tool(exchange, tool_use).await {
                Ok(output) => {
                    tracing::info!(
                        tool = %tool_use.name,
                        id = %tool_use.id,
                        duration_ms = %started.elapsed().as_millis(),
                        "Tool completed"
                    );
                    results.push(ContentBlock::tool_result(tool_use.id, output, false));
                }
                Err(ToolError::Cancelled) => return Err(LlmError::cancelled().into()),
                Err(e) => {
                    tracing::warn!(tool = %tool_use.name, id = %tool_use.id, error = %e, "Tool failed");
                    results.push(ContentBlock::tool_result(tool_use.id, e.to_string(), true));
                }
            }

            self.set_pending(exchange, None)?;
        }

        Ok(results)
    }

    /// Run one tool on its own task. Cancellation stops the wait, not the
    /// tool itself.
    async fn run_tool(&self, exchange: &Exchange, tool_use: &ToolUse<'_>) -> Result<String, ToolError> {
        let dispatcher = self.dispatcher.clone();
        let name = tool_use.name.to_string();
        let input = tool_use.input.cloned();
        let task_name = name.clone();
        let handle =
            tokio::spawn(async move { dispatcher.execute(&task_name, input.as_ref()).await });

        tokio::select! {
            biased;
            () = exchange.cancel.cancelled() => Err(ToolError::Cancelled),
            joined = handle => joined.unwrap_or_else(|e| {
                Err(ToolError::Backend {
                    tool: name,
                    message: format!("tool task did not complete: {e}"),
                })
            }),
        }
    }

    // ========================================================================
    // Session bookkeeping
    // ========================================================================

    /// Apply `event` on behalf of `exchange`. Fails with a cancellation
    /// error once the exchange no longer owns the session.
    fn advance(&self, exchange: &Exchange, event: SessionEvent) -> Result<(), ExchangeError> {
        let mut session = self.lock_session();
        ensure_current(&session, exchange.epoch, &exchange.cancel)?;
        let result = transition(session.status, event)?;
        let notices = apply(&mut session, result.new_status, &result.effects);
        self.publish(session, notices);
        Ok(())
    }

    /// Return a failed exchange's session to idle, unless it was aborted
    /// or superseded already
    fn fail(&self, epoch: u64, cancel: &CancellationToken) {
        let mut session = self.lock_session();
        if ensure_current(&session, epoch, cancel).is_err() || session.status.is_idle() {
            return;
        }
        let notices = match transition(session.status, SessionEvent::Fail) {
            Ok(result) => apply(&mut session, result.new_status, &result.effects),
            Err(e) => {
                tracing::error!(error = %e, "Failed to reset session");
                return;
            }
        };
        self.publish(session, notices);
    }

    fn commit(
        &self,
        exchange: &Exchange,
        user: Option<Message>,
        message: Message,
    ) -> Result<(), ExchangeError> {
        let mut session = self.lock_session();
        ensure_current(&session, exchange.epoch, &exchange.cancel)?;
        if let Some(user) = user {
            session.history.push(user);
        }
        session.history.push(message.clone());
        self.publish(session, vec![Notice::Appended(message)]);
        Ok(())
    }

    fn set_pending(&self, exchange: &Exchange, pending: Option<PendingTool>) -> Result<(), ExchangeError> {
        let mut session = self.lock_session();
        ensure_current(&session, exchange.epoch, &exchange.cancel)?;
        session.pending_tool = pending;
        Ok(())
    }

    /// Queue a preview, unless the exchange was aborted or superseded.
    /// Checked under the session lock so it can never follow the abort's
    /// clear.
    fn publish_preview(&self, exchange: &Exchange, assembler: &BlockAssembler) {
        let preview = assembler.preview();
        let session = self.lock_session();
        if ensure_current(&session, exchange.epoch, &exchange.cancel).is_err()
            || session.status != SessionStatus::Streaming
        {
            return;
        }
        self.publish(session, vec![Notice::Preview(Some(preview))]);
    }

    /// Queue `notices` behind everything already queued, release the
    /// session, then deliver unless another call is already delivering.
    /// Observers are never called with a lock held, so they may call back
    /// into the controller.
    fn publish(&self, session: MutexGuard<'_, Session>, notices: Vec<Notice>) {
        {
            let mut outbox = self.lock_outbox();
            outbox.queue.extend(notices);
            if outbox.draining || outbox.queue.is_empty() {
                return;
            }
            outbox.draining = true;
        }
        drop(session);

        let _guard = DrainGuard(&self.outbox);
        loop {
            let notice = {
                let mut outbox = self.lock_outbox();
                match outbox.queue.pop_front() {
                    Some(notice) => notice,
                    None => {
                        outbox.draining = false;
                        return;
                    }
                }
            };

            let observers = self.lock_observers().snapshot();
            for observer in &observers {
                match &notice {
                    Notice::Status(status) => observer.on_status_change(*status),
                    Notice::Preview(preview) => observer.on_live_preview(preview.as_deref()),
                    Notice::Appended(message) => observer.on_message_appended(message),
                }
            }
        }
    }

    fn lock_session(&self) -> MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_observers(&self) -> MutexGuard<'_, ObserverSet> {
        self.observers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_outbox(&self) -> MutexGuard<'_, Outbox> {
        self.outbox.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Error results for tool calls an aborted exchange never answered. The
/// model rejects a history where a tool use has no matching result.
fn unanswered_tool_results(history: &[Message]) -> Vec<ContentBlock> {
    match history.last() {
        Some(last) if last.role == MessageRole::Assistant => last
            .tool_uses()
            .iter()
            .map(|t| ContentBlock::tool_result(t.id, "Tool call was cancelled before it completed.", true))
            .collect(),
        _ => Vec::new(),
    }
}

fn ensure_current(
    session: &Session,
    epoch: u64,
    cancel: &CancellationToken,
) -> Result<(), ExchangeError> {
    if session.epoch != epoch || cancel.is_cancelled() {
        Err(LlmError::cancelled().into())
    } else {
        Ok(())
    }
}

/// Install the new status and run the effects that touch session state.
/// Observer-facing effects come back as notices for the caller to publish.
fn apply(session: &mut Session, new_status: SessionStatus, effects: &[Effect]) -> Vec<Notice> {
    session.status = new_status;
    let mut notices = Vec::new();

    for effect in effects {
        match effect {
            Effect::NotifyStatus(status) => notices.push(Notice::Status(*status)),
            Effect::ClearPreview => notices.push(Notice::Preview(None)),
            Effect::CancelInFlight => {
                if let Some(token) = session.cancel.take() {
                    token.cancel();
                }
            }
            Effect::RejectPendingTool => {
                if let Some(pending) = session.pending_tool.take() {
                    tracing::info!(
                        tool = %pending.name,
                        id = %pending.tool_use_id,
                        "Pending tool rejected, its result will be discarded"
                    );
                }
            }
        }
    }

    if new_status.is_idle() {
        session.cancel = None;
        session.pending_tool = None;
    }
    notices
}

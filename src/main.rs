//! Roomwright - interactive room design assistant
//!
//! Reads prompts from stdin and streams the assistant's replies. Ctrl-C
//! cancels the running exchange, or exits when idle.

use roomwright::llm::{ContentBlock, MessageRole, PreviewBlock, TransportRegistry};
use roomwright::runtime::{BroadcastObserver, ConversationEvent};
use roomwright::state_machine::SessionStatus;
use roomwright::system_prompt::DefaultContextProvider;
use roomwright::tools::{SceneBackend, ToolDispatcher};
use roomwright::{ClientConfig, ConversationController};
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr so they never interleave with the reply stream
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomwright=info".into()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(std::io::stderr),
        )
        .init();

    let config = ClientConfig::from_env()?;
    if config.api_key.is_none() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; requests will fail until it is");
    }
    tracing::info!(model = %config.model, base_url = %config.base_url, "Starting");

    let scene = Arc::new(SceneBackend::new());
    let dispatcher = Arc::new(ToolDispatcher::new(Some(scene.clone())));
    let context = Arc::new(DefaultContextProvider::discover(
        &std::env::current_dir()?,
        Some(scene),
    ));
    let registry = Arc::new(TransportRegistry::new());
    let controller = Arc::new(ConversationController::from_config(
        registry, config, dispatcher, context,
    ));

    let observer = Arc::new(BroadcastObserver::new(256));
    let events = observer.subscribe();
    controller.subscribe(observer);
    tokio::spawn(render(events));

    {
        let controller = controller.clone();
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                if controller.status().is_idle() {
                    std::process::exit(0);
                }
                controller.abort();
            }
        });
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    prompt();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => {}
            "/quit" => break,
            "/clear" => {
                if let Err(e) = controller.clear_history() {
                    eprintln!("{e}");
                }
            }
            text => match controller.send_message(text).await {
                Ok(_) => {}
                Err(e) if e.is_cancelled() => println!("\n(cancelled)"),
                Err(e) => eprintln!("\nerror: {e}"),
            },
        }
        prompt();
    }

    Ok(())
}

fn prompt() {
    print!("> ");
    let _ = std::io::stdout().flush();
}

/// Print streamed text as it arrives, plus a line per tool call and result
async fn render(events: tokio::sync::broadcast::Receiver<ConversationEvent>) {
    let mut stream = BroadcastStream::new(events);
    // Bytes of each text block already printed
    let mut printed: HashMap<usize, usize> = HashMap::new();
    let mut stdout = std::io::stdout();

    while let Some(event) = stream.next().await {
        let Ok(event) = event else {
            // Lagged; the next preview reprints from where we are
            continue;
        };
        match event {
            ConversationEvent::Preview(Some(blocks)) => {
                for block in blocks {
                    if let PreviewBlock::Text { index, text } = block {
                        let done = printed.entry(index).or_insert(0);
                        if let Some(fresh) = text.get(*done..) {
                            let _ = write!(stdout, "{fresh}");
                            *done = text.len();
                        }
                    }
                }
                let _ = stdout.flush();
            }
            ConversationEvent::Preview(None) => printed.clear(),
            ConversationEvent::MessageAppended(message) => {
                for block in &message.content {
                    match (message.role, block) {
                        (MessageRole::Assistant, ContentBlock::ToolUse { name, .. }) => {
                            let _ = writeln!(stdout, "\n  [{name}]");
                        }
                        (MessageRole::User, ContentBlock::ToolResult { content, is_error, .. }) => {
                            let marker = if *is_error { "!" } else { "=" };
                            let _ = writeln!(stdout, "  {marker} {content}");
                        }
                        _ => {}
                    }
                }
            }
            ConversationEvent::StatusChanged(SessionStatus::Idle) => {
                let _ = writeln!(stdout);
            }
            ConversationEvent::StatusChanged(_) => {}
        }
    }
}

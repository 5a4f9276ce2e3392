use anyhow::Result;
use std::io::{self, Write};
use tokio::sync::mpsc;

use crate::core::message::TurnSource;
use crate::core::model::{ModelCatalog, ModelId};
use crate::orchestrator::ChatEvent;

/// One-line notice for progress events, `None` for content and the
/// successful terminal events.
pub fn notice_text(event: &ChatEvent, catalog: &ModelCatalog) -> Option<String> {
    let name = |id: &ModelId| catalog.display_name(id);
    match event {
        ChatEvent::CacheHit { model } => Some(format!("Cached response from {}", name(model))),
        ChatEvent::ModelSubstituted { from, to, mode } => Some(format!(
            "{mode} mode: using {} instead of {}",
            name(to),
            name(from)
        )),
        ChatEvent::FasterModelSuggested {
            current,
            suggested,
            speedup,
        } => Some(format!(
            "Tip: {} has been {speedup:.1}x faster than {} on average. Use /model {suggested} to switch.",
            name(suggested),
            name(current)
        )),
        ChatEvent::StreamFallback { reason, .. } => {
            Some(format!("Streaming failed ({reason}); trying without streaming"))
        }
        ChatEvent::ModelRotated { to, .. } => {
            Some(format!("Switching to {} and retrying...", name(to)))
        }
        ChatEvent::Retrying { attempt, max } => Some(format!("Retrying ({attempt}/{max})...")),
        ChatEvent::Aborted { elapsed_secs } => {
            Some(format!("Response stopped after {elapsed_secs:.1}s"))
        }
        ChatEvent::ConsentRequired { message, .. } => Some(message.clone()),
        ChatEvent::Failed {
            message,
            retry_prompt,
            ..
        } => Some(match retry_prompt {
            Some(_) => format!("{message} Use /retry to try again."),
            None => message.clone(),
        }),
        ChatEvent::Started { .. }
        | ChatEvent::ContentDelta { .. }
        | ChatEvent::ImageGenerated { .. }
        | ChatEvent::Complete { .. } => None,
    }
}

fn source_label(source: TurnSource) -> &'static str {
    match source {
        TurnSource::Stream => "streamed",
        TurnSource::Batch => "batch",
        TurnSource::Cache => "cached",
        TurnSource::Vision => "vision",
        TurnSource::Image => "image",
    }
}

/// Print events until the channel closes. Returns the terminal event.
pub async fn render_stream(
    rx: &mut mpsc::Receiver<ChatEvent>,
    quiet: bool,
    catalog: &ModelCatalog,
) -> Result<Option<ChatEvent>> {
    let mut thinking_shown = false;
    // Whether deltas of the current call are on screen
    let mut streamed = false;
    let mut terminal = None;

    while let Some(event) = rx.recv().await {
        if thinking_shown && !matches!(event, ChatEvent::Started { .. }) {
            eprint!("\r\x1b[K");
            thinking_shown = false;
        }

        match &event {
            ChatEvent::Started { .. } => {
                if !quiet {
                    eprint!("\x1b[90mThinking...\x1b[0m");
                    io::stderr().flush().ok();
                    thinking_shown = true;
                }
            }
            ChatEvent::ContentDelta { text } => {
                print!("{text}");
                io::stdout().flush().ok();
                streamed = true;
            }
            ChatEvent::Complete {
                text,
                model,
                elapsed_secs,
                source,
            } => {
                if streamed {
                    println!();
                } else {
                    println!("{text}");
                }
                if !quiet {
                    eprintln!(
                        "\x1b[90m[{} · {elapsed_secs:.1}s · {}]\x1b[0m",
                        catalog.display_name(model),
                        source_label(*source)
                    );
                }
            }
            ChatEvent::ImageGenerated {
                url,
                model,
                elapsed_secs,
            } => {
                println!("{url}");
                if !quiet {
                    eprintln!(
                        "\x1b[90m[{} · {elapsed_secs:.1}s · image]\x1b[0m",
                        catalog.display_name(model)
                    );
                }
            }
            ChatEvent::Failed { .. } | ChatEvent::ConsentRequired { .. } => {
                if streamed {
                    println!();
                    streamed = false;
                }
                if let Some(text) = notice_text(&event, catalog) {
                    eprintln!("\x1b[31;1m{text}\x1b[0m");
                }
            }
            other => {
                if streamed {
                    // Partial output from an abandoned call
                    println!();
                    streamed = false;
                }
                if !quiet {
                    if let Some(text) = notice_text(other, catalog) {
                        eprintln!("\x1b[33m{text}\x1b[0m");
                    }
                }
            }
        }

        if event.is_terminal() {
            terminal = Some(event);
        }
    }

    Ok(terminal)
}

use anyhow::Result;
use std::io::{self, Write};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::command::{parse_command, Command, HELP};
use crate::core::model::{performance_score, ModelId};
use crate::orchestrator::{ChatEvent, Orchestrator, TemplateCategory, TemplateStore};

pub async fn run(app: &super::App) -> Result<()> {
    let orch = &app.orchestrator;
    println!("\x1b[1mchatline\x1b[0m v{}", env!("CARGO_PKG_VERSION"));
    print_status(orch).await;
    println!("Type \x1b[33m/help\x1b[0m for commands, \x1b[33mCtrl-D\x1b[0m to exit.\n");

    loop {
        eprint!("\x1b[32;1mchat>\x1b[0m ");
        io::stderr().flush().ok();

        let mut input = String::new();
        match io::stdin().read_line(&mut input) {
            Ok(0) => {
                // EOF (Ctrl-D)
                println!("\nGoodbye!");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                eprintln!("Input error: {e}");
                break;
            }
        }

        let input = input.trim();
        if input.is_empty() {
            continue;
        }

        if input.starts_with('/') {
            match handle_command(parse_command(input), orch).await {
                Ok(true) => continue,
                Ok(false) => break,
                Err(e) => {
                    eprintln!("\x1b[31mCommand error: {e}\x1b[0m");
                    continue;
                }
            }
        }

        match orch.submit(input).await {
            Ok((rx, cancel)) => render(orch, rx, cancel).await?,
            Err(e) => eprintln!("\x1b[31m{e}\x1b[0m"),
        }
    }

    Ok(())
}

/// Render a response; Ctrl-C stops it.
async fn render(
    orch: &Orchestrator,
    mut rx: mpsc::Receiver<ChatEvent>,
    cancel: CancellationToken,
) -> Result<()> {
    let render = super::output::render_stream(&mut rx, false, orch.catalog());
    tokio::pin!(render);
    loop {
        tokio::select! {
            result = &mut render => {
                result?;
                return Ok(());
            }
            _ = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => cancel.cancel(),
        }
    }
}

async fn print_status(orch: &Orchestrator) {
    let model = orch.selected_model().await;
    println!(
        "Model: \x1b[36m{}\x1b[0m ({model}) | Mode: {}",
        orch.catalog().display_name(&model),
        orch.mode().await
    );
}

async fn handle_command(command: Command, orch: &Orchestrator) -> Result<bool> {
    match command {
        Command::Help => {
            println!("\x1b[1mCommands:\x1b[0m");
            for (usage, description) in HELP {
                println!("  {usage:<46} {description}");
            }
        }
        Command::Exit => {
            println!("Goodbye!");
            return Ok(false);
        }
        Command::Model(None) => print_status(orch).await,
        Command::Model(Some(id)) => {
            orch.set_model(&ModelId(id)).await?;
            print_status(orch).await;
        }
        Command::Models => {
            let selected = orch.selected_model().await;
            let metrics = orch.metrics().snapshot().await;
            for model in orch.catalog().models() {
                let marker = if model.id == selected { "*" } else { " " };
                let labels: Vec<String> = model
                    .capability_labels()
                    .iter()
                    .map(ToString::to_string)
                    .collect();
                let speed = metrics
                    .get(&model.id)
                    .map(|m| {
                        format!(
                            "  avg {:.1}s, score {:.0}",
                            m.avg_response_time,
                            performance_score(m.avg_response_time)
                        )
                    })
                    .unwrap_or_default();
                println!(
                    "{marker} \x1b[36m{:<20}\x1b[0m {:<18} \x1b[90m{} | {}{speed}\x1b[0m",
                    model.id.as_str(),
                    model.display_name,
                    model.family,
                    labels.join(", ")
                );
            }
        }
        Command::Speed => println!("{}", orch.toggle_speed_mode().await?),
        Command::Thinking => println!("{}", orch.toggle_thinking_mode().await?),
        Command::New => {
            orch.new_chat().await?;
            println!("Started a new chat.");
        }
        Command::History => {
            let current = orch.session().await.id;
            let chats = orch.list_chats().await?;
            if chats.is_empty() {
                println!("No saved chats.");
            }
            for chat in chats {
                let marker = if chat.id == current { " *" } else { "" };
                println!(
                    "  \x1b[90m{}\x1b[0m  {}{marker}  ({} turns, {})",
                    chat.id,
                    chat.title,
                    chat.turns,
                    chat.timestamp.format("%Y-%m-%d %H:%M")
                );
            }
        }
        Command::Load(id) => {
            let session = orch.load_chat(&id).await?;
            println!("Loaded \"{}\" ({} turns).", session.title, session.transcript.len());
            for turn in &session.transcript {
                println!("\x1b[90m[{:?}]\x1b[0m {}", turn.role, turn.text);
            }
        }
        Command::Delete(id) => {
            orch.delete_chat(&id).await?;
            println!("Deleted chat {id}.");
        }
        Command::ClearHistory => {
            orch.clear_history().await?;
            println!("Chat history cleared.");
        }
        Command::Retry => {
            let (rx, cancel) = orch.retry_last_failed().await?;
            render(orch, rx, cancel).await?;
        }
        Command::Regen(feedback) => {
            let (rx, cancel) = orch.regenerate(feedback.as_deref()).await?;
            render(orch, rx, cancel).await?;
        }
        Command::Image(Some(url)) => {
            orch.attach_image(&url).await?;
            let model = orch.selected_model().await;
            if !orch.catalog().supports_vision(&model) {
                println!("Image attached. Select a vision model (e.g. /model gpt-4o-vision) to use it.");
            } else {
                println!("Image attached to the next message.");
            }
        }
        Command::Image(None) => {
            orch.clear_attachment().await;
            println!("Image attachment cleared.");
        }
        Command::Templates(category) => {
            let templates = match category {
                Some(name) => {
                    let Some(category) = TemplateCategory::parse(&name) else {
                        anyhow::bail!("unknown category: {name}");
                    };
                    orch.templates().by_category(category).await
                }
                None => orch.templates().all().await,
            };
            for (id, t) in templates {
                let vars = t.placeholders().join(", ");
                println!(
                    "  \x1b[36m{id:<22}\x1b[0m {:<12} {}  \x1b[90m{vars}\x1b[0m",
                    t.category.name(),
                    t.title
                );
            }
        }
        Command::Template { id, values } => {
            let Some(template) = orch.templates().get(&id).await else {
                anyhow::bail!("unknown template: {id}");
            };
            let prompt = template.fill(&values);
            println!("\x1b[90m{prompt}\x1b[0m\n");
            let (rx, cancel) = orch.submit(&prompt).await?;
            render(orch, rx, cancel).await?;
        }
        Command::SaveTemplate {
            category,
            title,
            prompt,
        } => {
            let Some(category) = TemplateCategory::parse(&category) else {
                anyhow::bail!("unknown category: {category}");
            };
            let id = orch.templates().create(&title, &prompt, category).await?;
            println!("Saved template {id}.");
        }
        Command::DeleteTemplate(id) => {
            if !TemplateStore::is_user_template(&id) {
                anyhow::bail!("built-in templates cannot be deleted");
            }
            if orch.templates().delete(&id).await? {
                println!("Deleted template {id}.");
            } else {
                println!("No template {id}.");
            }
        }
        Command::ExportTemplates(path) => {
            std::fs::write(&path, orch.templates().export().await?)?;
            println!("Templates written to {path}.");
        }
        Command::ImportTemplates(path) => {
            let json = std::fs::read_to_string(&path)?;
            let count = orch.templates().import(&json).await?;
            println!("Imported {count} templates.");
        }
        Command::Stats => {
            println!("Requests: {}", orch.prefs().request_count().await);
            println!("Cached responses: {}", orch.cache().len().await);
            println!("Mode: {}", orch.mode().await);
            let metrics = orch.metrics().snapshot().await;
            for model in orch.catalog().models() {
                if let Some(m) = metrics.get(&model.id) {
                    println!(
                        "  {:<20} avg {:.2}s over {} (last {:.2}s)",
                        model.display_name, m.avg_response_time, m.response_count, m.last_response_time
                    );
                }
            }
        }
        Command::Usage(usage) => eprintln!("Usage: {usage}"),
        Command::Unknown(name) => {
            eprintln!("Unknown command: {name}. Type /help for available commands.");
        }
    }
    Ok(true)
}

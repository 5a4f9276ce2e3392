use anyhow::Result;

use crate::orchestrator::ChatEvent;

pub async fn run(
    app: &super::App,
    prompt: String,
    output_format: super::OutputFormat,
    quiet: bool,
) -> Result<()> {
    let orch = &app.orchestrator;
    let (mut rx, _cancel) = orch.submit(&prompt).await?;

    let terminal = match output_format {
        super::OutputFormat::Text => {
            super::output::render_stream(&mut rx, quiet, orch.catalog()).await?
        }
        super::OutputFormat::Json => {
            let mut notices = Vec::new();
            let mut terminal = None;
            while let Some(event) = rx.recv().await {
                if event.is_terminal() {
                    terminal = Some(event);
                } else if let Some(text) = super::output::notice_text(&event, orch.catalog()) {
                    notices.push(text);
                }
            }

            let output = match &terminal {
                Some(ChatEvent::Complete {
                    text,
                    model,
                    elapsed_secs,
                    source,
                }) => serde_json::json!({
                    "content": text,
                    "model": model,
                    "elapsed_secs": elapsed_secs,
                    "source": source,
                    "notices": notices,
                }),
                Some(ChatEvent::ImageGenerated {
                    url,
                    model,
                    elapsed_secs,
                }) => serde_json::json!({
                    "image_url": url,
                    "model": model,
                    "elapsed_secs": elapsed_secs,
                    "notices": notices,
                }),
                Some(ChatEvent::Failed { message, kind, .. }) => serde_json::json!({
                    "error": message,
                    "kind": format!("{kind:?}"),
                    "notices": notices,
                }),
                Some(ChatEvent::ConsentRequired { message, hint, .. }) => serde_json::json!({
                    "error": message,
                    "kind": "ConsentRequired",
                    "hint": hint,
                    "notices": notices,
                }),
                _ => serde_json::json!({
                    "error": "Response stopped before completion",
                    "notices": notices,
                }),
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
            terminal
        }
    };

    match terminal {
        Some(ChatEvent::Complete { .. }) | Some(ChatEvent::ImageGenerated { .. }) => Ok(()),
        _ => anyhow::bail!("no response was produced"),
    }
}

use std::collections::HashMap;

/// A parsed REPL slash command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Model(Option<String>),
    Models,
    Speed,
    Thinking,
    New,
    History,
    Load(String),
    Delete(String),
    ClearHistory,
    Retry,
    Regen(Option<String>),
    /// `None` clears the attachment
    Image(Option<String>),
    Templates(Option<String>),
    Template {
        id: String,
        values: HashMap<String, String>,
    },
    SaveTemplate {
        category: String,
        title: String,
        prompt: String,
    },
    DeleteTemplate(String),
    ExportTemplates(String),
    ImportTemplates(String),
    Stats,
    Exit,
    /// Missing argument; holds the usage line
    Usage(&'static str),
    Unknown(String),
}

pub const HELP: &[(&str, &str)] = &[
    ("/help", "Show this help"),
    ("/model [id]", "Show or select the model"),
    ("/models", "List models with capabilities and speed"),
    ("/speed", "Toggle speed mode"),
    ("/thinking", "Toggle thinking mode"),
    ("/new", "Start a new chat"),
    ("/history", "List saved chats"),
    ("/load <id>", "Open a saved chat"),
    ("/delete <id>", "Delete a saved chat"),
    ("/clear-history", "Delete all saved chats"),
    ("/retry", "Resubmit the last failed prompt"),
    ("/regen [feedback]", "Regenerate the last response"),
    ("/image [url]", "Attach an image for a vision model (no url clears it)"),
    ("/templates [category]", "List prompt templates"),
    ("/template <id> key=value...", "Send a template with its placeholders filled"),
    ("/save-template <category> <title> | <prompt>", "Save a user template"),
    ("/delete-template <id>", "Delete a user template"),
    ("/export-templates <file>", "Write user templates to a file"),
    ("/import-templates <file>", "Load user templates from a file"),
    ("/stats", "Show request count, cache size and model timings"),
    ("/exit", "Exit"),
];

/// Parse a line starting with `/`.
pub fn parse_command(input: &str) -> Command {
    let input = input.trim();
    let (name, rest) = match input.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (input, ""),
    };
    let arg = (!rest.is_empty()).then(|| rest.to_string());

    match name {
        "/help" | "/h" => Command::Help,
        "/model" => Command::Model(arg),
        "/models" => Command::Models,
        "/speed" => Command::Speed,
        "/thinking" => Command::Thinking,
        "/new" => Command::New,
        "/history" => Command::History,
        "/load" => arg.map_or(Command::Usage("/load <id>"), Command::Load),
        "/delete" => arg.map_or(Command::Usage("/delete <id>"), Command::Delete),
        "/clear-history" => Command::ClearHistory,
        "/retry" => Command::Retry,
        "/regen" | "/regenerate" => Command::Regen(arg),
        "/image" => Command::Image(arg),
        "/templates" => Command::Templates(arg),
        "/template" => parse_template(rest),
        "/save-template" => parse_save_template(rest),
        "/delete-template" => {
            arg.map_or(Command::Usage("/delete-template <id>"), Command::DeleteTemplate)
        }
        "/export-templates" => {
            arg.map_or(Command::Usage("/export-templates <file>"), Command::ExportTemplates)
        }
        "/import-templates" => {
            arg.map_or(Command::Usage("/import-templates <file>"), Command::ImportTemplates)
        }
        "/stats" => Command::Stats,
        "/exit" | "/quit" | "/q" => Command::Exit,
        other => Command::Unknown(other.to_string()),
    }
}

/// `<id> key=value...`. Words without `=` continue the previous value.
fn parse_template(rest: &str) -> Command {
    let mut words = rest.split_whitespace();
    let Some(id) = words.next() else {
        return Command::Usage("/template <id> key=value...");
    };

    let mut values: HashMap<String, String> = HashMap::new();
    let mut current: Option<String> = None;
    for word in words {
        match word.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                values.insert(key.to_string(), value.to_string());
                current = Some(key.to_string());
            }
            _ => {
                if let Some(value) = current.as_ref().and_then(|k| values.get_mut(k)) {
                    if !value.is_empty() {
                        value.push(' ');
                    }
                    value.push_str(word);
                }
            }
        }
    }

    Command::Template {
        id: id.to_string(),
        values,
    }
}

/// `<category> <title> | <prompt>`
fn parse_save_template(rest: &str) -> Command {
    const USAGE: &str = "/save-template <category> <title> | <prompt>";
    let Some((head, prompt)) = rest.split_once('|') else {
        return Command::Usage(USAGE);
    };
    let Some((category, title)) = head.trim().split_once(char::is_whitespace) else {
        return Command::Usage(USAGE);
    };
    let (title, prompt) = (title.trim(), prompt.trim());
    if title.is_empty() || prompt.is_empty() {
        return Command::Usage(USAGE);
    }
    Command::SaveTemplate {
        category: category.to_string(),
        title: title.to_string(),
        prompt: prompt.to_string(),
    }
}

mod context;
mod event;
#[allow(clippy::module_inception)]
mod orchestrator;
mod policy;
mod prompt;
mod templates;

#[cfg(test)]
mod tests;

pub use context::{AppContext, ConsentProbe, RetryState, TerminalConsentProbe};
pub use event::ChatEvent;
pub use orchestrator::{
    final_error_message, Orchestrator, CONSENT_FINAL_MESSAGE, THINKING_TOKEN_LIMIT_MESSAGE,
};
pub use policy::{select_model, Selection};
pub use prompt::{prompt_for_mode, regenerate_prompt, request_options, wrap_thinking};
pub use templates::{
    builtin_templates, fill, format_placeholder_name, placeholders, PromptTemplate,
    TemplateCategory, TemplateStore, USER_TEMPLATES_KEY,
};

use crate::core::config::ModeProfile;
use crate::core::model::ModelId;
use crate::core::provider::RequestOptions;
use crate::storage::Mode;

/// Wrap a prompt in the four-part reasoning structure used by thinking mode.
pub fn wrap_thinking(prompt: &str) -> String {
    format!(
        "I need a well-reasoned, step-by-step analysis of the following question or request. \n\
Please structure your thinking as follows:\n\
1. Initial understanding of the question\n\
2. Key considerations and factors to analyze\n\
3. Step-by-step reasoning and analysis\n\
4. Conclusion or recommendation\n\
\n\
The question or request is: \n\
\n\
{prompt}\n\
\n\
Take your time to think through this carefully and provide a thorough analysis."
    )
}

/// The prompt actually sent for `mode`.
pub fn prompt_for_mode(prompt: &str, mode: Mode) -> String {
    match mode {
        Mode::Thinking => wrap_thinking(prompt),
        Mode::Normal | Mode::Speed => prompt.to_string(),
    }
}

/// Request options for `model`, with the active mode's sampling overrides.
pub fn request_options(
    model: &ModelId,
    mode: Mode,
    stream: bool,
    speed: &ModeProfile,
    thinking: &ModeProfile,
) -> RequestOptions {
    let mut options = RequestOptions::new(model.clone(), stream);
    let profile = match mode {
        Mode::Speed => speed,
        Mode::Thinking => thinking,
        Mode::Normal => return options,
    };
    options.temperature = profile.temperature;
    options.max_tokens = profile.max_tokens;
    options.top_p = profile.top_p;
    options
}

/// Prompt used by regenerate: the original, plus the user's feedback when
/// there is any.
pub fn regenerate_prompt(prompt: &str, feedback: Option<&str>) -> String {
    match feedback.map(str::trim).filter(|f| !f.is_empty()) {
        Some(f) => format!("{prompt}\n\nPlease improve your response. User feedback: {f}"),
        None => prompt.to_string(),
    }
}

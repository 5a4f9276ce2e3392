use crate::core::config::ModeProfile;
use crate::core::model::{ModelCatalog, ModelId};
use crate::storage::{suggest_faster_model, MetricsTable, Mode, Suggestion};

/// The model a submission will actually use, and why.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub model: ModelId,
    /// Set when the active mode forced a different model
    pub substituted_from: Option<ModelId>,
    /// Advisory only; never applied automatically
    pub suggestion: Option<Suggestion>,
}

/// Pick the effective model for `selected` under `mode`.
///
/// Speed and thinking mode force their profile's default model unless the
/// selection is already on the allowlist. Vision and image-generation
/// models are never substituted. With no mode active the metrics table may
/// yield a faster-model suggestion, but the selection stands.
pub fn select_model(
    selected: &ModelId,
    mode: Mode,
    speed: &ModeProfile,
    thinking: &ModeProfile,
    metrics: &MetricsTable,
    catalog: &ModelCatalog,
) -> Selection {
    let unchanged = Selection {
        model: selected.clone(),
        substituted_from: None,
        suggestion: None,
    };

    let profile = match mode {
        Mode::Speed => speed,
        Mode::Thinking => thinking,
        Mode::Normal => {
            return Selection {
                suggestion: suggest_faster_model(metrics, selected, catalog),
                ..unchanged
            };
        }
    };

    if catalog.is_specialized(selected) || profile.allows(selected) {
        return unchanged;
    }
    Selection {
        model: profile.default_model.clone(),
        substituted_from: Some(selected.clone()),
        suggestion: None,
    }
}

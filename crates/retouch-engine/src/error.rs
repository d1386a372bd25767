use thiserror::Error;

/// A precondition was not met; nothing was sent to the generation service.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("add at least one reference image first")]
    NoReferenceImages,
    #[error("{0} reference image(s) are still being processed")]
    ReferencesProcessing(usize),
    #[error("describe the image: the consistent prompt and the first picture prompt are both empty")]
    EmptyPrompt,
    #[error("a master image request is already in progress")]
    MasterBusy,
    #[error("generate a master image first")]
    MissingMaster,
    #[error("enter a modification instruction first")]
    EmptyInstruction,
    #[error("add at least one picture slot first")]
    NoUnits,
    #[error("unknown picture slot '{0}'")]
    UnknownUnit(String),
    #[error("picture slot '{0}' has no reference image")]
    MissingUnitReference(String),
    #[error("an analysis pass is already in progress")]
    AnalysisBusy,
}

/// An external generation call failed. Always recoverable: the caller records
/// it on the affected entity and the user may retry.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct GenerationError {
    pub message: String,
}

impl GenerationError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// Flattens an `anyhow` chain into one bounded, human-readable message.
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        Self::new(error_chain_text(err, 1024))
    }
}

#[derive(Debug, Error)]
pub enum StudioError {
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error(transparent)]
    Generation(#[from] GenerationError),
    #[error("knowledge base error: {0:#}")]
    KnowledgeBase(#[from] anyhow::Error),
}

pub(crate) fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() {
            continue;
        }
        if parts
            .last()
            .map(|existing| existing == trimmed)
            .unwrap_or(false)
        {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

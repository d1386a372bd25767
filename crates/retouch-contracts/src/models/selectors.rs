use std::fmt;

use thiserror::Error;

use super::registry::{ModelRegistry, ModelSpec};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SelectionError {
    #[error("no registered model supports '{capability}'")]
    NoCapableModel { capability: String },
}

/// Why the selector picked something other than what was asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionNote {
    Unspecified,
    Unknown {
        requested: String,
    },
    WrongCapability {
        requested: String,
        capability: String,
    },
    TooFewInputs {
        model: String,
        limit: usize,
        needed: usize,
    },
}

impl fmt::Display for SelectionNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unspecified => f.write_str("No model specified; using default."),
            Self::Unknown { requested } => {
                write!(f, "Unknown model '{requested}'; using default.")
            }
            Self::WrongCapability {
                requested,
                capability,
            } => write!(
                f,
                "Model '{requested}' cannot serve '{capability}' requests; using default."
            ),
            Self::TooFewInputs {
                model,
                limit,
                needed,
            } => write!(
                f,
                "Model '{model}' reads at most {limit} input image(s) but {needed} are needed."
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model: ModelSpec,
    pub requested: Option<String>,
    pub notes: Vec<SelectionNote>,
}

impl ModelSelection {
    pub fn is_fallback(&self) -> bool {
        self.requested.as_deref() != Some(self.model.name.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct ModelSelector {
    registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_else(|| ModelRegistry::new(None)),
        }
    }

    /// Resolves `requested` for `capability`. A model that cannot take
    /// `needed_inputs` images in one request is rejected like an unknown one.
    ///
    /// Fallback picks the first capable model that fits `needed_inputs`, or
    /// the first capable model at all (noting the shortfall) when none fits.
    pub fn select(
        &self,
        requested: Option<&str>,
        capability: &str,
        needed_inputs: usize,
    ) -> Result<ModelSelection, SelectionError> {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string);

        let mut notes = Vec::new();
        match requested.as_deref() {
            None => notes.push(SelectionNote::Unspecified),
            Some(name) => match self.registry.get(name) {
                None => notes.push(SelectionNote::Unknown {
                    requested: name.to_string(),
                }),
                Some(model) if !model.supports(capability) => {
                    notes.push(SelectionNote::WrongCapability {
                        requested: name.to_string(),
                        capability: capability.to_string(),
                    })
                }
                Some(model) => match shortfall(model, needed_inputs) {
                    None => {
                        return Ok(ModelSelection {
                            model: model.clone(),
                            requested: Some(name.to_string()),
                            notes,
                        })
                    }
                    Some(note) => notes.push(note),
                },
            },
        }

        let candidates = self.registry.by_capability(capability);
        let fitting = candidates
            .iter()
            .find(|model| model.accepts(needed_inputs))
            .cloned();
        let model = match fitting {
            Some(model) => model,
            None => {
                let model = candidates.first().cloned().ok_or_else(|| {
                    SelectionError::NoCapableModel {
                        capability: capability.to_string(),
                    }
                })?;
                notes.extend(shortfall(&model, needed_inputs));
                model
            }
        };
        Ok(ModelSelection {
            model,
            requested,
            notes,
        })
    }
}

fn shortfall(model: &ModelSpec, needed: usize) -> Option<SelectionNote> {
    let limit = model.max_input_images?;
    (needed > limit).then(|| SelectionNote::TooFewInputs {
        model: model.name.clone(),
        limit,
        needed,
    })
}

mod registry;
mod selectors;

pub use registry::{ModelRegistry, ModelSpec, CAPABILITY_EDIT, CAPABILITY_VISION};
pub use selectors::{ModelSelection, ModelSelector, SelectionError, SelectionNote};

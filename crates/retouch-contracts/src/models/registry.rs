use indexmap::IndexMap;

/// Produces images conditioned on input images (generation, edits, cleanup).
pub const CAPABILITY_EDIT: &str = "edit";
/// Reads images and answers in text (analysis, watermark detection).
pub const CAPABILITY_VISION: &str = "vision";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub provider: String,
    pub capabilities: Vec<String>,
    /// How many input images one request may carry; `None` means no known cap.
    pub max_input_images: Option<usize>,
}

impl ModelSpec {
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|item| item == capability)
    }

    pub fn accepts(&self, input_images: usize) -> bool {
        self.max_input_images
            .map(|limit| input_images <= limit)
            .unwrap_or(true)
    }
}

#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    pub fn by_capability(&self, capability: &str) -> Vec<ModelSpec> {
        self.models
            .values()
            .filter(|model| model.supports(capability))
            .cloned()
            .collect()
    }

    pub fn ensure(&self, name: &str, capability: &str) -> Option<ModelSpec> {
        let model = self.get(name)?;
        if model.supports(capability) {
            return Some(model.clone());
        }
        None
    }
}

fn default_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert =
        |name: &str, provider: &str, capabilities: &[&str], max_input_images: Option<usize>| {
            map.insert(
                name.to_string(),
                ModelSpec {
                    name: name.to_string(),
                    provider: provider.to_string(),
                    capabilities: capabilities
                        .iter()
                        .map(|item| (*item).to_string())
                        .collect(),
                    max_input_images,
                },
            );
        };

    insert("gemini-2.5-flash-image", "gemini", &[CAPABILITY_EDIT], Some(3));
    insert("gemini-2.5-flash", "gemini", &[CAPABILITY_VISION], Some(16));
    insert(
        "gemini-3-pro-image-preview",
        "gemini",
        &[CAPABILITY_EDIT],
        Some(14),
    );
    insert("gemini-3-pro-preview", "gemini", &[CAPABILITY_VISION], Some(16));
    insert(
        "black-forest-labs/flux-kontext-pro",
        "replicate",
        &[CAPABILITY_EDIT],
        Some(1),
    );
    insert(
        "black-forest-labs/flux-kontext-max",
        "replicate",
        &[CAPABILITY_EDIT],
        Some(1),
    );
    insert("yorickvp/llava-13b", "replicate", &[CAPABILITY_VISION], Some(1));
    insert(
        "dryrun-image-1",
        "dryrun",
        &[CAPABILITY_EDIT, CAPABILITY_VISION],
        None,
    );

    map
}

mod dryrun;
mod gemini;
mod replicate;

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::{Client as HttpClient, RequestBuilder, Response as HttpResponse};
use retouch_contracts::analysis::{AnalysisResult, WatermarkReport};
use retouch_contracts::media::{ArtifactRef, ImageData};
use retouch_contracts::models::{ModelSelector, CAPABILITY_EDIT, CAPABILITY_VISION};
use serde_json::Value;

use crate::config::ServiceConfig;
use crate::error::truncate_text;
use crate::service::{GenerationResult, GenerationService, VariantRequest};

pub use dryrun::DryrunService;
pub use gemini::GeminiService;
pub use replicate::ReplicateService;

/// Routes image-producing calls to one backend and vision calls to another,
/// so e.g. Replicate edits can be paired with Gemini analysis.
pub struct ProviderRouter {
    image: Arc<dyn GenerationService>,
    vision: Arc<dyn GenerationService>,
    image_model: String,
    vision_model: String,
    notes: Vec<String>,
}

impl ProviderRouter {
    pub fn new(image: Arc<dyn GenerationService>, vision: Arc<dyn GenerationService>) -> Self {
        Self {
            image_model: image.name().to_string(),
            vision_model: vision.name().to_string(),
            image,
            vision,
            notes: Vec::new(),
        }
    }

    /// Resolves the configured models through the registry and builds one
    /// client per backend. `input_images` is how many references a single
    /// request will carry; models that cannot read that many are passed over.
    /// Selection fallbacks are kept as notes.
    pub fn from_config(config: &ServiceConfig, input_images: usize) -> Result<Self> {
        let selector = ModelSelector::new(None);
        let image = selector.select(config.image_model.as_deref(), CAPABILITY_EDIT, input_images)?;
        let vision = selector.select(
            config.vision_model.as_deref(),
            CAPABILITY_VISION,
            input_images,
        )?;

        let mut notes = Vec::new();
        for note in image.notes.iter().chain(&vision.notes) {
            push_unique_warning(&mut notes, note.to_string());
        }

        let image_backend = backend_for(&image.model.provider, &image.model.name, config)?;
        let vision_backend = backend_for(&vision.model.provider, &vision.model.name, config)?;
        Ok(Self {
            image: image_backend,
            vision: vision_backend,
            image_model: image.model.name,
            vision_model: vision.model.name,
            notes,
        })
    }

    pub fn image_model(&self) -> &str {
        &self.image_model
    }

    pub fn vision_model(&self) -> &str {
        &self.vision_model
    }

    pub fn notes(&self) -> &[String] {
        &self.notes
    }
}

fn backend_for(
    provider: &str,
    model: &str,
    config: &ServiceConfig,
) -> Result<Arc<dyn GenerationService>> {
    let backend: Arc<dyn GenerationService> = match provider {
        "gemini" => Arc::new(GeminiService::new(config, model)),
        "replicate" => Arc::new(ReplicateService::new(config, model)),
        "dryrun" => Arc::new(DryrunService::new()),
        other => bail!("no native client for provider '{other}' (model '{model}')"),
    };
    Ok(backend)
}

impl GenerationService for ProviderRouter {
    fn name(&self) -> &str {
        "router"
    }

    fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef> {
        self.image.remove_watermark(image)
    }

    fn detect_watermark(&self, image: &ImageData) -> GenerationResult<WatermarkReport> {
        self.vision.detect_watermark(image)
    }

    fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult> {
        self.vision.analyze_images(images)
    }

    fn generate_master_image(
        &self,
        images: &[ArtifactRef],
        consistent_prompt: &str,
        variable_prompt: &str,
    ) -> GenerationResult<ArtifactRef> {
        self.image
            .generate_master_image(images, consistent_prompt, variable_prompt)
    }

    fn modify_master_image(
        &self,
        images: &[ArtifactRef],
        master: &ArtifactRef,
        consistent_prompt: &str,
        variable_prompt: &str,
        instruction: &str,
    ) -> GenerationResult<ArtifactRef> {
        self.image.modify_master_image(
            images,
            master,
            consistent_prompt,
            variable_prompt,
            instruction,
        )
    }

    fn generate_single_from_master(
        &self,
        request: &VariantRequest<'_>,
    ) -> GenerationResult<ArtifactRef> {
        self.image.generate_single_from_master(request)
    }

    fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
        let image = self.image.rotate_api_key(provider, key.clone());
        let vision = self.vision.rotate_api_key(provider, key);
        image || vision
    }
}

/// Downloads or decodes an artifact for export.
pub fn fetch_artifact(artifact: &ArtifactRef, timeout_s: f64) -> Result<ImageData> {
    let http = HttpClient::builder()
        .timeout(Duration::from_secs_f64(timeout_s.max(1.0)))
        .build()
        .context("failed building HTTP client")?;
    load_artifact(&http, artifact)
}

/// Resolves an artifact into bytes: data URIs are decoded, URLs downloaded,
/// anything else is read as a local path.
pub(crate) fn load_artifact(http: &HttpClient, artifact: &ArtifactRef) -> Result<ImageData> {
    if artifact.is_data_uri() {
        return ImageData::from_data_uri(artifact.as_str());
    }
    if artifact.is_remote() {
        let url = artifact.as_str();
        let response = http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading image ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!("image download failed ({code}): {}", truncate_text(&body, 512));
        }
        let mime_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
            .unwrap_or_else(|| "image/png".to_string());
        let bytes = response
            .bytes()
            .context("failed reading downloaded image bytes")?
            .to_vec();
        return Ok(ImageData::new(bytes, mime_type));
    }
    ImageData::from_path(std::path::Path::new(artifact.as_str()))
}

pub(crate) fn response_json_or_error(provider: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let code = status.as_u16();
    let body = response
        .text()
        .with_context(|| format!("{provider} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{provider} request failed ({code}): {}",
            truncate_text(&body, 512)
        );
    }
    let parsed: Value = serde_json::from_str(&body)
        .with_context(|| format!("{provider} returned invalid JSON payload"))?;
    Ok(parsed)
}

/// Sends a request, retrying transient transport failures (timeouts, refused
/// connections) with linear backoff. HTTP error statuses are not retried.
pub(crate) fn send_with_transport_retries(
    provider: &str,
    build: impl Fn() -> RequestBuilder,
    max_retries: usize,
    retry_backoff_s: f64,
) -> Result<HttpResponse> {
    let mut attempt = 0;
    loop {
        match build().send() {
            Ok(response) => return Ok(response),
            Err(raw) => {
                let err = anyhow::Error::new(raw).context(format!("{provider} request failed"));
                if !is_retryable_transport_error(&err) || attempt >= max_retries {
                    return Err(err);
                }
                attempt += 1;
                thread::sleep(Duration::from_secs_f64(retry_backoff_s * attempt as f64));
            }
        }
    }
}

fn is_retryable_transport_error(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .map(|reqwest_err| {
                reqwest_err.is_timeout() || reqwest_err.is_connect() || reqwest_err.is_request()
            })
            .unwrap_or(false)
    })
}

pub(crate) fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults_to_gemini_models() -> anyhow::Result<()> {
        let router = ProviderRouter::from_config(&ServiceConfig::default(), 3)?;
        assert_eq!(router.image_model(), "gemini-2.5-flash-image");
        assert_eq!(router.vision_model(), "gemini-2.5-flash");
        assert_eq!(router.notes(), ["No model specified; using default."]);
        Ok(())
    }

    #[test]
    fn router_pairs_replicate_edits_with_dryrun_vision() -> anyhow::Result<()> {
        let config = ServiceConfig {
            image_model: Some("black-forest-labs/flux-kontext-pro".to_string()),
            vision_model: Some("dryrun-image-1".to_string()),
            ..ServiceConfig::default()
        };
        let router = ProviderRouter::from_config(&config, 1)?;
        assert_eq!(router.image_model(), "black-forest-labs/flux-kontext-pro");
        assert!(router.notes().is_empty());

        let image = ImageData::new(vec![1, 2, 3], "image/png");
        assert!(!router.detect_watermark(&image)?.has_watermark);
        Ok(())
    }

    #[test]
    fn router_passes_over_models_that_cannot_read_every_reference() -> anyhow::Result<()> {
        let config = ServiceConfig {
            image_model: Some("black-forest-labs/flux-kontext-max".to_string()),
            vision_model: Some("yorickvp/llava-13b".to_string()),
            ..ServiceConfig::default()
        };
        let router = ProviderRouter::from_config(&config, 5)?;
        assert_eq!(router.image_model(), "gemini-3-pro-image-preview");
        assert_eq!(router.vision_model(), "gemini-2.5-flash");
        assert_eq!(router.notes().len(), 2);
        assert!(router.notes()[0].contains("flux-kontext-max"));
        assert!(router.notes()[1].contains("llava-13b"));
        Ok(())
    }

    #[test]
    fn rotation_reaches_the_matching_backend_only() -> anyhow::Result<()> {
        let config = ServiceConfig {
            image_model: Some("dryrun-image-1".to_string()),
            vision_model: Some("gemini-2.5-flash".to_string()),
            ..ServiceConfig::default()
        };
        let router = ProviderRouter::from_config(&config, 2)?;
        assert!(router.rotate_api_key("gemini", Some("new-key".to_string())));
        assert_eq!(config.gemini_api_key.current().as_deref(), Some("new-key"));
        assert!(!router.rotate_api_key("replicate", Some("unused".to_string())));
        Ok(())
    }

    #[test]
    fn load_artifact_decodes_data_uris_and_reads_paths() -> anyhow::Result<()> {
        let http = HttpClient::new();
        let image = ImageData::new(vec![0x89, b'P', b'N', b'G'], "image/png");
        assert_eq!(load_artifact(&http, &ArtifactRef::from(&image))?, image);

        let temp = tempfile::tempdir()?;
        let path = temp.path().join("master.png");
        std::fs::write(&path, &image.bytes)?;
        let loaded = load_artifact(&http, &ArtifactRef::new(path.to_string_lossy()))?;
        assert_eq!(loaded.bytes, image.bytes);
        Ok(())
    }

    #[test]
    fn missing_credentials_fail_as_generation_errors() {
        let router = ProviderRouter::from_config(&ServiceConfig::default(), 1);
        let Ok(router) = router else {
            panic!("default router should build");
        };
        let image = ImageData::new(vec![1], "image/png");
        let err = router.remove_watermark(&image).unwrap_err();
        assert!(err.message.contains("GEMINI_API_KEY"));
    }
}

use retouch_contracts::analysis::{AnalysisResult, WatermarkReport};
use retouch_contracts::media::{ArtifactRef, ImageData};

use crate::error::GenerationError;

pub type GenerationResult<T> = Result<T, GenerationError>;

/// Inputs for one derived image generated against the master.
#[derive(Debug, Clone, Copy)]
pub struct VariantRequest<'a> {
    pub images: &'a [ArtifactRef],
    pub master: &'a ArtifactRef,
    pub consistent_prompt: &'a str,
    pub variable_prompt: &'a str,
    pub is_regeneration: bool,
    pub reference: Option<&'a ArtifactRef>,
}

/// The boundary through which the studio reaches external image models.
///
/// Every method blocks until the remote call finishes; the studio runs them on
/// worker threads. Any failure is a [`GenerationError`] the caller records on
/// the affected entity.
pub trait GenerationService: Send + Sync {
    fn name(&self) -> &str;

    fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef>;

    fn detect_watermark(&self, image: &ImageData) -> GenerationResult<WatermarkReport>;

    fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult>;

    fn generate_master_image(
        &self,
        images: &[ArtifactRef],
        consistent_prompt: &str,
        variable_prompt: &str,
    ) -> GenerationResult<ArtifactRef>;

    fn modify_master_image(
        &self,
        images: &[ArtifactRef],
        master: &ArtifactRef,
        consistent_prompt: &str,
        variable_prompt: &str,
        instruction: &str,
    ) -> GenerationResult<ArtifactRef>;

    fn generate_single_from_master(
        &self,
        request: &VariantRequest<'_>,
    ) -> GenerationResult<ArtifactRef>;

    /// Replaces the API key a provider uses for subsequent calls. Returns
    /// `false` when this service does not talk to `provider`.
    fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
        let _ = (provider, key);
        false
    }
}

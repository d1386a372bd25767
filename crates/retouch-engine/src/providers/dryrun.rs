use std::io::Cursor;

use anyhow::{Context, Result};
use image::{ImageFormat, Rgb, RgbImage};
use retouch_contracts::analysis::{
    AnalysisResult, ConsistentElements, SynthesizedDefinition, VariableElement, WatermarkReport,
};
use retouch_contracts::media::{ArtifactRef, ImageData};
use sha2::{Digest, Sha256};

use crate::error::GenerationError;
use crate::service::{GenerationResult, GenerationService, VariantRequest};

const DRYRUN_SIZE: u32 = 64;

/// Offline backend: every image call returns a solid-color PNG whose color
/// is derived from the request text, so identical requests give identical
/// artifacts.
#[derive(Debug, Default, Clone, Copy)]
pub struct DryrunService;

impl DryrunService {
    pub fn new() -> Self {
        Self
    }

    fn render(&self, seed_parts: &[&str]) -> GenerationResult<ArtifactRef> {
        render_png(seed_parts)
            .map(|image| ArtifactRef::from(&image))
            .map_err(|err| GenerationError::from_anyhow(&err))
    }
}

impl GenerationService for DryrunService {
    fn name(&self) -> &str {
        "dryrun"
    }

    fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef> {
        self.render(&["clean", &image.content_hash()])
    }

    fn detect_watermark(&self, _image: &ImageData) -> GenerationResult<WatermarkReport> {
        Ok(WatermarkReport {
            has_watermark: false,
        })
    }

    fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult> {
        let variable = (1..=images.len().max(1))
            .map(|idx| VariableElement {
                label: Some(format!("Shot {idx}")),
                description: format!("angle {idx} of the product on a plain backdrop"),
            })
            .collect();
        Ok(AnalysisResult {
            consistent: ConsistentElements::Synthesized(SynthesizedDefinition {
                subject_summary: Some("product photographed in studio".to_string()),
                core_details: Some("materials and colors as in the references".to_string()),
                human_features: None,
                scene_atmosphere: Some("neutral seamless backdrop".to_string()),
                visual_quality: Some("sharp focus, soft even lighting".to_string()),
            }),
            variable,
        })
    }

    fn generate_master_image(
        &self,
        images: &[ArtifactRef],
        consistent_prompt: &str,
        variable_prompt: &str,
    ) -> GenerationResult<ArtifactRef> {
        let count = images.len().to_string();
        self.render(&["master", &count, consistent_prompt, variable_prompt])
    }

    fn modify_master_image(
        &self,
        _images: &[ArtifactRef],
        master: &ArtifactRef,
        consistent_prompt: &str,
        variable_prompt: &str,
        instruction: &str,
    ) -> GenerationResult<ArtifactRef> {
        self.render(&[
            "modify",
            master.as_str(),
            consistent_prompt,
            variable_prompt,
            instruction,
        ])
    }

    fn generate_single_from_master(
        &self,
        request: &VariantRequest<'_>,
    ) -> GenerationResult<ArtifactRef> {
        let retry = if request.is_regeneration { "retry" } else { "first" };
        let reference = request.reference.map(ArtifactRef::as_str).unwrap_or("");
        self.render(&[
            "variant",
            request.master.as_str(),
            request.consistent_prompt,
            request.variable_prompt,
            retry,
            reference,
        ])
    }
}

fn render_png(seed_parts: &[&str]) -> Result<ImageData> {
    let (r, g, b) = color_from_parts(seed_parts);
    let mut image = RgbImage::new(DRYRUN_SIZE, DRYRUN_SIZE);
    for pixel in image.pixels_mut() {
        *pixel = Rgb([r, g, b]);
    }
    let mut bytes = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
        .context("failed to encode dryrun image")?;
    Ok(ImageData::new(bytes, "image/png"))
}

fn color_from_parts(parts: &[&str]) -> (u8, u8, u8) {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    (digest[0], digest[1], digest[2])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_requests_render_identical_pngs() -> anyhow::Result<()> {
        let service = DryrunService::new();
        let refs = [ArtifactRef::new("ref-a")];
        let first = service.generate_master_image(&refs, "mug", "desk")?;
        let again = service.generate_master_image(&refs, "mug", "desk")?;
        let other = service.generate_master_image(&refs, "mug", "shelf")?;
        assert_eq!(first, again);
        assert_ne!(first, other);

        let decoded = ImageData::from_data_uri(first.as_str())?;
        assert_eq!(decoded.mime_type, "image/png");
        let png = image::load_from_memory(&decoded.bytes)?;
        assert_eq!(png.width(), DRYRUN_SIZE);
        Ok(())
    }

    #[test]
    fn analysis_yields_one_element_per_image() -> anyhow::Result<()> {
        let service = DryrunService::new();
        let refs = [ArtifactRef::new("a"), ArtifactRef::new("b")];
        let analysis = service.analyze_images(&refs)?;
        assert!(analysis.is_synthesized());
        assert_eq!(analysis.variable.len(), 2);
        assert_eq!(service.analyze_images(&[])?.variable.len(), 1);
        Ok(())
    }

    #[test]
    fn regeneration_changes_variant_output() -> anyhow::Result<()> {
        let service = DryrunService::new();
        let master = ArtifactRef::new("master");
        let mut request = VariantRequest {
            images: &[],
            master: &master,
            consistent_prompt: "mug",
            variable_prompt: "top view",
            is_regeneration: false,
            reference: None,
        };
        let first = service.generate_single_from_master(&request)?;
        request.is_regeneration = true;
        assert_ne!(first, service.generate_single_from_master(&request)?);
        Ok(())
    }
}

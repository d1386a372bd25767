use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use retouch_contracts::analysis::{AnalysisResult, WatermarkReport};
use retouch_contracts::instructions::parse_directive;
use retouch_contracts::media::{ArtifactRef, ImageData};
use serde_json::{json, Map, Value};

use super::{load_artifact, response_json_or_error, send_with_transport_retries};
use crate::config::{ServiceConfig, SharedCredential};
use crate::error::GenerationError;
use crate::prompts;
use crate::service::{GenerationResult, GenerationService, VariantRequest};

/// Client for Replicate model predictions. Edit models take a single
/// `input_image`; vision models (llava) take `image` and stream text tokens.
pub struct ReplicateService {
    api_base: String,
    model: String,
    api_token: SharedCredential,
    http: HttpClient,
    timeout_s: f64,
    transport_retries: usize,
    retry_backoff_s: f64,
    poll_interval_s: f64,
    poll_timeout_s: f64,
}

impl ReplicateService {
    pub fn new(config: &ServiceConfig, model: &str) -> Self {
        Self {
            api_base: config.replicate_api_base.trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            api_token: config.replicate_api_token.clone(),
            http: HttpClient::new(),
            timeout_s: config.request_timeout_s,
            transport_retries: config.transport_retries,
            retry_backoff_s: config.retry_backoff_s,
            poll_interval_s: config.poll_interval_s,
            poll_timeout_s: config.poll_timeout_s,
        }
    }

    fn predictions_endpoint(&self) -> String {
        format!("{}/models/{}/predictions", self.api_base, self.model)
    }

    /// Remote URLs and data URIs are passed through; local paths are inlined.
    fn input_uri(&self, artifact: &ArtifactRef) -> Result<String> {
        if artifact.is_remote() || artifact.is_data_uri() {
            return Ok(artifact.as_str().to_string());
        }
        Ok(load_artifact(&self.http, artifact)?.to_data_uri())
    }

    fn run_prediction(&self, input: Map<String, Value>) -> Result<Value> {
        let Some(api_token) = self.api_token.current() else {
            bail!("REPLICATE_API_TOKEN not set");
        };
        let endpoint = self.predictions_endpoint();
        let payload = json!({ "input": Value::Object(input) });
        let response = send_with_transport_retries(
            "Replicate",
            || {
                self.http
                    .post(&endpoint)
                    .bearer_auth(&api_token)
                    .header("Prefer", "wait")
                    .timeout(Duration::from_secs_f64(self.timeout_s))
                    .json(&payload)
            },
            self.transport_retries,
            self.retry_backoff_s,
        )?;
        let prediction = response_json_or_error("Replicate", response)?;
        match prediction_status(&prediction).as_str() {
            "succeeded" => Ok(prediction),
            "starting" | "processing" => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow!("Replicate prediction missing poll URL"))?;
                self.poll_prediction(poll_url, &api_token)
            }
            _ => bail!("Replicate prediction failed: {}", prediction_error(&prediction)),
        }
    }

    fn poll_prediction(&self, poll_url: &str, api_token: &str) -> Result<Value> {
        let started = Instant::now();
        loop {
            let response = self
                .http
                .get(poll_url)
                .bearer_auth(api_token)
                .send()
                .with_context(|| format!("Replicate poll request failed ({poll_url})"))?;
            let payload = response_json_or_error("Replicate poll", response)?;
            match prediction_status(&payload).as_str() {
                "succeeded" => return Ok(payload),
                "failed" | "canceled" => {
                    bail!("Replicate prediction failed: {}", prediction_error(&payload))
                }
                _ => {}
            }
            if started.elapsed().as_secs_f64() >= self.poll_timeout_s {
                bail!(
                    "Replicate polling timed out after {:.1}s",
                    self.poll_timeout_s
                );
            }
            thread::sleep(Duration::from_secs_f64(self.poll_interval_s));
        }
    }

    fn edit(
        &self,
        image: &ArtifactRef,
        prompt: String,
        strength: Option<f32>,
    ) -> Result<ArtifactRef> {
        let mut input = Map::new();
        input.insert("prompt".to_string(), Value::String(prompt));
        input.insert("input_image".to_string(), Value::String(self.input_uri(image)?));
        input.insert("output_format".to_string(), Value::String("png".to_string()));
        if let Some(strength) = strength {
            input.insert("prompt_strength".to_string(), json!(strength));
        }
        let prediction = self.run_prediction(input)?;
        let mut urls = Vec::new();
        if let Some(output) = prediction.get("output") {
            extract_output_urls(output, &mut urls);
        }
        urls.into_iter()
            .next()
            .map(ArtifactRef::new)
            .ok_or_else(|| anyhow!("Replicate response returned no image URLs"))
    }

    fn describe(&self, image: &ArtifactRef, prompt: String) -> Result<String> {
        let mut input = Map::new();
        input.insert("image".to_string(), Value::String(self.input_uri(image)?));
        input.insert("prompt".to_string(), Value::String(prompt));
        let prediction = self.run_prediction(input)?;
        let text = output_text(prediction.get("output").unwrap_or(&Value::Null));
        if text.trim().is_empty() {
            bail!("Replicate response returned no text");
        }
        Ok(text)
    }
}

impl GenerationService for ReplicateService {
    fn name(&self) -> &str {
        "replicate"
    }

    fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef> {
        self.edit(
            &ArtifactRef::from(image),
            prompts::WATERMARK_REMOVAL_PROMPT.to_string(),
            None,
        )
        .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn detect_watermark(&self, image: &ImageData) -> GenerationResult<WatermarkReport> {
        self.describe(
            &ArtifactRef::from(image),
            prompts::WATERMARK_DETECTION_PROMPT.to_string(),
        )
        .map(|text| WatermarkReport::parse_text(&text))
        .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult> {
        let run = || -> Result<AnalysisResult> {
            let first = images
                .first()
                .ok_or_else(|| anyhow!("no images to analyze"))?;
            // Single-image model: the prompt still describes the whole set.
            let text = self.describe(first, prompts::analysis_prompt(images.len()))?;
            AnalysisResult::parse_text(&text)
        };
        run().map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn generate_master_image(
        &self,
        images: &[ArtifactRef],
        consistent_prompt: &str,
        variable_prompt: &str,
    ) -> GenerationResult<ArtifactRef> {
        let run = || -> Result<ArtifactRef> {
            let first = images
                .first()
                .ok_or_else(|| anyhow!("no reference images"))?;
            self.edit(
                first,
                prompts::master_prompt(consistent_prompt, variable_prompt),
                None,
            )
        };
        run().map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn modify_master_image(
        &self,
        _images: &[ArtifactRef],
        master: &ArtifactRef,
        consistent_prompt: &str,
        variable_prompt: &str,
        instruction: &str,
    ) -> GenerationResult<ArtifactRef> {
        let directive = parse_directive(instruction);
        self.edit(
            master,
            prompts::modification_prompt(consistent_prompt, variable_prompt, &directive),
            directive.strength,
        )
        .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn generate_single_from_master(
        &self,
        request: &VariantRequest<'_>,
    ) -> GenerationResult<ArtifactRef> {
        // Kontext models accept one image, so a composition reference cannot
        // ride along; the prompt alone carries the shot.
        self.edit(
            request.master,
            prompts::variant_prompt(
                request.consistent_prompt,
                request.variable_prompt,
                request.is_regeneration,
                false,
            ),
            None,
        )
        .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
        if provider != "replicate" {
            return false;
        }
        self.api_token.rotate(key);
        true
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_error(prediction: &Value) -> String {
    prediction
        .get("error")
        .and_then(Value::as_str)
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("status '{}'", prediction_status(prediction)))
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            for key in ["url", "urls", "output"] {
                if let Some(inner) = obj.get(key) {
                    extract_output_urls(inner, out);
                }
            }
        }
        _ => {}
    }
}

/// Vision models stream their answer as an array of tokens.
fn output_text(output: &Value) -> String {
    match output {
        Value::String(text) => text.clone(),
        Value::Array(tokens) => tokens
            .iter()
            .filter_map(Value::as_str)
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_targets_model_predictions() {
        let service =
            ReplicateService::new(&ServiceConfig::default(), "black-forest-labs/flux-kontext-pro");
        assert_eq!(
            service.predictions_endpoint(),
            "https://api.replicate.com/v1/models/black-forest-labs/flux-kontext-pro/predictions"
        );
    }

    #[test]
    fn collects_unique_http_urls_from_nested_output() {
        let mut urls = Vec::new();
        extract_output_urls(
            &json!([
                "https://cdn.example/a.png",
                { "url": "https://cdn.example/a.png" },
                { "output": ["https://cdn.example/b.png", "not-a-url"] },
            ]),
            &mut urls,
        );
        assert_eq!(urls, vec!["https://cdn.example/a.png", "https://cdn.example/b.png"]);
    }

    #[test]
    fn joins_streamed_tokens() {
        assert_eq!(
            output_text(&json!(["{\"has_", "watermark\": ", "false}"])),
            "{\"has_watermark\": false}"
        );
        assert_eq!(output_text(&json!(null)), "");
    }

    #[test]
    fn prediction_error_prefers_message() {
        assert_eq!(
            prediction_error(&json!({ "status": "failed", "error": "NSFW content" })),
            "NSFW content"
        );
        assert_eq!(prediction_error(&json!({ "status": "canceled" })), "status 'canceled'");
    }

    #[test]
    fn missing_token_is_reported_before_any_request() {
        let service =
            ReplicateService::new(&ServiceConfig::default(), "black-forest-labs/flux-kontext-pro");
        let image = ImageData::new(vec![1, 2], "image/png");
        let err = service.remove_watermark(&image).unwrap_err();
        assert!(err.message.contains("REPLICATE_API_TOKEN"));
    }
}

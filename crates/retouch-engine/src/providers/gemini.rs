use std::time::Duration;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
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

/// Client for the Gemini `generateContent` endpoint. Image edits request the
/// IMAGE modality and return inline data; analysis calls return JSON text.
pub struct GeminiService {
    api_base: String,
    model: String,
    api_key: SharedCredential,
    http: HttpClient,
    timeout_s: f64,
    transport_retries: usize,
    retry_backoff_s: f64,
}

impl GeminiService {
    pub fn new(config: &ServiceConfig, model: &str) -> Self {
        Self {
            api_base: config.gemini_api_base.trim_end_matches('/').to_string(),
            model: model.trim().to_string(),
            api_key: config.gemini_api_key.clone(),
            http: HttpClient::new(),
            timeout_s: config.request_timeout_s,
            transport_retries: config.transport_retries,
            retry_backoff_s: config.retry_backoff_s,
        }
    }

    fn endpoint(&self) -> String {
        let model_path = if self.model.starts_with("models/") {
            self.model.clone()
        } else {
            format!("models/{}", self.model)
        };
        format!("{}/{}:generateContent", self.api_base, model_path)
    }

    fn image_part(&self, artifact: &ArtifactRef) -> Result<Value> {
        let image = load_artifact(&self.http, artifact)
            .with_context(|| format!("failed loading input image {artifact}"))?;
        Ok(inline_part(&image))
    }

    fn generate_content(&self, parts: Vec<Value>, want_image: bool) -> Result<Value> {
        let Some(api_key) = self.api_key.current() else {
            bail!("GEMINI_API_KEY or GOOGLE_API_KEY not set");
        };
        let mut generation_config = Map::new();
        if want_image {
            generation_config.insert(
                "responseModalities".to_string(),
                json!(["IMAGE", "TEXT"]),
            );
        } else {
            generation_config.insert(
                "responseMimeType".to_string(),
                Value::String("application/json".to_string()),
            );
        }
        let payload = json!({
            "contents": [{ "role": "user", "parts": parts }],
            "generationConfig": Value::Object(generation_config),
        });

        let endpoint = self.endpoint();
        let response = send_with_transport_retries(
            "Gemini",
            || {
                self.http
                    .post(&endpoint)
                    .query(&[("key", api_key.as_str())])
                    .timeout(Duration::from_secs_f64(self.timeout_s))
                    .json(&payload)
            },
            self.transport_retries,
            self.retry_backoff_s,
        )?;
        response_json_or_error("Gemini", response)
    }

    fn image_call(&self, parts: Vec<Value>) -> Result<ArtifactRef> {
        let payload = self.generate_content(parts, true)?;
        let Some(image) = extract_first_image(&payload)? else {
            let reason = block_reason(&payload)
                .unwrap_or_else(|| "Gemini response contained no image".to_string());
            bail!("{reason}");
        };
        Ok(ArtifactRef::from(&image))
    }

    fn text_call(&self, parts: Vec<Value>) -> Result<String> {
        let payload = self.generate_content(parts, false)?;
        let text = extract_text(&payload);
        if text.trim().is_empty() {
            let reason = block_reason(&payload)
                .unwrap_or_else(|| "Gemini response contained no text".to_string());
            bail!("{reason}");
        }
        Ok(text)
    }

    fn reference_parts(&self, images: &[ArtifactRef]) -> Result<Vec<Value>> {
        images.iter().map(|image| self.image_part(image)).collect()
    }
}

impl GenerationService for GeminiService {
    fn name(&self) -> &str {
        "gemini"
    }

    fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef> {
        let parts = vec![
            inline_part(image),
            json!({ "text": prompts::WATERMARK_REMOVAL_PROMPT }),
        ];
        self.image_call(parts)
            .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn detect_watermark(&self, image: &ImageData) -> GenerationResult<WatermarkReport> {
        let parts = vec![
            inline_part(image),
            json!({ "text": prompts::WATERMARK_DETECTION_PROMPT }),
        ];
        self.text_call(parts)
            .map(|text| WatermarkReport::parse_text(&text))
            .map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult> {
        let run = || -> Result<AnalysisResult> {
            let mut parts = self.reference_parts(images)?;
            parts.push(json!({ "text": prompts::analysis_prompt(images.len()) }));
            let text = self.text_call(parts)?;
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
            let mut parts = self.reference_parts(images)?;
            parts.push(json!({
                "text": prompts::master_prompt(consistent_prompt, variable_prompt),
            }));
            self.image_call(parts)
        };
        run().map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn modify_master_image(
        &self,
        images: &[ArtifactRef],
        master: &ArtifactRef,
        consistent_prompt: &str,
        variable_prompt: &str,
        instruction: &str,
    ) -> GenerationResult<ArtifactRef> {
        let run = || -> Result<ArtifactRef> {
            let directive = parse_directive(instruction);
            let mut parts = vec![self.image_part(master)?];
            parts.extend(self.reference_parts(images)?);
            parts.push(json!({
                "text": prompts::modification_prompt(
                    consistent_prompt,
                    variable_prompt,
                    &directive,
                ),
            }));
            self.image_call(parts)
        };
        run().map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn generate_single_from_master(
        &self,
        request: &VariantRequest<'_>,
    ) -> GenerationResult<ArtifactRef> {
        let run = || -> Result<ArtifactRef> {
            let mut parts = vec![self.image_part(request.master)?];
            parts.extend(self.reference_parts(request.images)?);
            if let Some(reference) = request.reference {
                parts.push(self.image_part(reference)?);
            }
            parts.push(json!({
                "text": prompts::variant_prompt(
                    request.consistent_prompt,
                    request.variable_prompt,
                    request.is_regeneration,
                    request.reference.is_some(),
                ),
            }));
            self.image_call(parts)
        };
        run().map_err(|err| GenerationError::from_anyhow(&err))
    }

    fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
        if provider != "gemini" {
            return false;
        }
        self.api_key.rotate(key);
        true
    }
}

fn inline_part(image: &ImageData) -> Value {
    json!({
        "inlineData": {
            "mimeType": image.mime_type,
            "data": image.to_base64(),
        }
    })
}

fn candidate_parts(payload: &Value) -> Vec<Value> {
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(|candidate| {
            candidate
                .get("content")
                .and_then(|content| content.get("parts"))
                .and_then(Value::as_array)
        })
        .flatten()
        .cloned()
        .collect()
}

fn extract_first_image(payload: &Value) -> Result<Option<ImageData>> {
    for part in candidate_parts(payload) {
        let Some(inline) = part
            .get("inlineData")
            .or_else(|| part.get("inline_data"))
            .and_then(Value::as_object)
        else {
            continue;
        };
        let data = inline
            .get("data")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if data.is_empty() {
            continue;
        }
        let bytes = BASE64
            .decode(data.as_bytes())
            .context("Gemini image base64 decode failed")?;
        let mime_type = inline
            .get("mimeType")
            .or_else(|| inline.get("mime_type"))
            .and_then(Value::as_str)
            .unwrap_or("image/png");
        return Ok(Some(ImageData::new(bytes, mime_type)));
    }
    Ok(None)
}

fn extract_text(payload: &Value) -> String {
    candidate_parts(payload)
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("")
}

fn block_reason(payload: &Value) -> Option<String> {
    if let Some(reason) = payload
        .get("promptFeedback")
        .and_then(|feedback| feedback.get("blockReason"))
        .and_then(Value::as_str)
    {
        return Some(format!("Gemini blocked the request ({reason})"));
    }
    payload
        .get("candidates")
        .and_then(Value::as_array)
        .and_then(|rows| rows.first())
        .and_then(|candidate| candidate.get("finishReason"))
        .and_then(Value::as_str)
        .filter(|reason| *reason != "STOP")
        .map(|reason| format!("Gemini finished without output ({reason})"))
}

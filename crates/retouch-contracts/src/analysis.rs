//! Structured image-analysis results.
//!
//! Vision models answer with one of two JSON shapes. The newer one nests a
//! `synthesized_definition` object under the consistent elements; the legacy
//! one lists `primary_subject`, `scene_environment` and `image_quality`
//! directly. Which shape a payload has is decided once, here, by the presence
//! of the synthesized definition object.

use anyhow::{bail, Context, Result};
use serde_json::{Map, Value};

/// Literal some models emit instead of omitting an optional field.
pub const NULL_SENTINEL: &str = "null";

#[derive(Debug, Clone, PartialEq, Default)]
pub struct SynthesizedDefinition {
    pub subject_summary: Option<String>,
    pub core_details: Option<String>,
    pub human_features: Option<String>,
    pub scene_atmosphere: Option<String>,
    pub visual_quality: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct LegacyConsistent {
    pub primary_subject: Option<String>,
    pub scene_environment: Option<String>,
    pub image_quality: Option<String>,
}

/// Elements shared by every output of a series.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsistentElements {
    Synthesized(SynthesizedDefinition),
    Legacy(LegacyConsistent),
}

/// One per-output element; becomes the prompt of one variable-prompt unit.
#[derive(Debug, Clone, PartialEq)]
pub struct VariableElement {
    pub label: Option<String>,
    pub description: String,
}

impl VariableElement {
    pub fn prompt_text(&self) -> String {
        match self.label.as_deref() {
            Some(label) if !label.is_empty() => format!("{label}: {}", self.description),
            _ => self.description.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisResult {
    pub consistent: ConsistentElements,
    pub variable: Vec<VariableElement>,
}

impl AnalysisResult {
    /// Parses raw model output, tolerating markdown code fences and prose
    /// around the JSON object.
    pub fn parse_text(text: &str) -> Result<Self> {
        let json = extract_json_object(text).context("analysis response contained no JSON")?;
        let value: Value =
            serde_json::from_str(json).context("analysis response JSON is malformed")?;
        Self::from_value(&value)
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        let Some(root) = value.as_object() else {
            bail!("analysis payload must be a JSON object");
        };
        let consistent_obj = lookup(root, &["consistent_elements", "consistentElements"])
            .and_then(Value::as_object)
            .unwrap_or(root);

        let synthesized = lookup(
            consistent_obj,
            &["synthesized_definition", "synthesizedDefinition"],
        )
        .or_else(|| lookup(root, &["synthesized_definition", "synthesizedDefinition"]))
        .and_then(Value::as_object);

        let consistent = match synthesized {
            Some(def) => ConsistentElements::Synthesized(SynthesizedDefinition {
                subject_summary: text_field(def, &["subject_summary", "subjectSummary"]),
                core_details: text_field(def, &["core_details", "coreDetails"]),
                human_features: text_field(def, &["human_features", "humanFeatures"]),
                scene_atmosphere: text_field(def, &["scene_atmosphere", "sceneAtmosphere"]),
                visual_quality: text_field(def, &["visual_quality", "visualQuality"]),
            }),
            None => ConsistentElements::Legacy(LegacyConsistent {
                primary_subject: text_field(consistent_obj, &["primary_subject", "primarySubject"]),
                scene_environment: text_field(
                    consistent_obj,
                    &["scene_environment", "sceneEnvironment"],
                ),
                image_quality: text_field(consistent_obj, &["image_quality", "imageQuality"]),
            }),
        };

        let variable = lookup(root, &["variable_elements", "variableElements"])
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(variable_element).collect())
            .unwrap_or_default();

        Ok(Self {
            consistent,
            variable,
        })
    }

    pub fn is_synthesized(&self) -> bool {
        matches!(self.consistent, ConsistentElements::Synthesized(_))
    }
}

/// Result of a watermark detection call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatermarkReport {
    pub has_watermark: bool,
}

impl WatermarkReport {
    pub fn parse_text(text: &str) -> Self {
        if let Some(flag) = extract_json_object(text)
            .and_then(|json| serde_json::from_str::<Value>(json).ok())
            .and_then(|value| {
                value
                    .get("has_watermark")
                    .or_else(|| value.get("hasWatermark"))
                    .and_then(Value::as_bool)
            })
        {
            return Self {
                has_watermark: flag,
            };
        }
        let lowered = text.trim().to_ascii_lowercase();
        Self {
            has_watermark: lowered.starts_with("yes") || lowered.starts_with("true"),
        }
    }
}

fn variable_element(value: &Value) -> Option<VariableElement> {
    match value {
        Value::String(text) => clean(text).map(|description| VariableElement {
            label: None,
            description,
        }),
        Value::Object(obj) => {
            let description = text_field(
                obj,
                &["description", "details", "prompt", "variation", "value"],
            )?;
            Some(VariableElement {
                label: text_field(obj, &["element", "name", "label"]),
                description,
            })
        }
        _ => None,
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a Value> {
    keys.iter().find_map(|key| obj.get(*key))
}

fn text_field(obj: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    match lookup(obj, keys)? {
        Value::String(text) => clean(text),
        Value::Array(rows) => {
            let joined = rows
                .iter()
                .filter_map(Value::as_str)
                .filter_map(clean)
                .collect::<Vec<String>>()
                .join(", ");
            clean(&joined)
        }
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

fn clean(text: &str) -> Option<String> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(NULL_SENTINEL) {
        return None;
    }
    Some(trimmed.to_string())
}

fn extract_json_object(text: &str) -> Option<&str> {
    let start = text.find('{')?;
    let end = text.rfind('}')?;
    if end < start {
        return None;
    }
    Some(&text[start..=end])
}

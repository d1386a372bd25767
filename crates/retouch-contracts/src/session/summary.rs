use std::path::Path;

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub unit_id: String,
    pub prompt: String,
    pub artifact: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitOutcome {
    Generated,
    Failed,
    Pending,
}

impl UnitSummary {
    /// The latest attempt decides: a unit whose regeneration failed counts as
    /// failed even though it still shows its earlier artifact.
    pub fn outcome(&self) -> UnitOutcome {
        match (&self.error, &self.artifact) {
            (Some(_), _) => UnitOutcome::Failed,
            (None, Some(_)) => UnitOutcome::Generated,
            (None, None) => UnitOutcome::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub started_at: String,
    pub finished_at: String,
    pub reference_images: u64,
    pub failed_reference_images: u64,
    pub consistent_prompt: String,
    pub master_artifact: Option<String>,
    pub master_stale: bool,
    pub units: Vec<UnitSummary>,
}

impl SessionSummary {
    /// Units whose latest attempt produced an artifact. Every unit lands in
    /// at most one of `generated_count` and `failed_count`.
    pub fn generated_count(&self) -> u64 {
        self.count(UnitOutcome::Generated)
    }

    pub fn failed_count(&self) -> u64 {
        self.count(UnitOutcome::Failed)
    }

    fn count(&self, outcome: UnitOutcome) -> u64 {
        self.units
            .iter()
            .filter(|unit| unit.outcome() == outcome)
            .count() as u64
    }
}

pub fn write_summary(
    path: &Path,
    summary: &SessionSummary,
    extra: Option<&Map<String, Value>>,
) -> anyhow::Result<()> {
    let mut payload = match serde_json::to_value(summary)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert(
        "generated_units".to_string(),
        Value::Number(summary.generated_count().into()),
    );
    payload.insert(
        "failed_units".to_string(),
        Value::Number(summary.failed_count().into()),
    );
    payload.insert("ts".to_string(), Value::String(now_utc_iso()));
    if let Some(extra) = extra {
        for (key, value) in extra {
            payload.insert(key.clone(), value.clone());
        }
    }

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, serde_json::to_string_pretty(&Value::Object(payload))?)?;
    Ok(())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Every event a studio session writes to `events.jsonl`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    SessionStarted,
    SessionFinished,
    ReferenceImagesAdded,
    ReferenceImageRemoved,
    ReferenceImageReady,
    ReferenceImageFailed,
    StaleCompletionDropped,
    UnitAdded,
    UnitRemoved,
    UnitReferenceAttached,
    UnitAnalysisStarted,
    UnitAnalysisApplied,
    UnitAnalysisFailed,
    AnalysisStarted,
    AnalysisSkipped,
    AnalysisApplied,
    AnalysisFailed,
    MasterRequested,
    MasterReady,
    MasterFailed,
    MasterStale,
    BatchStarted,
    BatchFinished,
    VariantRequested,
    VariantReady,
    VariantFailed,
    KbEntrySelected,
    KbEntrySaved,
    ApiKeyRotated,
}

impl EventKind {
    pub const ALL: [EventKind; 29] = [
        Self::SessionStarted,
        Self::SessionFinished,
        Self::ReferenceImagesAdded,
        Self::ReferenceImageRemoved,
        Self::ReferenceImageReady,
        Self::ReferenceImageFailed,
        Self::StaleCompletionDropped,
        Self::UnitAdded,
        Self::UnitRemoved,
        Self::UnitReferenceAttached,
        Self::UnitAnalysisStarted,
        Self::UnitAnalysisApplied,
        Self::UnitAnalysisFailed,
        Self::AnalysisStarted,
        Self::AnalysisSkipped,
        Self::AnalysisApplied,
        Self::AnalysisFailed,
        Self::MasterRequested,
        Self::MasterReady,
        Self::MasterFailed,
        Self::MasterStale,
        Self::BatchStarted,
        Self::BatchFinished,
        Self::VariantRequested,
        Self::VariantReady,
        Self::VariantFailed,
        Self::KbEntrySelected,
        Self::KbEntrySaved,
        Self::ApiKeyRotated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::SessionStarted => "session_started",
            Self::SessionFinished => "session_finished",
            Self::ReferenceImagesAdded => "reference_images_added",
            Self::ReferenceImageRemoved => "reference_image_removed",
            Self::ReferenceImageReady => "reference_image_ready",
            Self::ReferenceImageFailed => "reference_image_failed",
            Self::StaleCompletionDropped => "stale_completion_dropped",
            Self::UnitAdded => "unit_added",
            Self::UnitRemoved => "unit_removed",
            Self::UnitReferenceAttached => "unit_reference_attached",
            Self::UnitAnalysisStarted => "unit_analysis_started",
            Self::UnitAnalysisApplied => "unit_analysis_applied",
            Self::UnitAnalysisFailed => "unit_analysis_failed",
            Self::AnalysisStarted => "analysis_started",
            Self::AnalysisSkipped => "analysis_skipped",
            Self::AnalysisApplied => "analysis_applied",
            Self::AnalysisFailed => "analysis_failed",
            Self::MasterRequested => "master_requested",
            Self::MasterReady => "master_ready",
            Self::MasterFailed => "master_failed",
            Self::MasterStale => "master_stale",
            Self::BatchStarted => "batch_started",
            Self::BatchFinished => "batch_finished",
            Self::VariantRequested => "variant_requested",
            Self::VariantReady => "variant_ready",
            Self::VariantFailed => "variant_failed",
            Self::KbEntrySelected => "kb_entry_selected",
            Self::KbEntrySaved => "kb_entry_saved",
            Self::ApiKeyRotated => "api_key_rotated",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> anyhow::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|kind| kind.as_str() == raw)
            .ok_or_else(|| anyhow::anyhow!("unknown event type '{raw}'"))
    }
}

/// Append-only writer for a studio session's `events.jsonl`.
///
/// Each line is one compact JSON object carrying `type`, `session_id`, `seq`
/// and `ts`. Object payloads are merged in beside them but cannot replace
/// them; any other non-null payload is stored under `data`.
///
/// Clones share one sequence counter and file handle lock, so `seq` grows by
/// one per line in file order even with several worker threads logging.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<EventWriterInner>,
}

#[derive(Debug)]
struct EventWriterInner {
    path: PathBuf,
    session_id: String,
    next_seq: Mutex<u64>,
}

const RESERVED_KEYS: [&str; 4] = ["type", "session_id", "seq", "ts"];

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, session_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(EventWriterInner {
                path: path.into(),
                session_id: session_id.into(),
                next_seq: Mutex::new(0),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn session_id(&self) -> &str {
        &self.inner.session_id
    }

    pub fn emit(&self, kind: EventKind, payload: Value) -> anyhow::Result<Value> {
        let mut extra = Map::new();
        match payload {
            Value::Null => {}
            Value::Object(fields) => {
                extra = fields;
                for key in RESERVED_KEYS {
                    extra.remove(key);
                }
            }
            other => {
                extra.insert("data".to_string(), other);
            }
        }

        if let Some(parent) = self.inner.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;
        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(kind.as_str().to_string()));
        event.insert(
            "session_id".to_string(),
            Value::String(self.inner.session_id.clone()),
        );
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        event.extend(extra);

        let mut line = serde_json::to_string(&event)?;
        line.push('\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?;
        file.write_all(line.as_bytes())?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }

    /// Reads back every recorded event kind in file order. Lines that do not
    /// parse or name an unknown type are skipped.
    pub fn recorded(&self) -> anyhow::Result<Vec<EventKind>> {
        let raw = match std::fs::read_to_string(&self.inner.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };
        Ok(raw
            .lines()
            .filter_map(|line| serde_json::from_str::<Value>(line).ok())
            .filter_map(|row| row.get("type").and_then(Value::as_str)?.parse().ok())
            .collect())
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use serde_json::{json, Value};
use uuid::Uuid;

use super::{KnowledgeBase, KnowledgeBaseEntry, NewEntry};
use crate::media::ImageData;

pub const DEFAULT_TRASH_RETENTION_DAYS: i64 = 30;

const STORE_FILE: &str = "knowledge_base.json";
const IMAGES_DIR: &str = "images";
const SCHEMA_VERSION: u64 = 1;

/// Knowledge base kept as one JSON document per user:
///
/// ```text
/// <root>/<user>/knowledge_base.json
/// <root>/<user>/images/<content-hash>.<ext>
/// ```
///
/// Every call re-reads the document so several processes can share a root.
#[derive(Debug)]
pub struct JsonKnowledgeBase {
    dir: PathBuf,
    retention: Duration,
    lock: Mutex<()>,
}

impl JsonKnowledgeBase {
    pub fn new(root: impl AsRef<Path>, user: &str) -> Self {
        Self {
            dir: root.as_ref().join(sanitize_user(user)),
            retention: Duration::days(DEFAULT_TRASH_RETENTION_DAYS),
            lock: Mutex::new(()),
        }
    }

    pub fn with_retention_days(mut self, days: i64) -> Self {
        self.retention = Duration::days(days.max(0));
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn image_path(&self, entry: &KnowledgeBaseEntry) -> Option<PathBuf> {
        entry
            .source_image
            .as_deref()
            .map(|relative| self.dir.join(relative))
    }

    /// Purges soft-deleted entries whose deletion is older than the retention
    /// window, measured from `now`.
    pub fn purge_expired_trash_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let retention = self.retention;
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|entry| match entry.deleted_at.as_deref() {
                Some(deleted_at) => match DateTime::parse_from_rfc3339(deleted_at) {
                    Ok(stamp) => now.signed_duration_since(stamp.with_timezone(&Utc)) < retention,
                    Err(_) => true,
                },
                None => true,
            });
            before - entries.len()
        })
    }

    fn store_path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    fn read_entries(&self) -> Result<Vec<KnowledgeBaseEntry>> {
        let path = self.store_path();
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => {
                return Err(err).with_context(|| format!("failed reading {}", path.display()))
            }
        };
        let payload: Value = serde_json::from_str(&raw)
            .with_context(|| format!("{} is not valid JSON", path.display()))?;
        let mut entries = Vec::new();
        if let Some(rows) = payload.get("entries").and_then(Value::as_array) {
            for (idx, row) in rows.iter().enumerate() {
                let entry = serde_json::from_value::<KnowledgeBaseEntry>(row.clone())
                    .with_context(|| format!("entry {idx} in {} is malformed", path.display()))?;
                entries.push(entry);
            }
        }
        Ok(entries)
    }

    fn write_entries(&self, entries: &[KnowledgeBaseEntry]) -> Result<()> {
        std::fs::create_dir_all(&self.dir)
            .with_context(|| format!("failed creating {}", self.dir.display()))?;
        let payload = json!({
            "schema_version": SCHEMA_VERSION,
            "entries": entries,
        });
        let path = self.store_path();
        std::fs::write(&path, serde_json::to_string_pretty(&payload)?)
            .with_context(|| format!("failed writing {}", path.display()))?;
        Ok(())
    }

    fn mutate<T>(&self, apply: impl FnOnce(&mut Vec<KnowledgeBaseEntry>) -> T) -> Result<T> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("knowledge base lock poisoned"))?;
        let mut entries = self.read_entries()?;
        let before: HashSet<String> = entries
            .iter()
            .filter_map(|entry| entry.source_image.clone())
            .collect();
        let out = apply(&mut entries);
        self.write_entries(&entries)?;

        let after: HashSet<String> = entries
            .iter()
            .filter_map(|entry| entry.source_image.clone())
            .collect();
        for orphan in before.difference(&after) {
            let _ = std::fs::remove_file(self.dir.join(orphan));
        }
        Ok(out)
    }

    fn save_image(&self, image: &ImageData) -> Result<String> {
        let relative = format!("{IMAGES_DIR}/{}.{}", image.content_hash(), image.extension());
        let path = self.dir.join(&relative);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        if !path.exists() {
            std::fs::write(&path, &image.bytes)
                .with_context(|| format!("failed writing {}", path.display()))?;
        }
        Ok(relative)
    }
}

impl KnowledgeBase for JsonKnowledgeBase {
    fn list(&self, include_deleted: bool) -> Result<Vec<KnowledgeBaseEntry>> {
        let mut entries = self.read_entries()?;
        if !include_deleted {
            entries.retain(|entry| !entry.is_deleted());
        }
        Ok(entries)
    }

    fn increment_usage(&self, id: &str) -> Result<u64> {
        let count = self.mutate(|entries| {
            entries
                .iter_mut()
                .find(|entry| entry.id == id && !entry.is_deleted())
                .map(|entry| {
                    entry.usage_count += 1;
                    entry.usage_count
                })
        })?;
        count.with_context(|| format!("knowledge base entry '{id}' not found"))
    }

    fn soft_delete(&self, ids: &[String]) -> Result<usize> {
        let stamp = now_utc_iso();
        self.mutate(|entries| {
            let mut changed = 0;
            for entry in entries.iter_mut() {
                if ids.contains(&entry.id) && !entry.is_deleted() {
                    entry.deleted_at = Some(stamp.clone());
                    changed += 1;
                }
            }
            changed
        })
    }

    fn restore(&self, ids: &[String]) -> Result<usize> {
        self.mutate(|entries| {
            let mut changed = 0;
            for entry in entries.iter_mut() {
                if ids.contains(&entry.id) && entry.is_deleted() {
                    entry.deleted_at = None;
                    changed += 1;
                }
            }
            changed
        })
    }

    fn permanently_delete(&self, ids: &[String]) -> Result<usize> {
        self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|entry| !ids.contains(&entry.id));
            before - entries.len()
        })
    }

    fn purge_expired_trash(&self) -> Result<usize> {
        self.purge_expired_trash_at(Utc::now())
    }

    fn save(
        &self,
        entry: NewEntry,
        source_image: Option<&ImageData>,
    ) -> Result<KnowledgeBaseEntry> {
        let source_image = match source_image {
            Some(image) => Some(self.save_image(image)?),
            None => None,
        };
        let saved = KnowledgeBaseEntry {
            id: Uuid::new_v4().to_string(),
            category: entry.category,
            content: entry.content.trim().to_string(),
            full_prompt: entry.full_prompt,
            source_image,
            usage_count: 0,
            created_at: now_utc_iso(),
            deleted_at: None,
        };
        let snapshot = saved.clone();
        self.mutate(move |entries| entries.push(snapshot))?;
        Ok(saved)
    }
}

fn sanitize_user(user: &str) -> String {
    let cleaned: String = user
        .trim()
        .chars()
        .filter(|ch| ch.is_ascii_alphanumeric() || *ch == '-' || *ch == '_')
        .collect();
    if cleaned.is_empty() {
        "default".to_string()
    } else {
        cleaned
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

mod ranking;
mod store;

use serde::{Deserialize, Serialize};

use crate::media::ImageData;

pub use ranking::{rank_entries, RankedEntry};
pub use store::{JsonKnowledgeBase, DEFAULT_TRASH_RETENTION_DAYS};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KbCategory {
    Subject,
    Scene,
    Lighting,
    Style,
    Composition,
    FullPrompt,
}

impl KbCategory {
    pub const ALL: [KbCategory; 6] = [
        KbCategory::Subject,
        KbCategory::Scene,
        KbCategory::Lighting,
        KbCategory::Style,
        KbCategory::Composition,
        KbCategory::FullPrompt,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            KbCategory::Subject => "subject",
            KbCategory::Scene => "scene",
            KbCategory::Lighting => "lighting",
            KbCategory::Style => "style",
            KbCategory::Composition => "composition",
            KbCategory::FullPrompt => "full_prompt",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase().replace(['-', ' '], "_");
        Self::ALL
            .into_iter()
            .find(|category| category.as_str() == normalized)
    }

    pub fn is_full_prompt(self) -> bool {
        self == KbCategory::FullPrompt
    }
}

/// Consistent and variable text saved together as one reusable prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullPromptPair {
    pub consistent: String,
    pub variable: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KnowledgeBaseEntry {
    pub id: String,
    pub category: KbCategory,
    pub content: String,
    #[serde(default)]
    pub full_prompt: Option<FullPromptPair>,
    #[serde(default)]
    pub source_image: Option<String>,
    #[serde(default)]
    pub usage_count: u64,
    pub created_at: String,
    #[serde(default)]
    pub deleted_at: Option<String>,
}

impl KnowledgeBaseEntry {
    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Fields supplied by the caller when saving; the store assigns the rest.
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
    pub category: KbCategory,
    pub content: String,
    pub full_prompt: Option<FullPromptPair>,
}

impl NewEntry {
    pub fn fragment(category: KbCategory, content: impl Into<String>) -> Self {
        Self {
            category,
            content: content.into(),
            full_prompt: None,
        }
    }

    pub fn full_prompt(consistent: impl Into<String>, variable: impl Into<String>) -> Self {
        let pair = FullPromptPair {
            consistent: consistent.into(),
            variable: variable.into(),
        };
        Self {
            category: KbCategory::FullPrompt,
            content: format!("{} {}", pair.consistent, pair.variable)
                .trim()
                .to_string(),
            full_prompt: Some(pair),
        }
    }
}

/// Per-user store of reusable prompt fragments.
pub trait KnowledgeBase: Send + Sync {
    fn list(&self, include_deleted: bool) -> anyhow::Result<Vec<KnowledgeBaseEntry>>;
    fn get(&self, id: &str) -> anyhow::Result<Option<KnowledgeBaseEntry>> {
        Ok(self.list(true)?.into_iter().find(|entry| entry.id == id))
    }
    fn increment_usage(&self, id: &str) -> anyhow::Result<u64>;
    fn soft_delete(&self, ids: &[String]) -> anyhow::Result<usize>;
    fn restore(&self, ids: &[String]) -> anyhow::Result<usize>;
    fn permanently_delete(&self, ids: &[String]) -> anyhow::Result<usize>;
    fn purge_expired_trash(&self) -> anyhow::Result<usize>;
    fn save(
        &self,
        entry: NewEntry,
        source_image: Option<&ImageData>,
    ) -> anyhow::Result<KnowledgeBaseEntry>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_parse_accepts_loose_spellings() {
        assert_eq!(KbCategory::parse("Full Prompt"), Some(KbCategory::FullPrompt));
        assert_eq!(KbCategory::parse("full-prompt"), Some(KbCategory::FullPrompt));
        assert_eq!(KbCategory::parse(" lighting "), Some(KbCategory::Lighting));
        assert_eq!(KbCategory::parse("unknown"), None);
        assert!(KbCategory::FullPrompt.is_full_prompt());
        assert!(!KbCategory::Style.is_full_prompt());
    }

    #[test]
    fn full_prompt_entry_binds_both_texts() {
        let entry = NewEntry::full_prompt("white ceramic mug", "on a wooden desk");
        assert_eq!(entry.category, KbCategory::FullPrompt);
        assert_eq!(entry.content, "white ceramic mug on a wooden desk");
        assert_eq!(
            entry.full_prompt.map(|pair| pair.variable),
            Some("on a wooden desk".to_string())
        );
    }

    #[test]
    fn category_serializes_snake_case() -> anyhow::Result<()> {
        assert_eq!(
            serde_json::to_string(&KbCategory::FullPrompt)?,
            "\"full_prompt\""
        );
        Ok(())
    }
}

use similar::TextDiff;

use super::{KbCategory, KnowledgeBaseEntry};

#[derive(Debug, Clone, PartialEq)]
pub struct RankedEntry {
    pub entry: KnowledgeBaseEntry,
    pub score: f32,
}

/// Orders active entries by how closely their text matches `query`.
///
/// Substring hits score 1.0; otherwise the character-level similarity ratio
/// is used and anything below `min_score` is dropped. Ties go to the entry
/// used most often. An empty query ranks purely by usage.
pub fn rank_entries(
    entries: &[KnowledgeBaseEntry],
    query: &str,
    category: Option<KbCategory>,
    min_score: f32,
) -> Vec<RankedEntry> {
    let needle = query.trim().to_lowercase();
    let mut ranked: Vec<RankedEntry> = entries
        .iter()
        .filter(|entry| !entry.is_deleted())
        .filter(|entry| category.map_or(true, |wanted| entry.category == wanted))
        .filter_map(|entry| {
            let score = if needle.is_empty() {
                1.0
            } else {
                similarity(&needle, &entry.content.to_lowercase())
            };
            if score < min_score {
                return None;
            }
            Some(RankedEntry {
                entry: entry.clone(),
                score,
            })
        })
        .collect();

    ranked.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.entry.usage_count.cmp(&a.entry.usage_count))
            .then_with(|| a.entry.created_at.cmp(&b.entry.created_at))
    });
    ranked
}

fn similarity(needle: &str, haystack: &str) -> f32 {
    if haystack.contains(needle) {
        return 1.0;
    }
    TextDiff::from_chars(needle, haystack).ratio()
}

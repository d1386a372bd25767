//! The two prompt channels fed to every generation call: one consistency
//! block shared by all outputs, and an ordered list of variable-prompt units.
//!
//! Unit order is output order. The first unit is special: its prompt also
//! seeds the master image, so edits to it are reported as master-affecting.

use std::fmt;

use indexmap::IndexMap;
use retouch_contracts::analysis::{
    AnalysisResult, ConsistentElements, LegacyConsistent, SynthesizedDefinition, NULL_SENTINEL,
};
use retouch_contracts::knowledge::{KbCategory, KnowledgeBaseEntry};
use retouch_contracts::media::{ArtifactRef, ImageData};
use uuid::Uuid;

use crate::error::ValidationError;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(String);

impl UnitId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for UnitId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// A composition reference attached to one unit, with its own analysis.
#[derive(Debug, Clone)]
pub struct UnitReference {
    /// Bumped by the studio on every attach; stale analysis replies carry an
    /// older key and are dropped.
    pub key: u64,
    pub image: ImageData,
    pub preview: ArtifactRef,
    pub analysis: Option<AnalysisResult>,
    pub analyzing: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct VariablePromptUnit {
    pub id: UnitId,
    pub prompt: String,
    pub reference: Option<UnitReference>,
}

/// Which text field a knowledge-base fragment is appended to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptField {
    Consistent,
    Unit(UnitId),
}

/// What an edit changed, as seen by the staleness tracker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EditEffect {
    pub consistent_changed: bool,
    pub lead_prompt_changed: bool,
}

impl EditEffect {
    pub fn touches_master(self) -> bool {
        self.consistent_changed || self.lead_prompt_changed
    }

    fn merge(self, other: EditEffect) -> EditEffect {
        EditEffect {
            consistent_changed: self.consistent_changed || other.consistent_changed,
            lead_prompt_changed: self.lead_prompt_changed || other.lead_prompt_changed,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnalysisApplied {
    pub effect: EditEffect,
    pub created_unit: Option<UnitId>,
    pub filled_units: usize,
    /// Variable elements with no unit to land on.
    pub dropped_elements: usize,
}

#[derive(Debug, Clone, Default)]
pub struct PromptState {
    consistent: String,
    units: IndexMap<UnitId, VariablePromptUnit>,
}

impl PromptState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consistent(&self) -> &str {
        &self.consistent
    }

    pub fn units(&self) -> impl Iterator<Item = &VariablePromptUnit> {
        self.units.values()
    }

    pub fn unit_ids(&self) -> Vec<UnitId> {
        self.units.keys().cloned().collect()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    pub fn unit(&self, id: &UnitId) -> Option<&VariablePromptUnit> {
        self.units.get(id)
    }

    pub(crate) fn unit_mut(&mut self, id: &UnitId) -> Option<&mut VariablePromptUnit> {
        self.units.get_mut(id)
    }

    pub fn unit_index(&self, id: &UnitId) -> Option<usize> {
        self.units.get_index_of(id)
    }

    pub fn unit_at(&self, index: usize) -> Option<&VariablePromptUnit> {
        self.units.get_index(index).map(|(_, unit)| unit)
    }

    /// Prompt of the first unit, or empty when there are no units.
    pub fn lead_prompt(&self) -> &str {
        self.unit_at(0).map(|unit| unit.prompt.as_str()).unwrap_or("")
    }

    pub fn add_unit(&mut self, prompt: impl Into<String>) -> (UnitId, EditEffect) {
        let before = self.lead_prompt().to_string();
        let id = UnitId::generate();
        self.units.insert(
            id.clone(),
            VariablePromptUnit {
                id: id.clone(),
                prompt: prompt.into(),
                reference: None,
            },
        );
        let effect = EditEffect {
            consistent_changed: false,
            lead_prompt_changed: before != self.lead_prompt(),
        };
        (id, effect)
    }

    /// Removes a unit, keeping the order of the rest. Removing the first unit
    /// promotes the next one, which counts as a lead prompt edit when the
    /// text differs.
    pub fn remove_unit(&mut self, id: &UnitId) -> Option<(VariablePromptUnit, EditEffect)> {
        let before = self.lead_prompt().to_string();
        let removed = self.units.shift_remove(id)?;
        let effect = EditEffect {
            consistent_changed: false,
            lead_prompt_changed: before != self.lead_prompt(),
        };
        Some((removed, effect))
    }

    pub fn set_consistent(&mut self, text: impl Into<String>) -> EditEffect {
        let text = text.into();
        let changed = text != self.consistent;
        self.consistent = text;
        EditEffect {
            consistent_changed: changed,
            lead_prompt_changed: false,
        }
    }

    pub fn set_unit_prompt(
        &mut self,
        id: &UnitId,
        text: impl Into<String>,
    ) -> Result<EditEffect, ValidationError> {
        let index = self
            .unit_index(id)
            .ok_or_else(|| ValidationError::UnknownUnit(id.to_string()))?;
        let text = text.into();
        let Some(unit) = self.units.get_mut(id) else {
            return Err(ValidationError::UnknownUnit(id.to_string()));
        };
        let changed = unit.prompt != text;
        unit.prompt = text;
        Ok(EditEffect {
            consistent_changed: false,
            lead_prompt_changed: changed && index == 0,
        })
    }

    /// Seeds the prompt fields from an analysis.
    ///
    /// The consistency block is always replaced. With `overwrite_units`, each
    /// variable element is written onto the unit at the same position; if
    /// there are no units a single one is created first. Units past the last
    /// element keep their text and surplus elements are reported as dropped.
    pub fn apply_analysis(
        &mut self,
        result: &AnalysisResult,
        overwrite_units: bool,
    ) -> AnalysisApplied {
        let block = consistency_block(&result.consistent);
        let planned: Vec<String> = if overwrite_units {
            result
                .variable
                .iter()
                .map(|element| element.prompt_text())
                .collect()
        } else {
            Vec::new()
        };

        let mut applied = AnalysisApplied {
            effect: self.set_consistent(block),
            ..AnalysisApplied::default()
        };
        if !overwrite_units {
            return applied;
        }

        if self.units.is_empty() {
            let (id, effect) = self.add_unit(String::new());
            applied.created_unit = Some(id);
            applied.effect = applied.effect.merge(effect);
        }
        let ids = self.unit_ids();
        for (id, text) in ids.iter().zip(planned.iter()) {
            if let Ok(effect) = self.set_unit_prompt(id, text.clone()) {
                applied.effect = applied.effect.merge(effect);
                applied.filled_units += 1;
            }
        }
        applied.dropped_elements = planned.len().saturating_sub(ids.len());
        applied
    }

    /// Applies a knowledge-base selection. A full-prompt entry replaces the
    /// consistency text and the first unit's prompt; any other entry appends
    /// its fragment to `focus`.
    pub fn apply_entry(
        &mut self,
        entry: &KnowledgeBaseEntry,
        focus: &PromptField,
    ) -> Result<EditEffect, ValidationError> {
        if entry.category == KbCategory::FullPrompt {
            return Ok(self.replace_with_full_prompt(entry));
        }
        match focus {
            PromptField::Consistent => {
                let text = append_fragment(&self.consistent, &entry.content);
                Ok(self.set_consistent(text))
            }
            PromptField::Unit(id) => {
                let current = self
                    .unit(id)
                    .map(|unit| unit.prompt.clone())
                    .ok_or_else(|| ValidationError::UnknownUnit(id.to_string()))?;
                self.set_unit_prompt(id, append_fragment(&current, &entry.content))
            }
        }
    }

    fn replace_with_full_prompt(&mut self, entry: &KnowledgeBaseEntry) -> EditEffect {
        let Some(pair) = entry.full_prompt.as_ref() else {
            // Older entries stored only the combined text.
            return self.set_consistent(entry.content.clone());
        };
        let mut effect = self.set_consistent(pair.consistent.clone());
        let lead = match self.units.get_index(0) {
            Some((id, _)) => id.clone(),
            None => {
                let (id, created) = self.add_unit(String::new());
                effect = effect.merge(created);
                id
            }
        };
        if let Ok(edit) = self.set_unit_prompt(&lead, pair.variable.clone()) {
            effect = effect.merge(edit);
        }
        effect
    }
}

/// Renders the consistent group of an analysis as prompt text.
pub fn consistency_block(consistent: &ConsistentElements) -> String {
    match consistent {
        ConsistentElements::Synthesized(definition) => synthesized_block(definition),
        ConsistentElements::Legacy(legacy) => legacy_block(legacy),
    }
}

fn synthesized_block(definition: &SynthesizedDefinition) -> String {
    [
        ("Subject", &definition.subject_summary),
        ("Core details", &definition.core_details),
        ("Human features", &definition.human_features),
        ("Scene atmosphere", &definition.scene_atmosphere),
        ("Visual quality", &definition.visual_quality),
    ]
    .into_iter()
    .filter_map(|(label, value)| present(value).map(|text| format!("{label}: {text}")))
    .collect::<Vec<_>>()
    .join("\n")
}

fn legacy_block(legacy: &LegacyConsistent) -> String {
    [
        ("Primary subject", &legacy.primary_subject),
        ("Scene environment", &legacy.scene_environment),
        ("Image quality", &legacy.image_quality),
    ]
    .into_iter()
    .filter_map(|(label, value)| {
        present(value).map(|text| {
            let text = text.trim_end_matches('.');
            format!("{label}: {text}.")
        })
    })
    .collect::<Vec<_>>()
    .join(" ")
}

fn present(value: &Option<String>) -> Option<&str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|text| !text.is_empty() && !text.eq_ignore_ascii_case(NULL_SENTINEL))
}

fn append_fragment(current: &str, fragment: &str) -> String {
    let fragment = fragment.trim();
    if fragment.is_empty() {
        return current.to_string();
    }
    if current.trim().is_empty() {
        return fragment.to_string();
    }
    format!("{current} {fragment}")
}

#[cfg(test)]
mod tests {
    use retouch_contracts::analysis::VariableElement;
    use retouch_contracts::knowledge::FullPromptPair;

    use super::*;

    fn entry(category: KbCategory, content: &str) -> KnowledgeBaseEntry {
        KnowledgeBaseEntry {
            id: "kb-1".to_string(),
            category,
            content: content.to_string(),
            full_prompt: None,
            source_image: None,
            usage_count: 0,
            created_at: "2026-01-01T00:00:00+00:00".to_string(),
            deleted_at: None,
        }
    }

    fn analysis(variable: &[&str]) -> AnalysisResult {
        AnalysisResult {
            consistent: ConsistentElements::Synthesized(SynthesizedDefinition {
                subject_summary: Some("ceramic mug".to_string()),
                core_details: Some("matte white glaze".to_string()),
                human_features: Some("null".to_string()),
                scene_atmosphere: None,
                visual_quality: Some("sharp, soft light".to_string()),
            }),
            variable: variable
                .iter()
                .map(|text| VariableElement {
                    label: None,
                    description: text.to_string(),
                })
                .collect(),
        }
    }

    #[test]
    fn synthesized_block_skips_absent_and_null_fields() {
        let block = consistency_block(&analysis(&[]).consistent);
        assert_eq!(
            block,
            "Subject: ceramic mug\nCore details: matte white glaze\nVisual quality: sharp, soft light"
        );
    }

    #[test]
    fn legacy_block_falls_back_field_by_field() {
        let block = consistency_block(&ConsistentElements::Legacy(LegacyConsistent {
            primary_subject: Some("a leather bag.".to_string()),
            scene_environment: None,
            image_quality: Some("high detail".to_string()),
        }));
        assert_eq!(
            block,
            "Primary subject: a leather bag. Image quality: high detail."
        );
    }

    #[test]
    fn analysis_creates_one_unit_when_none_exist() {
        let mut state = PromptState::new();
        let applied = state.apply_analysis(&analysis(&["front view", "side view"]), true);
        assert_eq!(state.unit_count(), 1);
        assert_eq!(state.lead_prompt(), "front view");
        assert!(applied.created_unit.is_some());
        assert_eq!(applied.dropped_elements, 1);
        assert!(applied.effect.consistent_changed);
        assert!(applied.effect.lead_prompt_changed);
    }

    #[test]
    fn analysis_maps_elements_positionally() {
        let mut state = PromptState::new();
        let (first, _) = state.add_unit("old 1");
        let (second, _) = state.add_unit("old 2");
        let (third, _) = state.add_unit("old 3");
        let applied = state.apply_analysis(&analysis(&["new 1", "new 2"]), true);
        assert_eq!(applied.filled_units, 2);
        assert_eq!(applied.dropped_elements, 0);
        assert_eq!(state.unit(&first).map(|u| u.prompt.as_str()), Some("new 1"));
        assert_eq!(state.unit(&second).map(|u| u.prompt.as_str()), Some("new 2"));
        assert_eq!(state.unit(&third).map(|u| u.prompt.as_str()), Some("old 3"));
    }

    #[test]
    fn partial_analysis_only_touches_consistency() {
        let mut state = PromptState::new();
        let (id, _) = state.add_unit("my hand-edited prompt");
        let applied = state.apply_analysis(&analysis(&["replacement"]), false);
        assert_eq!(
            state.unit(&id).map(|u| u.prompt.as_str()),
            Some("my hand-edited prompt")
        );
        assert!(state.consistent().starts_with("Subject: ceramic mug"));
        assert!(!applied.effect.lead_prompt_changed);
        assert_eq!(state.unit_count(), 1);
    }

    #[test]
    fn full_prompt_entry_replaces_both_fields() -> anyhow::Result<()> {
        let mut state = PromptState::new();
        state.set_consistent("old consistent");
        let (lead, _) = state.add_unit("old lead");
        let (other, _) = state.add_unit("other");
        let mut full = entry(KbCategory::FullPrompt, "combined");
        full.full_prompt = Some(FullPromptPair {
            consistent: "new consistent".to_string(),
            variable: "new lead".to_string(),
        });

        let effect = state.apply_entry(&full, &PromptField::Unit(other.clone()))?;
        assert_eq!(state.consistent(), "new consistent");
        assert_eq!(state.unit(&lead).map(|u| u.prompt.as_str()), Some("new lead"));
        assert_eq!(state.unit(&other).map(|u| u.prompt.as_str()), Some("other"));
        assert!(effect.consistent_changed && effect.lead_prompt_changed);
        Ok(())
    }

    #[test]
    fn fragment_appends_to_focused_unit_only() -> anyhow::Result<()> {
        let mut state = PromptState::new();
        let (first, _) = state.add_unit("first");
        let (second, _) = state.add_unit("second");
        let (third, _) = state.add_unit("on a desk");

        let effect = state.apply_entry(
            &entry(KbCategory::Lighting, "golden hour light"),
            &PromptField::Unit(third.clone()),
        )?;
        assert_eq!(
            state.unit(&third).map(|u| u.prompt.as_str()),
            Some("on a desk golden hour light")
        );
        assert_eq!(state.unit(&first).map(|u| u.prompt.as_str()), Some("first"));
        assert_eq!(state.unit(&second).map(|u| u.prompt.as_str()), Some("second"));
        assert!(!effect.touches_master());
        Ok(())
    }

    #[test]
    fn fragment_into_empty_field_has_no_leading_space() -> anyhow::Result<()> {
        let mut state = PromptState::new();
        let effect = state.apply_entry(
            &entry(KbCategory::Style, "film grain"),
            &PromptField::Consistent,
        )?;
        assert_eq!(state.consistent(), "film grain");
        assert!(effect.consistent_changed);
        Ok(())
    }

    #[test]
    fn removing_lead_unit_reports_lead_change() {
        let mut state = PromptState::new();
        let (first, _) = state.add_unit("front");
        let (second, _) = state.add_unit("back");
        let Some((_, effect)) = state.remove_unit(&first) else {
            panic!("unit should exist");
        };
        assert!(effect.lead_prompt_changed);
        assert_eq!(state.unit_ids(), vec![second]);
        assert!(state.remove_unit(&first).is_none());
    }

    #[test]
    fn editing_non_lead_unit_does_not_touch_master() -> anyhow::Result<()> {
        let mut state = PromptState::new();
        state.add_unit("lead");
        let (second, _) = state.add_unit("second");
        assert!(!state.set_unit_prompt(&second, "changed")?.touches_master());
        assert_eq!(
            state.set_unit_prompt(&UnitId::from("missing"), "x"),
            Err(ValidationError::UnknownUnit("missing".to_string()))
        );
        Ok(())
    }
}

//! One retouching session: the single owner of reference images, prompts,
//! the master image and the generated variants.
//!
//! Every operation validates, updates state and dispatches service calls
//! without blocking. Results come back as completions that are applied by
//! [`Studio::pump`], [`Studio::wait_next`] or [`Studio::wait_idle`], one at a
//! time and in arrival order. A completion for an entity that has since been
//! deleted or re-dispatched is dropped.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::anyhow;
use chrono::{SecondsFormat, Utc};
use retouch_contracts::analysis::AnalysisResult;
use retouch_contracts::events::{EventKind, EventWriter};
use retouch_contracts::knowledge::{KbCategory, KnowledgeBase, KnowledgeBaseEntry, NewEntry};
use retouch_contracts::media::{ArtifactRef, ImageData};
use retouch_contracts::session::{write_summary, SessionSummary, UnitSummary};
use serde_json::{json, Value};

use crate::batch::{BatchOrchestrator, BatchSummary, GeneratedSlot, SlotOutcome, SlotTicket};
use crate::composer::{
    consistency_block, EditEffect, PromptField, PromptState, UnitId, UnitReference,
};
use crate::config::{ProcessingMode, StudioConfig};
use crate::dispatch::{Completion, Dispatcher, Job};
use crate::error::{GenerationError, StudioError, ValidationError};
use crate::master::{MasterImageState, MasterOp, MasterOrchestrator, MasterOutcome, MasterTicket};
use crate::references::{CleanupOutcome, CleanupResult, ImageId, ImageStatus, ReferenceSet};
use crate::service::GenerationService;

/// What a user-visible message is about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NoticeScope {
    Image(ImageId),
    Analysis,
    Master,
    Unit(UnitId),
    Batch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub scope: NoticeScope,
    pub message: String,
}

#[derive(Debug)]
struct AnalysisPass {
    id: u64,
    overwrite_units: bool,
    queue: VecDeque<ImageId>,
    /// Image currently being cleaned, deferred mode only.
    current: Option<ImageId>,
    analyzing: bool,
}

pub struct Studio {
    config: StudioConfig,
    events: EventWriter,
    dispatcher: Dispatcher,
    references: ReferenceSet,
    prompts: PromptState,
    master: MasterOrchestrator,
    batch: BatchOrchestrator,
    instruction: String,
    analysis: Option<AnalysisPass>,
    next_pass: u64,
    next_reference_key: u64,
    notices: Vec<Notice>,
    started_at: String,
}

impl Studio {
    pub fn new(
        service: Arc<dyn GenerationService>,
        config: StudioConfig,
        events: EventWriter,
    ) -> Self {
        let studio = Self {
            references: ReferenceSet::new(config.reference_capacity),
            dispatcher: Dispatcher::new(service),
            config,
            events,
            prompts: PromptState::new(),
            master: MasterOrchestrator::new(),
            batch: BatchOrchestrator::new(),
            instruction: String::new(),
            analysis: None,
            next_pass: 0,
            next_reference_key: 0,
            notices: Vec::new(),
            started_at: now_utc_iso(),
        };
        studio.log(
            EventKind::SessionStarted,
            json!({
                "service": studio.dispatcher.service().name(),
                "reference_capacity": studio.config.reference_capacity,
                "processing_mode": match studio.config.processing_mode {
                    ProcessingMode::Immediate => "immediate",
                    ProcessingMode::Deferred => "deferred",
                },
            }),
        );
        studio
    }

    pub fn references(&self) -> &ReferenceSet {
        &self.references
    }

    pub fn prompts(&self) -> &PromptState {
        &self.prompts
    }

    pub fn master_state(&self) -> MasterImageState {
        self.master.state()
    }

    pub fn slot(&self, unit: &UnitId) -> Option<&GeneratedSlot> {
        self.batch.slot(unit)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&UnitId, &GeneratedSlot)> {
        self.batch.slots()
    }

    pub fn instruction(&self) -> &str {
        &self.instruction
    }

    pub fn is_analyzing(&self) -> bool {
        self.analysis.is_some()
    }

    pub fn in_flight(&self) -> usize {
        self.dispatcher.in_flight()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn take_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    pub fn events(&self) -> &EventWriter {
        &self.events
    }

    // Reference images

    /// Adds uploads up to the remaining capacity; the rest are dropped. In
    /// immediate mode each accepted image is sent for watermark removal.
    pub fn add_reference_images(&mut self, uploads: Vec<ImageData>) -> Vec<ImageId> {
        let offered = uploads.len();
        let status = match self.config.processing_mode {
            ProcessingMode::Immediate => ImageStatus::Processing,
            ProcessingMode::Deferred => ImageStatus::Pending,
        };
        let ids = self.references.add(uploads, status);
        self.log(
            EventKind::ReferenceImagesAdded,
            json!({
                "accepted": ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
                "dropped": offered - ids.len(),
                "status": status.as_str(),
            }),
        );
        if self.config.processing_mode == ProcessingMode::Immediate {
            for id in &ids {
                if let Some(image) = self.references.get(*id) {
                    let job = Job::Cleanup {
                        image: *id,
                        data: image.original.clone(),
                        detect_first: false,
                    };
                    self.dispatcher.dispatch(job);
                }
            }
        }
        ids
    }

    /// Removes an image in any state. A cleanup still running for it is
    /// ignored when it reports back.
    pub fn remove_reference_image(&mut self, id: ImageId) -> bool {
        let Some(removed) = self.references.remove(id) else {
            return false;
        };
        if let Some(pass) = self.analysis.as_mut() {
            pass.queue.retain(|queued| *queued != id);
        }
        self.log(
            EventKind::ReferenceImageRemoved,
            json!({ "image_id": id.to_string(), "status": removed.status.as_str() }),
        );
        true
    }

    // Prompts

    pub fn set_consistent_text(&mut self, text: impl Into<String>) {
        let effect = self.prompts.set_consistent(text);
        self.observe_edit(effect, "consistent_text");
    }

    pub fn add_unit(&mut self, prompt: impl Into<String>) -> UnitId {
        let (id, effect) = self.prompts.add_unit(prompt);
        self.log(EventKind::UnitAdded, json!({ "unit_id": id.as_str() }));
        self.observe_edit(effect, "unit_added");
        id
    }

    /// Removes the unit and its generated result together.
    pub fn remove_unit(&mut self, id: &UnitId) -> Result<(), ValidationError> {
        let Some((_, effect)) = self.prompts.remove_unit(id) else {
            return Err(ValidationError::UnknownUnit(id.to_string()));
        };
        let finished = self.batch.remove_unit(id);
        self.log(EventKind::UnitRemoved, json!({ "unit_id": id.as_str() }));
        self.observe_edit(effect, "unit_removed");
        if let Some(summary) = finished {
            self.finish_batch(summary);
        }
        Ok(())
    }

    pub fn set_unit_prompt(
        &mut self,
        id: &UnitId,
        text: impl Into<String>,
    ) -> Result<(), ValidationError> {
        let effect = self.prompts.set_unit_prompt(id, text)?;
        self.observe_edit(effect, "unit_prompt");
        Ok(())
    }

    pub fn attach_unit_reference(
        &mut self,
        id: &UnitId,
        image: ImageData,
    ) -> Result<(), ValidationError> {
        self.next_reference_key += 1;
        let key = self.next_reference_key;
        let unit = self
            .prompts
            .unit_mut(id)
            .ok_or_else(|| ValidationError::UnknownUnit(id.to_string()))?;
        unit.reference = Some(UnitReference {
            key,
            preview: ArtifactRef::from(&image),
            image,
            analysis: None,
            analyzing: false,
            error: None,
        });
        self.log(EventKind::UnitReferenceAttached, json!({ "unit_id": id.as_str() }));
        Ok(())
    }

    pub fn detach_unit_reference(&mut self, id: &UnitId) -> Result<bool, ValidationError> {
        let unit = self
            .prompts
            .unit_mut(id)
            .ok_or_else(|| ValidationError::UnknownUnit(id.to_string()))?;
        Ok(unit.reference.take().is_some())
    }

    /// Analyzes the unit's own reference image. The result is kept on the
    /// unit and seeds its prompt if the prompt is still empty.
    pub fn analyze_unit_reference(&mut self, id: &UnitId) -> Result<(), ValidationError> {
        let unit = self
            .prompts
            .unit_mut(id)
            .ok_or_else(|| ValidationError::UnknownUnit(id.to_string()))?;
        let Some(reference) = unit.reference.as_mut() else {
            return Err(ValidationError::MissingUnitReference(id.to_string()));
        };
        reference.analyzing = true;
        reference.error = None;
        let job = Job::UnitAnalysis {
            unit: id.clone(),
            key: reference.key,
            image: reference.preview.clone(),
        };
        self.dispatcher.dispatch(job);
        self.log(EventKind::UnitAnalysisStarted, json!({ "unit_id": id.as_str() }));
        Ok(())
    }

    // Analysis

    /// Analyzes the reference set and seeds the prompts.
    ///
    /// In deferred mode the pending images are cleaned first, one after
    /// another, before the combined analysis call. `overwrite_units` false
    /// only refreshes the consistency block.
    pub fn start_analysis(&mut self, overwrite_units: bool) -> Result<(), ValidationError> {
        if self.analysis.is_some() {
            return Err(ValidationError::AnalysisBusy);
        }
        if self.references.is_empty() {
            return Err(ValidationError::NoReferenceImages);
        }
        let queue: VecDeque<ImageId> = match self.config.processing_mode {
            ProcessingMode::Immediate => {
                let readiness = self.references.readiness();
                if !readiness.all_settled() {
                    return Err(ValidationError::ReferencesProcessing(readiness.unsettled));
                }
                VecDeque::new()
            }
            ProcessingMode::Deferred => self.references.pending_ids().into(),
        };
        self.next_pass += 1;
        self.log(
            EventKind::AnalysisStarted,
            json!({
                "pass": self.next_pass,
                "overwrite_units": overwrite_units,
                "queued_images": queue.len(),
            }),
        );
        self.analysis = Some(AnalysisPass {
            id: self.next_pass,
            overwrite_units,
            queue,
            current: None,
            analyzing: false,
        });
        self.advance_analysis();
        Ok(())
    }

    fn advance_analysis(&mut self) {
        let Some(mut pass) = self.analysis.take() else {
            return;
        };
        pass.current = None;
        while let Some(id) = pass.queue.pop_front() {
            if let Some(data) = self.references.start_processing(id) {
                pass.current = Some(id);
                self.dispatcher.dispatch(Job::Cleanup {
                    image: id,
                    data,
                    detect_first: true,
                });
                self.analysis = Some(pass);
                return;
            }
        }

        let images = self.references.usable_artifacts();
        if images.is_empty() {
            self.push_notice(
                NoticeScope::Analysis,
                "No usable reference images left to analyze.".to_string(),
            );
            self.log(EventKind::AnalysisSkipped, json!({ "pass": pass.id }));
            return;
        }
        pass.analyzing = true;
        self.dispatcher.dispatch(Job::Analysis {
            pass: pass.id,
            images,
        });
        self.analysis = Some(pass);
    }

    // Master

    pub fn generate_master(&mut self) -> Result<(), ValidationError> {
        let ticket = self.master.begin_generate(
            self.references.readiness(),
            self.prompts.consistent(),
            self.prompts.lead_prompt(),
        )?;
        let job = Job::Master {
            ticket,
            images: self.references.usable_artifacts(),
            consistent: self.prompts.consistent().to_string(),
            variable: self.prompts.lead_prompt().to_string(),
            modify: None,
        };
        self.dispatcher.dispatch(job);
        self.log_master_requested(ticket);
        Ok(())
    }

    pub fn set_modification_instruction(&mut self, text: impl Into<String>) {
        self.instruction = text.into();
    }

    /// Applies the current instruction to the master. The instruction is
    /// cleared when the modification succeeds and kept when it fails.
    pub fn modify_master(&mut self) -> Result<(), ValidationError> {
        let (ticket, current) = self
            .master
            .begin_modify(self.references.readiness(), &self.instruction)?;
        let job = Job::Master {
            ticket,
            images: self.references.usable_artifacts(),
            consistent: self.prompts.consistent().to_string(),
            variable: self.prompts.lead_prompt().to_string(),
            modify: Some((current, self.instruction.clone())),
        };
        self.dispatcher.dispatch(job);
        self.log_master_requested(ticket);
        Ok(())
    }

    fn log_master_requested(&self, ticket: MasterTicket) {
        self.log(
            EventKind::MasterRequested,
            json!({
                "op": ticket.op.as_str(),
                "seq": ticket.seq,
                "instruction": (ticket.op == MasterOp::Modify)
                    .then(|| self.instruction.clone()),
            }),
        );
    }

    // Variants

    /// Resets every unit's slot to loading, then issues one call per unit.
    pub fn generate_all(&mut self) -> Result<usize, ValidationError> {
        let master =
            BatchOrchestrator::check_ready(&self.master.state(), self.references.readiness())?;
        let tickets = self.batch.begin_all(&self.prompts.unit_ids())?;
        let images = self.references.usable_artifacts();
        let count = tickets.len();
        self.log(EventKind::BatchStarted, json!({ "units": count }));
        for ticket in tickets {
            self.dispatch_variant(ticket, &images, &master, false);
        }
        Ok(count)
    }

    /// Regenerates one unit without touching any other slot.
    pub fn regenerate_unit(&mut self, id: &UnitId) -> Result<(), ValidationError> {
        if self.prompts.unit(id).is_none() {
            return Err(ValidationError::UnknownUnit(id.to_string()));
        }
        let master =
            BatchOrchestrator::check_ready(&self.master.state(), self.references.readiness())?;
        let (ticket, finished) = self.batch.begin_single(id);
        if let Some(summary) = finished {
            self.finish_batch(summary);
        }
        let images = self.references.usable_artifacts();
        self.log(
            EventKind::VariantRequested,
            json!({ "unit_id": id.as_str(), "regeneration": true }),
        );
        self.dispatch_variant(ticket, &images, &master, true);
        Ok(())
    }

    fn dispatch_variant(
        &mut self,
        ticket: SlotTicket,
        images: &[ArtifactRef],
        master: &ArtifactRef,
        is_regeneration: bool,
    ) {
        let (variable, reference) = match self.prompts.unit(&ticket.unit) {
            Some(unit) => (
                unit.prompt.clone(),
                unit.reference.as_ref().map(|reference| reference.preview.clone()),
            ),
            None => (String::new(), None),
        };
        self.dispatcher.dispatch(Job::Variant {
            ticket,
            images: images.to_vec(),
            master: master.clone(),
            consistent: self.prompts.consistent().to_string(),
            variable,
            is_regeneration,
            reference,
        });
    }

    // Knowledge base

    /// Applies a saved entry to the prompts and bumps its usage counter.
    pub fn select_knowledge_entry(
        &mut self,
        kb: &dyn KnowledgeBase,
        id: &str,
        focus: &PromptField,
    ) -> Result<EditEffect, StudioError> {
        let entry = kb
            .get(id)?
            .filter(|entry| !entry.is_deleted())
            .ok_or_else(|| anyhow!("knowledge base entry '{id}' not found"))?;
        let effect = self.prompts.apply_entry(&entry, focus)?;
        let usage = kb.increment_usage(id)?;
        self.log(
            EventKind::KbEntrySelected,
            json!({
                "entry_id": id,
                "category": entry.category.as_str(),
                "usage_count": usage,
            }),
        );
        self.observe_edit(effect, "kb_entry");
        Ok(effect)
    }

    /// Saves the consistency text and first unit prompt as one full-prompt
    /// entry, with the first reference image as its preview.
    pub fn save_full_prompt(
        &self,
        kb: &dyn KnowledgeBase,
    ) -> Result<KnowledgeBaseEntry, StudioError> {
        let consistent = self.prompts.consistent().trim();
        let variable = self.prompts.lead_prompt().trim();
        if consistent.is_empty() && variable.is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        let source = self.references.iter().next().map(|image| &image.original);
        let entry = kb.save(NewEntry::full_prompt(consistent, variable), source)?;
        self.log(
            EventKind::KbEntrySaved,
            json!({ "entry_id": entry.id, "category": entry.category.as_str() }),
        );
        Ok(entry)
    }

    pub fn save_fragment(
        &self,
        kb: &dyn KnowledgeBase,
        category: KbCategory,
        text: &str,
        source_image: Option<&ImageData>,
    ) -> Result<KnowledgeBaseEntry, StudioError> {
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt.into());
        }
        let entry = kb.save(NewEntry::fragment(category, text.trim()), source_image)?;
        self.log(
            EventKind::KbEntrySaved,
            json!({ "entry_id": entry.id, "category": entry.category.as_str() }),
        );
        Ok(entry)
    }

    /// Replaces a provider key for every later call; calls already running
    /// keep the key they started with.
    pub fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
        let rotated = self.dispatcher.service().rotate_api_key(provider, key);
        self.log(
            EventKind::ApiKeyRotated,
            json!({ "provider": provider, "applied": rotated }),
        );
        rotated
    }

    // Completions

    /// Applies every completion that has already arrived. Never blocks.
    pub fn pump(&mut self) -> usize {
        let mut applied = 0;
        while let Some(completion) = self.dispatcher.try_next() {
            self.apply(completion);
            applied += 1;
        }
        applied
    }

    /// Blocks for up to `timeout` for the next completion and applies it.
    pub fn wait_next(&mut self, timeout: Duration) -> bool {
        match self.dispatcher.next_timeout(timeout) {
            Some(completion) => {
                self.apply(completion);
                true
            }
            None => false,
        }
    }

    /// Applies completions until nothing is in flight or `timeout` passes.
    /// Returns whether the session went idle.
    pub fn wait_idle(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.dispatcher.in_flight() > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || !self.wait_next(remaining) {
                return self.dispatcher.in_flight() == 0;
            }
        }
        true
    }

    fn apply(&mut self, completion: Completion) {
        match completion {
            Completion::Cleanup { image, result } => self.apply_cleanup(image, result),
            Completion::Analysis { pass, result } => self.apply_analysis(pass, result),
            Completion::UnitAnalysis { unit, key, result } => {
                self.apply_unit_analysis(&unit, key, result)
            }
            Completion::Master { ticket, result } => self.apply_master(ticket, result),
            Completion::Variant { ticket, result } => self.apply_variant(&ticket, result),
        }
    }

    fn apply_cleanup(&mut self, image: ImageId, result: CleanupResult) {
        let cleaned = matches!(result, CleanupResult::Cleaned(_));
        match self.references.apply_cleanup(image, result) {
            CleanupOutcome::Ready => self.log(
                EventKind::ReferenceImageReady,
                json!({ "image_id": image.to_string(), "watermark_removed": cleaned }),
            ),
            CleanupOutcome::Failed(message) => {
                self.log(
                    EventKind::ReferenceImageFailed,
                    json!({ "image_id": image.to_string(), "error": message }),
                );
                self.push_notice(
                    NoticeScope::Image(image),
                    format!("Watermark removal failed, using the original image: {message}"),
                );
            }
            CleanupOutcome::Ignored => self.log(
                EventKind::StaleCompletionDropped,
                json!({ "kind": "cleanup", "image_id": image.to_string() }),
            ),
        }
        let is_current = self
            .analysis
            .as_ref()
            .is_some_and(|pass| pass.current == Some(image));
        if is_current {
            self.advance_analysis();
        }
    }

    fn apply_analysis(&mut self, pass_id: u64, result: Result<AnalysisResult, GenerationError>) {
        let matches_pass = self
            .analysis
            .as_ref()
            .is_some_and(|pass| pass.id == pass_id && pass.analyzing);
        if !matches_pass {
            return;
        }
        let Some(pass) = self.analysis.take() else {
            return;
        };
        match result {
            Ok(analysis) => {
                let applied = self.prompts.apply_analysis(&analysis, pass.overwrite_units);
                self.log(
                    EventKind::AnalysisApplied,
                    json!({
                        "pass": pass.id,
                        "schema": if analysis.is_synthesized() { "synthesized" } else { "legacy" },
                        "overwrite_units": pass.overwrite_units,
                        "filled_units": applied.filled_units,
                        "dropped_elements": applied.dropped_elements,
                        "created_unit": applied.created_unit.as_ref().map(UnitId::as_str),
                    }),
                );
                self.observe_edit(applied.effect, "analysis");
            }
            Err(err) => {
                self.log(
                    EventKind::AnalysisFailed,
                    json!({ "pass": pass.id, "error": err.message }),
                );
                self.push_notice(
                    NoticeScope::Analysis,
                    format!("Analysis failed: {}", err.message),
                );
            }
        }
    }

    fn apply_unit_analysis(
        &mut self,
        unit_id: &UnitId,
        key: u64,
        result: Result<AnalysisResult, GenerationError>,
    ) {
        let Some(unit) = self.prompts.unit_mut(unit_id) else {
            return;
        };
        let Some(reference) = unit.reference.as_mut().filter(|reference| reference.key == key)
        else {
            return;
        };
        reference.analyzing = false;
        match result {
            Ok(analysis) => {
                let seed = analysis
                    .variable
                    .first()
                    .map(|element| element.prompt_text())
                    .unwrap_or_else(|| consistency_block(&analysis.consistent));
                reference.analysis = Some(analysis);
                let prompt_empty = unit.prompt.trim().is_empty();
                self.log(EventKind::UnitAnalysisApplied, json!({ "unit_id": unit_id.as_str() }));
                if prompt_empty && !seed.trim().is_empty() {
                    if let Ok(effect) = self.prompts.set_unit_prompt(unit_id, seed) {
                        self.observe_edit(effect, "unit_analysis");
                    }
                }
            }
            Err(err) => {
                reference.error = Some(err.message.clone());
                self.log(
                    EventKind::UnitAnalysisFailed,
                    json!({ "unit_id": unit_id.as_str(), "error": err.message }),
                );
                self.push_notice(
                    NoticeScope::Unit(unit_id.clone()),
                    format!("Reference analysis failed: {}", err.message),
                );
            }
        }
    }

    fn apply_master(&mut self, ticket: MasterTicket, result: Result<ArtifactRef, GenerationError>) {
        match self.master.complete(ticket, result) {
            MasterOutcome::Ready { op, replaced } => {
                if op == MasterOp::Modify {
                    self.instruction.clear();
                }
                self.log(
                    EventKind::MasterReady,
                    json!({ "op": op.as_str(), "seq": ticket.seq, "replaced": replaced }),
                );
            }
            MasterOutcome::Failed { op, message } => {
                self.log(
                    EventKind::MasterFailed,
                    json!({ "op": op.as_str(), "seq": ticket.seq, "error": message }),
                );
                self.push_notice(
                    NoticeScope::Master,
                    format!("Master image {} failed: {message}", op_verb(op)),
                );
            }
            MasterOutcome::Ignored => {}
        }
    }

    fn apply_variant(&mut self, ticket: &SlotTicket, result: Result<ArtifactRef, GenerationError>) {
        let completion = self.batch.complete(ticket, result);
        match &completion.outcome {
            SlotOutcome::Generated => self.log(
                EventKind::VariantReady,
                json!({ "unit_id": ticket.unit.as_str(), "seq": ticket.seq }),
            ),
            SlotOutcome::Failed(message) => {
                self.log(
                    EventKind::VariantFailed,
                    json!({ "unit_id": ticket.unit.as_str(), "seq": ticket.seq, "error": message }),
                );
                if !completion.batched {
                    self.push_notice(
                        NoticeScope::Unit(ticket.unit.clone()),
                        format!("Picture regeneration failed: {message}"),
                    );
                }
            }
            SlotOutcome::Ignored => self.log(
                EventKind::StaleCompletionDropped,
                json!({ "kind": "variant", "unit_id": ticket.unit.as_str(), "seq": ticket.seq }),
            ),
        }
        if let Some(summary) = completion.finished_batch {
            self.finish_batch(summary);
        }
    }

    fn finish_batch(&mut self, summary: BatchSummary) {
        self.log(
            EventKind::BatchFinished,
            json!({
                "batch": summary.batch,
                "total": summary.total,
                "failed": summary.failed.iter().map(UnitId::as_str).collect::<Vec<_>>(),
            }),
        );
        if let Some(message) = summary.notice() {
            self.push_notice(NoticeScope::Batch, message);
        }
    }

    fn observe_edit(&mut self, effect: EditEffect, source: &str) {
        if self.master.observe_edit(effect) {
            self.log(EventKind::MasterStale, json!({ "source": source }));
        }
    }

    fn push_notice(&mut self, scope: NoticeScope, message: String) {
        self.notices.push(Notice { scope, message });
    }

    fn log(&self, kind: EventKind, payload: Value) {
        // Event log write failures never fail an operation.
        let _ = self.events.emit(kind, payload);
    }

    // Session summary

    pub fn summary(&self) -> SessionSummary {
        let readiness = self.references.readiness();
        let master = self.master.state();
        let units = self
            .prompts
            .units()
            .map(|unit| {
                let slot = self.batch.slot(&unit.id);
                UnitSummary {
                    unit_id: unit.id.to_string(),
                    prompt: unit.prompt.clone(),
                    artifact: slot
                        .and_then(|slot| slot.artifact.as_ref())
                        .map(|artifact| artifact.as_str().to_string()),
                    error: slot.and_then(|slot| slot.error.clone()),
                }
            })
            .collect();
        SessionSummary {
            session_id: self.events.session_id().to_string(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            reference_images: readiness.total as u64,
            failed_reference_images: readiness.failed as u64,
            consistent_prompt: self.prompts.consistent().to_string(),
            master_artifact: master.artifact.map(|artifact| artifact.as_str().to_string()),
            master_stale: master.stale,
            units,
        }
    }

    /// Writes the session summary and logs the end of the session.
    pub fn finish(&self, summary_path: &Path) -> anyhow::Result<SessionSummary> {
        let summary = self.summary();
        write_summary(summary_path, &summary, None)?;
        self.events.emit(
            EventKind::SessionFinished,
            json!({
                "summary_path": summary_path.to_string_lossy(),
                "generated_units": summary.generated_count(),
                "failed_units": summary.failed_count(),
            }),
        )?;
        Ok(summary)
    }
}

fn op_verb(op: MasterOp) -> &'static str {
    match op {
        MasterOp::Generate => "generation",
        MasterOp::Modify => "modification",
    }
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use retouch_contracts::analysis::{
        ConsistentElements, SynthesizedDefinition, VariableElement, WatermarkReport,
    };
    use retouch_contracts::knowledge::JsonKnowledgeBase;
    use tempfile::TempDir;

    use super::*;
    use crate::config::DEFAULT_REFERENCE_CAPACITY;
    use crate::service::{GenerationResult, VariantRequest};

    const WAIT: Duration = Duration::from_secs(10);

    /// Answers from the request text. Anything containing `FAIL` is
    /// rejected; uploads starting with `X` cannot be cleaned and uploads
    /// starting with `W` carry a watermark.
    #[derive(Default)]
    struct ScriptedService {
        rotations: Mutex<Vec<(String, Option<String>)>>,
    }

    impl GenerationService for ScriptedService {
        fn name(&self) -> &str {
            "scripted"
        }

        fn remove_watermark(&self, image: &ImageData) -> GenerationResult<ArtifactRef> {
            if image.bytes.first() == Some(&b'X') {
                return Err(GenerationError::new("watermark service unavailable"));
            }
            Ok(ArtifactRef::new(format!("clean:{}", image.content_hash())))
        }

        fn detect_watermark(&self, image: &ImageData) -> GenerationResult<WatermarkReport> {
            Ok(WatermarkReport {
                has_watermark: image.bytes.first() == Some(&b'W'),
            })
        }

        fn analyze_images(&self, images: &[ArtifactRef]) -> GenerationResult<AnalysisResult> {
            Ok(AnalysisResult {
                consistent: ConsistentElements::Synthesized(SynthesizedDefinition {
                    subject_summary: Some(format!("subject seen in {} images", images.len())),
                    visual_quality: Some("crisp".to_string()),
                    ..SynthesizedDefinition::default()
                }),
                variable: (1..=images.len())
                    .map(|idx| VariableElement {
                        label: Some(format!("Shot {idx}")),
                        description: "three-quarter view".to_string(),
                    })
                    .collect(),
            })
        }

        fn generate_master_image(
            &self,
            images: &[ArtifactRef],
            consistent_prompt: &str,
            variable_prompt: &str,
        ) -> GenerationResult<ArtifactRef> {
            if consistent_prompt.contains("FAIL") || variable_prompt.contains("FAIL") {
                return Err(GenerationError::new("master rejected"));
            }
            Ok(ArtifactRef::new(format!(
                "master:{}:{consistent_prompt}|{variable_prompt}",
                images.len()
            )))
        }

        fn modify_master_image(
            &self,
            _images: &[ArtifactRef],
            master: &ArtifactRef,
            _consistent_prompt: &str,
            _variable_prompt: &str,
            instruction: &str,
        ) -> GenerationResult<ArtifactRef> {
            if instruction.contains("FAIL") {
                return Err(GenerationError::new("modification rejected"));
            }
            Ok(ArtifactRef::new(format!("{}+{instruction}", master.as_str())))
        }

        fn generate_single_from_master(
            &self,
            request: &VariantRequest<'_>,
        ) -> GenerationResult<ArtifactRef> {
            if request.variable_prompt.contains("FAIL") {
                return Err(GenerationError::new("variant rejected"));
            }
            Ok(ArtifactRef::new(format!(
                "variant:{}:{}:{}",
                request.variable_prompt,
                request.is_regeneration,
                request.reference.is_some()
            )))
        }

        fn rotate_api_key(&self, provider: &str, key: Option<String>) -> bool {
            if let Ok(mut rotations) = self.rotations.lock() {
                rotations.push((provider.to_string(), key));
            }
            provider == "gemini"
        }
    }

    fn studio_with(mode: ProcessingMode) -> (Studio, TempDir) {
        let temp = match tempfile::tempdir() {
            Ok(temp) => temp,
            Err(err) => panic!("tempdir: {err}"),
        };
        let events = EventWriter::new(temp.path().join("events.jsonl"), "session-test");
        let config = StudioConfig {
            reference_capacity: DEFAULT_REFERENCE_CAPACITY,
            processing_mode: mode,
        };
        let studio = Studio::new(Arc::new(ScriptedService::default()), config, events);
        (studio, temp)
    }

    fn upload(tag: u8, n: u8) -> ImageData {
        ImageData::new(vec![tag, n, 0x89, b'P', b'N', b'G'], "image/png")
    }

    fn studio_with_master() -> anyhow::Result<(Studio, TempDir)> {
        let (mut studio, temp) = studio_with(ProcessingMode::Immediate);
        studio.add_reference_images(vec![upload(b'A', 1), upload(b'A', 2)]);
        assert!(studio.wait_idle(WAIT));
        studio.set_consistent_text("X");
        studio.add_unit("Y");
        studio.generate_master()?;
        assert!(studio.wait_idle(WAIT));
        Ok((studio, temp))
    }

    #[test]
    fn two_uploads_then_master_generation() -> anyhow::Result<()> {
        let (studio, _temp) = studio_with_master()?;
        assert!(studio
            .references()
            .iter()
            .all(|image| image.status == ImageStatus::Ready));
        let master = studio.master_state();
        assert_eq!(master.artifact, Some(ArtifactRef::new("master:2:X|Y")));
        assert!(!master.stale);
        assert!(!master.loading);
        Ok(())
    }

    #[test]
    fn generation_is_rejected_while_images_process() {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        studio.set_consistent_text("mug");
        assert_eq!(
            studio.generate_master(),
            Err(ValidationError::NoReferenceImages)
        );
        studio.add_reference_images(vec![upload(b'A', 1), upload(b'A', 2)]);
        assert_eq!(
            studio.generate_master(),
            Err(ValidationError::ReferencesProcessing(2))
        );
        assert!(!studio.master_state().loading);
    }

    #[test]
    fn uploads_beyond_capacity_are_dropped() {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        studio.add_reference_images((0..6).map(|n| upload(b'A', n)).collect());
        let accepted = studio.add_reference_images((10..15).map(|n| upload(b'A', n)).collect());
        assert_eq!(accepted.len(), DEFAULT_REFERENCE_CAPACITY - 6);
        assert_eq!(studio.references().len(), DEFAULT_REFERENCE_CAPACITY);
        assert!(studio.wait_idle(WAIT));
    }

    #[test]
    fn failed_cleanup_uses_original_and_reports_image() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        let ids = studio.add_reference_images(vec![upload(b'X', 1), upload(b'A', 2)]);
        assert!(studio.wait_idle(WAIT));

        let Some(failed) = studio.references().get(ids[0]) else {
            panic!("image should exist");
        };
        assert_eq!(failed.status, ImageStatus::Failed);
        assert_eq!(failed.processed_preview.as_ref(), Some(&failed.original_preview));
        assert!(failed.error.as_deref().is_some_and(|err| !err.is_empty()));
        assert_eq!(
            studio.references().get(ids[1]).map(|image| image.status),
            Some(ImageStatus::Ready)
        );
        assert_eq!(studio.notices().len(), 1);
        assert_eq!(studio.notices()[0].scope, NoticeScope::Image(ids[0]));

        studio.set_consistent_text("still usable");
        studio.generate_master()?;
        assert!(studio.wait_idle(WAIT));
        assert!(studio.master_state().artifact.is_some());
        Ok(())
    }

    #[test]
    fn deleted_image_is_not_resurrected_by_late_cleanup() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        let ids = studio.add_reference_images(vec![upload(b'A', 1), upload(b'A', 2)]);
        assert!(studio.remove_reference_image(ids[0]));
        assert!(studio.wait_idle(WAIT));

        assert!(studio.references().get(ids[0]).is_none());
        assert_eq!(studio.references().len(), 1);
        let kinds = studio.events().recorded()?;
        assert!(kinds.contains(&EventKind::StaleCompletionDropped));
        Ok(())
    }

    #[test]
    fn consistency_edit_marks_stale_only_with_master() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        studio.set_consistent_text("before any master");
        assert!(!studio.master_state().stale);

        let (mut studio, _temp) = studio_with_master()?;
        let before = studio.master_state().artifact;
        studio.set_consistent_text("X, now matte");
        let state = studio.master_state();
        assert!(state.stale);
        assert_eq!(state.artifact, before);

        studio.generate_master()?;
        assert!(studio.wait_idle(WAIT));
        assert!(!studio.master_state().stale);
        Ok(())
    }

    #[test]
    fn editing_later_units_never_marks_stale() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let second = studio.add_unit("side view");
        studio.set_unit_prompt(&second, "back view")?;
        assert!(!studio.master_state().stale);

        let lead = studio.prompts().unit_ids()[0].clone();
        studio.set_unit_prompt(&lead, "Y, closer")?;
        assert!(studio.master_state().stale);
        Ok(())
    }

    #[test]
    fn second_master_request_is_rejected_while_loading() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        studio.generate_master()?;
        assert_eq!(studio.generate_master(), Err(ValidationError::MasterBusy));
        studio.set_modification_instruction("warmer");
        assert_eq!(studio.modify_master(), Err(ValidationError::MasterBusy));
        assert_eq!(studio.generate_all(), Err(ValidationError::MasterBusy));
        assert!(studio.wait_idle(WAIT));
        Ok(())
    }

    #[test]
    fn failed_initial_master_leaves_no_artifact() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        studio.add_reference_images(vec![upload(b'A', 1)]);
        assert!(studio.wait_idle(WAIT));
        studio.set_consistent_text("FAIL please");
        studio.generate_master()?;
        assert!(studio.wait_idle(WAIT));
        assert_eq!(studio.master_state(), MasterImageState::default());
        assert_eq!(studio.notices().last().map(|n| &n.scope), Some(&NoticeScope::Master));
        Ok(())
    }

    #[test]
    fn modification_keeps_instruction_until_it_succeeds() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let original = studio.master_state().artifact;

        assert_eq!(studio.modify_master(), Err(ValidationError::EmptyInstruction));
        studio.set_modification_instruction("FAIL: brighter");
        studio.modify_master()?;
        assert!(studio.wait_idle(WAIT));
        assert_eq!(studio.master_state().artifact, original);
        assert_eq!(studio.instruction(), "FAIL: brighter");

        studio.set_modification_instruction("brighter");
        studio.set_consistent_text("X2");
        assert!(studio.master_state().stale);
        studio.modify_master()?;
        assert!(studio.wait_idle(WAIT));
        assert_eq!(
            studio.master_state().artifact,
            Some(ArtifactRef::new("master:2:X|Y+brighter"))
        );
        assert_eq!(studio.instruction(), "");
        assert!(!studio.master_state().stale);
        Ok(())
    }

    #[test]
    fn batch_with_one_failure_raises_one_notice() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let lead = studio.prompts().unit_ids()[0].clone();
        let failing = studio.add_unit("FAIL side view");
        let third = studio.add_unit("top view");
        studio.take_notices();

        assert_eq!(studio.generate_all()?, 3);
        assert_eq!(studio.slots().filter(|(_, slot)| slot.loading).count(), 3);
        assert!(studio.wait_idle(WAIT));

        let lead_slot = studio.slot(&lead).cloned().unwrap_or_default();
        assert_eq!(lead_slot.artifact, Some(ArtifactRef::new("variant:Y:false:false")));
        assert!(lead_slot.error.is_none());
        let third_slot = studio.slot(&third).cloned().unwrap_or_default();
        assert_eq!(third_slot.artifact, Some(ArtifactRef::new("variant:top view:false:false")));
        let failed_slot = studio.slot(&failing).cloned().unwrap_or_default();
        assert!(failed_slot.artifact.is_none());
        assert_eq!(failed_slot.error.as_deref(), Some("variant rejected"));
        assert!(!failed_slot.loading);

        let notices = studio.take_notices();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].scope, NoticeScope::Batch);
        assert!(notices[0].message.starts_with("1 of 3"));
        let kinds = studio.events().recorded()?;
        let failures = kinds.iter().filter(|kind| **kind == EventKind::VariantFailed);
        assert_eq!(failures.count(), 1);
        Ok(())
    }

    #[test]
    fn regenerating_one_unit_leaves_siblings_untouched() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let lead = studio.prompts().unit_ids()[0].clone();
        let second = studio.add_unit("FAIL at first");
        studio.generate_all()?;
        assert!(studio.wait_idle(WAIT));
        studio.take_notices();

        studio.set_unit_prompt(&second, "side view")?;
        studio.regenerate_unit(&second)?;
        assert!(studio.slot(&second).is_some_and(|slot| slot.loading));
        assert!(studio.slot(&lead).is_some_and(|slot| !slot.loading));
        assert!(studio.wait_idle(WAIT));

        assert_eq!(
            studio.slot(&second).and_then(|slot| slot.artifact.clone()),
            Some(ArtifactRef::new("variant:side view:true:false"))
        );
        assert_eq!(
            studio.slot(&lead).and_then(|slot| slot.artifact.clone()),
            Some(ArtifactRef::new("variant:Y:false:false"))
        );
        assert!(studio.take_notices().is_empty());
        Ok(())
    }

    #[test]
    fn failed_regeneration_keeps_previous_variant() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let lead = studio.prompts().unit_ids()[0].clone();
        studio.generate_all()?;
        assert!(studio.wait_idle(WAIT));
        studio.set_unit_prompt(&lead, "FAIL now")?;
        studio.regenerate_unit(&lead)?;
        assert!(studio.wait_idle(WAIT));

        let slot = studio.slot(&lead).cloned().unwrap_or_default();
        assert_eq!(slot.artifact, Some(ArtifactRef::new("variant:Y:false:false")));
        assert_eq!(slot.error.as_deref(), Some("variant rejected"));
        let summary = studio.summary();
        assert_eq!(summary.generated_count(), 0);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(
            studio.notices().last().map(|notice| &notice.scope),
            Some(&NoticeScope::Unit(lead))
        );
        Ok(())
    }

    #[test]
    fn removing_a_unit_purges_its_result() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let second = studio.add_unit("side view");
        studio.generate_all()?;
        studio.remove_unit(&second)?;
        assert!(studio.slot(&second).is_none());
        assert!(studio.wait_idle(WAIT));

        assert!(studio.slot(&second).is_none());
        assert!(studio.prompts().unit(&second).is_none());
        let ids = studio.prompts().unit_ids();
        assert!(studio.slots().all(|(id, _)| ids.contains(id)));
        assert_eq!(
            studio.remove_unit(&second),
            Err(ValidationError::UnknownUnit(second.to_string()))
        );
        Ok(())
    }

    #[test]
    fn batch_requires_master_and_units() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Immediate);
        assert_eq!(studio.generate_all(), Err(ValidationError::MissingMaster));

        let (mut studio, _temp) = studio_with_master()?;
        let lead = studio.prompts().unit_ids()[0].clone();
        studio.remove_unit(&lead)?;
        assert_eq!(studio.generate_all(), Err(ValidationError::NoUnits));
        Ok(())
    }

    #[test]
    fn deferred_mode_cleans_in_sequence_then_analyzes() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Deferred);
        let ids = studio.add_reference_images(vec![upload(b'W', 1), upload(b'A', 2)]);
        assert_eq!(studio.in_flight(), 0);
        studio.set_consistent_text("mug");
        assert_eq!(
            studio.generate_master(),
            Err(ValidationError::ReferencesProcessing(2))
        );

        studio.start_analysis(true)?;
        assert_eq!(studio.in_flight(), 1);
        assert_eq!(studio.start_analysis(true), Err(ValidationError::AnalysisBusy));
        assert!(studio.wait_idle(WAIT));
        assert!(!studio.is_analyzing());

        let watermarked = studio.references().get(ids[0]).cloned();
        let clean = studio.references().get(ids[1]).cloned();
        let (Some(watermarked), Some(clean)) = (watermarked, clean) else {
            panic!("both images should exist");
        };
        assert!(watermarked.preview().as_str().starts_with("clean:"));
        assert_eq!(clean.preview(), &clean.original_preview);
        assert_eq!(clean.status, ImageStatus::Ready);

        assert_eq!(
            studio.prompts().consistent(),
            "Subject: subject seen in 2 images\nVisual quality: crisp"
        );
        assert_eq!(studio.prompts().unit_count(), 1);
        assert_eq!(studio.prompts().lead_prompt(), "Shot 1: three-quarter view");
        Ok(())
    }

    #[test]
    fn deferred_removal_mid_pass_still_analyzes() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with(ProcessingMode::Deferred);
        let ids = studio.add_reference_images(vec![upload(b'W', 1), upload(b'A', 2)]);
        studio.start_analysis(true)?;
        assert_eq!(studio.in_flight(), 1);

        assert!(studio.remove_reference_image(ids[0]));
        assert!(studio.is_analyzing());
        assert!(studio.wait_idle(WAIT));

        assert!(!studio.is_analyzing());
        assert_eq!(studio.references().len(), 1);
        assert!(studio.references().get(ids[0]).is_none());
        let status = studio.references().get(ids[1]).map(|image| image.status);
        assert_eq!(status, Some(ImageStatus::Ready));
        assert_eq!(
            studio.prompts().consistent(),
            "Subject: subject seen in 1 images\nVisual quality: crisp"
        );
        let kinds = studio.events().recorded()?;
        assert!(kinds.contains(&EventKind::StaleCompletionDropped));
        assert!(kinds.contains(&EventKind::AnalysisApplied));
        Ok(())
    }

    #[test]
    fn partial_reanalysis_keeps_unit_prompts() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let lead = studio.prompts().unit_ids()[0].clone();
        studio.start_analysis(false)?;
        assert!(studio.wait_idle(WAIT));
        assert_eq!(studio.prompts().unit(&lead).map(|u| u.prompt.as_str()), Some("Y"));
        assert!(studio.prompts().consistent().starts_with("Subject:"));
        assert!(studio.master_state().stale);
        Ok(())
    }

    #[test]
    fn unit_reference_analysis_seeds_empty_prompt() -> anyhow::Result<()> {
        let (mut studio, _temp) = studio_with_master()?;
        let unit = studio.add_unit("");
        assert_eq!(
            studio.analyze_unit_reference(&unit),
            Err(ValidationError::MissingUnitReference(unit.to_string()))
        );
        studio.attach_unit_reference(&unit, upload(b'A', 9))?;
        studio.analyze_unit_reference(&unit)?;
        assert!(studio.wait_idle(WAIT));

        let Some(state) = studio.prompts().unit(&unit) else {
            panic!("unit should exist");
        };
        assert_eq!(state.prompt, "Shot 1: three-quarter view");
        assert!(state
            .reference
            .as_ref()
            .is_some_and(|reference| reference.analysis.is_some() && !reference.analyzing));

        studio.regenerate_unit(&unit)?;
        assert!(studio.wait_idle(WAIT));
        assert!(studio
            .slot(&unit)
            .and_then(|slot| slot.artifact.as_ref())
            .is_some_and(|artifact| artifact.as_str().ends_with(":true:true")));
        Ok(())
    }

    #[test]
    fn knowledge_base_selection_replaces_or_appends() -> anyhow::Result<()> {
        let (mut studio, temp) = studio_with(ProcessingMode::Immediate);
        let kb = JsonKnowledgeBase::new(temp.path().join("kb"), "tester");
        let full = kb.save(NewEntry::full_prompt("linen backdrop", "folded shirt"), None)?;
        let fragment = kb.save(
            NewEntry::fragment(KbCategory::Lighting, "soft window light"),
            None,
        )?;

        studio.set_consistent_text("old consistent");
        studio.add_unit("old lead");
        studio.add_unit("second");
        let third = studio.add_unit("third");

        studio.select_knowledge_entry(&kb, &full.id, &PromptField::Consistent)?;
        assert_eq!(studio.prompts().consistent(), "linen backdrop");
        assert_eq!(studio.prompts().lead_prompt(), "folded shirt");

        studio.select_knowledge_entry(&kb, &fragment.id, &PromptField::Unit(third.clone()))?;
        assert_eq!(
            studio.prompts().unit(&third).map(|u| u.prompt.as_str()),
            Some("third soft window light")
        );
        assert_eq!(studio.prompts().unit_at(1).map(|u| u.prompt.as_str()), Some("second"));
        assert_eq!(kb.get(&fragment.id)?.map(|entry| entry.usage_count), Some(1));

        kb.soft_delete(&[fragment.id.clone()])?;
        assert!(matches!(
            studio.select_knowledge_entry(&kb, &fragment.id, &PromptField::Consistent),
            Err(StudioError::KnowledgeBase(_))
        ));
        Ok(())
    }

    #[test]
    fn saving_prompts_to_knowledge_base() -> anyhow::Result<()> {
        let (mut studio, temp) = studio_with(ProcessingMode::Immediate);
        let kb = JsonKnowledgeBase::new(temp.path().join("kb"), "tester");
        assert!(matches!(
            studio.save_full_prompt(&kb),
            Err(StudioError::Validation(ValidationError::EmptyPrompt))
        ));

        studio.add_reference_images(vec![upload(b'A', 1)]);
        studio.set_consistent_text("walnut table");
        studio.add_unit("overhead shot");
        let entry = studio.save_full_prompt(&kb)?;
        assert_eq!(entry.category, KbCategory::FullPrompt);
        assert!(kb.image_path(&entry).is_some_and(|path| path.exists()));

        let fragment = studio.save_fragment(&kb, KbCategory::Style, " film grain ", None)?;
        assert_eq!(fragment.content, "film grain");
        assert_eq!(kb.list(false)?.len(), 2);
        assert!(studio.wait_idle(WAIT));
        Ok(())
    }

    #[test]
    fn rotation_is_forwarded_to_the_service() {
        let (studio, _temp) = studio_with(ProcessingMode::Immediate);
        assert!(studio.rotate_api_key("gemini", Some("new".to_string())));
        assert!(!studio.rotate_api_key("replicate", None));
    }

    #[test]
    fn finish_writes_summary_next_to_events() -> anyhow::Result<()> {
        let (mut studio, temp) = studio_with_master()?;
        studio.add_unit("FAIL");
        studio.generate_all()?;
        assert!(studio.wait_idle(WAIT));

        let path = temp.path().join("summary.json");
        let summary = studio.finish(&path)?;
        assert_eq!(summary.reference_images, 2);
        assert_eq!(summary.generated_count(), 1);
        assert_eq!(summary.failed_count(), 1);
        assert_eq!(summary.master_artifact.as_deref(), Some("master:2:X|Y"));

        let written: Value = serde_json::from_str(&std::fs::read_to_string(&path)?)?;
        assert_eq!(written["failed_units"], json!(1));
        let kinds = studio.events().recorded()?;
        assert_eq!(kinds.first(), Some(&EventKind::SessionStarted));
        assert_eq!(kinds.last(), Some(&EventKind::SessionFinished));
        Ok(())
    }
}

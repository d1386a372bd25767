use indexmap::{IndexMap, IndexSet};
use retouch_contracts::media::ArtifactRef;

use crate::composer::UnitId;
use crate::error::{GenerationError, ValidationError};
use crate::master::MasterImageState;
use crate::references::Readiness;

/// Generated result for one variable-prompt unit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GeneratedSlot {
    pub artifact: Option<ArtifactRef>,
    pub loading: bool,
    pub error: Option<String>,
    ticket: u64,
}

/// Identifies one dispatched variant call. Only the newest ticket for a
/// slot is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotTicket {
    pub unit: UnitId,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchSummary {
    pub batch: u64,
    pub total: usize,
    pub failed: Vec<UnitId>,
}

impl BatchSummary {
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// The one user-facing notice for a batch with failures.
    pub fn notice(&self) -> Option<String> {
        if self.failed.is_empty() {
            return None;
        }
        Some(format!(
            "{} of {} pictures failed to generate. Retry them individually.",
            self.failed.len(),
            self.total
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotOutcome {
    Generated,
    Failed(String),
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotCompletion {
    pub outcome: SlotOutcome,
    /// Whether the slot was still counted by a running batch.
    pub batched: bool,
    /// Set when this completion was the last outstanding one of a batch.
    pub finished_batch: Option<BatchSummary>,
}

impl SlotCompletion {
    fn ignored() -> Self {
        Self {
            outcome: SlotOutcome::Ignored,
            batched: false,
            finished_batch: None,
        }
    }
}

#[derive(Debug, Clone)]
struct BatchProgress {
    id: u64,
    total: usize,
    pending: IndexSet<UnitId>,
    failed: Vec<UnitId>,
}

/// Fans generation out over units and tracks each slot on its own.
#[derive(Debug, Default)]
pub struct BatchOrchestrator {
    slots: IndexMap<UnitId, GeneratedSlot>,
    batch: Option<BatchProgress>,
    next_ticket: u64,
    next_batch: u64,
}

impl BatchOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn slot(&self, unit: &UnitId) -> Option<&GeneratedSlot> {
        self.slots.get(unit)
    }

    pub fn slots(&self) -> impl Iterator<Item = (&UnitId, &GeneratedSlot)> {
        self.slots.iter()
    }

    pub fn loading_count(&self) -> usize {
        self.slots.values().filter(|slot| slot.loading).count()
    }

    pub fn batch_in_progress(&self) -> bool {
        self.batch.is_some()
    }

    /// Preconditions shared by batch and single generation. Returns the
    /// master artifact the variants are generated against.
    pub fn check_ready(
        master: &MasterImageState,
        readiness: Readiness,
    ) -> Result<ArtifactRef, ValidationError> {
        if master.loading {
            return Err(ValidationError::MasterBusy);
        }
        let Some(artifact) = master.artifact.clone() else {
            return Err(ValidationError::MissingMaster);
        };
        if readiness.total == 0 {
            return Err(ValidationError::NoReferenceImages);
        }
        if !readiness.all_settled() {
            return Err(ValidationError::ReferencesProcessing(readiness.unsettled));
        }
        Ok(artifact)
    }

    /// Puts every unit's slot into loading before any call is issued and
    /// starts tracking a new batch. A batch still in progress is superseded.
    pub fn begin_all(&mut self, units: &[UnitId]) -> Result<Vec<SlotTicket>, ValidationError> {
        if units.is_empty() {
            return Err(ValidationError::NoUnits);
        }
        let tickets: Vec<SlotTicket> = units.iter().map(|unit| self.arm(unit)).collect();
        self.next_batch += 1;
        self.batch = Some(BatchProgress {
            id: self.next_batch,
            total: units.len(),
            pending: units.iter().cloned().collect(),
            failed: Vec::new(),
        });
        Ok(tickets)
    }

    /// Arms one slot without touching the others. If the unit was still
    /// pending in a batch, the batch stops waiting for it.
    pub fn begin_single(&mut self, unit: &UnitId) -> (SlotTicket, Option<BatchSummary>) {
        let ticket = self.arm(unit);
        let finished = self.forget_pending(unit);
        (ticket, finished)
    }

    fn arm(&mut self, unit: &UnitId) -> SlotTicket {
        self.next_ticket += 1;
        let slot = self.slots.entry(unit.clone()).or_default();
        slot.loading = true;
        slot.error = None;
        slot.ticket = self.next_ticket;
        SlotTicket {
            unit: unit.clone(),
            seq: self.next_ticket,
        }
    }

    /// Applies a variant result. A failure keeps the slot's previous
    /// artifact next to the error.
    pub fn complete(
        &mut self,
        ticket: &SlotTicket,
        result: Result<ArtifactRef, GenerationError>,
    ) -> SlotCompletion {
        let Some(slot) = self.slots.get_mut(&ticket.unit) else {
            return SlotCompletion::ignored();
        };
        if slot.ticket != ticket.seq || !slot.loading {
            return SlotCompletion::ignored();
        }
        slot.loading = false;
        let outcome = match result {
            Ok(artifact) => {
                slot.artifact = Some(artifact);
                slot.error = None;
                SlotOutcome::Generated
            }
            Err(err) => {
                slot.error = Some(err.message.clone());
                SlotOutcome::Failed(err.message)
            }
        };

        let mut finished_batch = None;
        let mut batched = false;
        if let Some(batch) = self.batch.as_mut() {
            if batch.pending.shift_remove(&ticket.unit) {
                batched = true;
                if matches!(outcome, SlotOutcome::Failed(_)) {
                    batch.failed.push(ticket.unit.clone());
                }
                if batch.pending.is_empty() {
                    finished_batch = self.finish_batch();
                }
            }
        }
        SlotCompletion {
            outcome,
            batched,
            finished_batch,
        }
    }

    /// Drops a unit's slot together with its place in any running batch.
    pub fn remove_unit(&mut self, unit: &UnitId) -> Option<BatchSummary> {
        self.slots.shift_remove(unit);
        if let Some(batch) = self.batch.as_mut() {
            batch.failed.retain(|failed| failed != unit);
        }
        self.forget_pending(unit)
    }

    fn forget_pending(&mut self, unit: &UnitId) -> Option<BatchSummary> {
        let batch = self.batch.as_mut()?;
        if !batch.pending.shift_remove(unit) {
            return None;
        }
        if batch.pending.is_empty() {
            return self.finish_batch();
        }
        None
    }

    fn finish_batch(&mut self) -> Option<BatchSummary> {
        let batch = self.batch.take()?;
        Some(BatchSummary {
            batch: batch.id,
            total: batch.total,
            failed: batch.failed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn units(n: usize) -> Vec<UnitId> {
        (0..n).map(|idx| UnitId::from(format!("u{idx}").as_str())).collect()
    }

    fn ready_master() -> MasterImageState {
        MasterImageState {
            artifact: Some(ArtifactRef::new("master")),
            loading: false,
            stale: false,
        }
    }

    #[test]
    fn requires_settled_master_and_references() {
        let readiness = Readiness {
            total: 1,
            unsettled: 0,
            failed: 0,
        };
        assert_eq!(
            BatchOrchestrator::check_ready(&MasterImageState::default(), readiness),
            Err(ValidationError::MissingMaster)
        );
        let mut loading = ready_master();
        loading.loading = true;
        assert_eq!(
            BatchOrchestrator::check_ready(&loading, readiness),
            Err(ValidationError::MasterBusy)
        );
        let processing = Readiness {
            unsettled: 1,
            ..readiness
        };
        assert_eq!(
            BatchOrchestrator::check_ready(&ready_master(), processing),
            Err(ValidationError::ReferencesProcessing(1))
        );
        assert_eq!(
            BatchOrchestrator::check_ready(&ready_master(), readiness),
            Ok(ArtifactRef::new("master"))
        );
    }

    #[test]
    fn every_slot_is_loading_before_any_completion() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(4);
        let tickets = batch.begin_all(&ids)?;
        assert_eq!(tickets.len(), 4);
        assert_eq!(batch.loading_count(), 4);
        assert!(batch.begin_all(&[]).is_err());
        Ok(())
    }

    #[test]
    fn out_of_order_completions_are_independent() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(3);
        let tickets = batch.begin_all(&ids)?;

        let last = batch.complete(&tickets[2], Ok(ArtifactRef::new("c")));
        assert_eq!(last.outcome, SlotOutcome::Generated);
        let middle = batch.complete(&tickets[1], Err(GenerationError::new("rejected")));
        assert_eq!(middle.outcome, SlotOutcome::Failed("rejected".to_string()));
        assert!(middle.finished_batch.is_none());
        let first = batch.complete(&tickets[0], Ok(ArtifactRef::new("a")));

        let Some(summary) = first.finished_batch else {
            panic!("batch should finish with the last completion");
        };
        assert_eq!(summary.failed, vec![ids[1].clone()]);
        assert_eq!(
            summary.notice().as_deref(),
            Some("1 of 3 pictures failed to generate. Retry them individually.")
        );
        assert_eq!(
            batch.slot(&ids[0]).and_then(|s| s.artifact.clone()),
            Some(ArtifactRef::new("a"))
        );
        assert_eq!(batch.slot(&ids[1]).and_then(|s| s.artifact.clone()), None);
        assert_eq!(
            batch.slot(&ids[1]).and_then(|s| s.error.clone()).as_deref(),
            Some("rejected")
        );
        assert!(!batch.batch_in_progress());
        Ok(())
    }

    #[test]
    fn failure_retains_previous_artifact() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(1);
        let (ticket, _) = batch.begin_single(&ids[0]);
        batch.complete(&ticket, Ok(ArtifactRef::new("v1")));
        let (ticket, _) = batch.begin_single(&ids[0]);
        let done = batch.complete(&ticket, Err(GenerationError::new("nope")));
        assert!(done.finished_batch.is_none());
        let slot = batch.slot(&ids[0]).cloned().unwrap_or_default();
        assert_eq!(slot.artifact, Some(ArtifactRef::new("v1")));
        assert_eq!(slot.error.as_deref(), Some("nope"));
        assert!(!slot.loading);
        Ok(())
    }

    #[test]
    fn single_regeneration_leaves_siblings_alone() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(2);
        let tickets = batch.begin_all(&ids)?;
        batch.complete(&tickets[0], Ok(ArtifactRef::new("a")));
        batch.complete(&tickets[1], Ok(ArtifactRef::new("b")));

        let (_, finished) = batch.begin_single(&ids[1]);
        assert!(finished.is_none());
        let first = batch.slot(&ids[0]).cloned().unwrap_or_default();
        assert!(!first.loading);
        assert_eq!(first.artifact, Some(ArtifactRef::new("a")));
        assert!(batch.slot(&ids[1]).is_some_and(|slot| slot.loading));
        Ok(())
    }

    #[test]
    fn superseded_ticket_is_dropped() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(2);
        let tickets = batch.begin_all(&ids)?;
        let (retry, finished) = batch.begin_single(&ids[0]);
        assert!(finished.is_none());

        let stale = batch.complete(&tickets[0], Ok(ArtifactRef::new("old")));
        assert_eq!(stale.outcome, SlotOutcome::Ignored);
        let done = batch.complete(&tickets[1], Ok(ArtifactRef::new("b")));
        assert!(done.finished_batch.is_some_and(|summary| !summary.has_failures()));
        batch.complete(&retry, Ok(ArtifactRef::new("new")));
        assert_eq!(
            batch.slot(&ids[0]).and_then(|s| s.artifact.clone()),
            Some(ArtifactRef::new("new"))
        );
        Ok(())
    }

    #[test]
    fn removing_a_unit_drops_its_slot_and_late_result() -> anyhow::Result<()> {
        let mut batch = BatchOrchestrator::new();
        let ids = units(2);
        let tickets = batch.begin_all(&ids)?;
        batch.complete(&tickets[1], Ok(ArtifactRef::new("b")));

        let finished = batch.remove_unit(&ids[0]);
        assert!(finished.is_some());
        assert!(batch.slot(&ids[0]).is_none());
        let late = batch.complete(&tickets[0], Ok(ArtifactRef::new("ghost")));
        assert_eq!(late.outcome, SlotOutcome::Ignored);
        assert!(batch.slot(&ids[0]).is_none());
        Ok(())
    }
}

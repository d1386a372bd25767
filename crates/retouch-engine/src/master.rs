use retouch_contracts::media::ArtifactRef;

use crate::composer::EditEffect;
use crate::error::{GenerationError, ValidationError};
use crate::references::Readiness;
use crate::staleness::StalenessTracker;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterOp {
    Generate,
    Modify,
}

impl MasterOp {
    pub fn as_str(self) -> &'static str {
        match self {
            MasterOp::Generate => "generate",
            MasterOp::Modify => "modify",
        }
    }
}

/// Snapshot of the master image as shown to the user. `stale` is only
/// meaningful while `artifact` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MasterImageState {
    pub artifact: Option<ArtifactRef>,
    pub loading: bool,
    pub stale: bool,
}

/// Token for the single outstanding master request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MasterTicket {
    pub op: MasterOp,
    pub seq: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MasterOutcome {
    Ready { op: MasterOp, replaced: bool },
    Failed { op: MasterOp, message: String },
    Ignored,
}

/// Owns the master artifact. Transitions:
/// `empty -> loading -> ready`, `ready -> loading -> ready`; a failure goes
/// back to whatever artifact (or none) was there before.
#[derive(Debug, Default)]
pub struct MasterOrchestrator {
    artifact: Option<ArtifactRef>,
    in_flight: Option<MasterTicket>,
    staleness: StalenessTracker,
    next_seq: u64,
}

impl MasterOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> MasterImageState {
        MasterImageState {
            artifact: self.artifact.clone(),
            loading: self.in_flight.is_some(),
            stale: self.artifact.is_some() && self.staleness.is_stale(),
        }
    }

    pub fn artifact(&self) -> Option<&ArtifactRef> {
        self.artifact.as_ref()
    }

    pub fn is_loading(&self) -> bool {
        self.in_flight.is_some()
    }

    /// Checks the preconditions for a generation and marks it in flight.
    pub fn begin_generate(
        &mut self,
        readiness: Readiness,
        consistent: &str,
        lead_prompt: &str,
    ) -> Result<MasterTicket, ValidationError> {
        self.check_common(readiness)?;
        if consistent.trim().is_empty() && lead_prompt.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        Ok(self.start(MasterOp::Generate))
    }

    /// Checks the preconditions for a modification and marks it in flight.
    /// Returns the artifact to modify alongside the ticket.
    pub fn begin_modify(
        &mut self,
        readiness: Readiness,
        instruction: &str,
    ) -> Result<(MasterTicket, ArtifactRef), ValidationError> {
        self.check_common(readiness)?;
        let Some(current) = self.artifact.clone() else {
            return Err(ValidationError::MissingMaster);
        };
        if instruction.trim().is_empty() {
            return Err(ValidationError::EmptyInstruction);
        }
        Ok((self.start(MasterOp::Modify), current))
    }

    fn check_common(&self, readiness: Readiness) -> Result<(), ValidationError> {
        if self.in_flight.is_some() {
            return Err(ValidationError::MasterBusy);
        }
        if readiness.total == 0 {
            return Err(ValidationError::NoReferenceImages);
        }
        if !readiness.all_settled() {
            return Err(ValidationError::ReferencesProcessing(readiness.unsettled));
        }
        Ok(())
    }

    fn start(&mut self, op: MasterOp) -> MasterTicket {
        self.next_seq += 1;
        let ticket = MasterTicket {
            op,
            seq: self.next_seq,
        };
        self.in_flight = Some(ticket);
        ticket
    }

    pub fn complete(
        &mut self,
        ticket: MasterTicket,
        result: Result<ArtifactRef, GenerationError>,
    ) -> MasterOutcome {
        if self.in_flight != Some(ticket) {
            return MasterOutcome::Ignored;
        }
        self.in_flight = None;
        match result {
            Ok(artifact) => {
                let replaced = self.artifact.replace(artifact).is_some();
                self.staleness.clear();
                MasterOutcome::Ready {
                    op: ticket.op,
                    replaced,
                }
            }
            Err(err) => MasterOutcome::Failed {
                op: ticket.op,
                message: err.message,
            },
        }
    }

    /// Feeds a prompt edit to the staleness tracker. Returns true when the
    /// master just became stale.
    pub fn observe_edit(&mut self, effect: EditEffect) -> bool {
        self.staleness.observe_edit(effect, self.artifact.is_some())
    }
}

//! Runs generation-service calls on worker threads.
//!
//! Each dispatched [`Job`] produces exactly one [`Completion`] on the shared
//! channel: the job's own result, or a failure if the worker could not be
//! spawned or panicked. The owner drains the channel and applies completions
//! one at a time.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use retouch_contracts::analysis::AnalysisResult;
use retouch_contracts::media::{ArtifactRef, ImageData};

use crate::batch::SlotTicket;
use crate::composer::UnitId;
use crate::error::GenerationError;
use crate::master::MasterTicket;
use crate::references::{CleanupResult, ImageId};
use crate::service::{GenerationResult, GenerationService, VariantRequest};

#[derive(Debug)]
pub(crate) enum Job {
    Cleanup {
        image: ImageId,
        data: ImageData,
        /// Deferred mode asks the detector first and only removes on a hit.
        detect_first: bool,
    },
    Analysis {
        pass: u64,
        images: Vec<ArtifactRef>,
    },
    UnitAnalysis {
        unit: UnitId,
        key: u64,
        image: ArtifactRef,
    },
    Master {
        ticket: MasterTicket,
        images: Vec<ArtifactRef>,
        consistent: String,
        variable: String,
        modify: Option<(ArtifactRef, String)>,
    },
    Variant {
        ticket: SlotTicket,
        images: Vec<ArtifactRef>,
        master: ArtifactRef,
        consistent: String,
        variable: String,
        is_regeneration: bool,
        reference: Option<ArtifactRef>,
    },
}

/// Identity of a job, kept apart from its payload so a failure completion
/// can still be built after the payload moved into the worker.
#[derive(Debug, Clone)]
enum JobKey {
    Cleanup(ImageId),
    Analysis(u64),
    UnitAnalysis { unit: UnitId, key: u64 },
    Master(MasterTicket),
    Variant(SlotTicket),
}

#[derive(Debug)]
pub(crate) enum Completion {
    Cleanup {
        image: ImageId,
        result: CleanupResult,
    },
    Analysis {
        pass: u64,
        result: GenerationResult<AnalysisResult>,
    },
    UnitAnalysis {
        unit: UnitId,
        key: u64,
        result: GenerationResult<AnalysisResult>,
    },
    Master {
        ticket: MasterTicket,
        result: GenerationResult<ArtifactRef>,
    },
    Variant {
        ticket: SlotTicket,
        result: GenerationResult<ArtifactRef>,
    },
}

impl JobKey {
    fn fail(self, err: GenerationError) -> Completion {
        match self {
            JobKey::Cleanup(image) => Completion::Cleanup {
                image,
                result: CleanupResult::Failed(err),
            },
            JobKey::Analysis(pass) => Completion::Analysis {
                pass,
                result: Err(err),
            },
            JobKey::UnitAnalysis { unit, key } => Completion::UnitAnalysis {
                unit,
                key,
                result: Err(err),
            },
            JobKey::Master(ticket) => Completion::Master {
                ticket,
                result: Err(err),
            },
            JobKey::Variant(ticket) => Completion::Variant {
                ticket,
                result: Err(err),
            },
        }
    }
}

impl Job {
    fn key(&self) -> JobKey {
        match self {
            Job::Cleanup { image, .. } => JobKey::Cleanup(*image),
            Job::Analysis { pass, .. } => JobKey::Analysis(*pass),
            Job::UnitAnalysis { unit, key, .. } => JobKey::UnitAnalysis {
                unit: unit.clone(),
                key: *key,
            },
            Job::Master { ticket, .. } => JobKey::Master(*ticket),
            Job::Variant { ticket, .. } => JobKey::Variant(ticket.clone()),
        }
    }

    fn thread_name(&self) -> &'static str {
        match self {
            Job::Cleanup { .. } => "retouch-cleanup",
            Job::Analysis { .. } => "retouch-analysis",
            Job::UnitAnalysis { .. } => "retouch-unit-analysis",
            Job::Master { .. } => "retouch-master",
            Job::Variant { .. } => "retouch-variant",
        }
    }

    fn run(self, service: &dyn GenerationService) -> Completion {
        match self {
            Job::Cleanup {
                image,
                data,
                detect_first,
            } => Completion::Cleanup {
                image,
                result: run_cleanup(service, &data, detect_first),
            },
            Job::Analysis { pass, images } => Completion::Analysis {
                pass,
                result: service.analyze_images(&images),
            },
            Job::UnitAnalysis { unit, key, image } => Completion::UnitAnalysis {
                unit,
                key,
                result: service.analyze_images(std::slice::from_ref(&image)),
            },
            Job::Master {
                ticket,
                images,
                consistent,
                variable,
                modify,
            } => {
                let result = match modify {
                    Some((master, instruction)) => service.modify_master_image(
                        &images,
                        &master,
                        &consistent,
                        &variable,
                        &instruction,
                    ),
                    None => service.generate_master_image(&images, &consistent, &variable),
                };
                Completion::Master { ticket, result }
            }
            Job::Variant {
                ticket,
                images,
                master,
                consistent,
                variable,
                is_regeneration,
                reference,
            } => {
                let request = VariantRequest {
                    images: &images,
                    master: &master,
                    consistent_prompt: &consistent,
                    variable_prompt: &variable,
                    is_regeneration,
                    reference: reference.as_ref(),
                };
                Completion::Variant {
                    ticket,
                    result: service.generate_single_from_master(&request),
                }
            }
        }
    }
}

fn run_cleanup(
    service: &dyn GenerationService,
    data: &ImageData,
    detect_first: bool,
) -> CleanupResult {
    if detect_first {
        match service.detect_watermark(data) {
            Ok(report) if !report.has_watermark => return CleanupResult::Untouched,
            Ok(_) => {}
            Err(err) => return CleanupResult::Failed(err),
        }
    }
    match service.remove_watermark(data) {
        Ok(artifact) => CleanupResult::Cleaned(artifact),
        Err(err) => CleanupResult::Failed(err),
    }
}

pub(crate) struct Dispatcher {
    service: Arc<dyn GenerationService>,
    tx: Sender<Completion>,
    rx: Receiver<Completion>,
    in_flight: usize,
}

impl Dispatcher {
    pub(crate) fn new(service: Arc<dyn GenerationService>) -> Self {
        let (tx, rx) = mpsc::channel();
        Self {
            service,
            tx,
            rx,
            in_flight: 0,
        }
    }

    pub(crate) fn service(&self) -> &dyn GenerationService {
        self.service.as_ref()
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub(crate) fn dispatch(&mut self, job: Job) {
        let key = job.key();
        let name = job.thread_name();
        let service = Arc::clone(&self.service);
        let tx = self.tx.clone();
        let worker_key = key.clone();
        self.in_flight += 1;

        let spawned = thread::Builder::new().name(name.to_string()).spawn(move || {
            let completion = panic::catch_unwind(AssertUnwindSafe(|| job.run(service.as_ref())))
                .unwrap_or_else(|_| {
                    worker_key.fail(GenerationError::new("generation worker panicked"))
                });
            let _ = tx.send(completion);
        });
        if let Err(err) = spawned {
            let _ = self.tx.send(key.fail(GenerationError::new(format!(
                "{name} thread spawn failed: {err}"
            ))));
        }
    }

    pub(crate) fn try_next(&mut self) -> Option<Completion> {
        let completion = self.rx.try_recv().ok()?;
        self.in_flight = self.in_flight.saturating_sub(1);
        Some(completion)
    }

    pub(crate) fn next_timeout(&mut self, timeout: Duration) -> Option<Completion> {
        if self.in_flight == 0 {
            return None;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(completion) => {
                self.in_flight = self.in_flight.saturating_sub(1);
                Some(completion)
            }
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }
}

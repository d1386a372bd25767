use std::fmt;

use indexmap::IndexMap;
use retouch_contracts::media::{ArtifactRef, ImageData};

use crate::error::GenerationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ImageId(u64);

impl ImageId {
    pub fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ImageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "img-{}", self.0)
    }
}

/// Where an uploaded image is in watermark cleanup.
///
/// `Pending -> Processing -> Ready | Failed`; immediate mode starts at
/// `Processing`. A failed image still counts as processed: generation uses
/// its original preview.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl ImageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ImageStatus::Pending => "pending",
            ImageStatus::Processing => "processing",
            ImageStatus::Ready => "ready",
            ImageStatus::Failed => "failed",
        }
    }

    pub fn is_settled(self) -> bool {
        matches!(self, ImageStatus::Ready | ImageStatus::Failed)
    }
}

#[derive(Debug, Clone)]
pub struct ReferenceImage {
    pub id: ImageId,
    pub original: ImageData,
    pub original_preview: ArtifactRef,
    pub processed_preview: Option<ArtifactRef>,
    pub status: ImageStatus,
    pub error: Option<String>,
}

impl ReferenceImage {
    /// The artifact generation calls should use for this image.
    pub fn preview(&self) -> &ArtifactRef {
        self.processed_preview
            .as_ref()
            .unwrap_or(&self.original_preview)
    }
}

/// Result of one cleanup job, as reported back to the owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupResult {
    /// A watermark was removed; the artifact is the cleaned image.
    Cleaned(ArtifactRef),
    /// Detection found nothing to remove; the original is used as is.
    Untouched,
    Failed(GenerationError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupOutcome {
    Ready,
    Failed(String),
    /// The image was deleted or is not awaiting a result.
    Ignored,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub total: usize,
    pub unsettled: usize,
    pub failed: usize,
}

impl Readiness {
    pub fn all_settled(self) -> bool {
        self.unsettled == 0
    }
}

/// The bounded, ordered set of uploaded reference images.
#[derive(Debug, Clone)]
pub struct ReferenceSet {
    images: IndexMap<ImageId, ReferenceImage>,
    capacity: usize,
    next_id: u64,
}

impl ReferenceSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            images: IndexMap::new(),
            capacity,
            next_id: 1,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn remaining(&self) -> usize {
        self.capacity.saturating_sub(self.images.len())
    }

    pub fn get(&self, id: ImageId) -> Option<&ReferenceImage> {
        self.images.get(&id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ReferenceImage> {
        self.images.values()
    }

    /// Accepts up to the remaining capacity and silently drops the rest.
    pub fn add(&mut self, uploads: Vec<ImageData>, status: ImageStatus) -> Vec<ImageId> {
        let accept = self.remaining();
        uploads
            .into_iter()
            .take(accept)
            .map(|image| {
                let id = ImageId(self.next_id);
                self.next_id += 1;
                let original_preview = ArtifactRef::from(&image);
                self.images.insert(
                    id,
                    ReferenceImage {
                        id,
                        original: image,
                        original_preview,
                        processed_preview: None,
                        status,
                        error: None,
                    },
                );
                id
            })
            .collect()
    }

    pub fn remove(&mut self, id: ImageId) -> Option<ReferenceImage> {
        self.images.shift_remove(&id)
    }

    pub fn pending_ids(&self) -> Vec<ImageId> {
        self.images
            .values()
            .filter(|image| image.status == ImageStatus::Pending)
            .map(|image| image.id)
            .collect()
    }

    /// Moves a pending image into processing. Returns its payload for the job.
    pub fn start_processing(&mut self, id: ImageId) -> Option<ImageData> {
        let image = self.images.get_mut(&id)?;
        if image.status != ImageStatus::Pending {
            return None;
        }
        image.status = ImageStatus::Processing;
        Some(image.original.clone())
    }

    /// Applies a cleanup result. Results for deleted images, or images not in
    /// `Processing`, are dropped so a late reply never resurrects or regresses
    /// an entry.
    pub fn apply_cleanup(&mut self, id: ImageId, result: CleanupResult) -> CleanupOutcome {
        let Some(image) = self.images.get_mut(&id) else {
            return CleanupOutcome::Ignored;
        };
        if image.status != ImageStatus::Processing {
            return CleanupOutcome::Ignored;
        }
        match result {
            CleanupResult::Cleaned(artifact) => {
                image.processed_preview = Some(artifact);
                image.status = ImageStatus::Ready;
                image.error = None;
                CleanupOutcome::Ready
            }
            CleanupResult::Untouched => {
                image.processed_preview = Some(image.original_preview.clone());
                image.status = ImageStatus::Ready;
                image.error = None;
                CleanupOutcome::Ready
            }
            CleanupResult::Failed(err) => {
                image.processed_preview = Some(image.original_preview.clone());
                image.status = ImageStatus::Failed;
                image.error = Some(err.message.clone());
                CleanupOutcome::Failed(err.message)
            }
        }
    }

    pub fn readiness(&self) -> Readiness {
        let mut readiness = Readiness {
            total: self.images.len(),
            ..Readiness::default()
        };
        for image in self.images.values() {
            if !image.status.is_settled() {
                readiness.unsettled += 1;
            }
            if image.status == ImageStatus::Failed {
                readiness.failed += 1;
            }
        }
        readiness
    }

    pub fn usable_artifacts(&self) -> Vec<ArtifactRef> {
        self.images
            .values()
            .filter(|image| image.status.is_settled())
            .map(|image| image.preview().clone())
            .collect()
    }
}

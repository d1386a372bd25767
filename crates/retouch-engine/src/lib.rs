pub mod batch;
pub mod composer;
pub mod config;
mod dispatch;
pub mod error;
pub mod master;
pub mod prompts;
pub mod providers;
pub mod references;
pub mod service;
pub mod staleness;
pub mod studio;

pub use batch::{BatchSummary, GeneratedSlot};
pub use composer::{PromptField, PromptState, UnitId};
pub use config::{ProcessingMode, ServiceConfig, SharedCredential, StudioConfig};
pub use error::{GenerationError, StudioError, ValidationError};
pub use master::MasterImageState;
pub use providers::{fetch_artifact, DryrunService, GeminiService, ProviderRouter, ReplicateService};
pub use references::{ImageId, ImageStatus, ReferenceImage};
pub use service::{GenerationService, VariantRequest};
pub use studio::{Notice, NoticeScope, Studio};

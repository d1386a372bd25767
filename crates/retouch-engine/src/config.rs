use std::env;
use std::fmt;
use std::sync::{Arc, RwLock};

pub const DEFAULT_REFERENCE_CAPACITY: usize = 8;
pub const DEFAULT_GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_REPLICATE_API_BASE: &str = "https://api.replicate.com/v1";

/// An API key handed to a provider client at construction.
///
/// Clones share the same slot, so a rotation through any handle is seen by
/// every client built from it. Nothing reads keys from the environment after
/// the config is built.
#[derive(Clone, Default)]
pub struct SharedCredential {
    inner: Arc<RwLock<Option<String>>>,
}

impl SharedCredential {
    pub fn new(value: Option<String>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(clean_key(value))),
        }
    }

    pub fn current(&self) -> Option<String> {
        self.inner.read().ok().and_then(|slot| slot.clone())
    }

    pub fn rotate(&self, value: Option<String>) {
        if let Ok(mut slot) = self.inner.write() {
            *slot = clean_key(value);
        }
    }

    pub fn is_set(&self) -> bool {
        self.current().is_some()
    }
}

impl fmt::Debug for SharedCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(if self.is_set() {
            "Credential(set)"
        } else {
            "Credential(unset)"
        })
    }
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub gemini_api_key: SharedCredential,
    pub replicate_api_token: SharedCredential,
    pub gemini_api_base: String,
    pub replicate_api_base: String,
    /// Requested model for image-producing calls; `None` uses the registry default.
    pub image_model: Option<String>,
    /// Requested model for analysis and watermark detection.
    pub vision_model: Option<String>,
    pub request_timeout_s: f64,
    pub transport_retries: usize,
    pub retry_backoff_s: f64,
    pub poll_interval_s: f64,
    pub poll_timeout_s: f64,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            gemini_api_key: SharedCredential::default(),
            replicate_api_token: SharedCredential::default(),
            gemini_api_base: DEFAULT_GEMINI_API_BASE.to_string(),
            replicate_api_base: DEFAULT_REPLICATE_API_BASE.to_string(),
            image_model: None,
            vision_model: None,
            request_timeout_s: 90.0,
            transport_retries: 2,
            retry_backoff_s: 1.2,
            poll_interval_s: 1.0,
            poll_timeout_s: 180.0,
        }
    }
}

impl ServiceConfig {
    /// Reads credentials, endpoints and model choices from the environment once.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            gemini_api_key: SharedCredential::new(
                non_empty_env("GEMINI_API_KEY").or_else(|| non_empty_env("GOOGLE_API_KEY")),
            ),
            replicate_api_token: SharedCredential::new(
                non_empty_env("REPLICATE_API_TOKEN").or_else(|| non_empty_env("REPLICATE_API_KEY")),
            ),
            gemini_api_base: api_base_env("GEMINI_API_BASE", DEFAULT_GEMINI_API_BASE),
            replicate_api_base: api_base_env("REPLICATE_API_BASE", DEFAULT_REPLICATE_API_BASE),
            image_model: non_empty_env("RETOUCH_IMAGE_MODEL"),
            vision_model: non_empty_env("RETOUCH_VISION_MODEL"),
            request_timeout_s: env_f64(
                "RETOUCH_REQUEST_TIMEOUT",
                defaults.request_timeout_s,
                15.0,
                300.0,
            ),
            transport_retries: env_f64(
                "RETOUCH_TRANSPORT_RETRIES",
                defaults.transport_retries as f64,
                0.0,
                4.0,
            )
            .round() as usize,
            retry_backoff_s: env_f64(
                "RETOUCH_RETRY_BACKOFF",
                defaults.retry_backoff_s,
                0.1,
                10.0,
            ),
            poll_interval_s: env_f64(
                "RETOUCH_POLL_INTERVAL",
                defaults.poll_interval_s,
                0.2,
                5.0,
            ),
            poll_timeout_s: env_f64("RETOUCH_POLL_TIMEOUT", defaults.poll_timeout_s, 10.0, 600.0),
        }
    }

    pub fn credential(&self, provider: &str) -> Option<&SharedCredential> {
        match provider {
            "gemini" => Some(&self.gemini_api_key),
            "replicate" => Some(&self.replicate_api_token),
            _ => None,
        }
    }
}

/// How uploaded reference images are cleaned up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProcessingMode {
    /// Every upload is sent for watermark removal as soon as it is added.
    #[default]
    Immediate,
    /// Uploads wait until an explicit analysis pass, which cleans them one by
    /// one (detect, then remove only when a watermark is found).
    Deferred,
}

#[derive(Debug, Clone)]
pub struct StudioConfig {
    pub reference_capacity: usize,
    pub processing_mode: ProcessingMode,
}

impl Default for StudioConfig {
    fn default() -> Self {
        Self {
            reference_capacity: DEFAULT_REFERENCE_CAPACITY,
            processing_mode: ProcessingMode::Immediate,
        }
    }
}

pub(crate) fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn api_base_env(key: &str, default: &str) -> String {
    non_empty_env(key)
        .map(|value| value.trim_end_matches('/').to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_f64(key: &str, default: f64, min: f64, max: f64) -> f64 {
    non_empty_env(key)
        .and_then(|value| value.parse::<f64>().ok())
        .filter(|value| value.is_finite())
        .unwrap_or(default)
        .clamp(min, max)
}

fn clean_key(value: Option<String>) -> Option<String> {
    value
        .map(|key| key.trim().to_string())
        .filter(|key| !key.is_empty())
}

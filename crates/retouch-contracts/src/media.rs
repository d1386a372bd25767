use std::fmt;
use std::path::Path;

use anyhow::{bail, Context, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Raw image bytes plus their MIME type, as uploaded by the user.
#[derive(Clone, PartialEq, Eq)]
pub struct ImageData {
    pub bytes: Vec<u8>,
    pub mime_type: String,
}

impl ImageData {
    pub fn new(bytes: Vec<u8>, mime_type: impl Into<String>) -> Self {
        Self {
            bytes,
            mime_type: mime_type.into(),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self> {
        let bytes =
            std::fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
        let mime_type = mime_for_path(path)
            .or_else(|| sniff_mime(&bytes))
            .unwrap_or("image/png");
        Ok(Self::new(bytes, mime_type))
    }

    pub fn from_data_uri(uri: &str) -> Result<Self> {
        let Some(rest) = uri.trim().strip_prefix("data:") else {
            bail!("not a data URI");
        };
        let Some((header, data)) = rest.split_once(',') else {
            bail!("data URI missing payload separator");
        };
        let Some(mime_type) = header.strip_suffix(";base64") else {
            bail!("only base64 data URIs are supported");
        };
        let bytes = BASE64
            .decode(data.trim().as_bytes())
            .context("data URI base64 decode failed")?;
        let mime_type = if mime_type.is_empty() {
            sniff_mime(&bytes).unwrap_or("image/png").to_string()
        } else {
            mime_type.to_string()
        };
        Ok(Self { bytes, mime_type })
    }

    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, BASE64.encode(&self.bytes))
    }

    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.bytes)
    }

    /// Short content hash used for file names and deterministic ids.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.mime_type.as_bytes());
        hasher.update(&self.bytes);
        hex::encode(&hasher.finalize()[..8])
    }

    pub fn extension(&self) -> &'static str {
        extension_for_mime(&self.mime_type)
    }
}

impl fmt::Debug for ImageData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ImageData")
            .field("mime_type", &self.mime_type)
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Opaque reference to a produced or uploaded image: a URL, a data URI or a
/// local path. Passed back into later calls and rendered, never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ArtifactRef(String);

impl ArtifactRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_data_uri(&self) -> bool {
        self.0.starts_with("data:")
    }

    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }
}

impl From<&ImageData> for ArtifactRef {
    fn from(image: &ImageData) -> Self {
        Self(image.to_data_uri())
    }
}

impl fmt::Display for ArtifactRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_data_uri() {
            let head: String = self.0.chars().take(32).collect();
            write!(f, "{head}… ({} bytes)", self.0.len())
        } else {
            f.write_str(&self.0)
        }
    }
}

pub fn mime_for_path(path: &Path) -> Option<&'static str> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        _ => None,
    }
}

pub fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    "png"
}

fn sniff_mime(bytes: &[u8]) -> Option<&'static str> {
    if bytes.starts_with(&[0x89, b'P', b'N', b'G']) {
        return Some("image/png");
    }
    if bytes.starts_with(&[0xFF, 0xD8, 0xFF]) {
        return Some("image/jpeg");
    }
    if bytes.len() >= 12 && &bytes[0..4] == b"RIFF" && &bytes[8..12] == b"WEBP" {
        return Some("image/webp");
    }
    if bytes.starts_with(b"GIF8") {
        return Some("image/gif");
    }
    None
}

//! Bundle compilation results.
//!
//! Compile failures are carried inside [`BundleResult`] (`success = false`
//! plus structured errors) rather than raised, so callers always get the
//! warnings, duration, and hash alongside any errors.

use serde::{Deserialize, Serialize};

/// A single bundler diagnostic with optional source location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleError {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl BundleError {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }
}

impl std::fmt::Display for BundleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (&self.file, self.line) {
            (Some(file), Some(line)) => write!(f, "{file}:{line}: {}", self.message),
            (Some(file), None) => write!(f, "{file}: {}", self.message),
            _ => write!(f, "{}", self.message),
        }
    }
}

/// Output of one bundler invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleResult {
    pub output_js: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_css: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<BundleError>,
    pub success: bool,
    /// Fingerprint of the inputs that produced this result.
    pub hash: String,
    /// Bundler-specific build metadata (import graph, chunk sizes).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metafile: Option<serde_json::Value>,
}

impl BundleResult {
    /// A failed result carrying one diagnostic. Never cached.
    pub fn failure(hash: impl Into<String>, error: BundleError) -> Self {
        Self {
            output_js: String::new(),
            output_css: None,
            source_map: None,
            duration_ms: 0,
            warnings: Vec::new(),
            errors: vec![error],
            success: false,
            hash: hash.into(),
            metafile: None,
        }
    }

    /// Approximate memory footprint, used for cache size accounting.
    pub fn size_bytes(&self) -> usize {
        self.output_js.len()
            + self.output_css.as_ref().map_or(0, String::len)
            + self.source_map.as_ref().map_or(0, String::len)
            + self.warnings.iter().map(String::len).sum::<usize>()
    }
}

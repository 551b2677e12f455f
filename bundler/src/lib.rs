//! Bundle compilation core: fingerprinting, caching, and single-flight
//! orchestration in front of an external bundler.
//!
//! The pipeline is `resolve config → fingerprint → cache lookup →
//! single-flight compile → cache store`. The cache guarantees TTL + LRU
//! semantics with O(1) recency updates; the service guarantees at most one
//! in-flight compile per fingerprint. Failed compiles are never cached so a
//! retry always reaches the bundler again.

pub mod cache;
pub mod config;
pub mod fingerprint;
pub mod result;
pub mod service;

pub use cache::{BundleCache, CacheOptions, CacheStats, EntryStats};
pub use config::{BundleConfig, Format, Framework, ResolvedBundleConfig};
pub use fingerprint::{content_hash, fingerprint, project_prefix};
pub use result::{BundleError, BundleResult};
pub use service::{Bundler, BundlerService, ServiceOptions};

use std::collections::BTreeMap;

/// Project sources handed to the service: relative path → file content.
///
/// A `BTreeMap` so iteration order is lexical, which the fingerprint
/// relies on for cross-process determinism.
pub type SourceFiles = BTreeMap<String, String>;

//! Single-flight bundling in front of the cache.
//!
//! `bundle()` resolves the config, fingerprints the inputs, and consults
//! the cache. On a miss it takes a per-fingerprint lock so concurrent
//! identical requests collapse into one compile; everyone else waits and
//! reads the freshly cached result. Failed compiles are returned but never
//! cached, so the next request reaches the bundler again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::cache::BundleCache;
use crate::config::{BundleConfig, ResolvedBundleConfig};
use crate::fingerprint::fingerprint_with_fields;
use crate::result::{BundleError, BundleResult};
use crate::SourceFiles;

/// External bundler capability. Receives a materialized file tree and a
/// fully resolved config; diagnostics come back inside the result.
#[async_trait]
pub trait Bundler: Send + Sync {
    async fn bundle(
        &self,
        project_path: &Path,
        config: &ResolvedBundleConfig,
    ) -> anyhow::Result<BundleResult>;
}

/// Service construction options.
#[derive(Debug, Clone)]
pub struct ServiceOptions {
    /// Root directory under which project trees are materialized.
    pub work_root: PathBuf,
    /// Deadline for a single external bundler invocation.
    pub bundle_timeout: Duration,
}

impl Default for ServiceOptions {
    fn default() -> Self {
        Self {
            work_root: std::env::temp_dir().join("forge-bundles"),
            bundle_timeout: Duration::from_secs(60),
        }
    }
}

/// Fingerprint → cache → single-flight compile.
pub struct BundlerService {
    bundler: Arc<dyn Bundler>,
    cache: Arc<BundleCache>,
    inflight: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    options: ServiceOptions,
}

impl BundlerService {
    pub fn new(bundler: Arc<dyn Bundler>, cache: Arc<BundleCache>, options: ServiceOptions) -> Self {
        Self {
            bundler,
            cache,
            inflight: DashMap::new(),
            options,
        }
    }

    pub fn cache(&self) -> &Arc<BundleCache> {
        &self.cache
    }

    /// Bundle a project. Identical concurrent requests share one compile.
    pub async fn bundle(
        &self,
        project_id: &str,
        config: &BundleConfig,
        files: &SourceFiles,
    ) -> BundleResult {
        let resolved = config.resolve(files);
        let key = fingerprint_with_fields(project_id, &resolved.fingerprint_fields(), files);

        if let Some(hit) = self.cache.get(&key) {
            let accesses = self
                .cache
                .entry_stats(&key)
                .map(|s| s.access_count)
                .unwrap_or_default();
            debug!(project_id, key = %key, accesses, "bundle cache hit");
            return hit;
        }

        // Per-fingerprint lock: first caller compiles, the rest queue here.
        let lock = self
            .inflight
            .entry(key.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let result = {
            let _guard = lock.lock().await;

            // A queued caller finds the result the leader just stored.
            if let Some(hit) = self.cache.get(&key) {
                debug!(project_id, key = %key, "bundle cache hit after single-flight wait");
                hit
            } else {
                self.compile(project_id, &key, &resolved, files).await
            }
        };
        self.inflight
            .remove_if(&key, |_, entry| Arc::strong_count(entry) <= 2);

        result
    }

    async fn compile(
        &self,
        project_id: &str,
        key: &str,
        resolved: &ResolvedBundleConfig,
        files: &SourceFiles,
    ) -> BundleResult {
        let project_path = match self.materialize(project_id, key, files).await {
            Ok(path) => path,
            Err(e) => {
                warn!(project_id, error = %e, "failed to materialize project tree");
                return BundleResult::failure(key, BundleError::message(e.to_string()));
            }
        };

        let outcome = tokio::time::timeout(
            self.options.bundle_timeout,
            self.bundler.bundle(&project_path, resolved),
        )
        .await;

        let mut result = match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => {
                warn!(project_id, key = %key, error = %e, "bundler invocation failed");
                BundleResult::failure(key, BundleError::message(e.to_string()))
            }
            Err(_) => {
                warn!(project_id, key = %key, "bundler invocation timed out");
                BundleResult::failure(
                    key,
                    BundleError::message(format!(
                        "bundler timed out after {}s",
                        self.options.bundle_timeout.as_secs()
                    )),
                )
            }
        };
        result.hash = key.to_string();

        if result.success {
            self.cache.set(key, result.clone());
            info!(
                project_id,
                key = %key,
                duration_ms = result.duration_ms,
                warnings = result.warnings.len(),
                "bundle compiled and cached"
            );
        }

        result
    }

    /// Write the in-memory file map under `work_root/<project_id>/<key>/`.
    async fn materialize(
        &self,
        project_id: &str,
        key: &str,
        files: &SourceFiles,
    ) -> anyhow::Result<PathBuf> {
        let root = self.options.work_root.join(project_id).join(key);
        tokio::fs::create_dir_all(&root).await?;

        for (rel_path, content) in files {
            let rel = Path::new(rel_path);
            if rel.is_absolute()
                || rel
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                anyhow::bail!("source path `{rel_path}` escapes the project root");
            }
            let full = root.join(rel);
            if let Some(parent) = full.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(&full, content).await?;
        }

        Ok(root)
    }
}

//! Deterministic bundle fingerprints.
//!
//! A fingerprint is the cache key for one `(project, config, sources)`
//! combination. It has two segments:
//!
//! ```text
//! [ 12 hex: project segment ][ 20 hex: config + content segment ]
//! ```
//!
//! The leading segment depends only on the project id, so every key for a
//! project shares the same prefix and `invalidate_by_project_id` reduces to
//! a prefix sweep. Both segments are blake3 digests; identical inputs yield
//! identical keys across processes.

use crate::config::BundleConfig;
use crate::SourceFiles;

/// Total fingerprint length in hex characters.
pub const FINGERPRINT_LEN: usize = 32;

/// Length of the project-id segment.
const PROJECT_SEGMENT_LEN: usize = 12;

/// Hex digest over the sorted `(path ‖ content)` sequence.
///
/// `SourceFiles` is a `BTreeMap`, so iteration is already lexical by path.
pub fn content_hash(files: &SourceFiles) -> String {
    let mut hasher = blake3::Hasher::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update(&[0]);
        hasher.update(content.as_bytes());
        hasher.update(&[0]);
    }
    hasher.finalize().to_hex().to_string()
}

/// The project-only key segment shared by every fingerprint of `project_id`.
pub fn project_prefix(project_id: &str) -> String {
    let digest = blake3::hash(project_id.as_bytes()).to_hex().to_string();
    digest[..PROJECT_SEGMENT_LEN].to_string()
}

/// Compute the cache key for `(project_id, config, files)`.
pub fn fingerprint(project_id: &str, config: &BundleConfig, files: &SourceFiles) -> String {
    fingerprint_with_fields(project_id, &config.fingerprint_fields(), files)
}

/// Shared implementation for requested and resolved config variants.
pub(crate) fn fingerprint_with_fields(
    project_id: &str,
    config_fields: &str,
    files: &SourceFiles,
) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(config_fields.as_bytes());
    hasher.update(&[0]);
    hasher.update(content_hash(files).as_bytes());
    let tail = hasher.finalize().to_hex().to_string();

    let mut key = project_prefix(project_id);
    key.push_str(&tail[..FINGERPRINT_LEN - PROJECT_SEGMENT_LEN]);
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Format, Framework};

    fn files(pairs: &[(&str, &str)]) -> SourceFiles {
        pairs
            .iter()
            .map(|(p, c)| (p.to_string(), c.to_string()))
            .collect()
    }

    #[test]
    fn test_fingerprint_deterministic() {
        let config = BundleConfig {
            entry_point: Some("src/index.ts".into()),
            format: Some(Format::Esm),
            minify: true,
            source_map: false,
            framework: Some(Framework::React),
        };
        let f = files(&[("src/index.ts", "export {}"), ("src/app.ts", "let x = 1;")]);

        let a = fingerprint("proj-1", &config, &f);
        let b = fingerprint("proj-1", &config, &f);
        assert_eq!(a, b);
        assert_eq!(a.len(), FINGERPRINT_LEN);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_fingerprint_sensitive_to_content() {
        let config = BundleConfig::default();
        let a = fingerprint("proj-1", &config, &files(&[("index.js", "1")]));
        let b = fingerprint("proj-1", &config, &files(&[("index.js", "2")]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_sensitive_to_path() {
        let config = BundleConfig::default();
        let a = fingerprint("proj-1", &config, &files(&[("a.js", "x")]));
        let b = fingerprint("proj-1", &config, &files(&[("b.js", "x")]));
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_sensitive_to_config() {
        let f = files(&[("index.js", "x")]);
        let plain = BundleConfig::default();
        let minified = BundleConfig {
            minify: true,
            ..BundleConfig::default()
        };
        assert_ne!(fingerprint("p", &plain, &f), fingerprint("p", &minified, &f));
    }

    #[test]
    fn test_project_prefix_shared_across_keys() {
        let f1 = files(&[("index.js", "a")]);
        let f2 = files(&[("other.js", "b")]);
        let k1 = fingerprint("proj-9", &BundleConfig::default(), &f1);
        let k2 = fingerprint("proj-9", &BundleConfig::default(), &f2);
        let prefix = project_prefix("proj-9");
        assert!(k1.starts_with(&prefix));
        assert!(k2.starts_with(&prefix));

        let other = fingerprint("proj-10", &BundleConfig::default(), &f1);
        assert!(!other.starts_with(&prefix));
    }

    #[test]
    fn test_content_hash_path_content_boundary() {
        // "ab" + "c" must not collide with "a" + "bc".
        let a = content_hash(&files(&[("ab", "c")]));
        let b = content_hash(&files(&[("a", "bc")]));
        assert_ne!(a, b);
    }
}

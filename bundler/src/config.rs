//! Bundle configuration: requested options, framework/format enums, and the
//! resolution step that fills in entry point, framework, and per-framework
//! defaults before compilation.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::SourceFiles;

/// Output module format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Format {
    Esm,
    Iife,
    Cjs,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Esm => write!(f, "esm"),
            Self::Iife => write!(f, "iife"),
            Self::Cjs => write!(f, "cjs"),
        }
    }
}

/// Supported front-end frameworks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Framework {
    React,
    Vue,
    Vanilla,
    Preact,
    Solid,
}

impl fmt::Display for Framework {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::React => write!(f, "react"),
            Self::Vue => write!(f, "vue"),
            Self::Vanilla => write!(f, "vanilla"),
            Self::Preact => write!(f, "preact"),
            Self::Solid => write!(f, "solid"),
        }
    }
}

/// Requested bundle options. Unset fields are resolved from the project
/// sources before compilation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BundleConfig {
    /// Entry point relative to the project root. Detected when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    /// Output format. Defaults from the framework when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<Format>,
    #[serde(default)]
    pub minify: bool,
    #[serde(default)]
    pub source_map: bool,
    /// Framework. Detected from the package manifest when `None`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub framework: Option<Framework>,
}

/// Fully resolved configuration handed to the external bundler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedBundleConfig {
    pub entry_point: String,
    pub format: Format,
    pub minify: bool,
    pub source_map: bool,
    pub framework: Framework,
    /// Target syntax level (e.g. "es2020").
    pub target: String,
    /// Extension → loader name.
    pub loaders: BTreeMap<String, String>,
    /// Compile-time define macros.
    pub defines: BTreeMap<String, String>,
}

/// Ordered entry-point candidates tried before falling back to the
/// package manifest and finally the first source file.
const ENTRY_CANDIDATES: &[&str] = &[
    "src/index.tsx",
    "src/index.ts",
    "src/index.jsx",
    "src/index.js",
    "src/main.tsx",
    "src/main.ts",
    "index.tsx",
    "index.ts",
    "index.js",
];

const SOURCE_EXTENSIONS: &[&str] = &[".tsx", ".ts", ".jsx", ".js"];

/// Detect the entry point from project sources.
///
/// Fallback order: well-known candidates, `package.json` `module` then
/// `main`, then the first file (lexical order) with a source extension.
pub fn detect_entry_point(files: &SourceFiles) -> Option<String> {
    for candidate in ENTRY_CANDIDATES {
        if files.contains_key(*candidate) {
            return Some((*candidate).to_string());
        }
    }

    if let Some(manifest) = files.get("package.json") {
        if let Ok(pkg) = serde_json::from_str::<serde_json::Value>(manifest) {
            for key in ["module", "main"] {
                if let Some(entry) = pkg[key].as_str() {
                    let entry = entry.trim_start_matches("./");
                    if files.contains_key(entry) {
                        return Some(entry.to_string());
                    }
                }
            }
        }
    }

    files
        .keys()
        .find(|path| SOURCE_EXTENSIONS.iter().any(|ext| path.ends_with(ext)))
        .cloned()
}

/// Detect the framework from `package.json` dependencies.
///
/// Checks the more specific frameworks first: `preact` and `solid-js`
/// projects frequently also carry `react` compatibility shims.
pub fn detect_framework(files: &SourceFiles) -> Framework {
    let Some(manifest) = files.get("package.json") else {
        return Framework::Vanilla;
    };
    let Ok(pkg) = serde_json::from_str::<serde_json::Value>(manifest) else {
        return Framework::Vanilla;
    };

    let has_dep = |name: &str| {
        pkg["dependencies"][name].is_string() || pkg["devDependencies"][name].is_string()
    };

    if has_dep("preact") {
        Framework::Preact
    } else if has_dep("solid-js") {
        Framework::Solid
    } else if has_dep("vue") {
        Framework::Vue
    } else if has_dep("react") {
        Framework::React
    } else {
        Framework::Vanilla
    }
}

impl BundleConfig {
    /// Resolve unset fields against the project sources and apply
    /// framework defaults.
    pub fn resolve(&self, files: &SourceFiles) -> ResolvedBundleConfig {
        let framework = self.framework.unwrap_or_else(|| detect_framework(files));
        let entry_point = self
            .entry_point
            .clone()
            .or_else(|| detect_entry_point(files))
            .unwrap_or_else(|| "src/index.js".to_string());
        let format = self.format.unwrap_or(match framework {
            // IIFE keeps vanilla bundles droppable into a <script> tag.
            Framework::Vanilla => Format::Iife,
            _ => Format::Esm,
        });

        let mut loaders = BTreeMap::new();
        loaders.insert(".ts".into(), "ts".into());
        loaders.insert(".js".into(), "js".into());
        loaders.insert(".css".into(), "css".into());
        loaders.insert(".json".into(), "json".into());
        match framework {
            Framework::React | Framework::Preact | Framework::Solid => {
                loaders.insert(".tsx".into(), "tsx".into());
                loaders.insert(".jsx".into(), "jsx".into());
            }
            Framework::Vue => {
                loaders.insert(".vue".into(), "vue".into());
            }
            Framework::Vanilla => {}
        }

        let mut defines = BTreeMap::new();
        defines.insert("process.env.NODE_ENV".into(), "\"production\"".into());
        if framework == Framework::Preact {
            // Route react imports through the compat layer.
            defines.insert("react".into(), "\"preact/compat\"".into());
        }

        ResolvedBundleConfig {
            entry_point,
            format,
            minify: self.minify,
            source_map: self.source_map,
            framework,
            target: "es2020".to_string(),
            loaders,
            defines,
        }
    }

    /// Canonical string folded into the fingerprint. Field order is fixed;
    /// changing it invalidates every cached bundle.
    pub fn fingerprint_fields(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.entry_point.as_deref().unwrap_or(""),
            self.format.map(|f| f.to_string()).unwrap_or_default(),
            self.minify,
            self.source_map,
            self.framework.map(|f| f.to_string()).unwrap_or_default(),
        )
    }
}

impl ResolvedBundleConfig {
    /// Canonical string folded into the fingerprint (resolved variant).
    pub fn fingerprint_fields(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.entry_point, self.format, self.minify, self.source_map, self.framework,
        )
    }
}

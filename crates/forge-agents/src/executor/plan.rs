//! Typed plan steps.
//!
//! Each action carries its own input schema — there is no generic
//! string-keyed payload. Plans serialize as tagged JSON (`"action"`
//! discriminant) so they can be stored, replayed, and diffed.

use serde::{Deserialize, Serialize};

/// How `modify_file` changes an existing file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum ModifyMode {
    /// Replace the whole file.
    Replace { content: String },
    /// Append to the end.
    Append { content: String },
    /// Insert at a byte position (clamped to file length).
    Insert { position: usize, content: String },
    /// Replace one exact occurrence of `search` with `replace`.
    SearchReplace { search: String, replace: String },
}

/// One step of a build plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum PlanStep {
    CreateFile {
        path: String,
        content: String,
    },
    ModifyFile {
        path: String,
        #[serde(flatten)]
        mode: ModifyMode,
    },
    DeleteFile {
        path: String,
    },
    RunCommand {
        command: String,
    },
    RunTests {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        command: Option<String>,
    },
    InstallDeps {
        packages: Vec<String>,
    },
    AiGenerate {
        prompt: String,
    },
    AiAnalyze {
        /// Relative path of the file to analyze.
        target: String,
        instruction: String,
    },
    Validate,
    Deploy {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    Rollback {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checkpoint_id: Option<String>,
    },
}

impl PlanStep {
    /// Short action name for logs and telemetry.
    pub fn action_name(&self) -> &'static str {
        match self {
            Self::CreateFile { .. } => "create_file",
            Self::ModifyFile { .. } => "modify_file",
            Self::DeleteFile { .. } => "delete_file",
            Self::RunCommand { .. } => "run_command",
            Self::RunTests { .. } => "run_tests",
            Self::InstallDeps { .. } => "install_deps",
            Self::AiGenerate { .. } => "ai_generate",
            Self::AiAnalyze { .. } => "ai_analyze",
            Self::Validate => "validate",
            Self::Deploy { .. } => "deploy",
            Self::Rollback { .. } => "rollback",
        }
    }
}

/// A full build plan: the ordered steps for one build.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildPlan {
    pub steps: Vec<PlanStep>,
}

impl BuildPlan {
    pub fn from_json(json: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

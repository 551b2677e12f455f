//! Verification pipeline: ordered checks with a 0–100 aggregate score.
//!
//! Checks run sequentially; the first failure short-circuits the rest to
//! `skipped` so the healer sees the earliest error, not a cascade. The
//! collated output of failing checks feeds the healing loop.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::diagnosis::{DiagnosisClassifier, ErrorType};
use crate::error::AgentError;
use crate::executor::{Executor, PlanStep, StepOutput};

/// What a verification step checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    Compile,
    Lint,
    Test,
    Custom,
}

/// Outcome of one verification step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Passed,
    Failed,
    Skipped,
}

/// One configured check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationStep {
    pub name: String,
    pub kind: CheckKind,
    pub command: String,
    /// Relative weight of this check in the aggregate score.
    pub weight: u32,
}

impl VerificationStep {
    pub fn new(name: &str, kind: CheckKind, command: &str, weight: u32) -> Self {
        Self {
            name: name.to_string(),
            kind,
            command: command.to_string(),
            weight,
        }
    }
}

/// Result of one executed check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub name: String,
    pub status: StepStatus,
    pub output: String,
    pub score_contribution: f64,
}

/// Aggregate validation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationReport {
    pub steps: Vec<StepResult>,
    /// Weighted pass score in [0, 100].
    pub score: f64,
    pub passed: bool,
}

/// Classified failure from one check, for routing and reporting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureSignal {
    pub check: String,
    pub error_type: ErrorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    pub message: String,
}

impl ValidationReport {
    /// Classify each failing check's output into a structured signal.
    pub fn failure_signals(&self) -> Vec<FailureSignal> {
        let classifier = DiagnosisClassifier::new();
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| {
                let diagnosis = classifier.classify(&s.output);
                FailureSignal {
                    check: s.name.clone(),
                    error_type: diagnosis.error_type,
                    file: diagnosis.affected_files.first().cloned(),
                    line: diagnosis.fixes.first().and_then(|f| f.line),
                    message: diagnosis.root_cause,
                }
            })
            .collect()
    }

    /// Output of every failing step, for the healer.
    pub fn collated_errors(&self) -> String {
        self.steps
            .iter()
            .filter(|s| s.status == StepStatus::Failed)
            .map(|s| s.output.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    pub fn summary(&self) -> String {
        let passed = self
            .steps
            .iter()
            .filter(|s| s.status == StepStatus::Passed)
            .count();
        format!(
            "{passed}/{} checks passed, score {:.0}",
            self.steps.len(),
            self.score
        )
    }
}

/// Runs the configured checks through the executor.
#[derive(Debug, Clone)]
pub struct Validator {
    steps: Vec<VerificationStep>,
}

impl Validator {
    pub fn new(steps: Vec<VerificationStep>) -> Self {
        Self { steps }
    }

    /// The stock JavaScript-project pipeline: build, lint, test.
    pub fn standard() -> Self {
        Self::new(vec![
            VerificationStep::new("compile", CheckKind::Compile, "npm run build", 3),
            VerificationStep::new("lint", CheckKind::Lint, "npm run lint", 1),
            VerificationStep::new("test", CheckKind::Test, "npm test", 2),
        ])
    }

    pub fn steps(&self) -> &[VerificationStep] {
        &self.steps
    }

    /// Run the pipeline. Command failures are scored, not raised; only
    /// infrastructure errors (timeout, cancellation) propagate.
    pub async fn run(&self, executor: &Executor) -> Result<ValidationReport, AgentError> {
        let total_weight: u32 = self.steps.iter().map(|s| s.weight).sum::<u32>().max(1);
        let mut results = Vec::with_capacity(self.steps.len());
        let mut score = 0.0;
        let mut failed = false;

        for step in &self.steps {
            if failed {
                results.push(StepResult {
                    name: step.name.clone(),
                    status: StepStatus::Skipped,
                    output: String::new(),
                    score_contribution: 0.0,
                });
                continue;
            }

            let output = executor
                .execute(&PlanStep::RunCommand {
                    command: step.command.clone(),
                })
                .await?;
            let command_output = match output {
                StepOutput::CommandRun(out) => out,
                other => {
                    // run_command dispatch always yields CommandRun.
                    return Err(anyhow::anyhow!("unexpected step output: {other:?}").into());
                }
            };

            if command_output.success() {
                let contribution = 100.0 * f64::from(step.weight) / f64::from(total_weight);
                score += contribution;
                info!(check = %step.name, "verification check passed");
                results.push(StepResult {
                    name: step.name.clone(),
                    status: StepStatus::Passed,
                    output: command_output.collated(),
                    score_contribution: contribution,
                });
            } else {
                warn!(
                    check = %step.name,
                    exit_code = command_output.exit_code,
                    "verification check failed"
                );
                failed = true;
                results.push(StepResult {
                    name: step.name.clone(),
                    status: StepStatus::Failed,
                    output: command_output.collated(),
                    score_contribution: 0.0,
                });
            }
        }

        let report = ValidationReport {
            steps: results,
            score: score.clamp(0.0, 100.0),
            passed: !failed,
        };
        info!(summary = %report.summary(), "validation finished");
        Ok(report)
    }
}

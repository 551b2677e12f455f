//! Per-build lifecycle driver.
//!
//! One orchestrator runs one build: intake → planning → step execution →
//! validation → (healing | completion), with rollback on exhaustion or
//! fatal error. Cancellation is checked at every suspension point. Plan
//! steps and validation run under a supervising spawn so a panic in a
//! subtask becomes a `fatal_error` transition instead of a poisoned build.

use std::future::Future;
use std::sync::Arc;

use bundler::{BundleConfig, BundlerService, SourceFiles};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::error::AgentError;
use crate::executor::{ControlRequest, Executor, StepOutput};
use crate::fsm::AgentFsm;
use crate::healing::{HealingLoop, HealingOutcome};
use crate::oracle::{AiOracle, OracleOptions};
use crate::state::{AgentEvent, AgentState};
use crate::telemetry::{BuildMetrics, MetricsCollector};
use crate::validator::{ValidationReport, Validator};

pub use crate::executor::BuildPlan;

/// How many rollback-and-resume cycles a build gets before it fails.
const MAX_ROLLBACKS: u32 = 1;

/// Checkpoints retained per build; older ones are pruned as steps land.
const MAX_KEPT_CHECKPOINTS: usize = 5;

/// How a finished build ended, with its evidence.
#[derive(Debug, Serialize)]
pub struct BuildReport {
    pub final_state: AgentState,
    pub success: bool,
    pub validation: Option<ValidationReport>,
    pub healing: Vec<HealingOutcome>,
    pub metrics: BuildMetrics,
}

/// External control surface for a running build.
#[derive(Clone)]
pub struct OrchestratorHandle {
    fsm: Arc<AgentFsm>,
    cancel: CancellationToken,
}

impl OrchestratorHandle {
    pub fn pause(&self) -> Result<(), AgentError> {
        self.fsm.transition(AgentEvent::Pause, None).map(|_| ())
    }

    pub fn resume(&self) -> Result<(), AgentError> {
        self.fsm.transition(AgentEvent::Resume, None).map(|_| ())
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn fsm(&self) -> &Arc<AgentFsm> {
        &self.fsm
    }
}

/// Fallback oracle for builds configured without one: every call fails,
/// which keeps rule-based diagnosis working and makes AI plan steps error.
struct NullOracle;

#[async_trait::async_trait]
impl AiOracle for NullOracle {
    async fn generate(
        &self,
        _prompt: &str,
        _options: &OracleOptions,
    ) -> Result<String, crate::error::OracleError> {
        Err(crate::error::OracleError::Request("no oracle configured".into()))
    }

    async fn analyze(
        &self,
        _content: &str,
        _instruction: &str,
        _options: &OracleOptions,
    ) -> Result<String, crate::error::OracleError> {
        Err(crate::error::OracleError::Request("no oracle configured".into()))
    }
}

/// Drives one build through the FSM.
pub struct Orchestrator {
    fsm: Arc<AgentFsm>,
    executor: Arc<Executor>,
    validator: Validator,
    healing: HealingLoop,
    oracle: Arc<dyn AiOracle>,
    bundler: Option<Arc<BundlerService>>,
    cancel: CancellationToken,
    checkpoint_timeout: std::time::Duration,
}

impl Orchestrator {
    pub fn new(
        fsm: Arc<AgentFsm>,
        executor: Arc<Executor>,
        validator: Validator,
        healing: HealingLoop,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            fsm,
            executor,
            validator,
            healing,
            oracle: Arc::new(NullOracle),
            bundler: None,
            cancel,
            checkpoint_timeout: std::time::Duration::from_secs(10),
        }
    }

    pub fn with_checkpoint_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.checkpoint_timeout = timeout;
        self
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn AiOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    pub fn with_bundler(mut self, bundler: Arc<BundlerService>) -> Self {
        self.bundler = Some(bundler);
        self
    }

    pub fn handle(&self) -> OrchestratorHandle {
        OrchestratorHandle {
            fsm: Arc::clone(&self.fsm),
            cancel: self.cancel.clone(),
        }
    }

    /// Run the build to a terminal state.
    pub async fn run(&self, plan: &BuildPlan) -> BuildReport {
        let mut metrics = MetricsCollector::new(self.fsm.build_id());
        let mut healing_outcomes = Vec::new();
        let mut last_validation: Option<ValidationReport> = None;
        let mut rollbacks_used = 0u32;
        let mut next_step = 0usize;

        if let Err(e) = self.intake(plan) {
            error!(error = %e, "build intake failed");
            self.fatal(&e.to_string());
        }

        while !self.fsm.is_terminal() {
            if self.cancel.is_cancelled() {
                self.cancel_build();
                break;
            }

            match self.fsm.current_state() {
                AgentState::Executing => {
                    match self.execute_steps(plan, &mut next_step, &mut metrics).await {
                        Ok(()) => {}
                        Err(AgentError::Cancelled(_)) => self.cancel_build(),
                        Err(e) => self.fatal(&e.to_string()),
                    }
                }
                AgentState::Validating => {
                    match self.supervised(self.validation_task()).await {
                        Ok(report) => {
                            metrics.record_score(report.score);
                            let passed = report.passed;
                            let errors = report.collated_errors();
                            last_validation = Some(report);
                            if passed {
                                self.emit(AgentEvent::ValidationPass, None);
                            } else {
                                self.emit(
                                    AgentEvent::ValidationFail,
                                    Some(serde_json::Value::String(errors)),
                                );
                            }
                        }
                        Err(AgentError::Cancelled(_)) => self.cancel_build(),
                        Err(e) => self.fatal(&e.to_string()),
                    }
                }
                AgentState::Retrying => {
                    let error_text = last_validation
                        .as_ref()
                        .map(|r| r.collated_errors())
                        .unwrap_or_default();
                    let outcome = self
                        .healing
                        .heal(&self.executor, &self.validator, self.oracle.as_ref(), &error_text)
                        .await;
                    metrics.record_healing(outcome.iterations, outcome.fixes_applied);
                    metrics.record_score(outcome.final_score);
                    let diagnosis_summary = outcome.diagnosis_summary();
                    if diagnosis_summary.needs_review() {
                        warn!(
                            build_id = %self.fsm.build_id(),
                            findings = diagnosis_summary.total,
                            security = diagnosis_summary.has_security_findings,
                            "healing run flagged for review"
                        );
                    }
                    let healed = outcome.success;
                    let stuck = outcome.fixes_applied == 0;
                    healing_outcomes.push(outcome);

                    if healed {
                        self.emit(AgentEvent::ValidationPass, None);
                    } else if stuck {
                        // Nothing applied: more retries cannot help.
                        self.emit(AgentEvent::RetryExhausted, None);
                    } else {
                        // Burn a retry; the FSM rewrites to retry_exhausted
                        // once the budget is gone.
                        self.emit(AgentEvent::ValidationFail, None);
                    }
                }
                AgentState::RollingBack => {
                    self.roll_back(&mut rollbacks_used, &mut next_step, &mut metrics)
                        .await;
                }
                AgentState::Paused => {
                    // Externally driven; wait for resume or cancellation.
                    tokio::select! {
                        _ = self.cancel.cancelled() => self.cancel_build(),
                        _ = tokio::time::sleep(std::time::Duration::from_millis(50)) => {}
                    }
                }
                state => {
                    // Idle/Initializing/Planning only appear before intake
                    // finishes; reaching here means intake failed silently.
                    self.fatal(&format!("orchestrator stalled in state {state}"));
                }
            }
        }

        let final_state = self.fsm.current_state();
        let success = final_state == AgentState::Completed;
        let metrics = metrics.finalize(success, &final_state.to_string(), self.fsm.history().len());
        info!(
            summary = %self.fsm.summary(),
            success,
            "build finished"
        );

        BuildReport {
            final_state,
            success,
            validation: last_validation,
            healing: healing_outcomes,
            metrics,
        }
    }

    /// start → initialized → plan_ready.
    fn intake(&self, plan: &BuildPlan) -> Result<(), AgentError> {
        self.fsm.transition(AgentEvent::Start, None)?;
        self.fsm.transition(AgentEvent::Initialized, None)?;
        self.fsm.set_total_steps(plan.len() as u32);
        self.fsm.transition(AgentEvent::PlanReady, None)?;
        Ok(())
    }

    /// Execute plan steps from `next_step` until the plan is done or the
    /// state changes under us (pause, rollback step).
    async fn execute_steps(
        &self,
        plan: &BuildPlan,
        next_step: &mut usize,
        metrics: &mut MetricsCollector,
    ) -> Result<(), AgentError> {
        while *next_step < plan.len() {
            if self.cancel.is_cancelled() {
                return Err(AgentError::Cancelled("build".into()));
            }
            if self.fsm.current_state() != AgentState::Executing {
                // Paused or rolled back externally; the main loop re-enters.
                return Ok(());
            }

            let index = *next_step;
            let step = &plan.steps[index];
            info!(step = index, action = step.action_name(), "executing plan step");

            let output = {
                let executor = Arc::clone(&self.executor);
                let step = step.clone();
                self.supervised(async move { executor.execute(&step).await })
                    .await?
            };

            if let StepOutput::Control(request) = output {
                self.handle_control(request, next_step, metrics).await?;
                if *next_step != index {
                    // A rollback control step moved the cursor.
                    continue;
                }
            }

            metrics.record_step();
            *next_step = index + 1;

            if *next_step == plan.len() {
                self.emit(AgentEvent::AllStepsComplete, None);
            } else {
                self.emit(AgentEvent::StepComplete, None);
            }

            self.checkpoint_after_step(index, metrics).await;
        }

        // Covers the empty plan, and a pause that raced the final step's
        // event: all work is done but the FSM still says executing.
        if *next_step >= plan.len() && self.fsm.current_state() == AgentState::Executing {
            self.emit(AgentEvent::AllStepsComplete, None);
        }

        Ok(())
    }

    async fn handle_control(
        &self,
        request: ControlRequest,
        next_step: &mut usize,
        metrics: &mut MetricsCollector,
    ) -> Result<(), AgentError> {
        match request {
            ControlRequest::Validate => {
                // Mid-plan validation is advisory; the gating run happens
                // after all steps complete.
                let report = self.validator.run(&self.executor).await?;
                if !report.passed {
                    warn!(summary = %report.summary(), "mid-plan validation failing");
                }
            }
            ControlRequest::Deploy { target } => {
                let Some(bundler) = &self.bundler else {
                    warn!("deploy step with no bundler configured; skipping");
                    return Ok(());
                };
                let files = collect_sources(self.executor.workspace().root());
                let result = bundler
                    .bundle(self.fsm.build_id(), &BundleConfig::default(), &files)
                    .await;
                if !result.success {
                    let detail = result
                        .errors
                        .first()
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown bundle error".into());
                    return Err(anyhow::anyhow!("deploy bundle failed: {detail}").into());
                }
                info!(
                    target = target.as_deref().unwrap_or("default"),
                    hash = %result.hash,
                    "deploy bundle produced"
                );
            }
            ControlRequest::Rollback { checkpoint_id } => {
                let id = match checkpoint_id {
                    Some(id) => id,
                    None => self
                        .fsm
                        .latest_restorable_checkpoint()
                        .map(|cp| cp.id)
                        .ok_or_else(|| anyhow::anyhow!("rollback step with no checkpoint"))?,
                };
                let checkpoint = self.fsm.rollback_to(&id).await?;
                metrics.record_rollback();
                *next_step = checkpoint.step_index as usize;
            }
        }
        Ok(())
    }

    /// Best-effort checkpoint after a completed step. A persistence
    /// failure skips the checkpoint but does not fail the build; a later
    /// rollback without checkpoints fails instead.
    async fn checkpoint_after_step(&self, index: usize, metrics: &mut MetricsCollector) {
        let result = tokio::time::timeout(
            self.checkpoint_timeout,
            self.fsm
                .create_checkpoint(format!("after step {index}"), serde_json::Value::Null),
        )
        .await;
        match result {
            Ok(Ok(_)) => {
                metrics.record_checkpoint();
                if let Err(e) = self.fsm.prune_checkpoints(MAX_KEPT_CHECKPOINTS).await {
                    warn!(error = %e, "checkpoint pruning failed");
                }
            }
            Ok(Err(e)) => warn!(step = index, error = %e, "checkpoint skipped"),
            Err(_) => warn!(
                step = index,
                timeout_secs = self.checkpoint_timeout.as_secs(),
                "checkpoint persistence timed out; skipped"
            ),
        }
    }

    fn validation_task(
        &self,
    ) -> impl Future<Output = Result<ValidationReport, AgentError>> + Send + 'static {
        let validator = self.validator.clone();
        let executor = Arc::clone(&self.executor);
        async move { validator.run(&executor).await }
    }

    /// Restore the newest restorable checkpoint, or fail the build.
    async fn roll_back(
        &self,
        rollbacks_used: &mut u32,
        next_step: &mut usize,
        metrics: &mut MetricsCollector,
    ) {
        if *rollbacks_used >= MAX_ROLLBACKS {
            warn!("rollback budget exhausted");
            self.emit(
                AgentEvent::RollbackFailed,
                Some(serde_json::Value::String("rollback budget exhausted".into())),
            );
            return;
        }

        let Some(checkpoint) = self.fsm.latest_restorable_checkpoint() else {
            warn!("no restorable checkpoint");
            self.emit(
                AgentEvent::RollbackFailed,
                Some(serde_json::Value::String("no restorable checkpoint".into())),
            );
            return;
        };

        match self.fsm.rollback_to(&checkpoint.id).await {
            Ok(restored) => {
                *rollbacks_used += 1;
                *next_step = restored.step_index as usize;
                metrics.record_rollback();
                info!(
                    checkpoint_id = %restored.id,
                    step_index = restored.step_index,
                    "rolled back; resuming execution"
                );
            }
            Err(e) => {
                error!(error = %e, "rollback failed");
                self.emit(
                    AgentEvent::RollbackFailed,
                    Some(serde_json::Value::String(e.to_string())),
                );
            }
        }
    }

    /// Run a subtask under supervision: a panic becomes an error instead
    /// of unwinding through the orchestrator.
    async fn supervised<F, T>(&self, task: F) -> Result<T, AgentError>
    where
        F: Future<Output = Result<T, AgentError>> + Send + 'static,
        T: Send + 'static,
    {
        match tokio::spawn(task).await {
            Ok(result) => result,
            Err(join_error) => {
                if join_error.is_panic() {
                    Err(anyhow::anyhow!("subtask panicked: {join_error}").into())
                } else {
                    Err(AgentError::Cancelled("subtask aborted".into()))
                }
            }
        }
    }

    /// Emit an event, logging (not propagating) rejections: the only
    /// rejection path here is a racing external cancel/pause.
    fn emit(&self, event: AgentEvent, metadata: Option<serde_json::Value>) {
        if let Err(e) = self.fsm.transition(event, metadata) {
            warn!(event = %event, error = %e, "event rejected");
        }
    }

    fn fatal(&self, message: &str) {
        error!(build_id = %self.fsm.build_id(), detail = message, "fatal build error");
        self.emit(
            AgentEvent::FatalError,
            Some(serde_json::Value::String(message.to_string())),
        );
    }

    fn cancel_build(&self) {
        if !self.fsm.is_terminal() {
            self.emit(AgentEvent::Cancel, None);
        }
    }
}

/// Collect bundleable sources from the workspace (skips dependency and
/// VCS directories).
fn collect_sources(root: &std::path::Path) -> SourceFiles {
    const SKIP_DIRS: &[&str] = &["node_modules", ".git", "dist", "build", "target"];
    const EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "css", "json", "html", "vue"];

    fn walk(dir: &std::path::Path, root: &std::path::Path, files: &mut SourceFiles) {
        let Ok(entries) = std::fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().into_owned();
            if path.is_dir() {
                if !SKIP_DIRS.contains(&name.as_str()) && !name.starts_with('.') {
                    walk(&path, root, files);
                }
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|ext| EXTENSIONS.contains(&ext))
            {
                if let (Ok(rel), Ok(content)) =
                    (path.strip_prefix(root), std::fs::read_to_string(&path))
                {
                    files.insert(rel.to_string_lossy().replace('\\', "/"), content);
                }
            }
        }
    }

    let mut files = SourceFiles::new();
    walk(root, root, &mut files);
    files
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collect_sources_skips_dependency_dirs() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src")).unwrap();
        std::fs::create_dir_all(dir.path().join("node_modules/react")).unwrap();
        std::fs::write(dir.path().join("src/index.ts"), "export {}").unwrap();
        std::fs::write(dir.path().join("package.json"), "{}").unwrap();
        std::fs::write(dir.path().join("node_modules/react/index.js"), "x").unwrap();
        std::fs::write(dir.path().join("README.md"), "#").unwrap();

        let files = collect_sources(dir.path());
        assert!(files.contains_key("src/index.ts"));
        assert!(files.contains_key("package.json"));
        assert!(!files.keys().any(|k| k.contains("node_modules")));
        assert!(!files.contains_key("README.md"));
    }
}

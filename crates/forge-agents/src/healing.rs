//! The self-healing debug loop: diagnose → fix → verify, bounded.
//!
//! The healer owns the retry; verification inside an iteration runs once.
//! The loop ends on success, on a diagnosis with no fixes, on an iteration
//! where nothing applied, or when the iteration budget runs out. Diagnosis
//! and verification errors end the loop without success — escalation is
//! the orchestrator's call.

use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::diagnosis::{DiagnosisClassifier, DiagnosisResult, DiagnosisSummary};
use crate::executor::Executor;
use crate::oracle::AiOracle;
use crate::validator::Validator;

pub const DEFAULT_MAX_ITERATIONS: u32 = 5;

/// What happened in one healing iteration.
#[derive(Debug, Clone, Serialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub fixes_offered: usize,
    pub fixes_applied: u32,
    /// Whether verification ran this iteration (it does not when no fix
    /// applied).
    pub verified: bool,
    pub score: f64,
    pub duration_ms: u64,
}

/// Outcome record of one healing run.
#[derive(Debug, Clone, Serialize)]
pub struct HealingOutcome {
    pub success: bool,
    pub iterations: u32,
    pub fixes_applied: u32,
    pub final_score: f64,
    pub diagnoses: Vec<DiagnosisResult>,
    pub iteration_detail: Vec<IterationRecord>,
    pub duration_ms: u64,
}

impl HealingOutcome {
    /// One-line human summary.
    pub fn summary(&self) -> String {
        let verdict = if self.success { "healed" } else { "not healed" };
        format!(
            "{verdict} after {} iteration(s): {} fix(es) applied, final score {:.0} ({}ms)",
            self.iterations, self.fixes_applied, self.final_score, self.duration_ms
        )
    }

    /// Aggregate view of everything diagnosed during the run.
    pub fn diagnosis_summary(&self) -> DiagnosisSummary {
        DiagnosisSummary::from_diagnoses(&self.diagnoses)
    }
}

/// Bounded diagnose→fix→verify controller.
pub struct HealingLoop {
    max_iterations: u32,
    classifier: DiagnosisClassifier,
}

impl Default for HealingLoop {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_ITERATIONS)
    }
}

impl HealingLoop {
    pub fn new(max_iterations: u32) -> Self {
        Self {
            max_iterations: max_iterations.max(1),
            classifier: DiagnosisClassifier::new(),
        }
    }

    /// Run the loop against the current workspace state.
    pub async fn heal(
        &self,
        executor: &Executor,
        validator: &Validator,
        oracle: &dyn AiOracle,
        initial_error: &str,
    ) -> HealingOutcome {
        let started = Instant::now();
        let mut error_text = initial_error.to_string();
        let mut diagnoses = Vec::new();
        let mut iteration_detail: Vec<IterationRecord> = Vec::new();
        let mut fixes_applied = 0u32;
        let mut final_score = 0.0;
        let mut success = false;
        let mut iterations = 0u32;
        let mut aborted = false;

        while iterations < self.max_iterations {
            iterations += 1;
            let iteration_started = Instant::now();
            info!(iteration = iterations, "healing iteration start");
            let mut record = IterationRecord {
                iteration: iterations,
                fixes_offered: 0,
                fixes_applied: 0,
                verified: false,
                score: 0.0,
                duration_ms: 0,
            };

            // 1. Diagnose.
            let diagnosis = self.classifier.diagnose(oracle, &error_text).await;
            let fixes = diagnosis.fixes.clone();
            record.fixes_offered = fixes.len();
            diagnoses.push(diagnosis);
            if fixes.is_empty() {
                warn!(iteration = iterations, "diagnosis produced no fixes; stopping");
                record.duration_ms = iteration_started.elapsed().as_millis() as u64;
                iteration_detail.push(record);
                break;
            }

            // 2. Apply.
            let mut applied_this_round = 0u32;
            for fix in &fixes {
                match executor.apply_fix(fix).await {
                    Ok(true) => applied_this_round += 1,
                    Ok(false) => {}
                    Err(e) => {
                        warn!(file = %fix.file, error = %e, "fix application errored; stopping");
                        aborted = true;
                        break;
                    }
                }
            }
            fixes_applied += applied_this_round;
            record.fixes_applied = applied_this_round;
            if aborted || applied_this_round == 0 {
                if !aborted {
                    warn!(iteration = iterations, "no fixes applied; stopping");
                }
                record.duration_ms = iteration_started.elapsed().as_millis() as u64;
                iteration_detail.push(record);
                break;
            }

            // 3. Re-verify, once. The healer is the retry.
            let report = match validator.run(executor).await {
                Ok(report) => report,
                Err(e) => {
                    warn!(iteration = iterations, error = %e, "verification errored; stopping");
                    record.duration_ms = iteration_started.elapsed().as_millis() as u64;
                    iteration_detail.push(record);
                    break;
                }
            };
            record.verified = true;
            record.score = report.score;
            final_score = report.score;

            let passed = report.passed;
            // 4. Feed the next iteration the fresh failures.
            error_text = report.collated_errors();
            record.duration_ms = iteration_started.elapsed().as_millis() as u64;
            iteration_detail.push(record);

            if passed {
                info!(iteration = iterations, "healing succeeded");
                success = true;
                break;
            }
        }

        let outcome = HealingOutcome {
            success,
            iterations,
            fixes_applied,
            final_score,
            diagnoses,
            iteration_detail,
            duration_ms: started.elapsed().as_millis() as u64,
        };
        info!(summary = %outcome.summary(), "healing loop finished");
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use crate::executor::Workspace;
    use crate::oracle::OracleOptions;
    use crate::validator::{CheckKind, VerificationStep};
    use async_trait::async_trait;
    use tokio_util::sync::CancellationToken;

    /// Replies with a diagnosis whose fix repairs `app.sh`.
    struct RepairOracle;

    #[async_trait]
    impl AiOracle for RepairOracle {
        async fn generate(
            &self,
            _p: &str,
            _o: &OracleOptions,
        ) -> Result<String, OracleError> {
            unreachable!("healing uses analyze")
        }
        async fn analyze(
            &self,
            _content: &str,
            _instruction: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(r#"{"error_type":"syntax","root_cause":"bad exit","confidence":0.9,"affected_files":["app.sh"],"cause_chain":[],"fixes":[{"file":"app.sh","line":1,"description":"exit cleanly","search":"exit 1","replace":"exit 0"}]}"#.into())
        }
    }

    /// Diagnoses but offers nothing actionable.
    struct NoFixOracle;

    #[async_trait]
    impl AiOracle for NoFixOracle {
        async fn generate(
            &self,
            _p: &str,
            _o: &OracleOptions,
        ) -> Result<String, OracleError> {
            unreachable!()
        }
        async fn analyze(
            &self,
            _c: &str,
            _i: &str,
            _o: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(r#"{"error_type":"unknown","root_cause":"unclear","confidence":0.9,"affected_files":[],"cause_chain":[],"fixes":[]}"#.into())
        }
    }

    fn executor(dir: &tempfile::TempDir) -> Executor {
        Executor::new(Workspace::new(dir.path()), CancellationToken::new())
    }

    /// A validator whose single check runs the workspace's `app.sh`.
    fn script_validator() -> Validator {
        Validator::new(vec![VerificationStep::new(
            "script",
            CheckKind::Custom,
            "sh app.sh",
            1,
        )])
    }

    #[tokio::test]
    async fn test_heal_succeeds_when_fix_repairs_check() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        exec.workspace().write("app.sh", "exit 1\n").await.unwrap();

        let outcome = HealingLoop::new(5)
            .heal(&exec, &script_validator(), &RepairOracle, "mystery failure")
            .await;

        assert!(outcome.success);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.fixes_applied, 1);
        assert!((outcome.final_score - 100.0).abs() < 1e-9);
        assert_eq!(exec.workspace().read("app.sh").await.unwrap(), "exit 0\n");
        assert!(outcome.summary().contains("healed"));

        assert_eq!(outcome.iteration_detail.len(), 1);
        let detail = &outcome.iteration_detail[0];
        assert_eq!(detail.fixes_offered, 1);
        assert_eq!(detail.fixes_applied, 1);
        assert!(detail.verified);
        assert!((detail.score - 100.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_heal_stops_when_no_fixes() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);

        let outcome = HealingLoop::new(5)
            .heal(&exec, &script_validator(), &NoFixOracle, "mystery failure")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.fixes_applied, 0);
        assert_eq!(outcome.diagnoses.len(), 1);
    }

    #[tokio::test]
    async fn test_heal_stops_when_nothing_applies() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        // Fix targets "exit 1" but the file says something else.
        exec.workspace().write("app.sh", "exit 7\n").await.unwrap();

        let outcome = HealingLoop::new(5)
            .heal(&exec, &script_validator(), &RepairOracle, "mystery failure")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 1);
        assert_eq!(outcome.fixes_applied, 0);
    }

    #[tokio::test]
    async fn test_iterations_bounded_by_budget() {
        use std::sync::atomic::{AtomicU32, Ordering};

        /// Always "fixes" something harmless so the loop keeps spinning.
        struct TreadmillOracle {
            round: AtomicU32,
        }

        #[async_trait]
        impl AiOracle for TreadmillOracle {
            async fn generate(
                &self,
                _p: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                unreachable!()
            }
            async fn analyze(
                &self,
                _content: &str,
                _i: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                // Bump a counter comment so every round applies one edit.
                let n = self.round.fetch_add(1, Ordering::SeqCst);
                Ok(format!(
                    r##"{{"error_type":"unknown","root_cause":"still failing","confidence":0.9,"affected_files":["app.sh"],"cause_chain":[],"fixes":[{{"file":"app.sh","line":1,"description":"bump","search":"# round {n}","replace":"# round {}"}}]}}"##,
                    n + 1
                ))
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        exec.workspace()
            .write("app.sh", "# round 0\necho still failing >&2\nexit 1\n")
            .await
            .unwrap();

        let oracle = TreadmillOracle {
            round: AtomicU32::new(0),
        };
        let outcome = HealingLoop::new(3)
            .heal(&exec, &script_validator(), &oracle, "still failing")
            .await;

        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 3);
        // fixes_applied never exceeds the sum of offered fixes.
        let offered: usize = outcome.diagnoses.iter().map(|d| d.fixes.len()).sum();
        assert!(outcome.fixes_applied as usize <= offered);
    }

    #[tokio::test]
    async fn test_high_confidence_rule_skips_oracle_in_loop() {
        /// Panics if consulted.
        struct UnreachableOracle;

        #[async_trait]
        impl AiOracle for UnreachableOracle {
            async fn generate(
                &self,
                _p: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                panic!("oracle must not be consulted")
            }
            async fn analyze(
                &self,
                _c: &str,
                _i: &str,
                _o: &OracleOptions,
            ) -> Result<String, OracleError> {
                panic!("oracle must not be consulted")
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);

        // Go `undefined:` rule is authoritative; its fix is advisory so the
        // loop stops after one iteration with nothing applied.
        let outcome = HealingLoop::new(5)
            .heal(
                &exec,
                &script_validator(),
                &UnreachableOracle,
                "src/x.go:10:5: undefined: Foo",
            )
            .await;
        assert!(!outcome.success);
        assert_eq!(outcome.iterations, 1);
    }
}

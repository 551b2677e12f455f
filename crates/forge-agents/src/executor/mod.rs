//! Plan-step execution over a sandboxed workspace.
//!
//! The executor owns the side effects: file edits, child processes, and
//! oracle calls. Control steps (`validate`, `deploy`, `rollback`) have no
//! side effect here — they surface as [`StepOutput::Control`] and the
//! orchestrator routes them to their owners (validator, bundler service,
//! checkpoint store). Cancellation is checked before every dispatch and
//! threads into command execution.

pub mod command;
pub mod files;
pub mod generate;
pub mod plan;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::diagnosis::Fix;
use crate::error::AgentError;
use crate::oracle::{AiOracle, OracleCapability, OracleOptions};

pub use command::CommandOutput;
pub use files::Workspace;
pub use plan::{BuildPlan, ModifyMode, PlanStep};

/// A control step the orchestrator must route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlRequest {
    Validate,
    Deploy { target: Option<String> },
    Rollback { checkpoint_id: Option<String> },
}

/// Typed result of one executed step.
#[derive(Debug, Clone, PartialEq)]
pub enum StepOutput {
    FileWritten { path: String, bytes: usize },
    FileModified { path: String, bytes: usize },
    FileDeleted { path: String },
    CommandRun(CommandOutput),
    FilesGenerated { paths: Vec<String> },
    Analysis { text: String },
    Control(ControlRequest),
}

/// Executor construction options.
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub command_timeout: Duration,
    pub oracle_timeout: Duration,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(120),
            oracle_timeout: Duration::from_secs(120),
        }
    }
}

/// Dispatches plan steps to side-effectful operations.
pub struct Executor {
    workspace: Workspace,
    oracle: Option<Arc<dyn AiOracle>>,
    options: ExecutorOptions,
    cancel: CancellationToken,
}

impl Executor {
    pub fn new(workspace: Workspace, cancel: CancellationToken) -> Self {
        Self {
            workspace,
            oracle: None,
            options: ExecutorOptions::default(),
            cancel,
        }
    }

    pub fn with_oracle(mut self, oracle: Arc<dyn AiOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    pub fn with_options(mut self, options: ExecutorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Execute one step. Cancellation is checked before any side effect.
    pub async fn execute(&self, step: &PlanStep) -> Result<StepOutput, AgentError> {
        if self.cancel.is_cancelled() {
            return Err(AgentError::Cancelled(format!(
                "step `{}`",
                step.action_name()
            )));
        }

        match step {
            PlanStep::CreateFile { path, content } => {
                let bytes = self.workspace.write(path, content).await?;
                Ok(StepOutput::FileWritten {
                    path: path.clone(),
                    bytes,
                })
            }
            PlanStep::ModifyFile { path, mode } => {
                let bytes = self.workspace.modify(path, mode).await?;
                Ok(StepOutput::FileModified {
                    path: path.clone(),
                    bytes,
                })
            }
            PlanStep::DeleteFile { path } => {
                self.workspace.delete(path).await?;
                Ok(StepOutput::FileDeleted { path: path.clone() })
            }
            PlanStep::RunCommand { command } => self.run(command).await,
            PlanStep::RunTests { command } => {
                let command = command.as_deref().unwrap_or("npm test");
                self.run(command).await
            }
            PlanStep::InstallDeps { packages } => {
                let command = if packages.is_empty() {
                    "npm install".to_string()
                } else {
                    format!("npm install {}", packages.join(" "))
                };
                let output = self.run_raw(&command).await?;
                // Unlike build/test commands, a failed install is not
                // something the healer can patch around.
                if !output.success() {
                    return Err(AgentError::CommandExit {
                        code: output.exit_code,
                        stderr: output.stderr,
                    });
                }
                Ok(StepOutput::CommandRun(output))
            }
            PlanStep::AiGenerate { prompt } => self.ai_generate(prompt).await,
            PlanStep::AiAnalyze {
                target,
                instruction,
            } => self.ai_analyze(target, instruction).await,
            PlanStep::Validate => Ok(StepOutput::Control(ControlRequest::Validate)),
            PlanStep::Deploy { target } => Ok(StepOutput::Control(ControlRequest::Deploy {
                target: target.clone(),
            })),
            PlanStep::Rollback { checkpoint_id } => {
                Ok(StepOutput::Control(ControlRequest::Rollback {
                    checkpoint_id: checkpoint_id.clone(),
                }))
            }
        }
    }

    /// Apply a diagnosis fix (the healing loop's entry point).
    pub async fn apply_fix(&self, fix: &Fix) -> Result<bool, AgentError> {
        self.workspace.apply_fix(fix).await
    }

    async fn run(&self, command_line: &str) -> Result<StepOutput, AgentError> {
        Ok(StepOutput::CommandRun(self.run_raw(command_line).await?))
    }

    async fn run_raw(&self, command_line: &str) -> Result<CommandOutput, AgentError> {
        command::run_command(
            command_line,
            self.workspace.root(),
            self.options.command_timeout,
            &self.cancel,
        )
        .await
    }

    fn oracle(&self) -> Result<&Arc<dyn AiOracle>, AgentError> {
        self.oracle
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("no oracle configured for AI step").into())
    }

    async fn ai_generate(&self, prompt: &str) -> Result<StepOutput, AgentError> {
        let oracle = self.oracle()?;
        let options = OracleOptions {
            capability: Some(OracleCapability::Generation),
            system_prompt: Some(
                "You generate project files. Announce each file with a `FILE: <path>` \
                 marker line followed by a fenced code block with its full content."
                    .to_string(),
            ),
            ..Default::default()
        };

        let reply = tokio::time::timeout(self.options.oracle_timeout, oracle.generate(prompt, &options))
            .await
            .map_err(|_| AgentError::Timeout {
                operation: "oracle generate".into(),
                seconds: self.options.oracle_timeout.as_secs(),
            })??;

        let files = generate::parse_generated_files(&reply);
        let mut paths = Vec::with_capacity(files.len());
        for (path, content) in files {
            self.workspace.write(&path, &content).await?;
            paths.push(path);
        }
        info!(files = paths.len(), "oracle generation written to workspace");
        Ok(StepOutput::FilesGenerated { paths })
    }

    async fn ai_analyze(&self, target: &str, instruction: &str) -> Result<StepOutput, AgentError> {
        let oracle = self.oracle()?;
        let content = self.workspace.read(target).await?;
        let options = OracleOptions::default();

        let text = tokio::time::timeout(
            self.options.oracle_timeout,
            oracle.analyze(&content, instruction, &options),
        )
        .await
        .map_err(|_| AgentError::Timeout {
            operation: "oracle analyze".into(),
            seconds: self.options.oracle_timeout.as_secs(),
        })??;

        Ok(StepOutput::Analysis { text })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OracleError;
    use async_trait::async_trait;

    struct ScriptedOracle {
        reply: String,
    }

    #[async_trait]
    impl AiOracle for ScriptedOracle {
        async fn generate(
            &self,
            _prompt: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(self.reply.clone())
        }
        async fn analyze(
            &self,
            _content: &str,
            _instruction: &str,
            _options: &OracleOptions,
        ) -> Result<String, OracleError> {
            Ok(self.reply.clone())
        }
    }

    fn executor(dir: &tempfile::TempDir) -> Executor {
        Executor::new(Workspace::new(dir.path()), CancellationToken::new())
    }

    #[tokio::test]
    async fn test_create_modify_delete_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);

        let out = exec
            .execute(&PlanStep::CreateFile {
                path: "src/a.ts".into(),
                content: "let a = 1;".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            out,
            StepOutput::FileWritten {
                path: "src/a.ts".into(),
                bytes: 10
            }
        );

        exec.execute(&PlanStep::ModifyFile {
            path: "src/a.ts".into(),
            mode: ModifyMode::Append {
                content: "\nlet b = 2;".into(),
            },
        })
        .await
        .unwrap();
        assert_eq!(
            exec.workspace().read("src/a.ts").await.unwrap(),
            "let a = 1;\nlet b = 2;"
        );

        exec.execute(&PlanStep::DeleteFile {
            path: "src/a.ts".into(),
        })
        .await
        .unwrap();
        assert!(exec.workspace().read("src/a.ts").await.is_err());
    }

    #[tokio::test]
    async fn test_run_command_dispatch() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);

        let out = exec
            .execute(&PlanStep::RunCommand {
                command: "echo built".into(),
            })
            .await
            .unwrap();
        match out {
            StepOutput::CommandRun(cmd) => {
                assert!(cmd.success());
                assert_eq!(cmd.stdout.trim(), "built");
            }
            other => panic!("expected CommandRun, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ai_generate_writes_parsed_files() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = Arc::new(ScriptedOracle {
            reply: "FILE: src/App.tsx\n```tsx\nexport const App = () => null;\n```\n\nFILE: src/index.ts\n```ts\nimport './App';\n```".into(),
        });
        let exec = executor(&dir).with_oracle(oracle);

        let out = exec
            .execute(&PlanStep::AiGenerate {
                prompt: "make an app".into(),
            })
            .await
            .unwrap();
        assert_eq!(
            out,
            StepOutput::FilesGenerated {
                paths: vec!["src/App.tsx".into(), "src/index.ts".into()]
            }
        );
        assert_eq!(
            exec.workspace().read("src/App.tsx").await.unwrap(),
            "export const App = () => null;\n"
        );
    }

    #[tokio::test]
    async fn test_ai_step_without_oracle_fails() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);
        let err = exec
            .execute(&PlanStep::AiGenerate {
                prompt: "anything".into(),
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no oracle"));
    }

    #[tokio::test]
    async fn test_control_steps_surface_requests() {
        let dir = tempfile::tempdir().unwrap();
        let exec = executor(&dir);

        assert_eq!(
            exec.execute(&PlanStep::Validate).await.unwrap(),
            StepOutput::Control(ControlRequest::Validate)
        );
        assert_eq!(
            exec.execute(&PlanStep::Deploy { target: None }).await.unwrap(),
            StepOutput::Control(ControlRequest::Deploy { target: None })
        );
        assert_eq!(
            exec.execute(&PlanStep::Rollback {
                checkpoint_id: Some("cp-1".into())
            })
            .await
            .unwrap(),
            StepOutput::Control(ControlRequest::Rollback {
                checkpoint_id: Some("cp-1".into())
            })
        );
    }

    #[tokio::test]
    async fn test_cancelled_executor_refuses_steps() {
        let dir = tempfile::tempdir().unwrap();
        let cancel = CancellationToken::new();
        let exec = Executor::new(Workspace::new(dir.path()), cancel.clone());
        cancel.cancel();

        let err = exec
            .execute(&PlanStep::CreateFile {
                path: "a.txt".into(),
                content: "x".into(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::Cancelled(_)));
        assert!(exec.workspace().read("a.txt").await.is_err());
    }
}

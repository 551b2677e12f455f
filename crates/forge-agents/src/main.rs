//! forge-agents binary: run one build from a plan file, or read telemetry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use bundler::{
    BundleCache, BundleError, BundleResult, Bundler, BundlerService, CacheOptions,
    ResolvedBundleConfig, ServiceOptions,
};
use forge_agents::executor::{Executor, ExecutorOptions, Workspace};
use forge_agents::oracle::RetryingOracle;
use forge_agents::{
    AgentFsm, BuildPlan, ForgeConfig, FsmOptions, HealingLoop, HttpOracle, JsonCheckpointStore,
    Orchestrator, Validator,
};

#[derive(Parser)]
#[command(name = "forge-agents", about = "Agent-orchestrated build runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a build plan against a workspace.
    Run {
        /// Build working directory.
        #[arg(long)]
        workspace: PathBuf,
        /// Plan JSON file ({"steps": [...]}).
        #[arg(long)]
        plan: PathBuf,
        /// Build identifier (defaults to a fresh UUID).
        #[arg(long)]
        build_id: Option<String>,
    },
    /// Print aggregate analytics from a telemetry JSONL file.
    Analytics {
        #[arg(long, default_value = ".forge-telemetry.jsonl")]
        path: PathBuf,
    },
}

/// Bundler backed by the esbuild CLI.
struct EsbuildBundler;

#[async_trait::async_trait]
impl Bundler for EsbuildBundler {
    async fn bundle(
        &self,
        project_path: &Path,
        config: &ResolvedBundleConfig,
    ) -> Result<BundleResult> {
        let started = std::time::Instant::now();
        let output = tokio::process::Command::new("npx")
            .arg("esbuild")
            .arg(&config.entry_point)
            .arg("--bundle")
            .arg(format!("--format={}", config.format))
            .arg(format!("--target={}", config.target))
            .args(config.minify.then_some("--minify"))
            .args(config.source_map.then_some("--sourcemap=inline"))
            .current_dir(project_path)
            .kill_on_drop(true)
            .output()
            .await
            .context("failed to spawn esbuild")?;

        let duration_ms = started.elapsed().as_millis() as u64;
        if output.status.success() {
            Ok(BundleResult {
                output_js: String::from_utf8_lossy(&output.stdout).into_owned(),
                output_css: None,
                source_map: None,
                duration_ms,
                warnings: Vec::new(),
                errors: Vec::new(),
                success: true,
                hash: String::new(),
                metafile: None,
            })
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            Ok(BundleResult {
                output_js: String::new(),
                output_css: None,
                source_map: None,
                duration_ms,
                warnings: Vec::new(),
                errors: vec![BundleError::message(stderr)],
                success: false,
                hash: String::new(),
                metafile: None,
            })
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match Cli::parse().command {
        Command::Run {
            workspace,
            plan,
            build_id,
        } => run_build(workspace, plan, build_id).await,
        Command::Analytics { path } => {
            let analytics = forge_agents::telemetry::read_analytics(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&analytics)?);
            Ok(())
        }
    }
}

async fn run_build(workspace: PathBuf, plan_path: PathBuf, build_id: Option<String>) -> Result<()> {
    let config = ForgeConfig::default();
    let build_id = build_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let plan_json = std::fs::read_to_string(&plan_path)
        .with_context(|| format!("reading plan {}", plan_path.display()))?;
    let plan = BuildPlan::from_json(&plan_json)?;
    info!(build_id = %build_id, steps = plan.len(), "starting build");

    let fsm = match &config.checkpoint_dir {
        Some(dir) => Arc::new(AgentFsm::with_store(
            &build_id,
            FsmOptions {
                max_retries: config.max_retries,
                total_steps: plan.len() as u32,
            },
            Arc::new(JsonCheckpointStore::new(dir.clone())),
        )),
        None => Arc::new(AgentFsm::new(
            &build_id,
            FsmOptions {
                max_retries: config.max_retries,
                total_steps: plan.len() as u32,
            },
        )),
    };

    let cancel = CancellationToken::new();
    let mut executor = Executor::new(Workspace::new(&workspace), cancel.clone()).with_options(
        ExecutorOptions {
            command_timeout: config.command_timeout,
            oracle_timeout: config.oracle_timeout,
        },
    );

    let oracle = config.oracle.as_ref().map(|endpoint| {
        let http = HttpOracle::new(
            &endpoint.url,
            &endpoint.api_key,
            &endpoint.model,
            config.oracle_timeout,
        );
        Arc::new(RetryingOracle::new(http, config.oracle_max_retries))
            as Arc<dyn forge_agents::AiOracle>
    });
    if let Some(oracle) = &oracle {
        executor = executor.with_oracle(Arc::clone(oracle));
    } else {
        warn!("no oracle configured; AI steps and assisted diagnosis disabled");
    }

    let cache = Arc::new(BundleCache::new(CacheOptions::default()));
    let bundler_service = Arc::new(BundlerService::new(
        Arc::new(EsbuildBundler),
        cache,
        ServiceOptions {
            work_root: workspace.join(".forge-bundles"),
            bundle_timeout: Duration::from_secs(60),
        },
    ));

    let mut orchestrator = Orchestrator::new(
        fsm,
        Arc::new(executor),
        Validator::standard(),
        HealingLoop::new(config.max_heal_iterations),
        cancel.clone(),
    )
    .with_checkpoint_timeout(config.checkpoint_timeout)
    .with_bundler(bundler_service);
    if let Some(oracle) = oracle {
        orchestrator = orchestrator.with_oracle(oracle);
    }

    // Ctrl-C cancels the build; the orchestrator drives the FSM to
    // `cancelled` and still reports.
    let handle = orchestrator.handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling build");
            handle.cancel();
        }
    });

    let report = orchestrator.run(&plan).await;
    forge_agents::telemetry::write_build_metrics(&report.metrics, &workspace);
    forge_agents::telemetry::append_telemetry(&report.metrics, &workspace);
    println!("{}", serde_json::to_string_pretty(&report)?);

    if report.success {
        Ok(())
    } else {
        anyhow::bail!("build ended in state {}", report.final_state)
    }
}

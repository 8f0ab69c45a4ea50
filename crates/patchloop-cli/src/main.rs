//! Patchloop CLI
//!
//! The `patchloop` command drives one repair run against a local project.
//!
//! ## Commands
//!
//! - `run`: detect failing tests, repair them, write the run report
//! - `replay`: verify and print a previously written run report, or list them
//! - `config`: print the effective configuration as TOML

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use patchloop_core::provider::CommandProvider;
use patchloop_core::sandbox::sanitized_env;
use patchloop_core::{
    detect_buildpack, list_report_artifacts, read_report_artifact, write_report_artifact,
    Controller, EnsembleMode, Goal, PlannerMode, RunConfig, RunReport,
};
use patchloop_state::SurrealLearningStore;
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "patchloop")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Autonomous test-driven repair loop", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Repair the failing tests of a project
    Run(RunArgs),

    /// Verify a recorded run report against its digest and print it
    Replay {
        /// Run ID to replay
        #[arg(long, required_unless_present = "list")]
        run: Option<String>,

        /// List every verified report instead
        #[arg(long, conflicts_with = "run")]
        list: bool,

        /// Directory holding run reports
        #[arg(long, default_value = ".patchloop/runs")]
        report_dir: PathBuf,
    },

    /// Print the effective configuration
    Config(ConfigArgs),
}

#[derive(Args, Debug, Default)]
struct ConfigArgs {
    /// TOML configuration file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Step limit for the run
    #[arg(long)]
    max_steps: Option<u64>,

    /// `single` or `ensemble`
    #[arg(long)]
    ensemble_mode: Option<EnsembleMode>,

    /// Candidates evaluated concurrently (K)
    #[arg(long)]
    parallel_patches: Option<usize>,

    /// `v1` (pattern) or `v2` (model decomposition)
    #[arg(long)]
    planner_mode: Option<PlannerMode>,

    /// Count budget overruns without refusing work
    #[arg(long)]
    no_enforce_budget: bool,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Local path of the project to repair
    #[arg(long, default_value = ".")]
    source_url: PathBuf,

    /// `auto` or a buildpack name (cargo, python, node, go)
    #[arg(long, default_value = "auto")]
    buildpack: String,

    /// Repair provider command line; repeat for secondaries, first is primary
    #[arg(long = "provider-cmd", required = true)]
    provider_cmds: Vec<String>,

    /// What the run should achieve
    #[arg(long, default_value = "fix the failing tests")]
    goal: String,

    /// On-disk learning store; in-memory when omitted
    #[arg(long, env = "PATCHLOOP_LEARNING_DB")]
    learning_db_path: Option<PathBuf>,

    /// Directory receiving `<run_id>/report.json`
    #[arg(long, default_value = ".patchloop/runs")]
    report_dir: PathBuf,

    #[command(flatten)]
    config: ConfigArgs,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    patchloop_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run(args) => {
            let report = cmd_run(&args).await?;
            print_report(&report, cli.json)?;
            std::process::exit(report.exit_code());
        }
        Commands::Replay {
            run,
            list,
            report_dir,
        } => match run {
            Some(run) if !list => cmd_replay(&run, &report_dir, cli.json),
            _ => cmd_list(&report_dir, cli.json),
        },
        Commands::Config(args) => {
            let config = resolve_config(&args)?;
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Load the optional TOML file, then apply flag overrides.
fn resolve_config(args: &ConfigArgs) -> Result<RunConfig> {
    let mut config = match &args.config {
        Some(path) => RunConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RunConfig::default(),
    };
    if let Some(steps) = args.max_steps {
        config.budget.limits.max_steps = Some(steps);
    }
    if let Some(mode) = args.ensemble_mode {
        config.ensemble.mode = mode;
    }
    if let Some(k) = args.parallel_patches {
        config = config.with_parallel_patches(k);
    }
    if let Some(mode) = args.planner_mode {
        config.planner_mode = mode;
    }
    if args.no_enforce_budget {
        config.budget.enforce = false;
    }
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Split a provider command line with shell quoting rules.
fn provider_argv(cmd: &str) -> Result<Vec<String>> {
    let argv = shell_words::split(cmd)
        .with_context(|| format!("Invalid --provider-cmd: {cmd}"))?;
    if argv.is_empty() {
        anyhow::bail!("--provider-cmd must not be empty");
    }
    Ok(argv)
}

fn command_provider(
    id: String,
    cmd: &str,
    repo: &Path,
    config: &RunConfig,
) -> Result<CommandProvider> {
    Ok(CommandProvider::new(id, provider_argv(cmd)?, repo)
        .with_env(sanitized_env(&config.sandbox.env_passthrough))
        .with_timeout(Duration::from_millis(config.ensemble.provider_timeout_ms)))
}

async fn cmd_run(args: &RunArgs) -> Result<RunReport> {
    let config = resolve_config(&args.config)?;
    let repo = args
        .source_url
        .canonicalize()
        .with_context(|| format!("Source path not found: {}", args.source_url.display()))?;

    let buildpack = detect_buildpack(&repo, &args.buildpack).with_context(|| {
        format!(
            "No buildpack '{}' matches {}",
            args.buildpack,
            repo.display()
        )
    })?;
    let goal = Goal::new(&args.goal, buildpack.build_spec(&repo).test_cmd)
        .context("Invalid goal")?;

    let store = Arc::new(match &args.learning_db_path {
        Some(path) => SurrealLearningStore::open(path)
            .await
            .with_context(|| format!("Failed to open learning store {}", path.display()))?,
        None => SurrealLearningStore::in_memory()
            .await
            .context("Failed to start in-memory learning store")?,
    });

    let mut builder = Controller::builder(&repo)
        .config(config.clone())
        .buildpack(buildpack)
        .outcome_store(store.clone())
        .plan_store(store);
    for (idx, cmd) in args.provider_cmds.iter().enumerate() {
        let id = format!("provider-{idx}");
        builder = builder.provider(Arc::new(command_provider(id, cmd, &repo, &config)?));
    }
    if config.planner_mode == PlannerMode::V2 {
        let primary = &args.provider_cmds[0];
        builder = builder.decomposer(Box::new(command_provider(
            "decomposer".into(),
            primary,
            &repo,
            &config,
        )?));
    }
    let controller = builder.build().context("Failed to set up controller")?;

    info!(repo = %repo.display(), goal = %args.goal, "starting run");
    let report = controller.run(&goal).await;

    let path = write_report_artifact(&report, &args.report_dir)
        .with_context(|| format!("Failed to write report to {}", args.report_dir.display()))?;
    info!(path = %path.display(), "report written");
    Ok(report)
}

fn cmd_replay(run_id: &str, report_dir: &Path, json: bool) -> Result<()> {
    let report = read_report_artifact(run_id, report_dir)
        .with_context(|| format!("Failed to replay run {run_id}"))?;
    print_report(&report, json)
}

fn cmd_list(report_dir: &Path, json: bool) -> Result<()> {
    let listings = list_report_artifacts(report_dir)
        .with_context(|| format!("Failed to list reports in {}", report_dir.display()))?;
    if json {
        println!("{}", serde_json::to_string_pretty(&listings)?);
        return Ok(());
    }
    if listings.is_empty() {
        println!("no reports in {}", report_dir.display());
    }
    for listing in &listings {
        let plan = &listing.plan;
        println!(
            "{}  {}  {} ({})  steps {}/{} ok, {} file(s), {}ms",
            listing.started_at.format("%Y-%m-%d %H:%M:%S"),
            listing.run_id,
            listing.status.as_str(),
            listing.reason,
            plan.succeeded,
            plan.steps,
            plan.files_touched.len(),
            listing.duration_ms
        );
    }
    Ok(())
}

fn print_report(report: &RunReport, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
        return Ok(());
    }
    println!("run {}: {}", report.run_id, report.summary());
    if let Some(plan_id) = &report.plan_id {
        println!("  plan: {plan_id}");
    }
    for step in &report.steps {
        println!("  [{:?}] {} ({})", step.state, step.id, step.title);
    }
    for artifact in &report.artifacts {
        println!(
            "  applied {} via {}: {} file(s), diff {}, {}ms",
            artifact.step_id,
            artifact.provider,
            artifact.files.len(),
            &artifact.diff_digest[..artifact.diff_digest.len().min(12)],
            artifact.elapsed_ms
        );
    }
    if let Some(patch) = &report.applied_patch {
        println!("\n{patch}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("patchloop.toml");
        std::fs::write(
            &path,
            "planner_mode = \"v2\"\n[budget.limits]\nmax_steps = 40\n",
        )
        .unwrap();

        let cli = Cli::try_parse_from([
            "patchloop",
            "run",
            "--provider-cmd",
            "repair-bot --fast",
            "--config",
            path.to_str().unwrap(),
            "--max-steps",
            "5",
            "--parallel-patches",
            "2",
            "--ensemble-mode",
            "single",
            "--no-enforce-budget",
        ])
        .unwrap();
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = resolve_config(&args.config).unwrap();

        assert_eq!(config.planner_mode, PlannerMode::V2);
        assert_eq!(config.budget.limits.max_steps, Some(5));
        assert_eq!(config.evaluator.workers, 2);
        assert_eq!(config.sandbox.max_live, 2);
        assert_eq!(config.ensemble.mode, EnsembleMode::Single);
        assert!(!config.budget.enforce);
    }

    #[test]
    fn run_requires_a_provider() {
        assert!(Cli::try_parse_from(["patchloop", "run"]).is_err());
        assert!(Cli::try_parse_from(["patchloop", "run", "--planner-mode", "v3"]).is_err());
    }

    #[test]
    fn provider_command_honours_shell_quoting() {
        assert_eq!(
            provider_argv("  bot  --model x ").unwrap(),
            vec!["bot", "--model", "x"]
        );
        assert_eq!(
            provider_argv(r#"bot --prompt "fix it" --tag 'a b'"#).unwrap(),
            vec!["bot", "--prompt", "fix it", "--tag", "a b"]
        );
        assert!(provider_argv("   ").is_err());
        assert!(provider_argv(r#"bot --prompt "unterminated"#).is_err());
    }

    #[test]
    fn replay_rejects_missing_report() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_replay("nope", dir.path(), false).is_err());
    }

    #[test]
    fn replay_takes_a_run_or_list() {
        let cli = Cli::try_parse_from(["patchloop", "replay", "--list"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Replay {
                run: None,
                list: true,
                ..
            }
        ));
        assert!(Cli::try_parse_from(["patchloop", "replay", "--run", "r1"]).is_ok());
        assert!(Cli::try_parse_from(["patchloop", "replay"]).is_err());
        assert!(Cli::try_parse_from(["patchloop", "replay", "--run", "r1", "--list"]).is_err());
    }

    #[test]
    fn listing_an_empty_directory_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        assert!(cmd_list(dir.path(), false).is_ok());
        assert!(cmd_list(&dir.path().join("absent"), true).is_ok());
    }
}

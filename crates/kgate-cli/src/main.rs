//! `kgate` command-line interface
//!
//! Assess, plan and simulate resource change-sets read from JSON files.
//! `simulate` runs the full request, confirm and apply cycle against an
//! in-memory cluster seeded from the change-set.

use anyhow::{bail, Context, Result};
use clap::{value_parser, Arg, ArgAction, ArgMatches, Command};
use kgate_core::executor::MockCluster;
use kgate_core::{
    ApplyRequest, ExecutionResult, GateConfig, GateError, ResourceChange, SafetyAssessment,
    SafetyGate, StaticRecommender, TimingPreset,
};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogFormat {
    Text,
    Json,
}

fn cli() -> Command {
    let changes = Arg::new("changes")
        .long("changes")
        .short('c')
        .required(true)
        .value_parser(value_parser!(PathBuf))
        .help("JSON file with the proposed resource changes");
    let json = Arg::new("json")
        .long("json")
        .action(ArgAction::SetTrue)
        .help("Output as JSON");

    Command::new("kgate")
        .version(kgate_core::VERSION)
        .about("Safety-gated orchestration of workload resource changes")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .arg(
            Arg::new("config")
                .long("config")
                .global(true)
                .value_parser(value_parser!(PathBuf))
                .help("TOML configuration file"),
        )
        .arg(
            Arg::new("log-filter")
                .long("log-filter")
                .global(true)
                .help("Tracing filter directive; overrides RUST_LOG"),
        )
        .arg(
            Arg::new("log-format")
                .long("log-format")
                .global(true)
                .value_parser(["text", "json"])
                .default_value("text")
                .help("Log output format"),
        )
        .subcommand(
            Command::new("assess")
                .about("Assess the risk of a change-set")
                .arg(changes.clone())
                .arg(json.clone()),
        )
        .subcommand(
            Command::new("plan")
                .about("Show the stages a rollout would run")
                .arg(changes.clone())
                .arg(json.clone()),
        )
        .subcommand(
            Command::new("simulate")
                .about("Run the full confirmation and rollout cycle against an in-memory cluster")
                .arg(changes)
                .arg(json)
                .arg(
                    Arg::new("dry-run")
                        .long("dry-run")
                        .action(ArgAction::SetTrue)
                        .help("Simulate the patches instead of applying them"),
                )
                .arg(
                    Arg::new("auto-approve")
                        .long("auto-approve")
                        .action(ArgAction::SetTrue)
                        .help("Confirm the token without prompting"),
                )
                .arg(
                    Arg::new("timing")
                        .long("timing")
                        .value_parser(["immediate", "mock", "production"])
                        .default_value("mock")
                        .help("Rollout timing preset"),
                ),
        )
        .subcommand(Command::new("config").about("Print the effective configuration as TOML"))
}

fn init_logging(filter: Option<&str>, format: LogFormat) {
    let env_filter = match filter {
        Some(directive) => EnvFilter::new(directive),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
    };
    let registry = tracing_subscriber::registry().with(env_filter);
    match format {
        LogFormat::Json => registry
            .with(fmt::layer().json().with_writer(std::io::stderr))
            .init(),
        LogFormat::Text => registry
            .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
            .init(),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let matches = cli().get_matches();

    let format = match matches.get_one::<String>("log-format").map(String::as_str) {
        Some("json") => LogFormat::Json,
        _ => LogFormat::Text,
    };
    init_logging(
        matches.get_one::<String>("log-filter").map(String::as_str),
        format,
    );

    match run(&matches).await {
        Ok(code) => code,
        Err(err) => {
            if let Some(gate_err) = err.downcast_ref::<GateError>() {
                if let Ok(report) = serde_json::to_string_pretty(&gate_err.report()) {
                    eprintln!("{report}");
                }
            }
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(matches: &ArgMatches) -> Result<ExitCode> {
    let config = load_config(matches.get_one::<PathBuf>("config"))?;

    match matches.subcommand() {
        Some(("assess", args)) => assess(config, args).await,
        Some(("plan", args)) => plan(config, args).await,
        Some(("simulate", args)) => simulate(config, args).await,
        Some(("config", _)) => {
            print!("{}", config.to_toml_string()?);
            Ok(ExitCode::SUCCESS)
        }
        Some((other, _)) => bail!("unknown command {other}"),
        None => bail!("no command given"),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<GateConfig> {
    match path {
        Some(path) => GateConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display())),
        None => Ok(GateConfig::default()),
    }
}

async fn load_changes(args: &ArgMatches) -> Result<Vec<ResourceChange>> {
    let path: &Path = args
        .get_one::<PathBuf>("changes")
        .context("--changes is required")?;
    let recommender = StaticRecommender::load(path)
        .await
        .with_context(|| format!("reading change-set from {}", path.display()))?;
    Ok(recommender.changes().to_vec())
}

fn gate_for(config: GateConfig, changes: &[ResourceChange]) -> Result<SafetyGate> {
    let cluster = Arc::new(MockCluster::seeded(changes));
    Ok(SafetyGate::builder(config).with_cluster(cluster).build()?)
}

fn print_json<T: serde::Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn assess(config: GateConfig, args: &ArgMatches) -> Result<ExitCode> {
    let changes = load_changes(args).await?;
    let gate = gate_for(config, &changes)?;
    let assessment = gate.assess(&changes)?;

    if args.get_flag("json") {
        print_json(&assessment)?;
    } else {
        print_assessment(&assessment);
    }
    Ok(if assessment.blocked {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}

fn print_assessment(assessment: &SafetyAssessment) {
    println!(
        "Risk: {}{}",
        assessment.risk_level,
        if assessment.blocked { " (BLOCKED)" } else { "" }
    );
    println!("Resources: {}", assessment.resources_affected);
    if !assessment.production_namespaces.is_empty() {
        println!(
            "Production namespaces: {}",
            assessment.production_namespaces.join(", ")
        );
    }
    for warning in &assessment.warnings {
        println!("  [{}] {}: {}", warning.level, warning.code, warning.message);
    }
    for recommendation in &assessment.recommendations {
        println!("  - {recommendation}");
    }
}

async fn plan(config: GateConfig, args: &ArgMatches) -> Result<ExitCode> {
    let changes = load_changes(args).await?;
    let gate = gate_for(config, &changes)?;
    let stages = gate.plan(&changes)?;

    if args.get_flag("json") {
        print_json(&stages)?;
    } else {
        for stage in &stages {
            println!(
                "Stage {}: {}/{} ({} changes, {} risk{})",
                stage.index + 1,
                stage.cluster,
                stage.namespace,
                stage.changes.len(),
                stage.risk_level,
                if stage.production { ", production" } else { "" }
            );
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn simulate(mut config: GateConfig, args: &ArgMatches) -> Result<ExitCode> {
    config.timing.preset = match args.get_one::<String>("timing").map(String::as_str) {
        Some("immediate") => TimingPreset::Immediate,
        Some("production") => TimingPreset::Production,
        _ => TimingPreset::Mock,
    };
    let threshold = config.rollout.success_threshold;
    let changes = load_changes(args).await?;
    let gate = gate_for(config, &changes)?;

    let request = gate.request_confirmation(&changes)?;
    tracing::info!(
        token = %request.token.id,
        risk = %request.token.risk_level,
        changes = request.summary.total_changes,
        "confirmation requested"
    );
    println!("{}", request.prompt);

    if !args.get_flag("auto-approve") && !ask_approval().await? {
        tracing::warn!(token = %request.token.id, "confirmation declined");
        println!("Not confirmed; nothing applied.");
        return Ok(ExitCode::from(2));
    }
    gate.confirm(request.token.id)?;

    let mut apply = ApplyRequest::new(changes).with_token(request.token.id);
    if args.get_flag("dry-run") {
        apply = apply.dry_run();
    }
    let result = gate.apply(apply).await?;

    if args.get_flag("json") {
        print_json(&result)?;
    } else {
        print_result(&result);
    }
    if let Some(err) = GateError::from_rollout(&result, threshold) {
        print_json(&err.report())?;
        return Ok(ExitCode::FAILURE);
    }
    Ok(ExitCode::SUCCESS)
}

async fn ask_approval() -> Result<bool> {
    println!("Type 'yes' to confirm:");
    let mut line = String::new();
    tokio::io::BufReader::new(tokio::io::stdin())
        .read_line(&mut line)
        .await
        .context("reading confirmation")?;
    Ok(line.trim().eq_ignore_ascii_case("yes"))
}

fn print_result(result: &ExecutionResult) {
    println!("Rollout {:?} ({})", result.status, result.mode.as_str());
    for stage in &result.stages {
        println!(
            "  Stage {} {}/{}: {:?}",
            stage.index + 1,
            stage.cluster,
            stage.namespace,
            stage.status
        );
        if let Some(error) = &stage.error {
            println!("    {error}");
        }
    }
    for snapshot_id in &result.snapshot_ids {
        println!("Rollback snapshot: {snapshot_id}");
    }
}

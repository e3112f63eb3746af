//! `patchloop` CLI.
//!
//! `stream` and `run` drive the pipeline against a local repository; `scan`,
//! `check-diff` and `init` expose the deterministic pieces on their own.

use std::fs;
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use serde::Serialize;

use patchloop::core::allowlist::AllowList;
use patchloop::core::diff::validate_unified_diff;
use patchloop::core::events::RunEvent;
use patchloop::core::summary::RunSummary;
use patchloop::core::types::{ModelSet, RunRequest};
use patchloop::exit_codes;
use patchloop::io::broker::OllamaBroker;
use patchloop::io::config::{CONFIG_FILE, PatchloopConfig, config_path, load_config, write_config};
use patchloop::io::prompt::Prompts;
use patchloop::io::scanner::{ensure_repo_dir, scan};
use patchloop::logging;
use patchloop::run::Pipeline;
use patchloop::stream::{collect_run, start_run, write_ndjson};

#[derive(Parser)]
#[command(
    name = "patchloop",
    version,
    about = "Plan, patch and verify changes to a local git repository with LLM stages"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the pipeline, writing NDJSON events to stdout as they happen.
    Stream(RunArgs),
    /// Run the pipeline to completion and print a JSON summary.
    Run {
        #[command(flatten)]
        args: RunArgs,
        /// Include every event in the summary.
        #[arg(long)]
        events: bool,
    },
    /// Print the repository map as JSON.
    Scan {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Glob a mapped file must match (repeatable).
        #[arg(long = "allow")]
        allow: Vec<String>,
        #[arg(long)]
        max_map: Option<usize>,
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Validate a unified diff against the path policy.
    CheckDiff {
        /// Diff file, or `-` for stdin.
        diff: PathBuf,
        /// Glob a touched path must match (repeatable).
        #[arg(long = "allow")]
        allow: Vec<String>,
    },
    /// Write the default `.patchloop.toml` into the repository.
    Init {
        #[arg(long, default_value = ".")]
        repo: PathBuf,
        /// Overwrite an existing config.
        #[arg(short, long)]
        force: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(long, default_value = ".")]
    repo: PathBuf,
    /// Change request text.
    #[arg(long, conflicts_with = "ticket_file", required_unless_present = "ticket_file")]
    ticket: Option<String>,
    /// Read the change request from a file.
    #[arg(long)]
    ticket_file: Option<PathBuf>,
    /// Glob a touched path must match (repeatable). Replaces the configured list.
    #[arg(long = "allow")]
    allow: Vec<String>,
    /// Constraint forwarded to the planner (repeatable).
    #[arg(long = "constraint")]
    constraints: Vec<String>,
    #[arg(long)]
    planner: Option<String>,
    #[arg(long)]
    coder: Option<String>,
    #[arg(long)]
    critic: Option<String>,
    /// Per-command timeout in seconds.
    #[arg(long)]
    timeout_sec: Option<u64>,
    /// Maximum files in the repo map.
    #[arg(long)]
    max_map: Option<usize>,
    #[arg(long)]
    config: Option<PathBuf>,
}

fn main() {
    logging::init();
    let cli = Cli::parse();
    let code = match dispatch(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn dispatch(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Stream(args) => cmd_stream(&args),
        Command::Run { args, events } => cmd_run(&args, events),
        Command::Scan {
            repo,
            allow,
            max_map,
            config,
        } => cmd_scan(&repo, allow, max_map, config.as_deref()),
        Command::CheckDiff { diff, allow } => cmd_check_diff(&diff, allow),
        Command::Init { repo, force } => cmd_init(&repo, force),
    }
}

fn cmd_stream(args: &RunArgs) -> Result<i32> {
    let (cfg, request) = prepare(args)?;
    let stream = start_run(pipeline(&cfg, &request.repo)?, request)?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let last = write_ndjson(stream, &mut out)?;
    Ok(exit_code_for(last.as_ref()))
}

fn cmd_run(args: &RunArgs, events: bool) -> Result<i32> {
    let (cfg, request) = prepare(args)?;
    let summary = collect_run(start_run(pipeline(&cfg, &request.repo)?, request)?);
    let code = summary_exit_code(&summary);
    let summary = if events {
        summary
    } else {
        summary.without_events()
    };
    print_json(&summary)?;
    Ok(code)
}

fn cmd_scan(
    repo: &Path,
    allow: Vec<String>,
    max_map: Option<usize>,
    config: Option<&Path>,
) -> Result<i32> {
    let cfg = load_config(&config_path(repo, config))?;
    ensure_repo_dir(repo)?;
    let patterns = if allow.is_empty() { cfg.allow } else { allow };
    let include = AllowList::new(&patterns)?;
    let files = scan(repo, max_map.unwrap_or(cfg.max_map), &include)?;
    print_json(&files)?;
    Ok(exit_codes::OK)
}

fn cmd_check_diff(diff: &Path, allow: Vec<String>) -> Result<i32> {
    let text = if diff == Path::new("-") {
        let mut buf = String::new();
        io::stdin()
            .read_to_string(&mut buf)
            .context("read diff from stdin")?;
        buf
    } else {
        fs::read_to_string(diff).with_context(|| format!("read {}", diff.display()))?
    };
    let patterns = if allow.is_empty() {
        PatchloopConfig::default().allow
    } else {
        allow
    };
    let validation = validate_unified_diff(&text, &AllowList::new(&patterns)?);
    print_json(&validation)?;
    Ok(if validation.ok {
        exit_codes::OK
    } else {
        exit_codes::REJECTED
    })
}

fn cmd_init(repo: &Path, force: bool) -> Result<i32> {
    ensure_repo_dir(repo)?;
    let path = repo.join(CONFIG_FILE);
    if path.exists() && !force {
        bail!("{} already exists (use --force to overwrite)", path.display());
    }
    write_config(&path, &PatchloopConfig::default())?;
    println!("{}", path.display());
    Ok(exit_codes::OK)
}

/// Merge config, environment and flags into the run's immutable request.
fn prepare(args: &RunArgs) -> Result<(PatchloopConfig, RunRequest)> {
    let cfg = load_config(&config_path(&args.repo, args.config.as_deref()))?.with_env_overrides();
    let ticket = match (&args.ticket, &args.ticket_file) {
        (Some(ticket), _) => ticket.clone(),
        (None, Some(path)) => {
            fs::read_to_string(path).with_context(|| format!("read ticket {}", path.display()))?
        }
        (None, None) => bail!("one of --ticket or --ticket-file is required"),
    };
    if ticket.trim().is_empty() {
        bail!("ticket is empty");
    }

    let mut models = ModelSet::from(cfg.models.clone());
    for (flag, slot) in [
        (&args.planner, &mut models.planner),
        (&args.coder, &mut models.coder),
        (&args.critic, &mut models.critic),
    ] {
        if let Some(model) = flag {
            slot.clone_from(model);
        }
    }
    let request = RunRequest {
        repo: args.repo.clone(),
        ticket,
        allow: if args.allow.is_empty() {
            cfg.allow.clone()
        } else {
            args.allow.clone()
        },
        models,
        constraints: if args.constraints.is_empty() {
            cfg.constraints.clone()
        } else {
            args.constraints.clone()
        },
        timeout_sec: args.timeout_sec.unwrap_or(cfg.timeout_sec),
        max_map: args.max_map.unwrap_or(cfg.max_map),
    };
    if request.timeout_sec == 0 {
        bail!("--timeout-sec must be > 0");
    }
    if request.max_map == 0 {
        bail!("--max-map must be > 0");
    }
    AllowList::new(&request.allow)?;
    Ok((cfg, request))
}

fn pipeline(cfg: &PatchloopConfig, repo: &Path) -> Result<Pipeline<OllamaBroker>> {
    let broker = OllamaBroker::new(
        &cfg.broker.base_url,
        cfg.broker.request_timeout_secs.map(Duration::from_secs),
    )?;
    let prompts_dir = cfg.prompts_dir.as_ref().map(|dir| repo.join(dir));
    let prompts = Prompts::load(prompts_dir.as_deref())?;
    Ok(Pipeline::new(broker, prompts, cfg.limits))
}

fn exit_code_for(last: Option<&RunEvent>) -> i32 {
    match last {
        Some(RunEvent::Done { ok: true, .. }) => exit_codes::OK,
        Some(RunEvent::Done { ok: false, .. }) => exit_codes::FAILED,
        _ => exit_codes::ERROR,
    }
}

fn summary_exit_code(summary: &RunSummary) -> i32 {
    match (summary.ok, &summary.last_error) {
        (true, _) => exit_codes::OK,
        (false, Some(_)) => exit_codes::ERROR,
        (false, None) => exit_codes::FAILED,
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let payload = serde_json::to_string_pretty(value).context("serialize json")?;
    let stdout = io::stdout();
    let mut out = stdout.lock();
    writeln!(out, "{payload}").context("write stdout")?;
    Ok(())
}

//! Sentinel CLI entry point.
//!
//! Provides `certify`, `monitor`, `identity`, `ledger` and `check`
//! subcommands over the certification core.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use sentinel::chamber::{self, direct::DirectContainment, HealthStatus};
use sentinel::config::Config;
use sentinel::identity::{sovereign_id, SovereignId};
use sentinel::ledger::Ledger;
use sentinel::logging::{self, LoggingGuard};
use sentinel::metrics::TraitVector;
use sentinel::narrator::TraitNarrator;
use sentinel::sentinel::{ChamberRunner, Ejection, Sentinel, Verdict};
use sentinel::unit::Unit;

/// Sentinel: certify untrusted programs and keep a ledger of the survivors.
#[derive(Parser)]
#[command(name = "sentinel", version, about)]
struct Cli {
    /// Config file (default: `$SENTINEL_CONFIG_PATH` or `./sentinel.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run a unit against its inputs and record it on success.
    Certify {
        /// Unit file (TOML).
        unit: PathBuf,
    },
    /// Check measured traits of a certified unit; eject it on violation.
    Monitor {
        /// Sovereign identifier of the unit.
        id: String,
        /// Measured trait, as `name=value`. Repeatable.
        #[arg(long = "trait", value_name = "NAME=VALUE", value_parser = parse_trait)]
        traits: Vec<(String, f64)>,
    },
    /// Print the sovereign identifier of a unit.
    Identity {
        /// Unit file (TOML).
        unit: PathBuf,
    },
    /// Inspect or roll back the ledger.
    Ledger {
        /// Ledger action.
        #[command(subcommand)]
        action: LedgerAction,
    },
    /// Report the containment backend and its health.
    Check,
}

/// Ledger subcommands.
#[derive(Clone, Copy, Subcommand)]
enum LedgerAction {
    /// Print the current version and its identifiers.
    Show,
    /// List every version, oldest first.
    Versions,
    /// Repoint to the previous version in the lineage.
    Rollback,
}

fn parse_trait(raw: &str) -> Result<(String, f64), String> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected NAME=VALUE, got '{raw}'"))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("missing trait name in '{raw}'"));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid value for trait '{name}': {e}"))?;
    Ok((name.to_owned(), value))
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let config_path = cli.config.as_deref();

    match cli.command {
        Command::Certify { unit } => handle_certify(config_path, &unit).await,
        Command::Monitor { id, traits } => handle_monitor(config_path, &id, traits),
        Command::Identity { unit } => handle_identity(&unit),
        Command::Ledger { action } => handle_ledger(config_path, action),
        Command::Check => handle_check(config_path).await,
    }
}

/// Audit logging for ledger-mutating commands, console-only as a fallback.
fn init_audit_logging() -> Option<LoggingGuard> {
    let guard = logging::default_logs_dir().and_then(|dir| logging::init_audit(&dir));
    match guard {
        Ok(guard) => Some(guard),
        Err(e) => {
            logging::init_cli();
            warn!(error = %e, "file logging unavailable, logging to stderr only");
            None
        }
    }
}

fn open_ledger(config: &Config) -> anyhow::Result<Ledger> {
    Ledger::open(&config.ledger.dir, &config.ledger.pointer)
        .with_context(|| format!("failed to open ledger at {}", config.ledger.dir.display()))
}

async fn handle_certify(config_path: Option<&Path>, unit_path: &Path) -> anyhow::Result<ExitCode> {
    let _logging_guard = init_audit_logging();
    let config = Config::load(config_path)?;
    let unit = Unit::load(unit_path)?;

    let containment = chamber::select_containment(config.chamber.backend, &config.chamber.cgroup_root)
        .context("failed to select containment backend")?;
    let runner = Arc::new(ChamberRunner::new(containment, config.chamber.limits()));
    let narrator = Arc::new(config.traits.clone());
    let ledger = open_ledger(&config)?;

    let mut sentinel = Sentinel::new(ledger, runner, narrator.clone(), config.sentinel.clone());
    let record = sentinel
        .certify(&unit, &config.stability.center, &config.stability.envelope)
        .await
        .context("certification aborted")?;

    for (index, (vp, traits)) in record.vp_values.iter().zip(&record.traits).enumerate() {
        println!(
            "input {index}: vp={vp:.4}  {}",
            narrator.explain(traits).join(", ")
        );
    }
    match record.verdict {
        Verdict::Certified => {
            println!("certified {}", record.identifier);
            if !record.newly_recorded {
                println!("(already in ledger)");
            }
            Ok(ExitCode::SUCCESS)
        }
        Verdict::Rejected => {
            println!("rejected {}", record.identifier);
            Ok(ExitCode::FAILURE)
        }
    }
}

fn handle_monitor(
    config_path: Option<&Path>,
    raw_id: &str,
    traits: Vec<(String, f64)>,
) -> anyhow::Result<ExitCode> {
    let _logging_guard = init_audit_logging();
    let config = Config::load(config_path)?;
    let id = SovereignId::parse(raw_id)?;
    let traits: TraitVector = traits.into_iter().collect();

    // Monitoring never runs a chamber; the direct backend skips backend detection.
    let runner = Arc::new(ChamberRunner::new(
        Arc::new(DirectContainment),
        config.chamber.limits(),
    ));
    let ledger = open_ledger(&config)?;
    let mut sentinel = Sentinel::new(
        ledger,
        runner,
        Arc::new(config.traits.clone()),
        config.sentinel.clone(),
    );

    let verdict = sentinel.monitor(&traits, &config.stability.center, &config.stability.envelope);
    if !verdict.violation {
        println!("ok vp={:.4}", verdict.vp);
        return Ok(ExitCode::SUCCESS);
    }

    println!("violation vp={:.4}", verdict.vp);
    match sentinel.handle_violation(&id).context("ejection failed")? {
        Ejection::NotPresent => println!("{id} is not in the ledger"),
        Ejection::RolledBack { version } => println!("ejected {id}, rolled back to {version}"),
        Ejection::Retracted { version } => println!("ejected {id}, new version {version}"),
    }
    Ok(ExitCode::FAILURE)
}

fn handle_identity(unit_path: &Path) -> anyhow::Result<ExitCode> {
    logging::init_cli();
    let unit = Unit::load(unit_path)?;
    let id = sovereign_id(&unit.definition())?;
    println!("{id}");
    Ok(ExitCode::SUCCESS)
}

fn handle_ledger(config_path: Option<&Path>, action: LedgerAction) -> anyhow::Result<ExitCode> {
    let _logging_guard = match action {
        LedgerAction::Rollback => init_audit_logging(),
        LedgerAction::Show | LedgerAction::Versions => {
            logging::init_cli();
            None
        }
    };
    let config = Config::load(config_path)?;
    let mut ledger = open_ledger(&config)?;

    match action {
        LedgerAction::Show => {
            println!(
                "version: {}",
                ledger.current_version().unwrap_or("(none)")
            );
            for id in ledger.identifiers() {
                println!("{id}");
            }
            for id in ledger.ejected() {
                println!("ejected: {id}");
            }
        }
        LedgerAction::Versions => {
            let current = ledger.current_version();
            for name in ledger.versions()? {
                let marker = if Some(name.as_str()) == current { "*" } else { " " };
                println!("{marker} {name}");
            }
        }
        LedgerAction::Rollback => {
            if ledger.rollback()? {
                println!(
                    "rolled back to {}",
                    ledger.current_version().unwrap_or("(none)")
                );
            } else {
                println!("nothing to roll back");
                return Ok(ExitCode::FAILURE);
            }
        }
    }
    Ok(ExitCode::SUCCESS)
}

async fn handle_check(config_path: Option<&Path>) -> anyhow::Result<ExitCode> {
    logging::init_cli();
    let config = Config::load(config_path)?;
    let containment =
        chamber::select_containment(config.chamber.backend, &config.chamber.cgroup_root)?;
    let limits = config.chamber.limits();
    info!(
        timeout_secs = limits.timeout.as_secs(),
        memory_bytes = limits.memory_bytes,
        cpu_secs = limits.cpu_time.as_secs(),
        "chamber limits"
    );

    match containment.health_check().await {
        HealthStatus::Healthy { kind, details } => {
            println!("{kind}: healthy ({details})");
            Ok(ExitCode::SUCCESS)
        }
        HealthStatus::Degraded { kind, details } => {
            println!("{kind}: degraded ({details})");
            Ok(ExitCode::SUCCESS)
        }
        HealthStatus::Unavailable { kind, details } => {
            println!("{kind}: unavailable ({details})");
            Ok(ExitCode::FAILURE)
        }
    }
}

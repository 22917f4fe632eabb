//! Plan execution engine for an external coding agent.
//!
//! Walks the roadmap in `.planning/`, runs the agent once per plan attempt and
//! keeps the ledger, retry state and iteration logs consistent between runs.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use conductor::core::recovery::RetryBook;
use conductor::error::EngineError;
use conductor::execute::Engine;
use conductor::exit_codes;
use conductor::io::agent::CliAgent;
use conductor::io::config::load_config;
use conductor::io::guards::ShellGateRunner;
use conductor::io::ledger::Ledger;
use conductor::io::paths::LedgerPaths;
use conductor::logging;
use conductor::looping::{LoopStop, run_loop};
use conductor::select::{SelectOutcome, select_from_root};
use conductor::validate::{heal_ledger, validate_ledger};

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Drive a coding agent through a roadmap of plans"
)]
struct Cli {
    /// Workspace containing `.planning/`.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the scheduling loop until the roadmap completes or the budget runs out.
    Run {
        /// Override `max_iterations` from `.planning/config.toml`.
        #[arg(long)]
        max_iterations: Option<u32>,
    },
    /// Print the id of the next plan to execute.
    Next,
    /// Validate every ledger record against its schema and invariants.
    Validate {
        /// Ask the repair agent to fix invalid records.
        #[arg(long)]
        heal: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(match cli.command {
        Command::Run { .. } => "warn,conductor=info",
        Command::Next | Command::Validate { .. } => "warn",
    });
    let code = match run(cli) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            exit_codes::ERROR
        }
    };
    std::process::exit(code);
}

fn run(cli: Cli) -> Result<i32> {
    match cli.command {
        Command::Run { max_iterations } => cmd_run(cli.root, max_iterations),
        Command::Next => cmd_next(cli.root),
        Command::Validate { heal } => cmd_validate(cli.root, heal),
    }
}

fn cmd_run(root: PathBuf, max_iterations: Option<u32>) -> Result<i32> {
    let paths = LedgerPaths::new(&root);
    let mut config = load_config(&paths.config())?;
    if let Some(max) = max_iterations {
        config.max_iterations = max;
        config.validate().context("invalid --max-iterations")?;
    }
    let agent = CliAgent::new(&config.agent);
    let gate = ShellGateRunner;
    let engine = Engine::new(&root, config, &agent, &gate);

    let outcome = run_loop(&engine, RetryBook::default(), |report| {
        println!(
            "iter {}: {} {} (attempts {})",
            report.iter, report.plan, report.outcome, report.attempts
        );
    });
    match outcome {
        Ok(outcome) => match outcome.stop {
            LoopStop::Complete => {
                println!("roadmap complete after {} iteration(s)", outcome.steps_executed);
                Ok(exit_codes::OK)
            }
            LoopStop::MaxIterationsExceeded { max_iterations } => {
                println!(
                    "stopped after {max_iterations} iteration(s) with work remaining; run again to resume"
                );
                Ok(exit_codes::BUDGET_EXHAUSTED)
            }
        },
        Err(err) => Ok(report_engine_error(&err)),
    }
}

fn report_engine_error(err: &EngineError) -> i32 {
    eprintln!("{err:#}");
    match err {
        EngineError::HardFailure { .. }
        | EngineError::RetriesExhausted { .. }
        | EngineError::ManualPlanIncomplete { .. }
        | EngineError::PlanFailed { .. } => exit_codes::HARD_FAILURE,
        EngineError::HealExhausted { .. } | EngineError::Other(_) => exit_codes::ERROR,
    }
}

fn cmd_next(root: PathBuf) -> Result<i32> {
    Ok(match select_from_root(&root)? {
        SelectOutcome::Next(id) => {
            println!("{id}");
            exit_codes::OK
        }
        SelectOutcome::Complete => {
            println!("complete");
            exit_codes::COMPLETE
        }
        SelectOutcome::Failed(id) => {
            eprintln!("plan {id} is marked failed");
            exit_codes::HARD_FAILURE
        }
    })
}

fn cmd_validate(root: PathBuf, heal: bool) -> Result<i32> {
    let paths = LedgerPaths::new(&root);
    if heal {
        let config = load_config(&paths.config())?;
        let agent = CliAgent::new(&config.agent);
        let gate = ShellGateRunner;
        let engine = Engine::new(&root, config, &agent, &gate);
        return Ok(match heal_ledger(&engine) {
            Ok(healed) => {
                for record in &healed {
                    println!(
                        "repaired {} in {} attempt(s)",
                        record.path.display(),
                        record.attempts
                    );
                }
                exit_codes::OK
            }
            Err(err) => report_engine_error(&err),
        });
    }

    let invalid = validate_ledger(&Ledger::new(paths))?;
    if invalid.is_empty() {
        println!("ledger is valid");
        return Ok(exit_codes::OK);
    }
    for record in &invalid {
        eprintln!("{}: {}", record.path.display(), record.report);
    }
    Ok(exit_codes::ERROR)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_overrides() {
        let cli = Cli::parse_from(["conductor", "run", "--root", "/work", "--max-iterations", "3"]);
        assert_eq!(cli.root, PathBuf::from("/work"));
        assert!(matches!(
            cli.command,
            Command::Run {
                max_iterations: Some(3)
            }
        ));
    }

    #[test]
    fn parse_validate_heal() {
        let cli = Cli::parse_from(["conductor", "validate", "--heal"]);
        assert_eq!(cli.root, PathBuf::from("."));
        assert!(matches!(cli.command, Command::Validate { heal: true }));
    }

    #[test]
    fn parse_next() {
        let cli = Cli::parse_from(["conductor", "next"]);
        assert!(matches!(cli.command, Command::Next));
    }
}

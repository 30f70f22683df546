//! CLI entrypoint for the fastlocal verification harness.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use fastlocal_harness::structured_log::validate_log_file;
use fastlocal_harness::{LogEmitter, Scenario, ScenarioConfig, ThreadMode, run_scenarios};

/// Verification tooling for fastlocal.
#[derive(Debug, Parser)]
#[command(name = "fastlocal-harness")]
#[command(about = "Invariant scenarios for indexed thread-local storage")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run invariant scenarios and write a JSONL log.
    Run {
        /// Scenario to run (repeatable). Runs all scenarios if omitted.
        #[arg(long = "scenario", value_enum)]
        scenarios: Vec<Scenario>,
        /// Thread flavor to run on.
        #[arg(long, value_enum, default_value = "both")]
        mode: ThreadMode,
        /// Threads for multi-threaded scenarios.
        #[arg(long, default_value_t = 8)]
        threads: usize,
        /// Loop repetitions inside each scenario.
        #[arg(long, default_value_t = 200)]
        iterations: usize,
        /// Variables constructed by the allocation-order scenario.
        #[arg(long, default_value_t = 10_000)]
        variables: usize,
        /// JSONL log output path.
        #[arg(long, default_value = "fastlocal-harness.log.jsonl")]
        log: PathBuf,
        /// Optional JSON summary output path.
        #[arg(long)]
        summary: Option<PathBuf>,
        /// Run identifier used in trace ids.
        #[arg(long, default_value = "local")]
        run_id: String,
    },
    /// Validate a structured JSONL log file.
    ValidateLog {
        /// Path to the JSONL log.
        #[arg(long)]
        input: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Command::Run {
            scenarios,
            mode,
            threads,
            iterations,
            variables,
            log,
            summary,
            run_id,
        } => {
            let scenarios = if scenarios.is_empty() {
                Scenario::ALL.to_vec()
            } else {
                scenarios
            };
            let config = ScenarioConfig {
                threads,
                iterations,
                variables,
            };
            let mut emitter = LogEmitter::to_file(&log, &run_id)?;
            let result = run_scenarios(&scenarios, mode, config, &mut emitter)?;

            for report in &result.reports {
                eprintln!(
                    "{:<20} {:<8} {:?} ({} checks, {} ms){}",
                    report.scenario.name(),
                    report.mode.as_str(),
                    report.outcome,
                    report.checks,
                    report.duration_ms,
                    report
                        .failure
                        .as_deref()
                        .map(|f| format!(": {f}"))
                        .unwrap_or_default(),
                );
            }
            eprintln!(
                "{} passed, {} failed; log at {}",
                result.passed,
                result.failed,
                log.display()
            );

            if let Some(path) = summary {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                eprintln!("Summary written to {}", path.display());
            }
            if !result.all_passed() {
                return Err(format!("{} scenario run(s) failed", result.failed).into());
            }
        }
        Command::ValidateLog { input } => {
            let (lines, errors) = validate_log_file(&input)?;
            for error in &errors {
                eprintln!("{error}");
            }
            if !errors.is_empty() {
                return Err(format!(
                    "{} validation error(s) in {} line(s) of {}",
                    errors.len(),
                    lines,
                    input.display()
                )
                .into());
            }
            eprintln!("{}: {lines} line(s) valid", input.display());
        }
    }

    Ok(())
}

// SPDX-License-Identifier: AGPL-3.0

//! evmsym - symbolic EVM scenario runner

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use evmsym_config::{Config, ConfigArgs, SolverBackend};
use evmsym_sevm::Driver;
use evmsym_solver::{PropagationSolver, SmtLibSolver, Solver};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

mod report;
mod scenario;

use report::PathReport;
use scenario::Scenario;

#[derive(Debug, Parser)]
#[command(name = "evmsym", version, about = "Symbolic EVM scenario runner")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the transaction of a JSON scenario and print the outcome as JSON
    Run(RunArgs),
}

#[derive(Debug, Args)]
struct RunArgs {
    /// Scenario file
    scenario: PathBuf,

    /// Fork on every candidate value instead of following one path
    #[arg(long)]
    explore: bool,

    #[command(flatten)]
    config: ConfigArgs,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match dispatch(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            evmsym_logs::error(&format!("Error: {:#}", err));
            ExitCode::FAILURE
        }
    }
}

fn dispatch(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run(args) => {
            let config = args.config.resolve()?;
            evmsym_logs::init_tracing(config.verbose);
            let scenario = Scenario::load(&args.scenario)?;
            let output = run(&scenario, config, args.explore)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&output).context("Failed to render output")?
            );
        }
    }
    Ok(())
}

/// Pick the configured oracle and execute the scenario with it
fn run(scenario: &Scenario, config: Config, explore: bool) -> Result<Value> {
    match config.solver.backend {
        SolverBackend::Propagation => execute(scenario, config, PropagationSolver::new(), explore),
        SolverBackend::Smtlib => {
            let mut solver =
                SmtLibSolver::new(config.solver.command.clone(), config.solver.timeout());
            if let Some(dir) = &config.solver.dump_dir {
                solver = solver.with_dump_dir(dir.clone());
            }
            execute(scenario, config, solver, explore)
        }
    }
}

fn execute<S: Solver>(scenario: &Scenario, config: Config, solver: S, explore: bool) -> Result<Value> {
    info!(fork = %config.fork, oog = %config.oog, "running scenario");
    let (world, constraints) = scenario.prepare(config)?;
    let mut driver = Driver::new(world, constraints, solver);

    if explore {
        let paths = driver.explore()?;
        info!(paths = paths.len(), "explored");
        let reports: Vec<PathReport> = paths
            .iter()
            .map(|path| {
                PathReport::build(driver.solver(), &path.constraints, &path.world, &path.result)
            })
            .collect();
        return Ok(serde_json::to_value(reports)?);
    }

    let result = driver.run()?;
    let report = PathReport::build(driver.solver(), &driver.constraints, &driver.world, &result);
    Ok(serde_json::to_value(report)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use evmsym_config::{Fork, OogPolicy};
    use pretty_assertions::assert_eq;

    fn frontier() -> Config {
        Config::new(Fork::Frontier, OogPolicy::Pedantic)
    }

    fn field<'a>(value: &'a Value, path: &[&str]) -> &'a Value {
        path.iter().fold(value, |v, key| &v[*key])
    }

    #[test]
    fn test_return0_scenario() {
        let scenario = Scenario::from_json_str(include_str!("../scenarios/return0.json")).unwrap();
        let output = run(&scenario, frontier(), false).unwrap();
        assert_eq!(output["outcome"], "RETURN");
        assert_eq!(output["return_data"], "0x37");
        assert_eq!(output["gas_left"], format!("0x{:x}", 79973));
        assert_eq!(
            output["logs_digest"],
            "0x1dcc4de8dec75d7aab85b567b6ccd41ad312451b948a7413f0a142fd40d49347"
        );
        let storage = field(
            &output,
            &["accounts", "0xcd1722f3947def4cf144679da39c4c32bdc35681", "storage"],
        );
        assert_eq!(storage["0x0"], format!("0x37{}", "0".repeat(62)));
    }

    #[test]
    fn test_suicide0_scenario() {
        let scenario = Scenario::from_json_str(include_str!("../scenarios/suicide0.json")).unwrap();
        let output = run(&scenario, frontier(), false).unwrap();
        assert_eq!(output["outcome"], "SELFDESTRUCT");
        assert_eq!(output["gas_left"], format!("0x{:x}", 998));
        let accounts = output["accounts"].as_object().unwrap();
        assert!(!accounts.contains_key("0x0f572e5295c57f15886f9b263e2f6d2d6c7b5ec6"));
        assert_eq!(
            accounts["0xcd1722f3947def4cf144679da39c4c32bdc35681"]["balance"],
            "0x152d02c7e14af6800017"
        );
    }

    #[test]
    fn test_transfer_scenario_settles_fees() {
        let scenario = Scenario::from_json_str(include_str!("../scenarios/transfer.json")).unwrap();
        let output = run(&scenario, Config::default(), false).unwrap();
        assert_eq!(output["outcome"], "STOP");
        assert_eq!(output["gas_used"], format!("0x{:x}", 21000));
        let accounts = &output["accounts"];
        assert_eq!(
            accounts["0x0000000000000000000000000000000000001000"]["balance"],
            format!("0x{:x}", 1_000_000 - 5 - 21000 * 2)
        );
        assert_eq!(
            accounts["0x0000000000000000000000000000000000002000"]["balance"],
            "0x5"
        );
    }

    #[test]
    fn test_explore_follows_pinned_branch() {
        let scenario = Scenario::from_json_str(include_str!("../scenarios/branch.json")).unwrap();
        let output = run(&scenario, Config::default(), true).unwrap();
        let outcomes: Vec<&str> = output
            .as_array()
            .unwrap()
            .iter()
            .map(|path| path["outcome"].as_str().unwrap())
            .collect();
        assert_eq!(outcomes, vec!["STOP"]);
    }
}

//! pg_relocate CLI
//!
//! ```text
//! pg_relocate [--env <name>] [--json] <command> [options]
//!
//!   exists | create | destroy | start | stop | status
//!   transfer [--simulate-crash]
//!   in-doubt
//!   resolve [--commit | --rollback]
//! ```

use anyhow::Context;
use clap::Parser;
use std::process::ExitCode;

use pg_relocate::{AppConfig, Cli, Dispatcher, Report};

fn print_report(report: &Report, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{}", report);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();
    let command = cli.command;

    let config = AppConfig::load(&cli.env)
        .with_context(|| format!("loading configuration for env {:?}", cli.env))?;
    let _log_guard = pg_relocate::logging::init_logging(&config);

    tracing::info!(env = %cli.env, command = %command, "Starting pg_relocate");

    let dispatcher = Dispatcher::from_config(config)?;
    match dispatcher.dispatch(command).await {
        Ok(report) => {
            print_report(&report, cli.json)?;
            Ok(if report.all_ok() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        Err(e) => {
            if e.is_divergence() {
                tracing::error!(code = e.code(), error = %e, "Relocation diverged");
                eprintln!("PARTIAL COMMIT - run `pg_relocate in-doubt` and resolve manually");
            }
            Err(anyhow::Error::new(e).context(format!("{} failed", command)))
        }
    }
}

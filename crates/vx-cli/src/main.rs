#![deny(clippy::all)]

use std::env;
use std::process::ExitCode;

use clap::Parser;
use color_eyre::Result;
use vx_core::{classify, Config};

mod cli;
mod dispatch;
mod output;

use cli::VxCli;
use dispatch::dispatch_command;
use output::emit_outcome;

fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    let cli = VxCli::parse();
    init_tracing(cli.verbose, cli.quiet);
    apply_env_overrides(&cli);

    let config = Config::from_env();
    match dispatch_command(&config, &cli) {
        Ok(outcome) => {
            emit_outcome(&cli, &outcome);
            Ok(ExitCode::SUCCESS)
        }
        Err(err) => {
            let kind = classify(&err);
            if cli.json {
                let body = vx_core::error_response(&err);
                println!("{}", serde_json::to_string_pretty(&body).unwrap_or_default());
            }
            eprintln!("[{}] {err:#}", kind.token());
            Ok(ExitCode::from(kind.exit_code() as u8))
        }
    }
}

fn init_tracing(verbose: u8, quiet: bool) {
    let level = if quiet {
        "warn"
    } else {
        match verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    let filter = format!("vx={level},vx_cli={level},vx_core={level},vx_domain={level}");
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_level(true)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);
}

fn apply_env_overrides(cli: &VxCli) {
    if cli.offline {
        env::set_var("OFFLINE", "1");
    }
}

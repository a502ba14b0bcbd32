// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! spacey-pack - Load, inspect and bundle module graphs
//!
//! This is the main entry point for the spacey-pack binary.
//!
//! ## Features
//!
//! - Import an entry module and print its exports
//! - Bundle a module graph into one file and load it back without fetching
//! - Interactive loader shell with history

mod cli;
mod commands;
mod repl;

use clap::Parser;
use owo_colors::OwoColorize;
use std::process::ExitCode;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use cli::{Cli, Commands};

/// Main entry point - uses tokio runtime for async operations.
#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match commands::load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {}", "Error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(cli.verbose, &config.loglevel);

    let result = match &cli.command {
        Some(Commands::Run(args)) => commands::run(args, &cli).await,
        Some(Commands::Build(args)) => commands::build(args, &cli).await,
        Some(Commands::Graph(args)) => commands::graph(args, &cli).await,
        Some(Commands::Load(args)) => commands::load(args, &cli).await,
        Some(Commands::Shell) | None => run_shell(config).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            // Loader errors already carry their import chain in the message
            eprintln!("{}: {}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool, loglevel: &str) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(loglevel))
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

/// Start the interactive shell on a blocking thread so it can drive the runtime
async fn run_shell(config: spacey_loader::LoaderConfig) -> anyhow::Result<()> {
    let handle = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        let mut shell = repl::Repl::new(config, handle)?;
        shell.run()
    })
    .await?
}

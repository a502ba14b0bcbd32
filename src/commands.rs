// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Subcommand implementations

use anyhow::{Context, Result};
use owo_colors::OwoColorize;
use spacey_loader::plugins::base::{is_relative, is_url};
use spacey_loader::{Exports, Loader, LoaderConfig, Record};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

use crate::cli::{BuildArgs, Cli, EntryArgs, GraphArgs, LoadArgs};

/// Loader configuration from the config file, the environment and the flags
pub fn load_config(cli: &Cli) -> Result<LoaderConfig> {
    let mut config = LoaderConfig::load(cli.config.as_deref())?;
    if let Some(base_url) = &cli.base_url {
        config.base_url = Some(base_url.clone());
    }
    if let Some(workers) = cli.workers {
        config.worker_threads = workers;
    }
    Ok(config)
}

/// Turn a command-line entry into a specifier
///
/// Existing local files are made explicitly relative so they are not
/// mistaken for package names.
pub fn entry_specifier(entry: &str) -> String {
    if is_url(entry) || is_relative(entry) {
        entry.to_string()
    } else if Path::new(entry).exists() {
        format!("./{}", entry)
    } else {
        entry.to_string()
    }
}

/// Exports as indented JSON
pub fn format_exports(exports: &Exports) -> String {
    let value = exports.snapshot();
    serde_json::to_string_pretty(&value).unwrap_or_else(|_| value.to_string())
}

/// Print the import tree below `record`
pub fn print_tree(record: &Arc<Record>, label: &str, depth: usize, seen: &mut HashSet<u64>) {
    let indent = "  ".repeat(depth);
    let format = record.format().unwrap_or_default();

    if !seen.insert(record.id()) {
        println!(
            "{}{} {} {}",
            indent,
            label.cyan(),
            record.key().dimmed(),
            "(cycle or shared)".yellow()
        );
        return;
    }

    println!(
        "{}{} {} [{}]",
        indent,
        label.cyan(),
        record.key(),
        format.magenta()
    );
    for (specifier, dependency) in record.import_table() {
        print_tree(&dependency, &specifier, depth + 1, seen);
    }
}

/// Print one line per record
pub fn print_records(records: &[Arc<Record>]) {
    for record in records {
        println!(
            "{:8} {} ({} imports)",
            record.format().unwrap_or_default().magenta(),
            record.key(),
            record.import_list().len()
        );
    }
}

pub async fn run(args: &EntryArgs, cli: &Cli) -> Result<()> {
    let loader = Loader::new(load_config(cli)?)?;
    let exports = loader.import(&entry_specifier(&args.entry), None).await?;
    println!("{}", format_exports(&exports));
    Ok(())
}

pub async fn build(args: &BuildArgs, cli: &Cli) -> Result<()> {
    let loader = Loader::new(load_config(cli)?)?;
    let text = loader.build(&entry_specifier(&args.entry), None).await?;
    debug!("Bundle text is {} bytes", text.len());

    match &args.output {
        Some(path) => {
            tokio::fs::write(path, &text)
                .await
                .with_context(|| format!("failed to write {}", path.display()))?;
            eprintln!(
                "{} {} records into {}",
                "Bundled".green().bold(),
                loader.records().len(),
                path.display().cyan()
            );
        }
        None => println!("{}", text),
    }
    Ok(())
}

pub async fn graph(args: &GraphArgs, cli: &Cli) -> Result<()> {
    let loader = Loader::new(load_config(cli)?)?;
    let specifier = entry_specifier(&args.entry);
    let root = loader.discover(&specifier, None).await?;

    if args.flat {
        print_records(&loader.records());
    } else {
        print_tree(&root, &specifier, 0, &mut HashSet::new());
    }
    Ok(())
}

pub async fn load(args: &LoadArgs, cli: &Cli) -> Result<()> {
    let text = tokio::fs::read_to_string(&args.bundle)
        .await
        .with_context(|| format!("failed to read {}", args.bundle.display()))?;
    debug!("Read bundle {}", args.bundle.display());

    let loader = Loader::new(load_config(cli)?)?;
    let (packages, entry) = loader.built_text(&text)?;
    eprintln!(
        "{} {} packages, {} records",
        "Registered".green().bold(),
        packages.len(),
        loader.records().len()
    );

    if let Some(entry) = entry {
        let exports = loader.import_record(&entry).await?;
        println!("{}", format_exports(&exports));
    }
    Ok(())
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! CLI argument parsing for spacey-pack.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

/// spacey-pack - Load, inspect and bundle module graphs
#[derive(Parser, Debug)]
#[command(name = "spacey-pack")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Configuration file (defaults to ./spacey-loader.toml when present)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Address top-level entries are resolved against
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    /// Worker threads for offloaded translation
    #[arg(long, global = true)]
    pub workers: Option<usize>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Import an entry module and print its exports
    #[command(alias = "r")]
    Run(EntryArgs),

    /// Write a bundle of an entry module and its dependencies
    #[command(alias = "b")]
    Build(BuildArgs),

    /// Print the dependency graph of an entry module
    #[command(alias = "g")]
    Graph(GraphArgs),

    /// Register a bundle and import its entry without fetching
    Load(LoadArgs),

    /// Start the interactive loader shell
    #[command(alias = "sh")]
    Shell,
}

#[derive(Args, Debug, Clone)]
pub struct EntryArgs {
    /// Entry specifier (path, URL or package name)
    pub entry: String,
}

#[derive(Args, Debug, Clone)]
pub struct BuildArgs {
    /// Entry specifier (path, URL or package name)
    pub entry: String,

    /// Output file (stdout when omitted)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

#[derive(Args, Debug, Clone)]
pub struct GraphArgs {
    /// Entry specifier (path, URL or package name)
    pub entry: String,

    /// Print one record per line instead of a tree
    #[arg(long)]
    pub flat: bool,
}

#[derive(Args, Debug, Clone)]
pub struct LoadArgs {
    /// Bundle file written by `build`
    pub bundle: PathBuf,
}

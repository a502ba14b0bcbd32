// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Interactive shell around one loader.
//!
//! Plain input is imported as a specifier; dot commands inspect the loader.

use owo_colors::OwoColorize;
use rustyline::completion::{Completer, Pair};
use rustyline::error::ReadlineError;
use rustyline::highlight::Highlighter;
use rustyline::hint::Hinter;
use rustyline::history::DefaultHistory;
use rustyline::validate::Validator;
use rustyline::{Config, Editor, Helper};
use spacey_loader::{Loader, LoaderConfig, LoaderError};
use std::borrow::Cow;
use std::collections::HashSet;
use std::path::PathBuf;
use tokio::runtime::Handle;

use crate::commands::{entry_specifier, format_exports, print_records, print_tree};

/// Shell configuration constants
const HISTORY_FILE: &str = ".spacey_pack_history";
const MAX_HISTORY_SIZE: usize = 1000;

/// Shell commands that can be executed with a dot prefix
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplCommand {
    Help,
    Exit,
    Clear,
    Version,
    Import,
    Resolve,
    Graph,
    Records,
    Build,
    Load,
    Config,
    Set,
}

impl ReplCommand {
    /// Parse a shell command from input string
    pub fn parse(input: &str) -> Option<(Self, Option<&str>)> {
        let input = input.trim();
        let rest = input.strip_prefix('.')?;

        let mut parts = rest.splitn(2, char::is_whitespace);
        let cmd = parts.next()?.to_lowercase();
        let arg = parts.next().map(str::trim).filter(|arg| !arg.is_empty());

        let cmd = match cmd.as_str() {
            "help" | "h" | "?" => ReplCommand::Help,
            "exit" | "quit" | "q" => ReplCommand::Exit,
            "clear" | "cls" => ReplCommand::Clear,
            "version" | "v" => ReplCommand::Version,
            "import" | "i" => ReplCommand::Import,
            "resolve" | "r" => ReplCommand::Resolve,
            "graph" | "g" => ReplCommand::Graph,
            "records" | "ls" => ReplCommand::Records,
            "build" | "b" => ReplCommand::Build,
            "load" | "l" => ReplCommand::Load,
            "config" => ReplCommand::Config,
            "set" => ReplCommand::Set,
            _ => return None,
        };
        Some((cmd, arg))
    }

    /// Get all available commands for help/completion
    pub fn all_commands() -> &'static [(&'static str, &'static str)] {
        &[
            (".help", "Show this help message"),
            (".exit", "Exit the shell"),
            (".clear", "Clear the screen"),
            (".version", "Show version information"),
            (".import <spec>", "Import a module and print its exports"),
            (".resolve <spec>", "Resolve a specifier to an address"),
            (".graph <spec>", "Discover a module and print its import tree"),
            (".records", "List every record the loader knows"),
            (".build <spec> [file]", "Bundle a module graph"),
            (".load <file>", "Register a bundle and import its entry"),
            (".config [key]", "Show configuration values"),
            (".set <key> <value>", "Change a setting and start a fresh loader"),
        ]
    }
}

/// Helper struct for rustyline that provides completion and hints
struct ShellHelper {
    commands: Vec<String>,
}

impl ShellHelper {
    fn new() -> Self {
        let commands = ReplCommand::all_commands()
            .iter()
            .filter_map(|(usage, _)| usage.split_whitespace().next())
            .map(String::from)
            .collect();
        Self { commands }
    }
}

impl Completer for ShellHelper {
    type Candidate = Pair;

    fn complete(
        &self,
        line: &str,
        pos: usize,
        _ctx: &rustyline::Context<'_>,
    ) -> rustyline::Result<(usize, Vec<Pair>)> {
        let word = &line[..pos];
        if !word.starts_with('.') || word.contains(char::is_whitespace) {
            return Ok((pos, vec![]));
        }

        let matches = self
            .commands
            .iter()
            .filter(|cmd| cmd.starts_with(word))
            .map(|cmd| Pair {
                display: cmd.clone(),
                replacement: cmd[word.len()..].to_string(),
            })
            .collect();

        Ok((pos, matches))
    }
}

impl Hinter for ShellHelper {
    type Hint = String;

    fn hint(&self, line: &str, pos: usize, _ctx: &rustyline::Context<'_>) -> Option<Self::Hint> {
        if pos < line.len() || line.len() < 2 || !line.starts_with('.') {
            return None;
        }

        self.commands
            .iter()
            .find(|cmd| cmd.starts_with(line) && cmd.len() > line.len())
            .map(|cmd| cmd[line.len()..].to_string().dimmed().to_string())
    }
}

impl Highlighter for ShellHelper {
    fn highlight<'l>(&self, line: &'l str, _pos: usize) -> Cow<'l, str> {
        if !line.starts_with('.') {
            return Cow::Borrowed(line);
        }

        match line.split_once(char::is_whitespace) {
            Some((cmd, rest)) => Cow::Owned(format!("{} {}", cmd.magenta(), rest.green())),
            None => Cow::Owned(line.magenta().to_string()),
        }
    }

    fn highlight_char(&self, _line: &str, _pos: usize, _forced: bool) -> bool {
        true
    }
}

impl Validator for ShellHelper {}

impl Helper for ShellHelper {}

/// The interactive loader shell
pub struct Repl {
    config: LoaderConfig,
    loader: Loader,
    runtime: Handle,
    editor: Editor<ShellHelper, DefaultHistory>,
    history_path: PathBuf,
}

impl Repl {
    /// Create a shell driving `runtime` from the current (blocking) thread
    pub fn new(config: LoaderConfig, runtime: Handle) -> anyhow::Result<Self> {
        let editor_config = Config::builder()
            .history_ignore_dups(true)?
            .history_ignore_space(true)
            .max_history_size(MAX_HISTORY_SIZE)?
            .auto_add_history(true)
            .build();

        let mut editor = Editor::with_config(editor_config)?;
        editor.set_helper(Some(ShellHelper::new()));

        let history_path = dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("spacey")
            .join(HISTORY_FILE);

        if let Some(parent) = history_path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let _ = editor.load_history(&history_path);

        let loader = Loader::new(config.clone())?;

        Ok(Self {
            config,
            loader,
            runtime,
            editor,
            history_path,
        })
    }

    /// Run the shell main loop
    pub fn run(&mut self) -> anyhow::Result<()> {
        self.print_banner();

        loop {
            let prompt = format!("{} ", "pack>".bright_green().bold());

            match self.editor.readline(&prompt) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }

                    match ReplCommand::parse(trimmed) {
                        Some((cmd, arg)) => match self.execute_command(cmd, arg) {
                            CommandResult::Continue => continue,
                            CommandResult::Exit => break,
                        },
                        None if trimmed.starts_with('.') => {
                            eprintln!(
                                "{}: unknown command '{}'",
                                "Error".red().bold(),
                                trimmed.cyan()
                            );
                        }
                        None => self.import(trimmed),
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("{}", "^C".dimmed());
                    continue;
                }
                Err(ReadlineError::Eof) => {
                    println!("{}", "^D".dimmed());
                    break;
                }
                Err(err) => {
                    eprintln!("{}: {:?}", "Error".red().bold(), err);
                    break;
                }
            }
        }

        let _ = self.editor.save_history(&self.history_path);
        println!();
        Ok(())
    }

    fn print_banner(&self) {
        println!();
        println!(
            "  {} {} {}",
            "Spacey Pack".white().bold(),
            "v".dimmed(),
            env!("CARGO_PKG_VERSION").bright_yellow()
        );
        println!(
            "  {} {}",
            "Base:".dimmed(),
            self.loader.base_for(None).cyan()
        );
        println!(
            "  {} {} {}",
            "Type a specifier to import it, or".dimmed(),
            ".help".cyan(),
            "for commands".dimmed()
        );
        println!();
    }

    fn execute_command(&mut self, cmd: ReplCommand, arg: Option<&str>) -> CommandResult {
        match (cmd, arg) {
            (ReplCommand::Help, _) => self.print_help(),
            (ReplCommand::Exit, _) => return CommandResult::Exit,
            (ReplCommand::Clear, _) => print!("\x1B[2J\x1B[H"),
            (ReplCommand::Version, _) => {
                println!(
                    "{}: {}",
                    "spacey-pack".bright_cyan().bold(),
                    env!("CARGO_PKG_VERSION").yellow()
                );
                println!("{}: {}", "loader".dimmed(), spacey_loader::VERSION);
            }
            (ReplCommand::Records, _) => print_records(&self.loader.records()),
            (ReplCommand::Config, key) => self.show_config(key),
            (ReplCommand::Import, Some(spec)) => self.import(spec),
            (ReplCommand::Resolve, Some(spec)) => self.resolve(spec),
            (ReplCommand::Graph, Some(spec)) => self.graph(spec),
            (ReplCommand::Build, Some(arg)) => self.build(arg),
            (ReplCommand::Load, Some(path)) => self.load(path),
            (ReplCommand::Set, Some(arg)) => self.set(arg),
            (_, None) => {
                eprintln!(
                    "{}: {} {}",
                    "Error".red().bold(),
                    format!("{:?}", cmd).to_lowercase().cyan(),
                    "requires an argument".dimmed()
                );
            }
        }
        CommandResult::Continue
    }

    fn print_help(&self) {
        println!();
        println!("{}", "Shell Commands:".white().bold());
        println!();
        for (cmd, desc) in ReplCommand::all_commands() {
            println!("  {:24} {}", cmd.cyan(), desc.dimmed());
        }
        println!();
    }

    fn import(&self, spec: &str) {
        let specifier = entry_specifier(spec);
        match self.runtime.block_on(self.loader.import(&specifier, None)) {
            Ok(exports) => println!("{}", format_exports(&exports)),
            Err(e) => print_error(&e),
        }
    }

    fn resolve(&self, spec: &str) {
        match self.runtime.block_on(self.loader.resolve(spec, None)) {
            Ok(address) => println!("{}", address.green()),
            Err(e) => print_error(&e),
        }
    }

    fn graph(&self, spec: &str) {
        let specifier = entry_specifier(spec);
        match self.runtime.block_on(self.loader.discover(&specifier, None)) {
            Ok(root) => print_tree(&root, &specifier, 0, &mut HashSet::new()),
            Err(e) => print_error(&e),
        }
    }

    fn build(&self, arg: &str) {
        let mut parts = arg.split_whitespace();
        let Some(spec) = parts.next() else {
            return;
        };
        let specifier = entry_specifier(spec);

        let text = match self.runtime.block_on(self.loader.build(&specifier, None)) {
            Ok(text) => text,
            Err(e) => return print_error(&e),
        };

        match parts.next() {
            Some(path) => match std::fs::write(path, &text) {
                Ok(()) => println!("{} {}", "Wrote".green().bold(), path.cyan()),
                Err(e) => eprintln!("{}: {}", "Error".red().bold(), e),
            },
            None => println!("{}", text),
        }
    }

    fn load(&self, path: &str) {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) => {
                eprintln!("{}: {}", "Error".red().bold(), e);
                return;
            }
        };

        let entry = match self.loader.built_text(&text) {
            Ok((packages, entry)) => {
                println!(
                    "{} {} packages",
                    "Registered".green().bold(),
                    packages.len()
                );
                entry
            }
            Err(e) => return print_error(&e),
        };

        if let Some(entry) = entry {
            match self.runtime.block_on(self.loader.import_record(&entry)) {
                Ok(exports) => println!("{}", format_exports(&exports)),
                Err(e) => print_error(&e),
            }
        }
    }

    fn show_config(&self, key: Option<&str>) {
        match key {
            Some(key) => match self.config.get(key) {
                Some(value) => println!("{} = {}", key.cyan(), value),
                None => eprintln!("{}: unknown key '{}'", "Error".red().bold(), key),
            },
            None => match config_lines(&self.config) {
                Some(text) => println!("{}", text),
                None => eprintln!("{}: cannot display configuration", "Error".red().bold()),
            },
        }
    }

    fn set(&mut self, arg: &str) {
        let Some((key, value)) = arg.split_once(char::is_whitespace) else {
            eprintln!("{}: usage: .set <key> <value>", "Error".red().bold());
            return;
        };

        let mut config = self.config.clone();
        let result = config
            .set(key, value.trim())
            .and_then(|()| Loader::new(config.clone()));
        match result {
            Ok(loader) => {
                self.config = config;
                self.loader = loader;
                println!("{} {} (fresh loader)", key.cyan(), "updated".green());
            }
            Err(e) => print_error(&e),
        }
    }
}

/// Result of executing a shell command
enum CommandResult {
    Continue,
    Exit,
}

fn config_lines(config: &LoaderConfig) -> Option<String> {
    serde_json::to_value(config)
        .ok()?
        .as_object()
        .map(|map| {
            map.iter()
                .map(|(key, value)| format!("{} = {}", key, value))
                .collect::<Vec<_>>()
                .join("\n")
        })
}

/// Print a loader error, first line highlighted
fn print_error(error: &LoaderError) {
    let message = error.to_string();
    let mut lines = message.lines();
    if let Some(first) = lines.next() {
        eprintln!("{}", first.red().bold());
    }
    for line in lines {
        eprintln!("{}", line.dimmed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repl_command_parse() {
        assert!(matches!(
            ReplCommand::parse(".help"),
            Some((ReplCommand::Help, None))
        ));
        assert!(matches!(
            ReplCommand::parse(".exit"),
            Some((ReplCommand::Exit, None))
        ));
        assert!(matches!(
            ReplCommand::parse(".build ./main.js out.json"),
            Some((ReplCommand::Build, Some("./main.js out.json")))
        ));
        assert!(matches!(
            ReplCommand::parse(".graph   "),
            Some((ReplCommand::Graph, None))
        ));
        assert!(ReplCommand::parse("./main.js").is_none());
        assert!(ReplCommand::parse(".nope").is_none());
    }

    #[test]
    fn test_completion_candidates() {
        let helper = ShellHelper::new();
        assert!(helper.commands.contains(&".build".to_string()));
        assert!(helper.commands.contains(&".set".to_string()));
        assert!(!helper.commands.iter().any(|cmd| cmd.contains('<')));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::warn;

use crate::error::{LoaderError, Result};

/// Default configuration file name
pub const CONFIG_FILE: &str = "spacey-loader.toml";

/// Prefix for configuration environment variables
pub const ENV_PREFIX: &str = "SPACEY_LOADER_";

/// Plain keys accepted by [`LoaderConfig::set`]
const KEYS: &[&str] = &[
    "base-url",
    "extensions",
    "index-files",
    "node-modules",
    "max-format-redirects",
    "worker-threads",
    "default-format",
    "loglevel",
];

/// Configuration for a [`Loader`](crate::Loader).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default, rename_all = "kebab-case")]
pub struct LoaderConfig {
    /// Address used as the parent of top-level imports
    pub base_url: Option<String>,

    /// Extensions probed, in order, for specifiers without one
    pub extensions: Vec<String>,

    /// Whether directories resolve to their `index` file
    pub index_files: bool,

    /// Whether bare specifiers are looked up in `node_modules`
    pub node_modules: bool,

    /// Maximum number of format changes during analyze
    pub max_format_redirects: usize,

    /// Worker threads for offloaded translation (0 disables the pool)
    pub worker_threads: usize,

    /// File extension to format plugin name
    pub formats: BTreeMap<String, String>,

    /// Format plugin used when no extension matches
    pub default_format: String,

    /// Log level used by the CLI
    pub loglevel: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        let formats = [
            ("js", "js"),
            ("mjs", "js"),
            ("cjs", "js"),
            ("jsx", "js"),
            ("ts", "ts"),
            ("tsx", "ts"),
            ("mts", "ts"),
            ("json", "json"),
            ("css", "css"),
            ("html", "html"),
            ("htm", "html"),
        ]
        .into_iter()
        .map(|(ext, plugin)| (ext.to_string(), plugin.to_string()))
        .collect();

        Self {
            base_url: None,
            extensions: vec![
                "js".to_string(),
                "ts".to_string(),
                "json".to_string(),
                "css".to_string(),
            ],
            index_files: true,
            node_modules: true,
            max_format_redirects: 8,
            worker_threads: 0,
            formats,
            default_format: "js".to_string(),
            loglevel: "warn".to_string(),
        }
    }
}

impl LoaderConfig {
    /// Load configuration from an optional TOML file, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None if Path::new(CONFIG_FILE).exists() => Self::from_file(Path::new(CONFIG_FILE))?,
            None => Self::default(),
        };

        config.load_from_env()?;
        Ok(config)
    }

    /// Parse a TOML configuration file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse TOML configuration text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| LoaderError::Config(e.to_string()))
    }

    /// Apply `SPACEY_LOADER_*` environment variables.
    fn load_from_env(&mut self) -> Result<()> {
        self.apply_env(std::env::vars())
    }

    /// Apply prefixed variables from `vars`, skipping unknown keys.
    ///
    /// `SPACEY_LOADER_FORMAT_<EXT>` sets `format.<ext>`.
    fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) -> Result<()> {
        for (key, value) in vars {
            let Some(name) = key.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let config_key = match name.to_lowercase().strip_prefix("format_") {
                Some(ext) => format!("format.{}", ext),
                None => name.to_lowercase().replace('_', "-"),
            };

            if config_key.starts_with("format.") || KEYS.contains(&config_key.as_str()) {
                self.set(&config_key, &value)?;
            } else {
                warn!("Ignoring unknown configuration variable {}", key);
            }
        }
        Ok(())
    }

    /// Set a configuration value by key.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "base-url" => self.base_url = Some(value.to_string()),
            "extensions" => {
                self.extensions = value
                    .split(',')
                    .map(|ext| ext.trim().trim_start_matches('.').to_string())
                    .filter(|ext| !ext.is_empty())
                    .collect();
            }
            "index-files" => self.index_files = parse_bool(key, value)?,
            "node-modules" => self.node_modules = parse_bool(key, value)?,
            "max-format-redirects" => self.max_format_redirects = parse_number(key, value)?,
            "worker-threads" => self.worker_threads = parse_number(key, value)?,
            "default-format" => self.default_format = value.to_string(),
            "loglevel" => self.loglevel = value.to_string(),
            _ => {
                // format.<ext> = <plugin>
                if let Some(ext) = key.strip_prefix("format.") {
                    self.formats.insert(ext.to_string(), value.to_string());
                } else {
                    return Err(LoaderError::Config(format!("unknown key '{}'", key)));
                }
            }
        }
        Ok(())
    }

    /// Get a configuration value by key.
    pub fn get(&self, key: &str) -> Option<String> {
        match key {
            "base-url" => self.base_url.clone(),
            "extensions" => Some(self.extensions.join(",")),
            "index-files" => Some(self.index_files.to_string()),
            "node-modules" => Some(self.node_modules.to_string()),
            "max-format-redirects" => Some(self.max_format_redirects.to_string()),
            "worker-threads" => Some(self.worker_threads.to_string()),
            "default-format" => Some(self.default_format.clone()),
            "loglevel" => Some(self.loglevel.clone()),
            _ => key
                .strip_prefix("format.")
                .and_then(|ext| self.formats.get(ext).cloned()),
        }
    }

    /// Plugin name for an address, from its file extension.
    pub fn format_for(&self, address: &str) -> &str {
        self.extension_format(address)
            .unwrap_or(&self.default_format)
    }

    /// Format plugin mapped to the extension of `address`, if it has a known one.
    pub fn extension_format(&self, address: &str) -> Option<&str> {
        let path = address.split(['?', '#']).next().unwrap_or(address);
        let file = path.rsplit('/').next().unwrap_or(path);
        file.rsplit_once('.')
            .and_then(|(_, ext)| self.formats.get(&ext.to_ascii_lowercase()))
            .map(String::as_str)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(LoaderError::Config(format!(
            "expected a boolean for '{}', got '{}'",
            key, value
        ))),
    }
}

fn parse_number(key: &str, value: &str) -> Result<usize> {
    value.parse().map_err(|_| {
        LoaderError::Config(format!("expected a number for '{}', got '{}'", key, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_and_get() {
        let mut config = LoaderConfig::default();
        config.set("extensions", ".js, .mjs").unwrap();
        config.set("worker-threads", "2").unwrap();
        config.set("format.vue", "html").unwrap();

        assert_eq!(config.get("extensions").as_deref(), Some("js,mjs"));
        assert_eq!(config.get("worker-threads").as_deref(), Some("2"));
        assert_eq!(config.get("format.vue").as_deref(), Some("html"));
        assert!(config.set("no-such-key", "1").is_err());
        assert!(config.set("node-modules", "maybe").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let vars = [
            ("SPACEY_LOADER_WORKER_THREADS", "3"),
            ("SPACEY_LOADER_FORMAT_VUE", "html"),
            ("SPACEY_LOADER_NO_SUCH_KEY", "1"),
            ("OTHER_WORKER_THREADS", "9"),
        ]
        .map(|(key, value)| (key.to_string(), value.to_string()));

        let mut config = LoaderConfig::default();
        config.apply_env(vars).unwrap();
        assert_eq!(config.worker_threads, 3);
        assert_eq!(config.get("format.vue").as_deref(), Some("html"));

        let bad = [("SPACEY_LOADER_INDEX_FILES".to_string(), "maybe".to_string())];
        assert!(config.apply_env(bad).is_err());
    }

    #[test]
    fn test_format_for() {
        let config = LoaderConfig::default();
        assert_eq!(config.format_for("file:///app/main.ts"), "ts");
        assert_eq!(config.format_for("file:///app/style.CSS"), "css");
        assert_eq!(config.format_for("https://cdn.test/lib.json?v=2"), "json");
        assert_eq!(config.format_for("file:///app.d/readme"), "js");
    }

    #[test]
    fn test_from_toml() {
        let config = LoaderConfig::from_toml(
            r#"
            base-url = "file:///srv/app/"
            max-format-redirects = 3

            [formats]
            svelte = "html"
            "#,
        )
        .unwrap();

        assert_eq!(config.base_url.as_deref(), Some("file:///srv/app/"));
        assert_eq!(config.max_format_redirects, 3);
        assert_eq!(config.formats.get("svelte").map(String::as_str), Some("html"));
        // Unspecified fields fall back to defaults
        assert!(config.node_modules);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Package metadata
//!
//! The loader only reads a package's name, root, main entry and alias map.
//! Everything about installing or negotiating versions belongs elsewhere.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;
use url::Url;

use crate::error::{LoaderError, Result};
use crate::fetch::{FetchOptions, Fetcher};

/// Metadata about an installed or fetched package
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Package {
    /// Package name (empty for loose files)
    pub name: String,
    /// Package version
    #[serde(default)]
    pub version: String,
    /// Root address, always ending in `/`
    pub root: String,
    /// Main entry, relative to the root
    #[serde(default)]
    pub main: Option<String>,
    /// Alias map (`browser` field), relative specifiers are root-relative
    #[serde(default)]
    pub map: BTreeMap<String, String>,
}

impl Package {
    /// Create package metadata rooted at `root`
    pub fn new(name: impl Into<String>, version: impl Into<String>, root: impl Into<String>) -> Self {
        let mut root = root.into();
        if !root.ends_with('/') {
            root.push('/');
        }
        Self {
            name: name.into(),
            version: version.into(),
            root,
            main: None,
            map: BTreeMap::new(),
        }
    }

    /// Build metadata from a parsed manifest found at `root`
    pub fn from_manifest(manifest: &PackageJson, fallback_name: &str, root: &str) -> Self {
        let mut package = Self::new(
            manifest.name.clone().unwrap_or_else(|| fallback_name.to_string()),
            manifest.version.clone().unwrap_or_default(),
            root,
        );
        package.main = manifest
            .main
            .clone()
            .or_else(|| manifest.module.clone())
            .map(|main| main.trim_start_matches("./").to_string());

        match &manifest.browser {
            Some(BrowserField::Main(main)) => {
                package.main = Some(main.trim_start_matches("./").to_string())
            }
            Some(BrowserField::Map(map)) => {
                package.map = map
                    .iter()
                    .filter_map(|(from, to)| match to {
                        serde_json::Value::String(to) => Some((from.clone(), to.clone())),
                        // `false` disables a module; map it to an empty stub
                        serde_json::Value::Bool(false) => {
                            Some((from.clone(), "@empty".to_string()))
                        }
                        _ => None,
                    })
                    .collect();
            }
            None => {}
        }

        package
    }

    /// Whether `address` lies inside this package
    pub fn contains(&self, address: &str) -> bool {
        address.starts_with(&self.root)
    }

    /// Address of the main entry
    pub fn main_address(&self) -> String {
        format!(
            "{}{}",
            self.root,
            self.main.as_deref().unwrap_or("index.js")
        )
    }

    /// Path of `address` relative to the root
    pub fn relative_path<'a>(&self, address: &'a str) -> Option<&'a str> {
        address.strip_prefix(self.root.as_str())
    }

    /// Apply the alias map to a specifier
    pub fn alias(&self, specifier: &str) -> Option<&str> {
        self.map.get(specifier).map(String::as_str)
    }
}

/// `browser` field of package.json
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BrowserField {
    /// Replacement main entry
    Main(String),
    /// Module replacement map
    Map(BTreeMap<String, serde_json::Value>),
}

/// The parts of package.json the loader reads
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PackageJson {
    /// Package name
    pub name: Option<String>,
    /// Package version
    pub version: Option<String>,
    /// Main entry point
    pub main: Option<String>,
    /// Module entry point (ES modules)
    pub module: Option<String>,
    /// Browser replacements
    pub browser: Option<BrowserField>,
    /// Package type (commonjs or module)
    #[serde(rename = "type")]
    pub package_type: Option<String>,
}

impl PackageJson {
    /// Parse manifest text
    pub fn parse(content: &str) -> Result<Self> {
        Ok(serde_json::from_str(content)?)
    }
}

/// Split a bare specifier into package name and optional subpath
pub fn parse_package_specifier(specifier: &str) -> (&str, Option<&str>) {
    if let Some(rest) = specifier.strip_prefix('@') {
        // Scoped package: @scope/name or @scope/name/subpath
        if let Some(slash_pos) = rest.find('/') {
            let after_scope = &rest[slash_pos + 1..];
            if let Some(subpath_pos) = after_scope.find('/') {
                let name_end = slash_pos + 2 + subpath_pos;
                return (&specifier[..name_end], Some(&specifier[name_end + 1..]));
            }
        }
        (specifier, None)
    } else if let Some(slash_pos) = specifier.find('/') {
        (&specifier[..slash_pos], Some(&specifier[slash_pos + 1..]))
    } else {
        (specifier, None)
    }
}

/// Package-manager collaborator
#[async_trait]
pub trait PackageManager: Send + Sync {
    /// Package owning `address`, if any
    fn get_package(&self, address: &str) -> Option<Arc<Package>>;

    /// Package already known by name
    fn package_by_name(&self, name: &str) -> Option<Arc<Package>>;

    /// Make a package known
    fn register(&self, package: Package) -> Arc<Package>;

    /// Find package `name` as seen from `from`, fetching manifests if needed
    async fn locate(
        &self,
        name: &str,
        from: &str,
        fetcher: &dyn Fetcher,
    ) -> Result<Option<Arc<Package>>>;
}

/// In-memory package registry with `node_modules` lookup
#[derive(Default)]
pub struct PackageRegistry {
    by_name: DashMap<String, Arc<Package>>,
    by_root: DashMap<String, Arc<Package>>,
}

impl PackageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of known packages
    pub fn len(&self) -> usize {
        self.by_root.len()
    }

    /// Whether no package is known
    pub fn is_empty(&self) -> bool {
        self.by_root.is_empty()
    }
}

#[async_trait]
impl PackageManager for PackageRegistry {
    fn get_package(&self, address: &str) -> Option<Arc<Package>> {
        // Longest root wins so nested node_modules resolve to the inner package
        self.by_root
            .iter()
            .filter(|entry| address.starts_with(entry.key().as_str()))
            .max_by_key(|entry| entry.key().len())
            .map(|entry| Arc::clone(entry.value()))
    }

    fn package_by_name(&self, name: &str) -> Option<Arc<Package>> {
        self.by_name.get(name).map(|entry| Arc::clone(entry.value()))
    }

    fn register(&self, package: Package) -> Arc<Package> {
        if let Some(existing) = self.by_root.get(&package.root) {
            return Arc::clone(existing.value());
        }

        let package = Arc::new(package);
        debug!("Registered package {} at {}", package.name, package.root);
        self.by_root
            .insert(package.root.clone(), Arc::clone(&package));
        if !package.name.is_empty() {
            self.by_name
                .entry(package.name.clone())
                .or_insert_with(|| Arc::clone(&package));
        }
        package
    }

    async fn locate(
        &self,
        name: &str,
        from: &str,
        fetcher: &dyn Fetcher,
    ) -> Result<Option<Arc<Package>>> {
        let from = Url::parse(from)?;

        // Walk up the directory tree looking for node_modules
        let mut dir = from.join("./")?;
        loop {
            let root = dir.join(&format!("node_modules/{}/", name))?;
            if let Some(package) = self.by_root.get(root.as_str()) {
                return Ok(Some(Arc::clone(package.value())));
            }

            let manifest = root.join("package.json")?;
            if fetcher.exists(manifest.as_str()).await {
                let response = fetcher
                    .fetch(manifest.as_str(), &FetchOptions::default())
                    .await?;
                if response.ok {
                    let parsed = PackageJson::parse(response.text()).map_err(|e| {
                        LoaderError::resolution(
                            name,
                            manifest.as_str(),
                            format!("invalid package.json: {}", e),
                        )
                    })?;
                    let package = Package::from_manifest(&parsed, name, root.as_str());
                    return Ok(Some(self.register(package)));
                }
            }

            let parent = dir.join("../")?;
            if parent == dir {
                return Ok(None);
            }
            dir = parent;
        }
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Bundles
//!
//! A bundle lists packages sorted by name (then root) and, inside each,
//! files sorted by address. Files are numbered densely in that order and
//! imports refer to their dependency by number, so the same graph always
//! serializes to the same text. An import with a `null` index is not part
//! of the bundle and is resolved normally when loaded.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use crate::error::{LoaderError, Result};
use crate::loader::Loader;
use crate::package::Package;
use crate::plugin::Next;
use crate::plugins::base::is_url;
use crate::record::{Origin, Record};

/// Bundle format version written and accepted
pub const BUNDLE_VERSION: u32 = 1;

/// A whole bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleSpec {
    /// Format version
    pub version: u32,
    /// Index of the file the bundle was built for
    #[serde(default)]
    pub entry: Option<usize>,
    /// Packages in index order
    pub packages: Vec<PackageSpec>,
}

/// One package of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageSpec {
    /// Package name, empty for loose files
    pub name: String,
    /// Package version
    #[serde(default)]
    pub version: String,
    /// Root address
    pub root: String,
    /// Main entry relative to the root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub main: Option<String>,
    /// Alias map
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub map: BTreeMap<String, String>,
    /// Files sorted by address
    pub files: Vec<FileSpec>,
}

/// One file of a bundle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    /// Path relative to the package root, or a full address
    pub path: String,
    /// Format tag after translation
    pub format: String,
    /// Format plugin names, most recently added first
    #[serde(default)]
    pub plugins: Vec<String>,
    /// Imports in first-seen order
    #[serde(default)]
    pub imports: Vec<ImportSpec>,
    /// Code as produced by the wrap and build stages
    pub code: String,
}

/// One import of a bundled file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSpec {
    /// Specifier as written in the source
    pub specifier: String,
    /// Global index of the dependency, `None` if outside the bundle
    pub index: Option<usize>,
}

impl BundleSpec {
    /// Parse bundle text
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| LoaderError::Bundle(format!("malformed bundle: {}", e)))
    }

    /// Serialize to bundle text
    pub fn to_text(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Files in index order with their package
    pub fn files(&self) -> impl Iterator<Item = (&PackageSpec, &FileSpec)> {
        self.packages
            .iter()
            .flat_map(|package| package.files.iter().map(move |file| (package, file)))
    }

    /// Address of the entry file
    pub fn entry_address(&self) -> Option<String> {
        let (package, file) = self.files().nth(self.entry?)?;
        Some(package.address_of(file))
    }
}

impl PackageSpec {
    fn from_package(package: &Package, files: Vec<FileSpec>) -> Self {
        Self {
            name: package.name.clone(),
            version: package.version.clone(),
            root: package.root.clone(),
            main: package.main.clone(),
            map: package.map.clone(),
            files,
        }
    }

    /// Package metadata described by this entry
    pub fn to_package(&self) -> Package {
        let mut package = Package::new(&self.name, &self.version, &self.root);
        package.main = self.main.clone();
        package.map = self.map.clone();
        package
    }

    /// Full address of one of this package's files
    pub fn address_of(&self, file: &FileSpec) -> String {
        if is_url(&file.path) {
            file.path.clone()
        } else {
            format!("{}{}", self.root, file.path)
        }
    }
}

/// Records reachable from `root` through import tables
fn closure(root: &Arc<Record>) -> Vec<Arc<Record>> {
    let mut seen = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![Arc::clone(root)];

    while let Some(record) = stack.pop() {
        if !seen.insert(record.id()) {
            continue;
        }
        for (_, dependency) in record.import_table().into_iter().rev() {
            if !seen.contains(&dependency.id()) {
                stack.push(dependency);
            }
        }
        order.push(record);
    }

    order
}

fn directory_of(address: &str) -> String {
    Url::parse(address)
        .and_then(|url| url.join("./"))
        .map(String::from)
        .unwrap_or_else(|_| address.to_string())
}

async fn wrap(loader: &Loader, record: &Arc<Record>) -> Result<String> {
    // Bundled code already went through wrap and build when it was written
    if record.origin() == Origin::Bundled {
        return Ok(record.source().unwrap_or_default());
    }

    let stack = record.plugins();
    let code = Next::new(&stack, loader).wrap(record)?;
    Next::new(&stack, loader).build(record, code).await
}

/// Serialize the closure of `root` as bundle text
pub(crate) async fn build(loader: &Loader, root: &Arc<Record>, base: &str) -> Result<String> {
    let anonymous = Package::new("", "", directory_of(base));

    let mut groups: BTreeMap<(String, String), (Package, Vec<Arc<Record>>)> = BTreeMap::new();
    for record in closure(root) {
        let package = record
            .package()
            .map(|package| (*package).clone())
            .unwrap_or_else(|| anonymous.clone());
        groups
            .entry((package.name.clone(), package.root.clone()))
            .or_insert_with(|| (package, Vec::new()))
            .1
            .push(record);
    }

    let mut indices = HashMap::new();
    for (_, records) in groups.values_mut() {
        records.sort_by_key(|record| record.key());
        for record in records.iter() {
            let next = indices.len();
            indices.insert(record.id(), next);
        }
    }

    let mut packages = Vec::with_capacity(groups.len());
    for (package, records) in groups.into_values() {
        let mut files = Vec::with_capacity(records.len());
        for record in &records {
            let key = record.key();
            let imports = record
                .import_list()
                .into_iter()
                .map(|specifier| {
                    let index = record
                        .dependency(&specifier)
                        .and_then(|dependency| indices.get(&dependency.id()).copied());
                    ImportSpec { specifier, index }
                })
                .collect();

            files.push(FileSpec {
                path: package.relative_path(&key).unwrap_or(&key).to_string(),
                format: record.format().unwrap_or_default(),
                plugins: loader.format_plugins(record),
                imports,
                code: wrap(loader, record).await?,
            });
        }
        debug!("Bundled {} files of '{}'", files.len(), package.name);
        packages.push(PackageSpec::from_package(&package, files));
    }

    let spec = BundleSpec {
        version: BUNDLE_VERSION,
        entry: indices.get(&root.id()).copied(),
        packages,
    };
    info!("Built bundle of {} files for {}", indices.len(), root.key());
    spec.to_text()
}

/// Register the packages and files of a bundle without fetching anything
///
/// Records that already exist are kept as they are.
pub(crate) fn built(
    loader: &Loader,
    version: u32,
    packages: &[PackageSpec],
) -> Result<Vec<Arc<Package>>> {
    if version != BUNDLE_VERSION {
        return Err(LoaderError::Bundle(format!(
            "unsupported bundle version {} (expected {})",
            version, BUNDLE_VERSION
        )));
    }

    // Nothing is registered unless every file has known plugins and every
    // index points into the bundle
    let total: usize = packages.iter().map(|package| package.files.len()).sum();
    for spec in packages {
        for file in &spec.files {
            loader.stack_from_names(&file.plugins)?;
            let dangling = file.imports.iter().find_map(|import| {
                import
                    .index
                    .filter(|index| *index >= total)
                    .map(|index| (import, index))
            });
            if let Some((import, index)) = dangling {
                return Err(LoaderError::Bundle(format!(
                    "{}: import '{}' refers to missing file {}",
                    spec.address_of(file),
                    import.specifier,
                    index
                )));
            }
        }
    }

    let mut registered = Vec::with_capacity(packages.len());
    let mut entries: Vec<(Arc<Record>, bool, &FileSpec)> = Vec::new();

    for spec in packages {
        let package = spec.to_package();
        let (package, owner) = if package.name.is_empty() {
            (Arc::new(package), None)
        } else {
            let package = loader.packages().register(package);
            (Arc::clone(&package), Some(package))
        };

        for file in &spec.files {
            let address = spec.address_of(file);
            let (record, created) = loader.bundled_record(&address, file, owner.clone())?;
            entries.push((record, created, file));
        }
        registered.push(package);
    }

    for (record, created, file) in &entries {
        if !created {
            continue;
        }
        for import in &file.imports {
            record.add_import(&import.specifier);
            let Some(index) = import.index else {
                continue;
            };
            if let Some((dependency, _, _)) = entries.get(index) {
                record.bind_import(&import.specifier, dependency);
            }
        }
    }

    info!(
        "Registered {} packages and {} files from bundle",
        registered.len(),
        entries.len()
    );
    Ok(registered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> BundleSpec {
        BundleSpec {
            version: BUNDLE_VERSION,
            entry: Some(1),
            packages: vec![
                PackageSpec {
                    name: String::new(),
                    version: String::new(),
                    root: "file:///app/".to_string(),
                    main: None,
                    map: BTreeMap::new(),
                    files: vec![FileSpec {
                        path: "lib.js".to_string(),
                        format: "cjs".to_string(),
                        plugins: vec!["js".to_string()],
                        imports: vec![],
                        code: "exports.x = 1;".to_string(),
                    }],
                },
                PackageSpec {
                    name: "pkg".to_string(),
                    version: "1.0.0".to_string(),
                    root: "file:///app/node_modules/pkg/".to_string(),
                    main: Some("index.js".to_string()),
                    map: BTreeMap::new(),
                    files: vec![FileSpec {
                        path: "index.js".to_string(),
                        format: "cjs".to_string(),
                        plugins: vec!["js".to_string()],
                        imports: vec![
                            ImportSpec {
                                specifier: "../../lib".to_string(),
                                index: Some(0),
                            },
                            ImportSpec {
                                specifier: "external".to_string(),
                                index: None,
                            },
                        ],
                        code: "require('../../lib');".to_string(),
                    }],
                },
            ],
        }
    }

    #[test]
    fn test_entry_address() {
        assert_eq!(
            sample().entry_address().as_deref(),
            Some("file:///app/node_modules/pkg/index.js")
        );
    }

    #[test]
    fn test_text_format() {
        let text = sample().to_text().unwrap();
        assert!(text.contains("\"index\": null"));
        assert!(!text.contains("\"map\""));
        assert_eq!(BundleSpec::parse(&text).unwrap(), sample());
    }

    #[test]
    fn test_malformed_bundle() {
        assert!(matches!(
            BundleSpec::parse("{ \"version\": 1 }"),
            Err(LoaderError::Bundle(_))
        ));
    }

    #[test]
    fn test_directory_of() {
        assert_eq!(directory_of("file:///app/src/main.js"), "file:///app/src/");
        assert_eq!(directory_of("file:///app/"), "file:///app/");
    }
}

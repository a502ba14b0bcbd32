// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module records
//!
//! One [`Record`] exists per resolved address for the lifetime of a loader.
//! It carries the source, the format tag, the plugin stack, the ordered
//! import list and the handles representing its progress through the
//! pipeline.

use futures::future::{BoxFuture, Shared};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};

use crate::error::{LoaderError, Result};
use crate::exports::Exports;
use crate::package::Package;
use crate::plugin::{Plugin, PluginStack};

/// Memoized unit of pipeline work shared by every awaiter
pub type SharedStage = Shared<BoxFuture<'static, Result<()>>>;

/// How a record's source came to exist
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// Fetched through the plugin chain
    Fetched,
    /// Extracted from a parent record (inline script)
    Inline,
    /// Reconstructed from a bundle
    Bundled,
}

/// Instantiation progress
#[derive(Debug, Clone)]
enum Instantiation {
    Pending,
    Running,
    Done,
    Failed(LoaderError),
}

/// What the instantiation driver should do with a record
#[derive(Debug)]
pub(crate) enum InstantiateStep {
    /// Run the factory now
    Start,
    /// Already running further up the stack: hand out the exposure object
    Cycle(Exports),
    /// Finished earlier
    Done(Exports),
    /// Failed earlier
    Failed(LoaderError),
}

struct RecordState {
    key: String,
    source: Option<String>,
    format: Option<String>,
    plugins: PluginStack,
    import_list: Vec<String>,
    import_tbl: HashMap<String, Weak<Record>>,
    deep_deps: Vec<Weak<Record>>,
    deep_seen: HashSet<u64>,
    translated_format: Option<String>,
    load_error: Option<LoaderError>,
    package: Option<Arc<Package>>,
    parent: Option<Weak<Record>>,
    children: Vec<Arc<Record>>,
    instantiation: Instantiation,
}

/// Per-address module state
pub struct Record {
    id: u64,
    origin: Origin,
    state: RwLock<RecordState>,
    exposure: OnceLock<Exports>,
    loaded: OnceLock<SharedStage>,
    discovered: OnceLock<SharedStage>,
    translating: tokio::sync::Mutex<()>,
}

impl Record {
    /// Create a record for `key` handled by `plugins`
    pub fn new(id: u64, key: impl Into<String>, plugins: PluginStack, origin: Origin) -> Self {
        Self {
            id,
            origin,
            state: RwLock::new(RecordState {
                key: key.into(),
                source: None,
                format: None,
                plugins,
                import_list: Vec::new(),
                import_tbl: HashMap::new(),
                deep_deps: Vec::new(),
                deep_seen: HashSet::new(),
                translated_format: None,
                load_error: None,
                package: None,
                parent: None,
                children: Vec::new(),
                instantiation: Instantiation::Pending,
            }),
            exposure: OnceLock::new(),
            loaded: OnceLock::new(),
            discovered: OnceLock::new(),
            translating: tokio::sync::Mutex::new(()),
        }
    }

    /// Loader-unique identifier
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Resolved address
    pub fn key(&self) -> String {
        self.state.read().key.clone()
    }

    pub(crate) fn set_key(&self, key: impl Into<String>) {
        self.state.write().key = key.into();
    }

    /// How the source was obtained
    pub fn origin(&self) -> Origin {
        self.origin
    }

    /// Current source text
    pub fn source(&self) -> Option<String> {
        self.state.read().source.clone()
    }

    /// Replace the source text
    pub fn set_source(&self, source: impl Into<String>) {
        self.state.write().source = Some(source.into());
    }

    /// Detected format tag
    pub fn format(&self) -> Option<String> {
        self.state.read().format.clone()
    }

    /// Set the format tag without touching the plugin stack
    pub fn set_format(&self, format: impl Into<String>) {
        self.state.write().format = Some(format.into());
    }

    /// Plugin stack
    pub fn plugins(&self) -> PluginStack {
        self.state.read().plugins.clone()
    }

    /// Replace the plugin stack
    pub fn set_plugins(&self, plugins: PluginStack) {
        self.state.write().plugins = plugins;
    }

    /// Push a plugin on this record's stack only
    pub fn add_plugin(&self, plugin: Arc<dyn Plugin>) {
        let mut state = self.state.write();
        state.plugins = state.plugins.push(plugin);
    }

    /// Remove a plugin from this record's stack only
    ///
    /// Returns whether a plugin was removed.
    pub fn remove_plugin(&self, name: &str) -> bool {
        let mut state = self.state.write();
        let removed = state.plugins.remove(name);
        let changed = !removed.ptr_eq(&state.plugins);
        state.plugins = removed;
        changed
    }

    /// Register an import specifier, returning its first-seen ordinal
    pub fn add_import(&self, name: &str) -> usize {
        let mut state = self.state.write();
        match state.import_list.iter().position(|existing| existing == name) {
            Some(index) => index,
            None => {
                state.import_list.push(name.to_string());
                state.import_list.len() - 1
            }
        }
    }

    /// Import specifiers in first-seen order
    pub fn import_list(&self) -> Vec<String> {
        self.state.read().import_list.clone()
    }

    /// Drop imports registered by an earlier analyze pass
    pub(crate) fn clear_imports(&self) {
        let mut state = self.state.write();
        state.import_list.clear();
        state.import_tbl.clear();
    }

    /// Record bound to an import specifier
    pub fn dependency(&self, specifier: &str) -> Option<Arc<Record>> {
        self.state
            .read()
            .import_tbl
            .get(specifier)
            .and_then(Weak::upgrade)
    }

    pub(crate) fn bind_import(&self, specifier: &str, record: &Arc<Record>) {
        self.state
            .write()
            .import_tbl
            .insert(specifier.to_string(), Arc::downgrade(record));
    }

    /// Bound imports, in import order
    pub fn import_table(&self) -> Vec<(String, Arc<Record>)> {
        let state = self.state.read();
        state
            .import_list
            .iter()
            .filter_map(|specifier| {
                let record = state.import_tbl.get(specifier)?.upgrade()?;
                Some((specifier.clone(), record))
            })
            .collect()
    }

    /// Import specifiers not yet bound to a record
    pub fn unresolved_imports(&self) -> Vec<String> {
        let state = self.state.read();
        state
            .import_list
            .iter()
            .filter(|specifier| !state.import_tbl.contains_key(specifier.as_str()))
            .cloned()
            .collect()
    }

    /// Add `record` to the transitive dependency set
    ///
    /// Returns false if it was already present.
    pub fn add_deep_dep(&self, record: &Arc<Record>) -> bool {
        let mut state = self.state.write();
        if !state.deep_seen.insert(record.id) {
            return false;
        }
        state.deep_deps.push(Arc::downgrade(record));
        true
    }

    /// Transitive dependencies in discovery order, self included
    pub fn deep_deps(&self) -> Vec<Arc<Record>> {
        self.state
            .read()
            .deep_deps
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    /// The exposure object, created on first use
    pub fn exposure(&self) -> Exports {
        self.exposure.get_or_init(Exports::new).clone()
    }

    /// Format the record was last translated for
    pub fn translated_format(&self) -> Option<String> {
        self.state.read().translated_format.clone()
    }

    pub(crate) fn set_translated_format(&self, format: Option<String>) {
        self.state.write().translated_format = format;
    }

    /// Stored failure, if any stage failed
    pub fn load_error(&self) -> Option<LoaderError> {
        self.state.read().load_error.clone()
    }

    pub(crate) fn set_load_error(&self, error: LoaderError) {
        let mut state = self.state.write();
        if state.load_error.is_none() {
            state.load_error = Some(error);
        }
    }

    /// Owning package
    pub fn package(&self) -> Option<Arc<Package>> {
        self.state.read().package.clone()
    }

    pub(crate) fn set_package(&self, package: Option<Arc<Package>>) {
        self.state.write().package = package;
    }

    /// Record this one was extracted from
    pub fn parent(&self) -> Option<Arc<Record>> {
        self.state.read().parent.as_ref().and_then(Weak::upgrade)
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Record>) {
        self.state.write().parent = Some(Arc::downgrade(parent));
    }

    /// Records extracted from this one
    pub fn children(&self) -> Vec<Arc<Record>> {
        self.state.read().children.clone()
    }

    pub(crate) fn add_child(&self, child: Arc<Record>) {
        let mut state = self.state.write();
        if !state.children.iter().any(|existing| existing.id == child.id) {
            state.children.push(child);
        }
    }

    /// Whether the factory has completed successfully
    pub fn is_instantiated(&self) -> bool {
        matches!(self.state.read().instantiation, Instantiation::Done)
    }

    pub(crate) fn begin_instantiation(&self) -> InstantiateStep {
        let mut state = self.state.write();
        match &state.instantiation {
            Instantiation::Pending => {
                state.instantiation = Instantiation::Running;
                InstantiateStep::Start
            }
            Instantiation::Running => {
                drop(state);
                InstantiateStep::Cycle(self.exposure())
            }
            Instantiation::Done => {
                drop(state);
                InstantiateStep::Done(self.exposure())
            }
            Instantiation::Failed(err) => InstantiateStep::Failed(err.clone()),
        }
    }

    pub(crate) fn finish_instantiation(&self, result: &Result<()>) {
        let mut state = self.state.write();
        state.instantiation = match result {
            Ok(()) => Instantiation::Done,
            Err(err) => {
                if state.load_error.is_none() {
                    state.load_error = Some(err.clone());
                }
                Instantiation::Failed(err.clone())
            }
        };
    }

    pub(crate) fn loaded_cell(&self) -> &OnceLock<SharedStage> {
        &self.loaded
    }

    pub(crate) fn discovered_cell(&self) -> &OnceLock<SharedStage> {
        &self.discovered
    }

    pub(crate) fn translate_lock(&self) -> &tokio::sync::Mutex<()> {
        &self.translating
    }
}

impl fmt::Debug for Record {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("Record")
            .field("id", &self.id)
            .field("key", &state.key)
            .field("format", &state.format)
            .field("origin", &self.origin)
            .field("plugins", &state.plugins)
            .field("imports", &state.import_list)
            .finish()
    }
}

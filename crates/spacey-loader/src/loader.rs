// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Loader and discovery engine
//!
//! The loader owns the record registry, the resolution cache and the
//! registry of instantiated modules. An `import` runs four phases:
//!
//! 1. resolve the specifier and look up or create the record
//! 2. discover the dependency closure, fetching and analyzing each record
//!    at most once
//! 3. translate every record of the closure
//! 4. instantiate depth-first in import order
//!
//! Discovery is split in two memoized futures per record. `loaded` covers the
//! record's own fetch, analyze and import resolution and never waits on any
//! other record, so concurrent discovery trees cannot wait on each other in a
//! circle. `discovered` walks the closure from that record, awaiting only
//! `loaded` futures and tracking what it already scheduled.

use dashmap::DashMap;
use futures::future::{self, FutureExt};
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, instrument, trace, warn};
use url::Url;

use crate::bundle::{self, BundleSpec, FileSpec, PackageSpec};
use crate::config::LoaderConfig;
use crate::error::{LoaderError, Result};
use crate::eval::{Evaluator, NativeModules, Scope};
use crate::exports::Exports;
use crate::fetch::{DefaultFetcher, Fetcher};
use crate::package::{Package, PackageManager, PackageRegistry};
use crate::plugin::{Next, Plugin, PluginStack, ResolveRequest};
use crate::plugins::base::{BASE_PLUGIN, BasePlugin, EMPTY_MODULE};
use crate::plugins::{self, offload::TranslateTask};
use crate::record::{InstantiateStep, Origin, Record, SharedStage};
use crate::worker::WorkerPool;

/// Creates a plugin from the loader configuration
pub type PluginFactory = Arc<dyn Fn(&LoaderConfig) -> Arc<dyn Plugin> + Send + Sync>;

/// Why a discovery tree was started
///
/// Carried into discovery logs only. Every mode runs the same discovery;
/// what happens afterwards is up to the entry point that started it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImportMode {
    /// Live import that ends in instantiation
    Import,
    /// Analysis for a bundle
    Build,
    /// Discovery only
    Discover,
}

/// Traversal context of one discovery tree
///
/// Tracks which records the tree already scheduled and who imported each
/// one first, so a failure deep in the graph can be reported with the full
/// chain of imports that led to it.
#[derive(Debug)]
pub struct Importation {
    key: String,
    base: String,
    mode: ImportMode,
    scheduled: HashSet<u64>,
    parents: HashMap<u64, (Arc<Record>, String)>,
}

impl Importation {
    /// Start a tree for `key` requested from `base`
    pub fn new(key: impl Into<String>, base: impl Into<String>, mode: ImportMode) -> Self {
        Self {
            key: key.into(),
            base: base.into(),
            mode,
            scheduled: HashSet::new(),
            parents: HashMap::new(),
        }
    }

    /// Requested key
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Referring address
    pub fn base(&self) -> &str {
        &self.base
    }

    /// Why the tree was started
    pub fn mode(&self) -> ImportMode {
        self.mode
    }

    /// Number of records scheduled so far
    pub fn len(&self) -> usize {
        self.scheduled.len()
    }

    /// Whether nothing was scheduled yet
    pub fn is_empty(&self) -> bool {
        self.scheduled.is_empty()
    }

    /// Mark `record` as scheduled, remembering who imported it
    ///
    /// Returns false on a back-edge or a shared dependency that is
    /// already scheduled.
    pub fn schedule(&mut self, record: &Arc<Record>, importer: Option<(&Arc<Record>, &str)>) -> bool {
        if !self.scheduled.insert(record.id()) {
            return false;
        }
        if let Some((importer, specifier)) = importer {
            self.parents
                .insert(record.id(), (Arc::clone(importer), specifier.to_string()));
        }
        true
    }

    /// Rebuild the parent links of an already discovered closure
    ///
    /// Walks import tables breadth first from `root`, so each record's
    /// parent is its first importer on a shortest path.
    pub fn walk(root: &Arc<Record>) -> Self {
        let key = root.key();
        let mut importation = Self::new(key.as_str(), key.as_str(), ImportMode::Discover);
        importation.schedule(root, None);

        let mut queue = VecDeque::from([Arc::clone(root)]);
        while let Some(record) = queue.pop_front() {
            for (specifier, dependency) in record.import_table() {
                if importation.schedule(&dependency, Some((&record, &specifier))) {
                    queue.push_back(dependency);
                }
            }
        }
        importation
    }

    /// Wrap `error` with every import hop from the root to `record`
    pub fn annotate(&self, record: &Arc<Record>, mut error: LoaderError) -> LoaderError {
        let mut current = record.id();
        // Parent links form a tree rooted at the requested record
        while let Some((importer, specifier)) = self.parents.get(&current) {
            error = error.importing(specifier.as_str(), importer.key());
            current = importer.id();
        }
        error
    }
}

/// Builder for a [`Loader`]
pub struct LoaderBuilder {
    config: LoaderConfig,
    fetcher: Option<Arc<dyn Fetcher>>,
    packages: Option<Arc<dyn PackageManager>>,
    evaluator: Option<Arc<dyn Evaluator>>,
    plugins: Vec<(String, PluginFactory)>,
    middleware: Vec<Arc<dyn Plugin>>,
}

impl LoaderBuilder {
    fn new() -> Self {
        Self {
            config: LoaderConfig::default(),
            fetcher: None,
            packages: None,
            evaluator: None,
            plugins: Vec::new(),
            middleware: Vec::new(),
        }
    }

    /// Use `config`
    pub fn config(mut self, config: LoaderConfig) -> Self {
        self.config = config;
        self
    }

    /// Use `fetcher` instead of the file/HTTP fetcher
    pub fn fetcher(mut self, fetcher: Arc<dyn Fetcher>) -> Self {
        self.fetcher = Some(fetcher);
        self
    }

    /// Use `packages` instead of a fresh registry
    pub fn packages(mut self, packages: Arc<dyn PackageManager>) -> Self {
        self.packages = Some(packages);
        self
    }

    /// Use `evaluator` instead of an empty [`NativeModules`]
    pub fn evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Register a format plugin factory, replacing a built-in of that name
    pub fn plugin<F>(mut self, name: impl Into<String>, factory: F) -> Self
    where
        F: Fn(&LoaderConfig) -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        self.plugins.push((name.into(), Arc::new(factory)));
        self
    }

    /// Add a plugin above every format plugin
    pub fn middleware(mut self, plugin: Arc<dyn Plugin>) -> Self {
        self.middleware.push(plugin);
        self
    }

    /// Create the loader
    pub fn build(self) -> Result<Loader> {
        let fetcher: Arc<dyn Fetcher> = match self.fetcher {
            Some(fetcher) => fetcher,
            None => Arc::new(DefaultFetcher::new(Duration::from_secs(30))?),
        };
        let packages = self
            .packages
            .unwrap_or_else(|| Arc::new(PackageRegistry::new()));
        let evaluator = self
            .evaluator
            .unwrap_or_else(|| Arc::new(NativeModules::new()));

        let workers = match self.config.worker_threads {
            0 => None,
            threads => Some(WorkerPool::new(threads, Arc::new(TranslateTask))?),
        };

        let factories = DashMap::new();
        for (name, factory) in plugins::builtin_factories() {
            factories.insert(name.to_string(), factory);
        }
        for (name, factory) in self.plugins {
            factories.insert(name, factory);
        }

        info!(
            "Loader ready: {} format plugins, {} middleware, {} workers",
            factories.len(),
            self.middleware.len(),
            workers.as_ref().map(WorkerPool::threads).unwrap_or(0)
        );

        Ok(Loader {
            inner: Arc::new(LoaderInner {
                config: self.config,
                fetcher,
                packages,
                evaluator,
                workers,
                records: DashMap::new(),
                modules: DashMap::new(),
                resolutions: DashMap::new(),
                factories,
                plugins: DashMap::new(),
                stacks: DashMap::new(),
                base: PluginStack::new().push(BasePlugin::new()),
                middleware: self.middleware,
                next_id: AtomicU64::new(1),
                instantiating: Mutex::new(()),
            }),
        })
    }
}

struct LoaderInner {
    config: LoaderConfig,
    fetcher: Arc<dyn Fetcher>,
    packages: Arc<dyn PackageManager>,
    evaluator: Arc<dyn Evaluator>,
    workers: Option<WorkerPool>,
    /// Resolved address to record, aliases included
    records: DashMap<String, Arc<Record>>,
    /// Resolved address to the exports of an instantiated module
    modules: DashMap<String, Exports>,
    resolutions: DashMap<(String, String), String>,
    factories: DashMap<String, PluginFactory>,
    plugins: DashMap<String, Arc<dyn Plugin>>,
    /// Format plugin name to the stack shared by all records of that format
    stacks: DashMap<String, PluginStack>,
    base: PluginStack,
    middleware: Vec<Arc<dyn Plugin>>,
    next_id: AtomicU64,
    instantiating: Mutex<()>,
}

/// Universal module loader
///
/// Cheap to clone; clones share all registries.
#[derive(Clone)]
pub struct Loader {
    inner: Arc<LoaderInner>,
}

impl Loader {
    /// Start building a loader
    pub fn builder() -> LoaderBuilder {
        LoaderBuilder::new()
    }

    /// Loader with default collaborators
    pub fn new(config: LoaderConfig) -> Result<Self> {
        Self::builder().config(config).build()
    }

    /// Configuration
    pub fn config(&self) -> &LoaderConfig {
        &self.inner.config
    }

    /// Fetch collaborator
    pub fn fetcher(&self) -> &Arc<dyn Fetcher> {
        &self.inner.fetcher
    }

    /// Package-manager collaborator
    pub fn packages(&self) -> &Arc<dyn PackageManager> {
        &self.inner.packages
    }

    /// Evaluation collaborator
    pub fn evaluator(&self) -> &Arc<dyn Evaluator> {
        &self.inner.evaluator
    }

    /// Worker pool, if enabled
    pub fn workers(&self) -> Option<&WorkerPool> {
        self.inner.workers.as_ref()
    }

    // ==================== Plugins ====================

    /// Register a named plugin factory
    ///
    /// Records created before the call keep the stack they already have.
    pub fn register_plugin<F>(&self, name: impl Into<String>, factory: F)
    where
        F: Fn(&LoaderConfig) -> Arc<dyn Plugin> + Send + Sync + 'static,
    {
        let name = name.into();
        debug!("Registering plugin {}", name);
        self.inner.plugins.remove(&name);
        self.inner.stacks.remove(&name);
        self.inner.factories.insert(name, Arc::new(factory));
    }

    /// The plugin registered as `name`, created on first use
    pub fn plugin(&self, name: &str) -> Result<Arc<dyn Plugin>> {
        let existing = self
            .inner
            .plugins
            .get(name)
            .map(|entry| Arc::clone(entry.value()));
        if let Some(plugin) = existing {
            return Ok(plugin);
        }

        let factory = self
            .inner
            .factories
            .get(name)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| LoaderError::Plugin(name.to_string()))?;

        Ok(Arc::clone(
            self.inner
                .plugins
                .entry(name.to_string())
                .or_insert_with(|| factory(&self.inner.config))
                .value(),
        ))
    }

    /// The stack shared by all records handled by format plugin `name`
    pub fn stack_for(&self, name: &str) -> Result<PluginStack> {
        let existing = self.inner.stacks.get(name).map(|entry| entry.value().clone());
        if let Some(stack) = existing {
            return Ok(stack);
        }

        let plugin = self.plugin(name)?;
        let stack = self
            .inner
            .middleware
            .iter()
            .fold(self.inner.base.push(plugin), |stack, middleware| {
                stack.push(Arc::clone(middleware))
            });

        Ok(self
            .inner
            .stacks
            .entry(name.to_string())
            .or_insert(stack)
            .value()
            .clone())
    }

    /// Rebuild a stack from format plugin names, most recent first
    pub fn stack_from_names(&self, names: &[String]) -> Result<PluginStack> {
        match names {
            [] => self.stack_for(&self.inner.config.default_format),
            [name] => self.stack_for(name),
            names => {
                let mut stack = self.inner.base.clone();
                for name in names.iter().rev() {
                    stack = stack.push(self.plugin(name)?);
                }
                Ok(self
                    .inner
                    .middleware
                    .iter()
                    .fold(stack, |stack, middleware| stack.push(Arc::clone(middleware))))
            }
        }
    }

    /// Names of the format plugins on a record's stack
    pub fn format_plugins(&self, record: &Record) -> Vec<String> {
        record
            .plugins()
            .iter()
            .map(|plugin| plugin.name())
            .filter(|name| {
                *name != BASE_PLUGIN
                    && !self
                        .inner
                        .middleware
                        .iter()
                        .any(|middleware| middleware.name() == *name)
            })
            .map(str::to_string)
            .collect()
    }

    /// Switch a record to another format plugin during analyze
    ///
    /// Imports registered so far are dropped; the analyze loop runs the new
    /// stack next.
    pub fn reformat(&self, record: &Arc<Record>, plugin: &str) -> Result<()> {
        let stack = self.stack_for(plugin)?;
        debug!("{} is now handled by {}", record.key(), plugin);
        record.set_plugins(stack);
        record.set_format(plugin);
        record.clear_imports();
        Ok(())
    }

    // ==================== Records ====================

    fn next_id(&self) -> u64 {
        self.inner.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// The record registered for `address`
    pub fn record(&self, address: &str) -> Option<Arc<Record>> {
        self.inner
            .records
            .get(address)
            .map(|entry| Arc::clone(entry.value()))
    }

    /// All records, once each, sorted by address
    pub fn records(&self) -> Vec<Arc<Record>> {
        let mut seen = HashSet::new();
        let mut records: Vec<Arc<Record>> = self
            .inner
            .records
            .iter()
            .filter(|entry| seen.insert(entry.value().id()))
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        records.sort_by_key(|record| record.key());
        records
    }

    /// Exports of an instantiated module
    pub fn module(&self, address: &str) -> Option<Exports> {
        self.inner
            .modules
            .get(address)
            .map(|entry| entry.value().clone())
    }

    /// Look up or create the record for `address`
    ///
    /// Check and insert happen under one map entry, so concurrent callers
    /// always get the same record.
    pub(crate) fn record_for(&self, address: &str) -> Result<Arc<Record>> {
        if let Some(record) = self.record(address) {
            return Ok(record);
        }

        let (origin, format) = if address == EMPTY_MODULE {
            (Origin::Inline, self.inner.config.default_format.clone())
        } else {
            (
                Origin::Fetched,
                self.inner.config.format_for(address).to_string(),
            )
        };
        let stack = self.stack_for(&format)?;

        let record = self
            .inner
            .records
            .entry(address.to_string())
            .or_insert_with(|| {
                trace!("New record for {}", address);
                let record = Arc::new(Record::new(self.next_id(), address, stack, origin));
                record.set_format(format);
                record.set_package(self.inner.packages.get_package(address));
                if origin == Origin::Inline {
                    record.set_source("");
                }
                record
            })
            .value()
            .clone();
        Ok(record)
    }

    /// Create a record whose source was extracted from `parent`
    pub fn inline_record(
        &self,
        parent: &Arc<Record>,
        address: &str,
        source: String,
        plugin: &str,
    ) -> Result<Arc<Record>> {
        let stack = self.stack_for(plugin)?;
        let record = self
            .inner
            .records
            .entry(address.to_string())
            .or_insert_with(|| {
                let record = Arc::new(Record::new(self.next_id(), address, stack, Origin::Inline));
                record.set_source(source);
                record.set_format(plugin);
                record.set_parent(parent);
                record.set_package(parent.package());
                record
            })
            .value()
            .clone();

        parent.add_child(Arc::clone(&record));
        Ok(record)
    }

    /// Create a record from a bundled file unless `address` is taken
    ///
    /// Returns the record and whether it was created by this call.
    pub(crate) fn bundled_record(
        &self,
        address: &str,
        file: &FileSpec,
        package: Option<Arc<Package>>,
    ) -> Result<(Arc<Record>, bool)> {
        if let Some(existing) = self.record(address) {
            trace!("{} already registered, keeping it", address);
            return Ok((existing, false));
        }

        let stack = self.stack_from_names(&file.plugins)?;
        let mut created = false;
        let record = self
            .inner
            .records
            .entry(address.to_string())
            .or_insert_with(|| {
                created = true;
                let record = Arc::new(Record::new(self.next_id(), address, stack, Origin::Bundled));
                record.set_source(file.code.as_str());
                record.set_format(file.format.as_str());
                record.set_translated_format(Some(file.format.clone()));
                record.set_package(package);
                record
            })
            .value()
            .clone();
        Ok((record, created))
    }

    /// Register `record` under the final URL of a redirected fetch
    ///
    /// If another record already owns `url`, that record keeps the registry
    /// entry and `record` stays reachable only through its original address.
    /// Importers already bound to `record` cannot be moved to the other one
    /// once the fetch is under way, so both stay loaded.
    pub fn rekey(&self, record: &Arc<Record>, url: &str) {
        let old = record.key();
        if old == url {
            return;
        }

        debug!("{} redirected to {}", old, url);
        record.set_key(url);
        let existing = self
            .inner
            .records
            .entry(url.to_string())
            .or_insert_with(|| Arc::clone(record))
            .value()
            .id();
        if existing != record.id() {
            warn!(
                "{} was already loaded separately; {} keeps its own record",
                url, old
            );
        }
        if record.package().is_none() {
            record.set_package(self.inner.packages.get_package(url));
        }
    }

    // ==================== Resolution ====================

    fn default_base() -> String {
        std::env::current_dir()
            .ok()
            .and_then(|dir| Url::from_directory_path(dir).ok())
            .map(String::from)
            .unwrap_or_else(|| "file:///".to_string())
    }

    /// Address top-level imports are resolved against
    pub fn base_for(&self, parent: Option<&str>) -> String {
        parent
            .map(str::to_string)
            .or_else(|| self.inner.config.base_url.clone())
            .unwrap_or_else(Self::default_base)
    }

    /// Resolve `specifier` against `parent` (or the configured base)
    #[instrument(skip(self), level = "debug")]
    pub async fn resolve(&self, specifier: &str, parent: Option<&str>) -> Result<String> {
        let base = self.base_for(parent);
        let importer = self.record(&base);
        self.resolve_with(specifier, &base, importer.as_ref()).await
    }

    async fn resolve_with(
        &self,
        specifier: &str,
        base: &str,
        importer: Option<&Arc<Record>>,
    ) -> Result<String> {
        let key = (specifier.to_string(), base.to_string());
        let cached = self
            .inner
            .resolutions
            .get(&key)
            .map(|entry| entry.value().clone());
        if let Some(address) = cached {
            return Ok(address);
        }

        let stack = match importer {
            Some(record) => record.plugins(),
            None => self.inner.base.clone(),
        };
        let request = ResolveRequest {
            specifier,
            base,
            importer,
        };

        let next = Next::new(&stack, self);
        let address = match next.resolve_sync(&request) {
            Some(address) => address,
            None => next.resolve(&request).await?,
        };
        trace!("{} from {} -> {}", specifier, base, address);

        // First writer wins so every caller sees one answer
        Ok(self
            .inner
            .resolutions
            .entry(key)
            .or_insert(address)
            .value()
            .clone())
    }

    // ==================== Discovery ====================

    fn loaded(&self, record: &Arc<Record>) -> SharedStage {
        record
            .loaded_cell()
            .get_or_init(|| {
                let loader = self.clone();
                let record = Arc::clone(record);
                async move { loader.load_record(record).await }
                    .boxed()
                    .shared()
            })
            .clone()
    }

    fn discovered(&self, record: &Arc<Record>, importation: Importation) -> SharedStage {
        record
            .discovered_cell()
            .get_or_init(|| {
                let loader = self.clone();
                let record = Arc::clone(record);
                async move { loader.discover_tree(record, importation).await }
                    .boxed()
                    .shared()
            })
            .clone()
    }

    async fn load_record(&self, record: Arc<Record>) -> Result<()> {
        let result = self.run_load(&record).await;
        if let Err(err) = &result {
            debug!("Loading {} failed: {}", record.key(), err);
            record.set_load_error(err.clone());
        }
        result
    }

    async fn run_load(&self, record: &Arc<Record>) -> Result<()> {
        match record.origin() {
            Origin::Fetched => {
                self.fetch_record(record).await?;
                self.analyze(record).await?;
            }
            Origin::Inline => self.analyze(record).await?,
            Origin::Bundled => {}
        }
        self.resolve_imports(record).await
    }

    async fn fetch_record(&self, record: &Arc<Record>) -> Result<()> {
        debug!("Fetching {}", record.key());
        let stack = record.plugins();
        Next::new(&stack, self).fetch_record(record).await
    }

    /// Run analyze until the plugin stack stops changing
    async fn analyze(&self, record: &Arc<Record>) -> Result<()> {
        let max = self.inner.config.max_format_redirects;
        let mut redirects = 0;

        loop {
            let stack = record.plugins();
            Next::new(&stack, self).analyze(record).await?;
            if record.plugins().ptr_eq(&stack) {
                return Ok(());
            }

            redirects += 1;
            let format = record.format().unwrap_or_default();
            if redirects > max {
                return Err(LoaderError::FormatRedirectLoop {
                    address: record.key(),
                    count: redirects,
                    format,
                });
            }
            debug!("{} changed format to {}, analyzing again", record.key(), format);
        }
    }

    /// Bind every import of `record` to a record, creating them as needed
    async fn resolve_imports(&self, record: &Arc<Record>) -> Result<()> {
        let pending = record.unresolved_imports();
        if pending.is_empty() {
            return Ok(());
        }

        let importer = record.key();
        let resolved = future::join_all(
            pending
                .iter()
                .map(|specifier| self.resolve_with(specifier, &importer, Some(record))),
        )
        .await;

        // Report the first failure in import order
        for (specifier, address) in pending.iter().zip(resolved) {
            let dependency = address
                .and_then(|address| self.record_for(&address))
                .map_err(|err| err.importing(specifier.as_str(), importer.as_str()))?;
            record.bind_import(specifier, &dependency);
        }
        Ok(())
    }

    fn load_tracked(
        &self,
        record: Arc<Record>,
    ) -> impl Future<Output = (Arc<Record>, Result<()>)> + Send + 'static {
        let loaded = self.loaded(&record);
        async move {
            let result = loaded.await;
            (record, result)
        }
    }

    async fn discover_tree(&self, root: Arc<Record>, mut importation: Importation) -> Result<()> {
        debug!(
            "Discovering {} ({:?} of '{}' from {})",
            root.key(),
            importation.mode(),
            importation.key(),
            importation.base()
        );

        root.add_deep_dep(&root);
        importation.schedule(&root, None);

        let mut pending = FuturesUnordered::new();
        pending.push(self.load_tracked(Arc::clone(&root)));

        while let Some((record, result)) = pending.next().await {
            if let Err(err) = result {
                return Err(importation.annotate(&record, err));
            }

            for (specifier, dependency) in record.import_table() {
                root.add_deep_dep(&dependency);
                if importation.schedule(&dependency, Some((&record, &specifier))) {
                    pending.push(self.load_tracked(dependency));
                }
            }
        }

        debug!("Discovered {} records from {}", importation.len(), root.key());
        Ok(())
    }

    async fn discover_record(
        &self,
        record: &Arc<Record>,
        specifier: &str,
        base: &str,
        mode: ImportMode,
    ) -> Result<()> {
        if record.discovered_cell().get().is_none() {
            trace!("Starting discovery of {}", record.key());
        }
        self.discovered(record, Importation::new(specifier, base, mode))
            .await
    }

    /// Resolve and discover `specifier` and its whole closure
    #[instrument(skip(self))]
    pub async fn discover(&self, specifier: &str, parent: Option<&str>) -> Result<Arc<Record>> {
        let base = self.base_for(parent);
        let address = self.resolve(specifier, Some(base.as_str())).await?;
        let record = self.record_for(&address)?;
        self.discover_record(&record, specifier, &base, ImportMode::Discover)
            .await?;
        Ok(record)
    }

    // ==================== Translation ====================

    async fn translate_all(&self, root: &Arc<Record>) -> Result<()> {
        let records = root.deep_deps();
        let results = future::join_all(records.iter().map(|record| self.translate(record))).await;

        for (record, result) in records.iter().zip(results) {
            if let Err(err) = result {
                return Err(Importation::walk(root).annotate(record, err));
            }
        }
        Ok(())
    }

    /// Translate `record` unless it was already translated for its format
    pub async fn translate(&self, record: &Arc<Record>) -> Result<()> {
        if let Some(err) = record.load_error() {
            return Err(err);
        }

        let _guard = record.translate_lock().lock().await;
        if let Some(err) = record.load_error() {
            return Err(err);
        }

        let format = record.format();
        let done = record.translated_format();
        if done.is_some() && done == format {
            return Ok(());
        }

        // The exposure object exists from translation on
        record.exposure();

        let result = self.run_translate(record).await;
        match result {
            Ok(()) => {
                trace!("Translated {} ({:?})", record.key(), record.format());
                record.set_translated_format(record.format());
                Ok(())
            }
            Err(err) => {
                record.set_load_error(err.clone());
                Err(err)
            }
        }
    }

    async fn run_translate(&self, record: &Arc<Record>) -> Result<()> {
        let stack = record.plugins();
        Next::new(&stack, self).translate(record).await?;
        let stack = record.plugins();
        Next::new(&stack, self).cache(record).await
    }

    // ==================== Instantiation ====================

    fn instantiate(&self, root: &Arc<Record>) -> Result<Exports> {
        let _serial = self.inner.instantiating.lock();
        self.instantiate_record(root)
    }

    fn instantiate_record(&self, record: &Arc<Record>) -> Result<Exports> {
        if let Some(err) = record.load_error() {
            return Err(err);
        }

        match record.begin_instantiation() {
            InstantiateStep::Start => {}
            InstantiateStep::Cycle(exports) => {
                trace!("Cycle back to {}", record.key());
                return Ok(exports);
            }
            InstantiateStep::Done(exports) => return Ok(exports),
            InstantiateStep::Failed(err) => return Err(err),
        }

        let result = self.run_factory(record);
        record.finish_instantiation(&result);
        result?;

        let exports = record.exposure();
        // A redirected record may share its key with one loaded directly
        self.inner
            .modules
            .entry(record.key())
            .or_insert_with(|| exports.clone());
        Ok(exports)
    }

    fn run_factory(&self, record: &Arc<Record>) -> Result<()> {
        let address = record.key();
        let mut scope = Scope::new(&address, record.exposure());

        for (specifier, dependency) in record.import_table() {
            let exports = self
                .instantiate_record(&dependency)
                .map_err(|err| err.importing(specifier.as_str(), address.as_str()))?;
            scope.bind_module(specifier, exports);
        }

        trace!("Instantiating {}", address);
        let stack = record.plugins();
        Next::new(&stack, self).instantiate(record, &mut scope)
    }

    // ==================== Public entry points ====================

    /// Import `specifier` and return its exports
    #[instrument(skip(self))]
    pub async fn import(&self, specifier: &str, parent: Option<&str>) -> Result<Exports> {
        let base = self.base_for(parent);
        let address = self.resolve(specifier, Some(base.as_str())).await?;

        if let Some(exports) = self.module(&address) {
            trace!("{} already instantiated", address);
            return Ok(exports);
        }

        let record = self.record_for(&address)?;
        self.discover_record(&record, specifier, &base, ImportMode::Import)
            .await?;
        self.translate_all(&record).await?;
        self.instantiate(&record)
    }

    /// Discover `specifier` and serialize its closure as bundle text
    #[instrument(skip(self))]
    pub async fn build(&self, specifier: &str, parent: Option<&str>) -> Result<String> {
        let base = self.base_for(parent);
        let address = self.resolve(specifier, Some(base.as_str())).await?;
        let record = self.record_for(&address)?;

        self.discover_record(&record, specifier, &base, ImportMode::Build)
            .await?;
        self.translate_all(&record).await?;
        bundle::build(self, &record, &base).await
    }

    /// Register the packages and records of a bundle
    pub fn built(&self, version: u32, packages: &[PackageSpec]) -> Result<Vec<Arc<Package>>> {
        bundle::built(self, version, packages)
    }

    /// Parse bundle text and register its contents
    ///
    /// Returns the packages and, if the bundle names one, the entry record.
    pub fn built_text(&self, text: &str) -> Result<(Vec<Arc<Package>>, Option<Arc<Record>>)> {
        let spec = BundleSpec::parse(text)?;
        let packages = self.built(spec.version, &spec.packages)?;
        let entry = spec
            .entry_address()
            .and_then(|address| self.record(&address));
        Ok((packages, entry))
    }

    /// Instantiate a record that is already registered, loading what is missing
    pub async fn import_record(&self, record: &Arc<Record>) -> Result<Exports> {
        let key = record.key();
        if let Some(exports) = self.module(&key) {
            return Ok(exports);
        }
        self.discover_record(record, &key, &key, ImportMode::Import)
            .await?;
        self.translate_all(record).await?;
        self.instantiate(record)
    }
}

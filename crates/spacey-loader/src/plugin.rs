// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Plugin chain and stage dispatch
//!
//! Every record carries a [`PluginStack`]: an immutable list of handlers,
//! most recently added first. A stage runs on the first plugin of the stack;
//! each stage method receives a [`Next`] continuation pointing at the rest of
//! the stack, so a plugin either handles the stage itself or hands it down.
//! The default implementation of every stage method is "call next".
//!
//! Stacks share their tails. All plain `.js` records hold the same frames;
//! adding or removing a plugin on one record builds a new prefix and leaves
//! everyone else's chain untouched.

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;

use crate::error::{LoaderError, Result};
use crate::eval::Scope;
use crate::fetch::FetchResponse;
use crate::loader::Loader;
use crate::record::Record;

/// A resolution request
#[derive(Debug, Clone, Copy)]
pub struct ResolveRequest<'a> {
    /// Specifier as written in the source
    pub specifier: &'a str,
    /// Address of the referring module
    pub base: &'a str,
    /// Referring record, when it is known to the loader
    pub importer: Option<&'a Arc<Record>>,
}

/// A format handler or middleware
///
/// Implement only the stages you care about. Stages left at their default
/// delegate to the next plugin in the record's stack; the base plugin at
/// the bottom of every stack supplies the required behaviour.
#[async_trait]
pub trait Plugin: Send + Sync + fmt::Debug {
    /// Plugin name, as registered with the loader and written into bundles
    fn name(&self) -> &str;

    /// Resolve without I/O, if possible
    fn resolve_sync(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Option<String> {
        next.resolve_sync(request)
    }

    /// Resolve a specifier to an address
    async fn resolve(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Result<String> {
        next.resolve(request).await
    }

    /// Fetch raw content for an address
    async fn fetch(&self, address: &str, next: Next<'_>) -> Result<FetchResponse> {
        next.fetch(address).await
    }

    /// Fill in a record's source
    async fn fetch_record(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        next.fetch_record(record).await
    }

    /// Detect the format and register dependencies
    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        next.analyze(record).await
    }

    /// Transform the source into its loadable form
    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        next.translate(record).await
    }

    /// Run the module against its injected bindings
    fn instantiate(&self, record: &Arc<Record>, scope: &mut Scope, next: Next<'_>) -> Result<()> {
        next.instantiate(record, scope)
    }

    /// Post-process wrapped code for a bundle
    async fn build(&self, record: &Arc<Record>, code: String, next: Next<'_>) -> Result<String> {
        next.build(record, code).await
    }

    /// Produce the code written into a bundle
    fn wrap(&self, record: &Arc<Record>, next: Next<'_>) -> Result<String> {
        next.wrap(record)
    }

    /// Persist translation results
    async fn cache(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        next.cache(record).await
    }
}

/// One cell of a plugin stack
pub struct PluginFrame {
    plugin: Arc<dyn Plugin>,
    next: PluginStack,
}

/// Immutable, structurally shared list of plugins
#[derive(Clone, Default)]
pub struct PluginStack {
    head: Option<Arc<PluginFrame>>,
}

impl PluginStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// New stack with `plugin` on top of this one
    pub fn push(&self, plugin: Arc<dyn Plugin>) -> Self {
        Self {
            head: Some(Arc::new(PluginFrame {
                plugin,
                next: self.clone(),
            })),
        }
    }

    /// New stack without the first plugin named `name`
    ///
    /// Frames above the removed one are copied; frames below it are shared.
    pub fn remove(&self, name: &str) -> Self {
        let mut prefix = Vec::new();
        let mut current = self.head.as_ref();

        while let Some(frame) = current {
            if frame.plugin.name() == name {
                return prefix
                    .into_iter()
                    .rev()
                    .fold(frame.next.clone(), |stack, plugin| stack.push(plugin));
            }
            prefix.push(Arc::clone(&frame.plugin));
            current = frame.next.head.as_ref();
        }

        self.clone()
    }

    /// Plugins from most to least recently added
    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Plugin>> {
        let mut current = self.head.as_ref();
        std::iter::from_fn(move || {
            let frame = current?;
            current = frame.next.head.as_ref();
            Some(&frame.plugin)
        })
    }

    /// Plugin names, most recently added first
    pub fn names(&self) -> Vec<String> {
        self.iter().map(|plugin| plugin.name().to_string()).collect()
    }

    /// Whether a plugin named `name` is in the stack
    pub fn contains(&self, name: &str) -> bool {
        self.iter().any(|plugin| plugin.name() == name)
    }

    /// Number of plugins
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Stack below the top plugin
    pub fn tail(&self) -> PluginStack {
        self.head
            .as_ref()
            .map(|frame| frame.next.clone())
            .unwrap_or_default()
    }

    /// Whether both stacks start at the same frame
    pub fn ptr_eq(&self, other: &PluginStack) -> bool {
        match (&self.head, &other.head) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for PluginStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

/// Continuation into the rest of a plugin stack
#[derive(Clone, Copy)]
pub struct Next<'a> {
    frame: Option<&'a Arc<PluginFrame>>,
    loader: &'a Loader,
}

impl<'a> Next<'a> {
    /// Continuation starting at the top of `stack`
    pub fn new(stack: &'a PluginStack, loader: &'a Loader) -> Self {
        Self {
            frame: stack.head.as_ref(),
            loader,
        }
    }

    /// The loader running this stage
    pub fn loader(&self) -> &'a Loader {
        self.loader
    }

    fn split(self) -> Option<(&'a Arc<dyn Plugin>, Next<'a>)> {
        let frame = self.frame?;
        Some((
            &frame.plugin,
            Next {
                frame: frame.next.head.as_ref(),
                loader: self.loader,
            },
        ))
    }

    /// Run `resolve_sync` on the rest of the stack
    pub fn resolve_sync(self, request: &ResolveRequest<'_>) -> Option<String> {
        let (plugin, next) = self.split()?;
        plugin.resolve_sync(request, next)
    }

    /// Run `resolve` on the rest of the stack
    pub async fn resolve(self, request: &ResolveRequest<'_>) -> Result<String> {
        match self.split() {
            Some((plugin, next)) => plugin.resolve(request, next).await,
            None => Err(LoaderError::resolution(
                request.specifier,
                request.base,
                "no plugin could resolve it",
            )),
        }
    }

    /// Run `fetch` on the rest of the stack
    pub async fn fetch(self, address: &str) -> Result<FetchResponse> {
        match self.split() {
            Some((plugin, next)) => plugin.fetch(address, next).await,
            None => Err(LoaderError::fetch(address, "no plugin could fetch it")),
        }
    }

    /// Run `fetch_record` on the rest of the stack
    pub async fn fetch_record(self, record: &Arc<Record>) -> Result<()> {
        match self.split() {
            Some((plugin, next)) => plugin.fetch_record(record, next).await,
            None => Ok(()),
        }
    }

    /// Run `analyze` on the rest of the stack
    pub async fn analyze(self, record: &Arc<Record>) -> Result<()> {
        match self.split() {
            Some((plugin, next)) => plugin.analyze(record, next).await,
            None => Ok(()),
        }
    }

    /// Run `translate` on the rest of the stack
    pub async fn translate(self, record: &Arc<Record>) -> Result<()> {
        match self.split() {
            Some((plugin, next)) => plugin.translate(record, next).await,
            None => Ok(()),
        }
    }

    /// Run `instantiate` on the rest of the stack
    pub fn instantiate(self, record: &Arc<Record>, scope: &mut Scope) -> Result<()> {
        match self.split() {
            Some((plugin, next)) => plugin.instantiate(record, scope, next),
            None => Ok(()),
        }
    }

    /// Run `build` on the rest of the stack
    pub async fn build(self, record: &Arc<Record>, code: String) -> Result<String> {
        match self.split() {
            Some((plugin, next)) => plugin.build(record, code, next).await,
            None => Ok(code),
        }
    }

    /// Run `wrap` on the rest of the stack
    pub fn wrap(self, record: &Arc<Record>) -> Result<String> {
        match self.split() {
            Some((plugin, next)) => plugin.wrap(record, next),
            None => Ok(record.source().unwrap_or_default()),
        }
    }

    /// Run `cache` on the rest of the stack
    pub async fn cache(self, record: &Arc<Record>) -> Result<()> {
        match self.split() {
            Some((plugin, next)) => plugin.cache(record, next).await,
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Named(&'static str);

    impl Plugin for Named {
        fn name(&self) -> &str {
            self.0
        }
    }

    fn named(name: &'static str) -> Arc<dyn Plugin> {
        Arc::new(Named(name))
    }

    #[test]
    fn test_push_shares_tail() {
        let base = PluginStack::new().push(named("base"));
        let js = base.push(named("js"));
        let css = base.push(named("css"));

        assert_eq!(js.names(), vec!["js", "base"]);
        assert_eq!(css.names(), vec!["css", "base"]);
        assert!(js.tail().ptr_eq(&base));
        assert!(css.tail().ptr_eq(&base));
    }

    #[test]
    fn test_remove_copies_prefix_only() {
        let shared = PluginStack::new().push(named("base")).push(named("js"));
        let mine = shared.push(named("cache")).push(named("lint"));
        let theirs = shared.push(named("other"));

        let removed = mine.remove("cache");
        assert_eq!(removed.names(), vec!["lint", "js", "base"]);
        // The shared tail is reused, not copied
        assert!(removed.tail().ptr_eq(&shared));

        // Nobody else sees the change
        assert_eq!(mine.names(), vec!["lint", "cache", "js", "base"]);
        assert_eq!(theirs.names(), vec!["other", "js", "base"]);

        let removed_shared = mine.remove("js");
        assert_eq!(removed_shared.names(), vec!["lint", "cache", "base"]);
        assert_eq!(shared.names(), vec!["js", "base"]);

        assert!(mine.remove("missing").ptr_eq(&mine));
    }
}

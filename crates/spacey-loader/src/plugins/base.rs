// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! The plugin at the bottom of every stack
//!
//! Resolution order:
//! 1. the alias map of the importing record's package
//! 2. URLs and `./`, `../`, `/` specifiers, joined against the base
//! 3. bare specifiers: a package known by name, then `node_modules`, then
//!    the base directory
//! 4. extension probing, then `index` files, then the first configured
//!    extension appended

use async_trait::async_trait;
use std::borrow::Cow;
use std::sync::Arc;
use tracing::{debug, trace};
use url::Url;

use crate::error::{LoaderError, Result};
use crate::eval::Scope;
use crate::fetch::{FetchOptions, FetchResponse};
use crate::loader::Loader;
use crate::package::parse_package_specifier;
use crate::plugin::{Next, Plugin, ResolveRequest};
use crate::record::Record;

/// Name of the base plugin
pub const BASE_PLUGIN: &str = "base";

/// Address of the stub module that disabled aliases resolve to
pub const EMPTY_MODULE: &str = "spacey:@empty";

/// Alias target meaning "this module is disabled"
const EMPTY_ALIAS: &str = "@empty";

/// Default resolution, fetching and evaluation
#[derive(Debug, Default)]
pub struct BasePlugin;

impl BasePlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

/// Whether a specifier is a URL rather than a path or package name
pub fn is_url(specifier: &str) -> bool {
    specifier.contains("://") || specifier.starts_with("file:") || specifier.starts_with("spacey:")
}

/// Whether a specifier is a path relative to its base
pub fn is_relative(specifier: &str) -> bool {
    specifier.starts_with("./")
        || specifier.starts_with("../")
        || specifier.starts_with('/')
        || specifier == "."
        || specifier == ".."
}

fn join(base: &str, specifier: &str, request: &ResolveRequest<'_>) -> Result<String> {
    let base = Url::parse(base).map_err(|e| {
        LoaderError::resolution(request.specifier, request.base, format!("bad base: {}", e))
    })?;
    base.join(specifier)
        .map(String::from)
        .map_err(|e| LoaderError::resolution(request.specifier, request.base, e.to_string()))
}

/// Apply the importing package's alias map
///
/// Returns the specifier to resolve and the base to resolve it against.
fn apply_alias<'a>(request: &ResolveRequest<'a>) -> (Cow<'a, str>, Cow<'a, str>) {
    let aliased = request.importer.and_then(|importer| {
        let package = importer.package()?;
        let target = package.alias(request.specifier)?.to_string();
        if target == EMPTY_ALIAS {
            return Some((EMPTY_MODULE.to_string(), request.base.to_string()));
        }
        // Relative alias targets are relative to the package root
        let base = if is_relative(&target) {
            package.root.clone()
        } else {
            request.base.to_string()
        };
        Some((target, base))
    });

    match aliased {
        Some((specifier, base)) => {
            trace!("alias {} -> {}", request.specifier, specifier);
            (Cow::Owned(specifier), Cow::Owned(base))
        }
        None => (Cow::Borrowed(request.specifier), Cow::Borrowed(request.base)),
    }
}

/// Try extensions, then index files, then fall back to the first extension
async fn probe(loader: &Loader, candidate: String) -> String {
    let config = loader.config();
    if config.extension_format(&candidate).is_some() {
        return candidate;
    }

    let fetcher = loader.fetcher();
    let is_dir = candidate.ends_with('/');

    if !is_dir {
        if fetcher.exists(&candidate).await {
            return candidate;
        }
        for ext in &config.extensions {
            let with_ext = format!("{}.{}", candidate, ext);
            if fetcher.exists(&with_ext).await {
                return with_ext;
            }
        }
    }

    let dir = candidate.trim_end_matches('/');
    if config.index_files {
        for ext in &config.extensions {
            let index = format!("{}/index.{}", dir, ext);
            if fetcher.exists(&index).await {
                return index;
            }
        }
    }

    let ext = config
        .extensions
        .first()
        .map(String::as_str)
        .unwrap_or(config.default_format.as_str());
    debug!("Nothing found for {}, assuming .{}", candidate, ext);
    if is_dir {
        format!("{}/index.{}", dir, ext)
    } else {
        format!("{}.{}", candidate, ext)
    }
}

#[async_trait]
impl Plugin for BasePlugin {
    fn name(&self) -> &str {
        BASE_PLUGIN
    }

    fn resolve_sync(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Option<String> {
        let loader = next.loader();
        let (specifier, base) = apply_alias(request);

        if specifier == EMPTY_MODULE {
            return Some(EMPTY_MODULE.to_string());
        }

        let candidate = if is_url(&specifier) || is_relative(&specifier) {
            join(&base, &specifier, request).ok()?
        } else {
            let (name, subpath) = parse_package_specifier(&specifier);
            let package = loader.packages().package_by_name(name)?;
            match subpath {
                Some(subpath) => format!("{}{}", package.root, subpath),
                None => package.main_address(),
            }
        };

        // Anything else needs the fetcher
        loader
            .config()
            .extension_format(&candidate)
            .map(|_| candidate)
    }

    async fn resolve(&self, request: &ResolveRequest<'_>, next: Next<'_>) -> Result<String> {
        let loader = next.loader();
        let (specifier, base) = apply_alias(request);

        if specifier == EMPTY_MODULE {
            return Ok(EMPTY_MODULE.to_string());
        }

        let candidate = if is_url(&specifier) || is_relative(&specifier) {
            join(&base, &specifier, request)?
        } else {
            let (name, subpath) = parse_package_specifier(&specifier);
            let package = match loader.packages().package_by_name(name) {
                Some(package) => Some(package),
                None if loader.config().node_modules => {
                    loader
                        .packages()
                        .locate(name, &base, loader.fetcher().as_ref())
                        .await
                        .map_err(|e| {
                            LoaderError::resolution(request.specifier, request.base, e.to_string())
                        })?
                }
                None => None,
            };

            match package {
                Some(package) => match subpath {
                    Some(subpath) => format!("{}{}", package.root, subpath),
                    None => package.main_address(),
                },
                // Bare names without a package are relative to the base directory
                None => join(&base, &specifier, request)?,
            }
        };

        Ok(probe(loader, candidate).await)
    }

    async fn fetch(&self, address: &str, next: Next<'_>) -> Result<FetchResponse> {
        next.loader()
            .fetcher()
            .fetch(address, &FetchOptions::default())
            .await
    }

    async fn fetch_record(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let loader = next.loader();
        let address = record.key();

        // Run the fetch stage from the top so plugins can intercept it
        let stack = record.plugins();
        let response = Next::new(&stack, loader).fetch(&address).await?;

        if !response.ok {
            return Err(LoaderError::Fetch {
                address,
                status: Some(response.status),
                reason: format!("status {}", response.status),
            });
        }

        if response.url != address {
            loader.rekey(record, &response.url);
        }
        record.set_source(response.body);
        Ok(())
    }

    fn instantiate(&self, record: &Arc<Record>, scope: &mut Scope, next: Next<'_>) -> Result<()> {
        next.loader().evaluator().evaluate(record, scope)
    }

    fn wrap(&self, record: &Arc<Record>, _next: Next<'_>) -> Result<String> {
        Ok(record.source().unwrap_or_default())
    }
}

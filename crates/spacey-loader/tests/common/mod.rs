//! Shared fixtures for the loader integration tests

#![allow(dead_code)]

use spacey_loader::{Loader, LoaderConfig, MemoryFetcher, NativeModules};
use std::sync::Arc;

/// Base address every fixture lives under
pub const APP: &str = "file:///app/";

/// Address of a fixture file
pub fn app(path: &str) -> String {
    format!("{}{}", APP, path)
}

/// In-memory fetcher holding `files`, keyed by path under [`APP`]
pub fn fetcher(files: &[(&str, &str)]) -> Arc<MemoryFetcher> {
    let fetcher = MemoryFetcher::new();
    for (path, body) in files {
        fetcher.insert(app(path), *body);
    }
    Arc::new(fetcher)
}

/// Loader over `fetcher` with a fresh native evaluator
pub fn loader(fetcher: &Arc<MemoryFetcher>) -> (Loader, Arc<NativeModules>) {
    loader_with(fetcher, LoaderConfig::default())
}

/// Loader over `fetcher` with `config`
pub fn loader_with(
    fetcher: &Arc<MemoryFetcher>,
    config: LoaderConfig,
) -> (Loader, Arc<NativeModules>) {
    let modules = Arc::new(NativeModules::new());
    let loader = Loader::builder()
        .config(config)
        .fetcher(fetcher.clone())
        .evaluator(modules.clone())
        .build()
        .expect("loader");
    (loader, modules)
}

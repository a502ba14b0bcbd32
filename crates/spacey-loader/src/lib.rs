// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! # spacey-loader
//!
//! A universal module loader and bundler.
//!
//! Every module goes through the same pipeline:
//!
//! - **resolve** a specifier to an address
//! - **fetch** the source text
//! - **analyze** it to find its imports and its format
//! - **translate** it into executable form
//! - **instantiate** it once its dependencies are instantiated
//!
//! Each stage runs through a per-record stack of [`Plugin`]s, so formats such
//! as CommonJS, TypeScript, JSON, CSS and HTML are all handled by plugins and
//! new ones can be added at runtime. Discovery of a dependency graph is
//! concurrent, tolerates cycles and never fetches or analyzes a module twice.
//!
//! A discovered graph can be written out as a bundle and registered again in
//! another loader without any fetching.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use spacey_loader::{Loader, LoaderConfig};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let loader = Loader::new(LoaderConfig::load(None)?)?;
//!     let exports = loader.import("./main", None).await?;
//!     println!("{}", exports.snapshot());
//!
//!     let bundle = loader.build("./main", None).await?;
//!     std::fs::write("main.bundle.json", bundle)?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod bundle;
pub mod config;
pub mod error;
pub mod eval;
pub mod exports;
pub mod fetch;
pub mod loader;
pub mod package;
pub mod plugin;
pub mod plugins;
pub mod record;
pub mod worker;

// Re-exports
pub use bundle::{BUNDLE_VERSION, BundleSpec, FileSpec, ImportSpec, PackageSpec};
pub use config::LoaderConfig;
pub use error::{LoaderError, Result};
pub use eval::{Evaluator, NativeModules, Scope};
pub use exports::Exports;
pub use fetch::{DefaultFetcher, FetchOptions, FetchResponse, Fetcher, MemoryFetcher};
pub use loader::{ImportMode, Importation, Loader, LoaderBuilder, PluginFactory};
pub use package::{Package, PackageManager, PackageRegistry};
pub use plugin::{Next, Plugin, PluginStack, ResolveRequest};
pub use record::{Origin, Record};
pub use worker::WorkerPool;

/// Version of the loader
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

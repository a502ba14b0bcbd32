// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Evaluation contexts
//!
//! Module code never reaches a global `define` or `require`. Each factory runs
//! against a [`Scope`] holding the bindings injected for that one module:
//! its exposure object, the exports of its dependencies keyed by specifier,
//! and a few named values such as `__filename`.

use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

use crate::error::{LoaderError, Result};
use crate::exports::Exports;
use crate::record::Record;

/// Bindings visible to one module while it is instantiated
pub struct Scope {
    address: String,
    exports: Exports,
    modules: BTreeMap<String, Exports>,
    globals: BTreeMap<String, Value>,
}

impl Scope {
    /// Create a scope for the module at `address`
    pub fn new(address: impl Into<String>, exports: Exports) -> Self {
        let address = address.into();
        let dirname = match address.rfind('/') {
            Some(pos) => address[..pos].to_string(),
            None => String::new(),
        };

        let mut globals = BTreeMap::new();
        globals.insert("__filename".to_string(), Value::String(address.clone()));
        globals.insert("__dirname".to_string(), Value::String(dirname));

        Self {
            address,
            exports,
            modules: BTreeMap::new(),
            globals,
        }
    }

    /// Address of the module being instantiated
    pub fn address(&self) -> &str {
        &self.address
    }

    /// The module's own exposure object (`module.exports`)
    pub fn exports(&self) -> &Exports {
        &self.exports
    }

    /// Bind the exports of dependency `specifier`
    pub fn bind_module(&mut self, specifier: impl Into<String>, exports: Exports) {
        self.modules.insert(specifier.into(), exports);
    }

    /// Exports of a dependency, by the specifier used in the source
    pub fn require(&self, specifier: &str) -> Result<Exports> {
        self.modules.get(specifier).cloned().ok_or_else(|| {
            LoaderError::instantiation(
                &self.address,
                format!("'{}' was not discovered as a dependency", specifier),
            )
        })
    }

    /// Specifiers bound in this scope
    pub fn specifiers(&self) -> impl Iterator<Item = &str> {
        self.modules.keys().map(String::as_str)
    }

    /// Inject a named value
    pub fn set_global(&mut self, name: impl Into<String>, value: Value) {
        self.globals.insert(name.into(), value);
    }

    /// A named value
    pub fn global(&self, name: &str) -> Option<&Value> {
        self.globals.get(name)
    }
}

/// Code-execution facility used by script formats
pub trait Evaluator: Send + Sync {
    /// Run `record`'s translated code against `scope`
    fn evaluate(&self, record: &Record, scope: &mut Scope) -> Result<()>;
}

/// Module factory written in Rust
pub type Factory = Arc<dyn Fn(&mut Scope) -> Result<()> + Send + Sync>;

/// Evaluator backed by native factories registered per address
///
/// Modules without a factory evaluate to their (empty) exposure object.
#[derive(Default)]
pub struct NativeModules {
    factories: DashMap<String, Factory>,
}

impl NativeModules {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the factory for `address`
    pub fn define<F>(&self, address: impl Into<String>, factory: F)
    where
        F: Fn(&mut Scope) -> Result<()> + Send + Sync + 'static,
    {
        self.factories.insert(address.into(), Arc::new(factory));
    }

    /// Whether `address` has a factory
    pub fn contains(&self, address: &str) -> bool {
        self.factories.contains_key(address)
    }
}

impl Evaluator for NativeModules {
    fn evaluate(&self, record: &Record, scope: &mut Scope) -> Result<()> {
        let factory = self
            .factories
            .get(scope.address())
            .map(|entry| Arc::clone(entry.value()));

        match factory {
            Some(factory) => factory(scope),
            None => {
                trace!("No factory for {} ({:?})", scope.address(), record.format());
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_scope_bindings() {
        let mut scope = Scope::new("file:///app/lib/a.js", Exports::new());
        let dep = Exports::new();
        dep.set("value", json!(7));
        scope.bind_module("./b", dep);

        assert_eq!(scope.global("__dirname"), Some(&json!("file:///app/lib")));
        assert_eq!(
            scope.require("./b").unwrap().get("value"),
            Some(json!(7))
        );
        assert!(matches!(
            scope.require("./c"),
            Err(LoaderError::Instantiation { .. })
        ));
    }
}

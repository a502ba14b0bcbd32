// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Module exposure objects
//!
//! An [`Exports`] handle is the container importers hold on to. Clones share
//! the same storage, so a module that is still running (for example one side
//! of a circular import) can keep filling in exports that the other side
//! already captured.

use parking_lot::RwLock;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Shared, mutable export container of one module
#[derive(Clone)]
pub struct Exports(Arc<RwLock<Value>>);

impl Exports {
    /// Create an empty exports object
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(Value::Object(Map::new()))))
    }

    /// Create an exports container holding `value`
    pub fn from_value(value: Value) -> Self {
        Self(Arc::new(RwLock::new(value)))
    }

    /// Get a named export
    pub fn get(&self, name: &str) -> Option<Value> {
        self.0.read().get(name).cloned()
    }

    /// Set a named export
    ///
    /// If the container was replaced by a non-object value, it becomes an
    /// object again.
    pub fn set(&self, name: impl Into<String>, value: Value) {
        let mut guard = self.0.write();
        if !guard.is_object() {
            *guard = Value::Object(Map::new());
        }
        if let Value::Object(map) = &mut *guard {
            map.insert(name.into(), value);
        }
    }

    /// Replace the whole exported value (`module.exports = ...`)
    pub fn replace(&self, value: Value) {
        *self.0.write() = value;
    }

    /// Copy of the current exported value
    pub fn snapshot(&self) -> Value {
        self.0.read().clone()
    }

    /// Names of the exports currently present
    pub fn keys(&self) -> Vec<String> {
        match &*self.0.read() {
            Value::Object(map) => map.keys().cloned().collect(),
            _ => Vec::new(),
        }
    }

    /// Whether nothing has been exported yet
    pub fn is_empty(&self) -> bool {
        match &*self.0.read() {
            Value::Object(map) => map.is_empty(),
            Value::Null => true,
            _ => false,
        }
    }

    /// Whether two handles refer to the same container
    pub fn ptr_eq(&self, other: &Exports) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Default for Exports {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Exports").field(&*self.0.read()).finish()
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! JSON format plugin

use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use crate::error::{LoaderError, Result};
use crate::eval::Scope;
use crate::plugin::{Next, Plugin};
use crate::record::Record;

/// Handler for `.json` files; the parsed document becomes the exports
#[derive(Debug, Default)]
pub struct JsonPlugin;

impl JsonPlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }

    fn parse(record: &Record) -> Result<Value> {
        let source = record.source().unwrap_or_default();
        serde_json::from_str(&source)
            .map_err(|e| LoaderError::translation(record.key(), "json", e.to_string()))
    }
}

#[async_trait]
impl Plugin for JsonPlugin {
    fn name(&self) -> &str {
        "json"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        // Fail here so every importer sees the syntax error before translate
        Self::parse(record)?;
        record.set_format("json");
        next.analyze(record).await
    }

    fn instantiate(&self, record: &Arc<Record>, scope: &mut Scope, _next: Next<'_>) -> Result<()> {
        scope.exports().replace(Self::parse(record)?);
        Ok(())
    }
}

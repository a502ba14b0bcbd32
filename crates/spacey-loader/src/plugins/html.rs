// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! HTML format plugin
//!
//! `<script src>` tags become dependencies. Inline scripts are split into
//! child records addressed `page.html#<n>`, linked back to the page, and
//! imported by it in document order.

use async_trait::async_trait;
use regex::Regex;
use serde_json::json;
use std::sync::{Arc, LazyLock};
use tracing::debug;

use crate::error::Result;
use crate::eval::Scope;
use crate::plugin::{Next, Plugin};
use crate::plugins::relative_specifier;
use crate::record::Record;

static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<script\b([^>]*)>(.*?)</script\s*>").expect("script pattern")
});

static SRC_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?i)\bsrc\s*=\s*(?:"([^"]*)"|'([^']*)'|([^\s>]+))"#).expect("src pattern")
});

/// A script found in a page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Script {
    /// `<script src="...">`
    External(String),
    /// Script body written in the page
    Inline(String),
}

/// Scripts of a page, in document order
pub fn scan_scripts(source: &str) -> Vec<Script> {
    SCRIPT_RE
        .captures_iter(source)
        .filter_map(|cap| {
            let attrs = cap.get(1).map(|m| m.as_str()).unwrap_or_default();
            if let Some(src) = SRC_RE.captures(attrs) {
                let src = src.get(1).or(src.get(2)).or(src.get(3))?;
                return Some(Script::External(src.as_str().to_string()));
            }

            let body = cap.get(2).map(|m| m.as_str()).unwrap_or_default();
            (!body.trim().is_empty()).then(|| Script::Inline(body.to_string()))
        })
        .collect()
}

/// Handler for `.html` pages
#[derive(Debug, Default)]
pub struct HtmlPlugin;

impl HtmlPlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Plugin for HtmlPlugin {
    fn name(&self) -> &str {
        "html"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let source = record.source().unwrap_or_default();
        let key = record.key();
        let base = key.split('#').next().unwrap_or(&key).to_string();
        record.set_format("html");

        let mut inline = 0;
        for script in scan_scripts(&source) {
            match script {
                Script::External(src) => {
                    record.add_import(&relative_specifier(src));
                }
                Script::Inline(body) => {
                    let address = format!("{}#{}", base, inline);
                    inline += 1;
                    next.loader().inline_record(record, &address, body, "js")?;
                    record.add_import(&address);
                }
            }
        }

        debug!("{} has {} inline scripts", key, inline);
        next.analyze(record).await
    }

    fn instantiate(&self, record: &Arc<Record>, scope: &mut Scope, _next: Next<'_>) -> Result<()> {
        scope.exports().replace(json!({ "scripts": record.import_list() }));
        Ok(())
    }
}

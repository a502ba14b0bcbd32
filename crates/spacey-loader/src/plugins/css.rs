// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! CSS format plugin
//!
//! `@import` rules become dependencies. The exports of a stylesheet are its
//! text; bundles carry it with comments stripped and whitespace collapsed.

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::eval::Scope;
use crate::plugin::{Next, Plugin};
use crate::plugins::relative_specifier;
use crate::record::Record;

static CSS_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@import\s+(?:url\(\s*)?['"]?([^'")\s;]+)['"]?\s*\)?"#).expect("@import pattern")
});

static COMMENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)/\*.*?\*/").expect("comment pattern"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("whitespace pattern"));

/// `@import` targets, in source order
pub fn scan_imports(source: &str) -> Vec<String> {
    CSS_IMPORT_RE
        .captures_iter(source)
        .filter_map(|cap| cap.get(1).map(|m| m.as_str().to_string()))
        .collect()
}

/// Strip comments and collapse whitespace
pub fn minify(source: &str) -> String {
    let stripped = COMMENT_RE.replace_all(source, "");
    WHITESPACE_RE.replace_all(&stripped, " ").trim().to_string()
}

/// Handler for `.css` files
#[derive(Debug, Default)]
pub struct CssPlugin;

impl CssPlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Plugin for CssPlugin {
    fn name(&self) -> &str {
        "css"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let source = record.source().unwrap_or_default();
        record.set_format("css");
        for specifier in scan_imports(&source) {
            record.add_import(&relative_specifier(specifier));
        }
        next.analyze(record).await
    }

    fn instantiate(&self, record: &Arc<Record>, scope: &mut Scope, _next: Next<'_>) -> Result<()> {
        scope
            .exports()
            .replace(Value::String(record.source().unwrap_or_default()));
        Ok(())
    }

    async fn build(&self, record: &Arc<Record>, code: String, next: Next<'_>) -> Result<String> {
        next.build(record, minify(&code)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_imports() {
        let source = r#"
            @import "base.css";
            @import url('theme.css');
            @import url(print.css) print;
            body { color: red; }
        "#;
        assert_eq!(scan_imports(source), vec!["base.css", "theme.css", "print.css"]);
    }

    #[test]
    fn test_minify() {
        let source = "/* header */\nbody {\n    color: red;\n}\n";
        assert_eq!(minify(source), "body { color: red; }");
    }
}

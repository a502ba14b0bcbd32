// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! TypeScript format plugin
//!
//! Type-only imports and re-exports are not dependencies; they are skipped
//! during analyze and elided during translate. The result is handed to the
//! JavaScript machinery with its detected format.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::plugin::{Next, Plugin};
use crate::plugins::{js, offload};
use crate::record::Record;

static TYPE_ONLY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)^[ \t]*(?:import\s+type\s+[^;'"]*from\s*['"][^'"]*['"]|export\s+type\s*\{[^}]*\}(?:\s*from\s*['"][^'"]*['"])?)[ \t]*;?[ \t]*(?:\r?\n)?"#,
    )
    .expect("type-only pattern")
});

/// Remove type-only import and export statements
pub fn elide_type_imports(source: &str) -> String {
    TYPE_ONLY_RE.replace_all(source, "").into_owned()
}

/// Translate TypeScript source, returning the code and its format tag
pub fn translate_source(source: &str) -> (String, String) {
    let code = elide_type_imports(source);
    let format = js::detect_format(&code).to_string();
    (code, format)
}

/// Handler for `.ts` and related extensions
#[derive(Debug, Default)]
pub struct TsPlugin;

impl TsPlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Plugin for TsPlugin {
    fn name(&self) -> &str {
        "ts"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let source = record.source().unwrap_or_default();
        record.set_format("ts");
        for specifier in js::scan_imports(&source, true) {
            record.add_import(&specifier);
        }
        next.analyze(record).await
    }

    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let source = record.source().unwrap_or_default();
        let (code, format) =
            offload::translate(next.loader(), &record.key(), self.name(), source).await?;
        record.set_source(code);
        record.set_format(format);
        next.translate(record).await
    }

    fn wrap(&self, record: &Arc<Record>, next: Next<'_>) -> Result<String> {
        match record.format().as_deref() {
            Some(js::FORMAT_CJS) => Ok(js::wrap_commonjs(&record.source().unwrap_or_default())),
            _ => next.wrap(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elide_type_imports() {
        let source = "import type { A } from './a';\nexport type { B } from './b';\nimport { c } from './c';\nexport const d: number = 1;\n";
        let code = elide_type_imports(source);
        assert_eq!(code, "import { c } from './c';\nexport const d: number = 1;\n");
    }

    #[test]
    fn test_translate_source_detects_format() {
        let (code, format) = translate_source("import type { A } from './a';\nconst x = require('./x');\n");
        assert_eq!(code, "const x = require('./x');\n");
        assert_eq!(format, js::FORMAT_CJS);
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! JavaScript format plugin
//!
//! Detects whether a script is an ES module, CommonJS, AMD or a plain script
//! and registers every static `import`, `export ... from`, dynamic
//! `import()`, `require()` and AMD dependency in source order.

use async_trait::async_trait;
use regex::Regex;
use std::sync::{Arc, LazyLock};

use crate::error::Result;
use crate::plugin::{Next, Plugin};
use crate::record::Record;

/// Format tag for ES modules
pub const FORMAT_ESM: &str = "esm";
/// Format tag for CommonJS
pub const FORMAT_CJS: &str = "cjs";
/// Format tag for AMD
pub const FORMAT_AMD: &str = "amd";
/// Format tag for plain scripts
pub const FORMAT_SCRIPT: &str = "js";

// Simple regex-based scanning (comments and strings are not excluded)
static IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|;)\s*import\s+(type\s+)?(?:(?:[\w$]+\s*,?\s*)?(?:\{[^}]*\}\s*)?(?:\*\s*as\s+[\w$]+\s*)?from\s*)?['"]([^'"]+)['"]"#,
    )
    .expect("import pattern")
});

static EXPORT_FROM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|;)\s*export\s+(type\s+)?(?:\*\s*(?:as\s+[\w$]+\s*)?|\{[^}]*\}\s*)from\s*['"]([^'"]+)['"]"#,
    )
    .expect("export pattern")
});

static EXPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?m)(?:^|;)\s*export\s+(?:default|const|let|var|function|class|async|\{|\*)"#,
    )
    .expect("export declaration pattern")
});

static DYNAMIC_IMPORT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bimport\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("dynamic import pattern")
});

static REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|[^.\w$])require\s*\(\s*['"]([^'"]+)['"]\s*\)"#).expect("require pattern")
});

static CJS_EXPORTS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bmodule\.exports\b|(?:^|[^.\w$])exports\.[\w$]+\s*="#)
        .expect("exports pattern")
});

static DEFINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\bdefine\s*\(\s*(?:['"][^'"]*['"]\s*,\s*)?(?:\[([^\]]*)\]|function\b)"#)
        .expect("define pattern")
});

static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("quoted string pattern"));

/// Detect the module format of a script
pub fn detect_format(source: &str) -> &'static str {
    if IMPORT_RE.is_match(source) || EXPORT_FROM_RE.is_match(source) || EXPORT_RE.is_match(source)
    {
        FORMAT_ESM
    } else if DEFINE_RE.is_match(source) {
        FORMAT_AMD
    } else if REQUIRE_RE.is_match(source) || CJS_EXPORTS_RE.is_match(source) {
        FORMAT_CJS
    } else {
        FORMAT_SCRIPT
    }
}

/// Dependency specifiers of a script, in source order
///
/// Duplicates are kept; `Record::add_import` collapses them. With
/// `skip_type_only`, `import type` and `export type ... from` are ignored.
pub fn scan_imports(source: &str, skip_type_only: bool) -> Vec<String> {
    let mut found: Vec<(usize, String)> = Vec::new();

    for re in [&*IMPORT_RE, &*EXPORT_FROM_RE] {
        for cap in re.captures_iter(source) {
            if skip_type_only && cap.get(1).is_some() {
                continue;
            }
            if let Some(m) = cap.get(2) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }

    for re in [&*DYNAMIC_IMPORT_RE, &*REQUIRE_RE] {
        for cap in re.captures_iter(source) {
            if let Some(m) = cap.get(1) {
                found.push((m.start(), m.as_str().to_string()));
            }
        }
    }

    for cap in DEFINE_RE.captures_iter(source) {
        let Some(list) = cap.get(1) else {
            continue;
        };
        for dep in QUOTED_RE.captures_iter(list.as_str()) {
            if let Some(m) = dep.get(1) {
                // Names AMD injects rather than loads
                if matches!(m.as_str(), "require" | "exports" | "module") {
                    continue;
                }
                found.push((list.start() + m.start(), m.as_str().to_string()));
            }
        }
    }

    found.sort_by_key(|(offset, _)| *offset);
    found.into_iter().map(|(_, specifier)| specifier).collect()
}

/// Wrap CommonJS source in a factory taking its bindings as parameters
pub fn wrap_commonjs(source: &str) -> String {
    format!(
        r#"(function(exports, require, module, __filename, __dirname) {{
{}
}});"#,
        source
    )
}

/// Handler for `.js` and related extensions
#[derive(Debug, Default)]
pub struct JsPlugin;

impl JsPlugin {
    /// Create the plugin
    pub fn new() -> Arc<dyn Plugin> {
        Arc::new(Self)
    }
}

#[async_trait]
impl Plugin for JsPlugin {
    fn name(&self) -> &str {
        "js"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let source = record.source().unwrap_or_default();
        record.set_format(detect_format(&source));
        for specifier in scan_imports(&source, false) {
            record.add_import(&specifier);
        }
        next.analyze(record).await
    }

    fn wrap(&self, record: &Arc<Record>, next: Next<'_>) -> Result<String> {
        match record.format().as_deref() {
            Some(FORMAT_CJS) => Ok(wrap_commonjs(&record.source().unwrap_or_default())),
            _ => next.wrap(record),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_format() {
        assert_eq!(detect_format("import x from './x';"), FORMAT_ESM);
        assert_eq!(detect_format("export default 1;"), FORMAT_ESM);
        assert_eq!(
            detect_format("define(['./a'], function (a) { return a; });"),
            FORMAT_AMD
        );
        assert_eq!(detect_format("const a = require('./a');"), FORMAT_CJS);
        assert_eq!(detect_format("module.exports = 42;"), FORMAT_CJS);
        assert_eq!(detect_format("console.log('hi');"), FORMAT_SCRIPT);
    }

    #[test]
    fn test_scan_source_order() {
        let source = r#"
            import foo from 'foo';
            import { bar, baz as qux } from "bar";
            import * as all from 'all';
            import 'side-effect';
            export * from './reexport';
            export * as ns from './namespace';
            const lazy = import('./lazy');
        "#;

        assert_eq!(
            scan_imports(source, false),
            vec![
                "foo",
                "bar",
                "all",
                "side-effect",
                "./reexport",
                "./namespace",
                "./lazy"
            ]
        );
    }

    #[test]
    fn test_scan_commonjs_and_amd() {
        let cjs = "const x = require('x');\nconst y = require(\"y\");\nrequire('x');\nobj.require('nope');";
        assert_eq!(scan_imports(cjs, false), vec!["x", "y", "x"]);

        let amd = "define('named', ['require', 'exports', './a', 'b'], function (r, e, a, b) {});";
        assert_eq!(scan_imports(amd, false), vec!["./a", "b"]);
    }

    #[test]
    fn test_scan_skips_type_imports() {
        let source = "import type { T } from './types';\nimport { v } from './values';";
        assert_eq!(scan_imports(source, true), vec!["./values"]);
        assert_eq!(scan_imports(source, false), vec!["./types", "./values"]);
    }

    #[test]
    fn test_wrap_commonjs() {
        let wrapped = wrap_commonjs("module.exports = 1;");
        assert!(wrapped.starts_with("(function(exports, require, module, __filename, __dirname) {"));
        assert!(wrapped.contains("module.exports = 1;"));
    }
}

// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Built-in plugins

pub mod base;
pub mod css;
pub mod html;
pub mod js;
pub mod json;
pub mod offload;
pub mod translate_cache;
pub mod ts;

use std::sync::Arc;

pub use base::BasePlugin;
pub use css::CssPlugin;
pub use html::HtmlPlugin;
pub use js::JsPlugin;
pub use json::JsonPlugin;
pub use translate_cache::TranslationCache;
pub use ts::TsPlugin;

use crate::config::LoaderConfig;
use crate::loader::PluginFactory;

/// Factories for the format plugins every loader starts with
pub fn builtin_factories() -> Vec<(&'static str, PluginFactory)> {
    let js: PluginFactory = Arc::new(|_: &LoaderConfig| JsPlugin::new());
    let ts: PluginFactory = Arc::new(|_: &LoaderConfig| TsPlugin::new());
    let json: PluginFactory = Arc::new(|_: &LoaderConfig| JsonPlugin::new());
    let css: PluginFactory = Arc::new(|_: &LoaderConfig| CssPlugin::new());
    let html: PluginFactory = Arc::new(|_: &LoaderConfig| HtmlPlugin::new());

    vec![
        ("js", js),
        ("ts", ts),
        ("json", json),
        ("css", css),
        ("html", html),
    ]
}

/// Treat a url found in markup or a stylesheet as relative unless it is
/// already absolute or explicitly relative
pub(crate) fn relative_specifier(specifier: String) -> String {
    if base::is_relative(&specifier) || base::is_url(&specifier) {
        specifier
    } else {
        format!("./{}", specifier)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_specifier() {
        assert_eq!(relative_specifier("base.css".to_string()), "./base.css");
        assert_eq!(relative_specifier("../up.css".to_string()), "../up.css");
        assert_eq!(
            relative_specifier("https://cdn.test/x.css".to_string()),
            "https://cdn.test/x.css"
        );
    }

    #[test]
    fn test_builtin_names() {
        let names: Vec<&str> = builtin_factories().into_iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["js", "ts", "json", "css", "html"]);
    }
}

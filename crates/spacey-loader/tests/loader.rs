//! Loader Integration Tests
//!
//! Whole-pipeline scenarios over an in-memory file tree: discovery, cycles,
//! failure caching, format redirects and the built-in format plugins.

mod common;

use async_trait::async_trait;
use common::{APP, app};
use serde_json::{Value, json};
use spacey_loader::{
    LoaderConfig, LoaderError, MemoryFetcher, Next, Origin, Plugin, Record, Result,
    plugins::TranslationCache,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_imports_share_one_record() {
    let fetcher = common::fetcher(&[
        ("main.js", "const a = require('./a');\nconst b = require('./b');"),
        ("a.js", "require('./shared');\nexports.a = 1;"),
        ("b.js", "require('./shared');\nexports.b = 2;"),
        ("shared.js", "exports.shared = true;"),
    ]);
    let (loader, _) = common::loader(&fetcher);

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let loader = loader.clone();
            tokio::spawn(async move { loader.import("./main.js", Some(APP)).await })
        })
        .collect();

    let mut results = Vec::new();
    for task in tasks {
        results.push(task.await.unwrap().unwrap());
    }

    assert!(results.iter().all(|exports| exports.ptr_eq(&results[0])));
    for file in ["main.js", "a.js", "b.js", "shared.js"] {
        assert_eq!(fetcher.fetch_count(&app(file)), 1, "{} fetched once", file);
    }
    assert_eq!(loader.records().len(), 4);
}

#[tokio::test]
async fn test_cycle_shares_exposure() {
    let fetcher = common::fetcher(&[
        ("a.js", "const b = require('./b');\nexports.a = 1;"),
        ("b.js", "const a = require('./a');\nexports.b = 2;"),
    ]);
    let (loader, modules) = common::loader(&fetcher);

    modules.define(app("a.js"), |scope| {
        let b = scope.require("./b")?;
        scope.exports().set("a", json!(1));
        scope
            .exports()
            .set("b_seen", b.get("b").unwrap_or(Value::Null));
        Ok(())
    });

    let early = Arc::new(Mutex::new(None));
    let captured = early.clone();
    modules.define(app("b.js"), move |scope| {
        let a = scope.require("./a")?;
        scope
            .exports()
            .set("a_seen", a.get("a").unwrap_or(Value::Null));
        *captured.lock().unwrap() = Some(a);
        scope.exports().set("b", json!(2));
        Ok(())
    });

    let a = loader.import("./a.js", Some(APP)).await.unwrap();
    let b = loader.module(&app("b.js")).unwrap();

    // b ran first and saw a's exposure before a filled it in
    assert_eq!(b.get("a_seen"), Some(Value::Null));
    assert_eq!(a.get("b_seen"), Some(json!(2)));
    assert!(early.lock().unwrap().as_ref().unwrap().ptr_eq(&a));

    assert_eq!(fetcher.fetch_count(&app("a.js")), 1);
    assert_eq!(fetcher.fetch_count(&app("b.js")), 1);
    assert_eq!(fetcher.total_fetches(), 2);
}

#[tokio::test]
async fn test_import_order_is_first_seen() {
    let fetcher = common::fetcher(&[
        (
            "main.js",
            "require('./b');\nrequire('./a');\nrequire('./b');\nrequire('./c');",
        ),
        ("a.js", ""),
        ("b.js", ""),
        ("c.js", ""),
    ]);
    let (loader, _) = common::loader(&fetcher);
    let main = loader.discover("./main.js", Some(APP)).await.unwrap();

    assert_eq!(main.import_list(), vec!["./b", "./a", "./c"]);
    let keys: Vec<String> = main
        .import_table()
        .into_iter()
        .map(|(_, record)| record.key())
        .collect();
    assert_eq!(keys, vec![app("b.js"), app("a.js"), app("c.js")]);
    assert_eq!(main.deep_deps().len(), 4);
}

#[tokio::test]
async fn test_fetch_failure_is_cached() {
    let fetcher = common::fetcher(&[("main.js", "require('./missing');")]);
    let (loader, _) = common::loader(&fetcher);

    let err = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert!(matches!(
        err.root_cause(),
        LoaderError::Fetch {
            status: Some(404),
            ..
        }
    ));
    let main = app("main.js");
    assert_eq!(err.import_path(), vec![("./missing", main.as_str())]);

    let again = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert_eq!(again.to_string(), err.to_string());
    assert_eq!(fetcher.fetch_count(&app("missing.js")), 1);

    let missing = loader.record(&app("missing.js")).unwrap();
    assert!(missing.load_error().is_some());
}

#[tokio::test]
async fn test_error_reports_import_chain() {
    let fetcher = common::fetcher(&[
        ("main.js", "require('./a');"),
        ("a.js", "require('./b.json');"),
        ("b.json", "{ not json"),
    ]);
    let (loader, _) = common::loader(&fetcher);

    let err = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert!(matches!(err.root_cause(), LoaderError::Translation { .. }));

    let (a, main) = (app("a.js"), app("main.js"));
    assert_eq!(
        err.import_path(),
        vec![("./b.json", a.as_str()), ("./a", main.as_str())]
    );
}

/// Fails translation of every address ending in `suffix`
#[derive(Debug)]
struct RejectTranslation {
    suffix: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for RejectTranslation {
    fn name(&self) -> &str {
        "reject"
    }

    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let address = record.key();
        if !address.ends_with(self.suffix) {
            return next.translate(record).await;
        }
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LoaderError::translation(address, "js", "syntax error"))
    }
}

#[tokio::test]
async fn test_translate_failure_is_cached_with_chain() {
    let fetcher = common::fetcher(&[
        ("main.js", "require('./mid');"),
        ("mid.js", "require('./leaf');"),
        ("leaf.js", "exports.leaf = true;"),
    ]);
    let calls = Arc::new(AtomicUsize::new(0));
    let loader = spacey_loader::Loader::builder()
        .fetcher(fetcher.clone())
        .middleware(Arc::new(RejectTranslation {
            suffix: "leaf.js",
            calls: calls.clone(),
        }))
        .build()
        .unwrap();

    let err = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert!(matches!(err.root_cause(), LoaderError::Translation { .. }));
    let (mid, main) = (app("mid.js"), app("main.js"));
    assert_eq!(
        err.import_path(),
        vec![("./leaf", mid.as_str()), ("./mid", main.as_str())]
    );
    assert!(err.to_string().contains("./mid"));

    let leaf = loader.record(&app("leaf.js")).unwrap();
    assert!(matches!(
        leaf.load_error(),
        Some(LoaderError::Translation { .. })
    ));

    // The stored failure is reported again without running translate
    let again = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert_eq!(again.to_string(), err.to_string());
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Importing from the middle reports the shorter chain
    let from_mid = loader.import("./mid.js", Some(APP)).await.unwrap_err();
    assert_eq!(from_mid.import_path(), vec![("./leaf", mid.as_str())]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(loader.module(&main).is_none());
}

#[tokio::test]
async fn test_bare_specifier_cycle() {
    let fetcher = common::fetcher(&[
        ("root.js", "require(\"a\");\nexports.root = 1;"),
        ("a.js", "require(\"root\");\nexports.a = 2;"),
    ]);
    let (loader, modules) = common::loader(&fetcher);

    modules.define(app("root.js"), |scope| {
        scope.require("a")?;
        scope.exports().set("root", json!(1));
        Ok(())
    });
    modules.define(app("a.js"), |scope| {
        scope.require("root")?;
        scope.exports().set("a", json!(2));
        Ok(())
    });

    let root = loader.import("./root.js", Some(APP)).await.unwrap();
    let a = loader.module(&app("a.js")).unwrap();

    assert!(root.snapshot().is_object());
    assert!(a.snapshot().is_object());
    assert_eq!(root.get("root"), Some(json!(1)));
    assert_eq!(a.get("a"), Some(json!(2)));

    let record = loader.record(&app("root.js")).unwrap();
    assert_eq!(record.dependency("a").unwrap().key(), app("a.js"));
    let dependency = loader.record(&app("a.js")).unwrap();
    assert_eq!(dependency.dependency("root").unwrap().id(), record.id());
    assert_eq!(fetcher.total_fetches(), 2);
}

#[tokio::test]
async fn test_instantiation_failure_is_cached() {
    let fetcher = common::fetcher(&[("main.js", "exports.x = 1;")]);
    let (loader, modules) = common::loader(&fetcher);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    modules.define(app("main.js"), move |scope| {
        counter.fetch_add(1, Ordering::SeqCst);
        Err(LoaderError::instantiation(scope.address(), "boom"))
    });

    let first = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert!(matches!(first, LoaderError::Instantiation { .. }));

    let second = loader.import("./main.js", Some(APP)).await.unwrap_err();
    assert_eq!(second.to_string(), first.to_string());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(loader.module(&app("main.js")).is_none());
}

#[tokio::test]
async fn test_fetch_redirect_rekeys_record() {
    let fetcher = Arc::new(
        MemoryFetcher::new().with_file("https://cdn.test/lib@2.0.0/index.js", "exports.v = 2;"),
    );
    fetcher.redirect("https://cdn.test/lib.js", "https://cdn.test/lib@2.0.0/index.js");
    let (loader, _) = common::loader(&fetcher);

    let exports = loader.import("https://cdn.test/lib.js", None).await.unwrap();

    let requested = loader.record("https://cdn.test/lib.js").unwrap();
    let fetched = loader.record("https://cdn.test/lib@2.0.0/index.js").unwrap();
    assert_eq!(requested.id(), fetched.id());
    assert_eq!(requested.key(), "https://cdn.test/lib@2.0.0/index.js");
    assert!(
        loader
            .module("https://cdn.test/lib@2.0.0/index.js")
            .unwrap()
            .ptr_eq(&exports)
    );

    let again = loader.import("https://cdn.test/lib.js", None).await.unwrap();
    assert!(again.ptr_eq(&exports));
    assert_eq!(fetcher.total_fetches(), 1);
}

#[tokio::test]
async fn test_redirect_onto_loaded_address_keeps_both() {
    let target = "https://cdn.test/lib@2.0.0/index.js";
    let fetcher = Arc::new(MemoryFetcher::new().with_file(target, "exports.v = 2;"));
    fetcher.redirect("https://cdn.test/lib.js", target);
    let (loader, _) = common::loader(&fetcher);

    let direct = loader.import(target, None).await.unwrap();
    let original = loader.record(target).unwrap();

    let redirected = loader.import("https://cdn.test/lib.js", None).await.unwrap();
    let requested = loader.record("https://cdn.test/lib.js").unwrap();

    assert_eq!(loader.record(target).unwrap().id(), original.id());
    assert_ne!(requested.id(), original.id());
    assert_eq!(requested.key(), target);
    assert!(!redirected.ptr_eq(&direct));
    // The directly loaded module keeps its registry entry
    assert!(loader.module(target).unwrap().ptr_eq(&direct));
    assert_eq!(fetcher.total_fetches(), 2);
}

#[tokio::test]
async fn test_package_main_and_aliases() {
    let fetcher = common::fetcher(&[
        ("main.js", "require('lib');"),
        (
            "node_modules/lib/package.json",
            r#"{
                "name": "lib",
                "version": "1.2.0",
                "main": "main.js",
                "browser": { "./server.js": "./client.js", "fs": false }
            }"#,
        ),
        (
            "node_modules/lib/main.js",
            "require('./server.js');\nrequire('fs');",
        ),
        ("node_modules/lib/client.js", "exports.client = true;"),
    ]);
    let (loader, _) = common::loader(&fetcher);
    loader.import("./main.js", Some(APP)).await.unwrap();

    let lib = loader.record(&app("node_modules/lib/main.js")).unwrap();
    let package = lib.package().unwrap();
    assert_eq!(package.name, "lib");
    assert_eq!(package.version, "1.2.0");

    assert_eq!(
        lib.dependency("./server.js").unwrap().key(),
        app("node_modules/lib/client.js")
    );
    let empty = lib.dependency("fs").unwrap();
    assert_eq!(empty.key(), "spacey:@empty");
    assert_eq!(empty.origin(), Origin::Inline);
    assert!(loader.packages().package_by_name("lib").is_some());
}

#[tokio::test]
async fn test_json_and_css_exports() {
    let fetcher = common::fetcher(&[
        ("data.json", r#"{ "name": "spacey", "tags": [1, 2] }"#),
        ("style.css", "@import 'base.css';\nbody { color: red; }"),
        ("base.css", "html { margin: 0; }"),
    ]);
    let (loader, _) = common::loader(&fetcher);

    let data = loader.import("./data.json", Some(APP)).await.unwrap();
    assert_eq!(data.get("name"), Some(json!("spacey")));
    assert_eq!(data.get("tags"), Some(json!([1, 2])));

    let style = loader.import("./style.css", Some(APP)).await.unwrap();
    assert_eq!(
        style.snapshot(),
        json!("@import 'base.css';\nbody { color: red; }")
    );
    let record = loader.record(&app("style.css")).unwrap();
    assert_eq!(record.import_list(), vec!["./base.css"]);
    assert!(loader.module(&app("base.css")).is_some());
}

#[tokio::test]
async fn test_html_inline_scripts() {
    let fetcher = common::fetcher(&[
        (
            "index.html",
            "<html>\n<script src=\"app.js\"></script>\n<script>\nvar inline = true;\n</script>\n</html>",
        ),
        ("app.js", "exports.app = true;"),
    ]);
    let (loader, _) = common::loader(&fetcher);

    let page = loader.import("./index.html", Some(APP)).await.unwrap();
    let inline = format!("{}#0", app("index.html"));
    assert_eq!(page.snapshot(), json!({ "scripts": ["./app.js", inline.as_str()] }));

    let record = loader.record(&app("index.html")).unwrap();
    let children = record.children();
    assert_eq!(children.len(), 1);
    assert_eq!(children[0].key(), inline);
    assert_eq!(children[0].origin(), Origin::Inline);
    assert_eq!(children[0].parent().unwrap().id(), record.id());
    assert_eq!(children[0].format().as_deref(), Some("js"));

    // Only the page and the external script are fetched
    assert_eq!(fetcher.total_fetches(), 2);
}

/// Turns stylesheets into CommonJS modules and hands them to the `js` chain
#[derive(Debug)]
struct StyleModule {
    translated: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for StyleModule {
    fn name(&self) -> &str {
        "css"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let css = record.source().unwrap_or_default();
        record.set_source(format!("module.exports = {};", serde_json::to_string(&css)?));
        next.loader().reformat(record, "js")
    }

    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        self.translated.fetch_add(1, Ordering::SeqCst);
        next.translate(record).await
    }
}

/// Script handler counting its translations
#[derive(Debug)]
struct CountingScripts {
    translated: Arc<AtomicUsize>,
}

#[async_trait]
impl Plugin for CountingScripts {
    fn name(&self) -> &str {
        "js"
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        record.set_format("cjs");
        next.analyze(record).await
    }

    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        self.translated.fetch_add(1, Ordering::SeqCst);
        next.translate(record).await
    }
}

#[tokio::test]
async fn test_format_redirect_translates_with_new_chain() {
    let fetcher = common::fetcher(&[("theme.css", "body { color: red; }")]);
    let css_translated = Arc::new(AtomicUsize::new(0));
    let js_translated = Arc::new(AtomicUsize::new(0));

    let (css_count, js_count) = (css_translated.clone(), js_translated.clone());
    let loader = spacey_loader::Loader::builder()
        .fetcher(fetcher.clone())
        .plugin("css", move |_| {
            Arc::new(StyleModule {
                translated: css_count.clone(),
            }) as Arc<dyn Plugin>
        })
        .plugin("js", move |_| {
            Arc::new(CountingScripts {
                translated: js_count.clone(),
            }) as Arc<dyn Plugin>
        })
        .build()
        .unwrap();

    loader.import("./theme.css", Some(APP)).await.unwrap();

    let record = loader.record(&app("theme.css")).unwrap();
    assert_eq!(record.format().as_deref(), Some("cjs"));
    assert_eq!(record.plugins().names(), vec!["js", "base"]);
    assert!(record.source().unwrap().starts_with("module.exports = "));
    assert_eq!(css_translated.load(Ordering::SeqCst), 0);
    assert_eq!(js_translated.load(Ordering::SeqCst), 1);
}

/// Hands every record to `target` during analyze
#[derive(Debug)]
struct Bounce {
    name: &'static str,
    target: &'static str,
}

#[async_trait]
impl Plugin for Bounce {
    fn name(&self) -> &str {
        self.name
    }

    async fn analyze(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        next.loader().reformat(record, self.target)
    }
}

#[tokio::test]
async fn test_format_redirect_loop_is_an_error() {
    let fetcher = common::fetcher(&[("x.ping", "")]);
    let mut config = LoaderConfig::default();
    config.formats.insert("ping".to_string(), "ping".to_string());

    let loader = spacey_loader::Loader::builder()
        .config(config)
        .fetcher(fetcher.clone())
        .plugin("ping", |_| {
            Arc::new(Bounce {
                name: "ping",
                target: "pong",
            }) as Arc<dyn Plugin>
        })
        .plugin("pong", |_| {
            Arc::new(Bounce {
                name: "pong",
                target: "ping",
            }) as Arc<dyn Plugin>
        })
        .build()
        .unwrap();

    let err = loader.import("./x.ping", Some(APP)).await.unwrap_err();
    match err.root_cause() {
        LoaderError::FormatRedirectLoop { address, count, .. } => {
            assert_eq!(address, &app("x.ping"));
            assert_eq!(*count, loader.config().max_format_redirects + 1);
        }
        other => panic!("unexpected error: {}", other),
    }
}

#[tokio::test]
async fn test_translation_cache_shared_across_loaders() {
    let files = [
        (
            "lib.ts",
            "import type { Options } from './types';\nimport { helper } from './helper';\nexport const value: number = helper();",
        ),
        ("helper.ts", "export function helper() { return 1; }"),
    ];
    let cache = TranslationCache::new();

    let first_fetcher = common::fetcher(&files);
    let first = spacey_loader::Loader::builder()
        .fetcher(first_fetcher.clone())
        .middleware(cache.clone())
        .build()
        .unwrap();
    first.import("./lib.ts", Some(APP)).await.unwrap();
    assert_eq!(cache.len(), 2);
    assert_eq!(cache.hits(), 0);

    let second_fetcher = common::fetcher(&files);
    let second = spacey_loader::Loader::builder()
        .fetcher(second_fetcher.clone())
        .middleware(cache.clone())
        .build()
        .unwrap();
    second.import("./lib.ts", Some(APP)).await.unwrap();
    assert_eq!(cache.hits(), 2);

    let lib = second.record(&app("lib.ts")).unwrap();
    assert_eq!(lib.format().as_deref(), Some("esm"));
    assert!(!lib.source().unwrap().contains("import type"));
    assert_eq!(
        second.format_plugins(&lib),
        vec!["ts".to_string()],
        "middleware is not a format plugin"
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_typescript_translated_on_workers() {
    let fetcher = common::fetcher(&[
        (
            "main.ts",
            "import type { Config } from './config';\nimport { run } from './run';\nexport default run;",
        ),
        ("run.ts", "export function run(): void {}"),
    ]);
    let config = LoaderConfig {
        worker_threads: 2,
        ..LoaderConfig::default()
    };
    let (loader, _) = common::loader_with(&fetcher, config);
    assert_eq!(loader.workers().unwrap().threads(), 2);

    loader.import("./main.ts", Some(APP)).await.unwrap();

    let main = loader.record(&app("main.ts")).unwrap();
    assert_eq!(main.format().as_deref(), Some("esm"));
    assert_eq!(main.translated_format().as_deref(), Some("esm"));
    assert!(!main.source().unwrap().contains("import type"));
    assert_eq!(main.import_list(), vec!["./run"]);
    assert_eq!(loader.workers().unwrap().outstanding(), 0);
}

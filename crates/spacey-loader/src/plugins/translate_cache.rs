// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! Translation cache middleware
//!
//! Sits above the format plugins. On `translate` it looks up the record's
//! address and source hash; a hit restores the cached output and skips the
//! rest of the chain. Misses are stored when the loader runs the `cache`
//! stage after a successful translate.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, trace};

use crate::error::Result;
use crate::plugin::{Next, Plugin};
use crate::record::Record;

/// Name the middleware registers under
pub const TRANSLATE_CACHE: &str = "translate-cache";

#[derive(Debug, Clone)]
struct CachedTranslation {
    source: String,
    format: String,
}

/// Translation results keyed by address and source hash
///
/// One instance may be shared by several loaders.
#[derive(Debug, Default)]
pub struct TranslationCache {
    entries: DashMap<(String, u64), CachedTranslation>,
    pending: DashMap<String, u64>,
    hits: AtomicUsize,
}

impl TranslationCache {
    /// Create an empty cache
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of cached translations
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is cached
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of translations served from the cache
    pub fn hits(&self) -> usize {
        self.hits.load(Ordering::Relaxed)
    }

    fn hash(source: &str) -> u64 {
        let mut hasher = DefaultHasher::new();
        source.hash(&mut hasher);
        hasher.finish()
    }
}

#[async_trait]
impl Plugin for TranslationCache {
    fn name(&self) -> &str {
        TRANSLATE_CACHE
    }

    async fn translate(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let key = record.key();
        let hash = Self::hash(&record.source().unwrap_or_default());

        let cached = self
            .entries
            .get(&(key.clone(), hash))
            .map(|entry| entry.value().clone());
        if let Some(cached) = cached {
            trace!("translation cache hit for {}", key);
            self.hits.fetch_add(1, Ordering::Relaxed);
            record.set_source(cached.source);
            record.set_format(cached.format);
            return Ok(());
        }

        self.pending.insert(key, hash);
        next.translate(record).await
    }

    async fn cache(&self, record: &Arc<Record>, next: Next<'_>) -> Result<()> {
        let key = record.key();
        if let Some((_, hash)) = self.pending.remove(&key) {
            debug!("caching translation of {}", key);
            self.entries.insert(
                (key, hash),
                CachedTranslation {
                    source: record.source().unwrap_or_default(),
                    format: record.format().unwrap_or_default(),
                },
            );
        }
        next.cache(record).await
    }
}

//! Response Cache
//!
//! Identical stage calls arriving within a short window are answered from
//! memory instead of reaching a backend again. A call is identical when its
//! task kind, stage kind, output check and payload all match; which backend
//! served the first call does not matter.
//!
//! # Bounds
//!
//! - Entries older than `ttl` are never served
//! - Once the cache grows past `max_entries`, expired entries are pruned,
//!   then the oldest live entries until the bound holds again

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::job::{OutputCheck, Stage, StageKind, TaskKind};

/// TTL and size bound of the response cache
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheConfig {
    pub ttl: Duration,
    pub max_entries: usize,
}

impl CacheConfig {
    #[must_use]
    pub fn new(ttl: Duration, max_entries: usize) -> Self {
        Self { ttl, max_entries }
    }
}

/// Identity of a stage call, independent of the backend that serves it
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct CacheKey {
    task_kind: TaskKind,
    stage: StageKind,
    check: OutputCheck,
    payload: String,
}

impl CacheKey {
    #[must_use]
    pub fn new(task_kind: TaskKind, stage: &Stage) -> Self {
        Self {
            task_kind,
            stage: stage.kind,
            check: stage.output_check,
            payload: stage.payload.to_string(),
        }
    }
}

/// A response that passed its output check
#[derive(Clone, Debug, PartialEq)]
pub struct CachedResponse {
    pub content: String,
    pub backend_id: String,
}

#[derive(Debug)]
struct Entry {
    response: CachedResponse,
    stored_at: Instant,
}

#[derive(Debug)]
pub struct ResponseCache {
    config: CacheConfig,
    entries: Mutex<HashMap<CacheKey, Entry>>,
    hits: AtomicU64,
}

impl ResponseCache {
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    /// Live response for the key, dropping it if it has expired
    pub fn get(&self, key: &CacheKey) -> Option<CachedResponse> {
        let mut entries = self.entries.lock();
        let fresh = entries
            .get(key)
            .map(|entry| entry.stored_at.elapsed() < self.config.ttl)?;
        if !fresh {
            entries.remove(key);
            return None;
        }
        self.hits.fetch_add(1, Ordering::Relaxed);
        entries.get(key).map(|entry| entry.response.clone())
    }

    pub fn insert(&self, key: CacheKey, response: CachedResponse) {
        let mut entries = self.entries.lock();
        entries.insert(
            key,
            Entry {
                response,
                stored_at: Instant::now(),
            },
        );

        if entries.len() > self.config.max_entries {
            let ttl = self.config.ttl;
            entries.retain(|_, entry| entry.stored_at.elapsed() < ttl);
        }
        while entries.len() > self.config.max_entries {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.stored_at)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => {
                    entries.remove(&key);
                }
                None => break,
            }
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    #[must_use]
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }
}

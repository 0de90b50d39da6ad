//! # Repository Facade
//!
//! `Repository` wires the pieces together: the layering configuration,
//! one [`DoubleFileStorage`] per layer, the shared [`RepositoryCache`] and
//! the [`MemoryBudget`]. It is the type consumers hold; everything below
//! it is dependency-injected rather than ambient, so "one cache per
//! repository" is a construction-time fact instead of a global.
//!
//! ## Control Flow
//!
//! ```text
//! get(key)
//!   1. cache lookup (skipped for Behavior::NoCache keys)
//!   2. the key's own attached value, if any
//!   3. layer-ordered storage read; each layer's engine re-encodes the
//!      key through that layer's converters
//!   4. factory deserialization, cache install per the key's behavior,
//!      attach to the key
//!
//! put(key, value)
//!   factory serialization -> write-capable layer -> cache install
//! ```
//!
//! Reads consult layers in configuration order: the session's writable
//! layer typically comes after read-only base layers, so a record
//! rewritten this session shadows the base copy only once the base lookup
//! misses - order the layers accordingly when newer-wins semantics are
//! wanted (writable layer first).
//!
//! ## Lifecycle
//!
//! Open through [`Repository::builder`]; the instance lives for the
//! process's repository session. `close()` (or drop) syncs every layer.
//! Maintenance is expected to run from a dedicated background task via
//! [`Repository::maintenance`], never from a thread that also needs
//! low-latency reads.

use std::io::Write as IoWrite;
use std::sync::Arc;
use std::time::Instant;

use eyre::{bail, Result};

use crate::cache::RepositoryCache;
use crate::key::{Behavior, Key, Persistent};
use crate::layering::LayeringSupport;
use crate::memory::{BudgetStats, MemoryBudget};
use crate::storage::{DoubleFileStorage, StorageStats};

mod builder;

pub use builder::RepositoryBuilder;

/// Point-in-time snapshot of a repository's state, for diagnostics.
#[derive(Debug, Clone)]
pub struct RepositoryStats {
    pub layers: Vec<StorageStats>,
    pub cache_entries: usize,
    pub cache_pinned: usize,
    pub cache_memory: usize,
    pub budget: BudgetStats,
}

/// A persistent object repository: layered on-disk storage fronted by a
/// pinned/reclaimable in-memory cache.
pub struct Repository {
    pub(crate) layering: Arc<LayeringSupport>,
    pub(crate) layers: Vec<DoubleFileStorage>,
    pub(crate) cache: RepositoryCache,
    pub(crate) budget: Arc<MemoryBudget>,
    pub(crate) write_layer: Option<usize>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("layers", &self.layers.len())
            .field("write_layer", &self.write_layer)
            .finish_non_exhaustive()
    }
}

impl Repository {
    pub fn builder() -> RepositoryBuilder {
        RepositoryBuilder::new()
    }

    /// Resolves `key`: cache first, then the key's attached value, then
    /// layer storage in configuration order. A storage hit is
    /// deserialized through the key's factory and installed per the key's
    /// behavior; racing readers of the same key converge on one value.
    pub fn get(&self, key: &Key) -> Result<Option<Arc<dyn Persistent>>> {
        let behavior = key.behavior();

        if behavior != Behavior::NoCache {
            if let Some(value) = self.cache.get(key) {
                return Ok(Some(value));
            }
            if let Some(value) = key.cached_value() {
                return Ok(Some(value));
            }
        }

        for storage in &self.layers {
            let Some(bytes) = storage.read(key)? else {
                continue;
            };

            let value = key.factory().read(&bytes)?;
            let value = match behavior {
                Behavior::NoCache => value,
                Behavior::AlwaysPin => {
                    self.cache.hang(key, Arc::clone(&value));
                    value
                }
                Behavior::Default => self.cache.put_if_absent(key, value),
            };
            if behavior != Behavior::NoCache {
                key.attach_cache(Arc::clone(&value));
            }
            return Ok(Some(value));
        }

        Ok(None)
    }

    /// Serializes `value` through the key's factory, writes it to the
    /// write-capable layer, and installs it in the cache per the key's
    /// behavior.
    pub fn put(&self, key: &Key, value: Arc<dyn Persistent>) -> Result<()> {
        let Some(write_layer) = self.write_layer else {
            bail!("repository has no write-capable layer");
        };

        let mut bytes = Vec::new();
        key.factory().write(value.as_ref(), &mut bytes)?;
        self.layers[write_layer].write(key, &bytes)?;

        match key.behavior() {
            Behavior::NoCache => {}
            Behavior::AlwaysPin => {
                self.cache.hang(key, Arc::clone(&value));
                key.attach_cache(value);
            }
            Behavior::Default => {
                self.cache.put(key, Arc::clone(&value));
                key.attach_cache(value);
            }
        }

        Ok(())
    }

    /// Removes the record from the write-capable layer and the cache. A
    /// copy in a read-only base layer stays readable - read-only layers
    /// are exactly that.
    pub fn remove(&self, key: &Key) -> Result<()> {
        let Some(write_layer) = self.write_layer else {
            bail!("repository has no write-capable layer");
        };

        self.layers[write_layer].remove(key)?;
        self.cache.remove(key);
        key.detach_cache();
        Ok(())
    }

    /// Drops every reclaimable cache entry (the explicit memory-pressure
    /// response); pinned entries stay.
    pub fn clear_soft_refs(&self) {
        self.cache.clear_soft_refs();
    }

    /// Runs storage maintenance across the layers. A budget of 0 compacts
    /// every layer to zero fragmentation; a positive budget is wall-clock
    /// milliseconds shared across layers in configuration order. Returns
    /// the number of records relocated.
    pub fn maintenance(&self, time_budget_millis: u64) -> Result<u64> {
        let started = Instant::now();
        let mut relocated = 0;

        for storage in &self.layers {
            let slice = if time_budget_millis == 0 {
                0
            } else {
                let spent = started.elapsed().as_millis() as u64;
                if spent >= time_budget_millis {
                    break;
                }
                time_budget_millis - spent
            };
            relocated += storage.maintenance(slice)?;
        }

        Ok(relocated)
    }

    pub fn layering(&self) -> &Arc<LayeringSupport> {
        &self.layering
    }

    pub fn cache(&self) -> &RepositoryCache {
        &self.cache
    }

    pub fn budget(&self) -> &Arc<MemoryBudget> {
        &self.budget
    }

    /// Direct access to one layer's storage engine, mainly for
    /// maintenance schedulers that want per-layer fragmentation numbers.
    pub fn layer_storage(&self, layer: usize) -> &DoubleFileStorage {
        &self.layers[layer]
    }

    pub fn stats(&self) -> RepositoryStats {
        RepositoryStats {
            layers: self.layers.iter().map(|s| s.stats()).collect(),
            cache_entries: self.cache.len(),
            cache_pinned: self.cache.pinned_len(),
            cache_memory: self.cache.memory_used(),
            budget: self.budget.stats(),
        }
    }

    /// Writes a layout report for every layer plus cache and budget
    /// counters. Diagnostic only.
    pub fn dump_summary(&self, out: &mut dyn IoWrite) -> Result<()> {
        for (i, storage) in self.layers.iter().enumerate() {
            writeln!(out, "layer {}: {}", i, self.layering.descriptor(i))?;
            storage.dump_summary(out)?;
        }
        writeln!(
            out,
            "cache: entries={} pinned={} memory={}",
            self.cache.len(),
            self.cache.pinned_len(),
            self.cache.memory_used()
        )?;
        writeln!(out, "budget: {}", self.budget.stats())?;
        Ok(())
    }

    /// Flushes every layer to disk.
    pub fn sync(&self) -> Result<()> {
        for storage in &self.layers {
            storage.sync()?;
        }
        Ok(())
    }

    /// Syncs and releases the repository, reporting close-time I/O errors
    /// (drop syncs best-effort and cannot).
    pub fn close(mut self) -> Result<()> {
        for storage in self.layers.drain(..) {
            storage.close()?;
        }
        Ok(())
    }
}

//! # Repository Cache
//!
//! The concurrent in-memory front end over layer storage: a map from
//! [`Key`] to [`Persistent`] shared by every worker thread of a
//! repository. The cache is a pure in-memory layer - a miss never falls
//! through to storage; that is the owner's job, because only the owner
//! knows which layers to consult and how to deserialize.
//!
//! ## Pinned vs. Reclaimable
//!
//! Entries live in one of two retention tiers:
//!
//! - **reclaimable** (installed by `put`/`put_if_absent`): the cache may
//!   drop these in response to memory pressure - explicitly via
//!   [`RepositoryCache::clear_soft_refs`], or internally when an install
//!   cannot fit the memory budget
//! - **pinned** (installed by `hang`): guaranteed to survive every
//!   `clear_soft_refs` and every budget eviction; only `remove` or a
//!   subsequent `put`/`put_if_absent` displaces a pinned entry
//!
//! There is no GC-visibility magic here: what counts as reclaimable is
//! explicit application state, and eviction happens only at the points
//! above.
//!
//! ## Lock Sharding
//!
//! A single lock over the whole map would serialize unrelated keys. The
//! cache uses [`crate::config::CACHE_SHARD_COUNT`] independent shards,
//! each behind its own `parking_lot::RwLock`; a key's shard is derived
//! from its context hash, so operations on different keys almost never
//! contend and an operation on one key holds its shard's lock only for
//! the single slot transition.
//!
//! ```text
//! RepositoryCache
//! ├── Shard 0:  RwLock<HashMap<KeySlot, Entry>>
//! ├── Shard 1:  RwLock<HashMap<KeySlot, Entry>>
//! ├── ...
//! └── Shard 63: RwLock<HashMap<KeySlot, Entry>>
//! ```
//!
//! ## Key Identity
//!
//! Keys compare via their context-parameterized equality under the client
//! numbering (`hash_with`/`equals_in_context` with each key's own unit
//! id); the private `KeySlot` wrapper supplies the `Hash`/`Eq` bridge the
//! map needs.
//!
//! ## Race Semantics
//!
//! `put_if_absent` is the one cross-thread ordering primitive: exactly one
//! of racing installers wins, and every caller gets the winning value
//! back. Plain `put` is last-write-wins; `get` observes either a fully
//! installed value or nothing.
//!
//! ## Memory Budget
//!
//! With a budget attached, reclaimable entries are charged to the Cache
//! pool and evicted to make room when an install would exceed it. Pinned
//! entries are charged to the Pinned pool but never refused: pin
//! durability is an API guarantee, so overflow is surfaced through
//! [`crate::memory::BudgetStats`] instead.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{CACHE_ENTRY_OVERHEAD, CACHE_SHARD_COUNT};
use crate::key::{Key, Persistent};
use crate::memory::{MemoryBudget, Pool};

/// Hash/Eq bridge: keys compare under the client numbering using their own
/// unit ids as the context.
struct KeySlot(Key);

impl Hash for KeySlot {
    fn hash<H: Hasher>(&self, state: &mut H) {
        state.write_u64(self.0.hash_with(self.0.unit()));
    }
}

impl PartialEq for KeySlot {
    fn eq(&self, other: &Self) -> bool {
        self.0
            .equals_in_context(self.0.unit(), &other.0, other.0.unit())
    }
}

impl Eq for KeySlot {}

struct Entry {
    value: Arc<dyn Persistent>,
    pinned: bool,
    charged: usize,
}

impl Entry {
    fn pool(&self) -> Pool {
        if self.pinned {
            Pool::Pinned
        } else {
            Pool::Cache
        }
    }
}

type CacheShard = HashMap<KeySlot, Entry>;

/// Process-wide (per repository) object cache with pinned and reclaimable
/// retention tiers. All operations are individually thread-safe.
pub struct RepositoryCache {
    shards: Vec<RwLock<CacheShard>>,
    budget: Option<Arc<MemoryBudget>>,
}

impl RepositoryCache {
    pub fn new() -> Self {
        Self::with_budget(None)
    }

    pub fn with_budget(budget: Option<Arc<MemoryBudget>>) -> Self {
        let shards = (0..CACHE_SHARD_COUNT)
            .map(|_| RwLock::new(CacheShard::new()))
            .collect();
        Self { shards, budget }
    }

    fn shard(&self, key: &Key) -> &RwLock<CacheShard> {
        let hash = key.hash_with(key.unit()) as usize;
        &self.shards[hash & (CACHE_SHARD_COUNT - 1)]
    }

    fn footprint(value: &Arc<dyn Persistent>) -> usize {
        std::mem::size_of_val(value.as_ref()) + CACHE_ENTRY_OVERHEAD
    }

    /// Returns the cached value, if present and not yet reclaimed. Purely
    /// in-memory; never consults storage.
    pub fn get(&self, key: &Key) -> Option<Arc<dyn Persistent>> {
        let shard = self.shard(key).read();
        shard.get(&KeySlot(key.clone())).map(|e| e.value.clone())
    }

    /// Unconditionally installs `value` as a reclaimable entry, replacing
    /// any prior entry - pinned or not. `put` always wins the slot.
    pub fn put(&self, key: &Key, value: Arc<dyn Persistent>) {
        let bytes = Self::footprint(&value);
        let mut shard = self.shard(key).write();

        if let Some(old) = shard.remove(&KeySlot(key.clone())) {
            self.release(&old);
        }
        self.charge_reclaimable(&mut shard, bytes);
        shard.insert(
            KeySlot(key.clone()),
            Entry {
                value,
                pinned: false,
                charged: bytes,
            },
        );
    }

    /// Installs `value` only if no entry currently exists for `key`.
    /// Returns whichever value occupies the slot afterwards: racing
    /// callers all observe the same winner.
    pub fn put_if_absent(&self, key: &Key, value: Arc<dyn Persistent>) -> Arc<dyn Persistent> {
        let bytes = Self::footprint(&value);
        let mut shard = self.shard(key).write();

        if let Some(existing) = shard.get(&KeySlot(key.clone())) {
            return existing.value.clone();
        }

        self.charge_reclaimable(&mut shard, bytes);
        shard.insert(
            KeySlot(key.clone()),
            Entry {
                value: value.clone(),
                pinned: false,
                charged: bytes,
            },
        );
        value
    }

    /// Installs `value` as a pinned entry: it survives `clear_soft_refs`
    /// and budget eviction until explicitly removed or overwritten by
    /// `put`/`put_if_absent`.
    pub fn hang(&self, key: &Key, value: Arc<dyn Persistent>) {
        let bytes = Self::footprint(&value);
        let mut shard = self.shard(key).write();

        if let Some(old) = shard.remove(&KeySlot(key.clone())) {
            self.release(&old);
        }
        if let Some(budget) = &self.budget {
            // Pins are never refused; overflow is visible in the stats.
            budget.allocate_unchecked(Pool::Pinned, bytes);
        }
        shard.insert(
            KeySlot(key.clone()),
            Entry {
                value,
                pinned: true,
                charged: bytes,
            },
        );
    }

    /// Drops the entry regardless of its retention tier.
    pub fn remove(&self, key: &Key) -> Option<Arc<dyn Persistent>> {
        let mut shard = self.shard(key).write();
        let old = shard.remove(&KeySlot(key.clone()))?;
        self.release(&old);
        Some(old.value)
    }

    /// Drops every reclaimable entry; pinned entries are untouched. This
    /// is the explicit memory-pressure response.
    pub fn clear_soft_refs(&self) {
        for shard in &self.shards {
            let mut guard = shard.write();
            guard.retain(|_, entry| {
                if entry.pinned {
                    true
                } else {
                    self.release(entry);
                    false
                }
            });
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.read().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pinned_len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().filter(|e| e.pinned).count())
            .sum()
    }

    /// Approximate bytes charged for cached entries.
    pub fn memory_used(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.read().values().map(|e| e.charged).sum::<usize>())
            .sum()
    }

    pub fn budget(&self) -> Option<&Arc<MemoryBudget>> {
        self.budget.as_ref()
    }

    fn release(&self, entry: &Entry) {
        if let Some(budget) = &self.budget {
            budget.release(entry.pool(), entry.charged);
        }
    }

    /// Charges a reclaimable install against the budget, evicting
    /// reclaimable entries to make room when needed. The install itself
    /// never fails: if eviction cannot free enough (everything left is
    /// pinned, or other shards are contended), the overflow is recorded
    /// unconditionally and shows up in the budget stats.
    fn charge_reclaimable(&self, own: &mut CacheShard, bytes: usize) {
        let Some(budget) = &self.budget else {
            return;
        };

        if budget.try_allocate(Pool::Cache, bytes) {
            return;
        }

        if Self::evict_until(own, budget, bytes) {
            return;
        }

        for shard in &self.shards {
            // try_write: the own shard's lock is already held, and blocking
            // on a contended shard from inside an install invites lock
            // cycles.
            if let Some(mut guard) = shard.try_write() {
                if Self::evict_until(&mut guard, budget, bytes) {
                    return;
                }
            }
        }

        budget.allocate_unchecked(Pool::Cache, bytes);
    }

    /// Evicts reclaimable entries from `shard` until `bytes` can be
    /// allocated. Returns whether the allocation succeeded.
    fn evict_until(shard: &mut CacheShard, budget: &MemoryBudget, bytes: usize) -> bool {
        loop {
            if budget.try_allocate(Pool::Cache, bytes) {
                return true;
            }

            let victim = shard
                .iter()
                .find(|(_, entry)| !entry.pinned)
                .map(|(slot, _)| KeySlot(slot.0.clone()));
            let Some(victim) = victim else {
                return false;
            };

            if let Some(entry) = shard.remove(&victim) {
                budget.release(Pool::Cache, entry.charged);
            }
        }
    }
}

impl Default for RepositoryCache {
    fn default() -> Self {
        Self::new()
    }
}

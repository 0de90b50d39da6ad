//! # Memory Budget Implementation
//!
//! Core budget tracking and enforcement.
//!
//! ## Design Principles
//!
//! 1. **Reserved pools**: each cache tier has a guaranteed minimum
//! 2. **Shared overflow**: when a reserve is exhausted, the shared pool is
//!    used
//! 3. **Thread safety**: all counters use atomics for lock-free operation
//!
//! ## Pool Allocation Strategy
//!
//! When a tier requests memory:
//! 1. Check if the request fits in the tier's reserved pool
//! 2. If not, check if the overflow fits in the shared pool
//! 3. If neither, return a [`MemoryError`]
//!
//! ## Accounting Granularity
//!
//! Cache entries are charged as the value's in-memory size plus a fixed
//! per-entry overhead ([`crate::config::CACHE_ENTRY_OVERHEAD`]). Values are
//! opaque to the repository, so deep heap owned by a value (interned
//! strings, child vectors) is estimated by the caller's value sizes rather
//! than traversed; the goal is preventing runaway growth, not byte-exact
//! accounting.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::OnceLock;

use eyre::{bail, Result};
use sysinfo::System;

pub use crate::config::{
    CACHE_RESERVED, DEFAULT_BUDGET_PERCENT, MIN_BUDGET_FLOOR, PINNED_RESERVED, TOTAL_RESERVED,
};

static SYSTEM_TOTAL_MEMORY: OnceLock<usize> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pool {
    /// Reclaimable cache entries.
    Cache,
    /// Pinned cache entries.
    Pinned,
    /// Direct shared-pool allocations.
    Shared,
}

impl Pool {
    pub fn reserved_size(&self) -> usize {
        match self {
            Pool::Cache => CACHE_RESERVED,
            Pool::Pinned => PINNED_RESERVED,
            Pool::Shared => 0,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Pool::Cache => "cache",
            Pool::Pinned => "pinned",
            Pool::Shared => "shared",
        }
    }
}

#[derive(Debug, Clone)]
pub struct BudgetStats {
    pub total_limit: usize,
    pub total_used: usize,
    pub cache_used: usize,
    pub cache_reserved: usize,
    pub pinned_used: usize,
    pub pinned_reserved: usize,
    pub shared_used: usize,
    pub shared_available: usize,
}

impl BudgetStats {
    pub fn available(&self) -> usize {
        self.total_limit.saturating_sub(self.total_used)
    }

    pub fn utilization_percent(&self) -> f64 {
        if self.total_limit == 0 {
            return 0.0;
        }
        (self.total_used as f64 / self.total_limit as f64) * 100.0
    }
}

impl std::fmt::Display for BudgetStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cache:{}/{},pinned:{}/{},shared:{}/{}",
            self.cache_used,
            self.cache_reserved,
            self.pinned_used,
            self.pinned_reserved,
            self.shared_used,
            self.shared_available
        )
    }
}

#[derive(Debug)]
pub struct MemoryError {
    pub pool: Pool,
    pub requested: usize,
    pub available: usize,
}

impl std::fmt::Display for MemoryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "memory budget exceeded: {} pool requested {} bytes but only {} available",
            self.pool.name(),
            self.requested,
            self.available
        )
    }
}

impl std::error::Error for MemoryError {}

#[derive(Debug)]
pub struct MemoryBudget {
    total_limit: AtomicUsize,
    cache_used: AtomicUsize,
    pinned_used: AtomicUsize,
    shared_used: AtomicUsize,
}

impl MemoryBudget {
    pub fn auto_detect() -> Self {
        let total_memory = *SYSTEM_TOTAL_MEMORY.get_or_init(|| {
            let mut sys = System::new();
            sys.refresh_memory();
            sys.total_memory() as usize
        });

        let budget = (total_memory * DEFAULT_BUDGET_PERCENT) / 100;
        let budget = budget.max(MIN_BUDGET_FLOOR);

        Self::with_limit(budget)
    }

    pub fn with_limit(limit: usize) -> Self {
        let limit = limit.max(MIN_BUDGET_FLOOR);

        Self {
            total_limit: AtomicUsize::new(limit),
            cache_used: AtomicUsize::new(0),
            pinned_used: AtomicUsize::new(0),
            shared_used: AtomicUsize::new(0),
        }
    }

    pub fn total_limit(&self) -> usize {
        self.total_limit.load(Ordering::Acquire)
    }

    pub fn total_used(&self) -> usize {
        self.cache_used.load(Ordering::Acquire)
            + self.pinned_used.load(Ordering::Acquire)
            + self.shared_used.load(Ordering::Acquire)
    }

    pub fn available(&self, pool: Pool) -> usize {
        let pool_used = self.pool_used(pool);
        let reserved = pool.reserved_size();

        let reserved_available = reserved.saturating_sub(pool_used);
        let shared_available = self.shared_available();

        reserved_available + shared_available
    }

    pub fn shared_available(&self) -> usize {
        let total = self.total_limit();
        let used = self.total_used();
        let shared_pool_size = total.saturating_sub(TOTAL_RESERVED);

        shared_pool_size.saturating_sub(used.saturating_sub(TOTAL_RESERVED))
    }

    fn pool_used(&self, pool: Pool) -> usize {
        self.pool_counter(pool).load(Ordering::Acquire)
    }

    fn pool_counter(&self, pool: Pool) -> &AtomicUsize {
        match pool {
            Pool::Cache => &self.cache_used,
            Pool::Pinned => &self.pinned_used,
            Pool::Shared => &self.shared_used,
        }
    }

    pub fn can_allocate(&self, pool: Pool, bytes: usize) -> bool {
        self.available(pool) >= bytes
    }

    pub fn allocate(&self, pool: Pool, bytes: usize) -> Result<()> {
        if bytes == 0 {
            return Ok(());
        }

        let pool_counter = self.pool_counter(pool);
        let reserved = pool.reserved_size();

        loop {
            let current_pool_used = pool_counter.load(Ordering::Acquire);
            let current_total_used = self.total_used();
            let total_limit = self.total_limit();

            let new_pool_used = current_pool_used + bytes;
            let new_total_used = current_total_used + bytes;

            if new_total_used > total_limit {
                bail!(MemoryError {
                    pool,
                    requested: bytes,
                    available: total_limit.saturating_sub(current_total_used),
                });
            }

            if pool != Pool::Shared && new_pool_used > reserved {
                let overflow = new_pool_used - reserved;
                let shared_available = self.shared_available();

                if overflow > shared_available {
                    bail!(MemoryError {
                        pool,
                        requested: bytes,
                        available: reserved.saturating_sub(current_pool_used) + shared_available,
                    });
                }
            }

            match pool_counter.compare_exchange_weak(
                current_pool_used,
                new_pool_used,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(()),
                Err(_) => continue,
            }
        }
    }

    /// Unconditional accounting for allocations that must not fail (the
    /// pinned tier). The counter may exceed the pool's reserve; the
    /// overflow is visible in [`BudgetStats`].
    pub fn allocate_unchecked(&self, pool: Pool, bytes: usize) {
        if bytes == 0 {
            return;
        }
        self.pool_counter(pool).fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn release(&self, pool: Pool, bytes: usize) {
        if bytes == 0 {
            return;
        }

        let pool_counter = self.pool_counter(pool);

        loop {
            let current = pool_counter.load(Ordering::Acquire);
            let new_value = current.saturating_sub(bytes);

            match pool_counter.compare_exchange_weak(
                current,
                new_value,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(_) => continue,
            }
        }
    }

    pub fn try_allocate(&self, pool: Pool, bytes: usize) -> bool {
        self.allocate(pool, bytes).is_ok()
    }

    pub fn stats(&self) -> BudgetStats {
        let total_limit = self.total_limit();
        let cache_used = self.cache_used.load(Ordering::Acquire);
        let pinned_used = self.pinned_used.load(Ordering::Acquire);
        let shared_used = self.shared_used.load(Ordering::Acquire);
        let total_used = cache_used + pinned_used + shared_used;

        BudgetStats {
            total_limit,
            total_used,
            cache_used,
            cache_reserved: CACHE_RESERVED,
            pinned_used,
            pinned_reserved: PINNED_RESERVED,
            shared_used,
            shared_available: self.shared_available(),
        }
    }

    pub fn reset(&self) {
        self.cache_used.store(0, Ordering::Release);
        self.pinned_used.store(0, Ordering::Release);
        self.shared_used.store(0, Ordering::Release);
    }
}

impl Default for MemoryBudget {
    fn default() -> Self {
        Self::auto_detect()
    }
}

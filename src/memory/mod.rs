//! # Memory Budget Management
//!
//! This module provides memory budget tracking for the repository cache.
//! It bounds how much process memory the in-memory tiers may occupy, so a
//! repository embedded in a larger host (an IDE, an indexing service) does
//! not compete with the host for RAM.
//!
//! ## Architecture
//!
//! The budget uses a **reserved minimums + shared pool** model:
//!
//! ```text
//! +----------------------------------------------------------+
//! |                  Total Memory Budget                      |
//! |  (default: 25% of system RAM, minimum floor: 4 MB)        |
//! +----------------------------------------------------------+
//! |                                                           |
//! |  Reserved pools (guaranteed minimums):                    |
//! |  +----------------------+ +----------------------+        |
//! |  | Cache (reclaimable)  | | Pinned               |        |
//! |  | 512 KB               | | 256 KB               |        |
//! |  +----------------------+ +----------------------+        |
//! |                                                           |
//! |  Shared pool (remainder):                                 |
//! |  +-----------------------------------------------------+  |
//! |  | Available to either tier when its reserve is full   |  |
//! |  +-----------------------------------------------------+  |
//! |                                                           |
//! +----------------------------------------------------------+
//! ```
//!
//! ## Enforcement Model
//!
//! Accounting is hard for the reclaimable tier: when an install would
//! exceed the budget, the cache evicts reclaimable entries to make room.
//! The pinned tier is accounted but never refused - pin durability is an
//! API guarantee, so pinned installs proceed even when the pool reports
//! exhaustion (the overflow shows up in [`BudgetStats`] for the host to
//! act on).
//!
//! ## Thread Safety
//!
//! All counters are atomics; allocation uses a CAS loop and never blocks.

mod budget;

pub use budget::{
    BudgetStats, MemoryBudget, MemoryError, Pool, CACHE_RESERVED, DEFAULT_BUDGET_PERCENT,
    MIN_BUDGET_FLOOR, PINNED_RESERVED, TOTAL_RESERVED,
};

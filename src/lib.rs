//! # modelstore - Persistent Object Repository
//!
//! modelstore is the storage core for a large, incrementally-reparsed source
//! corpus: it stores and retrieves derived (parsed-model) objects that can
//! always be regenerated from source, so it is a cache-of-record rather than
//! a database. The design goals, in order:
//!
//! - **Survive restarts**: objects written in one process run are readable in
//!   the next, without a recovery pass that blocks startup
//! - **Bounded maintenance**: on-disk defragmentation runs in caller-supplied
//!   time slices and never makes fragmentation worse
//! - **Concurrent front end**: many reparse workers share one in-memory cache
//!   with explicit pinned vs. reclaimable retention tiers
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │            Public API (Repository)           │
//! ├──────────────────────────────────────────────┤
//! │   RepositoryCache (pinned / reclaimable)     │
//! ├───────────────────┬──────────────────────────┤
//! │  LayeringSupport  │  Key / PersistentFactory │
//! │  (unit/fs remap)  │  (identity + codec)      │
//! ├───────────────────┴──────────────────────────┤
//! │     DoubleFileStorage (one per layer)        │
//! ├──────────────────────────────────────────────┤
//! │     Memory-mapped file I/O + mem budget      │
//! └──────────────────────────────────────────────┘
//! ```
//!
//! ## Layers
//!
//! A logical repository is composed from one or more physical *layers*, each
//! independently built and independently numbered. A `LayeringSupport`
//! enumerates the layers and supplies per-layer `UnitsConverter`/`FsConverter`
//! pairs that translate between the repository-wide numbering space and each
//! layer's local numbering, so layers produced by different runs (or
//! machines) can be combined without renumbering their files.
//!
//! ## On-disk engine
//!
//! Each layer stores its records in exactly two backing files. Writes are
//! append-mostly with best-fit reuse of freed slots; overwrite churn leaves
//! gaps that the engine tracks as a fragmentation percentage. Maintenance
//! relocates live records into the other file in address order, one record
//! per lock acquisition, so reads and writes stay responsive while a
//! background task compacts the layer within a wall-clock budget.
//!
//! ## Quick start
//!
//! ```ignore
//! use modelstore::{Repository, LayerDescriptor, LayeringSupport};
//!
//! let layering = LayeringSupport::single(LayerDescriptor::writable("./repo-data"));
//! let repo = Repository::builder()
//!     .layering(layering)
//!     .memory_budget(64 * 1024 * 1024)
//!     .create(true)
//!     .open()?;
//!
//! repo.put(&key, value)?;
//! let v = repo.get(&key)?;
//! repo.maintenance(50)?; // compact for up to 50ms
//! ```
//!
//! ## Module overview
//!
//! - [`key`]: object identity (`Key`), value contracts (`Persistent`,
//!   `PersistentFactory`)
//! - [`layering`]: layer descriptors and unit/filesystem remapping
//! - [`storage`]: the two-file on-disk engine with sliced defragmentation
//! - [`cache`]: the concurrent pinned/reclaimable object cache
//! - [`memory`]: memory budget pools shared by the cache tiers
//! - [`repository`]: the facade wiring layers, cache and budget together

#[macro_use]
mod macros;

pub mod cache;
pub mod config;
pub mod key;
pub mod layering;
pub mod memory;
pub mod repository;
pub mod storage;

pub use cache::RepositoryCache;
pub use key::{Behavior, FsIndex, Key, KeyBuilder, Persistent, PersistentFactory, Segment, UnitId};
pub use layering::{
    ConverterPair, Direction, FsConverter, IdentityFsConverter, IdentityUnitsConverter,
    LayerDescriptor, LayeringSupport, MappedFsConverter, MappedUnitsConverter, UnitsConverter,
};
pub use memory::{BudgetStats, MemoryBudget, Pool};
pub use repository::{Repository, RepositoryBuilder, RepositoryStats};
pub use storage::{DoubleFileStorage, StorageStats};

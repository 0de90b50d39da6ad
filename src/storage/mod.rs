//! # Storage Module
//!
//! The on-disk engine for repository layers: durable record storage with
//! incremental, time-budgeted defragmentation.
//!
//! ## Architecture Overview
//!
//! Each layer owns exactly two backing files, memory-mapped for zero-copy
//! access. Records are variable-length chunks addressed through an
//! in-memory index that is rebuilt from the files themselves at open - the
//! chunk headers carry everything needed to replay the layer (key bytes,
//! lengths, a live/free flag, a sequence number, a payload checksum), so
//! there is no separate index file that could fall out of sync.
//!
//! ```text
//! layer_root/
//! ├── store.dfs0       ┐ exactly two backing files; at steady state one
//! └── store.dfs1       ┘ holds every record, the other is the relocation
//!                        target for defragmentation
//! ```
//!
//! ## Write Amplification vs. Fragmentation
//!
//! Writes are append-mostly: an overwrite allocates a new chunk (reusing a
//! freed one when a same-or-larger slot exists) and releases the old one.
//! This keeps every mutation crash-safe - the previous version of a record
//! is intact until the new chunk is fully on disk - at the price of
//! fragmentation under overwrite churn. The engine reports that cost as an
//! exact percentage and reclaims it with [`DoubleFileStorage::maintenance`],
//! which relocates records one at a time under its own lock so live
//! traffic keeps flowing.
//!
//! ## Module Organization
//!
//! - `mapped`: byte-granular memory-mapped file (`MappedFile`)
//! - `headers`: zerocopy file/chunk header layouts and validation
//! - `freelist`: best-fit free-slot tracking
//! - `double_file`: the engine itself (`DoubleFileStorage`)
//!
//! ## Thread Safety
//!
//! `DoubleFileStorage` is `Send + Sync`; all operations synchronize on one
//! internal `RwLock`. Reads share the lock; writes, removes and individual
//! maintenance relocation steps take it exclusively, each for a single
//! record's worth of work.

mod double_file;
mod freelist;
mod headers;
mod mapped;

pub use double_file::{DoubleFileStorage, StorageStats};

//! # Repository Builder
//!
//! Fluent configuration for opening a [`Repository`]: the layering
//! configuration, the memory budget, and whether missing write-layer
//! storage should be created.
//!
//! ## Usage
//!
//! ### Single writable layer with defaults:
//!
//! ```ignore
//! let repo = Repository::builder()
//!     .path("./repo-data")
//!     .create(true)
//!     .open()?;
//! ```
//!
//! ### Combined layers with explicit remapping:
//!
//! ```ignore
//! let layering = LayeringSupport::builder()
//!     .layer_with_converters(LayerDescriptor::read_only(base_uri), read, write)
//!     .layer(LayerDescriptor::writable(session_uri))
//!     .build()?;
//!
//! let repo = Repository::builder()
//!     .layering(layering)
//!     .memory_budget(64 * 1024 * 1024)
//!     .create(true)
//!     .open()?;
//! ```
//!
//! ## Creation Policy
//!
//! `create(true)` applies to write-capable layers only: a missing session
//! layer is a normal cold start and gets created, while a missing
//! read-only layer is a broken configuration (someone pointed the
//! repository at a base layer that is not there) and always fails.
//!
//! ## Memory Budget
//!
//! Without an explicit `memory_budget`, the budget is auto-detected as a
//! fraction of system RAM with a floor (see [`crate::memory`]).

use std::sync::Arc;

use eyre::{ensure, Result};

use crate::cache::RepositoryCache;
use crate::layering::{Direction, LayerDescriptor, LayeringSupport};
use crate::memory::MemoryBudget;
use crate::storage::DoubleFileStorage;

use super::Repository;

/// Builder for configuring and opening a [`Repository`].
pub struct RepositoryBuilder {
    layering: Option<Arc<LayeringSupport>>,
    path: Option<String>,
    memory_budget: Option<usize>,
    create: bool,
}

impl Default for RepositoryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RepositoryBuilder {
    pub fn new() -> Self {
        Self {
            layering: None,
            path: None,
            memory_budget: None,
            create: false,
        }
    }

    /// Shorthand for a single writable layer rooted at `path`. Ignored
    /// when an explicit layering configuration is supplied.
    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn layering(mut self, layering: Arc<LayeringSupport>) -> Self {
        self.layering = Some(layering);
        self
    }

    /// Explicit total memory budget in bytes for the cache tiers.
    pub fn memory_budget(mut self, bytes: usize) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    /// Whether missing storage for write-capable layers is created on
    /// open. Read-only layers must always exist.
    pub fn create(mut self, create: bool) -> Self {
        self.create = create;
        self
    }

    pub fn open(self) -> Result<Repository> {
        let layering = match (self.layering, self.path) {
            (Some(layering), _) => layering,
            (None, Some(path)) => LayeringSupport::builder()
                .layer(LayerDescriptor::writable(path))
                .build()?,
            (None, None) => {
                eyre::bail!("repository builder needs a layering configuration or a path")
            }
        };

        let budget = Arc::new(match self.memory_budget {
            Some(bytes) => MemoryBudget::with_limit(bytes),
            None => MemoryBudget::auto_detect(),
        });

        let mut layers = Vec::with_capacity(layering.layer_count());
        for i in 0..layering.layer_count() {
            let descriptor = layering.descriptor(i);
            let pair = layering.converters(i, Direction::Write);
            let create = self.create && descriptor.is_write_capable();
            layers.push(DoubleFileStorage::open(
                descriptor,
                create,
                Arc::clone(&pair.units),
                Arc::clone(&pair.fs),
            )?);
        }

        let write_layer = layering.write_layer();
        ensure!(
            write_layer.is_some() || !self.create,
            "create=true is meaningless without a write-capable layer"
        );

        let cache = RepositoryCache::with_budget(Some(Arc::clone(&budget)));

        Ok(Repository {
            layering,
            layers,
            cache,
            budget,
            write_layer,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_without_layering_is_an_error() {
        let err = RepositoryBuilder::new().open().unwrap_err();
        assert!(err.to_string().contains("layering"));
    }

    #[test]
    fn missing_read_only_layer_fails_even_with_create() {
        let dir = tempfile::tempdir().unwrap();
        let layering = LayeringSupport::builder()
            .layer(LayerDescriptor::read_only(
                dir.path().join("absent").display().to_string(),
            ))
            .build()
            .unwrap();

        let err = RepositoryBuilder::new()
            .layering(layering)
            .create(true)
            .open()
            .unwrap_err();
        assert!(err.to_string().contains("not found"));
    }
}

//! # Layer Descriptors and Layering Support
//!
//! A logical repository is composed from an ordered list of physical
//! *layers*. Each layer is one independently-built storage unit - typically
//! a read-only layer produced by a previous indexing run plus one writable
//! layer for the current session - and numbers its units and filesystems
//! locally.
//!
//! ## Directory Layout
//!
//! A [`LayerDescriptor`] locates its layer by URI. The layer root is a
//! directory holding the two backing files of the storage engine:
//!
//! ```text
//! layer_root/
//! ├── store.dfs0       # backing file 0
//! └── store.dfs1       # backing file 1
//! ```
//!
//! ## Lifecycle
//!
//! [`LayeringSupport`] is assembled once at repository open time and is
//! read-only afterwards; it is shared behind an `Arc` and consulted on
//! every storage access for the layer's converter pair. Converters are
//! looked up per layer and per [`Direction`]:
//!
//! - `Direction::Write` - client numbering to layer numbering; used when
//!   encoding keys for storage access (reads *and* writes address records
//!   through this direction, since addressing must be symmetric)
//! - `Direction::Read` - layer numbering to client numbering; used by
//!   value factories when payloads embed unit or filesystem references

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use eyre::{ensure, Result};

use crate::config::STORAGE_FILE_NAMES;

mod converters;

pub use converters::{
    FsConverter, IdentityFsConverter, IdentityUnitsConverter, MappedFsConverter,
    MappedUnitsConverter, UnitsConverter,
};

/// Conversion direction for per-layer converter lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Layer-local numbering to client numbering.
    Read,
    /// Client numbering to layer-local numbering.
    Write,
}

/// Identifies one physical storage layer by a stable locator. Created once
/// per layer at repository configuration time; immutable thereafter.
#[derive(Debug, Clone)]
pub struct LayerDescriptor {
    uri: String,
    write_capable: bool,
}

impl LayerDescriptor {
    /// A writable layer (the session's own output layer).
    pub fn writable(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            write_capable: true,
        }
    }

    /// A read-only layer (a previously-built layer being combined in).
    pub fn read_only(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            write_capable: false,
        }
    }

    pub fn uri(&self) -> &str {
        &self.uri
    }

    pub fn is_write_capable(&self) -> bool {
        self.write_capable
    }

    /// Resolves the URI to the layer's root directory. Accepts `file://`
    /// URIs and plain paths; anything else is a configuration error.
    pub fn root(&self) -> Result<PathBuf> {
        let path = self.uri.strip_prefix("file://").unwrap_or(&self.uri);
        ensure!(
            !path.is_empty() && !path.contains("://"),
            "layer descriptor '{}' is not a file URI or filesystem path",
            self.uri
        );
        Ok(PathBuf::from(path))
    }

    /// Paths of the layer's two backing files.
    pub fn storage_paths(&self) -> Result<[PathBuf; 2]> {
        let root = self.root()?;
        Ok([
            root.join(STORAGE_FILE_NAMES[0]),
            root.join(STORAGE_FILE_NAMES[1]),
        ])
    }
}

impl fmt::Display for LayerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({})",
            self.uri,
            if self.write_capable { "rw" } else { "ro" }
        )
    }
}

/// The converter pair a layer uses in one direction.
#[derive(Clone)]
pub struct ConverterPair {
    pub units: Arc<dyn UnitsConverter>,
    pub fs: Arc<dyn FsConverter>,
}

impl ConverterPair {
    pub fn identity() -> Self {
        Self {
            units: Arc::new(IdentityUnitsConverter),
            fs: Arc::new(IdentityFsConverter),
        }
    }
}

struct LayerConfig {
    descriptor: LayerDescriptor,
    read: ConverterPair,
    write: ConverterPair,
}

/// Per-repository layering configuration: the ordered layer list plus each
/// layer's converter pairs. Read-only after construction.
pub struct LayeringSupport {
    layers: Vec<LayerConfig>,
}

impl LayeringSupport {
    pub fn builder() -> LayeringSupportBuilder {
        LayeringSupportBuilder { layers: Vec::new() }
    }

    /// The common single-layer configuration: one layer in client
    /// numbering.
    ///
    /// # Panics
    ///
    /// Panics if the descriptor's URI does not resolve to a filesystem
    /// path; use [`LayeringSupport::builder`] to handle that as an error.
    pub fn single(descriptor: LayerDescriptor) -> Arc<Self> {
        Self::builder()
            .layer(descriptor)
            .build()
            .expect("single-layer configuration with an unresolvable layer URI")
    }

    pub fn layer_count(&self) -> usize {
        self.layers.len()
    }

    pub fn descriptor(&self, layer: usize) -> &LayerDescriptor {
        &self.layers[layer].descriptor
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &LayerDescriptor> {
        self.layers.iter().map(|l| &l.descriptor)
    }

    pub fn converters(&self, layer: usize, direction: Direction) -> &ConverterPair {
        let config = &self.layers[layer];
        match direction {
            Direction::Read => &config.read,
            Direction::Write => &config.write,
        }
    }

    /// Index of the first write-capable layer, if any.
    pub fn write_layer(&self) -> Option<usize> {
        self.layers
            .iter()
            .position(|l| l.descriptor.is_write_capable())
    }
}

pub struct LayeringSupportBuilder {
    layers: Vec<LayerConfig>,
}

impl LayeringSupportBuilder {
    /// Adds a layer whose local numbering is the client numbering.
    pub fn layer(self, descriptor: LayerDescriptor) -> Self {
        self.layer_with_converters(descriptor, ConverterPair::identity(), ConverterPair::identity())
    }

    /// Adds a layer with explicit converter pairs for each direction.
    pub fn layer_with_converters(
        mut self,
        descriptor: LayerDescriptor,
        read: ConverterPair,
        write: ConverterPair,
    ) -> Self {
        self.layers.push(LayerConfig {
            descriptor,
            read,
            write,
        });
        self
    }

    pub fn build(self) -> Result<Arc<LayeringSupport>> {
        ensure!(
            !self.layers.is_empty(),
            "a repository needs at least one layer"
        );
        for config in &self.layers {
            // Surfaces malformed URIs at configuration time, not first use.
            config.descriptor.root()?;
        }
        Ok(Arc::new(LayeringSupport {
            layers: self.layers,
        }))
    }
}

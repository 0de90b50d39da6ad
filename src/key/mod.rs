//! # Key and Persistent Contracts
//!
//! This module defines how stored objects are identified and how their
//! values serialize.
//!
//! ## Identity Model
//!
//! A [`Key`] names exactly one stored object. Identity has three parts:
//!
//! - the owning **unit** (compilation/translation unit id). Unit ids are
//!   numbering-space dependent: the same logical unit can carry different
//!   ids in different storage layers, which is why key equality is
//!   *parameterized* by the unit id of each side rather than expressed as a
//!   plain `Eq` impl (an `Eq` impl cannot carry the extra context argument)
//! - a **primary path**: ordered segments mirroring a hierarchical name or
//!   file path, used to place and locate the object
//! - a **secondary path** of the same shape, used for disambiguation
//!   (overload index, nested scope and the like)
//!
//! A key additionally carries a [`Behavior`] caching hint and the
//! [`PersistentFactory`] able to (de)serialize the value it addresses.
//! Neither participates in identity.
//!
//! ## Context-Parameterized Equality
//!
//! ```ignore
//! // both unit ids must already be expressed in one common numbering,
//! // typically the client numbering obtained through a UnitsConverter
//! let same = a.equals_in_context(unit_a, &b, unit_b);
//! let h = a.hash_with(unit_a);
//! ```
//!
//! Two keys equal under one numbering hash equal under that numbering and
//! produce identical canonical encodings, so they address the same on-disk
//! slot.
//!
//! ## Canonical Encoding
//!
//! [`Key::encode_with`] produces the deterministic byte form used by the
//! storage engine as its index key: the unit id (remapped through the
//! layer's [`UnitsConverter`]), both segment paths, with any filesystem
//! index inside a [`Segment::File`] remapped through the layer's
//! [`FsConverter`]. The behavior hint is deliberately excluded - it is a
//! retention policy, not identity, and two keys that differ only in
//! behavior must address the same record.
//!
//! ## Attached Values
//!
//! A key instance can carry a reference to its already-resolved value
//! (`attach_cache`/`cached_value`). This is an optimization for hot paths
//! that repeatedly resolve the same key instance; the repository cache
//! remains the source of truth and correctness never depends on the
//! attachment.

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use eyre::{ensure, Result};
use parking_lot::RwLock;
use smallvec::SmallVec;

use crate::config::{MAX_PATH_DEPTH, MAX_SEGMENT_BYTES};
use crate::layering::{FsConverter, UnitsConverter};

/// Identifier of a compilation/translation unit within one numbering space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl fmt::Display for UnitId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unit#{}", self.0)
    }
}

/// Compact filesystem index within one numbering space. On-disk records
/// reference filesystems through this index rather than a full locator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsIndex(pub u16);

impl fmt::Display for FsIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "fs#{}", self.0)
    }
}

/// Caching/retention hint carried by a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Behavior {
    /// Normal read-through caching as a reclaimable entry.
    #[default]
    Default,
    /// The value is never installed in the repository cache.
    NoCache,
    /// The value is installed pinned and survives memory-pressure drops.
    AlwaysPin,
}

/// One element of a key path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Segment {
    /// A name component (namespace, class, function, ...).
    Ident(Arc<str>),
    /// A numeric disambiguator (overload index, nested scope ordinal, ...).
    Index(u32),
    /// A file component: filesystem index plus path within it. The `fs`
    /// part is numbering-space dependent and gets remapped per layer.
    File { fs: FsIndex, path: Arc<str> },
}

impl Segment {
    pub fn ident(s: impl Into<Arc<str>>) -> Self {
        Segment::Ident(s.into())
    }

    pub fn file(fs: FsIndex, path: impl Into<Arc<str>>) -> Self {
        Segment::File {
            fs,
            path: path.into(),
        }
    }
}

type PathVec = SmallVec<[Segment; 4]>;

const SEG_TAG_IDENT: u8 = 0;
const SEG_TAG_INDEX: u8 = 1;
const SEG_TAG_FILE: u8 = 2;

struct KeyData {
    unit: UnitId,
    behavior: Behavior,
    primary: PathVec,
    secondary: PathVec,
    factory: Arc<dyn PersistentFactory>,
    attached: RwLock<Option<Arc<dyn Persistent>>>,
}

/// Immutable identifier of one stored object. Cheap to clone; clones share
/// the same attached-value slot.
#[derive(Clone)]
pub struct Key {
    data: Arc<KeyData>,
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key")
            .field("unit", &self.data.unit)
            .field("behavior", &self.data.behavior)
            .field("primary", &self.data.primary)
            .field("secondary", &self.data.secondary)
            .finish()
    }
}

impl Key {
    pub fn builder(unit: UnitId, factory: Arc<dyn PersistentFactory>) -> KeyBuilder {
        KeyBuilder {
            unit,
            behavior: Behavior::Default,
            primary: PathVec::new(),
            secondary: PathVec::new(),
            factory,
        }
    }

    /// The unit id this key was built under (its native numbering).
    pub fn unit(&self) -> UnitId {
        self.data.unit
    }

    pub fn behavior(&self) -> Behavior {
        self.data.behavior
    }

    /// Number of segments in the primary path.
    pub fn depth(&self) -> usize {
        self.data.primary.len()
    }

    /// Segment of the primary path at `level`, or `None` past the end.
    pub fn at(&self, level: usize) -> Option<&Segment> {
        self.data.primary.get(level)
    }

    pub fn secondary_depth(&self) -> usize {
        self.data.secondary.len()
    }

    pub fn secondary_at(&self, level: usize) -> Option<&Segment> {
        self.data.secondary.get(level)
    }

    pub fn factory(&self) -> &Arc<dyn PersistentFactory> {
        &self.data.factory
    }

    /// Hash parameterized by an externally supplied unit id. Callers that
    /// compare keys across numbering spaces must hash both sides with unit
    /// ids expressed in one common numbering.
    pub fn hash_with(&self, unit: UnitId) -> u64 {
        let mut h = std::collections::hash_map::DefaultHasher::new();
        unit.hash(&mut h);
        self.data.primary.hash(&mut h);
        self.data.secondary.hash(&mut h);
        h.finish()
    }

    /// Contextual equality: compares the supplied unit ids and both paths.
    /// The keys' stored unit ids are intentionally ignored - they may come
    /// from different numbering spaces; the caller supplies both ids in a
    /// common numbering (see [`crate::layering::UnitsConverter`]).
    pub fn equals_in_context(&self, self_unit: UnitId, other: &Key, other_unit: UnitId) -> bool {
        self_unit == other_unit
            && self.data.primary == other.data.primary
            && self.data.secondary == other.data.secondary
    }

    /// Whether a previously-resolved value is attached to this key instance.
    pub fn has_cache(&self) -> bool {
        self.data.attached.read().is_some()
    }

    pub fn cached_value(&self) -> Option<Arc<dyn Persistent>> {
        self.data.attached.read().clone()
    }

    pub fn attach_cache(&self, value: Arc<dyn Persistent>) {
        *self.data.attached.write() = Some(value);
    }

    pub(crate) fn detach_cache(&self) {
        *self.data.attached.write() = None;
    }

    /// Appends the canonical byte encoding of this key to `out`, remapping
    /// the unit id and any filesystem indices through the supplied
    /// converters. Deterministic: keys equal under one numbering produce
    /// identical bytes through that numbering's converters.
    pub fn encode_with(
        &self,
        units: &dyn UnitsConverter,
        fs: &dyn FsConverter,
        out: &mut Vec<u8>,
    ) -> Result<()> {
        ensure!(
            self.data.primary.len() <= MAX_PATH_DEPTH
                && self.data.secondary.len() <= MAX_PATH_DEPTH,
            "key path depth {}/{} exceeds the encodable maximum {}",
            self.data.primary.len(),
            self.data.secondary.len(),
            MAX_PATH_DEPTH
        );

        let unit = units.client_to_layer(self.data.unit);
        out.extend_from_slice(&unit.0.to_le_bytes());
        out.extend_from_slice(&(self.data.primary.len() as u16).to_le_bytes());
        out.extend_from_slice(&(self.data.secondary.len() as u16).to_le_bytes());

        for seg in self.data.primary.iter().chain(self.data.secondary.iter()) {
            encode_segment(seg, fs, out)?;
        }

        Ok(())
    }
}

fn encode_segment(seg: &Segment, fs: &dyn FsConverter, out: &mut Vec<u8>) -> Result<()> {
    match seg {
        Segment::Ident(name) => {
            let bytes = name.as_bytes();
            ensure!(
                bytes.len() <= MAX_SEGMENT_BYTES,
                "identifier segment of {} bytes exceeds the encodable maximum {}",
                bytes.len(),
                MAX_SEGMENT_BYTES
            );
            out.push(SEG_TAG_IDENT);
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
        Segment::Index(i) => {
            out.push(SEG_TAG_INDEX);
            out.extend_from_slice(&i.to_le_bytes());
        }
        Segment::File { fs: fs_index, path } => {
            let bytes = path.as_bytes();
            ensure!(
                bytes.len() <= MAX_SEGMENT_BYTES,
                "file segment of {} bytes exceeds the encodable maximum {}",
                bytes.len(),
                MAX_SEGMENT_BYTES
            );
            let mapped = fs.client_to_layer(*fs_index);
            out.push(SEG_TAG_FILE);
            out.extend_from_slice(&mapped.0.to_le_bytes());
            out.extend_from_slice(&(bytes.len() as u16).to_le_bytes());
            out.extend_from_slice(bytes);
        }
    }
    Ok(())
}

/// Builder for [`Key`]. Segment methods append to the primary path;
/// `secondary` appends to the secondary path.
pub struct KeyBuilder {
    unit: UnitId,
    behavior: Behavior,
    primary: PathVec,
    secondary: PathVec,
    factory: Arc<dyn PersistentFactory>,
}

impl KeyBuilder {
    pub fn behavior(mut self, behavior: Behavior) -> Self {
        self.behavior = behavior;
        self
    }

    pub fn segment(mut self, segment: Segment) -> Self {
        self.primary.push(segment);
        self
    }

    pub fn ident(self, name: impl Into<Arc<str>>) -> Self {
        self.segment(Segment::ident(name))
    }

    pub fn index(self, i: u32) -> Self {
        self.segment(Segment::Index(i))
    }

    pub fn file(self, fs: FsIndex, path: impl Into<Arc<str>>) -> Self {
        self.segment(Segment::file(fs, path))
    }

    pub fn secondary(mut self, segment: Segment) -> Self {
        self.secondary.push(segment);
        self
    }

    pub fn build(self) -> Key {
        Key {
            data: Arc::new(KeyData {
                unit: self.unit,
                behavior: self.behavior,
                primary: self.primary,
                secondary: self.secondary,
                factory: self.factory,
                attached: RwLock::new(None),
            }),
        }
    }
}

/// Marker contract for stored values. Implementations are immutable after
/// creation and cheap to discard and recreate - the repository may drop a
/// reclaimable value at any time and re-read it from storage later.
pub trait Persistent: fmt::Debug + Send + Sync + 'static {
    /// Downcast hook for consumers that know the concrete type behind a key.
    fn as_any(&self) -> &dyn Any;
}

/// Creates a [`Persistent`] from stored bytes and serializes one back.
/// Deterministic: the same input bytes produce an equivalent object, and an
/// object's bytes round-trip through `read` to an equivalent object.
pub trait PersistentFactory: fmt::Debug + Send + Sync + 'static {
    fn read(&self, bytes: &[u8]) -> Result<Arc<dyn Persistent>>;

    fn write(&self, value: &dyn Persistent, out: &mut Vec<u8>) -> Result<()>;
}

#[cfg(test)]
pub(crate) mod test_support {
    //! A small concrete `Persistent` used by unit tests across modules.

    use super::*;
    use eyre::bail;

    #[derive(Debug, PartialEq, Eq)]
    pub struct Blob(pub Vec<u8>);

    impl Persistent for Blob {
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Debug)]
    pub struct BlobFactory;

    impl PersistentFactory for BlobFactory {
        fn read(&self, bytes: &[u8]) -> Result<Arc<dyn Persistent>> {
            Ok(Arc::new(Blob(bytes.to_vec())))
        }

        fn write(&self, value: &dyn Persistent, out: &mut Vec<u8>) -> Result<()> {
            let Some(blob) = value.as_any().downcast_ref::<Blob>() else {
                bail!("BlobFactory cannot serialize a foreign Persistent impl");
            };
            out.extend_from_slice(&blob.0);
            Ok(())
        }
    }

    pub fn blob_key(unit: u32, name: &str) -> Key {
        Key::builder(UnitId(unit), Arc::new(BlobFactory)).ident(name).build()
    }
}

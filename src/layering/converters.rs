//! # Unit and Filesystem Converters
//!
//! Storage layers are built independently and number their units and
//! filesystems locally. A converter pair translates between the
//! repository-wide ("client") numbering and one layer's local numbering,
//! in both directions.
//!
//! Converters are pure and read-only after construction; they are shared
//! across threads without locking. Both directions must invert each other
//! for every id the other direction can produce.
//!
//! Two implementations cover the practical cases:
//!
//! - [`IdentityUnitsConverter`]/[`IdentityFsConverter`] - a layer whose
//!   local numbering is the client numbering (the common single-layer
//!   setup)
//! - [`MappedUnitsConverter`]/[`MappedFsConverter`] - table-backed
//!   remapping built from explicit id pairs at repository open time

use hashbrown::HashMap;

use crate::key::{FsIndex, UnitId};

/// Translates unit ids between the client numbering and one layer's local
/// numbering. `layer_to_client(client_to_layer(u)) == u` for every `u` the
/// converter covers, and symmetrically in the other direction.
pub trait UnitsConverter: Send + Sync + 'static {
    fn client_to_layer(&self, unit: UnitId) -> UnitId;

    fn layer_to_client(&self, unit: UnitId) -> UnitId;
}

/// Translates filesystem indices between the client numbering and one
/// layer's local numbering.
pub trait FsConverter: Send + Sync + 'static {
    fn client_to_layer(&self, fs: FsIndex) -> FsIndex;

    fn layer_to_client(&self, fs: FsIndex) -> FsIndex;
}

/// A layer whose unit numbering is the client numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityUnitsConverter;

impl UnitsConverter for IdentityUnitsConverter {
    fn client_to_layer(&self, unit: UnitId) -> UnitId {
        unit
    }

    fn layer_to_client(&self, unit: UnitId) -> UnitId {
        unit
    }
}

/// A layer whose filesystem numbering is the client numbering.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityFsConverter;

impl FsConverter for IdentityFsConverter {
    fn client_to_layer(&self, fs: FsIndex) -> FsIndex {
        fs
    }

    fn layer_to_client(&self, fs: FsIndex) -> FsIndex {
        fs
    }
}

/// Table-backed unit remapping built from explicit `(client, layer)` pairs.
/// Ids not present in the table pass through unchanged, so a partially
/// renumbered layer only lists the units that actually moved.
#[derive(Debug, Default)]
pub struct MappedUnitsConverter {
    to_layer: HashMap<UnitId, UnitId>,
    to_client: HashMap<UnitId, UnitId>,
}

impl MappedUnitsConverter {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (UnitId, UnitId)>) -> Self {
        let mut to_layer = HashMap::new();
        let mut to_client = HashMap::new();
        for (client, layer) in pairs {
            to_layer.insert(client, layer);
            to_client.insert(layer, client);
        }
        Self {
            to_layer,
            to_client,
        }
    }
}

impl UnitsConverter for MappedUnitsConverter {
    fn client_to_layer(&self, unit: UnitId) -> UnitId {
        self.to_layer.get(&unit).copied().unwrap_or(unit)
    }

    fn layer_to_client(&self, unit: UnitId) -> UnitId {
        self.to_client.get(&unit).copied().unwrap_or(unit)
    }
}

/// Table-backed filesystem remapping built from explicit `(client, layer)`
/// pairs; unmapped indices pass through unchanged.
#[derive(Debug, Default)]
pub struct MappedFsConverter {
    to_layer: HashMap<FsIndex, FsIndex>,
    to_client: HashMap<FsIndex, FsIndex>,
}

impl MappedFsConverter {
    pub fn from_pairs(pairs: impl IntoIterator<Item = (FsIndex, FsIndex)>) -> Self {
        let mut to_layer = HashMap::new();
        let mut to_client = HashMap::new();
        for (client, layer) in pairs {
            to_layer.insert(client, layer);
            to_client.insert(layer, client);
        }
        Self {
            to_layer,
            to_client,
        }
    }
}

impl FsConverter for MappedFsConverter {
    fn client_to_layer(&self, fs: FsIndex) -> FsIndex {
        self.to_layer.get(&fs).copied().unwrap_or(fs)
    }

    fn layer_to_client(&self, fs: FsIndex) -> FsIndex {
        self.to_client.get(&fs).copied().unwrap_or(fs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_converters_pass_through() {
        assert_eq!(IdentityUnitsConverter.client_to_layer(UnitId(9)), UnitId(9));
        assert_eq!(IdentityUnitsConverter.layer_to_client(UnitId(9)), UnitId(9));
        assert_eq!(IdentityFsConverter.client_to_layer(FsIndex(3)), FsIndex(3));
        assert_eq!(IdentityFsConverter.layer_to_client(FsIndex(3)), FsIndex(3));
    }

    #[test]
    fn mapped_units_invert_for_covered_ids() {
        let conv = MappedUnitsConverter::from_pairs([
            (UnitId(1), UnitId(100)),
            (UnitId(2), UnitId(200)),
        ]);

        assert_eq!(conv.client_to_layer(UnitId(1)), UnitId(100));
        assert_eq!(conv.layer_to_client(UnitId(100)), UnitId(1));
        assert_eq!(conv.layer_to_client(conv.client_to_layer(UnitId(2))), UnitId(2));
    }

    #[test]
    fn mapped_units_pass_through_unmapped_ids() {
        let conv = MappedUnitsConverter::from_pairs([(UnitId(1), UnitId(100))]);

        assert_eq!(conv.client_to_layer(UnitId(42)), UnitId(42));
        assert_eq!(conv.layer_to_client(UnitId(42)), UnitId(42));
    }

    #[test]
    fn mapped_fs_invert_for_covered_indices() {
        let conv = MappedFsConverter::from_pairs([(FsIndex(0), FsIndex(7))]);

        assert_eq!(conv.client_to_layer(FsIndex(0)), FsIndex(7));
        assert_eq!(conv.layer_to_client(FsIndex(7)), FsIndex(0));
    }
}

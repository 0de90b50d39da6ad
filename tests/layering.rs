//! # Layering and Remapping Integration Tests
//!
//! Verifies that independently-numbered layers combine correctly:
//!
//! 1. **Cross-numbering key equivalence**: keys built under two different
//!    unit numberings compare equal (and hash equal) once both sides are
//!    expressed in the client numbering through their converters
//! 2. **Converter-aware addressing**: a layer opened with a unit/fs
//!    mapping stores records under layer-local ids, so the same physical
//!    layer read with identity converters exposes the layer-local view

use std::sync::Arc;

use modelstore::{
    DoubleFileStorage, FsConverter, FsIndex, IdentityFsConverter, IdentityUnitsConverter, Key,
    LayerDescriptor, MappedFsConverter, MappedUnitsConverter, Persistent, PersistentFactory,
    UnitId, UnitsConverter,
};
use tempfile::TempDir;

#[derive(Debug)]
struct Marker;

impl Persistent for Marker {
    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[derive(Debug)]
struct MarkerFactory;

impl PersistentFactory for MarkerFactory {
    fn read(&self, _bytes: &[u8]) -> eyre::Result<Arc<dyn Persistent>> {
        Ok(Arc::new(Marker))
    }

    fn write(&self, _value: &dyn Persistent, _out: &mut Vec<u8>) -> eyre::Result<()> {
        Ok(())
    }
}

fn file_key(unit: u32, fs: u16, path: &str) -> Key {
    Key::builder(UnitId(unit), Arc::new(MarkerFactory))
        .file(FsIndex(fs), path)
        .ident("decl")
        .build()
}

#[test]
fn keys_from_different_numberings_are_equal_in_client_context() {
    // Layer A numbers the unit 1, layer B numbers the same logical unit
    // 101. Both map to client unit 1.
    let conv_a = MappedUnitsConverter::from_pairs([(UnitId(1), UnitId(1))]);
    let conv_b = MappedUnitsConverter::from_pairs([(UnitId(1), UnitId(101))]);

    let key_a = file_key(1, 0, "/src/widget.h");
    let key_b = file_key(101, 0, "/src/widget.h");

    let client_a = conv_a.layer_to_client(key_a.unit());
    let client_b = conv_b.layer_to_client(key_b.unit());

    assert_eq!(client_a, UnitId(1));
    assert_eq!(client_b, UnitId(1));
    assert!(key_a.equals_in_context(client_a, &key_b, client_b));
    assert_eq!(key_a.hash_with(client_a), key_b.hash_with(client_b));
}

#[test]
fn keys_from_different_logical_units_stay_distinct() {
    let conv = MappedUnitsConverter::from_pairs([(UnitId(1), UnitId(101)), (UnitId(2), UnitId(102))]);

    let key_a = file_key(101, 0, "/src/widget.h");
    let key_b = file_key(102, 0, "/src/widget.h");

    assert!(!key_a.equals_in_context(
        conv.layer_to_client(key_a.unit()),
        &key_b,
        conv.layer_to_client(key_b.unit()),
    ));
}

fn open_layer(
    dir: &TempDir,
    units: Arc<dyn UnitsConverter>,
    fs: Arc<dyn FsConverter>,
) -> DoubleFileStorage {
    let descriptor = LayerDescriptor::writable(dir.path().join("layer").display().to_string());
    DoubleFileStorage::open(&descriptor, true, units, fs).unwrap()
}

#[test]
fn layer_addresses_records_under_layer_local_unit_ids() {
    let dir = tempfile::tempdir().unwrap();

    // Client unit 7 is unit 700 inside this layer.
    {
        let storage = open_layer(
            &dir,
            Arc::new(MappedUnitsConverter::from_pairs([(UnitId(7), UnitId(700))])),
            Arc::new(IdentityFsConverter),
        );
        storage
            .write(&file_key(7, 0, "/src/a.h"), b"record")
            .unwrap();
        storage.close().unwrap();
    }

    // The same physical layer through identity converters: the record is
    // filed under the layer-local id 700, not the client id 7.
    let storage = open_layer(
        &dir,
        Arc::new(IdentityUnitsConverter),
        Arc::new(IdentityFsConverter),
    );

    assert!(storage.read(&file_key(7, 0, "/src/a.h")).unwrap().is_none());
    assert_eq!(
        storage
            .read(&file_key(700, 0, "/src/a.h"))
            .unwrap()
            .unwrap(),
        b"record"
    );
}

#[test]
fn layer_remaps_filesystem_indices_in_file_segments() {
    let dir = tempfile::tempdir().unwrap();

    // Client filesystem 0 is filesystem 5 inside this layer.
    {
        let storage = open_layer(
            &dir,
            Arc::new(IdentityUnitsConverter),
            Arc::new(MappedFsConverter::from_pairs([(FsIndex(0), FsIndex(5))])),
        );
        storage
            .write(&file_key(1, 0, "/src/a.h"), b"fs-mapped")
            .unwrap();
        storage.close().unwrap();
    }

    let storage = open_layer(
        &dir,
        Arc::new(IdentityUnitsConverter),
        Arc::new(IdentityFsConverter),
    );

    assert!(storage.read(&file_key(1, 0, "/src/a.h")).unwrap().is_none());
    assert_eq!(
        storage.read(&file_key(1, 5, "/src/a.h")).unwrap().unwrap(),
        b"fs-mapped"
    );
}

#[test]
fn same_client_key_addresses_the_same_slot_across_sessions() {
    let dir = tempfile::tempdir().unwrap();
    let units = || Arc::new(MappedUnitsConverter::from_pairs([(UnitId(7), UnitId(700))]));

    {
        let storage = open_layer(&dir, units(), Arc::new(IdentityFsConverter));
        storage
            .write(&file_key(7, 0, "/src/a.h"), b"first")
            .unwrap();
        storage.close().unwrap();
    }

    // A second session with the same mapping overwrites the same record
    // rather than creating a sibling.
    let storage = open_layer(&dir, units(), Arc::new(IdentityFsConverter));
    storage
        .write(&file_key(7, 0, "/src/a.h"), b"second")
        .unwrap();

    assert_eq!(storage.stats().records, 1);
    assert_eq!(
        storage.read(&file_key(7, 0, "/src/a.h")).unwrap().unwrap(),
        b"second"
    );
}

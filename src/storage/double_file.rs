//! # Double-File Record Storage
//!
//! The on-disk engine for one repository layer: durable, compact storage of
//! arbitrary-length records addressed by [`Key`], with bounded-latency
//! maintenance.
//!
//! ## Why Two Files
//!
//! All records normally live in one file (the *primary*); the second file
//! is the relocation destination for defragmentation. A maintenance pass
//! walks the primary in address order, copies each live record compactly
//! into the other file, and truncates the drained file when it is empty -
//! at which point the files swap roles. Because a record is always copied
//! before its old chunk is released, interrupting a pass at any step (or
//! crashing mid-pass) loses only compaction progress, never data.
//!
//! ## Write Path
//!
//! ```text
//! write(key, bytes)
//!   1. allocate: best-fit free chunk, else append
//!   2. payload bytes, then chunk header (header last: an interrupted
//!      write leaves the slot in its previous on-disk state)
//!   3. for appends, advance the file header's append_end
//!   4. release the key's previous chunk, if any, to the free list
//! ```
//!
//! Step 4 after step 3 is what makes overwrite crash-safe: both chunks can
//! momentarily be live on disk, and the open-time scan resolves the
//! duplicate by sequence number.
//!
//! ## Fragmentation Accounting
//!
//! `allocated` is the byte span of every tracked chunk; `live` is the exact
//! span each record needs. Their difference - slack inside reused chunks
//! plus wholly free chunks - is what a full compaction would recover:
//!
//! ```text
//! fragmentation = (allocated - live) * 100 / allocated
//! ```
//!
//! 0 means no compaction would recover anything. The percentage is
//! monotonically non-increasing across maintenance steps: a relocation
//! replaces a chunk's span with its exact need, and a skipped free chunk
//! leaves the accounted set entirely.
//!
//! ## Locking
//!
//! One `RwLock` guards the engine state. Reads take the shared lock;
//! writes, removes, and each *individual* relocation step take the
//! exclusive lock - a maintenance pass never holds the lock across steps,
//! so read/write traffic stays responsive while a background task compacts
//! the layer.
//!
//! ## Failure Semantics
//!
//! I/O errors are reported per operation and not retried here - the caller
//! knows whether the value can be regenerated from source. Structural
//! corruption (bad magic, overrunning chunk, checksum mismatch) is fatal
//! for the layer and surfaced at open; the engine never repairs silently.

use std::io::Write as IoWrite;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use eyre::{ensure, Result, WrapErr};
use hashbrown::HashMap;
use parking_lot::RwLock;
use zerocopy::IntoBytes;

use crate::config::{CHUNK_HEADER_SIZE, FILE_HEADER_SIZE, FILE_INITIAL_SIZE};
use crate::key::Key;
use crate::layering::{FsConverter, LayerDescriptor, UnitsConverter};

use super::freelist::FreeList;
use super::headers::{payload_checksum, ChunkHeader, FileHeader};
use super::mapped::MappedFile;

/// Where one record currently lives.
#[derive(Debug, Clone, Copy)]
struct SlotAddr {
    file: usize,
    offset: u64,
    capacity: u32,
    key_len: u32,
    data_len: u32,
}

impl SlotAddr {
    /// Bytes the record actually needs (header + key + data).
    fn need(&self) -> u64 {
        CHUNK_HEADER_SIZE as u64 + self.key_len as u64 + self.data_len as u64
    }
}

struct FileState {
    mapped: MappedFile,
    append_end: u64,
    free: FreeList,
    /// Spans of all accounted chunks. Excludes the drained prefix of a
    /// file mid-maintenance: those chunks are reclaimed by the end-of-pass
    /// truncation and no longer count toward fragmentation.
    alloc_bytes: u64,
    /// Exact needed spans of the live chunks in this file.
    live_bytes: u64,
    chunk_count: u64,
}

impl FileState {
    fn sync_header(&mut self) -> Result<()> {
        let append_end = self.append_end;
        let chunk_count = self.chunk_count;
        let bytes = self.mapped.slice_mut(0, FILE_HEADER_SIZE)?;
        let header = FileHeader::view_mut(bytes)?;
        header.set_append_end(append_end);
        header.set_chunk_count(chunk_count);
        Ok(())
    }
}

/// An in-progress defragmentation pass: the file being drained and the
/// address of the next chunk to visit.
struct DefragPass {
    source: usize,
    cursor: u64,
}

struct StorageState {
    files: [FileState; 2],
    index: HashMap<Box<[u8]>, SlotAddr>,
    /// File receiving new writes: the primary, or the relocation target
    /// while a pass is draining the old primary.
    active: usize,
    next_seq: u64,
    pass: Option<DefragPass>,
}

impl StorageState {
    fn fragmentation_percentage(&self) -> u8 {
        let alloc = self.files[0].alloc_bytes + self.files[1].alloc_bytes;
        let live = self.files[0].live_bytes + self.files[1].live_bytes;
        if alloc == 0 || live >= alloc {
            return 0;
        }
        // Round up to 1 while anything at all is reclaimable: 0 is a
        // contract ("compaction would recover nothing"), not a rounding
        // artifact.
        (((alloc - live) * 100 / alloc).max(1)) as u8
    }

    /// Flags a chunk free on disk and returns it to its file's free list.
    fn release_chunk(&mut self, addr: SlotAddr) -> Result<()> {
        let file = &mut self.files[addr.file];
        let bytes = file.mapped.slice_mut(addr.offset, CHUNK_HEADER_SIZE)?;
        ChunkHeader::view_mut(bytes)?.clear_live();
        file.free.insert(addr.offset, addr.capacity);
        Ok(())
    }
}

/// Point-in-time snapshot of one layer's storage, for diagnostics.
#[derive(Debug, Clone)]
pub struct StorageStats {
    pub records: usize,
    pub live_bytes: u64,
    pub allocated_bytes: u64,
    pub free_slots: usize,
    pub fragmentation_percentage: u8,
    pub file_sizes: [u64; 2],
}

/// One physical layer's storage: an append area plus free-space
/// bookkeeping spread across exactly two backing files.
pub struct DoubleFileStorage {
    state: RwLock<StorageState>,
    paths: [PathBuf; 2],
    units: Arc<dyn UnitsConverter>,
    fs: Arc<dyn FsConverter>,
}

impl std::fmt::Debug for DoubleFileStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DoubleFileStorage")
            .field("paths", &self.paths)
            .finish_non_exhaustive()
    }
}

impl DoubleFileStorage {
    /// Opens the layer's two backing files. With `create=false`, missing
    /// files are a configuration error; with `create=true`, missing files
    /// (and the layer directory) are created. Files that exist but fail
    /// the structural self-check are corrupt in either mode.
    pub fn open(
        descriptor: &LayerDescriptor,
        create: bool,
        units: Arc<dyn UnitsConverter>,
        fs: Arc<dyn FsConverter>,
    ) -> Result<Self> {
        let root = descriptor.root()?;
        let paths = descriptor.storage_paths()?;

        let exists = [paths[0].exists(), paths[1].exists()];
        if !create {
            ensure!(
                exists[0] || exists[1],
                "layer storage not found at '{}' (create=false)",
                root.display()
            );
            ensure!(
                exists[0] && exists[1],
                "layer storage at '{}' is corrupt: one of the two backing files is missing",
                root.display()
            );
        } else {
            std::fs::create_dir_all(&root)
                .wrap_err_with(|| format!("failed to create layer directory '{}'", root.display()))?;
            ensure!(
                exists[0] == exists[1],
                "layer storage at '{}' is corrupt: one of the two backing files is missing",
                root.display()
            );
        }

        let mut files = if exists[0] {
            [Self::load_file(&paths[0], 0)?, Self::load_file(&paths[1], 1)?]
        } else {
            [Self::create_file(&paths[0], 0)?, Self::create_file(&paths[1], 1)?]
        };

        // Merge both files' live chunks into one index. A crash between
        // writing a record's new chunk and freeing its old one leaves two
        // live chunks for the key; the higher sequence number wins and the
        // loser is adopted into the free list.
        let mut index: HashMap<Box<[u8]>, SlotAddr> = HashMap::new();
        let mut seq_of: HashMap<Box<[u8]>, u64> = HashMap::new();
        let mut max_seq = 0u64;
        let mut active = 0usize;
        let mut losers: Vec<SlotAddr> = Vec::new();

        for (file_idx, file) in files.iter().enumerate() {
            let mut offset = FILE_HEADER_SIZE as u64;
            while offset < file.append_end {
                let remaining = file.append_end - offset;
                let header_bytes = file.mapped.slice(offset, CHUNK_HEADER_SIZE)?;
                let chunk = ChunkHeader::from_bytes(header_bytes, remaining)?;
                let span = chunk.span();

                if chunk.is_live() {
                    let key_len = chunk.key_len();
                    let data_len = chunk.data_len();
                    let payload = file.mapped.slice(
                        offset + CHUNK_HEADER_SIZE as u64,
                        (key_len + data_len) as usize,
                    )?;
                    ensure!(
                        payload_checksum(&payload[..key_len as usize], &payload[key_len as usize..])
                            == chunk.crc(),
                        "storage file corrupt: checksum mismatch in '{}' at offset {}",
                        file.mapped.path().display(),
                        offset
                    );

                    let key_bytes: Box<[u8]> = payload[..key_len as usize].into();
                    let addr = SlotAddr {
                        file: file_idx,
                        offset,
                        capacity: chunk.capacity(),
                        key_len,
                        data_len,
                    };
                    let seq = chunk.seq();
                    if seq > max_seq {
                        max_seq = seq;
                        active = file_idx;
                    }

                    match seq_of.get(&key_bytes) {
                        Some(&existing) if existing >= seq => losers.push(addr),
                        _ => {
                            if let Some(old) = index.insert(key_bytes.clone(), addr) {
                                losers.push(old);
                            }
                            seq_of.insert(key_bytes, seq);
                        }
                    }
                }

                offset += span;
            }
        }

        // Account chunks now that winners are known.
        for file in files.iter_mut() {
            let mut offset = FILE_HEADER_SIZE as u64;
            let append_end = file.append_end;
            while offset < append_end {
                let header_bytes = file.mapped.slice(offset, CHUNK_HEADER_SIZE)?;
                let chunk = ChunkHeader::from_bytes(header_bytes, append_end - offset)?;
                let span = chunk.span();

                file.alloc_bytes += span;
                file.chunk_count += 1;
                if !chunk.is_live() {
                    file.free.insert(offset, chunk.capacity());
                }

                offset += span;
            }
        }

        let mut state = StorageState {
            files,
            index,
            active,
            next_seq: max_seq + 1,
            pass: None,
        };

        for loser in losers {
            state.release_chunk(loser)?;
        }
        for addr in state.index.values() {
            state.files[addr.file].live_bytes += addr.need();
        }

        Ok(Self {
            state: RwLock::new(state),
            paths,
            units,
            fs,
        })
    }

    fn create_file(path: &std::path::Path, index: u32) -> Result<FileState> {
        let mut mapped = MappedFile::create(path, FILE_INITIAL_SIZE)?;
        let header = FileHeader::new(index);
        mapped
            .slice_mut(0, FILE_HEADER_SIZE)?
            .copy_from_slice(header.as_bytes());
        mapped.flush_range(0, FILE_HEADER_SIZE)?;

        Ok(FileState {
            mapped,
            append_end: FILE_HEADER_SIZE as u64,
            free: FreeList::new(),
            alloc_bytes: 0,
            live_bytes: 0,
            chunk_count: 0,
        })
    }

    fn load_file(path: &std::path::Path, index: u32) -> Result<FileState> {
        let mapped = MappedFile::open(path)?;
        let header = FileHeader::from_bytes(
            mapped.slice(0, FILE_HEADER_SIZE)?,
            index,
            mapped.len(),
        )?;
        let append_end = header.append_end();
        mapped.prefetch(0, append_end as usize);

        Ok(FileState {
            mapped,
            append_end,
            free: FreeList::new(),
            alloc_bytes: 0,
            live_bytes: 0,
            chunk_count: 0,
        })
    }

    fn encode_key(&self, key: &Key) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(64);
        key.encode_with(self.units.as_ref(), self.fs.as_ref(), &mut buf)?;
        Ok(buf)
    }

    /// Stores or overwrites the record for `key`. An overwrite releases
    /// the old slot only after the new chunk is fully written, so the
    /// record stays readable across an interruption at any point.
    pub fn write(&self, key: &Key, data: &[u8]) -> Result<()> {
        let key_bytes = self.encode_key(key)?;
        ensure!(
            key_bytes.len() as u64 + data.len() as u64 <= u32::MAX as u64 / 2,
            "record of {} bytes exceeds the storable maximum",
            data.len()
        );
        let key_len = key_bytes.len() as u32;
        let data_len = data.len() as u32;
        let payload_need = key_len + data_len;

        let mut state = self.state.write();
        let state = &mut *state;

        let seq = state.next_seq;
        state.next_seq += 1;

        // The active file is the primary, or the relocation target while a
        // pass is draining the old primary.
        let target = state.active;

        let (offset, capacity, appended) = {
            let file = &mut state.files[target];
            if let Some((offset, capacity)) = file.free.take(payload_need) {
                (offset, capacity, false)
            } else {
                let offset = file.append_end;
                let span = CHUNK_HEADER_SIZE as u64 + payload_need as u64;
                file.mapped.grow_to(offset + span)?;
                (offset, payload_need, true)
            }
        };

        let crc = payload_checksum(&key_bytes, data);
        let header = ChunkHeader::new_live(seq, capacity, key_len, data_len, crc);

        {
            let file = &mut state.files[target];
            let payload_offset = offset + CHUNK_HEADER_SIZE as u64;
            file.mapped
                .slice_mut(payload_offset, key_len as usize)?
                .copy_from_slice(&key_bytes);
            file.mapped
                .slice_mut(payload_offset + key_len as u64, data_len as usize)?
                .copy_from_slice(data);
            // Header last: until it lands, the slot scans as whatever it
            // was before (free, or virgin space past append_end).
            file.mapped
                .slice_mut(offset, CHUNK_HEADER_SIZE)?
                .copy_from_slice(header.as_bytes());

            let span = CHUNK_HEADER_SIZE as u64 + capacity as u64;
            if appended {
                file.append_end = offset + span;
                file.alloc_bytes += span;
                file.chunk_count += 1;
                file.sync_header()?;
            }
            file.live_bytes += CHUNK_HEADER_SIZE as u64 + payload_need as u64;
        }

        let addr = SlotAddr {
            file: target,
            offset,
            capacity,
            key_len,
            data_len,
        };
        if let Some(old) = state.index.insert(key_bytes.into_boxed_slice(), addr) {
            state.files[old.file].live_bytes -= old.need();
            state.release_chunk(old)?;
        }

        Ok(())
    }

    /// Returns the stored bytes for `key`, or `None` when absent.
    pub fn read(&self, key: &Key) -> Result<Option<Vec<u8>>> {
        let key_bytes = self.encode_key(key)?;
        let state = self.state.read();

        let Some(addr) = state.index.get(key_bytes.as_slice()) else {
            return Ok(None);
        };

        let file = &state.files[addr.file];
        let data = file
            .mapped
            .slice(
                addr.offset + CHUNK_HEADER_SIZE as u64 + addr.key_len as u64,
                addr.data_len as usize,
            )?
            .to_vec();
        Ok(Some(data))
    }

    /// Releases the record's slot to the free list. Disk space is
    /// reclaimed later, by maintenance. Returns whether a record existed.
    pub fn remove(&self, key: &Key) -> Result<bool> {
        let key_bytes = self.encode_key(key)?;
        let mut state = self.state.write();

        let Some(addr) = state.index.remove(key_bytes.as_slice()) else {
            return Ok(false);
        };

        state.files[addr.file].live_bytes -= addr.need();
        state.release_chunk(addr)?;
        Ok(true)
    }

    /// Fraction of allocated-but-reclaimable space relative to total
    /// allocated space, in [0, 100]. 0 means compaction would recover
    /// nothing.
    pub fn fragmentation_percentage(&self) -> u8 {
        self.state.read().fragmentation_percentage()
    }

    /// Incremental defragmentation. A budget of 0 means unbounded: run
    /// until fragmentation is exactly 0. A positive budget performs as
    /// many single-record relocation steps as fit in that wall-clock
    /// window; fragmentation never increases across calls, and repeated
    /// calls converge to 0 with cumulative budget comparable to one
    /// unbounded run. Each step takes the engine lock on its own, so
    /// concurrent reads and writes interleave freely with a running pass.
    ///
    /// Returns the number of records relocated.
    pub fn maintenance(&self, time_budget_millis: u64) -> Result<u64> {
        let started = Instant::now();
        let budget = Duration::from_millis(time_budget_millis);
        let mut relocated = 0u64;

        loop {
            {
                let mut state = self.state.write();
                let state = &mut *state;

                if state.fragmentation_percentage() == 0 {
                    break;
                }

                if state.pass.is_none() {
                    let source = state.active;
                    // Writes move to the target for the duration of the
                    // pass; nothing allocates out of the source again, so
                    // its free list is dead weight from here on.
                    state.files[source].free.clear();
                    state.active = 1 - source;
                    state.pass = Some(DefragPass {
                        source,
                        cursor: FILE_HEADER_SIZE as u64,
                    });
                }

                if self.relocation_step(state)? {
                    relocated += 1;
                }
            }

            if time_budget_millis != 0 && started.elapsed() >= budget {
                break;
            }
        }

        Ok(relocated)
    }

    /// One cooperative unit of maintenance: visit the chunk under the
    /// cursor, relocating it if live, and finish the pass when the source
    /// is drained. Returns whether a record was relocated.
    fn relocation_step(&self, state: &mut StorageState) -> Result<bool> {
        let Some(pass) = &state.pass else {
            return Ok(false);
        };
        let source = pass.source;
        let cursor = pass.cursor;
        let target = 1 - source;

        if cursor >= state.files[source].append_end {
            // Source fully drained: truncate it and retire the pass.
            let file = &mut state.files[source];
            debug_assert_eq!(file.alloc_bytes, 0);
            debug_assert_eq!(file.live_bytes, 0);
            file.append_end = FILE_HEADER_SIZE as u64;
            file.free.clear();
            file.chunk_count = 0;
            file.alloc_bytes = 0;
            file.live_bytes = 0;
            file.sync_header()?;
            file.mapped.shrink_to(FILE_INITIAL_SIZE)?;
            state.pass = None;
            return Ok(false);
        }

        let (is_live, span, key_len, data_len, crc) = {
            let file = &state.files[source];
            let remaining = file.append_end - cursor;
            let header_bytes = file.mapped.slice(cursor, CHUNK_HEADER_SIZE)?;
            let chunk = ChunkHeader::from_bytes(header_bytes, remaining).wrap_err_with(|| {
                format!(
                    "maintenance aborted: corrupt chunk in '{}'",
                    file.mapped.path().display()
                )
            })?;
            (
                chunk.is_live(),
                chunk.span(),
                chunk.key_len(),
                chunk.data_len(),
                chunk.crc(),
            )
        };

        if !is_live {
            let file = &mut state.files[source];
            file.alloc_bytes -= span;
            file.chunk_count -= 1;
            if let Some(pass) = &mut state.pass {
                pass.cursor += span;
            }
            return Ok(false);
        }

        // Copy the payload out, then append it exactly-sized to the target.
        let payload_need = key_len + data_len;
        let payload = state.files[source]
            .mapped
            .slice(cursor + CHUNK_HEADER_SIZE as u64, payload_need as usize)?
            .to_vec();

        let seq = state.next_seq;
        state.next_seq += 1;

        let new_offset = {
            let file = &mut state.files[target];
            let offset = file.append_end;
            let new_span = CHUNK_HEADER_SIZE as u64 + payload_need as u64;
            file.mapped.grow_to(offset + new_span)?;

            let header = ChunkHeader::new_live(seq, payload_need, key_len, data_len, crc);
            file.mapped
                .slice_mut(offset + CHUNK_HEADER_SIZE as u64, payload_need as usize)?
                .copy_from_slice(&payload);
            file.mapped
                .slice_mut(offset, CHUNK_HEADER_SIZE)?
                .copy_from_slice(header.as_bytes());

            file.append_end = offset + new_span;
            file.alloc_bytes += new_span;
            file.live_bytes += new_span;
            file.chunk_count += 1;
            file.sync_header()?;
            // The new copy must be durable before the old chunk is
            // released; a crash in between leaves both live and the
            // sequence number picks the winner at the next open.
            file.mapped.flush_range(offset, new_span as usize)?;
            file.mapped.flush_range(0, FILE_HEADER_SIZE)?;
            offset
        };

        let addr = SlotAddr {
            file: target,
            offset: new_offset,
            capacity: payload_need,
            key_len,
            data_len,
        };
        state
            .index
            .insert(payload[..key_len as usize].into(), addr);

        {
            let file = &mut state.files[source];
            let bytes = file.mapped.slice_mut(cursor, CHUNK_HEADER_SIZE)?;
            ChunkHeader::view_mut(bytes)?.clear_live();
            file.alloc_bytes -= span;
            file.live_bytes -= CHUNK_HEADER_SIZE as u64 + payload_need as u64;
            file.chunk_count -= 1;
        }

        if let Some(pass) = &mut state.pass {
            pass.cursor += span;
        }
        Ok(true)
    }

    /// Writes a human-readable layout report. Diagnostic only; does not
    /// mutate state.
    pub fn dump_summary(&self, out: &mut dyn IoWrite) -> Result<()> {
        let state = self.state.read();

        writeln!(out, "double-file storage summary")?;
        for (i, file) in state.files.iter().enumerate() {
            writeln!(
                out,
                "  file {}: '{}' size={} append_end={} chunks={} live_bytes={} free_slots={} free_bytes={}{}",
                i,
                self.paths[i].display(),
                file.mapped.len(),
                file.append_end,
                file.chunk_count,
                file.live_bytes,
                file.free.slots(),
                file.free.total_capacity(),
                if i == state.active { " [active]" } else { "" },
            )?;
        }
        match &state.pass {
            Some(pass) => writeln!(
                out,
                "  maintenance: draining file {} (cursor={})",
                pass.source, pass.cursor
            )?,
            None => writeln!(out, "  maintenance: idle")?,
        }
        writeln!(out, "  records={}", state.index.len())?;
        writeln!(
            out,
            "  fragmentation={}%",
            state.fragmentation_percentage()
        )?;
        Ok(())
    }

    pub fn stats(&self) -> StorageStats {
        let state = self.state.read();
        StorageStats {
            records: state.index.len(),
            live_bytes: state.files[0].live_bytes + state.files[1].live_bytes,
            allocated_bytes: state.files[0].alloc_bytes + state.files[1].alloc_bytes,
            free_slots: state.files[0].free.slots() + state.files[1].free.slots(),
            fragmentation_percentage: state.fragmentation_percentage(),
            file_sizes: [state.files[0].mapped.len(), state.files[1].mapped.len()],
        }
    }

    /// Flushes both backing files and their headers to disk.
    pub fn sync(&self) -> Result<()> {
        let mut state = self.state.write();
        for file in state.files.iter_mut() {
            file.sync_header()?;
            file.mapped.flush()?;
        }
        Ok(())
    }

    /// Syncs and releases the engine. Equivalent to `sync` followed by
    /// drop; exists so callers can observe close-time I/O errors.
    pub fn close(self) -> Result<()> {
        self.sync()
    }
}

impl Drop for DoubleFileStorage {
    fn drop(&mut self) {
        // Best effort: close() is the path that reports errors.
        if let Some(mut state) = self.state.try_write() {
            for file in state.files.iter_mut() {
                let _ = file.sync_header();
                let _ = file.mapped.flush();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::test_support::blob_key;
    use crate::layering::{IdentityFsConverter, IdentityUnitsConverter};
    use tempfile::{tempdir, TempDir};

    fn open_storage(dir: &TempDir, create: bool) -> Result<DoubleFileStorage> {
        let descriptor = LayerDescriptor::writable(dir.path().join("layer").display().to_string());
        DoubleFileStorage::open(
            &descriptor,
            create,
            Arc::new(IdentityUnitsConverter),
            Arc::new(IdentityFsConverter),
        )
    }

    #[test]
    fn write_then_read_roundtrips() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();
        let key = blob_key(1, "alpha");

        storage.write(&key, b"payload-bytes").unwrap();

        assert_eq!(storage.read(&key).unwrap().unwrap(), b"payload-bytes");
    }

    #[test]
    fn read_of_absent_key_is_none() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();

        assert!(storage.read(&blob_key(1, "missing")).unwrap().is_none());
    }

    #[test]
    fn overwrite_replaces_contents() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();
        let key = blob_key(1, "alpha");

        storage.write(&key, b"first").unwrap();
        storage.write(&key, b"second, and longer than before").unwrap();

        assert_eq!(
            storage.read(&key).unwrap().unwrap(),
            b"second, and longer than before"
        );
    }

    #[test]
    fn remove_releases_the_record() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();
        let key = blob_key(1, "alpha");

        storage.write(&key, b"data").unwrap();
        assert!(storage.remove(&key).unwrap());
        assert!(storage.read(&key).unwrap().is_none());
        assert!(!storage.remove(&key).unwrap());

        let stats = storage.stats();
        assert_eq!(stats.records, 0);
        assert_eq!(stats.free_slots, 1);
    }

    #[test]
    fn open_without_create_fails_for_missing_layer() {
        let dir = tempdir().unwrap();

        let err = open_storage(&dir, false).unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn open_fails_when_one_backing_file_is_missing() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            storage.write(&blob_key(1, "k"), b"v").unwrap();
            storage.close().unwrap();
        }
        std::fs::remove_file(dir.path().join("layer/store.dfs1")).unwrap();

        let err = open_storage(&dir, false).unwrap_err();
        assert!(err.to_string().contains("corrupt"));
    }

    #[test]
    fn open_rejects_mangled_magic() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            storage.write(&blob_key(1, "k"), b"v").unwrap();
            storage.close().unwrap();
        }

        let path = dir.path().join("layer/store.dfs0");
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[0] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = open_storage(&dir, false).unwrap_err();
        assert!(err.to_string().contains("magic"));
    }

    #[test]
    fn open_rejects_corrupted_payload() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            storage.write(&blob_key(1, "k"), b"some record payload").unwrap();
            storage.close().unwrap();
        }

        let path = dir.path().join("layer/store.dfs0");
        let mut bytes = std::fs::read(&path).unwrap();
        // Flip a byte in the record data area, past the file header and
        // chunk header.
        let victim = FILE_HEADER_SIZE + CHUNK_HEADER_SIZE + 20;
        bytes[victim] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();

        let err = open_storage(&dir, false).unwrap_err();
        assert!(err.to_string().contains("checksum"));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            storage.write(&blob_key(1, "a"), b"value-a").unwrap();
            storage.write(&blob_key(2, "b"), b"value-b").unwrap();
            storage.remove(&blob_key(1, "a")).unwrap();
            storage.close().unwrap();
        }

        let storage = open_storage(&dir, false).unwrap();
        assert!(storage.read(&blob_key(1, "a")).unwrap().is_none());
        assert_eq!(storage.read(&blob_key(2, "b")).unwrap().unwrap(), b"value-b");
    }

    #[test]
    fn freed_slot_is_reused_by_fitting_write() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();

        storage.write(&blob_key(1, "a"), &[0u8; 256]).unwrap();
        storage.remove(&blob_key(1, "a")).unwrap();
        let before = storage.stats();

        storage.write(&blob_key(1, "b"), &[1u8; 64]).unwrap();
        let after = storage.stats();

        // The smaller record lands inside the freed 256-byte slot: no new
        // chunk is allocated, and the unused tail shows up as
        // fragmentation.
        assert_eq!(after.allocated_bytes, before.allocated_bytes);
        assert_eq!(after.free_slots, 0);
        assert!(after.fragmentation_percentage > 0);
    }

    #[test]
    fn fragmentation_is_zero_for_fresh_appends() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();

        for i in 0..10 {
            storage
                .write(&blob_key(1, &format!("key-{i}")), &[i as u8; 100])
                .unwrap();
        }

        assert_eq!(storage.fragmentation_percentage(), 0);
    }

    #[test]
    fn overwrite_churn_fragments_then_unbounded_maintenance_compacts() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();

        for i in 0..50 {
            storage
                .write(&blob_key(1, &format!("key-{i}")), &[0xAA; 600])
                .unwrap();
        }
        for i in 0..50 {
            storage
                .write(&blob_key(1, &format!("key-{i}")), &[0xBB; 40])
                .unwrap();
        }

        assert!(storage.fragmentation_percentage() > 50);

        storage.maintenance(0).unwrap();

        assert_eq!(storage.fragmentation_percentage(), 0);
        for i in 0..50 {
            assert_eq!(
                storage
                    .read(&blob_key(1, &format!("key-{i}")))
                    .unwrap()
                    .unwrap(),
                vec![0xBB; 40]
            );
        }
    }

    #[test]
    fn maintenance_on_compact_storage_is_a_noop() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();

        storage.write(&blob_key(1, "k"), b"v").unwrap();
        let relocated = storage.maintenance(0).unwrap();

        assert_eq!(relocated, 0);
        assert_eq!(storage.fragmentation_percentage(), 0);
    }

    #[test]
    fn records_survive_reopen_after_maintenance() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            for i in 0..20 {
                storage
                    .write(&blob_key(1, &format!("key-{i}")), &[0xCC; 300])
                    .unwrap();
            }
            for i in 0..20 {
                storage
                    .write(&blob_key(1, &format!("key-{i}")), &[0xDD; 30])
                    .unwrap();
            }
            storage.maintenance(0).unwrap();
            storage.close().unwrap();
        }

        let storage = open_storage(&dir, false).unwrap();
        assert_eq!(storage.fragmentation_percentage(), 0);
        for i in 0..20 {
            assert_eq!(
                storage
                    .read(&blob_key(1, &format!("key-{i}")))
                    .unwrap()
                    .unwrap(),
                vec![0xDD; 30]
            );
        }
    }

    #[test]
    fn dump_summary_reports_without_mutating() {
        let dir = tempdir().unwrap();
        let storage = open_storage(&dir, true).unwrap();
        storage.write(&blob_key(1, "k"), b"v").unwrap();

        let before = storage.stats();
        let mut report = Vec::new();
        storage.dump_summary(&mut report).unwrap();
        let after = storage.stats();

        let text = String::from_utf8(report).unwrap();
        assert!(text.contains("records=1"));
        assert!(text.contains("fragmentation=0%"));
        assert_eq!(before.allocated_bytes, after.allocated_bytes);
        assert_eq!(before.records, after.records);
    }

    #[test]
    fn create_true_reopens_existing_layer() {
        let dir = tempdir().unwrap();
        {
            let storage = open_storage(&dir, true).unwrap();
            storage.write(&blob_key(1, "k"), b"kept").unwrap();
            storage.close().unwrap();
        }

        let storage = open_storage(&dir, true).unwrap();
        assert_eq!(storage.read(&blob_key(1, "k")).unwrap().unwrap(), b"kept");
    }
}

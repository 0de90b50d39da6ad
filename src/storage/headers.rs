//! # On-Disk Header Definitions
//!
//! Type-safe, zerocopy-based headers for the storage engine's two backing
//! files.
//!
//! ## File Header
//!
//! Each backing file starts with a 128-byte [`FileHeader`]:
//!
//! ```text
//! Offset  Size  Description
//! 0       16    Magic: "modelstore dfs\0\0"
//! 16      4     Format version
//! 20      4     File index (0 or 1)
//! 24      8     append_end: one past the last allocated chunk
//! 32      8     chunk_count (diagnostic)
//! 40      88    Reserved
//! ```
//!
//! ## Chunk Header
//!
//! Every record slot - live or free - is a *chunk*: a 40-byte
//! [`ChunkHeader`] followed by `capacity` payload bytes. For a live chunk
//! the payload holds the key encoding, the record data, and any slack left
//! by best-fit slot reuse:
//!
//! ```text
//! Offset  Size  Description
//! 0       4     Chunk magic
//! 4       4     Flags (bit 0: live)
//! 8       8     Sequence number (monotonic per layer)
//! 16      4     capacity: payload span after this header
//! 20      4     key_len
//! 24      4     data_len
//! 28      4     CRC-32 of key bytes + data bytes (0 for free chunks)
//! 32      8     Reserved
//! ```
//!
//! The open-time scan walks chunks by `40 + capacity` strides from the file
//! header to `append_end`; any stride that does not land on a chunk magic,
//! overruns `append_end`, or fails its CRC is structural corruption and is
//! surfaced, never repaired silently.
//!
//! ## Sequence Numbers
//!
//! An overwrite (and a relocation) writes the new chunk completely before
//! freeing the old one, so a crash can leave two live chunks for one key.
//! The higher sequence number wins at open; the loser joins the free list.
//!
//! ## Zerocopy Safety
//!
//! All header structs use zerocopy traits (`FromBytes`/`IntoBytes`/
//! `Immutable`/`KnownLayout`/`Unaligned`) with little-endian wrapper types,
//! so they can be read in place from the mapped file without alignment
//! concerns.

use crc::{Crc, CRC_32_ISCSI};
use eyre::{ensure, Result};
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::config::{CHUNK_HEADER_SIZE, CHUNK_MAGIC, FILE_HEADER_SIZE, FILE_MAGIC, FORMAT_VERSION};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

pub const FLAG_LIVE: u32 = 1;

/// CRC over a live chunk's payload (key bytes then data bytes).
pub fn payload_checksum(key: &[u8], data: &[u8]) -> u32 {
    let mut digest = CRC32.digest();
    digest.update(key);
    digest.update(data);
    digest.finalize()
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct FileHeader {
    magic: [u8; 16],
    version: U32,
    file_index: U32,
    append_end: U64,
    chunk_count: U64,
    reserved: [u8; 88],
}

const _: () = assert!(std::mem::size_of::<FileHeader>() == FILE_HEADER_SIZE);

impl FileHeader {
    pub fn new(file_index: u32) -> Self {
        Self {
            magic: *FILE_MAGIC,
            version: U32::new(FORMAT_VERSION),
            file_index: U32::new(file_index),
            append_end: U64::new(FILE_HEADER_SIZE as u64),
            chunk_count: U64::new(0),
            reserved: [0u8; 88],
        }
    }

    pub fn from_bytes(bytes: &[u8], expected_index: u32, file_len: u64) -> Result<&Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        let header = Self::ref_from_bytes(&bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))?;

        ensure!(
            &header.magic == FILE_MAGIC,
            "storage file corrupt: invalid magic bytes"
        );

        ensure!(
            header.version.get() == FORMAT_VERSION,
            "unsupported storage format version: {} (expected {})",
            header.version.get(),
            FORMAT_VERSION
        );

        ensure!(
            header.file_index.get() == expected_index,
            "storage file corrupt: file index {} where {} was expected",
            header.file_index.get(),
            expected_index
        );

        let append_end = header.append_end.get();
        ensure!(
            append_end >= FILE_HEADER_SIZE as u64 && append_end <= file_len,
            "storage file corrupt: append end {} outside file of {} bytes",
            append_end,
            file_len
        );

        Ok(header)
    }

    /// In-place mutable view over an already-validated header, for updating
    /// `append_end`/`chunk_count` through the mapped file.
    pub fn view_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= FILE_HEADER_SIZE,
            "buffer too small for FileHeader: {} < {}",
            bytes.len(),
            FILE_HEADER_SIZE
        );

        <Self as FromBytes>::mut_from_bytes(&mut bytes[..FILE_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse FileHeader: {:?}", e))
    }

    zerocopy_getters! {
        version: u32,
        file_index: u32,
    }

    zerocopy_accessors! {
        append_end: u64,
        chunk_count: u64,
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct ChunkHeader {
    magic: U32,
    flags: U32,
    seq: U64,
    capacity: U32,
    key_len: U32,
    data_len: U32,
    crc: U32,
    reserved: [u8; 8],
}

const _: () = assert!(std::mem::size_of::<ChunkHeader>() == CHUNK_HEADER_SIZE);

impl ChunkHeader {
    pub fn new_live(seq: u64, capacity: u32, key_len: u32, data_len: u32, crc: u32) -> Self {
        Self {
            magic: U32::new(CHUNK_MAGIC),
            flags: U32::new(FLAG_LIVE),
            seq: U64::new(seq),
            capacity: U32::new(capacity),
            key_len: U32::new(key_len),
            data_len: U32::new(data_len),
            crc: U32::new(crc),
            reserved: [0u8; 8],
        }
    }

    pub fn new_free(capacity: u32) -> Self {
        Self {
            magic: U32::new(CHUNK_MAGIC),
            flags: U32::new(0),
            seq: U64::new(0),
            capacity: U32::new(capacity),
            key_len: U32::new(0),
            data_len: U32::new(0),
            crc: U32::new(0),
            reserved: [0u8; 8],
        }
    }

    /// Parses and structurally validates one chunk header at the start of
    /// `bytes`. `remaining` is the extent from the header to `append_end`;
    /// a chunk whose span overruns it means the file is corrupt.
    pub fn from_bytes(bytes: &[u8], remaining: u64) -> Result<&Self> {
        ensure!(
            bytes.len() >= CHUNK_HEADER_SIZE && remaining >= CHUNK_HEADER_SIZE as u64,
            "storage file corrupt: truncated chunk header"
        );

        let header = Self::ref_from_bytes(&bytes[..CHUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ChunkHeader: {:?}", e))?;

        ensure!(
            header.magic.get() == CHUNK_MAGIC,
            "storage file corrupt: bad chunk magic 0x{:08x}",
            header.magic.get()
        );

        ensure!(
            header.span() <= remaining,
            "storage file corrupt: chunk span {} overruns append end by {}",
            header.span(),
            header.span() - remaining
        );

        let payload = header.key_len.get() as u64 + header.data_len.get() as u64;
        ensure!(
            payload <= header.capacity.get() as u64,
            "storage file corrupt: chunk payload {} exceeds capacity {}",
            payload,
            header.capacity.get()
        );

        Ok(header)
    }

    /// In-place mutable view over an already-validated chunk header, for
    /// flipping the live flag through the mapped file.
    pub fn view_mut(bytes: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            bytes.len() >= CHUNK_HEADER_SIZE,
            "buffer too small for ChunkHeader: {} < {}",
            bytes.len(),
            CHUNK_HEADER_SIZE
        );

        <Self as FromBytes>::mut_from_bytes(&mut bytes[..CHUNK_HEADER_SIZE])
            .map_err(|e| eyre::eyre!("failed to parse ChunkHeader: {:?}", e))
    }

    pub fn is_live(&self) -> bool {
        self.flags.get() & FLAG_LIVE != 0
    }

    pub fn clear_live(&mut self) {
        self.flags = U32::new(self.flags.get() & !FLAG_LIVE);
    }

    /// Full on-disk span of this chunk: header plus payload capacity.
    pub fn span(&self) -> u64 {
        CHUNK_HEADER_SIZE as u64 + self.capacity.get() as u64
    }

    zerocopy_getters! {
        seq: u64,
        capacity: u32,
        key_len: u32,
        data_len: u32,
        crc: u32,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zerocopy::IntoBytes;

    #[test]
    fn file_header_roundtrip() {
        let mut header = FileHeader::new(1);
        header.set_append_end(4096);
        header.set_chunk_count(3);

        let bytes = header.as_bytes().to_vec();
        let parsed = FileHeader::from_bytes(&bytes, 1, 1 << 20).unwrap();

        assert_eq!(parsed.version(), FORMAT_VERSION);
        assert_eq!(parsed.file_index(), 1);
        assert_eq!(parsed.append_end(), 4096);
        assert_eq!(parsed.chunk_count(), 3);
    }

    #[test]
    fn file_header_rejects_bad_magic() {
        let header = FileHeader::new(0);
        let mut bytes = header.as_bytes().to_vec();
        bytes[0] ^= 0xFF;

        let err = FileHeader::from_bytes(&bytes, 0, 1 << 20).unwrap_err();
        assert!(err.to_string().contains("invalid magic"));
    }

    #[test]
    fn file_header_rejects_wrong_index() {
        let header = FileHeader::new(0);
        let bytes = header.as_bytes().to_vec();

        assert!(FileHeader::from_bytes(&bytes, 1, 1 << 20).is_err());
    }

    #[test]
    fn file_header_rejects_append_end_past_file() {
        let mut header = FileHeader::new(0);
        header.set_append_end(10_000);
        let bytes = header.as_bytes().to_vec();

        let err = FileHeader::from_bytes(&bytes, 0, 4096).unwrap_err();
        assert!(err.to_string().contains("append end"));
    }

    #[test]
    fn chunk_header_roundtrip() {
        let crc = payload_checksum(b"key", b"value");
        let header = ChunkHeader::new_live(42, 100, 3, 5, crc);

        let bytes = header.as_bytes().to_vec();
        let parsed = ChunkHeader::from_bytes(&bytes, 1 << 20).unwrap();

        assert!(parsed.is_live());
        assert_eq!(parsed.seq(), 42);
        assert_eq!(parsed.capacity(), 100);
        assert_eq!(parsed.key_len(), 3);
        assert_eq!(parsed.data_len(), 5);
        assert_eq!(parsed.crc(), crc);
        assert_eq!(parsed.span(), (CHUNK_HEADER_SIZE + 100) as u64);
    }

    #[test]
    fn chunk_header_rejects_span_overrun() {
        let header = ChunkHeader::new_free(1000);
        let bytes = header.as_bytes().to_vec();

        let err = ChunkHeader::from_bytes(&bytes, 100).unwrap_err();
        assert!(err.to_string().contains("overruns"));
    }

    #[test]
    fn chunk_header_rejects_payload_beyond_capacity() {
        let header = ChunkHeader::new_live(1, 4, 3, 5, 0);
        let bytes = header.as_bytes().to_vec();

        let err = ChunkHeader::from_bytes(&bytes, 1 << 20).unwrap_err();
        assert!(err.to_string().contains("exceeds capacity"));
    }

    #[test]
    fn payload_checksum_is_order_sensitive() {
        assert_ne!(
            payload_checksum(b"ab", b"cd"),
            payload_checksum(b"cd", b"ab")
        );
    }
}

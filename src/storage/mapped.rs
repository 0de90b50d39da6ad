//! # Memory-Mapped Backing File
//!
//! `MappedFile` is the low-level building block under [`super::DoubleFileStorage`]:
//! one backing file mapped into the process address space, accessed as byte
//! extents. Records in a repository layer are arbitrary-length, so unlike a
//! paged store this type is byte-granular; all callers address it with
//! `(offset, len)` extents that are bounds-checked against the mapped
//! length.
//!
//! ## Safety Model
//!
//! A mapped region becomes invalid when the file is resized and remapped.
//! Rather than runtime guards, the borrow checker enforces safety at
//! compile time:
//!
//! ```text
//! slice(&self, ..) -> &[u8]          // immutable borrow of self
//! slice_mut(&mut self, ..) -> &mut [u8]
//! grow_to(&mut self, ..)             // exclusive borrow: no live slices
//! shrink_to(&mut self, ..)           // exclusive borrow: no live slices
//! ```
//!
//! Since resizing requires `&mut self`, no extent reference can outlive a
//! remap.
//!
//! ## Growth and Shrink
//!
//! Files grow in [`crate::config::FILE_GROW_STEP`] increments so appends
//! amortize the flush+remap cost. Shrinking exists for one caller: the
//! defragmentation pass truncates a fully drained file back to its header.
//!
//! ## Durability
//!
//! `flush` syncs the whole mapping; `flush_range` syncs one extent and is
//! used by relocation steps, which must make the new copy of a record
//! durable before releasing the old one.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;

use crate::config::FILE_GROW_STEP;

#[derive(Debug)]
pub struct MappedFile {
    file: File,
    mmap: MmapMut,
    len: u64,
    path: PathBuf,
}

impl MappedFile {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open storage file '{}'", path.display()))?;

        let metadata = file
            .metadata()
            .wrap_err_with(|| format!("failed to get metadata for '{}'", path.display()))?;

        let len = metadata.len();

        ensure!(
            len > 0,
            "cannot open empty storage file '{}'",
            path.display()
        );

        // SAFETY: MmapMut::map_mut is unsafe because memory-mapped files can
        // be modified externally. This is safe because:
        // 1. The layer's files are exclusively owned by one storage engine
        //    instance per process (shared-resource policy of the layer)
        // 2. The mmap lifetime is tied to MappedFile, preventing
        //    use-after-unmap
        // 3. All access goes through slice()/slice_mut() which bounds-check
        //    the extent against the mapped length
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            len,
            path: path.to_path_buf(),
        })
    }

    pub fn create<P: AsRef<Path>>(path: P, initial_len: u64) -> Result<Self> {
        let path = path.as_ref();

        ensure!(initial_len > 0, "initial file length must be at least 1");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create storage file '{}'", path.display()))?;

        file.set_len(initial_len)
            .wrap_err_with(|| format!("failed to set file size to {} bytes", initial_len))?;

        // SAFETY: see open() - additionally the file was just created with
        // truncate=true, so no other mapping of it can exist yet.
        let mmap = unsafe {
            MmapMut::map_mut(&file)
                .wrap_err_with(|| format!("failed to memory-map '{}'", path.display()))?
        };

        Ok(Self {
            file,
            mmap,
            len: initial_len,
            path: path.to_path_buf(),
        })
    }

    pub fn slice(&self, offset: u64, len: usize) -> Result<&[u8]> {
        self.check_extent(offset, len)?;
        let start = offset as usize;
        Ok(&self.mmap[start..start + len])
    }

    pub fn slice_mut(&mut self, offset: u64, len: usize) -> Result<&mut [u8]> {
        self.check_extent(offset, len)?;
        let start = offset as usize;
        Ok(&mut self.mmap[start..start + len])
    }

    fn check_extent(&self, offset: u64, len: usize) -> Result<()> {
        let end = offset
            .checked_add(len as u64)
            .ok_or_else(|| eyre::eyre!("extent {}+{} overflows", offset, len))?;
        ensure!(
            end <= self.len,
            "extent {}..{} out of bounds in '{}' (len={})",
            offset,
            end,
            self.path.display(),
            self.len
        );
        Ok(())
    }

    /// Ensures the file is at least `min_len` bytes, growing in
    /// `FILE_GROW_STEP` increments. No-op when already large enough.
    pub fn grow_to(&mut self, min_len: u64) -> Result<()> {
        if min_len <= self.len {
            return Ok(());
        }

        let new_len = min_len.div_ceil(FILE_GROW_STEP) * FILE_GROW_STEP;

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before grow")?;

        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to extend file to {} bytes", new_len))?;

        // SAFETY: grow_to() requires &mut self, so no extent references can
        // exist (borrow checker). The old mmap was flushed above and is
        // dropped when the new one is assigned.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after grow")? };

        self.len = new_len;

        Ok(())
    }

    /// Truncates the file to `new_len` bytes. Used when a defragmentation
    /// pass has drained every live record out of this file.
    pub fn shrink_to(&mut self, new_len: u64) -> Result<()> {
        if new_len >= self.len {
            return Ok(());
        }

        ensure!(new_len > 0, "cannot shrink a storage file to zero length");

        self.mmap
            .flush()
            .wrap_err("failed to flush mmap before shrink")?;

        self.file
            .set_len(new_len)
            .wrap_err_with(|| format!("failed to truncate file to {} bytes", new_len))?;

        // SAFETY: same argument as grow_to() - exclusive borrow, flushed,
        // old mapping dropped on assignment.
        self.mmap =
            unsafe { MmapMut::map_mut(&self.file).wrap_err("failed to remap file after shrink")? };

        self.len = new_len;

        Ok(())
    }

    pub fn flush(&self) -> Result<()> {
        self.mmap.flush().wrap_err("failed to sync mmap to disk")
    }

    pub fn flush_range(&self, offset: u64, len: usize) -> Result<()> {
        self.check_extent(offset, len)?;
        self.mmap
            .flush_range(offset as usize, len)
            .wrap_err("failed to sync mmap range to disk")
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Hints the kernel to fault in an extent ahead of a sequential scan
    /// (the open-time chunk replay).
    pub fn prefetch(&self, offset: u64, len: usize) {
        if self.check_extent(offset, len).is_err() {
            return;
        }

        #[cfg(unix)]
        // SAFETY: the extent was bounds-checked above, so the pointer range
        // lies inside the mapping. madvise with MADV_WILLNEED is advisory
        // and does not change memory contents.
        unsafe {
            libc::madvise(
                self.mmap.as_ptr().add(offset as usize) as *mut libc::c_void,
                len,
                libc::MADV_WILLNEED,
            );
        }
    }
}

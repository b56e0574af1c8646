// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Append-only, memory-mapped files. Each file is created at its maximum
//! capacity and mapped once. Appends copy into the mapping and then publish
//! the new length with release ordering, so a reader that loads the length
//! can read every byte below it without further coordination.

use crate::*;

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicUsize, Ordering};
use memmap2::{MmapOptions, MmapRaw};
use parking_lot::Mutex;

use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

pub struct CacheFile {
    store: &'static str,
    path: PathBuf,
    file: File,
    mmap: Option<MmapRaw>,
    // bytes published to readers, only ever increases
    len: AtomicUsize,
    // bytes that may be published, drops to `len` on freeze
    limit: AtomicUsize,
    frozen: AtomicBool,
    appender: Mutex<()>,
}

impl CacheFile {
    /// Create a new file at the given path with room for `capacity` bytes.
    /// Any existing file at that path is replaced.
    pub fn create<T: AsRef<Path>>(
        store: &'static str,
        path: T,
        capacity: usize,
    ) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&path)?;

        // grow the file to the full capacity, the filesystem keeps it sparse
        file.set_len(capacity as u64)?;

        let mmap = if capacity > 0 {
            Some(MmapOptions::new().len(capacity).map_raw(&file)?)
        } else {
            None
        };

        Ok(Self {
            store,
            path,
            file,
            mmap,
            len: AtomicUsize::new(0),
            limit: AtomicUsize::new(capacity),
            frozen: AtomicBool::new(false),
            appender: Mutex::new(()),
        })
    }

    /// Open an existing file. Its full content is treated as published and
    /// the file accepts no further appends.
    pub fn open<T: AsRef<Path>>(store: &'static str, path: T) -> Result<Self, std::io::Error> {
        let path = path.as_ref().to_path_buf();

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let size = file.metadata()?.len() as usize;

        let mmap = if size > 0 {
            Some(MmapOptions::new().len(size).map_raw(&file)?)
        } else {
            None
        };

        Ok(Self {
            store,
            path,
            file,
            mmap,
            len: AtomicUsize::new(size),
            limit: AtomicUsize::new(size),
            frozen: AtomicBool::new(true),
            appender: Mutex::new(()),
        })
    }

    pub fn store(&self) -> &'static str {
        self.store
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes published so far.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of bytes this file may hold.
    pub fn capacity(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Number of bytes which may still be appended.
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.len())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::Acquire)
    }

    /// Append a single byte slice, returning the position it was written at.
    pub fn append(&self, bytes: &[u8]) -> CacheResult<usize> {
        self.append_parts(&[bytes])
    }

    /// Append several byte slices back to back and publish them together.
    /// Nothing is written unless all of them fit.
    pub fn append_parts(&self, parts: &[&[u8]]) -> CacheResult<usize> {
        let _appender = self.appender.lock();

        let required: usize = parts.iter().map(|p| p.len()).sum();
        let position = self.len.load(Ordering::Relaxed);
        let limit = self.limit.load(Ordering::Relaxed);

        if position + required > limit {
            return Err(CacheError::capacity(
                self.store,
                required,
                limit - position,
            ));
        }

        if required == 0 {
            return Ok(position);
        }

        // limit is non-zero here, so the file is mapped
        let base = self.base_ptr();
        let mut at = position;
        for part in parts {
            // SAFETY: `at + part.len()` stays within `limit`, which never
            // exceeds the mapped length. The appender lock keeps writers
            // out of each other's way and readers never look past `len`.
            unsafe {
                core::ptr::copy_nonoverlapping(part.as_ptr(), base.add(at), part.len());
            }
            at += part.len();
        }

        self.len.store(at, Ordering::Release);

        Ok(position)
    }

    /// Returns the published bytes in `position..position + length`.
    pub fn bytes(&self, position: usize, length: usize) -> Option<&[u8]> {
        let end = position.checked_add(length)?;
        if end > self.len() {
            return None;
        }
        if length == 0 {
            return Some(&[]);
        }

        // SAFETY: the range is below the published length and published
        // bytes are never moved or unmapped while `self` is alive.
        unsafe {
            Some(core::slice::from_raw_parts(
                self.base_ptr().add(position),
                length,
            ))
        }
    }

    pub fn read_u64(&self, position: usize) -> Option<u64> {
        self.bytes(position, 8)
            .map(|b| u64::from_ne_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]]))
    }

    pub fn read_i64(&self, position: usize) -> Option<i64> {
        self.read_u64(position).map(|v| v as i64)
    }

    pub fn read_u32(&self, position: usize) -> Option<u32> {
        self.bytes(position, 4)
            .map(|b| u32::from_ne_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn read_i32(&self, position: usize) -> Option<i32> {
        self.read_u32(position).map(|v| v as i32)
    }

    /// Returns an atomic view of a published, 4-byte aligned field so it can
    /// be updated in place.
    pub fn atomic_u32(&self, position: usize) -> Option<&AtomicU32> {
        if position % 4 != 0 || position + 4 > self.len() {
            return None;
        }

        // SAFETY: the mapping is page aligned, so an aligned offset gives an
        // aligned pointer. The field is inside the published range.
        unsafe { Some(&*(self.base_ptr().add(position) as *const AtomicU32)) }
    }

    /// Returns an atomic view of a published, 8-byte aligned field.
    pub fn atomic_i64(&self, position: usize) -> Option<&AtomicI64> {
        if position % 8 != 0 || position + 8 > self.len() {
            return None;
        }

        // SAFETY: as for `atomic_u32`
        unsafe { Some(&*(self.base_ptr().add(position) as *const AtomicI64)) }
    }

    /// Flush the published bytes, trim the file down to them, and close the
    /// file to further appends. Calling this again has no effect.
    pub fn freeze(&self) -> CacheResult {
        let _appender = self.appender.lock();

        if self.frozen.load(Ordering::Relaxed) {
            return Ok(());
        }

        let len = self.len.load(Ordering::Relaxed);

        if let Some(mmap) = &self.mmap {
            if len > 0 {
                mmap.flush_range(0, len)?;
            }
        }

        self.file.set_len(len as u64)?;
        self.limit.store(len, Ordering::Release);
        self.frozen.store(true, Ordering::Release);

        Ok(())
    }

    /// Remove the file from the filesystem. The mapping stays readable until
    /// this value is dropped.
    pub fn delete(&self) -> CacheResult {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn base_ptr(&self) -> *mut u8 {
        match &self.mmap {
            Some(mmap) => mmap.as_mut_ptr(),
            None => core::ptr::NonNull::dangling().as_ptr(),
        }
    }
}

impl core::fmt::Display for CacheFile {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy())
            .unwrap_or_default();
        write!(f, "[CacheFile] {} ({})", name, self.len())
    }
}

// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! Index files hold fixed size 8-byte records. The upper 32 bits of a record
//! are its key and the lower 32 bits its value, typically a log position.
//! Every search returns a cursor; a miss is reported through the cursor's
//! value as either `NEXT_SEGMENT_VALUE` or `RETRY_SEGMENT_VALUE`.

use crate::cursor::{self, NEXT_SEGMENT_VALUE, RETRY_SEGMENT_VALUE};
use crate::*;

use std::ffi::OsString;
use std::path::{Path, PathBuf};

pub const RECORD_SIZE: usize = 8;

#[inline]
pub const fn record(key: u32, value: u32) -> u64 {
    ((key as u64) << 32) | value as u64
}

#[inline]
pub const fn record_key(record: u64) -> u32 {
    (record >> 32) as u32
}

#[inline]
pub const fn record_value(record: u64) -> u32 {
    record as u32
}

/// How records in an index file are ordered, which decides whether key
/// lookups can binary search.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexOrder {
    /// Records ascend by key, compared as unsigned.
    ByKey,
    /// Records are in append order, which ascends by value.
    ByValue,
}

pub struct IndexFile {
    file: CacheFile,
    order: IndexOrder,
}

impl IndexFile {
    pub fn create<T: AsRef<Path>>(
        store: &'static str,
        path: T,
        capacity: usize,
        order: IndexOrder,
    ) -> Result<Self, std::io::Error> {
        // only whole records fit
        let capacity = capacity - capacity % RECORD_SIZE;
        Ok(Self {
            file: CacheFile::create(store, path, capacity)?,
            order,
        })
    }

    pub fn open<T: AsRef<Path>>(
        store: &'static str,
        path: T,
        order: IndexOrder,
    ) -> Result<Self, std::io::Error> {
        Ok(Self {
            file: CacheFile::open(store, path)?,
            order,
        })
    }

    pub fn file(&self) -> &CacheFile {
        &self.file
    }

    pub fn order(&self) -> IndexOrder {
        self.order
    }

    /// Number of published records.
    pub fn records(&self) -> usize {
        self.file.len() / RECORD_SIZE
    }

    pub fn append(&self, key: u32, value: u32) -> CacheResult {
        self.file.append(&record(key, value).to_ne_bytes()).map(|_| ())
    }

    pub fn record(&self, index: usize) -> Option<u64> {
        self.file.read_u64(index * RECORD_SIZE)
    }

    // Forward searches that find nothing point just past the last record.
    // While the file can still grow the caller should retry from there.
    fn miss_forward(&self, records: usize) -> i64 {
        let value = if self.file.available() != 0 {
            RETRY_SEGMENT_VALUE
        } else {
            NEXT_SEGMENT_VALUE
        };
        cursor::encode(records as i32, value)
    }

    fn miss_backward(&self) -> i64 {
        cursor::encode(-1, NEXT_SEGMENT_VALUE)
    }

    fn hit(index: usize, record: u64) -> i64 {
        cursor::encode(index as i32, record_value(record) as i32)
    }

    fn key_at(&self, index: usize) -> u32 {
        self.record(index).map(record_key).unwrap_or(u32::MAX)
    }

    // index of the first record whose key is not less than `key`
    fn lower_bound(&self, key: u32, records: usize) -> usize {
        let mut low = 0;
        let mut high = records;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) < key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    // index of the first record whose key is greater than `key`
    fn upper_bound(&self, key: u32, records: usize) -> usize {
        let mut low = 0;
        let mut high = records;
        while low < high {
            let mid = low + (high - low) / 2;
            if self.key_at(mid) <= key {
                low = mid + 1;
            } else {
                high = mid;
            }
        }
        low
    }

    /// Finds the earliest record with exactly this key.
    pub fn first(&self, key: u32) -> i64 {
        let records = self.records();

        match self.order {
            IndexOrder::ByKey => {
                let index = self.lower_bound(key, records);
                match self.record(index) {
                    Some(r) if index < records && record_key(r) == key => Self::hit(index, r),
                    _ => self.miss_forward(records),
                }
            }
            IndexOrder::ByValue => (0..records)
                .find_map(|i| {
                    self.record(i)
                        .filter(|r| record_key(*r) == key)
                        .map(|r| Self::hit(i, r))
                })
                .unwrap_or_else(|| self.miss_forward(records)),
        }
    }

    /// Finds the latest record with exactly this key.
    pub fn last(&self, key: u32) -> i64 {
        let records = self.records();

        match self.order {
            IndexOrder::ByKey => {
                let index = self.upper_bound(key, records);
                match index.checked_sub(1).and_then(|i| self.record(i).map(|r| (i, r))) {
                    Some((i, r)) if record_key(r) == key => Self::hit(i, r),
                    _ => self.miss_backward(),
                }
            }
            IndexOrder::ByValue => (0..records)
                .rev()
                .find_map(|i| {
                    self.record(i)
                        .filter(|r| record_key(*r) == key)
                        .map(|r| Self::hit(i, r))
                })
                .unwrap_or_else(|| self.miss_backward()),
        }
    }

    /// Finds the earliest record holding the smallest key not less than
    /// `key`.
    pub fn ceiling_key(&self, key: u32) -> i64 {
        let records = self.records();

        match self.order {
            IndexOrder::ByKey => {
                let index = self.lower_bound(key, records);
                match self.record(index) {
                    Some(r) if index < records => Self::hit(index, r),
                    _ => self.miss_forward(records),
                }
            }
            IndexOrder::ByValue => {
                let mut best: Option<(usize, u64)> = None;
                for i in 0..records {
                    let Some(r) = self.record(i) else { break };
                    let k = record_key(r);
                    if k >= key && best.map(|(_, b)| k < record_key(b)).unwrap_or(true) {
                        best = Some((i, r));
                        if k == key {
                            break;
                        }
                    }
                }
                best.map(|(i, r)| Self::hit(i, r))
                    .unwrap_or_else(|| self.miss_forward(records))
            }
        }
    }

    /// Starting at the cursor's index, finds the first record whose value is
    /// not less than the cursor's value, regardless of key.
    pub fn resolve(&self, cursor: i64) -> i64 {
        self.scan_forward(cursor, |_, value, target| value >= target, None)
    }

    /// Scans forward for a record with this key and a value greater than the
    /// cursor's value.
    pub fn higher(&self, key: u32, cursor: i64) -> i64 {
        self.scan_forward(cursor, |_, value, target| value > target, Some(key))
    }

    /// Scans forward for a record with this key and a value not less than the
    /// cursor's value.
    pub fn ceiling(&self, key: u32, cursor: i64) -> i64 {
        self.scan_forward(cursor, |_, value, target| value >= target, Some(key))
    }

    /// Scans backward for a record with this key and a value not greater than
    /// the cursor's value.
    pub fn floor(&self, key: u32, cursor: i64) -> i64 {
        self.scan_backward(cursor, key, |value, target| value <= target)
    }

    /// Scans backward for a record with this key and a value less than the
    /// cursor's value.
    pub fn lower(&self, key: u32, cursor: i64) -> i64 {
        self.scan_backward(cursor, key, |value, target| value < target)
    }

    fn scan_forward<F>(&self, cursor: i64, accept: F, key: Option<u32>) -> i64
    where
        F: Fn(u32, u32, u32) -> bool,
    {
        let records = self.records();
        let start = cursor::index(cursor).max(0) as usize;
        let target = cursor::value(cursor) as u32;
        let retry = cursor::is_retry(cursor);

        for i in start..records {
            let Some(r) = self.record(i) else { break };
            let (k, v) = (record_key(r), record_value(r));
            if key.map(|key| key == k).unwrap_or(true) && (retry || accept(k, v, target)) {
                return Self::hit(i, r);
            }
        }

        self.miss_forward(records)
    }

    fn scan_backward<F>(&self, cursor: i64, key: u32, accept: F) -> i64
    where
        F: Fn(u32, u32) -> bool,
    {
        let records = self.records();
        let index = cursor::index(cursor);
        if index < 0 || records == 0 {
            return self.miss_backward();
        }

        let start = (index as usize).min(records - 1);
        let target = cursor::value(cursor) as u32;
        let retry = cursor::is_retry(cursor);

        for i in (0..=start).rev() {
            let Some(r) = self.record(i) else { continue };
            if record_key(r) == key && (retry || accept(record_value(r), target)) {
                return Self::hit(i, r);
            }
        }

        self.miss_backward()
    }

    /// Writes a copy of this file's records sorted by key into `path`,
    /// optionally dropping duplicate records, and returns it opened. The
    /// copy is built under a `.work` name and renamed into place. This file
    /// is deleted from disk afterwards but stays readable.
    pub fn sort_into<T: AsRef<Path>>(
        &self,
        store: &'static str,
        path: T,
        unique: bool,
    ) -> CacheResult<IndexFile> {
        let path = path.as_ref();

        let records = self.records();
        let mut sorted: Vec<u64> = (0..records).filter_map(|i| self.record(i)).collect();

        // u64 ordering sorts by key then value, both unsigned
        sorted.sort_unstable();
        if unique {
            sorted.dedup();
        }

        let mut bytes = Vec::with_capacity(sorted.len() * RECORD_SIZE);
        for r in &sorted {
            bytes.extend_from_slice(&r.to_ne_bytes());
        }

        let work = work_path(path);
        std::fs::write(&work, &bytes)?;
        std::fs::rename(&work, path)?;

        self.file.delete()?;

        Ok(IndexFile::open(store, path, IndexOrder::ByKey)?)
    }
}

fn work_path(path: &Path) -> PathBuf {
    let mut work = OsString::from(path.as_os_str());
    work.push(".work");
    PathBuf::from(work)
}

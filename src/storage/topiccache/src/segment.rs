// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A segment is one bounded, file-backed chunk of a partition's log. It is
//! made of six stores:
//!
//! * `log` holds the entries themselves
//! * `delta` holds JSON patches against each entry's ancestor
//! * `index` maps offset deltas to log positions
//! * `hash` maps key and header hashes to log positions
//! * `keys` lists the key hashes present, for cross-segment ancestor lookup
//! * `nulls` maps tombstone timestamps to log positions
//!
//! A head segment appends to all of them. Freezing a head produces a tail
//! that shares the log, delta and index files with the head but owns freshly
//! sorted copies of the hash, keys and nulls stores.

use crate::*;

use core::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const NO_DIRTY_SINCE: i64 = -1;
pub const NO_OFFSET: i64 = -1;

const EXT_LOG: &str = "log";
const EXT_DELTA: &str = "delta";
const EXT_INDEX: &str = "index";
const EXT_HSCAN: &str = "hscan";
const EXT_HINDEX: &str = "hindex";
const EXT_KSCAN: &str = "kscan";
const EXT_KINDEX: &str = "kindex";
const EXT_NSCAN: &str = "nscan";
const EXT_NINDEX: &str = "nindex";

// Mutable bookkeeping shared between a head and the tail frozen from it, so
// that dirt recorded through either is seen by compaction.
struct State {
    last_offset: AtomicI64,
    dirty_bytes: AtomicUsize,
    dirty_since: AtomicI64,
    cleanable_at: AtomicI64,
}

impl State {
    fn new() -> Self {
        Self {
            last_offset: AtomicI64::new(NO_OFFSET),
            dirty_bytes: AtomicUsize::new(0),
            dirty_since: AtomicI64::new(NO_DIRTY_SINCE),
            cleanable_at: AtomicI64::new(i64::MAX),
        }
    }
}

pub struct Segment {
    location: PathBuf,
    topic: String,
    partition: u32,
    base_offset: i64,
    id: u32,
    timestamp: i64,
    log: Arc<CacheFile>,
    delta: Arc<CacheFile>,
    index: Arc<IndexFile>,
    hash: IndexFile,
    keys: IndexFile,
    nulls: IndexFile,
    state: Arc<State>,
    deleted: AtomicBool,
    refs: RefCount,
}

/// Builds the path of one of a segment's files.
pub fn segment_path(location: &Path, partition: u32, base_offset: i64, id: u32, ext: &str) -> PathBuf {
    location.join(format!("{partition}-{base_offset:019}-{id}.{ext}"))
}

impl Segment {
    /// Creates a new head segment in `location`, with every store sized
    /// from the topic configuration.
    pub fn open(
        location: &Path,
        topic: &str,
        partition: u32,
        base_offset: i64,
        id: u32,
        config: &TopicConfig,
        timestamp: i64,
    ) -> CacheResult<Self> {
        let path = |ext: &str| segment_path(location, partition, base_offset, id, ext);
        let index_bytes = config.segment_index_bytes;

        let result = (|| -> Result<Self, std::io::Error> {
            Ok(Self {
                location: location.to_path_buf(),
                topic: topic.to_string(),
                partition,
                base_offset,
                id,
                timestamp,
                log: Arc::new(CacheFile::create("log", path(EXT_LOG), config.segment_bytes)?),
                delta: Arc::new(CacheFile::create(
                    "delta",
                    path(EXT_DELTA),
                    config.segment_bytes,
                )?),
                index: Arc::new(IndexFile::create(
                    "index",
                    path(EXT_INDEX),
                    index_bytes,
                    IndexOrder::ByKey,
                )?),
                hash: IndexFile::create("hash", path(EXT_HSCAN), index_bytes, IndexOrder::ByValue)?,
                keys: IndexFile::create("keys", path(EXT_KSCAN), index_bytes, IndexOrder::ByValue)?,
                nulls: IndexFile::create(
                    "nulls",
                    path(EXT_NSCAN),
                    index_bytes,
                    IndexOrder::ByValue,
                )?,
                state: Arc::new(State::new()),
                deleted: AtomicBool::new(false),
                refs: RefCount::new(),
            })
        })();

        match result {
            Ok(segment) => {
                SEGMENT_CREATE.increment();
                debug!("{} opened", segment);
                Ok(segment)
            }
            Err(e) => {
                SEGMENT_CREATE_EX.increment();
                error!(
                    "{topic}[{partition}] failed to open segment at {base_offset}: {e}"
                );
                Err(e.into())
            }
        }
    }

    pub fn base_offset(&self) -> i64 {
        self.base_offset
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> u32 {
        self.partition
    }

    /// Name of the partition this segment belongs to, as `topic[partition]`.
    pub fn name(&self) -> String {
        format!("{}[{}]", self.topic, self.partition)
    }

    /// Creation time of the segment's content, in unix milliseconds.
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn log_file(&self) -> &CacheFile {
        &self.log
    }

    pub fn delta_file(&self) -> &CacheFile {
        &self.delta
    }

    pub fn index_file(&self) -> &IndexFile {
        &self.index
    }

    pub fn hash_file(&self) -> &IndexFile {
        &self.hash
    }

    pub fn keys_file(&self) -> &IndexFile {
        &self.keys
    }

    pub fn nulls_file(&self) -> &IndexFile {
        &self.nulls
    }

    /// True while the segment still accepts appends.
    pub fn is_head(&self) -> bool {
        !self.log.is_frozen()
    }

    pub fn is_empty(&self) -> bool {
        self.log.is_empty()
    }

    pub fn last_offset(&self) -> i64 {
        self.state.last_offset.load(Ordering::Acquire)
    }

    /// The offset the next entry appended to this segment would carry.
    pub fn next_offset(&self) -> i64 {
        match self.last_offset() {
            NO_OFFSET => self.base_offset,
            last => last + 1,
        }
    }

    pub fn dirty_bytes(&self) -> usize {
        self.state.dirty_bytes.load(Ordering::Acquire)
    }

    pub fn dirty_since(&self) -> i64 {
        self.state.dirty_since.load(Ordering::Acquire)
    }

    /// Share of the log taken by entries superseded by later ones.
    pub fn cleanable_dirty_ratio(&self) -> f64 {
        let len = self.log.len();
        if len == 0 {
            return 0.0;
        }
        self.dirty_bytes() as f64 / len as f64
    }

    /// Earliest time compaction may rewrite this segment, `i64::MAX` if not
    /// yet scheduled.
    pub fn cleanable_at(&self) -> i64 {
        self.state.cleanable_at.load(Ordering::Acquire)
    }

    pub fn set_cleanable_at(&self, timestamp: i64) {
        self.state.cleanable_at.store(timestamp, Ordering::Release);
    }

    /// Timestamp of the oldest tombstone in this segment, if any.
    pub fn earliest_tombstone(&self) -> Option<i64> {
        let mut earliest = None;
        let records = match self.nulls.order() {
            IndexOrder::ByKey => self.nulls.records().min(1),
            IndexOrder::ByValue => self.nulls.records(),
        };
        for i in 0..records {
            if let Some(r) = self.nulls.record(i) {
                let at = self.timestamp + index::record_key(r) as i64;
                earliest = Some(earliest.map_or(at, |e: i64| e.min(at)));
            }
        }
        earliest
    }

    pub(crate) fn mark_dirty_bytes(&self, bytes: usize, now: i64) {
        self.state.dirty_bytes.fetch_add(bytes, Ordering::AcqRel);
        let _ = self.state.dirty_since.compare_exchange(
            NO_DIRTY_SINCE,
            now,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Checks that an entry with these dimensions fits in every store.
    pub fn ensure_capacity(
        &self,
        log_bytes: usize,
        hashes: usize,
        tombstone: bool,
        delta_bytes: usize,
    ) -> CacheResult {
        let checks = [
            (&*self.log, log_bytes),
            (&*self.delta, delta_bytes),
            (self.index.file(), index::RECORD_SIZE),
            (self.hash.file(), hashes * index::RECORD_SIZE),
            (self.keys.file(), index::RECORD_SIZE),
            (
                self.nulls.file(),
                if tombstone { index::RECORD_SIZE } else { 0 },
            ),
        ];

        for (file, required) in checks {
            if file.available() < required {
                return Err(CacheError::capacity(
                    file.store(),
                    required,
                    file.available(),
                ));
            }
        }

        Ok(())
    }

    /// Appends a record to the head segment and returns the entry written.
    /// When `delta_type` asks for a JSON patch and both this record and the
    /// ancestor have JSON values, the patch is kept in the delta file.
    ///
    /// Nothing is written unless the record fits in every store.
    pub fn append(
        self: &Arc<Self>,
        record: &Record,
        ancestor: Option<&Entry>,
        flags: u32,
        delta_type: DeltaType,
    ) -> CacheResult<Entry> {
        let delta = match (delta_type, ancestor.and_then(|a| a.value()), record.value) {
            (DeltaType::JsonPatch, Some(from), Some(to)) => {
                let patch = delta::json_patch(from, to);
                if patch.is_none() {
                    debug!("{} offset {}: value is not json, no delta", self, record.offset);
                }
                patch
            }
            _ => None,
        };

        // an oversized patch is left out rather than failing the append
        let delta = delta.filter(|d| 4 + d.len() <= self.delta.available());

        let info = EntryInfo {
            offset: record.offset,
            timestamp: record.timestamp,
            producer_id: record.producer_id,
            acknowledge: NO_ACKNOWLEDGE,
            ancestor: ancestor.map(|a| a.offset()).unwrap_or(NO_ANCESTOR_OFFSET),
            descendant: NO_DESCENDANT_OFFSET,
            flags,
            sequence: record.sequence,
            delta_type,
        };

        let headers = entry::encode_headers(record.headers);
        let position = self.write(
            &info,
            record.key,
            record.value,
            &headers,
            record.headers.len() as u32,
            delta.as_deref(),
        )?;

        if delta.is_some() {
            ENTRY_DELTA.increment();
        }

        Ok(Entry::new(self.clone(), position))
    }

    fn write(
        &self,
        info: &EntryInfo,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: &[u8],
        header_count: u32,
        delta: Option<&[u8]>,
    ) -> CacheResult<usize> {
        let offset_delta = info.offset - self.base_offset;
        if !(0..=u32::MAX as i64).contains(&offset_delta) {
            return Err(CacheError::OffsetRegression {
                offset: info.offset,
                progress: self.base_offset,
            });
        }

        let log_bytes = entry::entry_size(key, value, headers.len());
        let delta_bytes = delta.map(|d| 4 + d.len()).unwrap_or(0);
        self.ensure_capacity(log_bytes, 1 + header_count as usize, value.is_none(), delta_bytes)?;

        let delta_position = match delta {
            Some(delta) => self
                .delta
                .append_parts(&[&(delta.len() as u32).to_ne_bytes(), delta])?
                as i32,
            None => NO_DELTA_POSITION,
        };

        let header = info.encode(delta_position, key, value, headers, header_count);
        let unpadded = entry::HEADER_SIZE
            + key.map(|k| k.len()).unwrap_or(0)
            + value.map(|v| v.len()).unwrap_or(0)
            + headers.len();

        let position = self.log.append_parts(&[
            &header,
            key.unwrap_or(&[]),
            value.unwrap_or(&[]),
            headers,
            entry::padding(unpadded),
        ])?;
        let at = position as u32;

        let key_hash = entry::compute_key_hash(key);
        self.index.append(offset_delta as u32, at)?;
        self.hash.append(key_hash, at)?;
        for header in Headers::new(headers) {
            self.hash.append(entry::compute_header_hash(&header), at)?;
        }
        if value.is_none() {
            let timestamp_delta =
                (info.timestamp.saturating_sub(self.timestamp)).clamp(0, u32::MAX as i64) as u32;
            self.nulls.append(timestamp_delta, at)?;
        }
        self.keys.append(key_hash, 0)?;

        self.state.last_offset.store(info.offset, Ordering::Release);

        ENTRY_APPEND.increment();
        ENTRY_APPEND_BYTE.add(log_bytes as u64);

        Ok(position)
    }

    /// Flushes and trims the shared stores and returns a tail segment with
    /// newly sorted hash, keys and nulls stores. This segment accepts no
    /// further appends.
    pub fn freeze(&self) -> CacheResult<Segment> {
        self.log.freeze()?;
        self.delta.freeze()?;
        self.index.file().freeze()?;

        let path =
            |ext: &str| segment_path(&self.location, self.partition, self.base_offset, self.id, ext);

        let hash = self.hash.sort_into("hash", path(EXT_HINDEX), false)?;
        let keys = self.keys.sort_into("keys", path(EXT_KINDEX), true)?;
        let nulls = self.nulls.sort_into("nulls", path(EXT_NINDEX), true)?;

        SEGMENT_FREEZE.increment();
        debug!("{} frozen", self);

        Ok(Segment {
            location: self.location.clone(),
            topic: self.topic.clone(),
            partition: self.partition,
            base_offset: self.base_offset,
            id: self.id,
            timestamp: self.timestamp,
            log: self.log.clone(),
            delta: self.delta.clone(),
            index: self.index.clone(),
            hash,
            keys,
            nulls,
            state: self.state.clone(),
            deleted: AtomicBool::new(false),
            refs: RefCount::new(),
        })
    }

    /// Reads the entry at a log position. Returns `None`, counting it as a
    /// corrupt entry, if the bytes there do not form a complete entry.
    pub fn entry_at(self: &Arc<Self>, position: usize) -> Option<Entry> {
        let entry = Entry::read(self.clone(), position);
        if entry.is_none() && position < self.log.len() {
            ENTRY_CORRUPT.increment();
            warn!("{} unreadable entry at position {}", self, position);
        }
        entry
    }

    /// All entries in log order. Iteration stops at the first unreadable
    /// entry.
    pub fn entries(self: &Arc<Self>) -> Entries {
        Entries {
            segment: Acquired::new(self.clone()),
            position: 0,
        }
    }

    /// Finds the entry with exactly this offset.
    pub fn find_entry(self: &Arc<Self>, offset: i64) -> Option<Entry> {
        let delta = offset - self.base_offset;
        if !(0..=u32::MAX as i64).contains(&delta) {
            return None;
        }
        let found = self.index.first(delta as u32);
        if cursor::is_miss(found) {
            return None;
        }
        self.entry_at(cursor::value(found) as u32 as usize)
    }

    /// Finds the first entry with an offset not before `offset`.
    pub fn seek_entry(self: &Arc<Self>, offset: i64) -> Option<Entry> {
        let delta = (offset - self.base_offset).clamp(0, u32::MAX as i64) as u32;
        let found = self.index.ceiling_key(delta);
        if cursor::is_miss(found) {
            return None;
        }
        self.entry_at(cursor::value(found) as u32 as usize)
    }

    /// Searches the hash store for the most recent entry with this key at an
    /// offset before `before`. Hash collisions are resolved by comparing the
    /// key bytes. Aborted and control entries never match.
    pub fn find_ancestor(self: &Arc<Self>, key: Option<&[u8]>, key_hash: u32, before: i64) -> Option<Entry> {
        let key = key?;

        let mut found = self.hash.last(key_hash);
        while !cursor::is_miss(found) {
            let position = cursor::value(found) as u32 as usize;
            if let Some(entry) = self.entry_at(position) {
                if entry.offset() < before && !entry.is_aborted() && !entry.is_control() {
                    if entry.key() == Some(key) {
                        return Some(entry);
                    }
                    ANCESTOR_COLLISION.increment();
                }
            }
            found = self.hash.lower(key_hash, found);
        }

        None
    }

    /// Like [`Segment::find_ancestor`], then records `descendant` on the
    /// match and marks it dirty.
    pub fn find_and_mark_ancestor(
        self: &Arc<Self>,
        key: Option<&[u8]>,
        key_hash: u32,
        descendant: i64,
    ) -> Option<Entry> {
        let ancestor = self.find_ancestor(key, key_hash, descendant);
        match &ancestor {
            Some(entry) => {
                ANCESTOR_HIT.increment();
                mark_ancestor(entry, descendant);
            }
            None => {
                ANCESTOR_MISS.increment();
            }
        }
        ancestor
    }

    /// Marks the entry with exactly this offset dirty.
    pub fn find_and_mark_dirty(self: &Arc<Self>, offset: i64) -> Option<Entry> {
        let entry = self.find_entry(offset)?;
        mark_dirty(&entry);
        Some(entry)
    }

    /// Marks every non-control entry written by this producer aborted and
    /// returns how many were newly marked.
    pub fn find_and_abort_producer_id(self: &Arc<Self>, producer_id: i64) -> usize {
        let mut aborted = 0;
        for entry in self.entries() {
            if entry.producer_id() == producer_id
                && !entry.is_control()
                && entry.set_flags(FLAG_ABORTED) & FLAG_ABORTED == 0
            {
                aborted += 1;
            }
        }
        ENTRY_ABORT.add(aborted as u64);
        aborted
    }

    /// Rewrites this segment keeping only entries that are neither dirty nor
    /// tombstones past `delete_retention_ms`. Offsets keep their order. The
    /// result is a frozen segment at the same base offset with the next
    /// generation id, or `None` if nothing survived.
    pub fn clean(self: &Arc<Self>, now: i64, config: &TopicConfig) -> CacheResult<Option<Segment>> {
        let appender = Segment::open(
            &self.location,
            &self.topic,
            self.partition,
            self.base_offset,
            self.id + 1,
            config,
            self.timestamp,
        )?;

        let mut dropped = 0;
        for entry in self.entries() {
            if entry.is_dirty() {
                dropped += 1;
                continue;
            }

            if entry.is_tombstone()
                && entry.timestamp().saturating_add(config.delete_retention_ms) <= now
            {
                dropped += 1;
                continue;
            }

            let result = appender.write(
                &entry.info(),
                entry.key(),
                entry.value(),
                entry.headers_block(),
                entry.header_count(),
                entry.delta(),
            );

            if let Err(e) = result {
                appender.delete_files();
                return Err(e);
            }
        }

        let cleaned = match appender.freeze() {
            Ok(cleaned) => cleaned,
            Err(e) => {
                appender.delete_files();
                return Err(e);
            }
        };

        ENTRY_COMPACT.add(dropped);
        SEGMENT_CLEAN.increment();

        if cleaned.is_empty() {
            debug!("{} cleaned to nothing", self);
            cleaned.delete_files();
            Ok(None)
        } else {
            debug!("{} cleaned into {}, dropped {} entries", self, cleaned, dropped);
            Ok(Some(cleaned))
        }
    }

    /// Schedules removal of the segment's files for when it is closed and
    /// no longer acquired.
    pub fn delete(&self) {
        self.deleted.store(true, Ordering::Release);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    fn delete_files(&self) {
        let files = [
            &*self.log,
            &*self.delta,
            self.index.file(),
            self.hash.file(),
            self.keys.file(),
            self.nulls.file(),
        ];
        for file in files {
            if let Err(e) = file.delete() {
                error!("{} failed to delete {}: {}", self, file.path().display(), e);
            }
        }
    }
}

pub(crate) fn mark_ancestor(entry: &Entry, descendant: i64) {
    entry.set_descendant(descendant);
    mark_dirty(entry);
}

pub(crate) fn mark_dirty(entry: &Entry) {
    if entry.set_flags(FLAG_DIRTY) & FLAG_DIRTY == 0 {
        entry
            .segment()
            .mark_dirty_bytes(entry.size(), common::time::unix_millis());
    }
}

impl CacheObject for Segment {
    fn refs(&self) -> &RefCount {
        &self.refs
    }

    fn on_closed(&self) {
        if self.is_deleted() {
            debug!("{} deleting files", self);
            self.delete_files();
        }
    }
}

impl core::fmt::Display for Segment {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "[Segment] {}[{}] @ {} +{}",
            self.topic, self.partition, self.base_offset, self.id
        )
    }
}

/// Iterator over a segment's entries in log order.
pub struct Entries {
    segment: Acquired<Segment>,
    position: usize,
}

impl Iterator for Entries {
    type Item = Entry;

    fn next(&mut self) -> Option<Entry> {
        if self.position >= self.segment.log.len() {
            return None;
        }

        match self.segment.entry_at(self.position) {
            Some(entry) => {
                self.position += entry.size();
                Some(entry)
            }
            None => {
                // treat the rest of the segment as a gap
                self.position = usize::MAX;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config() -> TopicConfig {
        TopicConfig {
            segment_bytes: 4096,
            segment_index_bytes: 1024,
            ..Default::default()
        }
    }

    fn open(dir: &TempDir, base_offset: i64) -> Arc<Segment> {
        Arc::new(
            Segment::open(dir.path(), "test", 0, base_offset, 0, &config(), 1000)
                .expect("failed to open segment"),
        )
    }

    #[test]
    fn describe() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 10);
        assert_eq!(segment.to_string(), "[Segment] test[0] @ 10 +0");
        assert_eq!(segment.name(), "test[0]");
        assert_eq!(segment.next_offset(), 10);
        assert!(dir.path().join("0-0000000000000000010-0.log").exists());
    }

    #[test]
    fn append_and_find() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 10);

        let headers = [Header::new(b"header", b"value")];
        let record = Record::new(11, Some(b"test"), Some(b"one"))
            .timestamp(1001)
            .headers(&headers);
        let entry = segment
            .append(&record, None, 0, DeltaType::None)
            .expect("failed to append");

        assert_eq!(entry.position(), 0);
        assert_eq!(entry.offset(), 11);
        assert_eq!(entry.timestamp(), 1001);
        assert_eq!(entry.key(), Some(&b"test"[..]));
        assert_eq!(entry.value(), Some(&b"one"[..]));
        assert_eq!(entry.headers().collect::<Vec<_>>(), headers);
        assert_eq!(entry.ancestor(), NO_ANCESTOR_OFFSET);
        assert_eq!(segment.next_offset(), 12);

        segment
            .append(&Record::new(13, None, Some(b"two")), None, 0, DeltaType::None)
            .expect("failed to append");

        assert_eq!(segment.find_entry(11).map(|e| e.offset()), Some(11));
        assert!(segment.find_entry(12).is_none());
        assert_eq!(segment.seek_entry(12).map(|e| e.offset()), Some(13));
        assert_eq!(segment.seek_entry(0).map(|e| e.offset()), Some(11));
        assert!(segment.seek_entry(14).is_none());
        assert_eq!(
            segment.entries().map(|e| e.offset()).collect::<Vec<_>>(),
            vec![11, 13]
        );

        // key hash plus one hash per header
        assert_eq!(segment.hash_file().records(), 3);
        assert_eq!(segment.index_file().records(), 2);
    }

    #[test]
    fn corrupt_entry_is_a_gap() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 10);

        let mut positions = Vec::new();
        for offset in 10..13 {
            let entry = segment
                .append(&Record::new(offset, Some(b"k"), Some(b"v")), None, 0, DeltaType::None)
                .expect("failed to append");
            positions.push(entry.position());
        }

        // a key length running past the end of the log
        segment
            .log_file()
            .atomic_u32(positions[1] + entry::KEY_LEN)
            .expect("no key length")
            .store(i32::MAX as u32, Ordering::Release);

        let corrupt = ENTRY_CORRUPT.value();
        assert_eq!(
            segment.entries().map(|e| e.offset()).collect::<Vec<_>>(),
            vec![10]
        );
        assert!(segment.find_entry(11).is_none());
        assert_eq!(segment.find_entry(12).map(|e| e.offset()), Some(12));
        assert!(segment.find_ancestor(Some(b"k"), entry::compute_key_hash(Some(b"k")), 13).is_some());
        assert!(ENTRY_CORRUPT.value() >= corrupt + 2);
    }

    #[test]
    fn rejects_when_full() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 0);

        let value = vec![0u8; 4096];
        let result = segment.append(&Record::new(0, Some(b"k"), Some(&value[..])), None, 0, DeltaType::None);
        match result {
            Err(CacheError::CapacityExceeded { store, .. }) => assert_eq!(store, "log"),
            other => panic!("unexpected result: {other:?}"),
        }

        assert!(segment.is_empty());
        assert_eq!(segment.index_file().records(), 0);
        assert_eq!(segment.hash_file().records(), 0);
    }

    #[test]
    fn find_and_mark_ancestor() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 10);
        let key = b"test";
        let hash = entry::compute_key_hash(Some(key));

        segment
            .append(&Record::new(11, Some(key), Some(b"a")), None, 0, DeltaType::None)
            .expect("failed to append");
        segment
            .append(&Record::new(12, Some(b"other"), Some(b"b")), None, 0, DeltaType::None)
            .expect("failed to append");

        assert!(segment.find_and_mark_ancestor(None, hash, 13).is_none());
        assert!(segment.find_and_mark_ancestor(Some(key), hash, 11).is_none());
        assert_eq!(segment.dirty_bytes(), 0);

        let ancestor = segment
            .find_and_mark_ancestor(Some(key), hash, 13)
            .expect("no ancestor");
        assert_eq!(ancestor.offset(), 11);
        assert_eq!(ancestor.descendant(), 13);
        assert!(ancestor.is_dirty());
        assert_eq!(segment.dirty_bytes(), ancestor.size());
        assert_ne!(segment.dirty_since(), NO_DIRTY_SINCE);
    }

    #[test]
    fn abort_producer() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 0);

        for (offset, producer) in [(0, 7), (1, 8), (2, 7)] {
            segment
                .append(
                    &Record::new(offset, Some(b"k"), Some(b"v")).producer_id(producer),
                    None,
                    if offset == 2 { FLAG_CONTROL } else { 0 },
                    DeltaType::None,
                )
                .expect("failed to append");
        }

        assert_eq!(segment.find_and_abort_producer_id(7), 1);
        assert_eq!(segment.find_and_abort_producer_id(7), 0);

        let flags: Vec<bool> = segment.entries().map(|e| e.is_aborted()).collect();
        assert_eq!(flags, vec![true, false, false]);

        // aborted entries are never ancestors
        let hash = entry::compute_key_hash(Some(b"k"));
        let ancestor = segment.find_ancestor(Some(b"k"), hash, 3).expect("no ancestor");
        assert_eq!(ancestor.offset(), 1);
    }

    #[test]
    fn json_patch_delta() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 0);

        let ancestor = segment
            .append(&Record::new(0, Some(b"k"), Some(br#"{"a":1}"#)), None, 0, DeltaType::JsonPatch)
            .expect("failed to append");
        assert!(ancestor.delta().is_none());

        let entry = segment
            .append(
                &Record::new(1, Some(b"k"), Some(br#"{"a":2}"#)),
                Some(&ancestor),
                0,
                DeltaType::JsonPatch,
            )
            .expect("failed to append");

        assert_eq!(entry.ancestor(), 0);
        assert_eq!(entry.delta_type(), DeltaType::JsonPatch);
        assert_eq!(
            entry.delta(),
            Some(&br#"[{"op":"replace","path":"/a","value":2}]"#[..])
        );
    }

    #[test]
    fn freeze_sorts_stores() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let head = open(&dir, 0);

        for (offset, key) in [(0, "b"), (1, "a"), (2, "b")] {
            head.append(
                &Record::new(offset, Some(key.as_bytes()), None).timestamp(1000 + offset),
                None,
                0,
                DeltaType::None,
            )
            .expect("failed to append");
        }

        let tail = Arc::new(head.freeze().expect("failed to freeze"));
        assert_eq!(tail.to_string(), head.to_string());
        assert!(!tail.is_head());
        assert!(Arc::ptr_eq(&head.log, &tail.log));
        assert_eq!(tail.hash_file().order(), IndexOrder::ByKey);
        assert_eq!(tail.keys_file().records(), 2);
        assert_eq!(tail.nulls_file().records(), 3);
        assert_eq!(tail.earliest_tombstone(), Some(1000));
        assert!(dir.path().join("0-0000000000000000000-0.hindex").exists());
        assert!(!dir.path().join("0-0000000000000000000-0.hscan").exists());

        assert_eq!(tail.find_entry(2).map(|e| e.key().map(|k| k.to_vec())), Some(Some(b"b".to_vec())));

        let hash = entry::compute_key_hash(Some(b"b"));
        let ancestor = tail.find_ancestor(Some(b"b"), hash, 3).expect("no ancestor");
        assert_eq!(ancestor.offset(), 2);

        assert!(head
            .append(&Record::new(3, None, None), None, 0, DeltaType::None)
            .is_err());
    }

    #[test]
    fn clean_drops_dirty_and_expired_tombstones() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let head = open(&dir, 10);
        let key = b"test";
        let hash = entry::compute_key_hash(Some(key));

        head.append(&Record::new(11, Some(key), Some(b"a")), None, 0, DeltaType::None)
            .expect("failed to append");
        let ancestor = head.find_and_mark_ancestor(Some(key), hash, 12);
        head.append(&Record::new(12, Some(key), Some(b"b")), ancestor.as_ref(), 0, DeltaType::None)
            .expect("failed to append");
        head.append(&Record::new(13, Some(b"gone"), None).timestamp(0), None, 0, DeltaType::None)
            .expect("failed to append");
        head.append(&Record::new(14, Some(b"kept"), None).timestamp(i64::MAX / 2), None, 0, DeltaType::None)
            .expect("failed to append");

        let tail = Arc::new(head.freeze().expect("failed to freeze"));
        let cleaned = tail
            .clean(common::time::unix_millis(), &config())
            .expect("failed to clean")
            .expect("cleaned to nothing");
        let cleaned = Arc::new(cleaned);

        assert_eq!(cleaned.to_string(), "[Segment] test[0] @ 10 +1");
        let offsets: Vec<i64> = cleaned.entries().map(|e| e.offset()).collect();
        assert_eq!(offsets, vec![12, 14]);
        assert_eq!(cleaned.find_entry(12).and_then(|e| e.value().map(|v| v.to_vec())), Some(b"b".to_vec()));
        assert_eq!(cleaned.find_entry(12).map(|e| e.ancestor()), Some(11));
        assert_eq!(cleaned.dirty_bytes(), 0);
        assert_eq!(cleaned.cleanable_at(), i64::MAX);
        assert_eq!(cleaned.nulls_file().records(), 1);
    }

    #[test]
    fn clean_to_nothing() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let head = open(&dir, 0);

        let entry = head
            .append(&Record::new(0, Some(b"k"), Some(b"v")), None, 0, DeltaType::None)
            .expect("failed to append");
        mark_dirty(&entry);

        let tail = Arc::new(head.freeze().expect("failed to freeze"));
        assert!(tail
            .clean(common::time::unix_millis(), &config())
            .expect("failed to clean")
            .is_none());
        assert!(!dir.path().join("0-0000000000000000000-1.log").exists());
    }

    #[test]
    fn deferred_delete() {
        let dir = TempDir::new().expect("failed to generate tempdir");
        let segment = open(&dir, 0);
        let log = dir.path().join("0-0000000000000000000-0.log");

        segment.acquire();
        segment.delete();
        segment.close();
        assert!(log.exists());

        segment.release();
        assert!(!log.exists());
    }
}

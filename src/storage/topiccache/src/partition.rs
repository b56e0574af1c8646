// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A partition keeps its segments in a chain ordered by base offset. The
//! last segment in the chain is the head, which takes all appends. Every
//! other segment is a frozen tail that may be compacted or expired.
//!
//! The chain is an arena of links addressed by index. Index zero is the
//! sentinel, which sits both before the first and after the last segment.
//! Slots are never reused, so a [`Node`] obtained from a seek stays
//! meaningful: compaction swaps the segment in its slot, and removal unlinks
//! it while leaving its own neighbor links untouched. The arena therefore
//! keeps one small link for every segment the partition has held; the
//! segments themselves are released once no holder remains.

use crate::*;

use common::time::unix_millis;
use parking_lot::{Mutex, RwLock};

use core::ops::AddAssign;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

const SENTINEL: usize = 0;

enum Slot {
    Sentinel,
    Live(Arc<Segment>),
    // keeps serving the last content to holders that still have it
    Removed(Weak<Segment>),
    // removed, and no holder is left
    Released,
}

struct Link {
    previous: usize,
    next: usize,
    base_offset: i64,
    slot: Slot,
}

struct Chain {
    links: Vec<Link>,
    // keys of removed links still pointing at their segment
    removed: Vec<usize>,
}

impl Chain {
    fn new() -> Self {
        Self {
            links: vec![Link {
                previous: SENTINEL,
                next: SENTINEL,
                base_offset: NO_OFFSET,
                slot: Slot::Sentinel,
            }],
            removed: Vec::new(),
        }
    }

    fn head(&self) -> usize {
        self.links[SENTINEL].previous
    }

    fn live(&self, key: usize) -> Option<&Arc<Segment>> {
        match &self.links[key].slot {
            Slot::Live(segment) => Some(segment),
            _ => None,
        }
    }

    fn push_back(&mut self, segment: Arc<Segment>) -> usize {
        self.prune();

        let key = self.links.len();
        let head = self.head();
        self.links.push(Link {
            previous: head,
            next: SENTINEL,
            base_offset: segment.base_offset(),
            slot: Slot::Live(segment),
        });
        self.links[head].next = key;
        self.links[SENTINEL].previous = key;
        key
    }

    fn replace(&mut self, key: usize, segment: Arc<Segment>) -> Option<Arc<Segment>> {
        match core::mem::replace(&mut self.links[key].slot, Slot::Live(segment)) {
            Slot::Live(previous) => Some(previous),
            other => {
                // only live slots are ever replaced
                self.links[key].slot = other;
                None
            }
        }
    }

    // Unlinks a live node. The node keeps its own links so that traversal
    // from a stale handle still ends up back in the chain.
    fn unlink(&mut self, key: usize) -> Option<Arc<Segment>> {
        let segment = self.live(key)?.clone();

        let (previous, next) = (self.links[key].previous, self.links[key].next);
        self.links[next].previous = previous;
        self.links[previous].next = next;
        self.links[key].slot = Slot::Removed(Arc::downgrade(&segment));
        self.removed.push(key);

        Some(segment)
    }

    // Lets go of removed segments that can no longer be upgraded.
    fn prune(&mut self) {
        let links = &mut self.links;
        self.removed.retain(|&key| {
            let idle = matches!(&links[key].slot, Slot::Removed(s) if s.strong_count() == 0);
            if idle {
                links[key].slot = Slot::Released;
            }
            !idle
        });
    }
}

/// Counts of the work done by a maintenance pass.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Maintenance {
    /// Head segments frozen because they reached `segment_ms`.
    pub rolled: usize,
    /// Tail segments removed by time or size retention.
    pub deleted: usize,
    /// Tail segments rewritten by compaction.
    pub cleaned: usize,
}

impl AddAssign for Maintenance {
    fn add_assign(&mut self, other: Self) {
        self.rolled += other.rolled;
        self.deleted += other.deleted;
        self.cleaned += other.cleaned;
    }
}

/// One topic partition's chain of segments.
///
/// There is a single writer per partition: `append`, `write_entry`,
/// `new_head_if_necessary` and `maintain` serialize on the write progress.
/// Readers may seek and read concurrently.
pub struct Partition {
    location: PathBuf,
    cache: String,
    topic: String,
    id: u32,
    config: Arc<TopicConfig>,
    chain: RwLock<Chain>,
    // offset of the last entry written
    progress: Mutex<i64>,
}

impl Partition {
    /// Creates an empty partition storing its segments in `location`. Files
    /// left in `location` by an earlier partition with the same id are
    /// removed.
    pub fn new(
        location: &Path,
        cache: &str,
        topic: &str,
        id: u32,
        config: Arc<TopicConfig>,
    ) -> CacheResult<Self> {
        std::fs::create_dir_all(location)?;

        let prefix = format!("{id}-");
        for file in std::fs::read_dir(location)? {
            let file = file?;
            if file.file_name().to_string_lossy().starts_with(&prefix) {
                debug!("[{cache}] {topic}[{id}] removing stale {:?}", file.file_name());
                std::fs::remove_file(file.path())?;
            }
        }

        Ok(Self {
            location: location.to_path_buf(),
            cache: cache.to_string(),
            topic: topic.to_string(),
            id,
            config,
            chain: RwLock::new(Chain::new()),
            progress: Mutex::new(NO_OFFSET),
        })
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn sentinel(&self) -> Node<'_> {
        self.node(SENTINEL)
    }

    /// The node holding the head segment, or the sentinel if there are no
    /// segments yet.
    pub fn head(&self) -> Node<'_> {
        self.node(self.chain.read().head())
    }

    fn node(&self, key: usize) -> Node<'_> {
        Node {
            partition: self,
            key,
        }
    }

    /// Number of segments in the chain.
    pub fn segment_count(&self) -> usize {
        let chain = self.chain.read();
        let mut count = 0;
        let mut key = chain.links[SENTINEL].next;
        while key != SENTINEL {
            count += 1;
            key = chain.links[key].next;
        }
        count
    }

    /// The offset the next written entry would get, or `default` if the
    /// partition has no segments.
    pub fn next_offset(&self, default: i64) -> i64 {
        match self.head().segment() {
            Some(segment) => segment.next_offset(),
            None => default,
        }
    }

    /// Starts a new head segment at `offset`. The current head, if any, is
    /// frozen and its node takes the resulting tail segment.
    pub fn append(&self, offset: i64) -> CacheResult<Node<'_>> {
        let progress = self.progress.lock();
        self.append_locked(offset, *progress)
    }

    fn append_locked(&self, offset: i64, progress: i64) -> CacheResult<Node<'_>> {
        let head = self.head().segment();

        let (id, floor) = match &head {
            Some(head) => (
                head.id() + 1,
                head.next_offset().max(head.base_offset() + 1),
            ),
            None => (0, 0),
        };
        let floor = floor.max(progress + 1);
        if offset < floor {
            return Err(CacheError::OffsetRegression {
                offset,
                progress: floor - 1,
            });
        }

        let segment = Arc::new(Segment::open(
            &self.location,
            &self.topic,
            self.id,
            offset,
            id,
            &self.config,
            unix_millis(),
        )?);

        let tail = match &head {
            Some(head) => match head.freeze() {
                Ok(tail) => Some(Arc::new(tail)),
                Err(e) => {
                    error!("{} failed to freeze {}: {}", self, head, e);
                    segment.delete();
                    segment.close();
                    return Err(e);
                }
            },
            None => None,
        };

        let key = {
            let mut chain = self.chain.write();
            if let Some(tail) = tail {
                let previous = chain.head();
                if let Some(head) = chain.replace(previous, tail) {
                    head.close();
                }
            }
            chain.push_back(segment)
        };

        SEGMENT_CURRENT.increment();
        debug!("{} new head at {}", self, offset);

        Ok(self.node(key))
    }

    /// Finds the first node whose base offset is not before `offset`, or the
    /// sentinel if every segment starts before it.
    pub fn seek_not_before(&self, offset: i64) -> Node<'_> {
        let chain = self.chain.read();
        let mut key = chain.links[SENTINEL].next;
        while key != SENTINEL && chain.links[key].base_offset < offset {
            key = chain.links[key].next;
        }
        self.node(key)
    }

    /// Finds the last node whose base offset is not after `offset`, or the
    /// sentinel if every segment starts after it.
    pub fn seek_not_after(&self, offset: i64) -> Node<'_> {
        let chain = self.chain.read();
        let mut key = chain.links[SENTINEL].previous;
        while key != SENTINEL && chain.links[key].base_offset > offset {
            key = chain.links[key].previous;
        }
        self.node(key)
    }

    /// Returns a head able to take an entry of these dimensions, rotating to
    /// a new head at `offset` when the current one is too full. A negative
    /// `value_len` describes a tombstone.
    pub fn new_head_if_necessary(
        &self,
        offset: i64,
        key: Option<&[u8]>,
        value_len: i32,
        headers_size_max: usize,
    ) -> CacheResult<Node<'_>> {
        let progress = self.progress.lock();

        let head = self.head();
        let Some(segment) = head.segment() else {
            return self.append_locked(offset, *progress);
        };

        let log_required = entry::HEADER_SIZE
            + key.map(|k| k.len()).unwrap_or(0)
            + value_len.max(0) as usize
            + headers_size_max;
        let log_required = log_required + entry::padding(log_required).len();
        // every header takes at least two length prefixes
        let hashes = 1 + headers_size_max / 8;
        let tombstone = value_len < 0;

        match segment.ensure_capacity(log_required, hashes, tombstone, 0) {
            Ok(()) => Ok(head),
            Err(e) if e.is_capacity() && !segment.is_empty() => {
                debug!("{} rotating, {}", self, e);
                let head = self.append_locked(offset, *progress)?;
                if let Some(segment) = head.segment() {
                    segment.ensure_capacity(log_required, hashes, tombstone, 0)?;
                }
                Ok(head)
            }
            Err(e) => Err(e),
        }
    }

    /// Writes a record to the head segment. Offsets must strictly increase.
    ///
    /// When the topic compacts and no ancestor is given, the latest earlier
    /// entry with the same key is looked up and, once the record is written,
    /// marked dirty with this record as its descendant. A given ancestor is
    /// expected to be marked already.
    pub fn write_entry(
        &self,
        record: &Record,
        ancestor: Option<&Entry>,
        flags: u32,
        delta_type: DeltaType,
    ) -> CacheResult<Entry> {
        let mut progress = self.progress.lock();
        self.check_write(record, *progress)?;

        let head = self.head().segment().ok_or(CacheError::NoHead)?;

        let lookup = ancestor.is_none() && self.config.cleanup_policy.compacts();
        let found = if lookup {
            self.find_ancestor(record.key, compute_key_hash(record.key), record.offset)
        } else {
            None
        };

        let entry = head.append(record, ancestor.or(found.as_ref()), flags, delta_type)?;

        if lookup && record.key.is_some() {
            match &found {
                Some(found) => {
                    ANCESTOR_HIT.increment();
                    segment::mark_ancestor(found, record.offset);
                }
                None => {
                    ANCESTOR_MISS.increment();
                }
            }
        }

        *progress = record.offset;

        Ok(entry)
    }

    /// Writes a record produced through the cache before the broker has
    /// acknowledged it. The entry carries the producer `sequence` and stays
    /// incomplete until [`Entry::complete`] records the acknowledgement.
    /// Produced entries are never compacted against, so no ancestor is looked
    /// up.
    pub fn write_produce_entry(&self, record: &Record, sequence: i32) -> CacheResult<Entry> {
        let mut progress = self.progress.lock();
        self.check_write(record, *progress)?;

        let head = self.head().segment().ok_or(CacheError::NoHead)?;
        let entry = head.append(&record.sequence(sequence), None, 0, DeltaType::None)?;

        *progress = record.offset;

        Ok(entry)
    }

    fn check_write(&self, record: &Record, progress: i64) -> CacheResult {
        if record.offset <= progress {
            return Err(CacheError::OffsetRegression {
                offset: record.offset,
                progress,
            });
        }

        let size = record.key.map(|k| k.len()).unwrap_or(0)
            + record.value.map(|v| v.len()).unwrap_or(0)
            + entry::headers_size(record.headers);
        if size > self.config.max_message_bytes {
            return Err(CacheError::MessageTooLarge {
                size,
                max: self.config.max_message_bytes,
            });
        }

        Ok(())
    }

    pub fn compute_key_hash(&self, key: Option<&[u8]>) -> u32 {
        compute_key_hash(key)
    }

    /// Finds the latest entry with this key written before `descendant`,
    /// searching from the head back through the tails, and marks it dirty.
    pub fn find_and_mark_ancestor(
        &self,
        key: Option<&[u8]>,
        key_hash: u32,
        descendant: i64,
    ) -> Option<Entry> {
        let ancestor = self.find_ancestor(key, key_hash, descendant);
        match &ancestor {
            Some(entry) => {
                ANCESTOR_HIT.increment();
                segment::mark_ancestor(entry, descendant);
            }
            None => {
                ANCESTOR_MISS.increment();
            }
        }
        ancestor
    }

    fn find_ancestor(&self, key: Option<&[u8]>, key_hash: u32, descendant: i64) -> Option<Entry> {
        key?;

        let mut node = self.head();
        while !node.is_sentinel() {
            if let Some(segment) = node.segment() {
                // the keys store rules out most segments without touching the log
                let listed = segment.keys_file().first(key_hash);
                if !cursor::is_miss(listed) {
                    if let Some(entry) = segment.find_ancestor(key, key_hash, descendant) {
                        return Some(entry);
                    }
                }
            }
            node = node.previous();
        }

        None
    }

    /// When a head segment should be rolled over by age.
    pub fn retain_at(&self, segment: &Segment) -> i64 {
        segment.timestamp().saturating_add(self.config.segment_ms)
    }

    /// When a tail segment expires, using the shorter of the topic retention
    /// and `retention_max`.
    pub fn delete_at(&self, segment: &Segment, retention_max: i64) -> i64 {
        segment
            .timestamp()
            .saturating_add(self.config.retention_millis().min(retention_max))
    }

    /// When a tail segment becomes eligible for compaction, `i64::MAX` if it
    /// is not. A time reached through `min_cleanable_dirty_ratio` cannot move
    /// earlier, so it is recorded on the segment. Tombstones past
    /// `delete_retention_ms` bound the result without being recorded.
    pub fn compact_at(&self, segment: &Segment) -> i64 {
        let mut cleanable_at = segment.cleanable_at();

        let dirty_since = segment.dirty_since();
        if cleanable_at == i64::MAX && dirty_since != NO_DIRTY_SINCE {
            let ratio = segment.cleanable_dirty_ratio();
            if ratio >= self.config.min_cleanable_dirty_ratio {
                cleanable_at = dirty_since.saturating_add(self.config.min_compaction_lag_ms);
                segment.set_cleanable_at(cleanable_at);
            } else if ratio != 0.0 && self.config.max_compaction_lag_ms != i64::MAX {
                cleanable_at = dirty_since.saturating_add(self.config.max_compaction_lag_ms);
            }
        }

        if let Some(tombstone) = segment.earliest_tombstone() {
            cleanable_at =
                cleanable_at.min(tombstone.saturating_add(self.config.delete_retention_ms));
        }

        cleanable_at
    }

    /// Runs one maintenance pass: rolls an aged head, then applies retention
    /// and compaction to the tails as the cleanup policy asks.
    pub fn maintain(&self, now: i64) -> CacheResult<Maintenance> {
        let progress = self.progress.lock();
        let mut report = Maintenance::default();

        if let Some(head) = self.head().segment() {
            if !head.is_empty() && self.retain_at(&head) <= now {
                self.append_locked(head.next_offset(), *progress)?;
                report.rolled += 1;
            }
        }

        if self.config.cleanup_policy.deletes() {
            report.deleted += self.expire(now);
        }

        if self.config.cleanup_policy.compacts() {
            let mut node = self.sentinel().next();
            while !node.is_sentinel() && !node.is_head() {
                let next = node.next();
                if let Some(segment) = node.segment() {
                    if self.compact_at(&segment) <= now && node.clean(now)? {
                        report.cleaned += 1;
                    }
                }
                node = next;
            }
        }

        if report != Maintenance::default() {
            debug!("{} maintenance: {:?}", self, report);
        }

        Ok(report)
    }

    // Removes tails past retention, oldest first. The head is never removed.
    fn expire(&self, now: i64) -> usize {
        let mut deleted = 0;

        loop {
            let oldest = self.sentinel().next();
            if oldest.is_sentinel() || oldest.is_head() {
                break;
            }
            let Some(segment) = oldest.segment() else {
                break;
            };
            if self.delete_at(&segment, i64::MAX) > now {
                break;
            }
            if oldest.remove() {
                SEGMENT_EXPIRE.increment();
                deleted += 1;
            }
        }

        if self.config.retention_bytes >= 0 {
            let limit = self.config.retention_bytes as usize;
            let mut total: usize = self.live_segments().iter().map(|s| s.log_file().len()).sum();

            while total > limit {
                let oldest = self.sentinel().next();
                if oldest.is_sentinel() || oldest.is_head() {
                    break;
                }
                let Some(segment) = oldest.segment() else {
                    break;
                };
                if !oldest.remove() {
                    break;
                }
                SEGMENT_EXPIRE.increment();
                total = total.saturating_sub(segment.log_file().len());
                deleted += 1;
            }
        }

        deleted
    }

    fn live_segments(&self) -> Vec<Arc<Segment>> {
        let chain = self.chain.read();
        let mut segments = Vec::new();
        let mut key = chain.links[SENTINEL].next;
        while key != SENTINEL {
            if let Some(segment) = chain.live(key) {
                segments.push(segment.clone());
            }
            key = chain.links[key].next;
        }
        segments
    }
}

impl core::fmt::Display for Partition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}[{}]", self.cache, self.topic, self.id)
    }
}

/// A handle to one position in a partition's chain.
#[derive(Clone, Copy)]
pub struct Node<'a> {
    partition: &'a Partition,
    key: usize,
}

impl<'a> Node<'a> {
    /// Arena key of this node, stable for the life of the partition.
    pub fn key(&self) -> usize {
        self.key
    }

    pub fn is_sentinel(&self) -> bool {
        self.key == SENTINEL
    }

    /// True if this node holds the segment currently taking appends.
    pub fn is_head(&self) -> bool {
        let chain = self.partition.chain.read();
        !self.is_sentinel() && chain.head() == self.key
    }

    pub fn is_removed(&self) -> bool {
        matches!(
            self.partition.chain.read().links[self.key].slot,
            Slot::Removed(_) | Slot::Released
        )
    }

    pub fn next(&self) -> Node<'a> {
        let key = self.partition.chain.read().links[self.key].next;
        self.partition.node(key)
    }

    pub fn previous(&self) -> Node<'a> {
        let key = self.partition.chain.read().links[self.key].previous;
        self.partition.node(key)
    }

    /// The segment currently held by this node, acquired for as long as the
    /// handle lives. The sentinel has none, and a removed node only has one
    /// while someone else still holds it.
    pub fn segment(&self) -> Option<Acquired<Segment>> {
        let chain = self.partition.chain.read();
        let segment = match &chain.links[self.key].slot {
            Slot::Sentinel | Slot::Released => None,
            Slot::Live(segment) => Some(segment.clone()),
            Slot::Removed(segment) => segment.upgrade(),
        };
        segment.map(Acquired::new)
    }

    pub fn base_offset(&self) -> Option<i64> {
        if self.is_sentinel() {
            None
        } else {
            Some(self.partition.chain.read().links[self.key].base_offset)
        }
    }

    /// Walks back from this node to the first node whose segment starts no
    /// later than `base_offset`.
    pub fn seek_ancestor(&self, base_offset: i64) -> Node<'a> {
        let chain = self.partition.chain.read();
        let mut key = self.key;
        while key != SENTINEL && chain.links[key].base_offset > base_offset {
            key = chain.links[key].previous;
        }
        self.partition.node(key)
    }

    /// Unlinks this node from the chain and schedules its segment files for
    /// deletion. Returns false if there was nothing to remove.
    pub fn remove(&self) -> bool {
        if self.is_sentinel() {
            return false;
        }

        let removed = self.partition.chain.write().unlink(self.key);
        match removed {
            Some(segment) => {
                SEGMENT_REMOVE.increment();
                SEGMENT_CURRENT.decrement();
                debug!("{} removed {}", self.partition, segment);
                segment.delete();
                segment.close();
                true
            }
            None => false,
        }
    }

    /// Compacts this node's tail segment if it is due by `now`, swapping the
    /// cleaned segment into place. A segment that cleans to nothing is
    /// removed. Returns true if the node changed. The head is never cleaned.
    pub fn clean(&self, now: i64) -> CacheResult<bool> {
        let segment = {
            let chain = self.partition.chain.read();
            if chain.links[self.key].next == SENTINEL {
                return Ok(false);
            }
            match chain.live(self.key) {
                Some(segment) => segment.clone(),
                None => return Ok(false),
            }
        };

        if self.partition.compact_at(&segment) > now {
            return Ok(false);
        }

        let cleaned = segment
            .clean(now, &self.partition.config)?
            .map(Arc::new);

        {
            let mut chain = self.partition.chain.write();

            let current = chain.live(self.key).map(|s| Arc::ptr_eq(s, &segment));
            if current != Some(true) {
                // removed while cleaning
                if let Some(cleaned) = cleaned {
                    cleaned.delete();
                    cleaned.close();
                }
                return Ok(false);
            }

            match cleaned {
                Some(cleaned) => {
                    chain.replace(self.key, cleaned);
                }
                None => {
                    chain.unlink(self.key);
                    SEGMENT_REMOVE.increment();
                    SEGMENT_CURRENT.decrement();
                }
            }
        }

        segment.delete();
        segment.close();

        Ok(true)
    }

    pub fn find_and_mark_ancestor(
        &self,
        key: Option<&[u8]>,
        key_hash: u32,
        descendant: i64,
    ) -> Option<Entry> {
        self.segment()?
            .find_and_mark_ancestor(key, key_hash, descendant)
    }

    pub fn find_and_mark_dirty(&self, offset: i64) -> Option<Entry> {
        self.segment()?.find_and_mark_dirty(offset)
    }

    pub fn find_and_abort_producer_id(&self, producer_id: i64) -> usize {
        self.segment()
            .map(|s| s.find_and_abort_producer_id(producer_id))
            .unwrap_or(0)
    }
}

impl PartialEq for Node<'_> {
    fn eq(&self, other: &Self) -> bool {
        core::ptr::eq(self.partition, other.partition) && self.key == other.key
    }
}

impl Eq for Node<'_> {}

impl core::fmt::Display for Node<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self.base_offset() {
            Some(base_offset) => write!(f, "[Node] {base_offset}"),
            None => write!(f, "[Node] sentinel"),
        }
    }
}

impl core::fmt::Debug for Node<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{} #{}", self, self.key)
    }
}

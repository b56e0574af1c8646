// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! On-disk entry format. Each entry in a segment's log starts with a fixed
//! 80 byte header, followed by the key, the value and the encoded headers,
//! then zero padding up to the next 8 byte boundary.
//!
//! ```text
//!    0  offset          i64
//!    8  timestamp       i64
//!   16  producer id     i64
//!   24  acknowledge     i64   updated in place
//!   32  ancestor        i64
//!   40  descendant      i64   updated in place
//!   48  flags           u32   updated in place
//!   52  sequence        i32
//!   56  delta position  i32
//!   60  delta type      u32
//!   64  key length      i32   -1 for a null key
//!   68  value length    i32   -1 for a null value (tombstone)
//!   72  headers length  u32
//!   76  header count    u32
//! ```
//!
//! Encoded headers are a sequence of `name length (u32), name, value length
//! (u32), value`. All integers use native byte order.

use crate::*;

use core::hash::Hasher;
use core::sync::atomic::Ordering;
use std::sync::Arc;
use twox_hash::XxHash32;

pub const HEADER_SIZE: usize = 80;
pub const ALIGNMENT: usize = 8;

const OFFSET: usize = 0;
const TIMESTAMP: usize = 8;
const PRODUCER_ID: usize = 16;
const ACKNOWLEDGE: usize = 24;
const ANCESTOR: usize = 32;
const DESCENDANT: usize = 40;
const FLAGS: usize = 48;
const SEQUENCE: usize = 52;
const DELTA_POSITION: usize = 56;
const DELTA_TYPE: usize = 60;
pub(crate) const KEY_LEN: usize = 64;
const VALUE_LEN: usize = 68;
const HEADERS_LEN: usize = 72;
const HEADER_COUNT: usize = 76;

/// Superseded by a later entry with the same key.
pub const FLAG_DIRTY: u32 = 0x01;
/// A produced entry whose write was acknowledged.
pub const FLAG_COMPLETED: u32 = 0x02;
/// Part of an aborted transaction.
pub const FLAG_ABORTED: u32 = 0x04;
/// A transaction control marker rather than user data.
pub const FLAG_CONTROL: u32 = 0x08;

pub const NO_ANCESTOR_OFFSET: i64 = -1;
pub const NO_DESCENDANT_OFFSET: i64 = -1;
pub const NO_ACKNOWLEDGE: i64 = -1;
pub const NO_SEQUENCE: i32 = -1;
pub const NO_DELTA_POSITION: i32 = -1;

const PADDING: [u8; ALIGNMENT] = [0; ALIGNMENT];

/// A record header as supplied by the producer.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Header<'a> {
    pub name: &'a [u8],
    pub value: &'a [u8],
}

impl<'a> Header<'a> {
    pub fn new(name: &'a [u8], value: &'a [u8]) -> Self {
        Self { name, value }
    }
}

/// A decoded record to be written into the cache.
#[derive(Copy, Clone, Debug)]
pub struct Record<'a> {
    pub offset: i64,
    pub timestamp: i64,
    pub producer_id: i64,
    pub sequence: i32,
    pub key: Option<&'a [u8]>,
    pub headers: &'a [Header<'a>],
    pub value: Option<&'a [u8]>,
}

impl<'a> Record<'a> {
    pub fn new(offset: i64, key: Option<&'a [u8]>, value: Option<&'a [u8]>) -> Self {
        Self {
            offset,
            timestamp: 0,
            producer_id: -1,
            sequence: NO_SEQUENCE,
            key,
            headers: &[],
            value,
        }
    }

    pub fn timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn producer_id(mut self, producer_id: i64) -> Self {
        self.producer_id = producer_id;
        self
    }

    /// Producer sequence number, for idempotent produce.
    pub fn sequence(mut self, sequence: i32) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn headers(mut self, headers: &'a [Header<'a>]) -> Self {
        self.headers = headers;
        self
    }
}

/// Fixed header fields of an entry about to be written.
#[derive(Copy, Clone, Debug)]
pub(crate) struct EntryInfo {
    pub offset: i64,
    pub timestamp: i64,
    pub producer_id: i64,
    pub acknowledge: i64,
    pub ancestor: i64,
    pub descendant: i64,
    pub flags: u32,
    pub sequence: i32,
    pub delta_type: DeltaType,
}

impl EntryInfo {
    pub fn encode(
        &self,
        delta_position: i32,
        key: Option<&[u8]>,
        value: Option<&[u8]>,
        headers: &[u8],
        header_count: u32,
    ) -> [u8; HEADER_SIZE] {
        let mut buf = [0; HEADER_SIZE];
        put(&mut buf, OFFSET, &self.offset.to_ne_bytes());
        put(&mut buf, TIMESTAMP, &self.timestamp.to_ne_bytes());
        put(&mut buf, PRODUCER_ID, &self.producer_id.to_ne_bytes());
        put(&mut buf, ACKNOWLEDGE, &self.acknowledge.to_ne_bytes());
        put(&mut buf, ANCESTOR, &self.ancestor.to_ne_bytes());
        put(&mut buf, DESCENDANT, &self.descendant.to_ne_bytes());
        put(&mut buf, FLAGS, &self.flags.to_ne_bytes());
        put(&mut buf, SEQUENCE, &self.sequence.to_ne_bytes());
        put(&mut buf, DELTA_POSITION, &delta_position.to_ne_bytes());
        put(&mut buf, DELTA_TYPE, &(self.delta_type as u32).to_ne_bytes());
        put(&mut buf, KEY_LEN, &length(key).to_ne_bytes());
        put(&mut buf, VALUE_LEN, &length(value).to_ne_bytes());
        put(&mut buf, HEADERS_LEN, &(headers.len() as u32).to_ne_bytes());
        put(&mut buf, HEADER_COUNT, &header_count.to_ne_bytes());
        buf
    }
}

fn put(buf: &mut [u8; HEADER_SIZE], at: usize, bytes: &[u8]) {
    buf[at..at + bytes.len()].copy_from_slice(bytes);
}

fn length(bytes: Option<&[u8]>) -> i32 {
    bytes.map(|b| b.len() as i32).unwrap_or(-1)
}

pub(crate) fn padding(size: usize) -> &'static [u8] {
    &PADDING[..(ALIGNMENT - size % ALIGNMENT) % ALIGNMENT]
}

/// Total log bytes taken by an entry with the given parts.
pub fn entry_size(key: Option<&[u8]>, value: Option<&[u8]>, headers_len: usize) -> usize {
    let size = HEADER_SIZE
        + key.map(|k| k.len()).unwrap_or(0)
        + value.map(|v| v.len()).unwrap_or(0)
        + headers_len;
    size + padding(size).len()
}

/// Encoded size of a set of headers.
pub fn headers_size(headers: &[Header]) -> usize {
    headers.iter().map(|h| 8 + h.name.len() + h.value.len()).sum()
}

pub(crate) fn encode_headers(headers: &[Header]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(headers_size(headers));
    for header in headers {
        buf.extend_from_slice(&(header.name.len() as u32).to_ne_bytes());
        buf.extend_from_slice(header.name);
        buf.extend_from_slice(&(header.value.len() as u32).to_ne_bytes());
        buf.extend_from_slice(header.value);
    }
    buf
}

/// Hash of a record key, with a distinct hash for the null key. The length
/// is hashed ahead of the bytes so an empty key and a null key differ.
pub fn compute_key_hash(key: Option<&[u8]>) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(&length(key).to_ne_bytes());
    if let Some(key) = key {
        hasher.write(key);
    }
    hasher.finish() as u32
}

/// Hash of a header name and value, used to find entries by header.
pub fn compute_header_hash(header: &Header) -> u32 {
    let mut hasher = XxHash32::with_seed(0);
    hasher.write(&(header.name.len() as u32).to_ne_bytes());
    hasher.write(header.name);
    hasher.write(&(header.value.len() as u32).to_ne_bytes());
    hasher.write(header.value);
    hasher.finish() as u32
}

/// Iterator over an encoded headers block. Stops early on a malformed block.
pub struct Headers<'a> {
    bytes: &'a [u8],
}

impl<'a> Headers<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn take_field(&mut self) -> Option<&'a [u8]> {
        let bytes: &'a [u8] = self.bytes;
        let len = bytes.get(..4)?;
        let len = u32::from_ne_bytes([len[0], len[1], len[2], len[3]]) as usize;
        let field = bytes.get(4..4 + len)?;
        self.bytes = &bytes[4 + len..];
        Some(field)
    }
}

impl<'a> Iterator for Headers<'a> {
    type Item = Header<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.bytes.is_empty() {
            return None;
        }

        let header = self
            .take_field()
            .and_then(|name| self.take_field().map(|value| Header { name, value }));

        if header.is_none() {
            self.bytes = &[];
        }

        header
    }
}

/// A view of one entry in a segment's log. An `Entry` holds its segment
/// acquired, so the segment's files outlive its removal from the partition
/// until the entry is dropped.
#[derive(Clone)]
pub struct Entry {
    segment: Acquired<Segment>,
    position: usize,
}

impl Entry {
    // caller guarantees a complete entry was published at `position`
    pub(crate) fn new(segment: Arc<Segment>, position: usize) -> Self {
        Self {
            segment: Acquired::new(segment),
            position,
        }
    }

    /// Reads and validates the entry at `position`. Returns `None` if there
    /// is no complete, well formed entry there.
    pub(crate) fn read(segment: Arc<Segment>, position: usize) -> Option<Self> {
        if position % ALIGNMENT != 0 {
            return None;
        }

        let log = segment.log_file();
        log.bytes(position, HEADER_SIZE)?;

        let key_len = log.read_i32(position + KEY_LEN)?;
        let value_len = log.read_i32(position + VALUE_LEN)?;
        let headers_len = log.read_u32(position + HEADERS_LEN)? as usize;
        if key_len < -1 || value_len < -1 {
            return None;
        }

        let size = HEADER_SIZE + key_len.max(0) as usize + value_len.max(0) as usize + headers_len;
        log.bytes(position, size)?;

        Some(Self::new(segment, position))
    }

    pub fn segment(&self) -> &Arc<Segment> {
        &self.segment
    }

    /// Byte position of this entry within its segment's log.
    pub fn position(&self) -> usize {
        self.position
    }

    fn log(&self) -> &CacheFile {
        self.segment.log_file()
    }

    fn i64_at(&self, field: usize) -> i64 {
        self.log().read_i64(self.position + field).unwrap_or(-1)
    }

    fn i32_at(&self, field: usize) -> i32 {
        self.log().read_i32(self.position + field).unwrap_or(-1)
    }

    fn u32_at(&self, field: usize) -> u32 {
        self.log().read_u32(self.position + field).unwrap_or(0)
    }

    pub fn offset(&self) -> i64 {
        self.i64_at(OFFSET)
    }

    pub fn timestamp(&self) -> i64 {
        self.i64_at(TIMESTAMP)
    }

    pub fn producer_id(&self) -> i64 {
        self.i64_at(PRODUCER_ID)
    }

    pub fn acknowledge(&self) -> i64 {
        self.log()
            .atomic_i64(self.position + ACKNOWLEDGE)
            .map(|a| a.load(Ordering::Acquire))
            .unwrap_or(NO_ACKNOWLEDGE)
    }

    pub fn ancestor(&self) -> i64 {
        self.i64_at(ANCESTOR)
    }

    pub fn descendant(&self) -> i64 {
        self.log()
            .atomic_i64(self.position + DESCENDANT)
            .map(|d| d.load(Ordering::Acquire))
            .unwrap_or(NO_DESCENDANT_OFFSET)
    }

    pub fn flags(&self) -> u32 {
        self.log()
            .atomic_u32(self.position + FLAGS)
            .map(|f| f.load(Ordering::Acquire))
            .unwrap_or(0)
    }

    pub fn sequence(&self) -> i32 {
        self.i32_at(SEQUENCE)
    }

    pub fn delta_position(&self) -> i32 {
        self.i32_at(DELTA_POSITION)
    }

    pub fn delta_type(&self) -> DeltaType {
        DeltaType::from_u32(self.u32_at(DELTA_TYPE)).unwrap_or_default()
    }

    pub fn header_count(&self) -> u32 {
        self.u32_at(HEADER_COUNT)
    }

    fn key_len(&self) -> usize {
        self.i32_at(KEY_LEN).max(0) as usize
    }

    fn value_len(&self) -> usize {
        self.i32_at(VALUE_LEN).max(0) as usize
    }

    fn headers_len(&self) -> usize {
        self.u32_at(HEADERS_LEN) as usize
    }

    pub fn key(&self) -> Option<&[u8]> {
        if self.i32_at(KEY_LEN) < 0 {
            return None;
        }
        self.log().bytes(self.position + HEADER_SIZE, self.key_len())
    }

    /// The value, or `None` for a tombstone.
    pub fn value(&self) -> Option<&[u8]> {
        if self.i32_at(VALUE_LEN) < 0 {
            return None;
        }
        self.log()
            .bytes(self.position + HEADER_SIZE + self.key_len(), self.value_len())
    }

    pub fn is_tombstone(&self) -> bool {
        self.i32_at(VALUE_LEN) < 0
    }

    pub(crate) fn headers_block(&self) -> &[u8] {
        let at = self.position + HEADER_SIZE + self.key_len() + self.value_len();
        self.log().bytes(at, self.headers_len()).unwrap_or(&[])
    }

    pub fn headers(&self) -> Headers<'_> {
        Headers::new(self.headers_block())
    }

    /// The JSON patch from this entry's ancestor, if one was recorded.
    pub fn delta(&self) -> Option<&[u8]> {
        let position = self.delta_position();
        if position < 0 {
            return None;
        }
        let delta = self.segment.delta_file();
        let len = delta.read_u32(position as usize)? as usize;
        delta.bytes(position as usize + 4, len)
    }

    /// Log bytes taken by this entry, including padding.
    pub fn size(&self) -> usize {
        let size = HEADER_SIZE + self.key_len() + self.value_len() + self.headers_len();
        size + padding(size).len()
    }

    pub fn is_dirty(&self) -> bool {
        self.flags() & FLAG_DIRTY != 0
    }

    pub fn is_completed(&self) -> bool {
        self.flags() & FLAG_COMPLETED != 0
    }

    pub fn is_aborted(&self) -> bool {
        self.flags() & FLAG_ABORTED != 0
    }

    pub fn is_control(&self) -> bool {
        self.flags() & FLAG_CONTROL != 0
    }

    /// Sets flag bits, returning the flags as they were before.
    pub(crate) fn set_flags(&self, flags: u32) -> u32 {
        self.log()
            .atomic_u32(self.position + FLAGS)
            .map(|f| f.fetch_or(flags, Ordering::AcqRel))
            .unwrap_or(0)
    }

    pub(crate) fn set_descendant(&self, offset: i64) {
        if let Some(descendant) = self.log().atomic_i64(self.position + DESCENDANT) {
            descendant.store(offset, Ordering::Release);
        }
    }

    /// Records the broker acknowledgement of a produced entry and marks it
    /// completed.
    pub fn complete(&self, acknowledge: i64) {
        if let Some(ack) = self.log().atomic_i64(self.position + ACKNOWLEDGE) {
            ack.store(acknowledge, Ordering::Release);
        }
        self.set_flags(FLAG_COMPLETED);
    }

    // header fields to carry over when the entry is copied by compaction
    pub(crate) fn info(&self) -> EntryInfo {
        EntryInfo {
            offset: self.offset(),
            timestamp: self.timestamp(),
            producer_id: self.producer_id(),
            acknowledge: self.acknowledge(),
            ancestor: self.ancestor(),
            descendant: self.descendant(),
            flags: self.flags(),
            sequence: self.sequence(),
            delta_type: self.delta_type(),
        }
    }
}

impl core::fmt::Debug for Entry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Entry")
            .field("segment", &self.segment.to_string())
            .field("position", &self.position)
            .field("offset", &self.offset())
            .field("flags", &self.flags())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(entry_size(None, None, 0), HEADER_SIZE);
        assert_eq!(entry_size(Some(b"k"), None, 0), HEADER_SIZE + 8);
        assert_eq!(entry_size(Some(b"test"), Some(b"four"), 0), HEADER_SIZE + 8);
        assert_eq!(entry_size(Some(b"test"), Some(b"value"), 0), HEADER_SIZE + 16);
        assert_eq!(padding(80).len(), 0);
        assert_eq!(padding(81).len(), 7);
    }

    #[test]
    fn headers_round_trip() {
        let headers = [
            Header::new(b"header", b"value"),
            Header::new(b"", b""),
            Header::new(b"trace", b"0123456789"),
        ];
        let block = encode_headers(&headers);
        assert_eq!(block.len(), headers_size(&headers));

        let decoded: Vec<Header> = Headers::new(&block).collect();
        assert_eq!(decoded, headers);
    }

    #[test]
    fn truncated_headers_stop() {
        let block = encode_headers(&[Header::new(b"name", b"value")]);
        let decoded: Vec<Header> = Headers::new(&block[..block.len() - 1]).collect();
        assert!(decoded.is_empty());
    }

    #[test]
    fn key_hashes() {
        assert_eq!(compute_key_hash(Some(b"test")), compute_key_hash(Some(b"test")));
        assert_ne!(compute_key_hash(Some(b"test")), compute_key_hash(Some(b"tesT")));
        assert_ne!(compute_key_hash(None), compute_key_hash(Some(b"")));
    }

    #[test]
    fn header_encoding() {
        let info = EntryInfo {
            offset: 42,
            timestamp: 1000,
            producer_id: 7,
            acknowledge: NO_ACKNOWLEDGE,
            ancestor: 41,
            descendant: NO_DESCENDANT_OFFSET,
            flags: FLAG_CONTROL,
            sequence: NO_SEQUENCE,
            delta_type: DeltaType::JsonPatch,
        };

        let buf = info.encode(16, Some(b"key"), None, &[1, 2, 3], 1);
        let i64_at = |at: usize| i64::from_ne_bytes(buf[at..at + 8].try_into().unwrap());
        let i32_at = |at: usize| i32::from_ne_bytes(buf[at..at + 4].try_into().unwrap());

        assert_eq!(i64_at(OFFSET), 42);
        assert_eq!(i64_at(ANCESTOR), 41);
        assert_eq!(i32_at(FLAGS), FLAG_CONTROL as i32);
        assert_eq!(i32_at(DELTA_POSITION), 16);
        assert_eq!(i32_at(DELTA_TYPE), 1);
        assert_eq!(i32_at(KEY_LEN), 3);
        assert_eq!(i32_at(VALUE_LEN), -1);
        assert_eq!(i32_at(HEADERS_LEN), 3);
        assert_eq!(i32_at(HEADER_COUNT), 1);
    }
}

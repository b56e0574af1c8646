// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

// All metrics for the topiccache crate

use metriken::*;

// segment related
#[metric(name = "segment_create", description = "number of segments opened for append")]
pub static SEGMENT_CREATE: Counter = Counter::new();

#[metric(name = "segment_create_ex", description = "number of segments which could not be opened")]
pub static SEGMENT_CREATE_EX: Counter = Counter::new();

#[metric(name = "segment_freeze", description = "number of head segments frozen into tails")]
pub static SEGMENT_FREEZE: Counter = Counter::new();

#[metric(name = "segment_clean", description = "number of tail segments compacted")]
pub static SEGMENT_CLEAN: Counter = Counter::new();

#[metric(name = "segment_remove", description = "number of segments unlinked from a partition")]
pub static SEGMENT_REMOVE: Counter = Counter::new();

#[metric(name = "segment_expire", description = "number of segments removed by retention")]
pub static SEGMENT_EXPIRE: Counter = Counter::new();

#[metric(name = "segment_current", description = "current number of linked segments")]
pub static SEGMENT_CURRENT: Gauge = Gauge::new();

// entry related
#[metric(name = "entry_append", description = "number of entries appended")]
pub static ENTRY_APPEND: Counter = Counter::new();

#[metric(name = "entry_append_byte", description = "number of log bytes appended")]
pub static ENTRY_APPEND_BYTE: Counter = Counter::new();

#[metric(name = "entry_compact", description = "number of entries dropped by compaction")]
pub static ENTRY_COMPACT: Counter = Counter::new();

#[metric(name = "entry_abort", description = "number of entries marked aborted")]
pub static ENTRY_ABORT: Counter = Counter::new();

#[metric(name = "entry_corrupt", description = "number of unreadable entries skipped")]
pub static ENTRY_CORRUPT: Counter = Counter::new();

#[metric(name = "entry_delta", description = "number of entries written with a json patch delta")]
pub static ENTRY_DELTA: Counter = Counter::new();

#[metric(name = "capacity_exceeded", description = "number of writes rejected for lack of segment capacity")]
pub static CAPACITY_EXCEEDED: Counter = Counter::new();

// ancestor related
#[metric(name = "ancestor_hit", description = "number of ancestor lookups which found a prior entry")]
pub static ANCESTOR_HIT: Counter = Counter::new();

#[metric(name = "ancestor_miss", description = "number of ancestor lookups which found no prior entry")]
pub static ANCESTOR_MISS: Counter = Counter::new();

#[metric(name = "ancestor_collision", description = "number of key hash matches with differing key bytes")]
pub static ANCESTOR_COLLISION: Counter = Counter::new();

common::metrics::test_no_duplicates!();

// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! A local, file-backed cache of kafka topic partitions.
//!
//! Each partition is a chain of segments ordered by base offset. Records are
//! appended to the head segment by a single writer while any number of
//! readers seek and read concurrently. Frozen tail segments are expired by
//! retention or compacted so that only the latest record per key survives,
//! depending on the topic's cleanup policy.
//!
//! Every segment is a set of memory mapped files: the entry log, JSON patch
//! deltas, an offset index, a key and header hash index, a key list used to
//! find ancestors across segments, and a tombstone index.
//!
//! Goals:
//! * appends and reads that never block each other
//! * in-place compaction that does not disturb readers holding a segment
//!
//! Non-goals:
//! * durability across restarts, files left by a previous process are
//!   discarded
//! * speaking the kafka wire protocol
//!

// macro includes
#[macro_use]
extern crate log;

// submodules
mod cache;
pub mod cursor;
mod delta;
mod entry;
mod error;
mod file;
pub mod index;
mod metrics;
mod object;
mod partition;
mod policy;
mod segment;
mod topic;

// publicly exported items from submodules
pub use cache::{Cache, Caches};
pub use config::{Config, KafkaCache, KafkaCacheConfig, TopicOverrides};
pub use delta::DeltaType;
pub use entry::*;
pub use error::{CacheError, CacheResult};
pub use file::CacheFile;
pub use index::{IndexFile, IndexOrder};
pub use object::{Acquired, CacheObject, RefCount};
pub use partition::{Maintenance, Node, Partition};
pub use policy::CleanupPolicy;
pub use segment::*;
pub use topic::{Topic, TopicConfig};

// items from submodules which are imported for convenience to the crate level
pub(crate) use metrics::*;

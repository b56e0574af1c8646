// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use serde::{Deserialize, Serialize};

use std::collections::HashMap;

// constants to define default values
const DIRECTORY: &str = "/tmp/topiccache";
const CLEANUP_POLICY: &str = "delete";
const MAX_MESSAGE_BYTES: u32 = 1000012;
const RETENTION_MS: i64 = 604800000;
const RETENTION_BYTES: i64 = -1;
const DELETE_RETENTION_MS: i64 = 86400000;
const MIN_COMPACTION_LAG_MS: i64 = 0;
const MAX_COMPACTION_LAG_MS: i64 = i64::MAX;
const MIN_CLEANABLE_DIRTY_RATIO: f64 = 0.5;
const SEGMENT_MS: i64 = 604800000;
const SEGMENT_BYTES: u32 = 0x40000000;
const SEGMENT_INDEX_BYTES: u32 = 0xA00000;

// helper functions
fn directory() -> String {
    DIRECTORY.to_string()
}

fn cleanup_policy() -> String {
    CLEANUP_POLICY.to_string()
}

fn max_message_bytes() -> u32 {
    MAX_MESSAGE_BYTES
}

fn retention_ms() -> i64 {
    RETENTION_MS
}

fn retention_bytes() -> i64 {
    RETENTION_BYTES
}

fn delete_retention_ms() -> i64 {
    DELETE_RETENTION_MS
}

fn min_compaction_lag_ms() -> i64 {
    MIN_COMPACTION_LAG_MS
}

fn max_compaction_lag_ms() -> i64 {
    MAX_COMPACTION_LAG_MS
}

fn min_cleanable_dirty_ratio() -> f64 {
    MIN_CLEANABLE_DIRTY_RATIO
}

fn segment_ms() -> i64 {
    SEGMENT_MS
}

fn segment_bytes() -> u32 {
    SEGMENT_BYTES
}

fn segment_index_bytes() -> u32 {
    SEGMENT_INDEX_BYTES
}

// definitions

/// Process-wide defaults for every cached topic, plus optional per-topic
/// overrides. Key names follow the kafka topic configuration keys with `.`
/// replaced by `_`.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct KafkaCache {
    #[serde(default = "directory")]
    directory: String,
    #[serde(default = "cleanup_policy")]
    cleanup_policy: String,
    #[serde(default = "max_message_bytes")]
    max_message_bytes: u32,
    #[serde(default = "retention_ms")]
    retention_ms: i64,
    #[serde(default = "retention_bytes")]
    retention_bytes: i64,
    #[serde(default = "delete_retention_ms")]
    delete_retention_ms: i64,
    #[serde(default = "min_compaction_lag_ms")]
    min_compaction_lag_ms: i64,
    #[serde(default = "max_compaction_lag_ms")]
    max_compaction_lag_ms: i64,
    #[serde(default = "min_cleanable_dirty_ratio")]
    min_cleanable_dirty_ratio: f64,
    #[serde(default = "segment_ms")]
    segment_ms: i64,
    #[serde(default = "segment_bytes")]
    segment_bytes: u32,
    #[serde(default = "segment_index_bytes")]
    segment_index_bytes: u32,
    #[serde(default)]
    topics: HashMap<String, TopicOverrides>,
}

/// Per-topic settings. Any field left unset falls back to the value in
/// [`KafkaCache`].
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct TopicOverrides {
    pub cleanup_policy: Option<String>,
    pub max_message_bytes: Option<u32>,
    pub retention_ms: Option<i64>,
    pub retention_bytes: Option<i64>,
    pub delete_retention_ms: Option<i64>,
    pub min_compaction_lag_ms: Option<i64>,
    pub max_compaction_lag_ms: Option<i64>,
    pub min_cleanable_dirty_ratio: Option<f64>,
    pub segment_ms: Option<i64>,
    pub segment_bytes: Option<u32>,
    pub segment_index_bytes: Option<u32>,
}

// implementation
impl Default for KafkaCache {
    fn default() -> Self {
        Self {
            directory: directory(),
            cleanup_policy: cleanup_policy(),
            max_message_bytes: max_message_bytes(),
            retention_ms: retention_ms(),
            retention_bytes: retention_bytes(),
            delete_retention_ms: delete_retention_ms(),
            min_compaction_lag_ms: min_compaction_lag_ms(),
            max_compaction_lag_ms: max_compaction_lag_ms(),
            min_cleanable_dirty_ratio: min_cleanable_dirty_ratio(),
            segment_ms: segment_ms(),
            segment_bytes: segment_bytes(),
            segment_index_bytes: segment_index_bytes(),
            topics: HashMap::new(),
        }
    }
}

impl KafkaCache {
    /// Root directory under which each named cache keeps its files.
    pub fn directory(&self) -> &str {
        &self.directory
    }

    pub fn set_directory(&mut self, directory: impl Into<String>) {
        self.directory = directory.into();
    }

    pub fn cleanup_policy(&self) -> &str {
        &self.cleanup_policy
    }

    pub fn max_message_bytes(&self) -> u32 {
        self.max_message_bytes
    }

    pub fn retention_ms(&self) -> i64 {
        self.retention_ms
    }

    /// A negative value disables size based retention.
    pub fn retention_bytes(&self) -> i64 {
        self.retention_bytes
    }

    pub fn delete_retention_ms(&self) -> i64 {
        self.delete_retention_ms
    }

    pub fn min_compaction_lag_ms(&self) -> i64 {
        self.min_compaction_lag_ms
    }

    pub fn max_compaction_lag_ms(&self) -> i64 {
        self.max_compaction_lag_ms
    }

    pub fn min_cleanable_dirty_ratio(&self) -> f64 {
        self.min_cleanable_dirty_ratio
    }

    pub fn segment_ms(&self) -> i64 {
        self.segment_ms
    }

    pub fn segment_bytes(&self) -> u32 {
        self.segment_bytes
    }

    pub fn set_segment_bytes(&mut self, bytes: u32) {
        self.segment_bytes = bytes;
    }

    pub fn segment_index_bytes(&self) -> u32 {
        self.segment_index_bytes
    }

    pub fn set_segment_index_bytes(&mut self, bytes: u32) {
        self.segment_index_bytes = bytes;
    }

    /// Returns the overrides configured for the named topic, if any.
    pub fn topic(&self, name: &str) -> Option<&TopicOverrides> {
        self.topics.get(name)
    }

    pub fn set_topic(&mut self, name: impl Into<String>, overrides: TopicOverrides) {
        self.topics.insert(name.into(), overrides);
    }
}

// trait definitions
pub trait KafkaCacheConfig {
    fn kafka_cache(&self) -> &KafkaCache;
}

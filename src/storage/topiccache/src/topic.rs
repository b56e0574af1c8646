// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use config::KafkaCache;
use parking_lot::RwLock;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Effective settings for one topic: the process-wide defaults with any
/// per-topic overrides applied. Negative retention values mean unlimited.
#[derive(Clone, Debug, PartialEq)]
pub struct TopicConfig {
    pub cleanup_policy: CleanupPolicy,
    pub max_message_bytes: usize,
    pub retention_ms: i64,
    pub retention_bytes: i64,
    pub delete_retention_ms: i64,
    pub min_compaction_lag_ms: i64,
    pub max_compaction_lag_ms: i64,
    pub min_cleanable_dirty_ratio: f64,
    pub segment_ms: i64,
    pub segment_bytes: usize,
    pub segment_index_bytes: usize,
}

impl TopicConfig {
    pub fn new(defaults: &KafkaCache, topic: &str) -> CacheResult<Self> {
        let overrides = defaults.topic(topic).cloned().unwrap_or_default();

        let policy = overrides
            .cleanup_policy
            .as_deref()
            .unwrap_or(defaults.cleanup_policy());

        let config = Self {
            cleanup_policy: policy.parse().unwrap_or_default(),
            max_message_bytes: overrides
                .max_message_bytes
                .unwrap_or(defaults.max_message_bytes()) as usize,
            retention_ms: overrides.retention_ms.unwrap_or(defaults.retention_ms()),
            retention_bytes: overrides
                .retention_bytes
                .unwrap_or(defaults.retention_bytes()),
            delete_retention_ms: overrides
                .delete_retention_ms
                .unwrap_or(defaults.delete_retention_ms()),
            min_compaction_lag_ms: overrides
                .min_compaction_lag_ms
                .unwrap_or(defaults.min_compaction_lag_ms()),
            max_compaction_lag_ms: overrides
                .max_compaction_lag_ms
                .unwrap_or(defaults.max_compaction_lag_ms()),
            min_cleanable_dirty_ratio: overrides
                .min_cleanable_dirty_ratio
                .unwrap_or(defaults.min_cleanable_dirty_ratio()),
            segment_ms: overrides.segment_ms.unwrap_or(defaults.segment_ms()),
            segment_bytes: overrides.segment_bytes.unwrap_or(defaults.segment_bytes()) as usize,
            segment_index_bytes: overrides
                .segment_index_bytes
                .unwrap_or(defaults.segment_index_bytes()) as usize,
        };

        if config.cleanup_policy == CleanupPolicy::Unknown {
            warn!("topic {topic}: unknown cleanup policy '{policy}', segments are kept");
        }

        config.validate(topic)?;

        Ok(config)
    }

    fn validate(&self, topic: &str) -> CacheResult {
        if self.segment_bytes < HEADER_SIZE {
            return Err(CacheError::Config(format!(
                "topic {topic}: segment_bytes must be at least {HEADER_SIZE}"
            )));
        }
        if self.segment_bytes > i32::MAX as usize {
            return Err(CacheError::Config(format!(
                "topic {topic}: segment_bytes must not exceed {}",
                i32::MAX
            )));
        }
        if self.segment_index_bytes < index::RECORD_SIZE {
            return Err(CacheError::Config(format!(
                "topic {topic}: segment_index_bytes must be at least {}",
                index::RECORD_SIZE
            )));
        }
        if !(0.0..=1.0).contains(&self.min_cleanable_dirty_ratio) {
            return Err(CacheError::Config(format!(
                "topic {topic}: min_cleanable_dirty_ratio must be between 0 and 1"
            )));
        }
        if self.segment_ms <= 0 {
            return Err(CacheError::Config(format!(
                "topic {topic}: segment_ms must be positive"
            )));
        }
        if self.min_compaction_lag_ms < 0 || self.max_compaction_lag_ms < self.min_compaction_lag_ms
        {
            return Err(CacheError::Config(format!(
                "topic {topic}: compaction lag bounds are out of order"
            )));
        }
        Ok(())
    }

    /// Retention time in milliseconds, `i64::MAX` when unlimited.
    pub fn retention_millis(&self) -> i64 {
        if self.retention_ms < 0 {
            i64::MAX
        } else {
            self.retention_ms
        }
    }
}

impl Default for TopicConfig {
    fn default() -> Self {
        // the built in defaults always validate
        Self::new(&KafkaCache::default(), "").unwrap_or(Self {
            cleanup_policy: CleanupPolicy::Delete,
            max_message_bytes: 1000012,
            retention_ms: 604800000,
            retention_bytes: -1,
            delete_retention_ms: 86400000,
            min_compaction_lag_ms: 0,
            max_compaction_lag_ms: i64::MAX,
            min_cleanable_dirty_ratio: 0.5,
            segment_ms: 604800000,
            segment_bytes: 0x40000000,
            segment_index_bytes: 0xA00000,
        })
    }
}

/// All cached partitions of one topic. Partitions are created on first use
/// and live as long as the topic.
pub struct Topic {
    cache: String,
    name: String,
    location: PathBuf,
    config: Arc<TopicConfig>,
    partitions: RwLock<HashMap<u32, Arc<Partition>>>,
}

impl Topic {
    /// Creates the topic under the cache directory `location`.
    pub fn new(cache: &str, name: &str, location: &Path, config: TopicConfig) -> Self {
        info!("[{cache}] {name}: topic cache with {} policy", config.cleanup_policy);
        Self {
            cache: cache.to_string(),
            name: name.to_string(),
            location: location.join(name),
            config: Arc::new(config),
            partitions: RwLock::new(HashMap::new()),
        }
    }

    pub fn cache(&self) -> &str {
        &self.cache
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn config(&self) -> &TopicConfig {
        &self.config
    }

    pub fn partition(&self, id: u32) -> Option<Arc<Partition>> {
        self.partitions.read().get(&id).cloned()
    }

    /// Returns the partition with this id, creating it if needed.
    pub fn supply_partition(&self, id: u32) -> CacheResult<Arc<Partition>> {
        if let Some(partition) = self.partition(id) {
            return Ok(partition);
        }

        let mut partitions = self.partitions.write();
        if let Some(partition) = partitions.get(&id) {
            return Ok(partition.clone());
        }

        let partition = Arc::new(Partition::new(
            &self.location,
            &self.cache,
            &self.name,
            id,
            self.config.clone(),
        )?);
        partitions.insert(id, partition.clone());

        Ok(partition)
    }

    /// Partitions ordered by id.
    pub fn partitions(&self) -> Vec<Arc<Partition>> {
        let mut partitions: Vec<Arc<Partition>> = self.partitions.read().values().cloned().collect();
        partitions.sort_by_key(|p| p.id());
        partitions
    }

    pub fn maintain(&self, now: i64) -> CacheResult<Maintenance> {
        let mut report = Maintenance::default();
        for partition in self.partitions() {
            report += partition.maintain(now)?;
        }
        Ok(report)
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}] {}", self.cache, self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::TopicOverrides;
    use tempfile::TempDir;

    #[test]
    fn default_config() {
        let config = TopicConfig::default();
        assert_eq!(config.cleanup_policy, CleanupPolicy::Delete);
        assert_eq!(config.segment_bytes, 0x40000000);
        assert_eq!(config.segment_index_bytes, 0xA00000);
        assert_eq!(config.max_compaction_lag_ms, i64::MAX);
    }

    #[test]
    fn overrides_apply_per_topic() {
        let mut defaults = KafkaCache::default();
        defaults.set_topic(
            "items",
            TopicOverrides {
                cleanup_policy: Some("compact".into()),
                segment_bytes: Some(65536),
                retention_ms: Some(-1),
                ..Default::default()
            },
        );

        let items = TopicConfig::new(&defaults, "items").expect("invalid config");
        assert_eq!(items.cleanup_policy, CleanupPolicy::Compact);
        assert_eq!(items.segment_bytes, 65536);
        assert_eq!(items.retention_millis(), i64::MAX);
        assert_eq!(items.segment_index_bytes, 0xA00000);

        let other = TopicConfig::new(&defaults, "other").expect("invalid config");
        assert_eq!(other.cleanup_policy, CleanupPolicy::Delete);
        assert_eq!(other.segment_bytes, 0x40000000);
        assert_eq!(other.retention_millis(), 604800000);
    }

    #[test]
    fn rejects_invalid_overrides() {
        let mut defaults = KafkaCache::default();
        defaults.set_topic(
            "tiny",
            TopicOverrides {
                segment_bytes: Some(16),
                ..Default::default()
            },
        );
        defaults.set_topic(
            "ratio",
            TopicOverrides {
                min_cleanable_dirty_ratio: Some(1.5),
                ..Default::default()
            },
        );

        assert!(matches!(
            TopicConfig::new(&defaults, "tiny"),
            Err(CacheError::Config(_))
        ));
        assert!(matches!(
            TopicConfig::new(&defaults, "ratio"),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn partitions_created_once() {
        let tempdir = TempDir::new().expect("failed to generate tempdir");
        let topic = Topic::new("cache", "test", tempdir.path(), TopicConfig::default());

        assert!(topic.partition(0).is_none());
        let a = topic.supply_partition(0).expect("failed to create partition");
        let b = topic.supply_partition(0).expect("failed to create partition");
        topic.supply_partition(3).expect("failed to create partition");

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(
            topic.partitions().iter().map(|p| p.id()).collect::<Vec<_>>(),
            vec![0, 3]
        );
        assert!(tempdir.path().join("test").is_dir());
        assert_eq!(topic.to_string(), "[cache] test");
    }
}

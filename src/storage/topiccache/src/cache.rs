// Copyright 2023 Pelikan Foundation LLC.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

use crate::*;

use config::{KafkaCache, KafkaCacheConfig};
use parking_lot::{Mutex, RwLock};

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// A named cache holding topics under `directory/name`.
pub struct Cache {
    name: String,
    location: PathBuf,
    defaults: KafkaCache,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Cache {
    pub fn new(name: &str, defaults: &KafkaCache) -> Self {
        let location = Path::new(defaults.directory()).join(name);
        info!("[{name}] cache at {}", location.display());

        Self {
            name: name.to_string(),
            location,
            defaults: defaults.clone(),
            topics: RwLock::new(HashMap::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    pub fn topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.read().get(name).cloned()
    }

    /// Returns the topic with this name, creating it with its effective
    /// configuration if needed.
    pub fn supply_topic(&self, name: &str) -> CacheResult<Arc<Topic>> {
        if let Some(topic) = self.topic(name) {
            return Ok(topic);
        }

        let mut topics = self.topics.write();
        if let Some(topic) = topics.get(name) {
            return Ok(topic.clone());
        }

        let config = TopicConfig::new(&self.defaults, name)?;
        let topic = Arc::new(Topic::new(&self.name, name, &self.location, config));
        topics.insert(name.to_string(), topic.clone());

        Ok(topic)
    }

    /// Topics ordered by name.
    pub fn topics(&self) -> Vec<Arc<Topic>> {
        let mut topics: Vec<Arc<Topic>> = self.topics.read().values().cloned().collect();
        topics.sort_by(|a, b| a.name().cmp(b.name()));
        topics
    }

    /// Runs a maintenance pass over every partition of every topic. A failing
    /// partition is logged and does not stop the pass.
    pub fn maintain(&self, now: i64) -> Maintenance {
        let mut report = Maintenance::default();
        for topic in self.topics() {
            match topic.maintain(now) {
                Ok(r) => report += r,
                Err(e) => error!("{} maintenance failed: {}", topic, e),
            }
        }
        report
    }
}

impl core::fmt::Display for Cache {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "[{}]", self.name)
    }
}

/// Registry of caches by name, so that everything naming the same cache
/// shares one instance.
pub struct Caches {
    defaults: KafkaCache,
    caches: Mutex<HashMap<String, Arc<Cache>>>,
}

impl Caches {
    pub fn new<T: KafkaCacheConfig>(config: &T) -> Self {
        Self {
            defaults: config.kafka_cache().clone(),
            caches: Mutex::new(HashMap::new()),
        }
    }

    pub fn supply(&self, name: &str) -> Arc<Cache> {
        self.caches
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Cache::new(name, &self.defaults)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<Cache>> {
        self.caches.lock().get(name).cloned()
    }

    pub fn maintain(&self, now: i64) -> Maintenance {
        let caches: Vec<Arc<Cache>> = self.caches.lock().values().cloned().collect();
        let mut report = Maintenance::default();
        for cache in caches {
            report += cache.maintain(now);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{Config, TopicOverrides};
    use tempfile::TempDir;

    fn defaults(tempdir: &TempDir) -> KafkaCache {
        let mut defaults = KafkaCache::default();
        defaults.set_directory(tempdir.path().to_string_lossy());
        defaults.set_segment_bytes(65536);
        defaults.set_segment_index_bytes(4096);
        defaults
    }

    #[test]
    fn topics_created_once() {
        let tempdir = TempDir::new().expect("failed to generate tempdir");
        let cache = Cache::new("cache", &defaults(&tempdir));

        assert_eq!(cache.location(), tempdir.path().join("cache"));
        assert!(cache.topic("b").is_none());

        let b = cache.supply_topic("b").expect("failed to create topic");
        cache.supply_topic("a").expect("failed to create topic");
        assert!(Arc::ptr_eq(&b, &cache.supply_topic("b").expect("failed to create topic")));

        assert_eq!(
            cache.topics().iter().map(|t| t.name().to_string()).collect::<Vec<_>>(),
            vec!["a", "b"]
        );
        assert_eq!(b.location(), tempdir.path().join("cache").join("b"));
        assert_eq!(b.to_string(), "[cache] b");
    }

    #[test]
    fn invalid_topic_config() {
        let tempdir = TempDir::new().expect("failed to generate tempdir");
        let mut defaults = defaults(&tempdir);
        defaults.set_topic(
            "broken",
            TopicOverrides {
                segment_index_bytes: Some(0),
                ..Default::default()
            },
        );

        let cache = Cache::new("cache", &defaults);
        assert!(cache.supply_topic("broken").is_err());
        assert!(cache.topic("broken").is_none());
    }

    #[test]
    fn registry_shares_caches() {
        let tempdir = TempDir::new().expect("failed to generate tempdir");
        let mut config = Config::default();
        config.kafka_cache = defaults(&tempdir);

        let caches = Caches::new(&config);
        assert!(caches.get("one").is_none());

        let a = caches.supply("one");
        let b = caches.supply("one");
        let c = caches.supply("two");

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(a.to_string(), "[one]");
        assert_eq!(caches.maintain(0), Maintenance::default());
    }
}
